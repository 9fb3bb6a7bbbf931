pub mod canonical;
pub mod claude;
pub mod openai;
pub mod sse;

pub use canonical::{
    CanonicalContentPart, CanonicalMessage, CanonicalRequest, CanonicalRole, CanonicalStreamEvent,
    CanonicalToolCall, CanonicalUsage, ToolSpec,
};
