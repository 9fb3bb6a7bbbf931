pub mod inbound;
pub mod outbound_claude;
pub mod outbound_openai;
pub mod toolcall;

pub use inbound::{claude_to_canonical, openai_to_canonical};
