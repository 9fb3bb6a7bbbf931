//! Upstream Client for the Kiro/CodeWhisperer backend (spec §4.D, §4.E,
//! §4.F): builds the wire request, decodes the event stream, and retries
//! per the refresh/backoff policy. Consumes and produces only
//! `kiro-protocol`'s canonical types — dialect encoding happens upstream of
//! this crate, in `kiro-router`.

mod client;
mod error;
mod eventstream;
mod model;
mod request;

pub use client::{CanonicalEventStream, CredentialRefresher, KiroUpstreamClient, UpstreamCallResult, UpstreamClientConfig};
pub use error::UpstreamError;
pub use eventstream::EventStreamCodec;
pub use model::{SUPPORTED_MODELS, is_supported, upstream_model_id};
pub use request::{build_conversation_state, chat_endpoint, usage_endpoint};
