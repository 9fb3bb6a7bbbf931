//! Upstream credential lifecycle: pool availability tracking, token
//! refresh, OAuth acquisition, and pool selection (spec §4.B/§4.C/§4.G).

pub mod credential;
pub mod errors;
pub mod events;
pub mod headers;
pub mod manager;
pub mod oauth;
pub mod selector;

pub use credential::{
    AcquireError, AuthMethod, CredentialId, CredentialPool, CredentialState, UnavailableReason,
    UpstreamCredentials,
};
pub use errors::{CredentialError, OAuthError};
pub use events::{
    CredentialEvent, Event, EventHub, EventSink, ModelUnavailableEndEvent,
    ModelUnavailableStartEvent, OperationalEvent, TerminalEventSink, UnavailableEndEvent,
    UnavailableStartEvent,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use manager::CredentialManager;
pub use oauth::{OAuthDriver, OAuthStartResult};
pub use selector::{PoolSelector, SelectorError};
