use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{CredentialId, UnavailableReason};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Operational(OperationalEvent),
    Credential(CredentialEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    UnavailableStart(UnavailableStartEvent),
    UnavailableEnd(UnavailableEndEvent),
    ModelUnavailableStart(ModelUnavailableStartEvent),
    ModelUnavailableEnd(ModelUnavailableEndEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableStartEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub reason: UnavailableReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableEndEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUnavailableStartEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub model: String,
    pub reason: UnavailableReason,
    pub until: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUnavailableEndEvent {
    pub at: SystemTime,
    pub credential_id: CredentialId,
    pub model: String,
}

/// Credential Manager lifecycle events (spec §4.B), surfaced for
/// observability the same way `OperationalEvent` surfaces pool state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CredentialEvent {
    TokenRefreshed { at: SystemTime, credential_id: CredentialId },
    RefreshFailed { at: SystemTime, credential_id: CredentialId, error: String },
}
