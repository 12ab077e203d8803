// Error types surfaced by the pty host service
//
// Direct operations on a session fail with `NotFound` when the id has already
// exited; bulk operations (layout expansion, revived id lookup) swallow it.

use super::protocol::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyHostError {
    #[error("Could not find pty {0} on pty host")]
    NotFound(SessionId),

    #[error("Attempt to create a process when attach object was provided")]
    AttachOnCreate,

    #[error("Request {request_id} timed out")]
    RequestTimedOut { request_id: u64 },

    #[error("{0}")]
    FreePort(String),

    #[error("Invalid terminal state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PtyHostError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, PtyHostError>;
