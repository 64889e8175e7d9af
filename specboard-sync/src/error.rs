//! Engine-wide error type.
//!
//! Every fallible operation on the sync boundary returns [`SyncError`]. The
//! enum is serializable so that a remote caller receives exactly the variant
//! the server produced, together with an HTTP-style status code.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SyncError {
    /// Stream dropped, socket failure, timeout.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No conflict, document or warning with the given key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A `merge` resolution was requested but the merge left conflicting regions.
    #[error("Merge incomplete: {0} conflicting region(s) need manual resolution")]
    MergeIncomplete(usize),

    /// Backing store failure. The operation left state unchanged and may be retried.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Status code reported at the external boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            SyncError::InvalidRequest(_) | SyncError::Protocol(_) => 400,
            SyncError::Unauthorized => 401,
            SyncError::NotFound(_) => 404,
            SyncError::MergeIncomplete(_) => 409,
            SyncError::Transport(_) | SyncError::Store(_) => 500,
        }
    }

    /// Whether retrying the same call may succeed without any other change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Store(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed => SyncError::Transport(e.to_string()),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) => match response.status().as_u16() {
                401 => SyncError::Unauthorized,
                404 => SyncError::NotFound(format!("endpoint rejected handshake: {}", response.status())),
                400 => SyncError::InvalidRequest(format!("handshake rejected: {}", response.status())),
                _ => SyncError::Transport(format!("handshake rejected: {}", response.status())),
            },
            other => SyncError::Transport(other.to_string()),
        }
    }
}
