use rendezvous_services::StoreError;
use thiserror::Error;

/// Failure talking to the signaling endpoint. Loops log these and carry on.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned {status}: {error}")]
    Status {
        status: u16,
        error: String,
        code: Option<String>,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl TransportError {
    /// Machine-readable code from the server's error body, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Status { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Failure of a single pairwise call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Peer {0} is unavailable")]
    PeerUnavailable(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Call rejected by remote peer")]
    Rejected,
    #[error("No local media stream to answer with")]
    NoLocalStream,
    #[error("Peer endpoint is not open")]
    NotOpen,
}

/// Failure to acquire local camera or microphone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Device busy: {0}")]
    DeviceBusy(String),
    #[error("No such device: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Already joined a meeting")]
    AlreadyJoined,
    #[error("Not joined to a meeting")]
    NotJoined,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Media(#[from] MediaError),
}
