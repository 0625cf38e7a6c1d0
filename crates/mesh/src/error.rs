use thiserror::Error;

/// Result type for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors that can occur during peer-session operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// The identity store could not be read or written. Fatal at startup:
    /// without a stable identity, session behavior is undefined.
    #[error("identity store unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("image codec error: {0}")]
    Codec(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("invitation failed: {0}")]
    InviteFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}
