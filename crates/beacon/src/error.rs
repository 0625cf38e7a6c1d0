use thiserror::Error;

/// Result type for beacon operations
pub type BeaconResult<T> = Result<T, BeaconError>;

/// Errors that can occur while operating the beacon broadcaster
#[derive(Error, Debug)]
pub enum BeaconError {
    /// The outward-broadcast capability is missing or switched off. The
    /// beacon stays off; nothing else in the application is affected.
    #[error("beacon unavailable: {0}")]
    Unavailable(String),

    #[error("adapter error: {0}")]
    Adapter(String),
}
