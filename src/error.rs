use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Timed out waiting for row lock on {key}")]
    LockTimeout { key: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Lock contention is expected when several detectors race on one row.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, WatchError::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
