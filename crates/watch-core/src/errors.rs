use contracts::StatKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store backing object not found")]
    NotFound,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("broadcast channel closed")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("stat {stat} value {value} is outside {min}..={max}")]
    StatOutOfRange {
        stat: StatKey,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("conflict index {0} is out of range")]
    ConflictOutOfRange(usize),
}
