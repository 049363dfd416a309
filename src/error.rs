use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage operation timed out: {0}")]
    Timeout(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Priority table error: {0}")]
    PriorityTable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
