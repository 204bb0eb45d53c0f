use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Affinity not found: {0}")]
    AffinityNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(u32),

    #[error("{field} is too long: {actual} bytes while only {limit} bytes are allowed")]
    DataTooLong {
        field: &'static str,
        actual: usize,
        limit: usize,
    },

    #[error("Invalid value for '{field}': {message}")]
    InvalidParameter { field: &'static str, message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Dump I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dump format error: {0}")]
    DumpFormat(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
