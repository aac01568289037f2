use thiserror::Error;

#[derive(Error, Debug)]
pub enum S3ffsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} for {resource}")]
    Status { status: u16, resource: String },

    #[error("Request not dispatched: {0}")]
    Dispatch(String),

    #[error("Malformed listing document: {0}")]
    Xml(String),

    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("Inode {0} is not a directory")]
    NotDirectory(u64),

    #[error("Inode {0} is not a regular file")]
    NotFile(u64),

    #[error("Unknown or read-only file handle {0}")]
    BadHandle(u64),

    #[error("Directory {0} is already being updated")]
    Busy(String),

    #[error("Directory listing failed for {0}")]
    ListingFailed(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, S3ffsError>;
