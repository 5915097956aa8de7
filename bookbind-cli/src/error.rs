use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Assembly(#[from] bookbind_engine::AssemblyError),

    #[error("Invalid job file {}: {reason}", path.display())]
    JobFile { path: PathBuf, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job failed ({unprocessed} items unprocessed): {error}")]
    JobFailed { error: String, unprocessed: usize },
}

pub type Result<T> = std::result::Result<T, AppError>;
