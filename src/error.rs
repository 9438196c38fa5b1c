use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrasaError>;

#[derive(Debug, Error)]
pub enum BrasaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}
