use encore_flightparser::ParseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was configured after it started.
    #[error("stream already started")]
    AlreadyStarted,

    #[error("stream closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}
