use thiserror::Error;

#[derive(Debug, Error)]
pub enum OdmError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Cursor boundary: {0}")]
    CursorBoundary(String),

    #[error("Cursor not found: {0}")]
    CursorNotFound(u64),

    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("runtime is shut down")]
    Shutdown,
}

impl OdmError {
    /// Local backpressure, distinct from a transport failure.
    #[must_use]
    pub fn is_submission_rejection(&self) -> bool {
        matches!(self, Self::SubmissionRejected(_))
    }
}

impl From<std::io::Error> for OdmError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
