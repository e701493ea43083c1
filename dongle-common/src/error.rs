use thiserror::Error;

/// Common error type for dongle components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot find configuration file: {file}")]
    ConfigMissing { file: String },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Cannot install log subscriber: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ini::ParseError> for Error {
    fn from(e: ini::ParseError) -> Self {
        Error::ConfigInvalid(e.to_string())
    }
}

/// Result type alias using the dongle Error.
pub type Result<T> = std::result::Result<T, Error>;
