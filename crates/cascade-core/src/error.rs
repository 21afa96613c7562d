use thiserror::Error;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("Config error: {0}")]
    Config(String),

    /// A frame or payload that does not match the envelope contract.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The stage could not claim its listening address.
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CascadeError>;
