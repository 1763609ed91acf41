use thiserror::Error;

#[derive(Debug, Error)]
pub enum RatelabError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    #[error("rate limit policy registered twice: {0}")]
    DuplicatePolicy(String),

    #[error("invalid rate limit policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type RatelabResult<T> = Result<T, RatelabError>;
