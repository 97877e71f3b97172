use thiserror::Error;

#[derive(Debug, Error)]
pub enum GroupMailError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(
        "Saved progress does not match the current job list \
         ({saved} saved jobs vs {current} current). Run with --restart to discard it."
    )]
    StaleProgress { saved: usize, current: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GroupMailError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }
}
