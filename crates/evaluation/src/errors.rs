use thiserror::Error;

pub type Result<T> = std::result::Result<T, EvalError>;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("report error: {0}")]
    Report(#[from] report::ReportError),

    #[error("logging failed: {0}")]
    Logging(String),
}

impl EvalError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging(message.into())
    }
}

impl From<toml::de::Error> for EvalError {
    fn from(value: toml::de::Error) -> Self {
        EvalError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(value: serde_json::Error) -> Self {
        EvalError::ConfigFormat(value.to_string())
    }
}
