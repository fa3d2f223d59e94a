use thiserror::Error;

#[derive(Error, Debug)]
pub enum WattBenchError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, WattBenchError>;
