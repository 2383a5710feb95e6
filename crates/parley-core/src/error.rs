use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Responder error: {0}")]
    Responder(String),

    #[error("Avatar error: {0}")]
    Avatar(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParleyError>;
