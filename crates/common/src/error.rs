// Error types for App Proxy

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration not found: {0}")]
    NotFound(i64),

    #[error("No configuration is selected")]
    NoSelectedConfiguration,

    #[error("Tunnel permission denied")]
    PermissionDenied,

    #[error("Tunnel interface unavailable")]
    InterfaceUnavailable,

    #[error("Engine start failed: {0}")]
    EngineStart(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
