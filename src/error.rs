//! Process-level errors.
//!
//! Anything here is fatal to startup or shutdown; request-level
//! failures are mapped to HTTP statuses in `http` instead.

use thiserror::Error;

use crate::cache::StoreError;
use crate::config::LoadError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to build upstream client: {0}")]
    UpstreamClient(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
