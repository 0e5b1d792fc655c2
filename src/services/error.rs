//! Errors surfaced by the service layer.

use crate::{
    models::QuotaError,
    providers::ProviderError,
    repositories::RepositoryError,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    QuotaExceeded(#[from] QuotaError),

    #[error("storage provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(_) => ServiceError::NotFound(err.to_string()),
            ProviderError::InvalidKey { .. }
            | ProviderError::SizeMismatch { .. }
            | ProviderError::InvalidRequest(_) => ServiceError::Validation(err.to_string()),
            ProviderError::Unavailable(_) => ServiceError::ProviderUnavailable(err.to_string()),
            ProviderError::Configuration(_) => ServiceError::Configuration(err.to_string()),
            ProviderError::Operation { .. } | ProviderError::Io { .. } => {
                ServiceError::Internal(err.to_string())
            }
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => ServiceError::NotFound(format!("{what} not found")),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// Pipeline stage an upload failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStage {
    Validation,
    Quota,
    Backend,
    Metadata,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadStage::Validation => "validation",
            UploadStage::Quota => "quota",
            UploadStage::Backend => "backend",
            UploadStage::Metadata => "metadata",
        })
    }
}

#[derive(Debug, Error)]
#[error("upload failed at {stage} stage: {error}")]
pub struct UploadError {
    pub stage: UploadStage,
    #[source]
    pub error: ServiceError,
}

impl UploadError {
    pub fn new(stage: UploadStage, error: impl Into<ServiceError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}
