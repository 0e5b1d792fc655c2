//! Business logic layered over the providers and repositories.

pub mod cleanup;
pub mod error;
pub mod health_service;
pub mod media_service;
pub mod quota;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use cleanup::OrphanCleanup;
pub use error::ServiceError;
pub use health_service::HealthService;
pub use media_service::{MediaService, UploadRequest, UploadSettings};
pub use registry::{ProviderConfig, ProviderRegistry};
