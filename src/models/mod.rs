//! Core data models for the media storage service.
//!
//! `Media` and `User` map to database tables via `sqlx::FromRow`; the other
//! types are transient values exchanged with providers and health probes.
//! Everything serializes as JSON via `serde`.

pub mod file_object;
pub mod health;
pub mod media;
pub mod provider_kind;
pub mod user;

pub use file_object::{AccessControl, FileObject, UploadOptions};
pub use health::{HealthReport, HealthState, HealthStatus};
pub use media::{Media, MediaType};
pub use provider_kind::ProviderKind;
pub use user::{QuotaError, User};
