//! Chunked, resumable, deduplicated file uploads.
//!
//! This crate implements the **business logic** of the upload engine. It has
//! no transport dependencies: the backend is reached through the
//! [`UploadService`] trait, with [`MemoryUploadService`] as an in-process
//! implementation.
//!
//! # Pipeline
//!
//! 1. **Hash**: digest the file and every chunk on a blocking worker
//! 2. **Precheck**: ask the service what it already stores
//! 3. **Upload**: send the missing chunks through the shared limiter, with retry
//! 4. **Merge**: have the service assemble the file

pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
mod retry;
pub mod service;
pub mod session;
pub mod types;

// Re-export primary types for convenience.
pub use config::{RetryPolicy, UploadConfig};
pub use coordinator::UploadCoordinator;
pub use error::{ServiceError, UploadError};
pub use memory::{Fault, FaultPlan, MemoryUploadService, StoreSnapshot};
pub use service::{ChunkUpload, ServiceFuture, UploadService};
pub use session::UploadSession;
pub use types::{PrecheckResult, UploadEvent, UploadOutcome};
