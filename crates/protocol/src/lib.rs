//! Wire types shared by the upload engine and the remote upload service.

pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use envelope::{ApiResponse, CODE_OK, CODE_REJECTED};
pub use messages::{
    CheckFileRequest, CheckFileResponse, MergeRequest, MergeResponse, UploadChunkRequest,
    UploadChunkResponse,
};
pub use types::{UploadProgress, UploadState};
