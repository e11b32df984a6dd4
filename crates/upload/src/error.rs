//! Upload error types.

/// Failure reported by an [`UploadService`](crate::UploadService) call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Connectivity or server hiccup; worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The call observed its cancellation token and stopped.
    #[error("aborted")]
    Aborted,
}

/// Errors produced while uploading a file.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Local chunking, reading or hashing failed. Never retried.
    #[error("transfer error: {0}")]
    Transfer(#[from] shardup_transfer::TransferError),

    #[error("precheck failed after {attempts} attempt(s): {reason}")]
    CheckFailed { attempts: u32, reason: String },

    #[error("chunk {index} failed after {attempts} attempt(s): {reason}")]
    ChunkFailed {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("merge failed after {attempts} attempt(s): {reason}")]
    MergeFailed { attempts: u32, reason: String },

    #[error("upload already active: {0}")]
    AlreadyActive(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    /// Returns `true` for a user cancellation, which is not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
