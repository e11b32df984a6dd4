//! Data types for the upload flow.

use shardup_protocol::{CheckFileResponse, UploadProgress, UploadState};

/// Answer of the dedup/resume precheck.
pub type PrecheckResult = CheckFileResponse;

/// Event emitted by the coordinator while files upload.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// A file moved to a new lifecycle state.
    StateChanged { file_id: String, state: UploadState },
    /// Progress update.
    Progress(UploadProgress),
    /// A chunk attempt failed and will be retried.
    ChunkRetry {
        file_id: String,
        index: usize,
        attempt: u32,
        error: String,
    },
    /// The file is stored remotely.
    Completed {
        file_id: String,
        url: Option<String>,
        instant: bool,
    },
    /// The upload failed.
    Failed { file_id: String, error: String },
    /// The upload was cancelled by the caller.
    Cancelled { file_id: String },
}

impl UploadEvent {
    /// Returns the id of the file the event belongs to.
    pub fn file_id(&self) -> &str {
        match self {
            Self::StateChanged { file_id, .. }
            | Self::ChunkRetry { file_id, .. }
            | Self::Completed { file_id, .. }
            | Self::Failed { file_id, .. }
            | Self::Cancelled { file_id } => file_id,
            Self::Progress(progress) => &progress.file_id,
        }
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub file_id: String,
    pub file_hash: String,
    /// Where the service stores the file, when it reports one.
    pub url: Option<String>,
    /// `true` when the service already had the file and nothing was sent.
    pub instant: bool,
    /// Chunks sent during this run.
    pub uploaded_chunks: usize,
    /// Chunks the service already held from an earlier run.
    pub resumed_chunks: usize,
}
