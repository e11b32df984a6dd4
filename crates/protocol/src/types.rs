use serde::{Deserialize, Serialize};

/// Lifecycle state of one file upload.
///
/// `Idle → Hashing → Checking → {Skipped → Completed | Uploading → Merging →
/// Completed}`; `Failed` and `Cancelled` are the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    Hashing,
    Checking,
    /// The service already stores the whole file (instant transfer).
    Skipped,
    Uploading,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    /// Returns `true` for states no transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if a user cancel is still meaningful in this state.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Hashing | Self::Checking | Self::Uploading
        )
    }
}

/// Progress snapshot for one file.
///
/// Every chunk contributes one unit when hashed and one unit when uploaded,
/// so the percentage covers both phases without double counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub file_id: String,
    pub state: UploadState,
    pub total_chunks: usize,
    pub hashed_chunks: usize,
    pub uploaded_chunks: usize,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub bytes_per_second: f64,
    /// Estimated seconds until every chunk is sent; unknown outside uploading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl UploadProgress {
    /// Returns the combined hash + upload progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        let done = (self.hashed_chunks + self.uploaded_chunks) as f64;
        let total = (self.total_chunks * 2) as f64;
        (done / total * 100.0).min(100.0)
    }
}
