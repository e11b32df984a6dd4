use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks the service whether a file (or some of its chunks) is already stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFileRequest {
    pub file_hash: String,
    pub file_name: String,
}

/// Metadata sent with one chunk upload.
///
/// The chunk bytes travel next to this header (multipart body in the HTTP
/// transport), so they are not part of the serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub file_hash: String,
    pub chunk_hash: String,
    pub index: usize,
    pub file_name: String,
}

/// Requests server-side reassembly of all chunks of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: String,
    pub file_name: String,
    pub chunk_size: u64,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Result of a precheck.
///
/// `should_upload == false` means the whole file is already stored
/// (instant transfer). Otherwise `uploaded_list` holds the chunk hashes the
/// service already has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFileResponse {
    pub should_upload: bool,
    #[serde(default)]
    pub uploaded_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Acknowledges one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub uploaded: bool,
    pub chunk_hash: String,
}

/// Result of a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub merged: bool,
    #[serde(default)]
    pub url: String,
}
