//! Remote upload service contract.
//!
//! The coordinator only talks to the backend through [`UploadService`], so
//! transports stay swappable and the flow is testable against
//! [`MemoryUploadService`](crate::MemoryUploadService).

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use shardup_protocol::{
    ApiResponse, CheckFileRequest, CheckFileResponse, MergeRequest, MergeResponse,
    UploadChunkRequest, UploadChunkResponse,
};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

/// Boxed future returned by every service call.
pub type ServiceFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<ApiResponse<T>, ServiceError>> + Send + 'a>>;

/// One chunk upload: the request metadata plus the chunk bytes.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub request: UploadChunkRequest,
    pub data: Bytes,
}

/// Abstract connection to the upload backend.
///
/// Calls resolve to the service envelope; a non-zero code is a remote
/// rejection and is handled like a transient failure by the coordinator.
pub trait UploadService: Send + Sync {
    /// Asks whether the file (or some of its chunks) is already stored.
    fn check_file(&self, request: &CheckFileRequest) -> ServiceFuture<'_, CheckFileResponse>;

    /// Sends one chunk. Implementations must stop and return
    /// [`ServiceError::Aborted`] once `cancel` fires.
    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        cancel: CancellationToken,
    ) -> ServiceFuture<'_, UploadChunkResponse>;

    /// Assembles the stored chunks into the final file.
    fn merge_chunks(&self, request: &MergeRequest) -> ServiceFuture<'_, MergeResponse>;
}
