//! In-memory upload service with scripted faults.
//!
//! Behaves like the real backend (dedup, resume lists, merge URLs) and lets
//! callers script failures per chunk and per attempt. Used by the demo
//! binary and by the coordinator tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shardup_protocol::{
    ApiResponse, CODE_REJECTED, CheckFileRequest, CheckFileResponse, MergeRequest, MergeResponse,
    UploadChunkResponse,
};
use shardup_transfer::checksum_bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ServiceError;
use crate::service::{ChunkUpload, ServiceFuture, UploadService};

/// Envelope code for a chunk whose bytes do not match its digest.
pub const CODE_HASH_MISMATCH: i32 = 2;

/// Scripted outcome of one service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The call fails with [`ServiceError::Network`].
    Network,
    /// The call returns a non-zero envelope code.
    Reject,
    /// The call succeeds.
    Ok,
}

/// Per-call failure script.
///
/// Faults are consumed by attempt number: the first listed fault applies to
/// the first call, and so on. Calls past the end of a script succeed unless
/// the target is marked as always failing.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    chunks: HashMap<usize, Vec<Fault>>,
    always_failing: HashSet<usize>,
    delays: HashMap<usize, Duration>,
    check: Vec<Fault>,
    merge: Vec<Fault>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the attempts of the chunk at `index`.
    pub fn chunk(mut self, index: usize, faults: impl IntoIterator<Item = Fault>) -> Self {
        self.chunks.insert(index, faults.into_iter().collect());
        self
    }

    /// Makes every attempt of the chunk at `index` fail with a network error.
    pub fn always_fail(mut self, index: usize) -> Self {
        self.always_failing.insert(index);
        self
    }

    /// Overrides the service latency for the chunk at `index`.
    pub fn chunk_delay(mut self, index: usize, delay: Duration) -> Self {
        self.delays.insert(index, delay);
        self
    }

    pub fn check(mut self, faults: impl IntoIterator<Item = Fault>) -> Self {
        self.check = faults.into_iter().collect();
        self
    }

    pub fn merge(mut self, faults: impl IntoIterator<Item = Fault>) -> Self {
        self.merge = faults.into_iter().collect();
        self
    }

    fn chunk_fault(&self, index: usize, attempt: usize) -> Fault {
        if self.always_failing.contains(&index) {
            return Fault::Network;
        }
        self.chunks
            .get(&index)
            .and_then(|faults| scripted(faults, attempt))
            .unwrap_or(Fault::Ok)
    }
}

fn scripted(faults: &[Fault], attempt: usize) -> Option<Fault> {
    attempt.checked_sub(1).and_then(|i| faults.get(i)).copied()
}

/// Stored state of the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Chunk hashes held per file hash.
    pub uploaded_chunks: BTreeMap<String, BTreeSet<String>>,
    /// Merged file hash to URL.
    pub uploaded_files: BTreeMap<String, String>,
}

#[derive(Default)]
struct Store {
    snapshot: StoreSnapshot,
    chunk_attempts: HashMap<(String, usize), usize>,
    check_attempts: HashMap<String, usize>,
    merge_attempts: HashMap<String, usize>,
    received: Vec<usize>,
}

#[derive(Default)]
struct Stats {
    check_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    stored_uploads: AtomicUsize,
    aborted_uploads: AtomicUsize,
    merge_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a Stats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a Stats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Upload service that keeps everything in memory.
pub struct MemoryUploadService {
    store: Mutex<Store>,
    faults: FaultPlan,
    latency: Duration,
    stats: Stats,
}

impl Default for MemoryUploadService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUploadService {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            faults: FaultPlan::default(),
            latency: Duration::ZERO,
            stats: Stats::default(),
        }
    }

    /// Sets how long each chunk upload takes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pretends the given chunks were stored by an earlier run.
    pub fn seed_chunks(&self, file_hash: &str, chunk_hashes: impl IntoIterator<Item = String>) {
        self.lock()
            .snapshot
            .uploaded_chunks
            .entry(file_hash.to_string())
            .or_default()
            .extend(chunk_hashes);
    }

    /// Pretends the whole file was merged by an earlier run.
    pub fn seed_file(&self, file_hash: &str, file_name: &str) {
        self.lock()
            .snapshot
            .uploaded_files
            .insert(file_hash.to_string(), file_url(file_name));
    }

    /// Drops all stored chunks and files.
    pub fn clear(&self) {
        *self.lock() = Store::default();
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock().snapshot.clone()
    }

    /// Chunk indexes stored, in arrival order.
    pub fn received_indexes(&self) -> Vec<usize> {
        self.lock().received.clone()
    }

    pub fn check_calls(&self) -> usize {
        self.stats.check_calls.load(Ordering::SeqCst)
    }

    /// Chunk upload calls started, retries included.
    pub fn upload_calls(&self) -> usize {
        self.stats.upload_calls.load(Ordering::SeqCst)
    }

    /// Chunk uploads that completed and stored data.
    pub fn stored_uploads(&self) -> usize {
        self.stats.stored_uploads.load(Ordering::SeqCst)
    }

    /// Chunk uploads interrupted by their cancellation token.
    pub fn aborted_uploads(&self) -> usize {
        self.stats.aborted_uploads.load(Ordering::SeqCst)
    }

    pub fn merge_calls(&self) -> usize {
        self.stats.merge_calls.load(Ordering::SeqCst)
    }

    /// Highest number of chunk uploads observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }
}

fn file_url(file_name: &str) -> String {
    format!("/uploads/{file_name}")
}

impl UploadService for MemoryUploadService {
    fn check_file(&self, request: &CheckFileRequest) -> ServiceFuture<'_, CheckFileResponse> {
        let request = request.clone();
        Box::pin(async move {
            self.stats.check_calls.fetch_add(1, Ordering::SeqCst);
            let mut store = self.lock();
            let attempt = bump(&mut store.check_attempts, request.file_hash.clone());
            match scripted(&self.faults.check, attempt) {
                Some(Fault::Network) => {
                    return Err(ServiceError::Network("check: connection reset".into()));
                }
                Some(Fault::Reject) => return Ok(ApiResponse::error(CODE_REJECTED, "check rejected")),
                _ => {}
            }

            if let Some(url) = store.snapshot.uploaded_files.get(&request.file_hash) {
                return Ok(ApiResponse::ok(CheckFileResponse {
                    should_upload: false,
                    uploaded_list: Vec::new(),
                    url: Some(url.clone()),
                }));
            }
            let uploaded_list = store
                .snapshot
                .uploaded_chunks
                .get(&request.file_hash)
                .map(|chunks| chunks.iter().cloned().collect())
                .unwrap_or_default();
            Ok(ApiResponse::ok(CheckFileResponse {
                should_upload: true,
                uploaded_list,
                url: None,
            }))
        })
    }

    fn upload_chunk(
        &self,
        chunk: ChunkUpload,
        cancel: CancellationToken,
    ) -> ServiceFuture<'_, UploadChunkResponse> {
        Box::pin(async move {
            self.stats.upload_calls.fetch_add(1, Ordering::SeqCst);
            let _in_flight = InFlight::enter(&self.stats);
            let request = chunk.request;
            let index = request.index;

            let attempt = bump(
                &mut self.lock().chunk_attempts,
                (request.file_hash.clone(), index),
            );
            let fault = self.faults.chunk_fault(index, attempt);
            let delay = self.faults.delays.get(&index).copied().unwrap_or(self.latency);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stats.aborted_uploads.fetch_add(1, Ordering::SeqCst);
                    debug!(index, attempt, "chunk upload aborted");
                    return Err(ServiceError::Aborted);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match fault {
                Fault::Network => {
                    return Err(ServiceError::Network(format!(
                        "chunk {index}: connection reset"
                    )));
                }
                Fault::Reject => return Ok(ApiResponse::error(CODE_REJECTED, "chunk rejected")),
                Fault::Ok => {}
            }

            if checksum_bytes(&chunk.data) != request.chunk_hash {
                return Ok(ApiResponse::error(CODE_HASH_MISMATCH, "chunk hash mismatch"));
            }

            let mut store = self.lock();
            store
                .snapshot
                .uploaded_chunks
                .entry(request.file_hash.clone())
                .or_default()
                .insert(request.chunk_hash.clone());
            store.received.push(index);
            self.stats.stored_uploads.fetch_add(1, Ordering::SeqCst);
            Ok(ApiResponse::ok(UploadChunkResponse {
                uploaded: true,
                chunk_hash: request.chunk_hash,
            }))
        })
    }

    fn merge_chunks(&self, request: &MergeRequest) -> ServiceFuture<'_, MergeResponse> {
        let request = request.clone();
        Box::pin(async move {
            self.stats.merge_calls.fetch_add(1, Ordering::SeqCst);
            let mut store = self.lock();
            let attempt = bump(&mut store.merge_attempts, request.file_hash.clone());
            match scripted(&self.faults.merge, attempt) {
                Some(Fault::Network) => {
                    return Err(ServiceError::Network("merge: connection reset".into()));
                }
                Some(Fault::Reject) => return Ok(ApiResponse::error(CODE_REJECTED, "merge rejected")),
                _ => {}
            }

            let url = file_url(&request.file_name);
            store
                .snapshot
                .uploaded_files
                .insert(request.file_hash.clone(), url.clone());
            debug!(file_hash = %request.file_hash, %url, "file merged");
            Ok(ApiResponse::ok(MergeResponse { merged: true, url }))
        })
    }
}

fn bump<K: std::hash::Hash + Eq>(attempts: &mut HashMap<K, usize>, key: K) -> usize {
    let count = attempts.entry(key).or_insert(0);
    *count += 1;
    *count
}
