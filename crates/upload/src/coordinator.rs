//! Upload coordinator: drives files through hash, precheck, chunk upload and
//! merge.
//!
//! Every chunk attempt of every file goes through one shared
//! [`ConcurrencyLimiter`], grouped by file id, so a cancel drops the file's
//! queued attempts in one call. A chunk that exhausts its retries fails the
//! whole file and aborts its sibling uploads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use shardup_limiter::{ConcurrencyLimiter, LimiterError, TaskHandle};
use shardup_protocol::{
    CheckFileRequest, MergeRequest, UploadChunkRequest, UploadProgress, UploadState,
};
use shardup_transfer::{
    Chunk, FileSource, HashRequest, HashedChunk, HashedFile, chunk_count, spawn_hasher,
    validate_file_name,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{RetryPolicy, UploadConfig};
use crate::error::UploadError;
use crate::retry::{AttemptError, RetryError, with_retry};
use crate::service::{ChunkUpload, UploadService};
use crate::session::UploadSession;
use crate::types::{PrecheckResult, UploadEvent, UploadOutcome};

/// Coordinates uploads of any number of files against one service.
pub struct UploadCoordinator<S> {
    service: Arc<S>,
    limiter: ConcurrencyLimiter,
    config: UploadConfig,
    sessions: Mutex<HashMap<String, Arc<UploadSession>>>,
    emitter: Emitter,
    events_rx: Mutex<Option<mpsc::Receiver<UploadEvent>>>,
}

impl<S: UploadService + 'static> UploadCoordinator<S> {
    /// Creates a coordinator with its own limiter sized from `config`.
    pub fn new(service: Arc<S>, config: UploadConfig) -> Self {
        let limiter = ConcurrencyLimiter::new(config.max_concurrent);
        Self::with_limiter(service, limiter, config)
    }

    /// Creates a coordinator that shares an existing limiter.
    pub fn with_limiter(service: Arc<S>, limiter: ConcurrencyLimiter, config: UploadConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            service,
            limiter,
            config,
            sessions: Mutex::new(HashMap::new()),
            emitter: Emitter::new(events_tx),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Events are only produced after this call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<UploadEvent>> {
        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if rx.is_some() {
            self.emitter.listening.store(true, Ordering::Release);
        }
        rx
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<UploadSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the session of a file, active or finished.
    pub fn session(&self, file_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions().get(file_id).cloned()
    }

    /// Returns a progress snapshot for a file.
    pub fn progress(&self, file_id: &str) -> Option<UploadProgress> {
        self.session(file_id).map(|s| s.progress())
    }

    /// Drops a finished session. Active sessions are kept.
    pub fn forget(&self, file_id: &str) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(file_id) {
            Some(session) if !session.is_active() => {
                sessions.remove(file_id);
                true
            }
            _ => false,
        }
    }

    /// Cancels a file: aborts its in-flight chunk uploads and drops its
    /// queued ones. Returns `false` for unknown files and for files past the
    /// point where cancelling is possible (merging or finished).
    pub fn cancel(&self, file_id: &str) -> bool {
        let Some(session) = self.session(file_id) else {
            debug!(file_id, "cancel for unknown file");
            return false;
        };
        if !session.request_cancel() {
            debug!(file_id, state = ?session.state(), "cancel ignored");
            return false;
        }
        let dropped = self.limiter.cancel_group(file_id);
        info!(file_id, dropped, "upload cancel requested");
        true
    }

    /// Asks the service whether a file (or part of it) is already stored.
    pub async fn precheck(
        &self,
        file_hash: &str,
        file_name: &str,
    ) -> Result<PrecheckResult, UploadError> {
        self.check(file_hash, file_name, &CancellationToken::new())
            .await
    }

    /// Uploads one file and waits for the outcome.
    ///
    /// `file_id` identifies the upload for progress, cancellation and
    /// events; `file_name` is what the service stores the file as.
    pub async fn upload(
        &self,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        source: FileSource,
    ) -> Result<UploadOutcome, UploadError> {
        let file_id = file_id.into();
        let file_name = file_name.into();
        validate_file_name(&file_name)?;
        let total_chunks = chunk_count(source.len(), self.config.chunk_size)?;

        let session = self.register(&file_id, &file_name, total_chunks, source.len())?;
        info!(
            file_id,
            file_name,
            size = source.len(),
            chunks = total_chunks,
            "upload started"
        );

        let _abandon = AbandonGuard {
            session: &session,
            limiter: &self.limiter,
            emitter: &self.emitter,
        };
        let result = self.run(&session, &source).await;
        self.finish(&session, result).await
    }

    fn register(
        &self,
        file_id: &str,
        file_name: &str,
        total_chunks: usize,
        total_bytes: u64,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let mut sessions = self.sessions();
        if sessions.get(file_id).is_some_and(|s| s.is_active()) {
            return Err(UploadError::AlreadyActive(file_id.to_string()));
        }
        let session = Arc::new(UploadSession::new(
            file_id,
            file_name,
            total_chunks,
            total_bytes,
        ));
        sessions.insert(file_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    async fn run(
        &self,
        session: &Arc<UploadSession>,
        source: &FileSource,
    ) -> Result<UploadOutcome, UploadError> {
        let file_id = session.file_id();
        let file_name = session.file_name();
        let cancel = session.cancel_token();

        // 1. Hash
        self.enter(session, UploadState::Hashing).await?;
        let HashedFile { file_hash, chunks } = self.hash(session, source, &cancel).await?;
        session.set_file_hash(&file_hash);

        // 2. Precheck
        self.enter(session, UploadState::Checking).await?;
        let check = self.check(&file_hash, &file_name, &cancel).await?;
        if !check.should_upload {
            self.enter(session, UploadState::Skipped).await?;
            session.record_all_uploaded();
            self.emitter.progress(session);
            return Ok(UploadOutcome {
                file_id,
                file_hash,
                url: check.url,
                instant: true,
                uploaded_chunks: 0,
                resumed_chunks: 0,
            });
        }

        let stored: HashSet<&str> = check.uploaded_list.iter().map(String::as_str).collect();
        let (resumed, missing): (Vec<HashedChunk>, Vec<HashedChunk>) = chunks
            .into_iter()
            .partition(|c| stored.contains(c.chunk_hash.as_str()));
        if !resumed.is_empty() {
            let bytes = resumed.iter().map(|c| c.chunk.size).sum();
            session.record_resumed(resumed.len(), bytes);
            info!(file_id, resumed = resumed.len(), "resuming upload");
            self.emitter.progress(session);
        }

        // 3. Upload missing chunks
        self.enter(session, UploadState::Uploading).await?;
        let uploaded_chunks = missing.len();
        self.upload_chunks(session, source, &file_hash, &file_name, missing)
            .await?;

        // 4. Merge
        self.enter(session, UploadState::Merging).await?;
        let url = self.merge(&file_hash, &file_name, &cancel).await?;

        Ok(UploadOutcome {
            file_id,
            file_hash,
            url: Some(url),
            instant: false,
            uploaded_chunks,
            resumed_chunks: resumed.len(),
        })
    }

    async fn enter(&self, session: &UploadSession, state: UploadState) -> Result<(), UploadError> {
        session.advance(state)?;
        let file_id = session.file_id();
        debug!(file_id, ?state, "state changed");
        self.emitter
            .send(UploadEvent::StateChanged { file_id, state })
            .await;
        Ok(())
    }

    async fn hash(
        &self,
        session: &UploadSession,
        source: &FileSource,
        cancel: &CancellationToken,
    ) -> Result<HashedFile, UploadError> {
        let worker = spawn_hasher(HashRequest {
            source: source.clone(),
            chunk_size: self.config.chunk_size,
        });
        let hashing = worker.finish(|_| {
            session.record_hashed();
            self.emitter.progress(session);
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            result = hashing => Ok(result?),
        }
    }

    async fn check(
        &self,
        file_hash: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<PrecheckResult, UploadError> {
        let request = CheckFileRequest {
            file_hash: file_hash.to_string(),
            file_name: file_name.to_string(),
        };
        let request = &request;
        let service = &self.service;

        let result = with_retry(
            &self.config.retry,
            cancel,
            |_, _| {},
            move |_| async move {
                match service.check_file(request).await {
                    Ok(response) => response.into_data().map_err(AttemptError::Transient),
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await;

        result.map_err(|e| match e {
            RetryError::Exhausted { attempts, reason } => {
                UploadError::CheckFailed { attempts, reason }
            }
            RetryError::Fatal(e) => e,
            RetryError::Aborted => UploadError::Cancelled,
        })
    }

    async fn upload_chunks(
        &self,
        session: &Arc<UploadSession>,
        source: &FileSource,
        file_hash: &str,
        file_name: &str,
        missing: Vec<HashedChunk>,
    ) -> Result<(), UploadError> {
        let file_id = session.file_id();
        let cancel = session.cancel_token();
        let mut drivers = JoinSet::new();

        for hashed in missing {
            let task = ChunkTask {
                service: Arc::clone(&self.service),
                source: source.clone(),
                chunk: hashed.chunk,
                request: UploadChunkRequest {
                    file_hash: file_hash.to_string(),
                    chunk_hash: hashed.chunk_hash,
                    index: hashed.chunk.index,
                    file_name: file_name.to_string(),
                },
                cancel: cancel.clone(),
            };
            // First attempts are queued here so chunks are admitted in order.
            let first = task.enqueue(&self.limiter, &file_id);
            let driver = ChunkDriver {
                task,
                limiter: self.limiter.clone(),
                file_id: file_id.clone(),
                retry: self.config.retry.clone(),
                session: Arc::clone(session),
                emitter: self.emitter.clone(),
            };
            drivers.spawn(driver.run(first));
        }

        let mut failure: Option<UploadError> = None;
        while let Some(joined) = drivers.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(UploadError::Internal(format!("chunk task failed: {e}"))));
            let Err(e) = result else {
                continue;
            };
            if failure.is_some() {
                continue;
            }
            if !e.is_cancelled() {
                warn!(file_id, error = %e, "chunk failed, aborting file");
            }
            cancel.cancel();
            let dropped = self.limiter.cancel_group(&file_id);
            debug!(file_id, dropped, "dropped queued chunks");
            failure = Some(e);
        }

        failure.map_or(Ok(()), Err)
    }

    async fn merge(
        &self,
        file_hash: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let request = MergeRequest {
            file_hash: file_hash.to_string(),
            file_name: file_name.to_string(),
            chunk_size: self.config.chunk_size,
        };
        let request = &request;
        let service = &self.service;

        let result = with_retry(
            &self.config.retry,
            cancel,
            |_, _| {},
            move |attempt| async move {
                match service.merge_chunks(request).await {
                    Ok(response) => match response.into_data() {
                        Ok(merged) if merged.merged => Ok(merged.url),
                        Ok(_) => Err(AttemptError::Fatal(UploadError::MergeFailed {
                            attempts: attempt,
                            reason: "service did not merge the chunks".into(),
                        })),
                        Err(reason) => Err(AttemptError::Transient(reason)),
                    },
                    Err(e) => Err(e.into()),
                }
            },
        )
        .await;

        result.map_err(|e| match e {
            RetryError::Exhausted { attempts, reason } => {
                UploadError::MergeFailed { attempts, reason }
            }
            RetryError::Fatal(e) => e,
            RetryError::Aborted => UploadError::Cancelled,
        })
    }

    async fn finish(
        &self,
        session: &UploadSession,
        result: Result<UploadOutcome, UploadError>,
    ) -> Result<UploadOutcome, UploadError> {
        let file_id = session.file_id();
        match result {
            Ok(outcome) => {
                session.complete(outcome.url.clone());
                self.emitter
                    .send(UploadEvent::StateChanged {
                        file_id: file_id.clone(),
                        state: UploadState::Completed,
                    })
                    .await;
                self.emitter.progress(session);
                info!(
                    file_id,
                    file_hash = %outcome.file_hash,
                    instant = outcome.instant,
                    uploaded = outcome.uploaded_chunks,
                    resumed = outcome.resumed_chunks,
                    elapsed = ?session.elapsed(),
                    "upload completed"
                );
                self.emitter
                    .send(UploadEvent::Completed {
                        file_id,
                        url: outcome.url.clone(),
                        instant: outcome.instant,
                    })
                    .await;
                Ok(outcome)
            }
            Err(_) if session.is_cancel_requested() => {
                session.mark_cancelled();
                self.limiter.cancel_group(&file_id);
                info!(file_id, "upload cancelled");
                self.emitter
                    .send(UploadEvent::StateChanged {
                        file_id: file_id.clone(),
                        state: UploadState::Cancelled,
                    })
                    .await;
                self.emitter.send(UploadEvent::Cancelled { file_id }).await;
                Err(UploadError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                session.fail(message.clone());
                error!(file_id, error = %message, "upload failed");
                self.emitter
                    .send(UploadEvent::StateChanged {
                        file_id: file_id.clone(),
                        state: UploadState::Failed,
                    })
                    .await;
                self.emitter
                    .send(UploadEvent::Failed {
                        file_id,
                        error: message,
                    })
                    .await;
                Err(e)
            }
        }
    }
}

/// What one chunk attempt needs; cloned into every limiter task.
struct ChunkTask<S> {
    service: Arc<S>,
    source: FileSource,
    chunk: Chunk,
    request: UploadChunkRequest,
    cancel: CancellationToken,
}

impl<S: UploadService + 'static> ChunkTask<S> {
    fn enqueue(
        &self,
        limiter: &ConcurrencyLimiter,
        file_id: &str,
    ) -> TaskHandle<Result<(), AttemptError>> {
        let service = Arc::clone(&self.service);
        let source = self.source.clone();
        let chunk = self.chunk;
        let request = self.request.clone();
        let cancel = self.cancel.clone();
        limiter.enqueue(
            move || async move { send_chunk(&*service, &source, chunk, request, cancel).await },
            file_id,
        )
    }
}

async fn send_chunk<S: UploadService>(
    service: &S,
    source: &FileSource,
    chunk: Chunk,
    request: UploadChunkRequest,
    cancel: CancellationToken,
) -> Result<(), AttemptError> {
    if cancel.is_cancelled() {
        return Err(AttemptError::Aborted);
    }
    let data = source
        .read_chunk_async(chunk)
        .await
        .map_err(|e| AttemptError::Fatal(e.into()))?;

    let index = request.index;
    match service
        .upload_chunk(ChunkUpload { request, data }, cancel)
        .await
    {
        Ok(response) => match response.into_data() {
            Ok(ack) if ack.uploaded => Ok(()),
            Ok(_) => Err(AttemptError::Transient(format!(
                "chunk {index} not acknowledged"
            ))),
            Err(reason) => Err(AttemptError::Transient(reason)),
        },
        Err(e) => Err(e.into()),
    }
}

/// Retry loop of one chunk. Every attempt re-enters the limiter queue.
struct ChunkDriver<S> {
    task: ChunkTask<S>,
    limiter: ConcurrencyLimiter,
    file_id: String,
    retry: RetryPolicy,
    session: Arc<UploadSession>,
    emitter: Emitter,
}

impl<S: UploadService + 'static> ChunkDriver<S> {
    async fn run(self, first: TaskHandle<Result<(), AttemptError>>) -> Result<(), UploadError> {
        let index = self.task.chunk.index;
        let mut first = Some(first);

        let result = with_retry(
            &self.retry,
            &self.task.cancel,
            |attempt, reason| {
                self.emitter.try_send(UploadEvent::ChunkRetry {
                    file_id: self.file_id.clone(),
                    index,
                    attempt,
                    error: reason.to_string(),
                });
            },
            |_| {
                let handle = first
                    .take()
                    .unwrap_or_else(|| self.task.enqueue(&self.limiter, &self.file_id));
                let cancel = self.task.cancel.clone();
                async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(LimiterError::Discarded) if cancel.is_cancelled() => {
                            Err(AttemptError::Aborted)
                        }
                        // Not dropped by a cancel, so the task panicked.
                        Err(LimiterError::Discarded) => Err(AttemptError::Fatal(
                            UploadError::Internal("chunk task panicked".into()),
                        )),
                    }
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.session.record_uploaded(self.task.chunk.size);
                self.emitter.progress(&self.session);
                trace!(file_id = %self.file_id, index, "chunk uploaded");
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, reason }) => Err(UploadError::ChunkFailed {
                index,
                attempts,
                reason,
            }),
            Err(RetryError::Fatal(e)) => Err(e),
            Err(RetryError::Aborted) => Err(UploadError::Cancelled),
        }
    }
}

/// Cancels a file whose `upload` future is dropped before it settles.
///
/// Finished sessions are left alone, so on the normal path this is a no-op.
struct AbandonGuard<'a> {
    session: &'a UploadSession,
    limiter: &'a ConcurrencyLimiter,
    emitter: &'a Emitter,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.session.abandon() {
            return;
        }
        let file_id = self.session.file_id();
        let dropped = self.limiter.cancel_group(&file_id);
        warn!(
            file_id,
            file_hash = ?self.session.file_hash(),
            dropped,
            "upload dropped before completion, cancelled"
        );
        self.emitter.try_send(UploadEvent::StateChanged {
            file_id: file_id.clone(),
            state: UploadState::Cancelled,
        });
        self.emitter.try_send(UploadEvent::Cancelled { file_id });
    }
}

/// Sends coordinator events once someone took the receiver.
#[derive(Clone)]
struct Emitter {
    tx: mpsc::Sender<UploadEvent>,
    listening: Arc<AtomicBool>,
    progress_gate: Arc<Mutex<()>>,
}

impl Emitter {
    fn new(tx: mpsc::Sender<UploadEvent>) -> Self {
        Self {
            tx,
            listening: Arc::new(AtomicBool::new(false)),
            progress_gate: Arc::new(Mutex::new(())),
        }
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    async fn send(&self, event: UploadEvent) {
        if self.is_listening() {
            let _ = self.tx.send(event).await;
        }
    }

    /// Non-blocking send; the event is dropped when the channel is full.
    fn try_send(&self, event: UploadEvent) {
        if !self.is_listening() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            trace!("event channel full, dropping event");
        }
    }

    /// Emits a progress snapshot. Snapshots are taken and queued under one
    /// lock so the channel never sees a file's progress go backwards.
    fn progress(&self, session: &UploadSession) {
        if !self.is_listening() {
            return;
        }
        let _gate = self
            .progress_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.try_send(UploadEvent::Progress(session.progress()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::memory::{Fault, FaultPlan, MemoryUploadService};
    use crate::service::ServiceFuture;
    use shardup_protocol::{ApiResponse, CheckFileResponse, MergeResponse, UploadChunkResponse};
    use shardup_transfer::checksum_bytes;
    use std::time::Duration;

    const MIB: usize = 1024 * 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn config(chunk_size: usize, max_concurrent: usize) -> UploadConfig {
        UploadConfig {
            chunk_size: chunk_size as u64,
            max_concurrent,
            retry: RetryPolicy::no_delay(4),
            event_buffer: 1024,
        }
    }

    fn coordinator(
        service: MemoryUploadService,
        config: UploadConfig,
    ) -> (Arc<MemoryUploadService>, UploadCoordinator<MemoryUploadService>) {
        let service = Arc::new(service);
        let coordinator = UploadCoordinator::new(Arc::clone(&service), config);
        (service, coordinator)
    }

    fn drain(rx: &mut mpsc::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[UploadEvent]) -> Vec<UploadState> {
        events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn uploads_every_chunk_then_merges() {
        let data = pattern(10 * MIB);
        let (service, coordinator) = coordinator(MemoryUploadService::new(), config(2 * MIB, 3));
        let mut events = coordinator.take_events().unwrap();

        let outcome = coordinator
            .upload("f1", "movie.mp4", FileSource::from_bytes(data.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.url.as_deref(), Some("/uploads/movie.mp4"));
        assert!(!outcome.instant);
        assert_eq!(outcome.uploaded_chunks, 5);
        assert_eq!(outcome.file_hash, checksum_bytes(&data));
        assert_eq!(service.stored_uploads(), 5);
        assert_eq!(service.merge_calls(), 1);
        assert!(service.max_in_flight() <= 3);

        let session = coordinator.session("f1").unwrap();
        assert_eq!(session.state(), UploadState::Completed);
        assert_eq!(session.progress().percentage(), 100.0);

        let events = drain(&mut events);
        assert_eq!(
            states(&events),
            vec![
                UploadState::Hashing,
                UploadState::Checking,
                UploadState::Uploading,
                UploadState::Merging,
                UploadState::Completed,
            ]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            UploadEvent::Completed { instant: false, url: Some(url), .. } if url == "/uploads/movie.mp4"
        )));
    }

    #[tokio::test]
    async fn stored_file_is_instant() {
        let data = pattern(10 * MIB);
        let service = MemoryUploadService::new();
        service.seed_file(&checksum_bytes(&data), "movie.mp4");
        let (service, coordinator) = coordinator(service, config(2 * MIB, 3));
        let mut events = coordinator.take_events().unwrap();

        let outcome = coordinator
            .upload("f1", "movie.mp4", FileSource::from_bytes(data))
            .await
            .unwrap();

        assert!(outcome.instant);
        assert_eq!(outcome.url.as_deref(), Some("/uploads/movie.mp4"));
        assert_eq!(service.upload_calls(), 0);
        assert_eq!(service.merge_calls(), 0);
        assert_eq!(
            states(&drain(&mut events)),
            vec![
                UploadState::Hashing,
                UploadState::Checking,
                UploadState::Skipped,
                UploadState::Completed,
            ]
        );
        assert_eq!(coordinator.progress("f1").unwrap().percentage(), 100.0);
    }

    #[tokio::test]
    async fn same_content_twice_is_instant_the_second_time() {
        let data = pattern(64 * 1024);
        let (service, coordinator) = coordinator(MemoryUploadService::new(), config(16 * 1024, 2));

        let first = coordinator
            .upload("a", "copy.bin", FileSource::from_bytes(data.clone()))
            .await
            .unwrap();
        let second = coordinator
            .upload("b", "copy.bin", FileSource::from_bytes(data))
            .await
            .unwrap();

        assert!(!first.instant);
        assert!(second.instant);
        assert_eq!(service.upload_calls(), 4);
        assert_eq!(service.merge_calls(), 1);
    }

    #[tokio::test]
    async fn transient_chunk_failure_is_retried() {
        let data = pattern(10 * 1024);
        let service = MemoryUploadService::new()
            .with_faults(FaultPlan::new().chunk(3, [Fault::Network, Fault::Network]));
        let (service, coordinator) = coordinator(service, config(2 * 1024, 2));
        let mut events = coordinator.take_events().unwrap();

        let outcome = coordinator
            .upload("f1", "doc.pdf", FileSource::from_bytes(data))
            .await
            .unwrap();

        assert_eq!(outcome.uploaded_chunks, 5);
        assert_eq!(service.upload_calls(), 7);
        assert_eq!(service.stored_uploads(), 5);
        let retries: Vec<(usize, u32)> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                UploadEvent::ChunkRetry { index, attempt, .. } => Some((index, attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(3, 1), (3, 2)]);
    }

    #[tokio::test]
    async fn rejected_chunk_is_retried_like_a_network_error() {
        let data = pattern(4 * 1024);
        let service =
            MemoryUploadService::new().with_faults(FaultPlan::new().chunk(0, [Fault::Reject]));
        let (service, coordinator) = coordinator(service, config(1024, 4));

        coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap();
        assert_eq!(service.upload_calls(), 5);
    }

    #[tokio::test]
    async fn exhausted_chunk_fails_file_and_aborts_siblings() {
        let data = pattern(5 * 1024);
        let service = MemoryUploadService::new()
            .with_latency(Duration::from_secs(10))
            .with_faults(
                FaultPlan::new()
                    .always_fail(2)
                    .chunk_delay(2, Duration::ZERO),
            );
        let (service, coordinator) = coordinator(service, config(1024, 5));
        let mut events = coordinator.take_events().unwrap();

        let err = coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap_err();

        match err {
            UploadError::ChunkFailed {
                index, attempts, ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(service.aborted_uploads(), 4);
        assert_eq!(service.stored_uploads(), 0);
        assert_eq!(service.merge_calls(), 0);
        assert_eq!(coordinator.limiter().pending_count(), 0);

        let session = coordinator.session("f1").unwrap();
        assert_eq!(session.state(), UploadState::Failed);
        assert!(session.progress().error.contains("chunk 2"));
        assert!(
            drain(&mut events)
                .iter()
                .any(|e| matches!(e, UploadEvent::Failed { .. }))
        );
    }

    #[tokio::test]
    async fn cancel_aborts_running_and_drops_queued_chunks() {
        let data = pattern(5 * 1024);
        let service = MemoryUploadService::new().with_latency(Duration::from_millis(100));
        let (service, coordinator) = coordinator(service, config(1024, 1));
        let coordinator = Arc::new(coordinator);
        let mut events = coordinator.take_events().unwrap();

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .upload("f1", "a.bin", FileSource::from_bytes(data))
                    .await
            })
        };

        wait_until(|| service.upload_calls() == 3).await;
        assert_eq!(coordinator.limiter().pending_for("f1"), 2);
        assert!(coordinator.cancel("f1"));

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(service.upload_calls(), 3);
        assert_eq!(service.stored_uploads(), 2);
        assert_eq!(service.aborted_uploads(), 1);
        assert_eq!(service.merge_calls(), 0);
        assert_eq!(coordinator.limiter().pending_count(), 0);
        assert_eq!(
            coordinator.session("f1").unwrap().state(),
            UploadState::Cancelled
        );
        assert!(!coordinator.cancel("f1"));
        assert!(
            drain(&mut events)
                .iter()
                .any(|e| matches!(e, UploadEvent::Cancelled { .. }))
        );
    }

    #[tokio::test]
    async fn resume_sends_only_missing_chunks() {
        let data = pattern(5 * 1024);
        let service = MemoryUploadService::new();
        service.seed_chunks(
            &checksum_bytes(&data),
            [
                checksum_bytes(&data[..1024]),
                checksum_bytes(&data[1024..2048]),
            ],
        );
        let (service, coordinator) = coordinator(service, config(1024, 2));

        let outcome = coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap();

        assert_eq!(outcome.resumed_chunks, 2);
        assert_eq!(outcome.uploaded_chunks, 3);
        let mut received = service.received_indexes();
        received.sort_unstable();
        assert_eq!(received, vec![2, 3, 4]);
        assert_eq!(service.merge_calls(), 1);
    }

    #[tokio::test]
    async fn progress_never_goes_backwards() {
        let data = pattern(16 * 1024);
        let service = MemoryUploadService::new().with_latency(Duration::from_millis(1));
        let (_service, coordinator) = coordinator(service, config(1024, 4));
        let mut events = coordinator.take_events().unwrap();

        coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap();

        let percentages: Vec<f64> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                UploadEvent::Progress(p) => Some(p.percentage()),
                _ => None,
            })
            .collect();
        assert!(!percentages.is_empty());
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percentages.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn chunk_admission_follows_index_order() {
        let data = pattern(6 * 1024);
        let (service, coordinator) = coordinator(MemoryUploadService::new(), config(1024, 1));

        coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap();
        assert_eq!(service.received_indexes(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn merge_retries_then_succeeds() {
        let data = pattern(2048);
        let service = MemoryUploadService::new().with_faults(FaultPlan::new().merge([Fault::Reject]));
        let (service, coordinator) = coordinator(service, config(1024, 2));

        let outcome = coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap();
        assert_eq!(outcome.url.as_deref(), Some("/uploads/a.bin"));
        assert_eq!(service.merge_calls(), 2);
    }

    #[tokio::test]
    async fn merge_failure_fails_file() {
        let data = pattern(2048);
        let service =
            MemoryUploadService::new().with_faults(FaultPlan::new().merge([Fault::Network; 4]));
        let (service, coordinator) = coordinator(service, config(1024, 2));

        let err = coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::MergeFailed { attempts: 4, .. }));
        assert_eq!(service.merge_calls(), 4);
        assert_eq!(
            coordinator.session("f1").unwrap().state(),
            UploadState::Failed
        );
    }

    #[tokio::test]
    async fn precheck_failure_sends_no_chunks() {
        let data = pattern(2048);
        let service =
            MemoryUploadService::new().with_faults(FaultPlan::new().check([Fault::Network; 4]));
        let (service, coordinator) = coordinator(service, config(1024, 2));

        let err = coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::CheckFailed { attempts: 4, .. }));
        assert_eq!(service.check_calls(), 4);
        assert_eq!(service.upload_calls(), 0);
    }

    #[tokio::test]
    async fn hashing_error_fails_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.bin");
        std::fs::write(&path, pattern(4096)).unwrap();
        let source = FileSource::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let (service, coordinator) = coordinator(MemoryUploadService::new(), config(1024, 2));
        let err = coordinator
            .upload("f1", "gone.bin", source)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Transfer(_)));
        assert_eq!(service.check_calls(), 0);
        assert_eq!(service.upload_calls(), 0);
        assert_eq!(
            coordinator.session("f1").unwrap().state(),
            UploadState::Failed
        );
    }

    #[tokio::test]
    async fn uploads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.bin");
        let data = pattern(3000);
        std::fs::write(&path, &data).unwrap();

        let (service, coordinator) = coordinator(MemoryUploadService::new(), config(1024, 2));
        let outcome = coordinator
            .upload("f1", "disk.bin", FileSource::open(&path).unwrap())
            .await
            .unwrap();

        assert_eq!(outcome.file_hash, checksum_bytes(&data));
        assert_eq!(outcome.uploaded_chunks, 3);
        assert_eq!(service.stored_uploads(), 3);
    }

    #[tokio::test]
    async fn empty_file_completes_without_chunks() {
        let (service, coordinator) = coordinator(MemoryUploadService::new(), config(1024, 2));
        let outcome = coordinator
            .upload("f1", "empty.txt", FileSource::from_bytes(Vec::new()))
            .await
            .unwrap();

        assert_eq!(outcome.uploaded_chunks, 0);
        assert_eq!(service.upload_calls(), 0);
        assert_eq!(service.merge_calls(), 1);
        assert_eq!(coordinator.progress("f1").unwrap().percentage(), 100.0);
    }

    #[tokio::test]
    async fn rejects_unsafe_file_name() {
        let (_service, coordinator) = coordinator(MemoryUploadService::new(), config(1024, 2));
        let err = coordinator
            .upload("f1", "../etc/passwd", FileSource::from_bytes(vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transfer(_)));
        assert!(coordinator.session("f1").is_none());
    }

    #[tokio::test]
    async fn same_file_id_cannot_upload_twice_at_once() {
        let service = MemoryUploadService::new().with_latency(Duration::from_secs(10));
        let (_service, coordinator) = coordinator(service, config(1024, 2));
        let coordinator = Arc::new(coordinator);

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .upload("f1", "a.bin", FileSource::from_bytes(pattern(4096)))
                    .await
            })
        };
        wait_until(|| {
            coordinator
                .session("f1")
                .is_some_and(|s| s.state() == UploadState::Uploading)
        })
        .await;

        let err = coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(pattern(4096)))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AlreadyActive(_)));
        assert!(!coordinator.forget("f1"));

        assert!(coordinator.cancel("f1"));
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert!(coordinator.forget("f1"));
        assert!(coordinator.session("f1").is_none());
    }

    #[tokio::test]
    async fn files_share_the_limiter() {
        let service = MemoryUploadService::new().with_latency(Duration::from_millis(5));
        let (service, coordinator) = coordinator(service, config(1024, 2));
        let coordinator = Arc::new(coordinator);

        let mut tasks = JoinSet::new();
        for (id, seed) in [("a", 1u8), ("b", 2), ("c", 3)] {
            let coordinator = Arc::clone(&coordinator);
            let data: Vec<u8> = pattern(4096).into_iter().map(|b| b ^ seed).collect();
            tasks.spawn(async move {
                coordinator
                    .upload(id, format!("{id}.bin"), FileSource::from_bytes(data))
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(service.stored_uploads(), 12);
        assert!(service.max_in_flight() <= 2);
        assert_eq!(coordinator.limiter().active_count(), 0);
    }

    #[tokio::test]
    async fn precheck_reports_stored_chunks() {
        let service = MemoryUploadService::new();
        service.seed_chunks("h1", ["c1".to_string()]);
        let (_service, coordinator) = coordinator(service, config(1024, 2));

        let result = coordinator.precheck("h1", "a.bin").await.unwrap();
        assert!(result.should_upload);
        assert_eq!(result.uploaded_list, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn cancel_unknown_file_is_noop() {
        let (_service, coordinator) = coordinator(MemoryUploadService::new(), config(1024, 2));
        assert!(!coordinator.cancel("nope"));
        assert!(coordinator.progress("nope").is_none());
    }

    #[tokio::test]
    async fn events_are_not_buffered_without_listener() {
        let data = pattern(64 * 1024);
        let mut cfg = config(1024, 4);
        cfg.event_buffer = 4;
        let (_service, coordinator) = coordinator(MemoryUploadService::new(), cfg);

        coordinator
            .upload("f1", "a.bin", FileSource::from_bytes(data))
            .await
            .unwrap();
        let mut events = coordinator.take_events().unwrap();
        assert!(events.try_recv().is_err());
        assert!(coordinator.take_events().is_none());
    }

    #[tokio::test]
    async fn dropped_upload_cancels_the_file() {
        let data = pattern(5 * MIB);
        let (service, coordinator) = coordinator(
            MemoryUploadService::new().with_latency(Duration::from_millis(200)),
            config(MIB, 1),
        );
        let mut events = coordinator.take_events().unwrap();

        let upload = coordinator.upload("f1", "movie.mp4", FileSource::from_bytes(data.clone()));
        tokio::select! {
            _ = upload => panic!("upload finished before it was dropped"),
            _ = wait_until(|| service.upload_calls() >= 1) => {}
        }

        let session = coordinator.session("f1").unwrap();
        assert_eq!(session.state(), UploadState::Cancelled);
        assert!(session.cancel_token().is_cancelled());
        assert_eq!(coordinator.limiter().pending_count(), 0);
        wait_until(|| coordinator.limiter().active_count() == 0).await;

        let calls = service.upload_calls();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(service.upload_calls(), calls);
        assert_eq!(service.stored_uploads(), 0);
        assert_eq!(service.aborted_uploads(), 1);

        let events = drain(&mut events);
        assert_eq!(states(&events).last(), Some(&UploadState::Cancelled));
        assert!(events.iter().any(|e| matches!(e, UploadEvent::Cancelled { .. })));

        // The id is free again.
        let outcome = coordinator
            .upload("f1", "movie.mp4", FileSource::from_bytes(data))
            .await
            .unwrap();
        assert_eq!(outcome.uploaded_chunks, 5);
        assert!(coordinator.forget("f1"));
    }

    async fn explode() -> Result<ApiResponse<UploadChunkResponse>, ServiceError> {
        panic!("chunk upload exploded")
    }

    /// Stores nothing; every chunk upload panics.
    struct PanickingService {
        inner: MemoryUploadService,
    }

    impl UploadService for PanickingService {
        fn check_file(&self, request: &CheckFileRequest) -> ServiceFuture<'_, CheckFileResponse> {
            self.inner.check_file(request)
        }

        fn upload_chunk(
            &self,
            _chunk: ChunkUpload,
            _cancel: CancellationToken,
        ) -> ServiceFuture<'_, UploadChunkResponse> {
            Box::pin(explode())
        }

        fn merge_chunks(&self, request: &MergeRequest) -> ServiceFuture<'_, MergeResponse> {
            self.inner.merge_chunks(request)
        }
    }

    #[tokio::test]
    async fn panicking_chunk_task_fails_the_file() {
        let service = Arc::new(PanickingService {
            inner: MemoryUploadService::new(),
        });
        let coordinator = UploadCoordinator::new(Arc::clone(&service), config(MIB, 2));
        let mut events = coordinator.take_events().unwrap();

        let err = coordinator
            .upload("f1", "movie.mp4", FileSource::from_bytes(pattern(3 * MIB)))
            .await
            .unwrap_err();

        assert!(
            matches!(&err, UploadError::Internal(reason) if reason == "chunk task panicked"),
            "got {err:?}"
        );
        assert!(!err.is_cancelled());

        let session = coordinator.session("f1").unwrap();
        assert_eq!(session.state(), UploadState::Failed);
        assert!(!session.is_cancel_requested());
        assert_eq!(service.inner.merge_calls(), 0);
        assert_eq!(coordinator.limiter().pending_count(), 0);

        let events = drain(&mut events);
        assert_eq!(states(&events).last(), Some(&UploadState::Failed));
        assert!(events.iter().any(|e| matches!(e, UploadEvent::Failed { .. })));
        assert!(!events.iter().any(|e| matches!(e, UploadEvent::Cancelled { .. })));
    }
}
