//! Per-file upload session state.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use shardup_protocol::{UploadProgress, UploadState};
use shardup_transfer::SpeedCalculator;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

/// Tracks the lifecycle and counters of one file upload.
///
/// Thread-safe: chunk drivers update counters concurrently while callers
/// read progress snapshots.
pub struct UploadSession {
    inner: RwLock<SessionInner>,
    cancel: CancellationToken,
    speed: SpeedCalculator,
}

struct SessionInner {
    file_id: String,
    file_name: String,
    state: UploadState,
    total_chunks: usize,
    total_bytes: u64,
    hashed_chunks: usize,
    uploaded_chunks: usize,
    uploaded_bytes: u64,
    file_hash: Option<String>,
    url: Option<String>,
    error: String,
    cancel_requested: bool,
    started_at: Instant,
    updated_at: Instant,
    completed_at: Option<Instant>,
}

impl UploadSession {
    /// Creates a session in the `Idle` state.
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        total_chunks: usize,
        total_bytes: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: RwLock::new(SessionInner {
                file_id: file_id.into(),
                file_name: file_name.into(),
                state: UploadState::Idle,
                total_chunks,
                total_bytes,
                hashed_chunks: 0,
                uploaded_chunks: 0,
                uploaded_bytes: 0,
                file_hash: None,
                url: None,
                error: String::new(),
                cancel_requested: false,
                started_at: now,
                updated_at: now,
                completed_at: None,
            }),
            cancel: CancellationToken::new(),
            speed: SpeedCalculator::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to a non-terminal state.
    ///
    /// Fails with [`UploadError::Cancelled`] once a cancel was requested, so
    /// a cancelled upload never enters a later phase.
    pub fn advance(&self, state: UploadState) -> Result<(), UploadError> {
        let mut s = self.write();
        if s.cancel_requested || s.state.is_terminal() {
            return Err(UploadError::Cancelled);
        }
        s.state = state;
        s.updated_at = Instant::now();
        Ok(())
    }

    /// Counts one more hashed chunk.
    pub fn record_hashed(&self) {
        let mut s = self.write();
        s.hashed_chunks = (s.hashed_chunks + 1).min(s.total_chunks);
        s.updated_at = Instant::now();
    }

    /// Counts one more uploaded chunk of `bytes` length.
    pub fn record_uploaded(&self, bytes: u64) {
        {
            let mut s = self.write();
            s.uploaded_chunks = (s.uploaded_chunks + 1).min(s.total_chunks);
            s.uploaded_bytes = (s.uploaded_bytes + bytes).min(s.total_bytes);
            s.updated_at = Instant::now();
        }
        self.speed.record(bytes);
    }

    /// Counts chunks the service already holds as uploaded.
    pub fn record_resumed(&self, chunks: usize, bytes: u64) {
        let mut s = self.write();
        s.uploaded_chunks = (s.uploaded_chunks + chunks).min(s.total_chunks);
        s.uploaded_bytes = (s.uploaded_bytes + bytes).min(s.total_bytes);
        s.updated_at = Instant::now();
    }

    /// Marks every chunk hashed and uploaded (instant transfer).
    pub fn record_all_uploaded(&self) {
        let mut s = self.write();
        s.hashed_chunks = s.total_chunks;
        s.uploaded_chunks = s.total_chunks;
        s.uploaded_bytes = s.total_bytes;
        s.updated_at = Instant::now();
    }

    pub fn set_file_hash(&self, file_hash: &str) {
        self.write().file_hash = Some(file_hash.to_string());
    }

    /// Marks the session as completed.
    pub fn complete(&self, url: Option<String>) {
        let mut s = self.write();
        s.state = UploadState::Completed;
        s.url = url;
        let now = Instant::now();
        s.completed_at = Some(now);
        s.updated_at = now;
    }

    /// Marks the session as failed with an error message.
    pub fn fail(&self, error: impl Into<String>) {
        let mut s = self.write();
        s.state = UploadState::Failed;
        s.error = error.into();
        let now = Instant::now();
        s.completed_at = Some(now);
        s.updated_at = now;
        drop(s);
        self.cancel.cancel();
    }

    /// Marks the session as cancelled.
    pub fn mark_cancelled(&self) {
        let mut s = self.write();
        s.state = UploadState::Cancelled;
        let now = Instant::now();
        s.completed_at = Some(now);
        s.updated_at = now;
    }

    /// Cancels a session whose caller stopped waiting, in any non-terminal
    /// state including `Merging`. Returns `false` if it already finished.
    pub fn abandon(&self) -> bool {
        let mut s = self.write();
        if s.state.is_terminal() {
            return false;
        }
        s.cancel_requested = true;
        s.state = UploadState::Cancelled;
        let now = Instant::now();
        s.completed_at = Some(now);
        s.updated_at = now;
        drop(s);
        self.cancel.cancel();
        true
    }

    /// Requests cancellation. Returns `false` when the current state can no
    /// longer be cancelled or a cancel is already pending.
    pub fn request_cancel(&self) -> bool {
        let mut s = self.write();
        if !s.state.is_cancellable() || s.cancel_requested {
            return false;
        }
        s.cancel_requested = true;
        s.updated_at = Instant::now();
        drop(s);
        self.cancel.cancel();
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.read().cancel_requested
    }

    /// Token observed by every in-flight operation of this file.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn file_id(&self) -> String {
        self.read().file_id.clone()
    }

    pub fn file_name(&self) -> String {
        self.read().file_name.clone()
    }

    pub fn state(&self) -> UploadState {
        self.read().state
    }

    pub fn file_hash(&self) -> Option<String> {
        self.read().file_hash.clone()
    }

    pub fn url(&self) -> Option<String> {
        self.read().url.clone()
    }

    /// Returns true while the session has not reached a terminal state.
    pub fn is_active(&self) -> bool {
        !self.read().state.is_terminal()
    }

    /// Wall time since the session was created, frozen once it finishes.
    pub fn elapsed(&self) -> Duration {
        let s = self.read();
        s.completed_at
            .unwrap_or_else(Instant::now)
            .duration_since(s.started_at)
    }

    /// Returns a progress snapshot.
    ///
    /// The ETA only exists while chunks are being sent and the speed window
    /// holds enough samples.
    pub fn progress(&self) -> UploadProgress {
        let s = self.read();
        let eta_seconds = match s.state {
            UploadState::Uploading => self
                .speed
                .eta(s.total_bytes.saturating_sub(s.uploaded_bytes))
                .map(|eta| eta.as_secs_f64()),
            _ => None,
        };
        UploadProgress {
            file_id: s.file_id.clone(),
            state: s.state,
            total_chunks: s.total_chunks,
            hashed_chunks: s.hashed_chunks,
            uploaded_chunks: s.uploaded_chunks,
            total_bytes: s.total_bytes,
            uploaded_bytes: s.uploaded_bytes,
            bytes_per_second: self.speed.bytes_per_second(),
            eta_seconds,
            error: s.error.clone(),
        }
    }
}
