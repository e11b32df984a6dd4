//! Whole-file content hashing on a blocking worker thread.
//!
//! The worker speaks a small message protocol over a
//! [`tokio::sync::mpsc`] channel: zero or more [`HashMessage::Progress`],
//! then exactly one [`HashMessage::Done`] or [`HashMessage::Error`].

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::TransferError;
use crate::chunked::{FileSource, checksum_bytes};
use crate::types::{Chunk, HashedChunk, HashedFile};

/// Capacity of the worker's outbound channel.
const CHANNEL_CAPACITY: usize = 64;

/// Instruction sent to the hash worker.
#[derive(Debug, Clone)]
pub struct HashRequest {
    pub source: FileSource,
    pub chunk_size: u64,
}

/// Message emitted by the hash worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashMessage {
    /// Percentage of chunks consumed so far (0-100).
    Progress { percentage: u8 },
    /// Final digest plus the chunk list with per-chunk digests.
    Done(HashedFile),
    /// The run failed; no digest is produced.
    Error { error: String },
}

/// Rounds down, so only the last chunk reports 100.
fn percentage(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed * 100 / total).min(100) as u8
}

/// Digests `chunks` of `source` strictly in order.
///
/// Feeds every chunk into one incremental SHA-256, so the file digest is the
/// digest of the whole byte stream and does not depend on the chunk size.
/// Each chunk also gets its own digest. A progress message follows every
/// chunk; an empty chunk list reports 100 once.
///
/// Blocking: call it from a worker thread. Fails on the first read error,
/// or when the receiver of `progress` is gone.
pub fn hash_chunks(
    source: &FileSource,
    chunks: &[Chunk],
    progress: &mpsc::Sender<HashMessage>,
) -> Result<HashedFile, TransferError> {
    let mut file_hasher = Sha256::new();
    let mut hashed = Vec::with_capacity(chunks.len());

    let send_progress = |processed: usize| {
        progress
            .blocking_send(HashMessage::Progress {
                percentage: percentage(processed, chunks.len()),
            })
            .map_err(|_| TransferError::WorkerFailed("progress receiver dropped".into()))
    };

    if chunks.is_empty() {
        send_progress(0)?;
    }

    for (i, chunk) in chunks.iter().enumerate() {
        let data = source.read_chunk(chunk)?;
        file_hasher.update(&data);
        hashed.push(HashedChunk {
            chunk: *chunk,
            chunk_hash: checksum_bytes(&data),
        });
        send_progress(i + 1)?;
    }

    Ok(HashedFile {
        file_hash: hex::encode(file_hasher.finalize()),
        chunks: hashed,
    })
}

/// Runs one hashing request to completion and reports the outcome on `tx`.
///
/// Splits the source, hashes it with [`hash_chunks`] and sends exactly one
/// terminal message. Blocking.
pub fn run_hash_worker(request: HashRequest, tx: mpsc::Sender<HashMessage>) {
    let result = request
        .source
        .split(request.chunk_size)
        .and_then(|chunks| hash_chunks(&request.source, &chunks, &tx));

    let terminal = match result {
        Ok(file) => {
            debug!(
                file_hash = %file.file_hash,
                chunks = file.chunks.len(),
                "hash complete"
            );
            HashMessage::Done(file)
        }
        Err(e) => {
            warn!(error = %e, "hash worker failed");
            HashMessage::Error {
                error: e.to_string(),
            }
        }
    };
    // Receiver gone means the caller stopped waiting.
    let _ = tx.blocking_send(terminal);
}

/// Starts a hash worker on the blocking thread pool.
///
/// Must be called from within a tokio runtime.
pub fn spawn_hasher(request: HashRequest) -> HashWorker {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::task::spawn_blocking(move || run_hash_worker(request, tx));
    HashWorker { rx, handle }
}

/// Caller side of a running hash worker.
///
/// Dropping it stops the worker at its next progress report.
pub struct HashWorker {
    rx: mpsc::Receiver<HashMessage>,
    handle: JoinHandle<()>,
}

impl HashWorker {
    /// Waits for the terminal message, forwarding progress to `on_progress`.
    pub async fn finish(
        mut self,
        mut on_progress: impl FnMut(u8),
    ) -> Result<HashedFile, TransferError> {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                HashMessage::Progress { percentage } => on_progress(percentage),
                HashMessage::Done(file) => return Ok(file),
                HashMessage::Error { error } => return Err(TransferError::WorkerFailed(error)),
            }
        }

        match self.handle.await {
            Ok(()) => Err(TransferError::WorkerFailed(
                "worker exited without a result".into(),
            )),
            Err(e) => Err(TransferError::WorkerFailed(format!("task join error: {e}"))),
        }
    }
}
