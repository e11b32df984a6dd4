//! Chunking and hashing for resumable uploads.
//!
//! A file is split into fixed-size byte ranges ([`split`]) without touching
//! the disk; bytes are read lazily through a [`FileSource`]. The
//! [`hasher`] worker digests the whole file from its chunks on a blocking
//! thread and reports progress over a channel.

mod chunked;
pub mod hasher;
mod progress;
mod types;
mod validation;

pub use chunked::{FileSource, checksum_bytes, chunk_count, split};
pub use hasher::{HashMessage, HashRequest, HashWorker, hash_chunks, run_hash_worker, spawn_hasher};
pub use progress::SpeedCalculator;
pub use types::{Chunk, HashedChunk, HashedFile};
pub use validation::validate_file_name;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("chunk {index} lies outside the file ({end} > {len})")]
    ChunkOutOfRange { index: usize, end: u64, len: u64 },

    #[error("invalid file name: {0}")]
    InvalidPath(String),

    #[error("hash worker failed: {0}")]
    WorkerFailed(String),
}
