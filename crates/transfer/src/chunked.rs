use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::types::Chunk;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// Number of chunks a file of `file_size` bytes splits into.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> Result<usize, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    Ok(file_size.div_ceil(chunk_size) as usize)
}

/// Splits a file into consecutive fixed-size chunks.
///
/// Performs no I/O. The result is deterministic: the same `file_size` and
/// `chunk_size` always give the same partition. The last chunk holds the
/// remainder, or a full chunk when the size divides evenly. An empty file
/// yields no chunks.
pub fn split(file_size: u64, chunk_size: u64) -> Result<Vec<Chunk>, TransferError> {
    let count = chunk_count(file_size, chunk_size)?;
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0u64;
    while offset < file_size {
        let size = chunk_size.min(file_size - offset);
        chunks.push(Chunk {
            index: chunks.len(),
            offset,
            size,
        });
        offset += size;
    }
    Ok(chunks)
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Where a file's bytes come from.
///
/// Cloning is cheap: in-memory data is reference counted and path sources
/// reopen the file for every read.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Bytes already in memory.
    Memory(Bytes),
    /// A file on disk, sized when the source was opened.
    Path { path: PathBuf, len: u64 },
}

impl FileSource {
    /// Wraps in-memory data.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Memory(data.into())
    }

    /// Opens `path` and records its current size.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let len = std::fs::metadata(path)?.len();
        Ok(Self::Path {
            path: path.to_path_buf(),
            len,
        })
    }

    /// Total size in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(data) => data.len() as u64,
            Self::Path { len, .. } => *len,
        }
    }

    /// Returns `true` if the source holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits this source with [`split`].
    pub fn split(&self, chunk_size: u64) -> Result<Vec<Chunk>, TransferError> {
        split(self.len(), chunk_size)
    }

    /// Reads the bytes of one chunk.
    ///
    /// Blocking for path sources; use [`read_chunk_async`](Self::read_chunk_async)
    /// from async code.
    pub fn read_chunk(&self, chunk: &Chunk) -> Result<Bytes, TransferError> {
        let len = self.len();
        if chunk.end() > len {
            return Err(TransferError::ChunkOutOfRange {
                index: chunk.index,
                end: chunk.end(),
                len,
            });
        }

        match self {
            Self::Memory(data) => Ok(data.slice(chunk.offset as usize..chunk.end() as usize)),
            Self::Path { path, .. } => {
                let mut file = std::fs::File::open(path)?;
                file.seek(SeekFrom::Start(chunk.offset))?;
                let mut buf = vec![0u8; chunk.size as usize];
                file.read_exact(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Reads one chunk without blocking the async runtime.
    pub async fn read_chunk_async(&self, chunk: Chunk) -> Result<Bytes, TransferError> {
        match self {
            Self::Memory(_) => self.read_chunk(&chunk),
            Self::Path { .. } => {
                let source = self.clone();
                tokio::task::spawn_blocking(move || source.read_chunk(&chunk))
                    .await
                    .map_err(|e| TransferError::WorkerFailed(format!("task join error: {e}")))?
            }
        }
    }
}
