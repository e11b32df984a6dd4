/// A fixed-size byte range of a file.
///
/// Chunks carry no data; bytes are read on demand through
/// [`FileSource::read_chunk`](crate::FileSource::read_chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position in the file.
    pub index: usize,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length in bytes (the chunk size, except possibly for the last chunk).
    pub size: u64,
}

impl Chunk {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A chunk together with the digest of its own bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedChunk {
    pub chunk: Chunk,
    /// Hex SHA-256 of this chunk alone.
    pub chunk_hash: String,
}

/// Output of a successful hashing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    /// Hex SHA-256 of the whole file byte stream.
    pub file_hash: String,
    pub chunks: Vec<HashedChunk>,
}

impl HashedFile {
    /// Total number of bytes covered by the chunks.
    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.chunk.size).sum()
    }
}
