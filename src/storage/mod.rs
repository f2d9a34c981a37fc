//! Byte persistence behind the piece engine.
//!
//! The engine only ever hands over a list of [`FileRange`]s plus the
//! buffer those ranges index into. Where the bytes end up is up to the
//! [`Storage`] implementation.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::{MemoryStorage, WriteRecord};

use crate::error::{BittorrentError, Result};
use crate::piece::FileRange;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist `data[r.piece_offset..r.piece_end()]` at `r.file_offset` of
    /// `r.path`, for every range.
    async fn write(&self, ranges: &[FileRange], data: &[u8]) -> Result<()>;

    /// Rebuild the buffer described by `ranges` and return
    /// `block_length` bytes starting at `block_offset`.
    async fn read(&self, ranges: &[FileRange], block_offset: usize, block_length: usize) -> Result<Bytes>;
}

/// Slice of `data` a range refers to, or a storage error if it doesn't fit
pub(crate) fn range_slice<'a>(range: &FileRange, data: &'a [u8]) -> Result<&'a [u8]> {
    data.get(range.piece_offset..range.piece_end()).ok_or_else(|| {
        BittorrentError::StorageFailure(format!(
            "Range {}..{} of {} exceeds buffer of {} bytes",
            range.piece_offset,
            range.piece_end(),
            range.path.display(),
            data.len()
        ))
    })
}

/// Cut a block out of a reassembled buffer
pub(crate) fn block_slice(buffer: Vec<u8>, block_offset: usize, block_length: usize) -> Result<Bytes> {
    let end = block_offset + block_length;
    if end > buffer.len() {
        return Err(BittorrentError::StorageFailure(format!(
            "Block {}..{} beyond stored {} bytes",
            block_offset,
            end,
            buffer.len()
        )));
    }
    Ok(Bytes::from(buffer).slice(block_offset..end))
}

/// Size of the buffer a set of ranges spans
pub(crate) fn span_len(ranges: &[FileRange]) -> usize {
    ranges.iter().map(FileRange::piece_end).max().unwrap_or(0)
}
