use super::{block_slice, range_slice, span_len, Storage};
use crate::error::{BittorrentError, Result};
use crate::piece::FileRange;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// What one `write` call carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub ranges: Vec<FileRange>,
    pub data_len: usize,
}

/// Files kept in memory. Handy for embedding and for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    writes: Mutex<Vec<WriteRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files.lock().get(path.as_ref()).cloned()
    }

    /// Every successful write, in call order
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    /// Make subsequent writes fail, to exercise error paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, ranges: &[FileRange], data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BittorrentError::StorageFailure("Writes disabled".to_string()));
        }

        let mut files = self.files.lock();
        for range in ranges {
            let slice = range_slice(range, data)?;
            let file = files.entry(range.path.clone()).or_default();
            let start = range.file_offset as usize;
            if file.len() < start + slice.len() {
                file.resize(start + slice.len(), 0);
            }
            file[start..start + slice.len()].copy_from_slice(slice);
        }

        self.writes.lock().push(WriteRecord {
            ranges: ranges.to_vec(),
            data_len: data.len(),
        });
        Ok(())
    }

    async fn read(&self, ranges: &[FileRange], block_offset: usize, block_length: usize) -> Result<Bytes> {
        let files = self.files.lock();
        let mut buffer = vec![0u8; span_len(ranges)];

        for range in ranges {
            let stored = files
                .get(&range.path)
                .and_then(|f| f.get(range.file_offset as usize..range.file_end() as usize))
                .ok_or_else(|| {
                    BittorrentError::StorageFailure(format!("Can't read file {}", range.path.display()))
                })?;
            buffer[range.piece_offset..range.piece_end()].copy_from_slice(stored);
        }

        block_slice(buffer, block_offset, block_length)
    }
}
