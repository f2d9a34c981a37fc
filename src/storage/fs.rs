use super::{block_slice, range_slice, span_len, Storage};
use crate::error::{BittorrentError, Result};
use crate::piece::FileRange;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Random-access files under a download directory
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a torrent file under the root. Only plain relative
    /// components are accepted.
    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.as_os_str().is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(BittorrentError::StorageFailure(format!(
                "Refusing path outside the download directory: {}",
                path.display()
            )));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn write(&self, ranges: &[FileRange], data: &[u8]) -> Result<()> {
        for range in ranges {
            let slice = range_slice(range, data)?;
            let path = self.resolve(&range.path)?;

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| storage_error("create directory", parent, e))?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .await
                .map_err(|e| storage_error("open", &path, e))?;

            file.seek(SeekFrom::Start(range.file_offset))
                .await
                .map_err(|e| storage_error("seek", &path, e))?;
            file.write_all(slice)
                .await
                .map_err(|e| storage_error("write", &path, e))?;
            file.flush().await.map_err(|e| storage_error("flush", &path, e))?;

            debug!(
                "Wrote {} bytes to {:?} at offset {}",
                slice.len(),
                path,
                range.file_offset
            );
        }

        Ok(())
    }

    async fn read(&self, ranges: &[FileRange], block_offset: usize, block_length: usize) -> Result<Bytes> {
        let mut buffer = vec![0u8; span_len(ranges)];

        for range in ranges {
            let path = self.resolve(&range.path)?;
            let mut file = fs::File::open(&path)
                .await
                .map_err(|e| storage_error("open", &path, e))?;

            file.seek(SeekFrom::Start(range.file_offset))
                .await
                .map_err(|e| storage_error("seek", &path, e))?;
            file.read_exact(&mut buffer[range.piece_offset..range.piece_end()])
                .await
                .map_err(|e| storage_error("read", &path, e))?;
        }

        block_slice(buffer, block_offset, block_length)
    }
}

fn storage_error(action: &str, path: &Path, err: std::io::Error) -> BittorrentError {
    BittorrentError::StorageFailure(format!("Can't {} {}: {}", action, path.display(), err))
}
