use super::Pieces;
use crate::error::{BittorrentError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One output file of the torrent, in layout order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// Everything the download engine needs to know about a torrent.
///
/// How it was obtained (torrent file, magnet resolution, ...) is not the
/// engine's concern.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub name: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub piece_length: u64,
    pub pieces: Pieces,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub announce_list: Vec<String>,
}

impl Descriptor {
    pub fn number_of_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Size of piece `index`; the last one may be shorter.
    pub fn piece_size(&self, index: usize) -> u64 {
        let count = self.number_of_pieces() as u64;
        if index as u64 + 1 == count {
            self.total_length - (count - 1) * self.piece_length
        } else {
            self.piece_length
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(BittorrentError::InvalidTorrent(
                "Piece length must be positive".to_string(),
            ));
        }

        let expected = self.total_length.div_ceil(self.piece_length);
        if expected != self.pieces.len() as u64 {
            return Err(BittorrentError::InvalidTorrent(format!(
                "Expected {} piece hashes, found {}",
                expected,
                self.pieces.len()
            )));
        }

        let files_total: u64 = self.files.iter().map(|f| f.length).sum();
        if files_total != self.total_length {
            return Err(BittorrentError::InvalidTorrent(format!(
                "File lengths sum to {} but total length is {}",
                files_total, self.total_length
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::descriptor_for;

    #[test]
    fn test_last_piece_is_remainder() {
        let data = vec![7u8; 8000];
        let descriptor = descriptor_for(&[("a", 5000), ("b", 3000)], &data, 4096);

        assert_eq!(descriptor.number_of_pieces(), 2);
        assert_eq!(descriptor.piece_size(0), 4096);
        assert_eq!(descriptor.piece_size(1), 8000 - 4096);
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_counts() {
        let data = vec![7u8; 8000];
        let mut descriptor = descriptor_for(&[("a", 8000)], &data, 4096);
        descriptor.files[0].length = 7999;
        assert!(descriptor.validate().is_err());

        let mut descriptor = descriptor_for(&[("a", 8000)], &data, 4096);
        descriptor.total_length = 9000;
        descriptor.files[0].length = 9000;
        assert!(descriptor.validate().is_err());
    }
}
