use crate::error::{BittorrentError, Result};
use sha1::{Digest, Sha1};

/// A 20-byte SHA1 digest of one piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; 20]);

impl PieceHash {
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let hash: [u8; 20] = slice.try_into().map_err(|_| {
            BittorrentError::InvalidTorrent("Piece hash must be 20 bytes".to_string())
        })?;
        Ok(Self(hash))
    }

    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl AsRef<[u8]> for PieceHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Ordered piece digests of a torrent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pieces {
    hashes: Vec<PieceHash>,
}

impl Pieces {
    /// Parse concatenated 20-byte digests
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % 20 != 0 {
            return Err(BittorrentError::InvalidTorrent(
                "Pieces length must be multiple of 20".to_string(),
            ));
        }

        let hashes = data
            .chunks_exact(20)
            .map(PieceHash::from_slice)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { hashes })
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PieceHash> {
        self.hashes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceHash> {
        self.hashes.iter()
    }
}

impl FromIterator<PieceHash> for Pieces {
    fn from_iter<I: IntoIterator<Item = PieceHash>>(iter: I) -> Self {
        Self {
            hashes: iter.into_iter().collect(),
        }
    }
}
