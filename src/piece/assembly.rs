use super::block::{block_sizes, Block, BlockState, BLOCK_SIZE};
use super::FileRange;
use crate::error::{BittorrentError, Result};
use crate::peer::BlockInfo;
use crate::storage::Storage;
use crate::torrent::PieceHash;
use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, warn};

/// Block-level download state of one piece
#[derive(Debug, Clone)]
pub struct Piece {
    index: usize,
    size: usize,
    hash: PieceHash,
    blocks: Vec<Block>,
    /// Number of selected files overlapping this piece; only `> 0` matters
    pub(crate) is_active: u32,
    is_full: bool,
    pub(crate) file_ranges: Vec<FileRange>,
}

impl Piece {
    pub fn new(index: usize, size: usize, hash: PieceHash) -> Self {
        let mut piece = Self {
            index,
            size,
            hash,
            blocks: Vec::new(),
            is_active: 0,
            is_full: false,
            file_ranges: Vec::new(),
        };
        piece.init_blocks();
        piece
    }

    /// Reset every block to FREE, dropping any received data
    pub fn init_blocks(&mut self) {
        self.blocks = block_sizes(self.size).into_iter().map(Block::new).collect();
    }

    /// Replace buffers by data-less FULL markers once bytes are on storage
    pub fn clear(&mut self) {
        self.blocks = block_sizes(self.size)
            .into_iter()
            .map(Block::persisted)
            .collect();
    }

    /// Free blocks that have been pending for too long
    pub fn update_block_status(&mut self) -> usize {
        self.expire_pending(Instant::now())
    }

    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for block in &mut self.blocks {
            if block.is_expired(now) {
                *block = Block::new(block.size);
                expired += 1;
            }
        }
        if expired > 0 {
            debug!("Piece {}: {} pending block(s) timed out", self.index, expired);
        }
        expired
    }

    /// Store a received block. Returns whether it was accepted.
    ///
    /// The first delivery of a block wins; later duplicates are ignored.
    pub fn set_block(&mut self, offset: usize, data: Bytes) -> bool {
        if self.is_full || offset % BLOCK_SIZE != 0 {
            return false;
        }

        match self.blocks.get_mut(offset / BLOCK_SIZE) {
            Some(block) if block.state != BlockState::Full && block.size == data.len() => {
                block.fill(data);
                true
            }
            _ => false,
        }
    }

    /// Claim the first FREE block for a request
    pub fn get_empty_block(&mut self) -> Option<BlockInfo> {
        self.claim_block_at(Instant::now())
    }

    pub fn claim_block_at(&mut self, now: Instant) -> Option<BlockInfo> {
        if self.is_full {
            return None;
        }

        let (block_index, block) = self
            .blocks
            .iter_mut()
            .enumerate()
            .find(|(_, b)| b.state == BlockState::Free)?;
        block.claim(now);

        Some(BlockInfo::new(
            self.index as u32,
            (block_index * BLOCK_SIZE) as u32,
            block.size as u32,
        ))
    }

    pub fn are_all_blocks_full(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Full)
    }

    /// Concatenate block data in order
    pub fn merge_blocks(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size);
        for block in &self.blocks {
            if let Some(data) = &block.data {
                buf.extend_from_slice(data);
            }
        }
        buf
    }

    /// Hash the merged blocks. On mismatch every block goes back to FREE.
    pub fn verify(&mut self) -> Result<Vec<u8>> {
        let data = self.merge_blocks();
        if data.len() == self.size && self.hash.matches(&data) {
            return Ok(data);
        }

        warn!(
            "Piece {} hash mismatch: expected {}, got {}",
            self.index,
            hex::encode(self.hash.as_bytes()),
            hex::encode(PieceHash::of(&data).as_bytes())
        );
        self.init_blocks();
        Err(BittorrentError::HashMismatch(self.index))
    }

    /// Verify, persist and mark the piece full.
    ///
    /// A piece only becomes full once its bytes are on storage; a failed
    /// write sends it back to FREE blocks like a failed hash does.
    pub async fn set_to_full(&mut self, storage: &dyn Storage) -> Result<()> {
        let data = self.verify()?;

        if let Err(e) = storage.write(&self.file_ranges, &data).await {
            self.init_blocks();
            return Err(e);
        }

        self.is_full = true;
        self.clear();
        Ok(())
    }

    /// Read back a sub-range of a persisted piece
    pub async fn get_block(&self, storage: &dyn Storage, block_offset: usize, block_length: usize) -> Result<Bytes> {
        storage.read(&self.file_ranges, block_offset, block_length).await
    }

    pub(crate) fn mark_verified(&mut self) {
        self.is_full = true;
    }

    pub(crate) fn unmark_verified(&mut self) {
        self.is_full = false;
        self.init_blocks();
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn hash(&self) -> &PieceHash {
        &self.hash
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn is_active(&self) -> bool {
        self.is_active > 0
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn file_ranges(&self) -> &[FileRange] {
        &self.file_ranges
    }

    /// Whether `start..end` lies inside the bytes this piece writes out.
    /// Parts of the piece owned by unselected files are never stored.
    pub fn covers(&self, start: usize, end: usize) -> bool {
        let mut ranges: Vec<&FileRange> = self.file_ranges.iter().collect();
        ranges.sort_by_key(|r| r.piece_offset);

        let mut reached = start;
        for range in ranges {
            if reached >= end {
                break;
            }
            if range.piece_offset > reached {
                return false;
            }
            reached = reached.max(range.piece_end());
        }
        reached >= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::path::PathBuf;
    use std::time::Duration;

    fn piece_for(data: &[u8]) -> Piece {
        let mut piece = Piece::new(0, data.len(), PieceHash::of(data));
        piece.is_active = 1;
        piece.file_ranges = vec![FileRange {
            path: PathBuf::from("out"),
            file_offset: 0,
            piece_offset: 0,
            length: data.len(),
            file_id: 0,
            piece_index: 0,
        }];
        piece
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_blocks_cover_piece() {
        let piece = Piece::new(3, 2 * BLOCK_SIZE + 100, PieceHash::new([0u8; 20]));
        let sizes: Vec<_> = piece.blocks().iter().map(|b| b.size).collect();
        assert_eq!(sizes, vec![BLOCK_SIZE, BLOCK_SIZE, 100]);
        assert!(piece.blocks().iter().all(|b| b.state == BlockState::Free));
    }

    #[test]
    fn test_claims_are_exclusive_until_expiry() {
        let mut piece = Piece::new(7, 2 * BLOCK_SIZE, PieceHash::new([0u8; 20]));
        let start = Instant::now();

        let first = piece.claim_block_at(start).unwrap();
        let second = piece.claim_block_at(start).unwrap();
        assert_eq!(first, BlockInfo::new(7, 0, BLOCK_SIZE as u32));
        assert_eq!(second, BlockInfo::new(7, BLOCK_SIZE as u32, BLOCK_SIZE as u32));
        assert!(piece.claim_block_at(start).is_none());

        assert_eq!(piece.expire_pending(start + Duration::from_secs(5)), 0);
        assert!(piece.claim_block_at(start).is_none());

        assert_eq!(piece.expire_pending(start + Duration::from_secs(6)), 2);
        assert_eq!(piece.claim_block_at(start), Some(first));
    }

    #[test]
    fn test_set_block_rejects_duplicates_and_bad_shapes() {
        let data = content(BLOCK_SIZE + 10);
        let mut piece = piece_for(&data);

        assert!(piece.set_block(0, Bytes::copy_from_slice(&data[..BLOCK_SIZE])));
        assert!(!piece.set_block(0, Bytes::from(vec![0u8; BLOCK_SIZE])));
        assert!(!piece.set_block(5, Bytes::from(vec![0u8; 10])));
        assert!(!piece.set_block(BLOCK_SIZE, Bytes::from(vec![0u8; 9])));
        assert!(!piece.set_block(3 * BLOCK_SIZE, Bytes::from(vec![0u8; 10])));

        assert_eq!(&piece.merge_blocks()[..], &data[..BLOCK_SIZE]);
    }

    #[tokio::test]
    async fn test_set_to_full_persists_and_clears() {
        let data = content(BLOCK_SIZE + 10);
        let mut piece = piece_for(&data);
        let storage = MemoryStorage::new();

        piece.set_block(0, Bytes::copy_from_slice(&data[..BLOCK_SIZE]));
        piece.set_block(BLOCK_SIZE, Bytes::copy_from_slice(&data[BLOCK_SIZE..]));
        assert!(piece.are_all_blocks_full());

        piece.set_to_full(&storage).await.unwrap();

        assert!(piece.is_full());
        assert!(piece.blocks().iter().all(|b| b.state == BlockState::Full && b.data.is_none()));
        assert_eq!(storage.file("out").unwrap(), data);
        assert!(piece.get_empty_block().is_none());
        assert!(!piece.set_block(0, Bytes::copy_from_slice(&data[..BLOCK_SIZE])));

        let block = piece.get_block(&storage, BLOCK_SIZE, 10).await.unwrap();
        assert_eq!(&block[..], &data[BLOCK_SIZE..]);
    }

    #[tokio::test]
    async fn test_corrupted_piece_is_never_full() {
        let data = content(BLOCK_SIZE + 10);
        let mut piece = piece_for(&data);
        let storage = MemoryStorage::new();

        let mut corrupted = data.clone();
        corrupted[3] ^= 0xff;
        piece.set_block(0, Bytes::copy_from_slice(&corrupted[..BLOCK_SIZE]));
        piece.set_block(BLOCK_SIZE, Bytes::copy_from_slice(&corrupted[BLOCK_SIZE..]));

        let err = piece.set_to_full(&storage).await.unwrap_err();
        assert!(matches!(err, BittorrentError::HashMismatch(0)));
        assert!(!piece.is_full());
        assert!(piece.blocks().iter().all(|b| b.state == BlockState::Free && b.data.is_none()));
        assert!(storage.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_resets_piece() {
        let data = content(10);
        let mut piece = piece_for(&data);
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);

        piece.set_block(0, Bytes::copy_from_slice(&data));
        let err = piece.set_to_full(&storage).await.unwrap_err();

        assert!(matches!(err, BittorrentError::StorageFailure(_)));
        assert!(!piece.is_full());
        assert!(piece.blocks().iter().all(|b| b.state == BlockState::Free));
    }
}
