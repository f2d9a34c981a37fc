use super::layout::map_files;
use super::{FileRange, Piece};
use crate::bitfield::Bitfield;
use crate::error::{BittorrentError, Result};
use crate::storage::Storage;
use crate::torrent::Descriptor;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

/// Pieces written together in sequential mode
pub const GROUP_PIECES_NUM: usize = 32;

/// Owns every piece of a torrent, the local bitfield and the file layout
pub struct PieceManager {
    pieces: Vec<Piece>,
    bitfield: Bitfield,
    file_ranges: Vec<FileRange>,
    storage: Arc<dyn Storage>,
    sequential: bool,
    number_of_active_pieces: usize,
    completed_pieces: usize,
    total_active_size: u64,
    completed_size: u64,
}

impl PieceManager {
    /// Build the piece table for the files listed in `selection`
    /// (indices into `descriptor.files`).
    pub fn new(
        descriptor: &Descriptor,
        selection: &BTreeSet<usize>,
        storage: Arc<dyn Storage>,
        sequential: bool,
    ) -> Self {
        let mut pieces: Vec<Piece> = descriptor
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| Piece::new(index, descriptor.piece_size(index) as usize, *hash))
            .collect();

        let piece_sizes: Vec<usize> = pieces.iter().map(Piece::size).collect();
        let file_ranges = map_files(&descriptor.files, descriptor.piece_length, &piece_sizes);

        for range in &file_ranges {
            if selection.contains(&range.file_id) {
                let piece = &mut pieces[range.piece_index];
                piece.is_active += 1;
                piece.file_ranges.push(range.clone());
            }
        }

        let number_of_active_pieces = pieces.iter().filter(|p| p.is_active()).count();
        let total_active_size = pieces
            .iter()
            .filter(|p| p.is_active())
            .map(|p| p.size() as u64)
            .sum();

        info!(
            "Piece table: {} pieces, {} active ({} bytes){}",
            pieces.len(),
            number_of_active_pieces,
            total_active_size,
            if sequential { ", sequential writes" } else { "" }
        );

        Self {
            bitfield: Bitfield::new(pieces.len()),
            pieces,
            file_ranges,
            storage,
            sequential,
            number_of_active_pieces,
            completed_pieces: 0,
            total_active_size,
            completed_size: 0,
        }
    }

    /// Route a received block to the per-piece or grouped path
    pub async fn receive_block(&mut self, piece_index: usize, offset: usize, data: Bytes) -> Result<bool> {
        if self.sequential {
            self.receive_block_piece_seq(piece_index, offset, data).await
        } else {
            self.receive_block_piece(piece_index, offset, data).await
        }
    }

    /// Store a block; verify and persist the piece once it is complete.
    ///
    /// Returns `true` when this block completed its piece.
    pub async fn receive_block_piece(&mut self, piece_index: usize, offset: usize, data: Bytes) -> Result<bool> {
        let piece = self
            .pieces
            .get_mut(piece_index)
            .ok_or_else(|| unknown_piece(piece_index))?;

        if piece.is_full() || !piece.is_active() {
            return Ok(false);
        }
        if !piece.set_block(offset, data) || !piece.are_all_blocks_full() {
            return Ok(false);
        }

        piece.set_to_full(self.storage.as_ref()).await?;

        self.completed_pieces += 1;
        self.completed_size += piece.size() as u64;
        self.bitfield.set(piece_index);
        debug!("Piece {} verified and written", piece_index);
        Ok(true)
    }

    /// Grouped variant: pieces are verified as they complete, but only
    /// written once every active piece of their group is verified.
    ///
    /// Returns `true` when this block caused its group to be written.
    pub async fn receive_block_piece_seq(&mut self, piece_index: usize, offset: usize, data: Bytes) -> Result<bool> {
        let piece = self
            .pieces
            .get_mut(piece_index)
            .ok_or_else(|| unknown_piece(piece_index))?;

        if piece.is_full() || !piece.is_active() || !piece.set_block(offset, data) {
            return Ok(false);
        }

        let group_index = piece_index / GROUP_PIECES_NUM;
        if !self.is_group_full(group_index)? {
            return Ok(false);
        }

        self.write_group(group_index).await?;
        Ok(true)
    }

    /// Verify every complete-but-unverified piece of the group, then report
    /// whether all of its active pieces are verified.
    pub fn is_group_full(&mut self, group_index: usize) -> Result<bool> {
        let range = self.group_range(group_index);

        for piece in &mut self.pieces[range.clone()] {
            if piece.is_active() && !piece.is_full() && piece.are_all_blocks_full() {
                piece.verify()?;
                piece.mark_verified();
                self.completed_pieces += 1;
                self.completed_size += piece.size() as u64;
            }
        }

        Ok(self.pieces[range]
            .iter()
            .all(|p| !p.is_active() || p.is_full()))
    }

    /// Write a verified group with one storage call per output file.
    ///
    /// Inactive pieces are zero-filled in the group buffer so offsets line
    /// up; their ranges are never written.
    pub async fn write_group(&mut self, group_index: usize) -> Result<()> {
        let range = self.group_range(group_index);
        let mut data = Vec::new();
        let mut ranges: Vec<FileRange> = Vec::new();

        for piece in &self.pieces[range.clone()] {
            let base = data.len();
            if piece.is_active() {
                data.extend_from_slice(&piece.merge_blocks());
                for file_range in piece.file_ranges() {
                    push_coalesced(&mut ranges, file_range, base);
                }
            } else {
                data.resize(base + piece.size(), 0);
            }
        }

        let mut file_ids: Vec<usize> = ranges.iter().map(|r| r.file_id).collect();
        file_ids.dedup();

        for file_id in file_ids {
            let file_ranges: Vec<FileRange> = ranges
                .iter()
                .filter(|r| r.file_id == file_id)
                .cloned()
                .collect();

            if let Err(e) = self.storage.write(&file_ranges, &data).await {
                self.unverify_group(range.clone());
                return Err(e);
            }
        }

        for piece in &mut self.pieces[range] {
            if piece.is_active() {
                self.bitfield.set(piece.index());
                piece.clear();
            }
        }

        debug!("Group {} written ({} bytes)", group_index, data.len());
        Ok(())
    }

    fn unverify_group(&mut self, range: Range<usize>) {
        for piece in &mut self.pieces[range] {
            if piece.is_active() && piece.is_full() {
                piece.unmark_verified();
                self.completed_pieces -= 1;
                self.completed_size -= piece.size() as u64;
            }
        }
    }

    /// Serve a block of a persisted piece; `None` if we don't have it.
    pub async fn get_block(&self, piece_index: usize, block_offset: usize, block_length: usize) -> Result<Option<Bytes>> {
        let piece = self
            .pieces
            .get(piece_index)
            .ok_or_else(|| unknown_piece(piece_index))?;

        if block_offset + block_length > piece.size() {
            return Err(BittorrentError::ProtocolViolation(format!(
                "Request {}..{} outside piece {} of {} bytes",
                block_offset,
                block_offset + block_length,
                piece_index,
                piece.size()
            )));
        }

        if !self.bitfield.has(piece_index) || !piece.covers(block_offset, block_offset + block_length) {
            return Ok(None);
        }

        piece
            .get_block(self.storage.as_ref(), block_offset, block_length)
            .await
            .map(Some)
    }

    /// True once every active piece is verified. Never true without any
    /// active piece.
    pub fn all_pieces_completed(&self) -> bool {
        self.number_of_active_pieces > 0
            && self
                .pieces
                .iter()
                .all(|p| !p.is_active() || p.is_full())
    }

    /// Active pieces still missing, in index order
    pub fn outstanding_pieces(&self) -> Vec<usize> {
        self.pieces
            .iter()
            .filter(|p| p.is_active() && !p.is_full())
            .map(Piece::index)
            .collect()
    }

    pub fn percentage_completed(&self) -> f64 {
        if self.number_of_active_pieces == 0 {
            return 0.0;
        }
        self.completed_pieces as f64 / self.number_of_active_pieces as f64 * 100.0
    }

    fn group_range(&self, group_index: usize) -> Range<usize> {
        let start = (group_index * GROUP_PIECES_NUM).min(self.pieces.len());
        let end = (start + GROUP_PIECES_NUM).min(self.pieces.len());
        start..end
    }

    pub fn number_of_groups(&self) -> usize {
        self.pieces.len().div_ceil(GROUP_PIECES_NUM)
    }

    pub fn piece(&self, index: usize) -> Option<&Piece> {
        self.pieces.get(index)
    }

    pub fn piece_mut(&mut self, index: usize) -> Option<&mut Piece> {
        self.pieces.get_mut(index)
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Pieces we can serve whole: persisted and stored entirely, unlike
    /// pieces shared with an unselected file.
    pub fn servable_bitfield(&self) -> Bitfield {
        let mut servable = self.bitfield.clone();
        for piece in &self.pieces {
            if servable.has(piece.index()) && !piece.covers(0, piece.size()) {
                servable.clear(piece.index());
            }
        }
        servable
    }

    pub fn file_ranges(&self) -> &[FileRange] {
        &self.file_ranges
    }

    pub fn number_of_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn number_of_active_pieces(&self) -> usize {
        self.number_of_active_pieces
    }

    pub fn completed_pieces(&self) -> usize {
        self.completed_pieces
    }

    pub fn total_active_size(&self) -> u64 {
        self.total_active_size
    }

    pub fn completed_size(&self) -> u64 {
        self.completed_size
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }
}

/// Append `range` (shifted by `base` into the group buffer), merging it
/// into the previous range of the same file when both are contiguous.
fn push_coalesced(ranges: &mut Vec<FileRange>, range: &FileRange, base: usize) {
    let piece_offset = base + range.piece_offset;

    if let Some(last) = ranges.iter_mut().rev().find(|r| r.file_id == range.file_id) {
        if last.file_end() == range.file_offset && last.piece_end() == piece_offset {
            last.length += range.length;
            return;
        }
    }

    ranges.push(FileRange {
        piece_offset,
        ..range.clone()
    });
}

fn unknown_piece(index: usize) -> BittorrentError {
    BittorrentError::ProtocolViolation(format!("Unknown piece index {}", index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::{BlockState, BLOCK_SIZE};
    use crate::storage::MemoryStorage;
    use crate::test_support::{content, descriptor_for, select};

    fn table(
        files: &[(&str, u64)],
        data: &[u8],
        piece_length: u64,
        selection: &[usize],
        sequential: bool,
    ) -> (PieceManager, Arc<MemoryStorage>) {
        let descriptor = descriptor_for(files, data, piece_length);
        let storage = Arc::new(MemoryStorage::new());
        let manager = PieceManager::new(&descriptor, &select(selection), storage.clone(), sequential);
        (manager, storage)
    }

    /// Deliver every block of every outstanding piece
    async fn feed_all(manager: &mut PieceManager, data: &[u8], piece_length: usize) {
        for index in manager.outstanding_pieces() {
            let start = index * piece_length;
            let size = manager.piece(index).unwrap().size();
            for offset in (0..size).step_by(BLOCK_SIZE) {
                let end = (offset + BLOCK_SIZE).min(size);
                let block = Bytes::copy_from_slice(&data[start + offset..start + end]);
                manager.receive_block(index, offset, block).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_single_piece_completes_with_one_write() {
        let payload = b"0123456789".to_vec();
        let (mut manager, storage) = table(&[("file", 10)], &payload, 10, &[0], false);

        let completed = manager
            .receive_block_piece(0, 0, Bytes::from(payload.clone()))
            .await
            .unwrap();

        assert!(completed);
        assert_eq!(manager.completed_pieces(), 1);
        assert!(manager.all_pieces_completed());
        assert!(manager.bitfield().has(0));

        let writes = storage.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].ranges.len(), 1);
        assert_eq!(writes[0].ranges[0].file_offset, 0);
        assert_eq!(writes[0].ranges[0].length, 10);
        assert_eq!(storage.file("file").unwrap(), payload);
    }

    #[tokio::test]
    async fn test_corrupted_single_piece_is_retried() {
        let payload = b"0123456789".to_vec();
        let (mut manager, storage) = table(&[("file", 10)], &payload, 10, &[0], false);

        let err = manager
            .receive_block_piece(0, 0, Bytes::from_static(b"0123456780"))
            .await
            .unwrap_err();

        assert!(matches!(err, BittorrentError::HashMismatch(0)));
        assert_eq!(manager.completed_pieces(), 0);
        assert!(!manager.all_pieces_completed());
        assert!(!manager.bitfield().has(0));
        assert!(storage.writes().is_empty());
        let piece = manager.piece(0).unwrap();
        assert!(piece.blocks().iter().all(|b| b.state == BlockState::Free));

        assert!(manager.receive_block_piece(0, 0, Bytes::from(payload)).await.unwrap());
        assert_eq!(manager.completed_pieces(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let data = content(2 * BLOCK_SIZE);
        let (mut manager, storage) = table(&[("f", data.len() as u64)], &data, 2 * BLOCK_SIZE as u64, &[0], false);

        let first = Bytes::copy_from_slice(&data[..BLOCK_SIZE]);
        let second = Bytes::copy_from_slice(&data[BLOCK_SIZE..]);

        assert!(!manager.receive_block_piece(0, 0, first.clone()).await.unwrap());
        assert!(!manager.receive_block_piece(0, 0, first.clone()).await.unwrap());
        assert!(manager.receive_block_piece(0, BLOCK_SIZE, second.clone()).await.unwrap());
        assert!(!manager.receive_block_piece(0, BLOCK_SIZE, second).await.unwrap());
        assert!(!manager.receive_block_piece(0, 0, first).await.unwrap());

        assert_eq!(manager.completed_pieces(), 1);
        assert_eq!(storage.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_piece_is_protocol_violation() {
        let data = content(10);
        let (mut manager, _) = table(&[("f", 10)], &data, 10, &[0], false);

        let err = manager.receive_block(4, 0, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, BittorrentError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_two_file_layout_reconstructs_both_files() {
        let data = content(8000);
        let (mut manager, storage) = table(&[("a", 5000), ("b", 3000)], &data, 4096, &[0, 1], false);

        for piece in manager.pieces() {
            let total: usize = piece.file_ranges().iter().map(|r| r.length).sum();
            assert_eq!(total, piece.size());
        }
        for (file_id, length) in [(0usize, 5000usize), (1, 3000)] {
            let total: usize = manager
                .file_ranges()
                .iter()
                .filter(|r| r.file_id == file_id)
                .map(|r| r.length)
                .sum();
            assert_eq!(total, length);
        }

        feed_all(&mut manager, &data, 4096).await;

        assert!(manager.all_pieces_completed());
        assert_eq!(storage.file("a").unwrap(), &data[..5000]);
        assert_eq!(storage.file("b").unwrap(), &data[5000..]);
    }

    #[tokio::test]
    async fn test_selection_limits_active_pieces() {
        let data = content(3 * 4096);
        let (manager, _) = table(&[("a", 4096), ("b", 4096), ("c", 4096)], &data, 4096, &[1], false);

        assert_eq!(manager.number_of_active_pieces(), 1);
        assert_eq!(manager.outstanding_pieces(), vec![1]);
        assert_eq!(manager.total_active_size(), 4096);
        assert!(!manager.all_pieces_completed());
    }

    #[tokio::test]
    async fn test_piece_shared_by_two_selected_files_counts_each_file() {
        let data = content(8000);
        let (manager, _) = table(&[("a", 5000), ("b", 3000)], &data, 4096, &[0, 1], false);

        assert_eq!(manager.piece(1).unwrap().is_active, 2);
        assert_eq!(manager.number_of_active_pieces(), 2);
    }

    #[test]
    fn test_empty_selection_is_never_complete() {
        let data = content(10);
        let descriptor = descriptor_for(&[("f", 10)], &data, 10);
        let manager = PieceManager::new(&descriptor, &BTreeSet::new(), Arc::new(MemoryStorage::new()), false);

        assert_eq!(manager.number_of_active_pieces(), 0);
        assert!(!manager.all_pieces_completed());
        assert_eq!(manager.percentage_completed(), 0.0);
    }

    #[tokio::test]
    async fn test_get_block_only_serves_persisted_pieces() {
        let data = content(8000);
        let (mut manager, _) = table(&[("a", 5000), ("b", 3000)], &data, 4096, &[0, 1], false);

        assert_eq!(manager.get_block(1, 0, 100).await.unwrap(), None);

        feed_all(&mut manager, &data, 4096).await;

        let block = manager.get_block(1, 900, 100).await.unwrap().unwrap();
        assert_eq!(&block[..], &data[4096 + 900..4096 + 1000]);
        assert!(manager.get_block(1, 3900, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_piece_shared_with_unselected_file_is_not_served() {
        let data = content(8000);
        let (mut manager, _) = table(&[("a", 5000), ("b", 3000)], &data, 4096, &[1], false);

        feed_all(&mut manager, &data, 4096).await;
        assert!(manager.all_pieces_completed());
        assert!(manager.bitfield().has(1));
        assert!(!manager.servable_bitfield().has(1));

        // bytes 0..904 of piece 1 belong to "a", which was never written
        assert_eq!(manager.get_block(1, 0, 100).await.unwrap(), None);
        assert_eq!(manager.get_block(1, 900, 100).await.unwrap(), None);

        let block = manager.get_block(1, 904, 100).await.unwrap().unwrap();
        assert_eq!(&block[..], &data[5000..5100]);
    }

    #[tokio::test]
    async fn test_sequential_mode_writes_group_once() {
        let piece_length = 1024usize;
        let data = content(40 * piece_length);
        let (mut manager, storage) = table(
            &[("a", 10 * 1024), ("b", 30 * 1024)],
            &data,
            piece_length as u64,
            &[0, 1],
            true,
        );
        assert_eq!(manager.number_of_groups(), 2);

        // Everything of group 1 arrives first; nothing is written until it is whole.
        for index in 32..39 {
            let start = index * piece_length;
            let block = Bytes::copy_from_slice(&data[start..start + piece_length]);
            assert!(!manager.receive_block(index, 0, block).await.unwrap());
        }
        assert!(storage.writes().is_empty());
        assert_eq!(manager.completed_pieces(), 7);
        assert!(!manager.bitfield().has(32));

        feed_all(&mut manager, &data, piece_length).await;

        assert!(manager.all_pieces_completed());
        assert_eq!(manager.completed_pieces(), 40);
        assert_eq!(manager.bitfield().count_ones(), 40);
        assert_eq!(storage.file("a").unwrap(), &data[..10 * 1024]);
        assert_eq!(storage.file("b").unwrap(), &data[10 * 1024..]);

        // group 0 touches both files, group 1 only "b"; ranges are coalesced
        let writes = storage.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.ranges.len() == 1));
    }

    #[tokio::test]
    async fn test_sequential_mode_pads_inactive_pieces() {
        let piece_length = 1024usize;
        let data = content(3 * piece_length);
        let (mut manager, storage) = table(
            &[("skip", 1024), ("keep", 2048)],
            &data,
            piece_length as u64,
            &[1],
            true,
        );

        feed_all(&mut manager, &data, piece_length).await;

        assert!(manager.all_pieces_completed());
        assert_eq!(storage.file("keep").unwrap(), &data[1024..]);
        assert!(storage.file("skip").is_none());
        let writes = storage.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data_len, 3 * piece_length);
        assert_eq!(writes[0].ranges[0].piece_offset, 1024);
    }

    #[tokio::test]
    async fn test_sequential_hash_failure_resets_only_that_piece() {
        let piece_length = 1024usize;
        let data = content(2 * piece_length);
        let (mut manager, storage) = table(&[("f", 2048)], &data, piece_length as u64, &[0], true);

        manager
            .receive_block(0, 0, Bytes::copy_from_slice(&data[..1024]))
            .await
            .unwrap();
        let err = manager
            .receive_block(1, 0, Bytes::from(vec![0u8; 1024]))
            .await
            .unwrap_err();

        assert!(matches!(err, BittorrentError::HashMismatch(1)));
        assert!(manager.piece(0).unwrap().is_full());
        assert!(!manager.piece(1).unwrap().is_full());
        assert!(storage.writes().is_empty());

        assert!(manager
            .receive_block(1, 0, Bytes::copy_from_slice(&data[1024..]))
            .await
            .unwrap());
        assert_eq!(storage.file("f").unwrap(), data);
    }

    #[tokio::test]
    async fn test_sequential_write_failure_unverifies_group() {
        let piece_length = 1024usize;
        let data = content(piece_length);
        let (mut manager, storage) = table(&[("f", 1024)], &data, piece_length as u64, &[0], true);
        storage.set_fail_writes(true);

        let err = manager
            .receive_block(0, 0, Bytes::from(data.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, BittorrentError::StorageFailure(_)));
        assert_eq!(manager.completed_pieces(), 0);
        assert_eq!(manager.outstanding_pieces(), vec![0]);
    }
}
