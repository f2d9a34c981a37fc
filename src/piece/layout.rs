use crate::torrent::FileEntry;
use std::path::PathBuf;

/// One contiguous slice of a piece stored in one output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRange {
    pub path: PathBuf,
    /// Byte offset inside the output file
    pub file_offset: u64,
    /// Byte offset inside the piece (or group buffer)
    pub piece_offset: usize,
    pub length: usize,
    /// Position of the file in the torrent's file list
    pub file_id: usize,
    pub piece_index: usize,
}

impl FileRange {
    pub fn piece_end(&self) -> usize {
        self.piece_offset + self.length
    }

    pub fn file_end(&self) -> u64 {
        self.file_offset + self.length as u64
    }
}

/// Cut the file list into per-piece ranges.
///
/// Files are consumed in order; `piece_size_used` carries how much of the
/// current piece earlier files already filled. Zero-length files yield no
/// range. `piece_sizes` must cover the files' total length.
pub fn map_files(files: &[FileEntry], piece_length: u64, piece_sizes: &[usize]) -> Vec<FileRange> {
    let mut ranges = Vec::new();
    let mut global_offset = 0u64;
    let mut piece_size_used = 0usize;

    for (file_id, file) in files.iter().enumerate() {
        let mut remaining = file.length;
        let mut file_offset = 0u64;

        while remaining > 0 {
            let piece_index = (global_offset / piece_length) as usize;
            let Some(&piece_size) = piece_sizes.get(piece_index) else {
                break;
            };
            let room = (piece_size - piece_size_used) as u64;
            let length = remaining.min(room);

            ranges.push(FileRange {
                path: file.path.clone(),
                file_offset,
                piece_offset: piece_size_used,
                length: length as usize,
                file_id,
                piece_index,
            });

            remaining -= length;
            file_offset += length;
            global_offset += length;
            piece_size_used = if length == room {
                0
            } else {
                piece_size_used + length as usize
            };
        }
    }

    ranges
}
