//! Block/piece assembly: which blocks of which piece we have, hash
//! verification, and the mapping of piece bytes onto output files.

mod assembly;
mod block;
mod layout;
mod manager;

pub use assembly::Piece;
pub use block::{Block, BlockState, BLOCK_SIZE, PENDING_TIMEOUT};
pub use layout::{map_files, FileRange};
pub use manager::{PieceManager, GROUP_PIECES_NUM};
