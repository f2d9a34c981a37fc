mod descriptor;
mod metainfo;
mod piece;

pub use descriptor::{Descriptor, FileEntry};
pub use piece::{PieceHash, Pieces};

use crate::error::Result;
use std::path::Path;
use tokio::fs;

/// Load a .torrent file into a descriptor
pub async fn load_torrent_file<P: AsRef<Path>>(path: P, peer_id: [u8; 20]) -> Result<Descriptor> {
    let data = fs::read(path).await?;
    Descriptor::from_torrent_bytes(&data, peer_id)
}
