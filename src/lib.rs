//! Swarm download engine: piece/block assembly, the peer wire protocol and
//! a driver that pulls a selection of a torrent's files from its peers.

pub mod bencode;
pub mod bitfield;
pub mod client;
pub mod error;
pub mod peer;
pub mod piece;
pub mod sink;
pub mod storage;
pub mod torrent;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use client::{CancelHandle, ClientConfig, DownloadOutcome, RunState, Selection, TorrentClient};
pub use error::{BittorrentError, Result};
