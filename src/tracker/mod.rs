//! Peer discovery: where the addresses the download driver connects to
//! come from.

mod client;
mod request;
mod response;

pub use client::HttpTracker;
pub use request::{TrackerEvent, TrackerRequest};
pub use response::TrackerResponse;

use crate::error::Result;
use crate::torrent::Descriptor;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Yields a deduplicated pool of peer addresses for a torrent
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn discover(&self, descriptor: &Descriptor) -> Result<Vec<SocketAddr>>;
}

/// A fixed list of peers, e.g. from the command line
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: Vec<SocketAddr>,
}

impl StaticPeers {
    pub fn new(peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut seen = HashSet::new();
        Self {
            peers: peers.into_iter().filter(|addr| seen.insert(*addr)).collect(),
        }
    }
}

#[async_trait]
impl PeerSource for StaticPeers {
    async fn discover(&self, _descriptor: &Descriptor) -> Result<Vec<SocketAddr>> {
        Ok(self.peers.clone())
    }
}

/// Generate a random peer ID
/// Format: -SF0001-<12 random chars>
pub fn generate_peer_id() -> [u8; 20] {
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-SF0001-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = CHARSET[rng.gen_range(0..CHARSET.len())];
    }

    peer_id
}
