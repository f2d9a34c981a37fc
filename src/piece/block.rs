use bytes::Bytes;
use std::time::{Duration, Instant};

/// Standard block size (16 KB)
pub const BLOCK_SIZE: usize = 16 * 1024;

/// How long a claimed block may go unanswered before it is handed out again
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Nobody has been asked for it
    Free,
    /// Requested from a peer, waiting for data
    Pending,
    /// Data received (or piece already persisted)
    Full,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub size: usize,
    pub state: BlockState,
    pub data: Option<Bytes>,
    pub last_seen: Instant,
}

impl Block {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            state: BlockState::Free,
            data: None,
            last_seen: Instant::now(),
        }
    }

    /// A FULL block whose bytes already live on storage
    pub fn persisted(size: usize) -> Self {
        Self {
            state: BlockState::Full,
            ..Self::new(size)
        }
    }

    pub fn claim(&mut self, now: Instant) {
        self.state = BlockState::Pending;
        self.last_seen = now;
    }

    pub fn fill(&mut self, data: Bytes) {
        self.data = Some(data);
        self.state = BlockState::Full;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.state == BlockState::Pending
            && now.saturating_duration_since(self.last_seen) > PENDING_TIMEOUT
    }
}

/// Split `piece_size` into block sizes; the last one takes the remainder.
pub fn block_sizes(piece_size: usize) -> Vec<usize> {
    if piece_size <= BLOCK_SIZE {
        return vec![piece_size];
    }

    let mut sizes = vec![BLOCK_SIZE; piece_size / BLOCK_SIZE];
    if piece_size % BLOCK_SIZE > 0 {
        sizes.push(piece_size % BLOCK_SIZE);
    }
    sizes
}
