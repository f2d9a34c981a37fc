//! Fixtures shared by unit tests: a recording sink, descriptors with real
//! piece hashes, and an in-memory swarm of scripted seeders.

use crate::bitfield::Bitfield;
use crate::client::ClientConfig;
use crate::peer::{BoxedStream, Connector, Handshake, PeerMessage, HANDSHAKE_LEN};
use crate::sink::{EventSink, Level};
use crate::torrent::{Descriptor, FileEntry, PieceHash};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Deterministic, non-repeating-per-piece test content
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Descriptor for `files` laid over `data`, with hashes computed from it
pub fn descriptor_for(files: &[(&str, u64)], data: &[u8], piece_length: u64) -> Descriptor {
    Descriptor {
        name: "fixture".to_string(),
        info_hash: *PieceHash::of(b"fixture").as_bytes(),
        peer_id: *b"-SF0001-testpeer0001",
        piece_length,
        pieces: data.chunks(piece_length as usize).map(PieceHash::of).collect(),
        total_length: data.len() as u64,
        files: files
            .iter()
            .map(|(path, length)| FileEntry::new(*path, *length))
            .collect(),
        announce_list: Vec::new(),
    }
}

pub fn select(indices: &[usize]) -> BTreeSet<usize> {
    indices.iter().copied().collect()
}

/// Short timers so driver tests finish in well under a second or two
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_secs(1),
        request_tick: Duration::from_millis(5),
        poll_interval: Duration::from_millis(20),
        stall_timeout: Duration::from_millis(300),
        max_retries: 1,
        ..ClientConfig::default()
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(Level, String)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(Level, String)> {
        self.events.lock().clone()
    }

    pub fn contains(&self, level: Level, text: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(l, message)| *l == level && message.contains(text))
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, level: Level, message: &str) {
        self.events.lock().push((level, message.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederBehavior {
    /// Advertises everything, unchokes, answers requests
    Serve,
    /// Like `Serve` but flips the first byte of every block
    Corrupt,
    /// Advertises everything, never unchokes
    Silent,
    /// Sends a frame with an unknown id right after the handshake
    Garbage,
    /// Closes the connection right after the handshake
    HangUp,
}

/// Connector whose addresses are scripted seeders over duplex pipes.
/// Unknown addresses refuse the connection.
pub struct SwarmConnector {
    info_hash: [u8; 20],
    piece_length: usize,
    number_of_pieces: usize,
    data: Arc<Vec<u8>>,
    seeders: Mutex<Vec<(SocketAddr, SeederBehavior)>>,
    attempts: Mutex<HashMap<SocketAddr, usize>>,
}

impl SwarmConnector {
    pub fn new(descriptor: &Descriptor, data: &[u8]) -> Self {
        Self {
            info_hash: descriptor.info_hash,
            piece_length: descriptor.piece_length as usize,
            number_of_pieces: descriptor.number_of_pieces(),
            data: Arc::new(data.to_vec()),
            seeders: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_seeder(&self, behavior: SeederBehavior) -> SocketAddr {
        let mut seeders = self.seeders.lock();
        let addr = SocketAddr::from(([127, 0, 0, 1], 7000 + seeders.len() as u16));
        seeders.push((addr, behavior));
        addr
    }

    pub fn seeders(&self) -> Vec<SocketAddr> {
        self.seeders.lock().iter().map(|(addr, _)| *addr).collect()
    }

    pub fn connect_attempts(&self, addr: SocketAddr) -> usize {
        self.attempts.lock().get(&addr).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for SwarmConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        *self.attempts.lock().entry(addr).or_default() += 1;

        let behavior = self
            .seeders
            .lock()
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, b)| *b)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no seeder"))?;

        let (local, remote) = tokio::io::duplex(256 * 1024);
        let seeder = Seeder {
            behavior,
            info_hash: self.info_hash,
            piece_length: self.piece_length,
            number_of_pieces: self.number_of_pieces,
            data: Arc::clone(&self.data),
        };
        tokio::spawn(async move {
            let _ = seeder.run(remote).await;
        });

        Ok(Box::new(local))
    }
}

struct Seeder {
    behavior: SeederBehavior,
    info_hash: [u8; 20],
    piece_length: usize,
    number_of_pieces: usize,
    data: Arc<Vec<u8>>,
}

impl Seeder {
    async fn run(self, mut stream: DuplexStream) -> io::Result<()> {
        let mut buf = BytesMut::new();
        while buf.len() < HANDSHAKE_LEN {
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
        buf.advance(HANDSHAKE_LEN);

        stream
            .write_all(&Handshake::new(self.info_hash, *b"-SEED01-seederseeder").to_bytes())
            .await?;

        if self.behavior == SeederBehavior::HangUp {
            return Ok(());
        }

        if self.behavior == SeederBehavior::Garbage {
            stream.write_all(&[0, 0, 0, 1, 42]).await?;
            while stream.read_buf(&mut buf).await? > 0 {}
            return Ok(());
        }

        let mut bitfield = Bitfield::new(self.number_of_pieces);
        for index in 0..self.number_of_pieces {
            bitfield.set(index);
        }
        stream
            .write_all(
                &PeerMessage::Bitfield {
                    bitfield: Bytes::copy_from_slice(bitfield.as_bytes()),
                }
                .to_bytes(),
            )
            .await?;

        if self.behavior != SeederBehavior::Silent {
            stream.write_all(&PeerMessage::Unchoke.to_bytes()).await?;
        }

        loop {
            while let Some(message) = PeerMessage::decode_frame(&mut buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            {
                if let PeerMessage::Request { block } = message {
                    if let Some(reply) = self.answer(block.piece_index, block.offset, block.length) {
                        stream.write_all(&reply.to_bytes()).await?;
                    }
                }
            }

            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    fn answer(&self, piece_index: u32, offset: u32, length: u32) -> Option<PeerMessage> {
        let start = piece_index as usize * self.piece_length + offset as usize;
        let mut block = self.data.get(start..start + length as usize)?.to_vec();
        if self.behavior == SeederBehavior::Corrupt {
            if let Some(first) = block.first_mut() {
                *first ^= 0xff;
            }
        }

        Some(PeerMessage::Piece {
            piece_index,
            offset,
            data: Bytes::from(block),
        })
    }
}
