use super::{PeerMessage, PeerState};
use crate::bitfield::Bitfield;
use crate::error::{BittorrentError, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Protocol state of a peer as seen from our side
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub state: PeerState,
    pub bitfield: Bitfield,
}

/// Shared side of a connected peer: the write half, choke/interest flags
/// and the remote bitfield.
pub struct PeerHandle {
    addr: SocketAddr,
    peer_id: [u8; 20],
    writer: tokio::sync::Mutex<Writer>,
    status: Mutex<PeerStatus>,
    healthy: AtomicBool,
}

impl PeerHandle {
    pub fn new(addr: SocketAddr, peer_id: [u8; 20], writer: Writer, number_of_pieces: usize) -> Self {
        Self {
            addr,
            peer_id,
            writer: tokio::sync::Mutex::new(writer),
            status: Mutex::new(PeerStatus {
                state: PeerState::default(),
                bitfield: Bitfield::new(number_of_pieces),
            }),
            healthy: AtomicBool::new(true),
        }
    }

    /// Send a message to the peer. A failed write marks it unhealthy.
    pub async fn send(&self, message: &PeerMessage) -> Result<()> {
        let bytes = message.to_bytes();
        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            self.mark_unhealthy();
            return Err(BittorrentError::PeerUnreachable(format!("{}: {}", self.addr, e)));
        }

        // Update our state based on what we sent
        let mut status = self.status.lock();
        match message {
            PeerMessage::Choke => status.state.am_choking = true,
            PeerMessage::Unchoke => status.state.am_choking = false,
            PeerMessage::Interested => status.state.am_interested = true,
            PeerMessage::NotInterested => status.state.am_interested = false,
            _ => {}
        }
        drop(status);

        debug!("Sent message to {}: {}", self.addr, describe(message));
        Ok(())
    }

    /// Apply the state effects of an inbound message.
    ///
    /// Returns the reply owed right away: `Interested` after the first
    /// Have/Bitfield (also when the peer unchoked us before announcing its
    /// pieces), `Unchoke` to a peer that wants our pieces.
    pub fn apply(&self, message: &PeerMessage) -> Result<Option<PeerMessage>> {
        let mut status = self.status.lock();
        match message {
            PeerMessage::Choke => status.state.peer_choking = true,
            PeerMessage::Unchoke => status.state.peer_choking = false,
            PeerMessage::Interested => {
                status.state.peer_interested = true;
                if status.state.am_choking {
                    return Ok(Some(PeerMessage::Unchoke));
                }
            }
            PeerMessage::NotInterested => status.state.peer_interested = false,
            PeerMessage::Have { piece_index } => {
                let index = *piece_index as usize;
                if index >= status.bitfield.len() {
                    return Err(BittorrentError::ProtocolViolation(format!(
                        "Have for piece {} of {}",
                        index,
                        status.bitfield.len()
                    )));
                }
                status.bitfield.set(index);
                return Ok(Self::want_interest(&mut status));
            }
            PeerMessage::Bitfield { bitfield } => {
                status.bitfield = Bitfield::from_bytes(bitfield, status.bitfield.len());
                return Ok(Self::want_interest(&mut status));
            }
            PeerMessage::KeepAlive
            | PeerMessage::Request { .. }
            | PeerMessage::Piece { .. }
            | PeerMessage::Cancel { .. }
            | PeerMessage::Port { .. } => {}
        }
        Ok(None)
    }

    fn want_interest(status: &mut PeerStatus) -> Option<PeerMessage> {
        if !status.state.am_interested {
            status.state.am_interested = true;
            Some(PeerMessage::Interested)
        } else {
            None
        }
    }

    /// Whether we may request `piece_index` from this peer now
    pub fn is_eligible(&self, piece_index: usize) -> bool {
        if !self.is_healthy() {
            return false;
        }
        let status = self.status.lock();
        !status.state.peer_choking && status.state.am_interested && status.bitfield.has(piece_index)
    }

    pub fn is_unchoked(&self) -> bool {
        !self.status.lock().state.peer_choking
    }

    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.status.lock().bitfield.has(piece_index)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> PeerStatus {
        self.status.lock().clone()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Close the write half; the remote sees EOF.
    pub async fn shutdown(&self) {
        self.mark_unhealthy();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.addr, e);
        }
    }
}

/// Short form for logs; block payloads are not dumped.
fn describe(message: &PeerMessage) -> String {
    match message {
        PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } => format!("Piece {{ piece_index: {}, offset: {}, len: {} }}", piece_index, offset, data.len()),
        PeerMessage::Bitfield { bitfield } => format!("Bitfield ({} bytes)", bitfield.len()),
        other => format!("{:?}", other),
    }
}
