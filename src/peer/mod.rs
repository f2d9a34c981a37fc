//! Peer wire protocol: framing, per-connection state and the registry of
//! live peers the download driver schedules requests over.

mod connection;
mod connector;
mod handle;
mod manager;
mod message;
mod protocol;

pub use connection::{establish, PeerConnection, Phase};
pub use connector::{BoxedStream, Connector, PeerStream, TcpConnector};
pub use handle::{PeerHandle, PeerStatus};
pub use manager::PeerManager;
pub use message::{BlockInfo, PeerMessage, MAX_FRAME_LEN};
pub use protocol::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};

// Peer connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}
