use super::{BoxedStream, Handshake, PeerHandle, PeerMessage};
use crate::error::{BittorrentError, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Handshaking,
    Connected,
}

/// Read side of a peer connection: buffering and framing
pub struct PeerConnection {
    addr: SocketAddr,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    buffer: BytesMut,
    phase: Phase,
    info_hash: [u8; 20],
}

impl PeerConnection {
    pub fn new(addr: SocketAddr, reader: Box<dyn AsyncRead + Send + Unpin>, info_hash: [u8; 20]) -> Self {
        Self {
            addr,
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            phase: Phase::Init,
            info_hash,
        }
    }

    /// Read until the remote handshake is complete and check its info hash
    pub async fn read_handshake(&mut self) -> Result<Handshake> {
        self.phase = Phase::Handshaking;
        loop {
            if let Some(handshake) = self.take_handshake()? {
                return Ok(handshake);
            }
            self.read_available().await?;
        }
    }

    fn take_handshake(&mut self) -> Result<Option<Handshake>> {
        let Some(handshake) = Handshake::decode(&mut self.buffer)? else {
            return Ok(None);
        };

        if handshake.info_hash != self.info_hash {
            return Err(BittorrentError::ProtocolViolation(format!(
                "Info hash mismatch from {}: {}",
                self.addr,
                hex::encode(handshake.info_hash)
            )));
        }

        debug!("Handshake from {} ({})", self.addr, String::from_utf8_lossy(&handshake.peer_id));
        self.phase = Phase::Connected;
        Ok(Some(handshake))
    }

    /// One read from the socket into the buffer. EOF is an error.
    pub async fn read_available(&mut self) -> Result<usize> {
        self.buffer.reserve(READ_CHUNK);
        let n = self
            .reader
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| BittorrentError::PeerUnreachable(format!("{}: {}", self.addr, e)))?;

        if n == 0 {
            return Err(BittorrentError::PeerUnreachable(format!(
                "{} closed the connection",
                self.addr
            )));
        }
        Ok(n)
    }

    /// Every complete message currently buffered; a partial trailing
    /// frame stays for the next read.
    pub fn drain_messages(&mut self) -> Result<Vec<PeerMessage>> {
        if self.phase != Phase::Connected {
            if self.take_handshake()?.is_none() {
                return Ok(Vec::new());
            }
        }

        let mut messages = Vec::new();
        while let Some(message) = PeerMessage::decode_frame(&mut self.buffer)? {
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Exchange handshakes over a fresh stream and split it into the read
/// side and a shareable handle for writes and state.
pub async fn establish(
    stream: BoxedStream,
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    number_of_pieces: usize,
) -> Result<(PeerConnection, Arc<PeerHandle>)> {
    let (reader, mut writer) = tokio::io::split(stream);
    let unreachable = |e: std::io::Error| BittorrentError::PeerUnreachable(format!("{}: {}", addr, e));

    writer
        .write_all(&Handshake::new(info_hash, our_peer_id).to_bytes())
        .await
        .map_err(unreachable)?;
    writer.flush().await.map_err(unreachable)?;
    debug!("Sent handshake to {}", addr);

    let mut connection = PeerConnection::new(addr, Box::new(reader), info_hash);
    let handshake = connection.read_handshake().await?;

    let handle = PeerHandle::new(addr, handshake.peer_id, Box::new(writer), number_of_pieces);
    Ok((connection, Arc::new(handle)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::BlockInfo;
    use bytes::Bytes;
    use tokio_test::io::Builder;

    const INFO_HASH: [u8; 20] = [7u8; 20];

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_then_frames_across_reads() {
        let handshake = Handshake::new(INFO_HASH, *b"-XX0001-abcdefghijkl").to_bytes();
        let piece = PeerMessage::Piece {
            piece_index: 0,
            offset: 0,
            data: Bytes::from_static(b"0123456789"),
        }
        .to_bytes();

        let mut first = handshake.to_vec();
        first.extend_from_slice(&PeerMessage::Unchoke.to_bytes());
        first.extend_from_slice(&piece[..6]);

        let reader = Builder::new().read(&first).read(&piece[6..]).build();
        let mut connection = PeerConnection::new(addr(), Box::new(reader), INFO_HASH);

        let remote = connection.read_handshake().await.unwrap();
        assert_eq!(&remote.peer_id, b"-XX0001-abcdefghijkl");
        assert_eq!(connection.phase(), Phase::Connected);

        assert_eq!(connection.drain_messages().unwrap(), vec![PeerMessage::Unchoke]);
        assert_eq!(connection.buffered(), 6);

        connection.read_available().await.unwrap();
        let messages = connection.drain_messages().unwrap();
        assert!(matches!(&messages[..], [PeerMessage::Piece { data, .. }] if &data[..] == b"0123456789"));
    }

    #[tokio::test]
    async fn test_message_before_handshake_is_violation() {
        let request = PeerMessage::Request {
            block: BlockInfo::new(0, 0, 16384),
        }
        .to_bytes();
        let reader = Builder::new().read(&request).build();
        let mut connection = PeerConnection::new(addr(), Box::new(reader), INFO_HASH);

        let err = connection.read_handshake().await.unwrap_err();
        assert!(matches!(err, BittorrentError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_is_violation() {
        let handshake = Handshake::new([9u8; 20], [1u8; 20]).to_bytes();
        let reader = Builder::new().read(&handshake).build();
        let mut connection = PeerConnection::new(addr(), Box::new(reader), INFO_HASH);

        let err = connection.read_handshake().await.unwrap_err();
        assert!(matches!(err, BittorrentError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_eof_is_unreachable() {
        let reader = Builder::new().build();
        let mut connection = PeerConnection::new(addr(), Box::new(reader), INFO_HASH);

        let err = connection.read_available().await.unwrap_err();
        assert!(matches!(err, BittorrentError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_establish_over_duplex() {
        let (local, remote) = tokio::io::duplex(4096);
        let seeder = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(remote);
            let mut buf = [0u8; 68];
            read.read_exact(&mut buf).await.unwrap();
            let ours = Handshake::from_bytes(&buf).unwrap();
            write
                .write_all(&Handshake::new(ours.info_hash, [3u8; 20]).to_bytes())
                .await
                .unwrap();
            ours
        });

        let (connection, handle) = establish(Box::new(local), addr(), INFO_HASH, [5u8; 20], 4)
            .await
            .unwrap();

        let ours = seeder.await.unwrap();
        assert_eq!(ours.peer_id, [5u8; 20]);
        assert_eq!(connection.phase(), Phase::Connected);
        assert_eq!(handle.peer_id(), [3u8; 20]);
    }
}
