use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest frame we accept, length prefix excluded
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Information about a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Piece index
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.piece_index);
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
    }

    fn get(payload: &mut Bytes) -> Self {
        let piece_index = payload.get_u32();
        let offset = payload.get_u32();
        let length = payload.get_u32();
        Self::new(piece_index, offset, length)
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Indicate possession of a piece
    Have { piece_index: u32 },
    /// Bitfield of available pieces, MSB first
    Bitfield { bitfield: Bytes },
    Request { block: BlockInfo },
    /// Send a block
    Piece {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    Cancel { block: BlockInfo },
    /// DHT listen port of the sender
    Port { port: u16 },
}

impl PeerMessage {
    /// Message type IDs
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;
    const PORT: u8 = 9;

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload_len());

        match self {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => Self::put_header(&mut buf, Self::CHOKE, 0),
            PeerMessage::Unchoke => Self::put_header(&mut buf, Self::UNCHOKE, 0),
            PeerMessage::Interested => Self::put_header(&mut buf, Self::INTERESTED, 0),
            PeerMessage::NotInterested => Self::put_header(&mut buf, Self::NOT_INTERESTED, 0),
            PeerMessage::Have { piece_index } => {
                Self::put_header(&mut buf, Self::HAVE, 4);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                Self::put_header(&mut buf, Self::BITFIELD, bitfield.len());
                buf.put_slice(bitfield);
            }
            PeerMessage::Request { block } => {
                Self::put_header(&mut buf, Self::REQUEST, 12);
                block.put(&mut buf);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(&mut buf, Self::PIECE, 8 + data.len());
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                Self::put_header(&mut buf, Self::CANCEL, 12);
                block.put(&mut buf);
            }
            PeerMessage::Port { port } => {
                Self::put_header(&mut buf, Self::PORT, 2);
                buf.put_u16(*port);
            }
        }

        buf.freeze()
    }

    fn put_header(buf: &mut BytesMut, id: u8, payload_len: usize) {
        buf.put_u32((1 + payload_len) as u32);
        buf.put_u8(id);
    }

    fn payload_len(&self) -> usize {
        match self {
            PeerMessage::KeepAlive => 0,
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => 1,
            PeerMessage::Have { .. } => 5,
            PeerMessage::Bitfield { bitfield } => 1 + bitfield.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
            PeerMessage::Piece { data, .. } => 9 + data.len(),
            PeerMessage::Port { .. } => 3,
        }
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// still incomplete.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(BittorrentError::ProtocolViolation(format!(
                "Frame of {} bytes exceeds limit of {}",
                length, MAX_FRAME_LEN
            )));
        }
        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if length == 0 {
            return Ok(Some(PeerMessage::KeepAlive));
        }

        let mut payload = buf.split_to(length).freeze();
        let message_id = payload.get_u8();
        Self::from_payload(message_id, payload).map(Some)
    }

    fn from_payload(message_id: u8, mut payload: Bytes) -> Result<Self> {
        let check_len = |len: usize, name: &str, payload: &Bytes| -> Result<()> {
            if payload.len() != len {
                return Err(BittorrentError::ProtocolViolation(format!(
                    "{} payload must be {} bytes, got {}",
                    name,
                    len,
                    payload.len()
                )));
            }
            Ok(())
        };

        match message_id {
            Self::CHOKE => {
                check_len(0, "Choke", &payload)?;
                Ok(PeerMessage::Choke)
            }
            Self::UNCHOKE => {
                check_len(0, "Unchoke", &payload)?;
                Ok(PeerMessage::Unchoke)
            }
            Self::INTERESTED => {
                check_len(0, "Interested", &payload)?;
                Ok(PeerMessage::Interested)
            }
            Self::NOT_INTERESTED => {
                check_len(0, "NotInterested", &payload)?;
                Ok(PeerMessage::NotInterested)
            }
            Self::HAVE => {
                check_len(4, "Have", &payload)?;
                Ok(PeerMessage::Have {
                    piece_index: payload.get_u32(),
                })
            }
            Self::BITFIELD => Ok(PeerMessage::Bitfield { bitfield: payload }),
            Self::REQUEST => {
                check_len(12, "Request", &payload)?;
                Ok(PeerMessage::Request {
                    block: BlockInfo::get(&mut payload),
                })
            }
            Self::PIECE => {
                if payload.len() < 8 {
                    return Err(BittorrentError::ProtocolViolation(
                        "Piece payload shorter than its header".to_string(),
                    ));
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: payload,
                })
            }
            Self::CANCEL => {
                check_len(12, "Cancel", &payload)?;
                Ok(PeerMessage::Cancel {
                    block: BlockInfo::get(&mut payload),
                })
            }
            Self::PORT => {
                check_len(2, "Port", &payload)?;
                Ok(PeerMessage::Port {
                    port: payload.get_u16(),
                })
            }
            _ => Err(BittorrentError::ProtocolViolation(format!(
                "Unknown message ID: {}",
                message_id
            ))),
        }
    }
}
