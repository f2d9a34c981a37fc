use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_bytes(0, 8);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Take a handshake off the front of `buf`.
    ///
    /// A wrong first byte is rejected as soon as it arrives; otherwise
    /// `Ok(None)` until all 68 bytes are buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        let Some(&pstrlen) = buf.first() else {
            return Ok(None);
        };
        if pstrlen as usize != PROTOCOL_STRING.len() {
            return Err(BittorrentError::ProtocolViolation(format!(
                "Expected handshake, got leading byte {}",
                pstrlen
            )));
        }
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        let frame = buf.split_to(HANDSHAKE_LEN);
        Self::from_bytes(&frame).map(Some)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(BittorrentError::ProtocolViolation(
                "Handshake too short".to_string(),
            ));
        }

        let mut data = &data[..HANDSHAKE_LEN];
        let pstrlen = data.get_u8() as usize;
        if pstrlen != PROTOCOL_STRING.len() || &data[..pstrlen] != PROTOCOL_STRING {
            return Err(BittorrentError::ProtocolViolation(
                "Invalid protocol string".to_string(),
            ));
        }
        data.advance(pstrlen + 8);

        let mut info_hash = [0u8; 20];
        data.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        data.copy_to_slice(&mut peer_id);

        Ok(Handshake { info_hash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialization() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.to_bytes();

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING);
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(Handshake::from_bytes(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_decode_waits_for_full_handshake() {
        let bytes = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        let mut buf = BytesMut::from(&bytes[..30]);
        assert_eq!(Handshake::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&bytes[30..]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert!(Handshake::decode(&mut buf).unwrap().is_some());
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_non_handshake_first_byte_is_violation() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 1][..]);
        let err = Handshake::decode(&mut buf).unwrap_err();
        assert!(matches!(err, BittorrentError::ProtocolViolation(_)));
    }
}
