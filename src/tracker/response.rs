use crate::bencode::Bencode;
use crate::error::{BittorrentError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Response from a tracker
#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// Interval in seconds to wait before next request
    pub interval: u64,
    pub min_interval: Option<u64>,
    /// Number of seeders
    pub complete: Option<u64>,
    /// Number of leechers
    pub incomplete: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

impl TrackerResponse {
    pub fn from_bencode(value: &Bencode) -> Result<Self> {
        if !matches!(value, Bencode::Dict(_)) {
            return Err(BittorrentError::TrackerError(
                "Response must be a dict".to_string(),
            ));
        }

        if let Some(failure) = value.get(b"failure reason") {
            let reason = failure.as_str().unwrap_or("Unknown failure").to_string();
            return Err(BittorrentError::TrackerError(reason));
        }

        let peers = match value.get(b"peers") {
            Some(Bencode::Bytes(compact)) => parse_compact(compact),
            Some(Bencode::List(list)) => parse_peer_list(list)?,
            Some(_) => {
                return Err(BittorrentError::TrackerError(
                    "Invalid 'peers' format".to_string(),
                ))
            }
            None => {
                return Err(BittorrentError::TrackerError(
                    "Missing 'peers' field".to_string(),
                ))
            }
        };

        Ok(TrackerResponse {
            interval: value.get_u64(b"interval").unwrap_or(0),
            min_interval: value.get_u64(b"min interval"),
            complete: value.get_u64(b"complete"),
            incomplete: value.get_u64(b"incomplete"),
            peers,
        })
    }
}

/// 6 bytes per peer: IPv4 then port, both big-endian
fn parse_compact(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn parse_peer_list(list: &[Bencode]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::with_capacity(list.len());

    for peer in list {
        let ip: IpAddr = peer
            .get_str(b"ip")
            .ok_or_else(|| BittorrentError::TrackerError("Missing peer 'ip'".to_string()))?
            .parse()
            .map_err(|_| BittorrentError::TrackerError("Invalid peer IP address".to_string()))?;

        let port = peer
            .get_u64(b"port")
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| BittorrentError::TrackerError("Missing peer 'port'".to_string()))?;

        peers.push(SocketAddr::new(ip, port));
    }

    Ok(peers)
}
