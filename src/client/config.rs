use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the BitTorrent client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    pub listen_port: u16,
    /// Upper bound for TCP connect plus handshake
    pub connect_timeout: Duration,
    /// Concurrent connection attempts during bootstrap
    pub max_connect_workers: usize,
    /// Per-tracker announce timeout
    pub tracker_timeout: Duration,
    /// Pause between two request rounds
    pub request_tick: Duration,
    /// Read timeout of peer tasks; also the back-off when nobody unchoked us
    pub poll_interval: Duration,
    /// How long progress may stand still before peers are re-bootstrapped
    pub stall_timeout: Duration,
    pub max_retries: u32,
    /// Buffer pieces and write them in groups
    pub sequential: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_port: 6881,
            connect_timeout: Duration::from_secs(3),
            max_connect_workers: 10,
            tracker_timeout: Duration::from_secs(10),
            request_tick: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(60),
            max_retries: 3,
            sequential: false,
        }
    }
}
