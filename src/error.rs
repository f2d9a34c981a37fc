use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    BencodeError(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Tracker error: {0}")]
    TrackerError(String),

    /// Malformed or out-of-sequence peer traffic. The peer is dropped.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A fully received piece did not match its declared digest.
    #[error("Piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error("Storage error: {0}")]
    StorageFailure(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Not enough peers: {0}")]
    InsufficientPeers(String),

    #[error("Invalid file selection: {0}")]
    SelectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(String),
}

impl BittorrentError {
    /// Whether this error terminates a download run.
    ///
    /// Everything else is confined to the peer or piece it came from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BittorrentError::InsufficientPeers(_) | BittorrentError::SelectionError(_)
        )
    }
}

impl From<url::ParseError> for BittorrentError {
    fn from(err: url::ParseError) -> Self {
        BittorrentError::UrlParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
