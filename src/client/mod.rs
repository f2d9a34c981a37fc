//! The download driver: one run from an empty piece table to either a
//! complete selection on storage, a cancellation or an abort.

mod config;
mod selection;

pub use config::ClientConfig;
pub use selection::{menu, Selection};

use crate::error::{BittorrentError, Result};
use crate::peer::{Connector, PeerManager, PeerMessage, TcpConnector};
use crate::piece::PieceManager;
use crate::sink::{EventSink, TracingSink};
use crate::storage::{FsStorage, Storage};
use crate::torrent::Descriptor;
use crate::tracker::PeerSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Bootstrapping,
    Downloading,
    Stalled,
    Completed,
    Aborted,
    Cancelled,
}

/// How a run that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Cancelled,
}

/// Stops a running download from another task
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the progress line last said and when completion last moved
struct Progress {
    last_line: String,
    last_percentage: f64,
    last_update: Instant,
}

impl Progress {
    fn new() -> Self {
        Self {
            last_line: String::new(),
            last_percentage: -1.0,
            last_update: Instant::now(),
        }
    }
}

/// Main BitTorrent client
pub struct TorrentClient {
    config: ClientConfig,
    storage: Arc<dyn Storage>,
    connector: Arc<dyn Connector>,
    peer_source: Arc<dyn PeerSource>,
    sink: Arc<dyn EventSink>,
    cancel: CancelHandle,
    state: RunState,
    retries: u32,
}

impl TorrentClient {
    /// Client writing under `config.download_dir` over plain TCP
    pub fn new(config: ClientConfig, peer_source: Arc<dyn PeerSource>) -> Self {
        Self {
            storage: Arc::new(FsStorage::new(&config.download_dir)),
            connector: Arc::new(TcpConnector),
            peer_source,
            sink: Arc::new(TracingSink),
            cancel: CancelHandle::default(),
            state: RunState::Idle,
            retries: 0,
            config,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Download the selected files of a torrent
    pub async fn download(&mut self, descriptor: &Descriptor, selection: &Selection) -> Result<DownloadOutcome> {
        descriptor.validate()?;
        selection.validate(descriptor.files.len())?;

        info!("Starting download of {} ({})", descriptor.name, descriptor.info_hash_hex());
        self.retries = 0;

        let pieces = Arc::new(Mutex::new(PieceManager::new(
            descriptor,
            selection.indices(),
            Arc::clone(&self.storage),
            self.config.sequential,
        )));
        let peers = Arc::new(PeerManager::new(
            descriptor,
            &self.config,
            Arc::clone(&pieces),
            Arc::clone(&self.connector),
            Arc::clone(&self.sink),
        ));

        let result = self.drive(descriptor, &pieces, &peers).await;
        peers.shutdown().await;

        match &result {
            Ok(DownloadOutcome::Completed) => {
                self.transition(RunState::Completed);
                self.sink.info("File(s) downloaded successfully.");
            }
            Ok(DownloadOutcome::Cancelled) => self.transition(RunState::Cancelled),
            Err(e) => {
                self.transition(RunState::Aborted);
                self.sink.error("Download aborted", e);
            }
        }
        result
    }

    async fn drive(
        &mut self,
        descriptor: &Descriptor,
        pieces: &Arc<Mutex<PieceManager>>,
        peers: &Arc<PeerManager>,
    ) -> Result<DownloadOutcome> {
        self.transition(RunState::Bootstrapping);
        self.bootstrap(descriptor, peers).await?;
        self.transition(RunState::Downloading);

        let mut progress = Progress::new();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(DownloadOutcome::Cancelled);
            }

            if pieces.lock().await.all_pieces_completed() {
                self.report_progress(pieces, peers, &mut progress).await;
                return Ok(DownloadOutcome::Completed);
            }

            if !peers.has_unchoked_peers() {
                self.sink.warning("No unchoked peers");
                tokio::time::sleep(self.config.poll_interval).await;
                self.check_stall(descriptor, peers, &mut progress).await?;
                continue;
            }

            self.request_blocks(pieces, peers).await;
            self.report_progress(pieces, peers, &mut progress).await;
            self.check_stall(descriptor, peers, &mut progress).await?;

            tokio::time::sleep(self.config.request_tick).await;
        }
    }

    /// Query the peer source and connect; no peer at all is fatal
    async fn bootstrap(&mut self, descriptor: &Descriptor, peers: &Arc<PeerManager>) -> Result<()> {
        let pool = match self.peer_source.discover(descriptor).await {
            Ok(pool) => pool,
            Err(e) => {
                self.sink.error("Peer discovery failed", &e);
                Vec::new()
            }
        };
        info!("Peer pool holds {} address(es)", pool.len());

        peers.bootstrap(&pool).await;

        if peers.connected_count() == 0 {
            return Err(BittorrentError::InsufficientPeers(format!(
                "No peer reachable out of {}",
                pool.len()
            )));
        }
        Ok(())
    }

    /// One scheduling round: claim at most one block per missing piece
    /// from a random eligible peer, then send the requests.
    async fn request_blocks(&self, pieces: &Arc<Mutex<PieceManager>>, peers: &PeerManager) {
        let mut requests = Vec::new();
        {
            let mut table = pieces.lock().await;
            let now = Instant::now();
            for index in table.outstanding_pieces() {
                let Some(peer) = peers.random_peer_having_piece(index) else {
                    continue;
                };
                let Some(piece) = table.piece_mut(index) else {
                    continue;
                };

                piece.expire_pending(now);
                if let Some(block) = piece.claim_block_at(now) {
                    requests.push((peer, block));
                }
            }
        }

        for (peer, block) in requests {
            if let Err(e) = peer.send(&PeerMessage::Request { block }).await {
                debug!("Request for piece {} not sent: {}", block.piece_index, e);
            }
        }
    }

    async fn report_progress(&self, pieces: &Arc<Mutex<PieceManager>>, peers: &PeerManager, progress: &mut Progress) {
        let (completed, active, percentage) = {
            let table = pieces.lock().await;
            (
                table.completed_pieces(),
                table.number_of_active_pieces(),
                table.percentage_completed(),
            )
        };

        let line = format!(
            "Connected peers: {} - {:.2}% completed | {}/{} pieces",
            peers.unchoked_peers_count(),
            percentage,
            completed,
            active
        );
        if line != progress.last_line {
            self.sink.info(&line);
            progress.last_line = line;
        }

        if percentage != progress.last_percentage {
            progress.last_percentage = percentage;
            progress.last_update = Instant::now();
        }
    }

    /// Re-bootstrap when completion stood still for too long
    async fn check_stall(
        &mut self,
        descriptor: &Descriptor,
        peers: &Arc<PeerManager>,
        progress: &mut Progress,
    ) -> Result<()> {
        if progress.last_update.elapsed() <= self.config.stall_timeout {
            return Ok(());
        }

        self.transition(RunState::Stalled);
        if self.retries > self.config.max_retries {
            return Err(BittorrentError::InsufficientPeers(format!(
                "No progress after {} retries",
                self.retries
            )));
        }

        self.sink.info("Timeout, looking for new peers");
        peers.disconnect_all().await;

        self.transition(RunState::Bootstrapping);
        self.bootstrap(descriptor, peers).await?;
        self.retries += 1;
        progress.last_update = Instant::now();
        self.transition(RunState::Downloading);
        Ok(())
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            info!("Run state: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
