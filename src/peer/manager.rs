use super::{establish, BlockInfo, Connector, PeerConnection, PeerHandle, PeerMessage};
use crate::client::ClientConfig;
use crate::error::{BittorrentError, Result};
use crate::piece::PieceManager;
use crate::sink::EventSink;
use crate::torrent::Descriptor;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Registry of live peers and their read/dispatch tasks
pub struct PeerManager {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    number_of_pieces: usize,
    connect_timeout: Duration,
    max_connect_workers: usize,
    poll_interval: Duration,
    connector: Arc<dyn Connector>,
    pieces: Arc<tokio::sync::Mutex<PieceManager>>,
    sink: Arc<dyn EventSink>,
    peers: RwLock<HashMap<SocketAddr, Arc<PeerHandle>>>,
    readers: Mutex<JoinSet<()>>,
    is_active: AtomicBool,
}

impl PeerManager {
    pub fn new(
        descriptor: &Descriptor,
        config: &ClientConfig,
        pieces: Arc<tokio::sync::Mutex<PieceManager>>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            info_hash: descriptor.info_hash,
            peer_id: descriptor.peer_id,
            number_of_pieces: descriptor.number_of_pieces(),
            connect_timeout: config.connect_timeout,
            max_connect_workers: config.max_connect_workers.max(1),
            poll_interval: config.poll_interval,
            connector,
            pieces,
            sink,
            peers: RwLock::new(HashMap::new()),
            readers: Mutex::new(JoinSet::new()),
            is_active: AtomicBool::new(true),
        }
    }

    /// Connect to every address of the pool not already connected.
    ///
    /// Returns how many new peers joined.
    pub async fn bootstrap(self: &Arc<Self>, pool: &[SocketAddr]) -> usize {
        let semaphore = Arc::new(Semaphore::new(self.max_connect_workers));
        let mut attempts = JoinSet::new();

        for &addr in pool {
            if self.peers.read().contains_key(&addr) {
                continue;
            }

            let manager = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            attempts.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (addr, manager.connect(addr).await)
            });
        }

        let mut connected = 0;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((_, Ok((connection, handle)))) => {
                    if self.add_peer(connection, handle).await {
                        connected += 1;
                    }
                }
                Ok((addr, Err(e))) => debug!("Can't connect to {}: {}", addr, e),
                Err(e) => warn!("Connect task failed: {}", e),
            }
        }

        info!("Connected to {} new peer(s), {} in total", connected, self.connected_count());
        connected
    }

    async fn connect(&self, addr: SocketAddr) -> Result<(PeerConnection, Arc<PeerHandle>)> {
        debug!("Connecting to peer: {}", addr);
        let attempt = async {
            let stream = self
                .connector
                .connect(addr)
                .await
                .map_err(|e| BittorrentError::PeerUnreachable(format!("{}: {}", addr, e)))?;
            establish(stream, addr, self.info_hash, self.peer_id, self.number_of_pieces).await
        };

        tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| BittorrentError::PeerUnreachable(format!("{}: connect timed out", addr)))?
    }

    /// Register a handshaken peer and start its reader task
    async fn add_peer(self: &Arc<Self>, connection: PeerConnection, handle: Arc<PeerHandle>) -> bool {
        let addr = handle.addr();
        let accepted = {
            let mut peers = self.peers.write();
            if !self.is_active() || peers.contains_key(&addr) {
                false
            } else {
                peers.insert(addr, Arc::clone(&handle));
                true
            }
        };
        if !accepted {
            handle.shutdown().await;
            return false;
        }

        info!("New peer added: {}", addr);

        let bitfield = self.pieces.lock().await.servable_bitfield();
        if bitfield.count_ones() > 0 {
            let message = PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(bitfield.as_bytes()),
            };
            if let Err(e) = handle.send(&message).await {
                debug!("Can't send bitfield to {}: {}", addr, e);
            }
        }

        let manager = Arc::clone(self);
        self.readers
            .lock()
            .spawn(async move { manager.read_loop(connection, handle).await });
        true
    }

    async fn read_loop(self: Arc<Self>, mut connection: PeerConnection, handle: Arc<PeerHandle>) {
        match self.serve_peer(&mut connection, &handle).await {
            Ok(()) => debug!("Reader of {} stopped", handle.addr()),
            Err(BittorrentError::PeerUnreachable(reason)) => self.sink.debug(&format!("Peer gone: {}", reason)),
            Err(e) => self
                .sink
                .warning(&format!("Dropping peer {}: {}", handle.addr(), e)),
        }
        self.remove_peer(&handle).await;
    }

    async fn serve_peer(&self, connection: &mut PeerConnection, handle: &PeerHandle) -> Result<()> {
        // frames that arrived along with the handshake
        self.dispatch_buffered(connection, handle).await?;

        while self.is_active() && handle.is_healthy() {
            match tokio::time::timeout(self.poll_interval, connection.read_available()).await {
                Err(_) => continue,
                Ok(read) => {
                    read?;
                }
            }
            self.dispatch_buffered(connection, handle).await?;
        }
        Ok(())
    }

    async fn dispatch_buffered(&self, connection: &mut PeerConnection, handle: &PeerHandle) -> Result<()> {
        for message in connection.drain_messages()? {
            self.dispatch(handle, message).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, handle: &PeerHandle, message: PeerMessage) -> Result<()> {
        if let Some(reply) = handle.apply(&message)? {
            handle.send(&reply).await?;
        }

        match message {
            PeerMessage::KeepAlive => debug!("Keep-alive from {}", handle.addr()),
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::Have { .. }
            | PeerMessage::Bitfield { .. } => {}
            PeerMessage::Request { block } => self.serve_request(handle, block).await?,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.receive_piece(handle, piece_index, offset, data).await?,
            PeerMessage::Cancel { block } => debug!(
                "Cancel from {} for piece {} offset {}",
                handle.addr(),
                block.piece_index,
                block.offset
            ),
            PeerMessage::Port { port } => debug!("Peer {} listens for DHT on port {}", handle.addr(), port),
        }
        Ok(())
    }

    async fn serve_request(&self, handle: &PeerHandle, block: BlockInfo) -> Result<()> {
        if handle.status().state.am_choking {
            debug!("Ignoring request from choked peer {}", handle.addr());
            return Ok(());
        }

        let served = {
            let pieces = self.pieces.lock().await;
            pieces
                .get_block(block.piece_index as usize, block.offset as usize, block.length as usize)
                .await
        };

        match served {
            Ok(Some(data)) => {
                handle
                    .send(&PeerMessage::Piece {
                        piece_index: block.piece_index,
                        offset: block.offset,
                        data,
                    })
                    .await?;
                debug!("Sent piece {} block {} to {}", block.piece_index, block.offset, handle.addr());
                Ok(())
            }
            Ok(None) => {
                debug!("Peer {} asked for piece {} we don't have", handle.addr(), block.piece_index);
                Ok(())
            }
            Err(fault @ BittorrentError::StorageFailure(_)) => {
                self.sink
                    .error(&format!("Can't read piece {} for {}", block.piece_index, handle.addr()), &fault);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn receive_piece(&self, handle: &PeerHandle, piece_index: u32, offset: u32, data: Bytes) -> Result<()> {
        let received = {
            let mut pieces = self.pieces.lock().await;
            pieces.receive_block(piece_index as usize, offset as usize, data).await
        };

        match received {
            Ok(true) => {
                debug!("Piece {} completed (last block from {})", piece_index, handle.addr());
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(BittorrentError::HashMismatch(index)) => {
                self.sink
                    .warning(&format!("Piece {} failed verification, downloading it again", index));
                Ok(())
            }
            Err(fault @ BittorrentError::StorageFailure(_)) => {
                self.sink.error(&format!("Can't write piece {}", piece_index), &fault);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a peer unless the registry already holds a newer connection
    /// to the same address.
    pub async fn remove_peer(&self, handle: &Arc<PeerHandle>) {
        let addr = handle.addr();
        let removed = {
            let mut peers = self.peers.write();
            match peers.get(&addr) {
                Some(current) if Arc::ptr_eq(current, handle) => peers.remove(&addr),
                _ => None,
            }
        };

        handle.shutdown().await;
        if removed.is_some() {
            info!("Peer removed: {}", addr);
        }
    }

    /// Random peer we may ask for `piece_index`
    pub fn random_peer_having_piece(&self, piece_index: usize) -> Option<Arc<PeerHandle>> {
        let ready: Vec<Arc<PeerHandle>> = self
            .peers()
            .into_iter()
            .filter(|peer| peer.is_eligible(piece_index))
            .collect();
        ready.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn has_unchoked_peers(&self) -> bool {
        self.peers.read().values().any(|peer| peer.is_unchoked())
    }

    pub fn unchoked_peers_count(&self) -> usize {
        self.peers.read().values().filter(|peer| peer.is_unchoked()).count()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.read().contains_key(addr)
    }

    /// Snapshot of the registry
    pub fn peers(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.read().values().cloned().collect()
    }

    /// Close every connection; reader tasks notice and exit on their own.
    pub async fn disconnect_all(&self) {
        let peers: Vec<Arc<PeerHandle>> = self.peers.write().drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            peer.shutdown().await;
        }
        if !peers.is_empty() {
            info!("Disconnected {} peer(s)", peers.len());
        }
    }

    /// Stop accepting peers, disconnect everyone and wait for the readers
    pub async fn shutdown(&self) {
        self.is_active.store(false, Ordering::SeqCst);
        self.disconnect_all().await;

        let mut readers = std::mem::take(&mut *self.readers.lock());
        while let Some(joined) = readers.join_next().await {
            if let Err(e) = joined {
                warn!("Peer reader ended abnormally: {}", e);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }
}
