use super::{PeerSource, TrackerRequest, TrackerResponse};
use crate::bencode::decode;
use crate::error::{BittorrentError, Result};
use crate::torrent::Descriptor;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

/// Announces to every HTTP(S) tracker of a torrent
pub struct HttpTracker {
    client: Client,
    port: u16,
}

impl HttpTracker {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, port })
    }

    /// Send a request to a tracker and get the peer list
    pub async fn announce(&self, tracker_url: &str, request: &TrackerRequest) -> Result<TrackerResponse> {
        announce(&self.client, tracker_url, request).await
    }
}

async fn announce(client: &Client, tracker_url: &str, request: &TrackerRequest) -> Result<TrackerResponse> {
    info!("Announcing to tracker: {}", tracker_url);

    let mut url = Url::parse(tracker_url)?;
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, request.to_query()),
        _ => request.to_query(),
    };
    url.set_query(Some(&query));

    debug!("Tracker request URL: {}", url);

    let response = client.get(url).send().await?;
    let status = response.status();
    let body = response.bytes().await?;

    debug!("Tracker response status: {}, body length: {}", status, body.len());

    if !status.is_success() {
        return Err(BittorrentError::TrackerError(format!("HTTP error: {}", status)));
    }

    let tracker_response = TrackerResponse::from_bencode(&decode(&body)?)?;

    info!(
        "Received {} peers from {} (interval: {}s)",
        tracker_response.peers.len(),
        tracker_url,
        tracker_response.interval
    );

    Ok(tracker_response)
}

#[async_trait]
impl PeerSource for HttpTracker {
    async fn discover(&self, descriptor: &Descriptor) -> Result<Vec<SocketAddr>> {
        let request = TrackerRequest::new(
            descriptor.info_hash,
            descriptor.peer_id,
            self.port,
            descriptor.total_length,
        );

        let mut announces = JoinSet::new();
        for tracker in &descriptor.announce_list {
            if !(tracker.starts_with("http://") || tracker.starts_with("https://")) {
                warn!("Unsupported tracker scheme: {}", tracker);
                continue;
            }

            let client = self.client.clone();
            let request = request.clone();
            let tracker = tracker.clone();
            announces.spawn(async move {
                let result = announce(&client, &tracker, &request).await;
                (tracker, result)
            });
        }

        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        while let Some(joined) = announces.join_next().await {
            match joined {
                Ok((_, Ok(response))) => {
                    for addr in response.peers {
                        if seen.insert(addr) {
                            peers.push(addr);
                        }
                    }
                }
                Ok((tracker, Err(e))) => warn!("Tracker {} failed: {}", tracker, e),
                Err(e) => warn!("Announce task failed: {}", e),
            }
        }

        info!("Total {} peers", peers.len());
        Ok(peers)
    }
}
