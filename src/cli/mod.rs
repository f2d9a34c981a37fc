use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use swarmfetch::client::menu;
use swarmfetch::error::{BittorrentError, Result};
use swarmfetch::sink::{EventSink, TracingSink};
use swarmfetch::torrent::load_torrent_file;
use swarmfetch::tracker::{generate_peer_id, HttpTracker, PeerSource, StaticPeers};
use swarmfetch::{ClientConfig, DownloadOutcome, Selection, TorrentClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "swarmfetch")]
#[command(about = "Download a torrent's files from its swarm", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download files of a torrent
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Port announced to trackers
        #[arg(short, long, default_value = "6881")]
        port: u16,

        /// Files to fetch as numbered in the menu, e.g. "2 4-6"; asked for when omitted
        #[arg(short, long)]
        select: Option<String>,

        /// Write pieces in groups of 32
        #[arg(long)]
        sequential: bool,

        /// Connect to this peer instead of asking the trackers (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,

        /// Seconds without progress before looking for new peers
        #[arg(long, default_value = "60")]
        stall_timeout: u64,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                port,
                select,
                sequential,
                peers,
                stall_timeout,
            } => {
                let config = ClientConfig {
                    download_dir: output.clone(),
                    listen_port: *port,
                    sequential: *sequential,
                    stall_timeout: Duration::from_secs(*stall_timeout),
                    ..ClientConfig::default()
                };
                self.download(torrent, select.as_deref(), peers, config).await?;
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }
        }

        Ok(())
    }

    async fn download(
        &self,
        torrent: &Path,
        select: Option<&str>,
        peers: &[SocketAddr],
        config: ClientConfig,
    ) -> Result<()> {
        let sink = TracingSink;
        let descriptor = load_torrent_file(torrent, generate_peer_id()).await?;
        info!("Torrent: {} ({} bytes)", descriptor.name, descriptor.total_length);

        let answer = match select {
            Some(answer) => answer.to_string(),
            None => {
                sink.must(&menu(&descriptor.files));
                sink.must("Select files:");
                let mut line = String::new();
                BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
                line
            }
        };

        let selection = match Selection::parse(&answer, descriptor.files.len()) {
            Ok(selection) => selection,
            Err(e @ BittorrentError::SelectionError(_)) => {
                sink.must(&e.to_string());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let source: Arc<dyn PeerSource> = if peers.is_empty() {
            Arc::new(HttpTracker::new(config.listen_port, config.tracker_timeout)?)
        } else {
            Arc::new(StaticPeers::new(peers.iter().copied()))
        };

        let mut client = TorrentClient::new(config, source);
        let cancel = client.cancel_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping download");
                cancel.cancel();
            }
        });

        match client.download(&descriptor, &selection).await? {
            DownloadOutcome::Completed => info!("Done: {}", descriptor.name),
            DownloadOutcome::Cancelled => info!("Download cancelled"),
        }
        Ok(())
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let descriptor = load_torrent_file(torrent_path, generate_peer_id()).await?;

        println!("Torrent Information");
        println!("==================");
        println!("Name: {}", descriptor.name);
        println!("Total Size: {} bytes", descriptor.total_length);
        println!("Piece Length: {} bytes", descriptor.piece_length);
        println!("Number of Pieces: {}", descriptor.number_of_pieces());
        println!("Info Hash: {}", descriptor.info_hash_hex());
        println!("\nFiles:");

        for (i, file) in descriptor.files.iter().enumerate() {
            println!("  {}: {} ({} bytes)", i + 2, file.path.display(), file.length);
        }

        if !descriptor.announce_list.is_empty() {
            println!("\nTrackers:");
            for tracker in &descriptor.announce_list {
                println!("  - {}", tracker);
            }
        }

        Ok(())
    }
}
