mod cli;

use anyhow::Result;
use cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides; by default only our own info-level events show
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swarmfetch=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    Cli::parse().run().await?;
    Ok(())
}
