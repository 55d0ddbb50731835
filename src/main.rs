//! Server binary: parses flags, installs logging, runs until a shutdown
//! signal drains the server.

use anyhow::Result;
use clap::Parser;
use cindercache::server;
use cindercache::storage::StoreKind;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "cindercache", version, about = "In-memory TTL cache server")]
struct Args {
    /// How many store shards to use
    #[arg(long, default_value_t = cindercache::DEFAULT_BSIZE)]
    bsize: usize,

    /// Port number to listen on
    #[arg(long, default_value_t = cindercache::DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let addr = format!("0.0.0.0:{}", args.port);
    let handle = server::run(StoreKind::Memory, args.bsize, &addr).await?;

    // The server stops itself on SIGINT/SIGTERM; wait for the drain.
    handle.done().await;

    Ok(())
}
