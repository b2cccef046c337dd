use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use blobdht::config::DEFAULT_PORT;
use blobdht::{Bitmap, Dht, DhtConfig};

#[derive(Parser, Debug)]
#[command(name = "blobdht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Address of a node to join through; may be repeated.
    #[arg(short, long = "seed", value_name = "ADDR")]
    seeds: Vec<SocketAddr>,

    /// Port peers should use to fetch blobs from this node.
    #[arg(short, long, default_value_t = DEFAULT_PORT + 1)]
    peer_port: u16,

    /// Address peers should fetch blobs from; required to self-announce
    /// when binding a wildcard address.
    #[arg(long, value_name = "IP")]
    advertise: Option<IpAddr>,

    /// Hex blob hash to announce; may be repeated.
    #[arg(short, long = "announce", value_name = "HASH")]
    announce: Vec<Bitmap>,

    /// Hex blob hash to look up once joined.
    #[arg(short, long, value_name = "HASH")]
    lookup: Option<Bitmap>,

    #[arg(long, default_value = "300")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = DhtConfig::default()
        .bind(args.bind)
        .seeds(args.seeds)
        .peer_port(args.peer_port);
    if let Some(ip) = args.advertise {
        config = config.advertise(ip);
    }
    let dht = Dht::new(config);
    dht.start().await.context("failed to start dht")?;
    info!("Node id: {}", dht.id());

    for hash in &args.announce {
        let accepted = dht.announce(*hash).await;
        info!(hash = %hash.hex_short(), accepted, "announce complete");
    }

    if let Some(hash) = args.lookup {
        let holders = dht.get(hash).await;
        if holders.is_empty() {
            warn!(hash = %hash.hex_short(), "no holders found");
        }
        for holder in holders {
            info!(hash = %hash.hex_short(), holder = %holder.addr(), id = %holder.id, "holder");
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let node = dht.node();
                info!(
                    routing_contacts = node.routing_table().len(),
                    stored_hashes = node.contact_store().len(),
                    transactions = node.count_active_transactions(),
                    "dht stats"
                );
            }
        }
    }

    dht.shutdown().await;
    Ok(())
}
