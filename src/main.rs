//! Obelisk node binary
//!
//! Headers-only chain node: the networking core plus an in-memory header
//! chainstate. On regtest the `--mine-interval` flag extends the chain
//! periodically so small local networks have something to relay.

mod chain;
mod config;
mod net;
mod types;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use crate::chain::ChainState;
use crate::config::{ChainKind, Config};
use crate::net::NetworkManager;

#[derive(Parser)]
#[command(name = "obelisk", version, about = "Obelisk: headers-only blockchain node")]
struct Args {
    /// Listen port (0 = ephemeral)
    #[arg(short, long, default_value_t = crate::net::types::DEFAULT_PORT)]
    port: u16,

    /// Disable the listening socket
    #[arg(long)]
    no_listen: bool,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Chain: mainnet, testnet, regtest
    #[arg(long, default_value = "mainnet")]
    chain: String,

    /// Seed nodes (comma-separated host:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Enable the NAT-refresh side task
    #[arg(long)]
    nat: bool,

    /// Regtest only: mine a block every N seconds (0 = off)
    #[arg(long, default_value_t = 0)]
    mine_interval: u64,
}

fn parse_seeds(raw: Option<&str>) -> Vec<SocketAddr> {
    raw.map(|s| {
        s.split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                match entry.parse() {
                    Ok(addr) => Some(addr),
                    Err(_) => {
                        error!(seed = entry, "ignoring unparsable seed");
                        None
                    }
                }
            })
            .collect()
    })
    .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obelisk=info".into()),
        )
        .init();

    let args = Args::parse();
    let chain_kind = match args.chain.as_str() {
        "mainnet" => ChainKind::Mainnet,
        "testnet" => ChainKind::Testnet,
        "regtest" => ChainKind::Regtest,
        other => {
            return Err(format!("unknown chain {other:?}").into());
        }
    };

    let config = Config {
        listen_enabled: !args.no_listen,
        listen_port: args.port,
        network_magic: chain_kind.magic(),
        enable_nat: args.nat,
        datadir: args.data_dir.clone(),
        seeds: parse_seeds(args.seeds.as_deref()),
        ..Config::default()
    };

    let chain = Arc::new(Mutex::new(ChainState::new(ChainState::regtest_genesis())));
    let mut network = NetworkManager::start(config, chain.clone()).await?;
    info!(port = network.listen_port(), chain = args.chain, "node started");

    // Regtest miner: keeps a local network producing tip announcements
    let miner = if args.mine_interval > 0 && chain_kind == ChainKind::Regtest {
        let chain = chain.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(args.mine_interval));
            loop {
                ticker.tick().await;
                let mut chain = chain.lock().expect("chain lock");
                let now = crate::types::now() as u32;
                let hashes = chain.mine(1, now, 0);
                info!(
                    height = chain.height(),
                    hash = %crate::types::short_hash(&hashes[0]),
                    "mined block"
                );
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if let Some(miner) = miner {
        miner.abort();
    }
    network.stop().await;
    Ok(())
}
