use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kadmesh::{DhtConfig, EvictionPolicy, Node};

/// A `KEY=VALUE` pair given on the command line.
#[derive(Clone, Debug)]
struct KeyValue {
    key: String,
    value: String,
}

impl FromStr for KeyValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s.split_once('=').context("expected KEY=VALUE")?;
        Ok(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Eviction {
    DropNew,
    PingOldest,
}

impl From<Eviction> for EvictionPolicy {
    fn from(e: Eviction) -> Self {
        match e {
            Eviction::DropNew => EvictionPolicy::DropNew,
            Eviction::PingOldest => EvictionPolicy::PingOldest,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Seed address to bootstrap from; tried in order until one succeeds.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    #[arg(long, default_value_t = kadmesh::DEFAULT_K)]
    k: usize,

    #[arg(long, default_value_t = kadmesh::DEFAULT_C1)]
    c1: u32,

    #[arg(long, default_value_t = kadmesh::DEFAULT_C2)]
    c2: u32,

    /// Outstanding requests per action.
    #[arg(long, default_value_t = kadmesh::DEFAULT_MAX_CONCURRENT_MESSAGES)]
    alpha: usize,

    #[arg(long, default_value = "10000")]
    operation_timeout_ms: u64,

    #[arg(long, default_value = "2000")]
    response_timeout_ms: u64,

    /// Seconds between bucket and content refreshes.
    #[arg(long, default_value = "600")]
    refresh_interval: u64,

    #[arg(long, value_enum, default_value = "drop-new")]
    eviction: Eviction,

    /// Store a value after bootstrap.
    #[arg(long = "put", value_name = "KEY=VALUE")]
    put: Vec<KeyValue>,

    /// Fetch a key after bootstrap and log its values.
    #[arg(long = "get", value_name = "KEY")]
    get: Vec<String>,
}

impl Args {
    fn config(&self) -> DhtConfig {
        DhtConfig::default()
            .with_k(self.k)
            .with_difficulty(self.c1, self.c2)
            .with_max_concurrent_messages(self.alpha)
            .with_operation_timeout(Duration::from_millis(self.operation_timeout_ms))
            .with_response_timeout(Duration::from_millis(self.response_timeout_ms))
            .with_refresh_interval(Duration::from_secs(self.refresh_interval))
            .with_eviction_policy(self.eviction.into())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.config();
    let refresh_interval = config.refresh_interval;

    info!(c1 = config.c1, c2 = config.c2, "generating identity");
    let node = Node::bind(&args.bind.to_string(), config).await?;
    info!("Node identity: {}", node.id());
    info!("Listening on {}", node.local_addr());

    for seed in &args.bootstrap {
        info!("Bootstrapping from {}", seed);
        match node.connect(&seed.to_string()).await {
            Ok(peer) => {
                info!(seed = %peer.id().short(), "Bootstrap complete");
                break;
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Bootstrap failed");
            }
        }
    }

    for kv in &args.put {
        match node.store_value(&kv.key, &kv.value).await {
            Ok(replicas) => info!(key = %kv.key, replicas, "stored"),
            Err(e) => warn!(key = %kv.key, error = %format!("{:#}", e), "store failed"),
        }
    }

    for key in &args.get {
        match node.fetch_value(key).await {
            Ok(Some(values)) => info!(%key, ?values, "fetched"),
            Ok(None) => info!(%key, "not found"),
            Err(e) => warn!(%key, error = %format!("{:#}", e), "fetch failed"),
        }
    }

    let mut interval = time::interval(refresh_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    interval.tick().await;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let dropped_keys = node.refresh().await;
                let peers = node.known_peers().await;
                info!(
                    known_peers = peers.len(),
                    stored_keys = node.store().get_all_entries().len(),
                    dropped_keys,
                    "refresh complete"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
