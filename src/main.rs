use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use seedmesh::{
    ConnectionsManager, EngineConfig, MemoryBlockStore, Node, NodeId, PersistedState,
    TCP_SCHEME, TcpTransport, UriFilter,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    uri: String,
    id: NodeId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (uri, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include a node id (format: tcp:IP:PORT/NODE_ID)")?;
        let id = NodeId::from_hex(id_part).context("invalid hex node id")?;
        Ok(BootstrapPeer {
            uri: uri.to_string(),
            id,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "seedmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Address peers should dial: IP or IP:PORT, port defaulting to the bound
    /// one. Required when binding a wildcard address.
    #[arg(short, long, value_name = "ADDR")]
    advertise: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Persisted node state, read at startup and written on shutdown.
    #[arg(short, long)]
    state: Option<PathBuf>,

    #[arg(short, long, default_value = "32")]
    connection_limit: usize,

    /// Send budget in bytes per second across all sessions.
    #[arg(long)]
    bandwidth: Option<u64>,

    /// Dial private and loopback addresses.
    #[arg(long)]
    allow_local: bool,

    #[arg(short, long, default_value = "300")]
    info_interval: u64,
}

/// The uri this node announces to peers.
fn advertised_uri(advertise: Option<&str>, bound: SocketAddr) -> Result<String> {
    let addr = match advertise {
        None => bound,
        Some(raw) => {
            let raw = raw.strip_prefix(TCP_SCHEME).unwrap_or(raw);
            let mut addr = match raw.parse::<SocketAddr>() {
                Ok(addr) => addr,
                Err(_) => {
                    let ip: IpAddr = raw
                        .parse()
                        .with_context(|| format!("invalid advertised address {}", raw))?;
                    SocketAddr::new(ip, 0)
                }
            };
            if addr.port() == 0 {
                addr.set_port(bound.port());
            }
            addr
        }
    };
    if addr.ip().is_unspecified() {
        bail!(
            "cannot advertise wildcard address {}; pass --advertise with a reachable address",
            addr
        );
    }
    Ok(format!("{}{}", TCP_SCHEME, addr))
}

fn load_state(path: &Path) -> Result<Option<PersistedState>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let state = bincode::deserialize(&bytes)
        .with_context(|| format!("corrupt state file {}", path.display()))?;
    Ok(Some(state))
}

fn save_state(path: &Path, state: &PersistedState) -> Result<()> {
    let bytes = bincode::serialize(state).context("failed to encode state")?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
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

    let persisted = match &args.state {
        Some(path) => load_state(path)?,
        None => None,
    };

    let transport = TcpTransport::bind(&args.bind).await?;
    let local_uri = advertised_uri(args.advertise.as_deref(), transport.local_addr()?)?;
    let id = persisted
        .as_ref()
        .map_or_else(NodeId::random, |state| state.base_node.id);
    let base_node = Node::new(id, vec![local_uri.clone()]);
    info!(node = %id, uri = %local_uri, "node identity");

    let config = EngineConfig {
        connection_limit: args.connection_limit,
        bandwidth_limit: args.bandwidth,
        uri_filter: if args.allow_local {
            UriFilter::permissive()
        } else {
            UriFilter::default()
        },
        ..EngineConfig::default()
    };
    let engine = ConnectionsManager::new(
        base_node,
        config,
        Arc::new(transport),
        Arc::new(MemoryBlockStore::default()),
    );

    if let Some(state) = persisted {
        info!(nodes = state.other_nodes.len(), "restoring persisted state");
        engine.restore(state).await;
    }
    if !args.bootstrap.is_empty() {
        let mut nodes = engine.other_nodes().await;
        for peer in &args.bootstrap {
            info!(peer = %peer.id, uri = %peer.uri, "adding bootstrap peer");
            nodes.push(Node::new(peer.id, vec![peer.uri.clone()]));
        }
        engine.set_other_nodes(nodes).await;
    }

    engine.start().await?;

    let mut interval = time::interval(Duration::from_secs(args.info_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = engine.information().await;
                info!(
                    sessions = snapshot.sessions,
                    inbound = snapshot.inbound_sessions,
                    outbound = snapshot.outbound_sessions,
                    routing_nodes = snapshot.routing_nodes,
                    blacklisted = snapshot.blacklisted,
                    download_waiting = snapshot.download_waiting,
                    upload_waiting = snapshot.upload_waiting,
                    cached_seeds = snapshot.cached_seeds,
                    sent = snapshot.sent_bytes,
                    received = snapshot.received_bytes,
                    "engine snapshot"
                );
            }
        }
    }

    engine.stop().await;
    if let Some(path) = &args.state {
        let state = engine.persisted_state().await;
        if let Err(e) = save_state(path, &state) {
            warn!(error = %e, "failed to persist state");
        }
    }

    Ok(())
}
