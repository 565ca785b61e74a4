mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tessera_cluster::{
    serve, Cluster, ClusterSecret, Consensus, Fsm, ListenerOptions, NodeId, NodeInfo, RaftNode,
    RaftState,
};
use tessera_core::Engine;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::TesseraConfig;

#[derive(Parser)]
#[command(name = "tessera-server", about = "tessera cluster node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "TESSERA_BIND")]
    bind: Option<String>,

    /// port to listen on
    #[arg(short, long, env = "TESSERA_PORT")]
    port: Option<u16>,

    /// host announced to other nodes. defaults to the bind address
    #[arg(long, env = "TESSERA_ANNOUNCE_HOST")]
    announce_host: Option<String>,

    /// require clients and peers to AUTH with this password
    #[arg(long, env = "TESSERA_REQUIREPASS")]
    requirepass: Option<String>,

    /// maximum number of concurrent connections
    #[arg(long, env = "TESSERA_MAXCLIENTS")]
    maxclients: Option<usize>,

    /// start a new cluster owning all 16384 slots
    #[arg(long, env = "TESSERA_AS_SEED")]
    as_seed: bool,

    /// data address of an existing member to join through
    #[arg(long, env = "TESSERA_SEED")]
    seed: Option<String>,

    /// join as a slave of this master (data address)
    #[arg(long, env = "TESSERA_MASTER")]
    master: Option<String>,

    /// raft listen address. defaults to bind:(port + raft port offset)
    #[arg(long, env = "TESSERA_RAFT_LISTEN")]
    raft_listen: Option<String>,

    /// raft address announced to peers
    #[arg(long, env = "TESSERA_RAFT_ADVERTISE")]
    raft_advertise: Option<String>,

    /// shared secret for authenticating raft transport
    #[arg(long, env = "TESSERA_CLUSTER_AUTH_PASS")]
    cluster_auth_pass: Option<String>,

    /// path to a file containing the cluster auth password (alternative to
    /// --cluster-auth-pass). trailing whitespace is trimmed.
    #[arg(long, env = "TESSERA_CLUSTER_AUTH_PASS_FILE")]
    cluster_auth_pass_file: Option<PathBuf>,

    /// master failover timeout in milliseconds
    #[arg(long, env = "TESSERA_FAILOVER_TIMEOUT_MS")]
    failover_timeout_ms: Option<u64>,

    /// interval between rebalance passes in milliseconds
    #[arg(long, env = "TESSERA_REBALANCE_INTERVAL_MS")]
    rebalance_interval_ms: Option<u64>,
}

/// Applies CLI overrides. Only `Some` values and set flags take effect.
fn apply_args(cfg: &mut TesseraConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(ref host) = args.announce_host {
        cfg.announce_host = host.clone();
    }
    if let Some(ref pass) = args.requirepass {
        cfg.requirepass = pass.clone();
    }
    if let Some(v) = args.maxclients {
        cfg.maxclients = v;
    }
    if args.as_seed {
        cfg.cluster.as_seed = true;
    }
    if let Some(ref seed) = args.seed {
        cfg.cluster.seed = seed.clone();
    }
    if let Some(ref master) = args.master {
        cfg.cluster.master = master.clone();
    }
    if let Some(ref v) = args.raft_listen {
        cfg.cluster.raft_listen = v.clone();
    }
    if let Some(ref v) = args.raft_advertise {
        cfg.cluster.raft_advertise = v.clone();
    }
    if let Some(ref pass) = args.cluster_auth_pass {
        cfg.cluster.auth_pass = pass.clone();
    }
    if let Some(v) = args.failover_timeout_ms {
        cfg.cluster.failover_timeout_ms = v;
    }
    if let Some(v) = args.rebalance_interval_ms {
        cfg.cluster.rebalance_interval_ms = v;
    }
}

fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// The config value and `--cluster-auth-pass-file` are mutually exclusive.
fn resolve_cluster_secret(cfg: &TesseraConfig, args: &Args) -> Option<Arc<ClusterSecret>> {
    if !cfg.cluster.auth_pass.is_empty() && args.cluster_auth_pass_file.is_some() {
        exit_err("error: --cluster-auth-pass and --cluster-auth-pass-file are mutually exclusive");
    }
    if !cfg.cluster.auth_pass.is_empty() {
        return Some(Arc::new(ClusterSecret::from_password(&cfg.cluster.auth_pass)));
    }
    if let Some(ref path) = args.cluster_auth_pass_file {
        match ClusterSecret::from_file(path) {
            Ok(secret) => return Some(Arc::new(secret)),
            Err(e) => exit_err(format!(
                "error: failed to read --cluster-auth-pass-file '{}': {e}",
                path.display()
            )),
        }
    }
    None
}

async fn bind(addr: &str, label: &str) -> TcpListener {
    TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind {label} listener on {addr}: {e}")))
}

/// Waits for the freshly bootstrapped raft group to elect this node.
async fn await_leadership(raft: &RaftNode) {
    for _ in 0..50 {
        if raft.state() == RaftState::Leader {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    exit_err("raft did not elect the seed as leader");
}

async fn join_cluster(cluster: &Arc<Cluster<RaftNode>>, cfg: &TesseraConfig) {
    let master = (!cfg.cluster.master.is_empty()).then(|| NodeId::from(cfg.cluster.master.as_str()));
    let attempts = cfg.cluster.join_attempts.max(1);
    for attempt in 1..=attempts {
        match cluster.join(&cfg.cluster.seed, master.as_ref()).await {
            Ok(()) => return,
            Err(e) if attempt < attempts => {
                warn!(attempt, seed = %cfg.cluster.seed, "join failed, retrying: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => exit_err(format!("failed to join cluster via {}: {e}", cfg.cluster.seed)),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match TesseraConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults -> TOML file -> CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => TesseraConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => TesseraConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.validate() {
        exit_err(format!("error: {e}"));
    }
    let secret = resolve_cluster_secret(&cfg, &args);
    let cluster_config = cfg
        .to_cluster_config()
        .unwrap_or_else(|e| exit_err(format!("error: {e}")));
    let raft_listen = cfg
        .raft_listen_address()
        .unwrap_or_else(|e| exit_err(format!("error: {e}")));

    info!(
        node = %cluster_config.self_id,
        raft = %cluster_config.raft_advertise,
        "tessera node starting..."
    );
    if cfg.requirepass().is_some() {
        info!("authentication enabled (requirepass set)");
    }
    if secret.is_some() {
        info!("raft transport authentication enabled");
    }

    let data_listener = bind(&format!("{}:{}", cfg.bind, cfg.port), "data").await;
    let raft_listener = bind(&raft_listen, "raft").await;

    let fsm = Arc::new(Fsm::new());
    let local = NodeInfo::new(
        cluster_config.self_id.clone(),
        cluster_config.raft_advertise.clone(),
    );
    let raft = RaftNode::start(local, raft_listener, fsm, secret)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to start raft node: {e}")));
    if cfg.cluster.as_seed {
        if let Err(e) = raft.bootstrap_single().await {
            exit_err(format!("failed to bootstrap raft: {e}"));
        }
        await_leadership(&raft).await;
    }

    let engine = Arc::new(Engine::new());
    let cluster = Cluster::new(cluster_config, engine, raft);
    let observer = cluster.spawn_observer();

    let options = ListenerOptions {
        requirepass: cfg.requirepass(),
        max_connections: cfg.maxclients,
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let server = tokio::spawn(serve(data_listener, Arc::clone(&cluster), options, shutdown));

    if cfg.cluster.as_seed {
        if let Err(e) = cluster.start_as_seed().await {
            exit_err(format!("failed to seed cluster: {e}"));
        }
    } else {
        join_cluster(&cluster, &cfg).await;
    }

    let background = cluster.spawn_background();
    info!("ready");

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("server error: {e}"),
        Err(e) => warn!("server task failed: {e}"),
    }

    for task in background {
        task.abort();
    }
    observer.abort();
    cluster.close();
    cluster.consensus().shutdown().await;
    info!("shutdown complete");
}
