use clap::Parser;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use carbitrage_cluster::cache::{reconciler, CacheStore};
use carbitrage_cluster::config::Config;
use carbitrage_cluster::raft::ConsensusHandle;
use carbitrage_cluster::routes::{self, AppState};
use carbitrage_cluster::logging;

#[derive(Parser, Debug)]
#[command(name = "node", about = "Runs one node of the replicated cache cluster")]
struct Args {
    /// Node id (one of the statically configured cluster members). Ignored
    /// if --config is given, since the config file carries its own node id.
    #[arg(long)]
    id: Option<u64>,

    /// Path to a TOML config file. When omitted, falls back to the built-in
    /// five-node default cluster for the given --id.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let id = args.id.ok_or_else(|| {
                anyhow::anyhow!("either --id or --config must be given")
            })?;
            Config::default_for_node(id)?
        }
    };

    logging::init(&config.logging)?;
    info!(node_id = config.cluster.node_id, bind = %config.server.bind_addr, "starting node");

    let config = Arc::new(config);
    let cache = Arc::new(
        CacheStore::new(&config.cluster.data_dir, config.cluster.node_id, config.upstream.cache_ttl_hours)
            .await?,
    );
    let consensus = ConsensusHandle::new(&config.cluster)?;
    consensus.clone().spawn_background(Arc::clone(&cache));

    let http = reqwest::Client::new();
    tokio::spawn(startup_pull(
        Arc::clone(&cache),
        http.clone(),
        config.clone(),
    ));
    tokio::spawn(reconcile_loop(
        Arc::clone(&cache),
        Arc::clone(&consensus),
        http.clone(),
        config.clone(),
    ));

    let state = Arc::new(AppState { config: Arc::clone(&config), consensus, cache, http });
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr).await?;
    info!("listening on {}", config.server.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Best-effort catch-up pull run once at startup: ask every peer who they
/// think the leader is, then pull whatever that leader already has. A fresh
/// cluster with no leader yet simply finds nothing to pull, which is fine.
async fn startup_pull(cache: Arc<CacheStore>, http: reqwest::Client, config: Arc<Config>) {
    let deadline = config.cluster.raft.health_probe_deadline();

    for (_, addr) in config.cluster.peers() {
        let url = format!("http://{addr}/leader");
        let Ok(resp) = http.get(&url).timeout(deadline).send().await else { continue };
        let Ok(body) = resp.json::<serde_json::Value>().await else { continue };
        let Some(leader_id) = body.get("leader_id").and_then(|v| v.as_u64()) else { continue };
        let Some(leader_addr) = config.cluster.members.get(&leader_id) else { continue };

        match reconciler::pull_from_peer(&cache, &http, *leader_addr, deadline).await {
            Ok(files) => {
                info!(files = files.len(), leader = leader_id, "startup pull from leader complete");
                return;
            }
            Err(err) => warn!("startup pull from leader {leader_id} failed: {err:#}"),
        }
    }
}

/// Sweeps every peer on two triggers: the periodic ~10s ticker, and an
/// immediate wakeup the moment this node becomes leader, so a freshly
/// elected leader doesn't wait a full interval before its first catch-up.
async fn reconcile_loop(
    cache: Arc<CacheStore>,
    consensus: Arc<ConsensusHandle>,
    http: reqwest::Client,
    config: Arc<Config>,
) {
    let mut interval = tokio::time::interval(config.cluster.raft.reconcile_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = consensus.wait_for_leadership() => {}
        }
        if !consensus.is_leader().await {
            continue;
        }
        let deadline = config.cluster.raft.health_probe_deadline();
        let peers: Vec<_> = config.cluster.peers().map(|(_, addr)| *addr).collect();
        reconciler::sweep_peers(&cache, &http, peers, deadline).await;
    }
}
