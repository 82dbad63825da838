use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::cache::{listings, reconciler, CacheStore, Listing};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use crate::raft::{Command, ConsensusHandle};

pub struct AppState {
    pub config: Arc<Config>,
    pub consensus: Arc<ConsensusHandle>,
    pub cache: Arc<CacheStore>,
    pub http: reqwest::Client,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/leader", get(leader))
        .route("/raft/request_vote", post(raft_request_vote))
        .route("/raft/append_entries", post(raft_append_entries))
        .route("/list-cache", get(list_cache))
        .route("/cache-meta", get(cache_meta))
        .route("/get-cache-file", get(get_cache_file))
        .route("/reconcile", post(reconcile))
        .route("/fetch", post(fetch_cars))
        .route("/client", post(cheapest_city))
        .route("/arbitrage", post(arbitrage))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    node_id: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody { status: "ok", node_id: state.consensus.node_id() })
}

#[derive(Serialize)]
struct LeaderBody {
    leader_id: Option<u64>,
    this_node: u64,
}

async fn leader(State(state): State<Arc<AppState>>) -> Json<LeaderBody> {
    let leader_id = state.consensus.current_leader().await;
    Json(LeaderBody { leader_id, this_node: state.consensus.node_id() })
}

async fn raft_request_vote(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    Json(state.consensus.handle_request_vote(req).await)
}

async fn raft_append_entries(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    Json(state.consensus.handle_append_entries(req).await)
}

#[derive(Serialize)]
struct ListCacheBody {
    files: Vec<String>,
}

async fn list_cache(State(state): State<Arc<AppState>>) -> AppResult<Json<ListCacheBody>> {
    let files = state.cache.list_files().await.map_err(AppError::Internal)?;
    Ok(Json(ListCacheBody { files }))
}

#[derive(Deserialize)]
struct FilenameParam {
    filename: String,
}

#[derive(Serialize)]
struct CacheMetaBody {
    filename: String,
    mtime: DateTime<Utc>,
}

async fn cache_meta(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FilenameParam>,
) -> AppResult<Json<CacheMetaBody>> {
    if !state.cache.exists(&params.filename).await {
        return Err(AppError::NotFound(format!("no cache file named {}", params.filename)));
    }
    let meta = state.cache.meta_for(&params.filename).await.map_err(AppError::Internal)?;
    Ok(Json(CacheMetaBody { filename: meta.filename, mtime: meta.modified }))
}

async fn get_cache_file(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FilenameParam>,
) -> AppResult<Vec<u8>> {
    if !state.cache.exists(&params.filename).await {
        return Err(AppError::NotFound(format!("no cache file named {}", params.filename)));
    }
    state.cache.read_raw(&params.filename).await.map_err(AppError::Internal)
}

#[derive(Serialize)]
struct ReconcileBody {
    status: &'static str,
    updated: Vec<String>,
}

async fn reconcile(State(state): State<Arc<AppState>>) -> AppResult<Json<ReconcileBody>> {
    if !state.consensus.is_leader().await {
        let leader_id = state.consensus.current_leader().await;
        return Err(AppError::NotLeader { leader_id });
    }

    let deadline = state.config.cluster.raft.health_probe_deadline();
    let peers: Vec<_> = state.config.cluster.peers().map(|(_, addr)| *addr).collect();
    let updated = reconciler::sweep_peers(&state.cache, &state.http, peers, deadline).await;
    info!(files = updated.len(), "manual reconciliation triggered");
    Ok(Json(ReconcileBody { status: "ok", updated }))
}

#[derive(Deserialize)]
pub struct FetchRequest {
    pub country: String,
    pub city: String,
    pub make: String,
    pub model: String,
}

#[derive(Serialize)]
struct FetchBody {
    num_cars: usize,
    city: String,
    model: String,
}

/// Leader-only: triggers a cache-aware fetch for a single city, refreshing
/// from upstream first if the cache is missing or stale. A fresh fetch is
/// written locally and proposed to the replicated log so followers pick it
/// up without hitting the upstream API themselves.
async fn fetch_cars(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchRequest>,
) -> AppResult<Json<FetchBody>> {
    let listings = fetch_and_cache(&state, &req).await?;
    Ok(Json(FetchBody { num_cars: listings.len(), city: req.city, model: req.model }))
}

async fn fetch_and_cache(state: &AppState, req: &FetchRequest) -> AppResult<Vec<Listing>> {
    if !state.consensus.is_leader().await {
        let leader_id = state.consensus.current_leader().await;
        return Err(AppError::NotLeader { leader_id });
    }

    let filename = CacheStore::fingerprint(&req.make, &req.model, &req.city);
    if matches!(state.cache.is_fresh(&filename).await.map_err(AppError::Internal)?, Some(true)) {
        return state.cache.read_listings(&filename).await.map_err(AppError::Internal);
    }

    let query = listings::FetchQuery {
        country: req.country.clone(),
        city: req.city.clone(),
        make: req.make.clone(),
        model: req.model.clone(),
    };
    let fetched = listings::fetch_cars(&state.http, &state.config.upstream, &query)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    state.cache.write_listings(&filename, &fetched).await.map_err(AppError::Internal)?;
    let bytes = state.cache.read_raw(&filename).await.map_err(AppError::Internal)?;
    state
        .consensus
        .propose(Command::ReplicateFile { filename, bytes })
        .await?;

    Ok(fetched)
}

#[derive(Deserialize)]
pub struct ClientRequest {
    pub country: String,
    pub city1: String,
    pub city2: String,
    pub make: String,
    pub model: String,
}

#[derive(Serialize)]
struct ClientBody {
    leader_id: u64,
    results: HashMap<String, Vec<Listing>>,
}

/// Leader-only: fetches (or serves cached) listings for both cities and
/// returns them as-is, keyed by the requested city name. Deciding which
/// city is cheaper is left to the caller, matching how the original's
/// `/client` route only gathered data and left the comparison to the
/// interactive CLI.
async fn cheapest_city(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClientRequest>,
) -> AppResult<Json<ClientBody>> {
    let city1 = req.city1.clone();
    let city2 = req.city2.clone();

    let listings1 = fetch_and_cache(
        &state,
        &FetchRequest { country: req.country.clone(), city: req.city1.clone(), make: req.make.clone(), model: req.model.clone() },
    )
    .await?;
    let listings2 = fetch_and_cache(
        &state,
        &FetchRequest { country: req.country, city: req.city2, make: req.make, model: req.model },
    )
    .await?;

    let mut results = HashMap::new();
    results.insert(city1, listings1);
    results.insert(city2, listings2);

    Ok(Json(ClientBody { leader_id: state.consensus.node_id(), results }))
}

#[derive(Serialize, Clone)]
struct ArbitrageCandidate {
    price: f64,
    mileage: f64,
    price_per_distance: f64,
    location: String,
}

#[derive(Serialize)]
struct ArbitrageBody {
    leader_id: u64,
    results: HashMap<String, ArbitrageCandidate>,
}

/// Leader-only: for each city, picks the listing with the lowest
/// price-to-mileage ratio (the best "price per mile of wear" candidate)
/// and reports both, keyed by the requested city name. The original only
/// ever computed this ratio inside the interactive CLI; this promotes it
/// to a proper endpoint so every caller gets the same answer regardless of
/// which client asks.
async fn arbitrage(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClientRequest>,
) -> AppResult<Json<ArbitrageBody>> {
    let city1 = req.city1.clone();
    let city2 = req.city2.clone();

    let listings1 = fetch_and_cache(
        &state,
        &FetchRequest { country: req.country.clone(), city: req.city1.clone(), make: req.make.clone(), model: req.model.clone() },
    )
    .await?;
    let listings2 = fetch_and_cache(
        &state,
        &FetchRequest { country: req.country, city: req.city2, make: req.make, model: req.model },
    )
    .await?;

    let best1 = best_price_per_distance(&listings1)
        .ok_or_else(|| AppError::NotFound(format!("no listings found for {city1}")))?;
    let best2 = best_price_per_distance(&listings2)
        .ok_or_else(|| AppError::NotFound(format!("no listings found for {city2}")))?;

    let mut results = HashMap::new();
    results.insert(city1, best1);
    results.insert(city2, best2);

    Ok(Json(ArbitrageBody { leader_id: state.consensus.node_id(), results }))
}

fn best_price_per_distance(listings: &[Listing]) -> Option<ArbitrageCandidate> {
    listings
        .iter()
        .filter(|l| l.mileage > 0.0)
        .map(|l| ArbitrageCandidate {
            price: l.price,
            mileage: l.mileage,
            price_per_distance: l.price / l.mileage,
            location: l.location.clone(),
        })
        .min_by(|a, b| a.price_per_distance.total_cmp(&b.price_per_distance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_price_per_distance_prefers_lower_ratio_over_lower_price() {
        let listings = vec![
            Listing { year: 2018, make: "Honda".into(), model: "Civic".into(), price: 17000.0, mileage: 100000.0, location: "Ottawa".into() },
            Listing { year: 2020, make: "Honda".into(), model: "Civic".into(), price: 15500.0, mileage: 10000.0, location: "Ottawa".into() },
        ];
        let best = best_price_per_distance(&listings).unwrap();
        assert_eq!(best.price, 17000.0);
    }

    #[test]
    fn best_price_per_distance_of_empty_list_is_none() {
        assert!(best_price_per_distance(&[]).is_none());
    }

    #[test]
    fn best_price_per_distance_skips_zero_mileage_listings() {
        let listings = vec![
            Listing { year: 2024, make: "Honda".into(), model: "Civic".into(), price: 24000.0, mileage: 0.0, location: "Ottawa".into() },
        ];
        assert!(best_price_per_distance(&listings).is_none());
    }
}
