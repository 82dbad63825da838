use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::store::CacheStore;

#[derive(Debug, Deserialize)]
struct ListCacheReply {
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CacheMetaReply {
    #[allow(dead_code)]
    filename: String,
    mtime: DateTime<Utc>,
}

/// Cache sync is deliberately outside the replicated log: it is a plain
/// mtime-based last-writer-wins file copy over HTTP, used to catch a node
/// up on files some other node already has, not to agree on an ordering.
/// Two entry points drive it: a follower pulls once from the leader right
/// after startup, and the leader periodically sweeps every follower to pull
/// in anything they picked up independently (e.g. a follower that briefly
/// held an upstream fetch result before losing leadership).
///
/// Follows the three-step protocol verbatim: list the peer's filenames,
/// fetch each one's mtime individually, then pull the bytes only for files
/// that are missing locally or strictly newer on the peer.
pub async fn pull_from_peer(
    store: &CacheStore,
    client: &reqwest::Client,
    peer_addr: SocketAddr,
    deadline: Duration,
) -> Result<Vec<String>> {
    let filenames = fetch_remote_filenames(client, peer_addr, deadline).await?;
    let mut pulled = Vec::new();

    for filename in filenames {
        let remote_mtime = match fetch_remote_meta(client, peer_addr, &filename, deadline).await {
            Ok(meta) => meta.mtime,
            Err(err) => {
                debug!(peer = %peer_addr, file = %filename, "could not fetch cache-meta: {err:#}");
                continue;
            }
        };

        let should_pull = match store.is_fresh(&filename).await {
            Ok(None) => true,
            Ok(Some(_)) => match store.meta_for(&filename).await {
                Ok(local) => remote_mtime > local.modified,
                Err(_) => true,
            },
            Err(_) => true,
        };

        if !should_pull {
            continue;
        }

        match fetch_remote_file(client, peer_addr, &filename, deadline).await {
            Ok(bytes) => {
                store
                    .write_replicated_file(&filename, &bytes)
                    .await
                    .with_context(|| format!("writing pulled file {filename}"))?;
                pulled.push(filename.clone());
                debug!(peer = %peer_addr, file = %filename, "pulled cache file");
            }
            Err(err) => warn!(peer = %peer_addr, file = %filename, "failed to pull cache file: {err:#}"),
        }
    }

    Ok(pulled)
}

pub async fn sweep_peers(
    store: &CacheStore,
    client: &reqwest::Client,
    peers: impl IntoIterator<Item = SocketAddr>,
    deadline: Duration,
) -> Vec<String> {
    let mut updated = Vec::new();
    for addr in peers {
        match pull_from_peer(store, client, addr, deadline).await {
            Ok(files) if files.is_empty() => {}
            Ok(files) => {
                info!(peer = %addr, files = files.len(), "reconciliation sweep pulled files");
                updated.extend(files);
            }
            Err(err) => debug!(peer = %addr, "reconciliation sweep skipped peer: {err:#}"),
        }
    }
    updated
}

async fn fetch_remote_filenames(
    client: &reqwest::Client,
    addr: SocketAddr,
    deadline: Duration,
) -> Result<Vec<String>> {
    let url = format!("http://{addr}/list-cache");
    let resp = client
        .get(&url)
        .timeout(deadline)
        .send()
        .await
        .with_context(|| format!("requesting list-cache from {addr}"))?
        .error_for_status()
        .with_context(|| format!("list-cache from {addr} returned an error status"))?;
    let reply: ListCacheReply = resp.json().await.context("parsing list-cache response")?;
    Ok(reply.files)
}

async fn fetch_remote_meta(
    client: &reqwest::Client,
    addr: SocketAddr,
    filename: &str,
    deadline: Duration,
) -> Result<CacheMetaReply> {
    let url = format!("http://{addr}/cache-meta?filename={filename}");
    let resp = client
        .get(&url)
        .timeout(deadline)
        .send()
        .await
        .with_context(|| format!("requesting cache-meta for {filename} from {addr}"))?
        .error_for_status()
        .with_context(|| format!("cache-meta for {filename} from {addr} returned an error status"))?;
    resp.json().await.context("parsing cache-meta response")
}

async fn fetch_remote_file(
    client: &reqwest::Client,
    addr: SocketAddr,
    filename: &str,
    deadline: Duration,
) -> Result<Vec<u8>> {
    let url = format!("http://{addr}/get-cache-file?filename={filename}");
    let resp = client
        .get(&url)
        .timeout(deadline)
        .send()
        .await
        .with_context(|| format!("requesting cache file {filename} from {addr}"))?
        .error_for_status()
        .with_context(|| format!("cache file {filename} from {addr} returned an error status"))?;
    Ok(resp.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn is_fresh_none_means_remote_should_be_pulled() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 217, 24).await.unwrap();
        assert_eq!(store.is_fresh("toyota_corolla_ottawa.csv").await.unwrap(), None);
    }
}
