use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use super::types::{LogEntry, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
}

/// Transport helpers used by the consensus module's election and replication
/// loops. Every call is bounded by the caller-supplied deadline; a timeout or
/// connection failure is reported as `None`, never as an error, since an
/// unreachable peer is an ordinary, expected outcome during normal operation.
pub async fn send_request_vote(
    client: &reqwest::Client,
    addr: SocketAddr,
    req: &RequestVoteRequest,
    deadline: Duration,
) -> Option<RequestVoteResponse> {
    let url = format!("http://{addr}/raft/request_vote");
    match client.post(&url).json(req).timeout(deadline).send().await {
        Ok(resp) => resp.json().await.ok(),
        Err(err) => {
            debug!("request_vote to {addr} failed: {err}");
            None
        }
    }
}

pub async fn send_append_entries(
    client: &reqwest::Client,
    addr: SocketAddr,
    req: &AppendEntriesRequest,
    deadline: Duration,
) -> Option<AppendEntriesResponse> {
    let url = format!("http://{addr}/raft/append_entries");
    match client.post(&url).json(req).timeout(deadline).send().await {
        Ok(resp) => resp.json().await.ok(),
        Err(err) => {
            debug!("append_entries to {addr} failed: {err}");
            None
        }
    }
}

pub async fn probe_health(
    client: &reqwest::Client,
    addr: SocketAddr,
    deadline: Duration,
) -> bool {
    let url = format!("http://{addr}/health");
    matches!(
        client.get(&url).timeout(deadline).send().await,
        Ok(resp) if resp.status().is_success()
    )
}
