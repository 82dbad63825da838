use rand::Rng;
use std::cmp::min;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::store::CacheStore;
use crate::config::{ClusterConfig, RaftTiming};
use crate::error::{AppError, AppResult};

use super::persistence::PersistentPaths;
use super::rpc::{
    probe_health, send_append_entries, send_request_vote, AppendEntriesRequest,
    AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::types::{Command, LogEntry, NodeId, Role};

struct ConsensusState {
    current_term: u64,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    role: Role,
    commit_index: u64,
    last_applied: u64,
    current_leader: Option<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_heartbeat: Instant,
    election_timeout: Duration,
}

impl ConsensusState {
    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else {
            self.log.get(index as usize - 1).map(|e| e.term).unwrap_or(0)
        }
    }
}

/// Drives the replicated log for one node: leader election, `AppendEntries`
/// and `RequestVote` handling, and advancing `commit_index` by majority
/// `match_index`. Wraps the mutable Raft state behind a single async mutex;
/// every method locks just long enough to read or mutate that state, then
/// releases it before doing any network I/O, so the lock is never held
/// across an RPC round trip.
pub struct ConsensusHandle {
    node_id: NodeId,
    members: HashMap<NodeId, SocketAddr>,
    quorum_size: usize,
    timing: RaftTiming,
    http: reqwest::Client,
    persistence: PersistentPaths,
    state: Mutex<ConsensusState>,
    leadership_notify: Notify,
}

impl ConsensusHandle {
    pub fn new(config: &ClusterConfig) -> AppResult<Arc<Self>> {
        let persistence = PersistentPaths::new(&config.data_dir, config.node_id);
        let current_term = persistence.load_term().map_err(AppError::Internal)?;
        let voted_for = persistence.load_voted_for().map_err(AppError::Internal)?;
        let log = persistence.load_log().map_err(AppError::Internal)?;
        let timing = config.raft.clone();

        let state = ConsensusState {
            current_term,
            voted_for,
            log,
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_heartbeat: Instant::now(),
            election_timeout: random_election_timeout(&timing),
        };

        Ok(Arc::new(ConsensusHandle {
            node_id: config.node_id,
            members: config.members.clone(),
            quorum_size: config.quorum_size(),
            timing,
            http: reqwest::Client::new(),
            persistence,
            state: Mutex::new(state),
            leadership_notify: Notify::new(),
        }))
    }

    fn peers(&self) -> impl Iterator<Item = (NodeId, SocketAddr)> + '_ {
        let node_id = self.node_id;
        self.members
            .iter()
            .filter(move |(id, _)| **id != node_id)
            .map(|(id, addr)| (*id, *addr))
    }

    /// Spawns the two background workers every running node needs: the
    /// tick loop (election timeouts and heartbeats) and the apply loop
    /// (draining committed entries into the cache store). Fire-and-forget:
    /// both tasks run for the lifetime of the process.
    pub fn spawn_background(self: Arc<Self>, cache: Arc<CacheStore>) {
        let tick_handle = Arc::clone(&self);
        tokio::spawn(async move { tick_handle.tick_loop().await });

        let apply_handle = Arc::clone(&self);
        tokio::spawn(async move { apply_handle.apply_loop(cache).await });
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timing.tick_interval());
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    async fn tick(self: &Arc<Self>) {
        let (role, should_fire) = {
            let state = self.state.lock().await;
            let elapsed = state.last_heartbeat.elapsed();
            let should_fire = match state.role {
                Role::Leader => elapsed >= self.timing.heartbeat_interval(),
                Role::Follower | Role::Candidate => elapsed >= state.election_timeout,
            };
            (state.role, should_fire)
        };

        if !should_fire {
            return;
        }

        match role {
            Role::Leader => self.send_heartbeats().await,
            Role::Follower | Role::Candidate => self.start_election().await,
        }
    }

    async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().await;
            state.current_term += 1;
            state.role = Role::Candidate;
            state.voted_for = Some(self.node_id);
            state.last_heartbeat = Instant::now();
            state.election_timeout = random_election_timeout(&self.timing);
            if let Err(err) = self.persist_term_and_vote(&state) {
                warn!("failed to persist term on election: {err:#}");
            }
            (state.current_term, state.last_log_index(), state.last_log_term())
        };

        info!(node_id = self.node_id, term, "starting election");

        let req = RequestVoteRequest {
            term,
            candidate_id: self.node_id,
            last_log_index,
            last_log_term,
        };

        let mut votes = 1usize;
        let mut highest_seen_term = term;
        let mut set = JoinSet::new();
        for (_, addr) in self.peers() {
            let client = self.http.clone();
            let req = req.clone();
            let deadline = self.timing.vote_deadline();
            set.spawn(async move { send_request_vote(&client, addr, &req, deadline).await });
        }
        while let Some(result) = set.join_next().await {
            if let Ok(Some(RequestVoteResponse { term: resp_term, vote_granted })) = result {
                if resp_term > highest_seen_term {
                    highest_seen_term = resp_term;
                }
                if vote_granted {
                    votes += 1;
                }
            }
        }

        if highest_seen_term > term {
            self.step_down(highest_seen_term).await;
            return;
        }

        if votes >= self.quorum_size {
            self.become_leader(term).await;
        } else {
            debug!(node_id = self.node_id, term, votes, "election did not reach quorum");
        }
    }

    async fn become_leader(self: &Arc<Self>, election_term: u64) {
        let mut state = self.state.lock().await;
        if state.role != Role::Candidate || state.current_term != election_term {
            return;
        }
        state.role = Role::Leader;
        state.current_leader = Some(self.node_id);
        let next = state.last_log_index() + 1;
        state.next_index = self.members.keys().map(|id| (*id, next)).collect();
        state.match_index = self.members.keys().map(|id| (*id, 0)).collect();
        state.log.push(LogEntry {
            term: election_term,
            command: Command::SetLeader { leader_id: self.node_id },
        });
        if let Err(err) = self.persist_log(&state) {
            warn!("failed to persist log on election: {err:#}");
        }
        drop(state);

        info!(node_id = self.node_id, term = election_term, "became leader");
        self.leadership_notify.notify_one();
        self.send_heartbeats().await;
    }

    async fn step_down(&self, new_term: u64) {
        let mut state = self.state.lock().await;
        if new_term > state.current_term {
            state.current_term = new_term;
            state.voted_for = None;
        }
        state.role = Role::Follower;
        state.last_heartbeat = Instant::now();
        state.election_timeout = random_election_timeout(&self.timing);
        if let Err(err) = self.persist_term_and_vote(&state) {
            warn!("failed to persist term on step down: {err:#}");
        }
    }

    fn persist_term_and_vote(&self, state: &ConsensusState) -> anyhow::Result<()> {
        self.persistence.save_term(state.current_term)?;
        self.persistence.save_voted_for(state.voted_for)?;
        Ok(())
    }

    fn persist_log(&self, state: &ConsensusState) -> anyhow::Result<()> {
        self.persistence.save_log(&state.log)
    }

    /// Lets the reconciliation loop wake up immediately on a role transition
    /// to leader, instead of waiting for the next periodic sweep tick.
    pub async fn wait_for_leadership(&self) {
        self.leadership_notify.notified().await;
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.lock().await;

        if req.term < state.current_term {
            return RequestVoteResponse { term: state.current_term, vote_granted: false };
        }

        let mut persist_needed = false;
        if req.term > state.current_term {
            state.current_term = req.term;
            state.voted_for = None;
            state.role = Role::Follower;
            persist_needed = true;
        }

        let log_ok = req.last_log_term > state.last_log_term()
            || (req.last_log_term == state.last_log_term() && req.last_log_index >= state.last_log_index());
        let can_vote = state.voted_for.is_none() || state.voted_for == Some(req.candidate_id);

        let grant = log_ok && can_vote;
        if grant {
            state.voted_for = Some(req.candidate_id);
            state.last_heartbeat = Instant::now();
            state.election_timeout = random_election_timeout(&self.timing);
            persist_needed = true;
        }

        if persist_needed {
            if let Err(err) = self.persist_term_and_vote(&state) {
                warn!("failed to persist term on vote: {err:#}");
            }
        }

        RequestVoteResponse { term: state.current_term, vote_granted: grant }
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;

        if req.term < state.current_term {
            return AppendEntriesResponse { term: state.current_term, success: false };
        }

        let term_changed = req.term > state.current_term;
        if term_changed {
            state.current_term = req.term;
            state.voted_for = None;
        }
        state.role = Role::Follower;
        state.current_leader = Some(req.leader_id);
        state.last_heartbeat = Instant::now();
        state.election_timeout = random_election_timeout(&self.timing);

        if term_changed {
            if let Err(err) = self.persist_term_and_vote(&state) {
                warn!("failed to persist term on append_entries: {err:#}");
            }
        }

        if req.prev_log_index > 0 {
            if req.prev_log_index > state.last_log_index()
                || state.term_at(req.prev_log_index) != req.prev_log_term
            {
                return AppendEntriesResponse { term: state.current_term, success: false };
            }
        }

        let mut log_changed = false;
        for (i, entry) in req.entries.into_iter().enumerate() {
            let idx = req.prev_log_index + i as u64 + 1;
            if idx <= state.last_log_index() {
                if state.term_at(idx) != entry.term {
                    state.log.truncate(idx as usize - 1);
                    state.log.push(entry);
                    log_changed = true;
                }
            } else {
                state.log.push(entry);
                log_changed = true;
            }
        }

        if log_changed {
            if let Err(err) = self.persist_log(&state) {
                warn!("failed to persist log on append_entries: {err:#}");
            }
        }

        if req.leader_commit > state.commit_index {
            state.commit_index = min(req.leader_commit, state.last_log_index());
        }

        AppendEntriesResponse { term: state.current_term, success: true }
    }

    async fn send_heartbeats(self: &Arc<Self>) {
        let (term, commit_index, snapshot) = {
            let state = self.state.lock().await;
            if state.role != Role::Leader {
                return;
            }
            (state.current_term, state.commit_index, ReplicationSnapshot::capture(&state))
        };

        let health_deadline = self.timing.health_probe_deadline();
        let append_deadline = self.timing.append_entries_deadline();

        let mut set = JoinSet::new();
        for (peer_id, addr) in self.peers() {
            let next = *snapshot.next_index.get(&peer_id).unwrap_or(&1);
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = snapshot.term_at(prev_log_index);
            let entries = snapshot.entries_from(next);
            let entries_len = entries.len() as u64;

            let req = AppendEntriesRequest {
                term,
                leader_id: self.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };
            let client = self.http.clone();
            set.spawn(async move {
                if !probe_health(&client, addr, health_deadline).await {
                    return (peer_id, prev_log_index, entries_len, None);
                }
                let resp = send_append_entries(&client, addr, &req, append_deadline).await;
                (peer_id, prev_log_index, entries_len, resp)
            });
        }

        let mut highest_seen_term = term;
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((peer_id, prev_log_index, entries_len, Some(resp))) = joined {
                if resp.term > highest_seen_term {
                    highest_seen_term = resp.term;
                }
                results.push((peer_id, prev_log_index, entries_len, resp));
            }
        }

        if highest_seen_term > term {
            self.step_down(highest_seen_term).await;
            return;
        }

        let mut state = self.state.lock().await;
        if state.role != Role::Leader || state.current_term != term {
            return;
        }
        for (peer_id, prev_log_index, entries_len, resp) in results {
            apply_append_entries_result(&mut state, peer_id, prev_log_index, entries_len, &resp);
        }
        try_advance_commit_index(&mut state, self.quorum_size);
    }

    pub async fn probe_peers_health(&self) -> HashMap<NodeId, bool> {
        let deadline = self.timing.health_probe_deadline();
        let mut set = JoinSet::new();
        for (peer_id, addr) in self.peers() {
            let client = self.http.clone();
            set.spawn(async move { (peer_id, probe_health(&client, addr, deadline).await) });
        }
        let mut result = HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((peer_id, healthy)) = joined {
                result.insert(peer_id, healthy);
            }
        }
        result
    }

    /// Appends `command` to the leader's log and kicks off a best-effort
    /// replication round. Returns as soon as the entry is appended locally;
    /// callers that need durability should poll `commit_index`/`last_applied`
    /// rather than block here, matching how the cache reconciler uses this.
    pub async fn propose(self: &Arc<Self>, command: Command) -> AppResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return Err(AppError::NotLeader { leader_id: state.current_leader });
            }
            state.log.push(LogEntry { term: state.current_term, command });
            if let Err(err) = self.persist_log(&state) {
                warn!("failed to persist log on propose: {err:#}");
            }
        }

        let handle = Arc::clone(self);
        tokio::spawn(async move { handle.send_heartbeats().await });
        Ok(())
    }

    async fn apply_loop(self: Arc<Self>, cache: Arc<CacheStore>) {
        let mut interval = tokio::time::interval(self.timing.tick_interval());
        loop {
            interval.tick().await;
            self.apply_committed(&cache).await;
        }
    }

    async fn apply_committed(&self, cache: &CacheStore) {
        loop {
            let entry = {
                let mut state = self.state.lock().await;
                if state.last_applied >= state.commit_index {
                    return;
                }
                state.last_applied += 1;
                state.log[state.last_applied as usize - 1].clone()
            };

            match entry.command {
                Command::SetLeader { leader_id } => {
                    let mut state = self.state.lock().await;
                    state.current_leader = Some(leader_id);
                }
                Command::ReplicateFile { filename, bytes } => {
                    if let Err(err) = cache.write_replicated_file(&filename, &bytes).await {
                        warn!("failed to apply replicated file {filename}: {err:#}");
                    }
                }
            }
        }
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.state.lock().await.current_leader
    }

    pub async fn current_term(&self) -> u64 {
        self.state.lock().await.current_term
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

struct ReplicationSnapshot {
    log: Vec<LogEntry>,
    next_index: HashMap<NodeId, u64>,
}

impl ReplicationSnapshot {
    fn capture(state: &ConsensusState) -> Self {
        ReplicationSnapshot { log: state.log.clone(), next_index: state.next_index.clone() }
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else {
            self.log.get(index as usize - 1).map(|e| e.term).unwrap_or(0)
        }
    }

    fn entries_from(&self, next: u64) -> Vec<LogEntry> {
        if next == 0 || (next as usize) > self.log.len() + 1 {
            return Vec::new();
        }
        self.log[(next as usize - 1).min(self.log.len())..].to_vec()
    }
}

fn apply_append_entries_result(
    state: &mut ConsensusState,
    peer_id: NodeId,
    prev_log_index: u64,
    entries_len: u64,
    resp: &AppendEntriesResponse,
) {
    if resp.success {
        let match_index = prev_log_index + entries_len;
        state.match_index.insert(peer_id, match_index);
        state.next_index.insert(peer_id, match_index + 1);
    } else {
        let current = *state.next_index.get(&peer_id).unwrap_or(&1);
        state.next_index.insert(peer_id, current.saturating_sub(1).max(1));
    }
}

fn try_advance_commit_index(state: &mut ConsensusState, quorum_size: usize) {
    let last = state.last_log_index();
    let mut candidate = state.commit_index;
    for n in (state.commit_index + 1)..=last {
        if state.term_at(n) != state.current_term {
            continue;
        }
        let replicated = 1 + state.match_index.values().filter(|&&m| m >= n).count();
        if replicated >= quorum_size {
            candidate = n;
        }
    }
    state.commit_index = candidate;
}

fn random_election_timeout(timing: &RaftTiming) -> Duration {
    let mut rng = rand::thread_rng();
    let ms = rng.gen_range(timing.election_timeout_min_ms..=timing.election_timeout_max_ms);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64) -> LogEntry {
        LogEntry { term, command: Command::SetLeader { leader_id: 1 } }
    }

    fn state_with_log(terms: &[u64]) -> ConsensusState {
        ConsensusState {
            current_term: terms.last().copied().unwrap_or(0),
            voted_for: None,
            log: terms.iter().map(|t| entry(*t)).collect(),
            role: Role::Leader,
            commit_index: 0,
            last_applied: 0,
            current_leader: Some(1),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_heartbeat: Instant::now(),
            election_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn commit_index_advances_only_on_current_term_majority() {
        let mut state = state_with_log(&[1, 1, 2]);
        state.match_index.insert(2, 3);
        state.match_index.insert(3, 1);
        state.match_index.insert(4, 1);
        state.match_index.insert(5, 0);
        // members: self(1) + 4 peers => quorum 3
        try_advance_commit_index(&mut state, 3);
        assert_eq!(state.commit_index, 3);
    }

    #[test]
    fn commit_index_does_not_advance_past_older_term_entries_without_current_term_entry() {
        let mut state = state_with_log(&[1, 1]);
        state.match_index.insert(2, 2);
        state.match_index.insert(3, 2);
        state.match_index.insert(4, 0);
        state.match_index.insert(5, 0);
        // current_term is 1 here (last entry's term), so matching entries do count;
        // flip to a higher current_term with no entry of that term yet.
        state.current_term = 2;
        try_advance_commit_index(&mut state, 3);
        assert_eq!(state.commit_index, 0);
    }

    #[test]
    fn apply_append_entries_result_tracks_match_and_next_index() {
        let mut state = state_with_log(&[1, 1, 1]);
        state.next_index.insert(2, 1);
        state.next_index.insert(3, 5);
        apply_append_entries_result(
            &mut state,
            2,
            0,
            3,
            &AppendEntriesResponse { term: 1, success: true },
        );
        assert_eq!(state.match_index[&2], 3);
        assert_eq!(state.next_index[&2], 4);

        apply_append_entries_result(
            &mut state,
            3,
            4,
            0,
            &AppendEntriesResponse { term: 1, success: false },
        );
        assert_eq!(state.next_index[&3], 4);
    }

    #[test]
    fn apply_append_entries_result_backoff_floors_at_one() {
        let mut state = state_with_log(&[1]);
        state.next_index.insert(2, 1);
        apply_append_entries_result(
            &mut state,
            2,
            0,
            0,
            &AppendEntriesResponse { term: 1, success: false },
        );
        assert_eq!(state.next_index[&2], 1);
    }
}
