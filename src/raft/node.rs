use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::{NodeConfig, PeerConfig};
use crate::error::{RaftError, Result};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::rpc::{self, log_entry_to_proto};
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::storage::Storage;

/// Message delivered to the owning service for each committed entry.
///
/// Commands arrive in strictly increasing index order, exactly once per
/// process lifetime. The `Snapshot` variant is the delivery contract for
/// snapshot installation at the state-machine boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyMsg {
    Command {
        index: u64,
        command: Vec<u8>,
    },
    Snapshot {
        index: u64,
        term: u64,
        data: Vec<u8>,
    },
}

/// Lazily connected gRPC clients for the other cluster members.
///
/// `disconnect`/`reconnect` toggle reachability without touching endpoint
/// configuration; calls to a disconnected peer fail immediately as
/// unreachable, which is how the tests carve network partitions.
pub struct PeerSet {
    peers: Vec<PeerConfig>,
    clients: Mutex<HashMap<u64, RaftServiceClient<Channel>>>,
    blocked: Mutex<HashSet<u64>>,
}

impl PeerSet {
    fn new(peers: Vec<PeerConfig>) -> Self {
        Self {
            peers,
            clients: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
        }
    }

    async fn client(&self, peer_id: u64) -> Result<RaftServiceClient<Channel>> {
        if self.blocked.lock().await.contains(&peer_id) {
            return Err(RaftError::PeerUnreachable(peer_id));
        }

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&peer_id) {
            return Ok(client.clone());
        }

        let peer = self
            .peers
            .iter()
            .find(|p| p.node_id == peer_id)
            .ok_or(RaftError::PeerUnreachable(peer_id))?;
        let endpoint = Endpoint::from_shared(format!("http://{}", peer.addr))?;
        let client = RaftServiceClient::new(endpoint.connect_lazy());
        clients.insert(peer_id, client.clone());
        Ok(client)
    }

    async fn request_vote(
        &self,
        peer_id: u64,
        req: VoteRequest,
        rpc_timeout: Duration,
    ) -> Result<VoteResponse> {
        let mut client = self.client(peer_id).await?;
        match timeout(rpc_timeout, client.request_vote(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(RaftError::Grpc(status)),
            Err(_) => Err(RaftError::RpcTimeout(peer_id)),
        }
    }

    async fn append_entries(
        &self,
        peer_id: u64,
        req: AppendEntriesRequest,
        rpc_timeout: Duration,
    ) -> Result<AppendEntriesResponse> {
        let mut client = self.client(peer_id).await?;
        match timeout(rpc_timeout, client.append_entries(req)).await {
            Ok(Ok(resp)) => Ok(resp.into_inner()),
            Ok(Err(status)) => Err(RaftError::Grpc(status)),
            Err(_) => Err(RaftError::RpcTimeout(peer_id)),
        }
    }

    async fn disconnect(&self, peer_id: u64) {
        self.blocked.lock().await.insert(peer_id);
        self.clients.lock().await.remove(&peer_id);
    }

    async fn reconnect(&self, peer_id: u64) {
        self.blocked.lock().await.remove(&peer_id);
    }
}

/// One member of the replicated-log cluster.
///
/// All mutable consensus state lives behind a single lock (`state`); the
/// background loops and RPC handlers snapshot what they need under the lock,
/// release it, and never hold it across a network call or an apply-channel
/// send.
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    storage: Arc<dyn Storage>,
    peers: Arc<PeerSet>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    commit_tx: watch::Sender<u64>,
    last_heartbeat: Arc<RwLock<Instant>>,
    cancel: CancellationToken,
}

impl RaftNode {
    /// Construct a node, restoring the persistent triple if the storage
    /// holds one from a previous life. Background activity starts when the
    /// caller spawns [`RaftNode::run`].
    pub fn new(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Self> {
        let mut state = RaftState::new();
        if let Some(persisted) = storage.load()? {
            tracing::info!(
                node_id = config.node_id,
                term = persisted.current_term,
                log_len = persisted.log.len(),
                snapshot_index = persisted.snapshot_index,
                "Restored persistent state"
            );
            state.restore(persisted);
        }

        let (commit_tx, _) = watch::channel(state.commit_index);

        Ok(Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(state)),
            peers: Arc::new(PeerSet::new(config.peers.clone())),
            config,
            storage,
            apply_tx,
            commit_tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            cancel: CancellationToken::new(),
        })
    }

    /// Run the node's background activities: the election-timeout watchdog,
    /// the leader heartbeat/replication driver, and the applier that feeds
    /// committed entries to the owning service. Returns once `kill` is
    /// called.
    pub async fn run(self: Arc<Self>) {
        tokio::join!(
            self.clone().election_loop(),
            self.clone().heartbeat_loop(),
            self.clone().apply_loop(),
        );
        tracing::debug!(node_id = self.id, "Raft node stopped");
    }

    /// Start agreement on a new command.
    ///
    /// On the leader this appends the entry locally, persists it, kicks a
    /// replication round, and returns `(index, term)` without waiting for
    /// commit - the caller observes commitment through the apply channel.
    /// On any other node it returns `NotLeader` and mutates nothing.
    pub async fn start(self: &Arc<Self>, command: Vec<u8>) -> Result<(u64, u64)> {
        if self.cancel.is_cancelled() {
            return Err(RaftError::Shutdown);
        }

        let (index, term, advanced) = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(state.leader_id));
            }
            let entry = state.append_entry(command);
            let placed = (entry.index, entry.term);
            self.persist(&state)?;
            // a majority of one is satisfied by the local append alone
            (placed.0, placed.1, self.advance_commit(&mut state))
        };

        if let Some(commit_index) = advanced {
            self.notify_commit(commit_index);
        }

        tracing::debug!(node_id = self.id, index, term, "Appended command to log");

        // push to followers right away instead of waiting for the next
        // heartbeat tick
        tokio::spawn(self.clone().broadcast_append_entries());

        Ok((index, term))
    }

    /// Current `(term, is_leader)` as one atomic snapshot. Never touches
    /// the network.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.read().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Get the current term
    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    /// Get the current leader ID, if one is known
    pub async fn get_leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    /// Watch commit-index progression without consuming the apply channel.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Stop all background activity. Idempotent; pending RPC handlers
    /// refuse further work once called.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The owning service has durably incorporated everything up to and
    /// including `index` into its own state; discard those entries and
    /// anchor the log at `(index, term)`. Entries after `index` are kept
    /// and elections/replication keep working from the anchor.
    pub async fn snapshot(&self, index: u64, data: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RaftError::Shutdown);
        }

        let mut state = self.state.write().await;
        if index <= state.snapshot_index {
            return Ok(()); // already compacted past this point
        }
        if index > state.commit_index {
            return Err(RaftError::SnapshotAheadOfCommit {
                index,
                commit_index: state.commit_index,
            });
        }
        let term = state.term_at(index).ok_or_else(|| {
            RaftError::Internal(format!("committed entry {index} missing from log"))
        })?;

        state.compact_to(index, term);
        self.persist(&state)?;

        tracing::info!(
            node_id = self.id,
            snapshot_index = index,
            snapshot_term = term,
            snapshot_bytes = data.len(),
            "Compacted log through snapshot index"
        );
        Ok(())
    }

    /// Drop the connection to a peer; outgoing calls fail until
    /// `reconnect_peer`. Used to simulate partitions.
    pub async fn disconnect_peer(&self, peer_id: u64) {
        self.peers.disconnect(peer_id).await;
    }

    /// Restore the connection to a previously disconnected peer.
    pub async fn reconnect_peer(&self, peer_id: u64) {
        self.peers.reconnect(peer_id).await;
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        if self.cancel.is_cancelled() {
            return Err(RaftError::Shutdown);
        }

        let resp = {
            let mut state = self.state.write().await;
            let (resp, persist) = rpc::handle_request_vote(&mut state, &req, self.id);
            if persist {
                self.persist(&state)?;
            }
            resp
        };

        // Reset election timeout if we granted the vote
        if resp.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        Ok(resp)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if self.cancel.is_cancelled() {
            return Err(RaftError::Shutdown);
        }

        let req_term = req.term;
        let (resp, commit_index) = {
            let mut state = self.state.write().await;
            let (resp, persist) = rpc::handle_append_entries(&mut state, &req, self.id);
            if persist {
                self.persist(&state)?;
            }
            (resp, state.commit_index)
        };

        // Contact from the legitimate leader of this term resets the
        // election timeout, whether or not the consistency check passed
        if resp.term == req_term {
            *self.last_heartbeat.write().await = Instant::now();
        }

        self.notify_commit(commit_index);

        Ok(resp)
    }

    /// Election-timeout watchdog. Followers and candidates that go a full
    /// randomized timeout without leader contact start a new election.
    async fn election_loop(self: Arc<Self>) {
        loop {
            let timeout_len = random_election_timeout(
                self.config.election_timeout_min_ms,
                self.config.election_timeout_max_ms,
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(timeout_len) => {
                    if self.state.read().await.role == RaftRole::Leader {
                        continue;
                    }
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= timeout_len {
                        tracing::info!(
                            node_id = self.id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Election timeout, starting election"
                        );
                        self.clone().start_election().await;
                    }
                }
            }
        }
    }

    /// Leader pacing: one combined heartbeat/replication round per tick.
    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.config.heartbeat_interval()) => {
                    if self.state.read().await.role == RaftRole::Leader {
                        self.clone().broadcast_append_entries().await;
                    }
                }
            }
        }
    }

    /// Start a new election round: bump the term, vote for ourselves, and
    /// fan RequestVote out to every peer in parallel. Replies are applied
    /// by per-peer tasks through `record_vote`.
    async fn start_election(self: Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.write().await;
            state.become_candidate(self.id);
            if self.persist(&state).is_err() {
                return;
            }
            (
                state.current_term,
                state.last_log_index(),
                state.last_log_term(),
            )
        };
        *self.last_heartbeat.write().await = Instant::now();

        tracing::info!(node_id = self.id, term, "Starting election");

        // The self-vote alone can carry a cluster of one
        let won = {
            let mut state = self.state.write().await;
            self.maybe_become_leader(&mut state, term)
        };
        if won {
            self.clone().broadcast_append_entries().await;
            return;
        }

        for peer in &self.config.peers {
            let peer_id = peer.node_id;
            let req = VoteRequest {
                term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
            };
            let node = self.clone();
            tokio::spawn(async move {
                match node
                    .peers
                    .request_vote(peer_id, req, node.config.rpc_timeout())
                    .await
                {
                    Ok(resp) => node.record_vote(peer_id, term, resp).await,
                    Err(e) => {
                        tracing::debug!(peer_id, error = %e, "Vote request failed");
                    }
                }
            });
        }
    }

    /// Apply one vote reply. The role/term re-check means replies from an
    /// abandoned round can never elect a stale candidate.
    async fn record_vote(self: Arc<Self>, peer_id: u64, round_term: u64, resp: VoteResponse) {
        let won = {
            let mut state = self.state.write().await;

            if resp.term > state.current_term {
                tracing::info!(
                    node_id = self.id,
                    peer_id,
                    term = resp.term,
                    "Higher term in vote reply, abandoning candidacy"
                );
                state.become_follower(resp.term);
                let _ = self.persist(&state);
                return;
            }

            if state.role != RaftRole::Candidate
                || state.current_term != round_term
                || !resp.vote_granted
            {
                return;
            }

            state.votes_received += 1;
            tracing::debug!(
                node_id = self.id,
                peer_id,
                votes = state.votes_received,
                "Received vote"
            );

            self.maybe_become_leader(&mut state, round_term)
        };

        if won {
            // establish authority before the first paced heartbeat tick
            self.broadcast_append_entries().await;
        }
    }

    /// Candidate -> Leader transition once the vote count reaches a strict
    /// majority within the same election round.
    fn maybe_become_leader(&self, state: &mut RaftState, round_term: u64) -> bool {
        if state.role != RaftRole::Candidate
            || state.current_term != round_term
            || state.votes_received < self.config.majority()
        {
            return false;
        }

        let peer_ids: Vec<u64> = self.config.peers.iter().map(|p| p.node_id).collect();
        state.become_leader(self.id, &peer_ids);
        tracing::info!(
            node_id = self.id,
            term = round_term,
            votes = state.votes_received,
            "Became leader"
        );
        true
    }

    /// Send one AppendEntries round to every follower: a heartbeat when the
    /// follower is caught up, the pending suffix from its `next_index`
    /// otherwise. Replies are applied by per-peer tasks.
    async fn broadcast_append_entries(self: Arc<Self>) {
        let (term, commit_index, next_index, snapshot_index, snapshot_term, log, last_index) = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            (
                state.current_term,
                state.commit_index,
                state.next_index.clone(),
                state.snapshot_index,
                state.snapshot_term,
                state.log.clone(),
                state.last_log_index(),
            )
        };

        for peer in &self.config.peers {
            let peer_id = peer.node_id;
            let mut peer_next = next_index.get(&peer_id).copied().unwrap_or(last_index + 1);
            if peer_next <= snapshot_index {
                // The entries this follower needs were compacted away; a
                // snapshot-install RPC is the extension point here. Resend
                // from the anchor so the follower at least keeps hearing
                // from us.
                tracing::warn!(
                    node_id = self.id,
                    peer_id,
                    peer_next,
                    snapshot_index,
                    "Follower is behind the snapshot anchor"
                );
                peer_next = snapshot_index + 1;
            }

            let prev_log_index = peer_next - 1;
            let prev_log_term = if prev_log_index == snapshot_index {
                snapshot_term
            } else {
                log.get((prev_log_index - snapshot_index - 1) as usize)
                    .map(|e| e.term)
                    .unwrap_or(0)
            };
            let entries: Vec<_> = log
                .iter()
                .filter(|e| e.index >= peer_next)
                .map(log_entry_to_proto)
                .collect();
            let entries_sent = entries.len() as u64;

            let req = AppendEntriesRequest {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            let node = self.clone();
            tokio::spawn(async move {
                match node
                    .peers
                    .append_entries(peer_id, req, node.config.rpc_timeout())
                    .await
                {
                    Ok(resp) => {
                        node.handle_append_reply(peer_id, term, prev_log_index, entries_sent, resp)
                            .await;
                    }
                    Err(e) => {
                        tracing::trace!(peer_id, error = %e, "AppendEntries failed");
                    }
                }
            });
        }
    }

    /// Apply one AppendEntries reply: advance or back off this follower's
    /// progress, then recheck the commit index. Progress never regresses on
    /// stale replies; what was sent is derived from our own request, not
    /// from the follower's log tail.
    async fn handle_append_reply(
        &self,
        peer_id: u64,
        round_term: u64,
        prev_log_index: u64,
        entries_sent: u64,
        resp: AppendEntriesResponse,
    ) {
        let advanced = {
            let mut state = self.state.write().await;

            if resp.term > state.current_term {
                tracing::info!(
                    node_id = self.id,
                    peer_id,
                    term = resp.term,
                    "Higher term in AppendEntries reply, stepping down"
                );
                state.become_follower(resp.term);
                let _ = self.persist(&state);
                return;
            }

            if state.role != RaftRole::Leader || state.current_term != round_term {
                return;
            }

            if resp.success {
                let replicated = prev_log_index + entries_sent;
                let match_entry = state.match_index.entry(peer_id).or_insert(0);
                if replicated > *match_entry {
                    *match_entry = replicated;
                }
                let next_entry = state.next_index.entry(peer_id).or_insert(replicated + 1);
                if replicated + 1 > *next_entry {
                    *next_entry = replicated + 1;
                }
                self.advance_commit(&mut state)
            } else {
                // Log inconsistency: back off by one, or jump straight to
                // just past the follower's tail when its hint is shorter
                let current = state
                    .next_index
                    .get(&peer_id)
                    .copied()
                    .unwrap_or(state.last_log_index() + 1);
                let backed = current.saturating_sub(1).max(1);
                let hinted = resp.match_index.saturating_add(1);
                let new_next = backed.min(hinted).max(1);
                state.next_index.insert(peer_id, new_next);
                tracing::debug!(
                    node_id = self.id,
                    peer_id,
                    next_index = new_next,
                    "AppendEntries rejected, backing off"
                );
                None
            }
        };

        if let Some(commit_index) = advanced {
            self.notify_commit(commit_index);
        }
    }

    /// Leader commit rule: the highest index replicated on a strict
    /// majority, restricted to entries of the current term. Entry terms are
    /// non-decreasing along the log, so checking the majority index alone
    /// is sufficient.
    fn advance_commit(&self, state: &mut RaftState) -> Option<u64> {
        let mut match_indices: Vec<u64> = state.match_index.values().copied().collect();
        match_indices.push(state.last_log_index()); // self
        match_indices.sort_unstable();

        let majority_pos = match_indices.len() - self.config.majority() as usize;
        let majority_index = match_indices[majority_pos];

        if majority_index > state.commit_index
            && state.term_at(majority_index) == Some(state.current_term)
        {
            state.commit_index = majority_index;
            tracing::debug!(
                node_id = self.id,
                commit_index = majority_index,
                "Updated commit index"
            );
            Some(majority_index)
        } else {
            None
        }
    }

    fn notify_commit(&self, commit_index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    /// Feed committed entries to the owning service, strictly in index
    /// order. A single task does all delivery, so order is preserved no
    /// matter which path advanced the commit index. The channel send blocks
    /// on backpressure and is never performed under the state lock.
    async fn apply_loop(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();

        loop {
            let batch = {
                let mut state = self.state.write().await;
                let mut batch = Vec::new();
                while state.last_applied < state.commit_index {
                    let next = state.last_applied + 1;
                    if let Some(entry) = state.get_entry(next) {
                        batch.push(ApplyMsg::Command {
                            index: entry.index,
                            command: entry.command.clone(),
                        });
                    }
                    state.last_applied = next;
                }
                batch
            };

            for msg in batch {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    sent = self.apply_tx.send(msg) => {
                        if sent.is_err() {
                            tracing::debug!(node_id = self.id, "Apply channel closed");
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Flush the persistent triple to storage. A failed save is fatal to
    /// this peer: running on without durability would reintroduce unsafety
    /// after a crash, so the node shuts itself down instead.
    fn persist(&self, state: &RaftState) -> Result<()> {
        match self.storage.save(&state.persistent_state()) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    node_id = self.id,
                    error = %e,
                    "Failed to persist state, shutting down"
                );
                self.cancel.cancel();
                Err(RaftError::Storage(e))
            }
        }
    }
}
