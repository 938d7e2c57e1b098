//! Test harness for multi-node Raft cluster integration tests.
//!
//! Provides utilities for spawning, managing, and testing multi-node
//! clusters over real gRPC on loopback ports.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use raft_lite::config::NodeConfig;
use raft_lite::grpc::GrpcServer;
use raft_lite::raft::{ApplyMsg, RaftNode};
use raft_lite::storage::{MemStorage, Storage};

/// Test node configuration with shorter timeouts for faster tests
pub fn test_node_config(node_id: u64, port: u16, peers: Vec<(u64, u16)>) -> NodeConfig {
    let mut config = NodeConfig::new(
        node_id,
        format!("127.0.0.1:{port}").parse().expect("valid addr"),
    );
    // Shorter timeouts for faster tests
    config.election_timeout_min_ms = 150;
    config.election_timeout_max_ms = 300;
    config.heartbeat_interval_ms = 30;
    config.rpc_timeout_ms = 75;
    for (id, p) in peers {
        config = config.with_peer(id, format!("127.0.0.1:{p}"));
    }
    config
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: u64,
    pub port: u16,
    pub node: Arc<RaftNode>,
    applied: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    run_handle: JoinHandle<()>,
    grpc_handle: JoinHandle<()>,
    apply_handle: JoinHandle<()>,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.node.is_leader().await
    }

    pub async fn current_term(&self) -> u64 {
        self.node.current_term().await
    }

    pub async fn commit_index(&self) -> u64 {
        self.node.state.read().await.commit_index
    }

    pub async fn last_log_index(&self) -> u64 {
        self.node.state.read().await.last_log_index()
    }

    pub async fn snapshot_index(&self) -> u64 {
        self.node.state.read().await.snapshot_index
    }

    /// `(index, term)` pairs of the live (non-compacted) log suffix
    pub async fn log_summary(&self) -> Vec<(u64, u64)> {
        let state = self.node.state.read().await;
        state.log.iter().map(|e| (e.index, e.term)).collect()
    }

    /// Entries delivered on the apply channel so far, in delivery order
    pub async fn applied(&self) -> Vec<(u64, Vec<u8>)> {
        self.applied.lock().await.clone()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        // Stop the node and abort all tasks to ensure clean shutdown
        self.node.kill();
        self.run_handle.abort();
        self.grpc_handle.abort();
        self.apply_handle.abort();
    }
}

/// Test cluster managing multiple nodes
pub struct TestCluster {
    pub nodes: HashMap<u64, TestNode>,
    storages: HashMap<u64, Arc<dyn Storage>>,
    configs: HashMap<u64, NodeConfig>,
}

impl TestCluster {
    /// Create and start a cluster of n nodes backed by in-memory storage
    pub async fn new(num_nodes: usize, base_port: u16) -> Self {
        let storages = (0..num_nodes)
            .map(|i| {
                let id = (i + 1) as u64;
                (id, Arc::new(MemStorage::new()) as Arc<dyn Storage>)
            })
            .collect();
        Self::with_storages(num_nodes, base_port, storages).await
    }

    /// Create and start a cluster with caller-provided storage per node,
    /// e.g. `FileStorage` over temp dirs for crash-recovery tests
    pub async fn with_storages(
        num_nodes: usize,
        base_port: u16,
        storages: HashMap<u64, Arc<dyn Storage>>,
    ) -> Self {
        let mut cluster = Self {
            nodes: HashMap::new(),
            storages,
            configs: HashMap::new(),
        };

        let all_peers: Vec<(u64, u16)> = (0..num_nodes)
            .map(|i| ((i + 1) as u64, base_port + i as u16))
            .collect();

        for i in 0..num_nodes {
            let node_id = (i + 1) as u64;
            let port = base_port + i as u16;

            let peers: Vec<(u64, u16)> = all_peers
                .iter()
                .filter(|(id, _)| *id != node_id)
                .copied()
                .collect();

            let config = test_node_config(node_id, port, peers);
            cluster.configs.insert(node_id, config.clone());

            let storage = cluster.storages[&node_id].clone();
            let test_node = Self::start_node(config, storage).await;
            cluster.nodes.insert(node_id, test_node);
        }

        // Give the gRPC servers a moment to bind before the first election
        tokio::time::sleep(Duration::from_millis(100)).await;

        cluster
    }

    /// Start a single node
    async fn start_node(config: NodeConfig, storage: Arc<dyn Storage>) -> TestNode {
        let node_id = config.node_id;
        let port = config.listen_addr.port();
        let listen_addr = config.listen_addr;

        let (apply_tx, mut apply_rx) = mpsc::channel(64);
        let node = Arc::new(RaftNode::new(config, storage, apply_tx).expect("node should start"));

        let run_handle = tokio::spawn(node.clone().run());

        // Collect delivered entries so tests can assert on them
        let applied = Arc::new(Mutex::new(Vec::new()));
        let applied_sink = applied.clone();
        let apply_handle = tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                if let ApplyMsg::Command { index, command } = msg {
                    applied_sink.lock().await.push((index, command));
                }
            }
        });

        let grpc_server = GrpcServer::new(listen_addr, node.clone());
        let grpc_handle = tokio::spawn(async move {
            if let Err(e) = grpc_server.run(CancellationToken::new()).await {
                tracing::error!("gRPC server error: {}", e);
            }
        });

        TestNode {
            node_id,
            port,
            node,
            applied,
            run_handle,
            grpc_handle,
            apply_handle,
        }
    }

    /// Wait for leader election with timeout
    pub async fn wait_for_leader(&self, timeout_duration: Duration) -> Option<u64> {
        let result = wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            self.get_leader_id().await
        } else {
            None
        }
    }

    /// Get current leader ID
    pub async fn get_leader_id(&self) -> Option<u64> {
        for node in self.nodes.values() {
            if node.is_leader().await {
                return Some(node.node_id);
            }
        }
        None
    }

    /// Get a reference to a specific node
    pub fn get_node(&self, node_id: u64) -> Option<&TestNode> {
        self.nodes.get(&node_id)
    }

    /// Count the number of leaders in the cluster
    pub async fn count_leaders(&self) -> usize {
        let mut count = 0;
        for node in self.nodes.values() {
            if node.is_leader().await {
                count += 1;
            }
        }
        count
    }

    /// Propose a command through whichever node currently leads, retrying
    /// briefly across leadership changes
    pub async fn propose(&self, command: &[u8]) -> Result<(u64, u64), String> {
        for _ in 0..20 {
            if let Some(leader_id) = self.get_leader_id().await {
                match self.propose_to_node(leader_id, command).await {
                    Ok(placed) => return Ok(placed),
                    Err(_) => {} // leadership moved, retry
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err("no leader accepted the command".to_string())
    }

    /// Propose a command directly to a specific node (must be leader)
    pub async fn propose_to_node(&self, node_id: u64, command: &[u8]) -> Result<(u64, u64), String> {
        let node = self.nodes.get(&node_id).ok_or("node not found")?;
        node.node
            .start(command.to_vec())
            .await
            .map_err(|e| e.to_string())
    }

    /// Wait until every node's commit index reaches `min_index`
    pub async fn wait_for_commit_on_all(&self, min_index: u64, timeout_duration: Duration) -> bool {
        wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.commit_index().await < min_index {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await
    }

    /// Wait until every node has delivered at least `min_entries` commands
    pub async fn wait_for_applied_on_all(
        &self,
        min_entries: usize,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                for node in self.nodes.values() {
                    if node.applied().await.len() < min_entries {
                        return false;
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await
    }

    /// Wait until specific nodes have delivered at least `min_entries` commands
    pub async fn wait_for_applied_on_nodes(
        &self,
        node_ids: &[u64],
        min_entries: usize,
        timeout_duration: Duration,
    ) -> bool {
        wait_for(
            || async {
                for &node_id in node_ids {
                    match self.nodes.get(&node_id) {
                        Some(node) => {
                            if node.applied().await.len() < min_entries {
                                return false;
                            }
                        }
                        None => return false,
                    }
                }
                true
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await
    }

    /// Verify all nodes carry the same `(index, term)` log suffix, modulo
    /// compaction (a compacted node is compared from its anchor onward)
    pub async fn verify_log_consistency(&self) -> bool {
        let mut summaries: Vec<Vec<(u64, u64)>> = Vec::new();
        for node in self.nodes.values() {
            summaries.push(node.log_summary().await);
        }

        for a in &summaries {
            for b in &summaries {
                for (index, term) in a {
                    if let Some((_, other_term)) =
                        b.iter().find(|(other_index, _)| other_index == index)
                    {
                        if other_term != term {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Shutdown a specific node (simulates crash). Its storage is retained
    /// so `restart_node` can bring it back.
    pub fn shutdown_node(&mut self, node_id: u64) -> bool {
        // Dropping the node kills it and aborts all its tasks
        self.nodes.remove(&node_id).is_some()
    }

    /// Restart a previously shut-down node from its retained storage
    pub async fn restart_node(&mut self, node_id: u64) {
        let config = self.configs[&node_id].clone();
        let storage = self.storages[&node_id].clone();

        // Let the old gRPC listener release the port
        tokio::time::sleep(Duration::from_millis(100)).await;

        let test_node = Self::start_node(config, storage).await;
        self.nodes.insert(node_id, test_node);
    }

    /// Get IDs of all active nodes
    pub fn active_node_ids(&self) -> Vec<u64> {
        self.nodes.keys().copied().collect()
    }

    /// Wait for a new leader among remaining nodes (excluding a specific node)
    pub async fn wait_for_new_leader(
        &self,
        excluded_node: u64,
        timeout_duration: Duration,
    ) -> Option<u64> {
        let result = wait_for(
            || async {
                for (node_id, node) in self.nodes.iter() {
                    if *node_id != excluded_node && node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            for (node_id, node) in self.nodes.iter() {
                if *node_id != excluded_node && node.is_leader().await {
                    return Some(*node_id);
                }
            }
        }
        None
    }

    /// Create a network partition: group_a can't communicate with group_b and vice versa
    pub async fn create_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &node_a in group_a {
            if let Some(node) = self.nodes.get(&node_a) {
                for &node_b in group_b {
                    node.node.disconnect_peer(node_b).await;
                }
            }
        }
        for &node_b in group_b {
            if let Some(node) = self.nodes.get(&node_b) {
                for &node_a in group_a {
                    node.node.disconnect_peer(node_a).await;
                }
            }
        }
    }

    /// Heal a network partition: restore communication between groups
    pub async fn heal_partition(&self, group_a: &[u64], group_b: &[u64]) {
        for &node_a in group_a {
            if let Some(node) = self.nodes.get(&node_a) {
                for &node_b in group_b {
                    node.node.reconnect_peer(node_b).await;
                }
            }
        }
        for &node_b in group_b {
            if let Some(node) = self.nodes.get(&node_b) {
                for &node_a in group_a {
                    node.node.reconnect_peer(node_a).await;
                }
            }
        }
    }

    /// Isolate a node from all other nodes
    pub async fn isolate_node(&self, node_id: u64) {
        let other_ids: Vec<u64> = self
            .nodes
            .keys()
            .filter(|&&id| id != node_id)
            .copied()
            .collect();
        self.create_partition(&[node_id], &other_ids).await;
    }

    /// Heal an isolated node (reconnect to all others)
    pub async fn heal_node(&self, node_id: u64) {
        let other_ids: Vec<u64> = self
            .nodes
            .keys()
            .filter(|&&id| id != node_id)
            .copied()
            .collect();
        self.heal_partition(&[node_id], &other_ids).await;
    }

    /// Wait for a leader to emerge within a specific group of nodes
    pub async fn wait_for_leader_in_group(
        &self,
        group: &[u64],
        timeout_duration: Duration,
    ) -> Option<u64> {
        let result = wait_for(
            || async {
                for &node_id in group {
                    if let Some(node) = self.nodes.get(&node_id) {
                        if node.is_leader().await {
                            return true;
                        }
                    }
                }
                false
            },
            timeout_duration,
            Duration::from_millis(50),
        )
        .await;

        if result {
            for &node_id in group {
                if let Some(node) = self.nodes.get(&node_id) {
                    if node.is_leader().await {
                        return Some(node_id);
                    }
                }
            }
        }
        None
    }

    /// Shutdown all nodes (best effort cleanup)
    pub async fn shutdown(&mut self) {
        self.nodes.clear();
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
