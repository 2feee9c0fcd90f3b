//! In-process cluster harness for integration tests.
//!
//! `MiniCluster` wires N servers over the in-memory fabric, supports
//! crash-style kills, and discovers the leader by polling each server's
//! self-reported role; there is no shared leader pointer anywhere.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{ClientConfig, RaftClient};
use crate::core::config::RaftConfig;
use crate::core::log::Entry;
use crate::core::raft::{Raft, RoleKind};
use crate::core::raft_node::SharedRaft;
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::core::request_handler::RequestHandler;
use crate::storage::memory::MemoryStorage;
use crate::transport::inmemory::{create_channels, InMemoryTransport, NodeHandle, Request};

/// One server slot in the cluster.
struct ClusterServer {
    id: u64,
    shared: SharedRaft,
    /// Consumed on start
    server: Option<RaftServer<InMemoryTransport>>,
    node_handle: Option<NodeHandle>,
    handle: Option<RaftHandle>,
    server_task: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    running: bool,
}

/// An in-process cluster of Raft servers.
pub struct MiniCluster {
    rpc_timeout: Duration,
    senders: HashMap<u64, mpsc::Sender<Request>>,
    servers: Vec<ClusterServer>,
}

impl MiniCluster {
    /// Build a cluster of `size` servers with test-friendly timeouts.
    /// Servers are wired but idle until [`start`](Self::start).
    pub fn new(size: usize) -> Self {
        let config = RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300));
        Self::with_config(size, config)
    }

    pub fn with_config(size: usize, config: RaftConfig) -> Self {
        let rpc_timeout = Duration::from_millis(75);
        let node_ids: Vec<u64> = (1..=size as u64).collect();
        let (senders, mut handles) = create_channels(&node_ids);

        let mut servers = Vec::new();
        for &id in &node_ids {
            let peer_ids: Vec<u64> = node_ids.iter().copied().filter(|&p| p != id).collect();
            let peer_senders: HashMap<u64, mpsc::Sender<Request>> = senders
                .iter()
                .filter(|(&k, _)| k != id)
                .map(|(&k, v)| (k, v.clone()))
                .collect();
            let transport = InMemoryTransport::with_timeout(peer_senders, rpc_timeout);

            let core = Raft::new(id, peer_ids, Box::new(MemoryStorage::new()))
                .expect("memory storage cannot fail");
            let (server, shared) = RaftServer::with_config(core, transport, config.clone());

            servers.push(ClusterServer {
                id,
                shared,
                server: Some(server),
                node_handle: handles.remove(&id),
                handle: None,
                server_task: None,
                dispatcher: None,
                running: false,
            });
        }

        MiniCluster {
            rpc_timeout,
            senders,
            servers,
        }
    }

    /// Boot every server: the event loop plus the RPC dispatcher.
    pub fn start(&mut self) {
        for slot in &mut self.servers {
            let Some(server) = slot.server.take() else {
                continue;
            };
            let (handle, server_task) = server.start();
            let handler = RequestHandler::new(slot.shared.clone(), handle.clone());
            let node_handle = slot.node_handle.take().expect("fabric handle missing");
            let dispatcher = tokio::spawn(node_handle.run(handler));

            slot.handle = Some(handle);
            slot.server_task = Some(server_task);
            slot.dispatcher = Some(dispatcher);
            slot.running = true;
        }
    }

    /// Crash a server: its timers, loop and RPC dispatch stop immediately
    /// and the fabric drops anything addressed to it. The server still
    /// counts toward the configured majority.
    pub fn kill_server(&mut self, id: u64) {
        let slot = self.slot_mut(id);
        if let Some(task) = slot.server_task.take() {
            task.abort();
        }
        if let Some(dispatcher) = slot.dispatcher.take() {
            dispatcher.abort();
        }
        slot.handle = None;
        slot.running = false;
    }

    pub fn is_running(&self, id: u64) -> bool {
        self.slot(id).running
    }

    pub fn server_ids(&self) -> Vec<u64> {
        self.servers.iter().map(|s| s.id).collect()
    }

    pub fn running_ids(&self) -> Vec<u64> {
        self.servers
            .iter()
            .filter(|s| s.running)
            .map(|s| s.id)
            .collect()
    }

    /// The unique running server that believes itself leader, or None.
    /// When a deposed leader hasn't noticed yet, the highest term wins.
    pub async fn leader(&self) -> Option<u64> {
        let mut best: Option<(u64, u64)> = None;
        for slot in self.servers.iter().filter(|s| s.running) {
            let core = slot.shared.lock().await;
            if core.role_kind() == RoleKind::Leader {
                let term = core.state.current_term;
                if best.map_or(true, |(best_term, _)| term > best_term) {
                    best = Some((term, slot.id));
                }
            }
        }
        best.map(|(_, id)| id)
    }

    /// Running servers that currently report the follower role.
    pub async fn followers(&self) -> Vec<u64> {
        let mut followers = Vec::new();
        for slot in self.servers.iter().filter(|s| s.running) {
            if slot.shared.lock().await.role_kind() == RoleKind::Follower {
                followers.push(slot.id);
            }
        }
        followers
    }

    /// Poll for a leader until one shows up or the deadline passes.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<u64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Some(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// A client that can reach every server over the fabric.
    ///
    /// Client requests block server-side until commit, so the client waits
    /// much longer than the servers' own RPC timeout; a reply lost to a
    /// short timeout would be retried and committed twice.
    pub fn create_client(
        &self,
        name: &str,
        leader_hint: Option<u64>,
    ) -> RaftClient<InMemoryTransport> {
        let transport =
            InMemoryTransport::with_timeout(self.senders.clone(), Duration::from_secs(1));
        RaftClient::new(name, transport, self.server_ids(), leader_hint)
    }

    pub fn create_client_with_config(
        &self,
        name: &str,
        leader_hint: Option<u64>,
        config: ClientConfig,
    ) -> RaftClient<InMemoryTransport> {
        let transport =
            InMemoryTransport::with_timeout(self.senders.clone(), Duration::from_secs(1));
        RaftClient::with_config(name, transport, self.server_ids(), leader_hint, config)
    }

    /// Atomic snapshot of a server's (role, term).
    pub async fn status_of(&self, id: u64) -> (RoleKind, u64) {
        let core = self.slot(id).shared.lock().await;
        (core.role_kind(), core.state.current_term)
    }

    pub async fn term_of(&self, id: u64) -> u64 {
        self.slot(id).shared.lock().await.state.current_term
    }

    pub async fn commit_index_of(&self, id: u64) -> u64 {
        self.slot(id).shared.lock().await.state.commit_index
    }

    pub async fn role_of(&self, id: u64) -> RoleKind {
        self.slot(id).shared.lock().await.role_kind()
    }

    /// Copy of a server's log from `from_index` to the end.
    pub async fn entries_from(&self, id: u64, from_index: u64) -> Vec<Entry> {
        self.slot(id)
            .shared
            .lock()
            .await
            .state
            .log
            .entries_from(from_index)
            .to_vec()
    }

    /// Dump each server's role, term and log shape to stdout.
    pub async fn print_servers(&self) {
        for slot in &self.servers {
            let core = slot.shared.lock().await;
            println!(
                "server {}: {:?} term={} commit={} log_len={}{}",
                slot.id,
                core.role_kind(),
                core.state.current_term,
                core.state.commit_index,
                core.state.log.len(),
                if slot.running { "" } else { " [killed]" },
            );
        }
    }

    /// Dump every server's full log to stdout.
    pub async fn print_all_logs(&self) {
        for slot in &self.servers {
            let core = slot.shared.lock().await;
            print!("server {} log:", slot.id);
            for entry in core.state.log.iter() {
                print!(" {}:{}={}", entry.index, entry.term, entry.message);
            }
            println!();
        }
    }

    /// Stop every running server gracefully.
    pub async fn shutdown(mut self) {
        for slot in &mut self.servers {
            if let Some(handle) = slot.handle.take() {
                handle.shutdown().await;
            }
            if let Some(dispatcher) = slot.dispatcher.take() {
                dispatcher.abort();
            }
            slot.running = false;
        }
        // Let the loops drain their shutdown signals
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn slot(&self, id: u64) -> &ClusterServer {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .unwrap_or_else(|| panic!("unknown server id {}", id))
    }

    fn slot_mut(&mut self, id: u64) -> &mut ClusterServer {
        self.servers
            .iter_mut()
            .find(|s| s.id == id)
            .unwrap_or_else(|| panic!("unknown server id {}", id))
    }
}
