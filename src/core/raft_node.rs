//! Async coordination layer: fans RPC rounds out to peers and feeds the
//! responses back into the synchronous core.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::raft::{Raft, RoleKind};
use crate::transport::Transport;

/// Shared reference to one server's consensus core.
///
/// The mutex is the per-server single-writer discipline: timer-driven
/// transitions and incoming RPC handling serialize through it.
pub type SharedRaft = Arc<Mutex<Raft>>;

/// Drives one server's outbound RPC traffic.
pub struct RaftNode<T: Transport> {
    core: SharedRaft,
    transport: T,
}

impl<T: Transport> RaftNode<T> {
    pub fn new(core: Raft, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Shared core handle, for incoming RPC dispatch and introspection.
    pub fn shared_core(&self) -> SharedRaft {
        self.core.clone()
    }

    pub async fn start_election(&self) {
        self.core.lock().await.start_election();
    }

    /// Broadcast RequestVote to all peers, tallying responses as they
    /// arrive. Returns true as soon as this node becomes leader; peers that
    /// never answer are simply not counted.
    pub async fn request_votes(&self) -> bool {
        let (args, peers) = {
            let core = self.core.lock().await;
            (core.vote_args(), core.peers.clone())
        };

        let mut responses: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer_id, transport.request_vote(peer_id, args).await) }
            })
            .collect();

        while let Some((peer_id, result)) = responses.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                if core.handle_request_vote_result(peer_id, &result) {
                    return true;
                }
                if core.role_kind() != RoleKind::Candidate {
                    // Stepped down mid-election; stop counting
                    return false;
                }
            }
        }

        false
    }

    /// Replicate the log through `entry_index` to all peers.
    ///
    /// Returns true once the entry is committed (majority replicated);
    /// remaining in-flight responses are abandoned. Peers whose logs
    /// mismatch get their `next_index` backtracked and catch up on later
    /// heartbeats.
    pub async fn replicate_to_peers(&self, entry_index: u64) -> bool {
        let requests = {
            let core = self.core.lock().await;
            if !core.is_leader() {
                return false;
            }
            let peers = core.peers.clone();
            peers
                .into_iter()
                .filter_map(|peer_id| {
                    core.append_args_for(peer_id)
                        .map(|(args, last_sent)| (peer_id, args, last_sent))
                })
                .collect::<Vec<_>>()
        };

        let mut responses: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args, last_sent)| {
                let transport = &self.transport;
                async move {
                    (
                        peer_id,
                        last_sent,
                        transport.append_entries(peer_id, args).await,
                    )
                }
            })
            .collect();

        while let Some((peer_id, last_sent, result)) = responses.next().await {
            if let Ok(result) = result {
                let mut core = self.core.lock().await;
                core.handle_append_entries_result(peer_id, last_sent, &result);
                if core.state.commit_index >= entry_index {
                    return true;
                }
                if !core.is_leader() {
                    return false;
                }
            }
        }

        // A concurrent heartbeat round may have carried the commit
        self.core.lock().await.state.commit_index >= entry_index
    }

    /// Send one heartbeat round to every peer. Heartbeats double as
    /// catch-up replication: each request carries whatever entries that
    /// peer is still missing. Waits for all peers so higher terms are
    /// noticed promptly. Returns whether this node is still leader.
    pub async fn send_heartbeat(&self) -> bool {
        let requests = {
            let core = self.core.lock().await;
            if !core.is_leader() {
                return false;
            }
            let peers = core.peers.clone();
            peers
                .into_iter()
                .filter_map(|peer_id| {
                    core.append_args_for(peer_id)
                        .map(|(args, last_sent)| (peer_id, args, last_sent))
                })
                .collect::<Vec<_>>()
        };

        let mut responses: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, args, last_sent)| {
                let transport = &self.transport;
                async move {
                    (
                        peer_id,
                        last_sent,
                        transport.append_entries(peer_id, args).await,
                    )
                }
            })
            .collect();

        while let Some((peer_id, last_sent, result)) = responses.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    core.handle_append_entries_result(peer_id, last_sent, &result);
                }
                Err(err) => {
                    debug!(peer = peer_id, error = %err, "heartbeat not delivered");
                }
            }
        }

        self.core.lock().await.is_leader()
    }

    pub async fn role_kind(&self) -> RoleKind {
        self.core.lock().await.role_kind()
    }

    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.state.commit_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::log::Message;
    use crate::core::raft::Raft;
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::{create_cluster, create_cluster_with_timeout};

    fn new_core(id: u64, peers: Vec<u64>) -> Raft {
        Raft::new(id, peers, Box::new(MemoryStorage::new())).unwrap()
    }

    fn shared(core: Raft) -> SharedRaft {
        Arc::new(Mutex::new(core))
    }

    #[tokio::test]
    async fn test_election() {
        let node_ids = vec![1, 2, 3];
        let (mut transports, mut handles) = create_cluster(&node_ids);

        let node1 = RaftNode::new(new_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = shared(new_core(2, vec![1, 3]));
        let shared3 = shared(new_core(3, vec![1, 2]));

        node1.start_election().await;

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        let (became_leader, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );

        assert!(became_leader);
        assert_eq!(node1.role_kind().await, RoleKind::Leader);
    }

    #[tokio::test]
    async fn test_replication() {
        let node_ids = vec![1, 2, 3];
        let (mut transports, mut handles) = create_cluster(&node_ids);

        let node1 = RaftNode::new(new_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = shared(new_core(2, vec![1, 3]));
        let shared3 = shared(new_core(3, vec![1, 2]));

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        node1.start_election().await;
        let (_, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );
        assert_eq!(node1.role_kind().await, RoleKind::Leader);

        let entry_index = {
            let mut core = node1.shared_core().lock_owned().await;
            core.append_message(Message::new("m1")).unwrap().index
        };
        assert_eq!(entry_index, 1);

        let (committed, _, _) = tokio::join!(
            node1.replicate_to_peers(entry_index),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );

        assert!(committed);
        assert_eq!(node1.commit_index().await, 1);
        assert_eq!(shared2.lock().await.state.log.len(), 1);
        assert_eq!(shared3.lock().await.state.log.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_leadership() {
        let node_ids = vec![1, 2, 3];
        let (mut transports, mut handles) = create_cluster(&node_ids);

        let node1 = RaftNode::new(new_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = shared(new_core(2, vec![1, 3]));
        let shared3 = shared(new_core(3, vec![1, 2]));

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        node1.start_election().await;
        let (_, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );

        let (still_leader, _, _) = tokio::join!(
            node1.send_heartbeat(),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );

        assert!(still_leader);
        assert_eq!(shared2.lock().await.role_kind(), RoleKind::Follower);
        assert_eq!(shared2.lock().await.state.current_term, 1);
        assert_eq!(shared3.lock().await.current_leader, Some(1));
    }

    #[tokio::test]
    async fn test_heartbeat_catches_up_followers() {
        let node_ids = vec![1, 2, 3];
        let (mut transports, mut handles) = create_cluster(&node_ids);

        let node1 = RaftNode::new(new_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = shared(new_core(2, vec![1, 3]));
        let shared3 = shared(new_core(3, vec![1, 2]));

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        node1.start_election().await;
        let (_, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );

        {
            let mut core = node1.shared_core().lock_owned().await;
            core.append_message(Message::new("m1"));
            core.append_message(Message::new("m2"));
        }
        assert_eq!(shared2.lock().await.state.log.len(), 0);

        let (_, _, _) = tokio::join!(
            node1.send_heartbeat(),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );

        let core2 = shared2.lock().await;
        assert_eq!(core2.state.log.len(), 2);
        assert_eq!(core2.state.log.get(1).unwrap().message, Message::new("m1"));
        assert_eq!(core2.state.log.get(2).unwrap().message, Message::new("m2"));
        drop(core2);
        assert_eq!(shared3.lock().await.state.log.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_with_one_peer_timeout() {
        let node_ids = vec![1, 2, 3];
        let timeout = Duration::from_millis(100);
        let (mut transports, mut handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let node1 = RaftNode::new(new_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = shared(new_core(2, vec![1, 3]));
        // Node 3 never responds

        let mut handle2 = handles.remove(&2).unwrap();

        node1.start_election().await;
        let (became_leader, _) =
            tokio::join!(node1.request_votes(), handle2.process_one(&shared2));

        // Self + node 2 is a majority of 3
        assert!(became_leader);
        assert_eq!(node1.role_kind().await, RoleKind::Leader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_with_one_peer_timeout() {
        let node_ids = vec![1, 2, 3];
        let timeout = Duration::from_millis(100);
        let (mut transports, mut handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let node1 = RaftNode::new(new_core(1, vec![2, 3]), transports.remove(&1).unwrap());
        let shared2 = shared(new_core(2, vec![1, 3]));

        let mut handle2 = handles.remove(&2).unwrap();

        node1.start_election().await;
        let (_, _) = tokio::join!(node1.request_votes(), handle2.process_one(&shared2));
        assert_eq!(node1.role_kind().await, RoleKind::Leader);

        let entry_index = {
            let mut core = node1.shared_core().lock_owned().await;
            core.append_message(Message::new("m1")).unwrap().index
        };

        let (committed, _) = tokio::join!(
            node1.replicate_to_peers(entry_index),
            handle2.process_one(&shared2),
        );

        assert!(committed);
        assert_eq!(node1.commit_index().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_peers_timeout_election_fails() {
        let node_ids = vec![1, 2, 3];
        let timeout = Duration::from_millis(100);
        let (mut transports, _handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let node1 = RaftNode::new(new_core(1, vec![2, 3]), transports.remove(&1).unwrap());

        node1.start_election().await;
        let became_leader = node1.request_votes().await;

        assert!(!became_leader);
        assert_eq!(node1.role_kind().await, RoleKind::Candidate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_without_quorum_does_not_commit() {
        let node_ids = vec![1, 2, 3, 4, 5];
        let timeout = Duration::from_millis(100);
        let (mut transports, mut handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let node1 = RaftNode::new(
            new_core(1, vec![2, 3, 4, 5]),
            transports.remove(&1).unwrap(),
        );
        let shared2 = shared(new_core(2, vec![1, 3, 4, 5]));
        let shared3 = shared(new_core(3, vec![1, 2, 4, 5]));

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        // Win the election with nodes 2 and 3 voting
        node1.start_election().await;
        let (_, _, _) = tokio::join!(
            node1.request_votes(),
            handle2.process_one(&shared2),
            handle3.process_one(&shared3),
        );
        assert_eq!(node1.role_kind().await, RoleKind::Leader);

        let entry_index = {
            let mut core = node1.shared_core().lock_owned().await;
            core.append_message(Message::new("m1")).unwrap().index
        };

        // Only node 2 acks: leader + 1 = 2 of 5, no quorum
        let (committed, _) = tokio::join!(
            node1.replicate_to_peers(entry_index),
            handle2.process_one(&shared2),
        );

        assert!(!committed);
        assert_eq!(node1.commit_index().await, 0);
    }
}
