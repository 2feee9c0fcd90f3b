//! In-memory transport: a channel fabric for in-process clusters.
//!
//! Each server owns an mpsc receiver; every other party holds senders into
//! it. Killing a server drops its receiver, so later sends fail fast and
//! in-flight replies are dropped: messages to a dead server are discarded,
//! never queued.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::core::raft_node::SharedRaft;
use crate::core::request_handler::RequestHandler;
use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, ClientRequestArgs, ClientRequestResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

/// A wire message of the fabric: one of the three RPC kinds plus its reply
/// channel.
pub enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
    ClientRequest {
        args: ClientRequestArgs,
        reply: oneshot::Sender<ClientRequestResult>,
    },
}

/// Channel-based transport with an optional per-RPC timeout.
pub struct InMemoryTransport {
    senders: HashMap<u64, mpsc::Sender<Request>>,
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    /// Transport over the given senders, waiting indefinitely for replies.
    pub fn new(senders: HashMap<u64, mpsc::Sender<Request>>) -> Self {
        Self {
            senders,
            timeout: None,
        }
    }

    /// Transport over the given senders with a per-RPC timeout.
    pub fn with_timeout(senders: HashMap<u64, mpsc::Sender<Request>>, timeout: Duration) -> Self {
        Self {
            senders,
            timeout: Some(timeout),
        }
    }

    async fn send(&self, target: u64, request: Request) -> Result<(), TransportError> {
        let sender = self
            .senders
            .get(&target)
            .ok_or(TransportError::NodeNotFound)?;
        sender
            .send(request)
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }

    async fn await_reply<R>(&self, reply_rx: oneshot::Receiver<R>) -> Result<R, TransportError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed),
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            target,
            Request::RequestVote {
                args,
                reply: reply_tx,
            },
        )
        .await?;
        self.await_reply(reply_rx).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            target,
            Request::AppendEntries {
                args,
                reply: reply_tx,
            },
        )
        .await?;
        self.await_reply(reply_rx).await
    }

    async fn client_request(
        &self,
        target: u64,
        args: ClientRequestArgs,
    ) -> Result<ClientRequestResult, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            target,
            Request::ClientRequest {
                args,
                reply: reply_tx,
            },
        )
        .await?;
        self.await_reply(reply_rx).await
    }
}

/// Receiving end of one server's fabric channel.
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process a single incoming request directly against a shared core.
    ///
    /// Used by tests that drive RPC exchanges step by step. ClientRequests
    /// need a running server loop to commit, so here they are answered with
    /// a redirect to the last known leader.
    pub async fn process_one(&mut self, core: &SharedRaft) -> bool {
        match self.receiver.recv().await {
            Some(Request::RequestVote { args, reply }) => {
                let result = core.lock().await.handle_request_vote(&args);
                let _ = reply.send(result);
                true
            }
            Some(Request::AppendEntries { args, reply }) => {
                let result = core.lock().await.handle_append_entries(&args);
                let _ = reply.send(result);
                true
            }
            Some(Request::ClientRequest { args: _, reply }) => {
                let leader_hint = core.lock().await.current_leader;
                let _ = reply.send(ClientRequestResult {
                    success: false,
                    leader_hint,
                });
                true
            }
            None => false,
        }
    }

    /// Serve requests until the channel closes, dispatching through the
    /// server's [`RequestHandler`].
    ///
    /// ClientRequests block until commit, so each one runs in its own task;
    /// vote and append handling stays inline to preserve arrival order.
    pub async fn run(mut self, handler: RequestHandler) {
        while let Some(request) = self.receiver.recv().await {
            match request {
                Request::RequestVote { args, reply } => {
                    let _ = reply.send(handler.request_vote(args).await);
                }
                Request::AppendEntries { args, reply } => {
                    let _ = reply.send(handler.append_entries(args).await);
                }
                Request::ClientRequest { args, reply } => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(handler.client_request(args).await);
                    });
                }
            }
        }
    }

    /// Discard any queued requests (simulates lost messages).
    pub fn drain_pending(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// Create the raw fabric channels for a set of servers.
///
/// Returns the full sender map (used to build transports, including client
/// transports that can reach every server) and each server's receiving
/// handle.
pub fn create_channels(
    node_ids: &[u64],
) -> (HashMap<u64, mpsc::Sender<Request>>, HashMap<u64, NodeHandle>) {
    let mut senders = HashMap::new();
    let mut handles = HashMap::new();

    for &id in node_ids {
        let (tx, rx) = mpsc::channel(32);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    (senders, handles)
}

/// Create transports and handles for a cluster of servers (no timeout).
pub fn create_cluster(
    node_ids: &[u64],
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_timeout(node_ids, None)
}

/// Create transports and handles for a cluster of servers.
///
/// Each server's transport holds senders to every *other* server.
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let (senders, handles) = create_channels(node_ids);

    let mut transports = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(other_senders, t),
            None => InMemoryTransport::new(other_senders),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::core::log::Message;
    use crate::core::raft::{Raft, RoleKind};
    use crate::storage::memory::MemoryStorage;

    fn shared_node(id: u64, peers: Vec<u64>) -> SharedRaft {
        Arc::new(Mutex::new(
            Raft::new(id, peers, Box::new(MemoryStorage::new())).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_request_vote_roundtrip() {
        let node_ids = vec![1, 2, 3];
        let (transports, mut handles) = create_cluster(&node_ids);

        let node2 = shared_node(2, vec![1, 3]);

        let transport1 = transports.get(&1).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let vote_future = transport1.request_vote(2, args);
        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(vote_future, handle2.process_one(&node2));

        let result = result.unwrap();
        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
        assert_eq!(node2.lock().await.state.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_append_entries_roundtrip() {
        let node_ids = vec![1, 2, 3];
        let (transports, mut handles) = create_cluster(&node_ids);

        let node2 = shared_node(2, vec![1, 3]);

        let transport1 = transports.get(&1).unwrap();
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };

        let append_future = transport1.append_entries(2, args);
        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(append_future, handle2.process_one(&node2));

        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.term, 1);
        assert_eq!(node2.lock().await.current_leader, Some(1));
    }

    #[tokio::test]
    async fn test_node_not_found() {
        let node_ids = vec![1, 2];
        let (transports, _handles) = create_cluster(&node_ids);

        let transport1 = transports.get(&1).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let result = transport1.request_vote(99, args).await;
        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_vote_timeout() {
        let node_ids = vec![1, 2];
        let timeout = Duration::from_millis(100);
        let (transports, _handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let transport1 = transports.get(&1).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        // Nothing processes on node 2, so the call must time out
        let result = transport1.request_vote(2, args).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_responses_and_timeouts() {
        let node_ids = vec![1, 2, 3];
        let timeout = Duration::from_millis(100);
        let (transports, mut handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let node2 = shared_node(2, vec![1, 3]);
        // Node 3 won't respond

        let transport1 = transports.get(&1).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let mut handle2 = handles.remove(&2).unwrap();

        let vote2_future = transport1.request_vote(2, args.clone());
        let vote3_future = transport1.request_vote(3, args);

        let (result2, result3, _) =
            tokio::join!(vote2_future, vote3_future, handle2.process_one(&node2));

        assert!(result2.unwrap().vote_granted);
        assert!(matches!(result3, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_election_via_transport() {
        let node_ids = vec![1, 2, 3];
        let (transports, mut handles) = create_cluster(&node_ids);

        let node1 = shared_node(1, vec![2, 3]);
        let node2 = shared_node(2, vec![1, 3]);
        let node3 = shared_node(3, vec![1, 2]);

        node1.lock().await.start_election();
        let args = node1.lock().await.vote_args();

        let transport1 = transports.get(&1).unwrap();
        let vote2_future = transport1.request_vote(2, args.clone());
        let vote3_future = transport1.request_vote(3, args);

        let mut handle2 = handles.remove(&2).unwrap();
        let mut handle3 = handles.remove(&3).unwrap();

        let (result2, result3, _, _) = tokio::join!(
            vote2_future,
            vote3_future,
            handle2.process_one(&node2),
            handle3.process_one(&node3),
        );

        let mut core1 = node1.lock().await;
        let leader2 = core1.handle_request_vote_result(2, &result2.unwrap());
        let leader3 = core1.handle_request_vote_result(3, &result3.unwrap());

        assert!(leader2 || leader3);
        assert_eq!(core1.role_kind(), RoleKind::Leader);
    }

    #[tokio::test]
    async fn test_client_request_without_server_loop_redirects() {
        let node_ids = vec![1, 2];
        let (transports, mut handles) = create_cluster(&node_ids);

        let node2 = shared_node(2, vec![1]);
        node2.lock().await.current_leader = Some(1);

        let transport1 = transports.get(&1).unwrap();
        let request_future = transport1.client_request(
            2,
            ClientRequestArgs {
                message: Message::new("m"),
            },
        );

        let handle2 = handles.get_mut(&2).unwrap();
        let (result, _) = tokio::join!(request_future, handle2.process_one(&node2));

        let result = result.unwrap();
        assert!(!result.success);
        assert_eq!(result.leader_hint, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_requests_are_lost() {
        let node_ids = vec![1, 2];
        let timeout = Duration::from_millis(100);
        let (transports, mut handles) = create_cluster_with_timeout(&node_ids, Some(timeout));

        let transport1 = transports.get(&1).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let vote_future = transport1.request_vote(2, args);
        let handle2 = handles.get_mut(&2).unwrap();

        // The queued request is discarded, so its reply channel drops and
        // the caller sees the node as unreachable
        let (result, _) = tokio::join!(vote_future, async {
            tokio::task::yield_now().await;
            handle2.drain_pending();
        });
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed) | Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_fails() {
        let node_ids = vec![1, 2];
        let (transports, mut handles) = create_cluster(&node_ids);

        // Dropping the receiver simulates a killed server
        handles.remove(&2);

        let transport1 = transports.get(&1).unwrap();
        let result = transport1
            .request_vote(
                2,
                RequestVoteArgs {
                    term: 1,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed)));
    }
}
