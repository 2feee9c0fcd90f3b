//! HTTP transport for the Raft RPC surface.
//!
//! axum serves the routes, reqwest drives the client side; bodies are JSON.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::request_handler::RequestHandler;
use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, ClientRequestArgs, ClientRequestResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

/// HTTP transport over a peer address book.
pub struct HttpTransport {
    /// Map of server ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<u64, String>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        HttpTransport { peers, client }
    }

    async fn post<Req, Resp>(&self, target: u64, path: &str, args: &Req) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}{}", addr, path);

        let response = self.client.post(&url).json(args).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed
            }
        })?;

        response
            .json::<Resp>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post(target, "/raft/request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post(target, "/raft/append_entries", &args).await
    }

    async fn client_request(
        &self,
        target: u64,
        args: ClientRequestArgs,
    ) -> Result<ClientRequestResult, TransportError> {
        self.post(target, "/raft/client_request", &args).await
    }
}

/// axum router exposing the three RPC routes for one server.
pub fn create_router(handler: RequestHandler) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/client_request", post(handle_client_request))
        .with_state(handler)
}

async fn handle_request_vote(
    State(handler): State<RequestHandler>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteResult> {
    Json(handler.request_vote(args).await)
}

async fn handle_append_entries(
    State(handler): State<RequestHandler>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesResult> {
    Json(handler.append_entries(args).await)
}

async fn handle_client_request(
    State(handler): State<RequestHandler>,
    Json(args): Json<ClientRequestArgs>,
) -> Json<ClientRequestResult> {
    Json(handler.client_request(args).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::core::config::RaftConfig;
    use crate::core::raft::Raft;
    use crate::core::raft_server::RaftServer;
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::create_cluster_with_timeout;

    /// Boot a lone HTTP server for node 2 with no live peers.
    async fn spawn_node2() -> (std::net::SocketAddr, crate::core::raft_node::SharedRaft) {
        let (mut transports, _handles) =
            create_cluster_with_timeout(&[1, 2, 3], Some(Duration::from_millis(100)));

        let config = RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout(Duration::from_secs(100), Duration::from_secs(100));
        let core = Raft::new(2, vec![1, 3], Box::new(MemoryStorage::new())).unwrap();
        let (server, shared) =
            RaftServer::with_config(core, transports.remove(&2).unwrap(), config);
        let (handle, _task) = server.start();

        let router = create_router(RequestHandler::new(shared.clone(), handle));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        (addr, shared)
    }

    #[tokio::test]
    async fn test_http_request_vote() {
        let (addr, shared) = spawn_node2().await;

        let mut peers = HashMap::new();
        peers.insert(2, addr.to_string());
        let transport = HttpTransport::new(peers, Duration::from_secs(5));

        let result = transport
            .request_vote(
                2,
                RequestVoteArgs {
                    term: 1,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap();

        assert!(result.vote_granted);
        assert_eq!(result.term, 1);
        assert_eq!(shared.lock().await.state.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_http_append_entries() {
        let (addr, shared) = spawn_node2().await;

        let mut peers = HashMap::new();
        peers.insert(2, addr.to_string());
        let transport = HttpTransport::new(peers, Duration::from_secs(5));

        let result = transport
            .append_entries(
                2,
                AppendEntriesArgs {
                    term: 1,
                    leader_id: 1,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                },
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.term, 1);
        assert_eq!(shared.lock().await.current_leader, Some(1));
    }

    #[tokio::test]
    async fn test_http_unreachable_server() {
        let mut peers = HashMap::new();
        peers.insert(2, "127.0.0.1:59999".to_string());
        let transport = HttpTransport::new(peers, Duration::from_millis(100));

        let result = transport
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

        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed) | Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_http_node_not_found() {
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(5));

        let result = transport
            .append_entries(
                2,
                AppendEntriesArgs {
                    term: 1,
                    leader_id: 1,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                },
            )
            .await;

        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }
}
