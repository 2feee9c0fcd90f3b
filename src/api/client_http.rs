//! Client-facing HTTP API.
//!
//! External clients submit messages and inspect server status here; the
//! Raft RPC routes live in the transport layer.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::log::Message;
use crate::core::raft::RoleKind;
use crate::core::raft_node::SharedRaft;
use crate::core::raft_server::{RaftError, RaftHandle};

/// State for the client HTTP handlers: the handle for submissions and the
/// core for status queries.
#[derive(Clone)]
pub struct ClientState {
    pub handle: RaftHandle,
    pub core: SharedRaft,
}

/// Request body for submitting a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub message: String,
}

/// Response from a successful submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Index the message was committed at
    pub index: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Server the client should try next, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<u64>,
}

/// Response for the leader query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader_id: Option<u64>,
    pub node_id: u64,
    pub is_leader: bool,
}

/// Response for the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: u64,
    /// Current role (Follower, Candidate, Leader)
    pub role: String,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub log_length: u64,
}

/// axum router for the client API.
pub fn create_client_router(handle: RaftHandle, core: SharedRaft) -> Router {
    let state = ClientState { handle, core };
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .with_state(state)
}

/// POST /client/submit: append a message and wait for commit.
async fn handle_submit(
    State(state): State<ClientState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.handle.submit(Message::new(request.message)).await {
        Ok(index) => Ok(Json(SubmitResponse { index })),
        Err(RaftError::NotLeader { leader_hint }) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "not the leader".to_string(),
                leader_hint,
            }),
        )),
        Err(RaftError::NotCommitted) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "not committed: majority unreachable".to_string(),
                leader_hint: None,
            }),
        )),
        Err(RaftError::Transport(_)) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "transport error".to_string(),
                leader_hint: None,
            }),
        )),
    }
}

/// GET /client/leader
async fn handle_leader(State(state): State<ClientState>) -> Json<LeaderResponse> {
    let core = state.core.lock().await;
    Json(LeaderResponse {
        leader_id: core.current_leader,
        node_id: core.state.server_id,
        is_leader: core.role_kind() == RoleKind::Leader,
    })
}

/// GET /client/status
async fn handle_status(State(state): State<ClientState>) -> Json<StatusResponse> {
    let core = state.core.lock().await;
    Json(StatusResponse {
        node_id: core.state.server_id,
        role: format!("{:?}", core.role_kind()),
        term: core.state.current_term,
        leader_id: core.current_leader,
        commit_index: core.state.commit_index,
        log_length: core.state.log.len() as u64,
    })
}
