//! Single dispatch point for the three wire RPCs.
//!
//! Both transports route through a `RequestHandler`, which answers
//! RequestVote and AppendEntries directly against the server's shared core
//! (the core mutex serializes them against timer-driven transitions) and
//! forwards ClientRequests into the server loop.

use tracing::debug;

use super::raft_node::SharedRaft;
use super::raft_server::{RaftError, RaftHandle};
use super::rpc::{
    AppendEntriesArgs, AppendEntriesResult, ClientRequestArgs, ClientRequestResult,
    RequestVoteArgs, RequestVoteResult,
};

/// Stateless RPC dispatcher for one server.
#[derive(Clone)]
pub struct RequestHandler {
    core: SharedRaft,
    handle: RaftHandle,
}

impl RequestHandler {
    pub fn new(core: SharedRaft, handle: RaftHandle) -> Self {
        Self { core, handle }
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteResult {
        self.core.lock().await.handle_request_vote(&args)
    }

    pub async fn append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesResult {
        self.core.lock().await.handle_append_entries(&args)
    }

    /// Submit a client message through the server loop. Succeeds only once
    /// the message is committed; failures carry a redirect hint when the
    /// leader is known.
    pub async fn client_request(&self, args: ClientRequestArgs) -> ClientRequestResult {
        match self.handle.submit(args.message).await {
            Ok(index) => {
                debug!(index, "client request committed");
                ClientRequestResult {
                    success: true,
                    leader_hint: None,
                }
            }
            Err(RaftError::NotLeader { leader_hint }) => ClientRequestResult {
                success: false,
                leader_hint,
            },
            Err(_) => {
                // Committed-elsewhere is impossible here; the caller may
                // retry against the same server
                let leader_hint = self.core.lock().await.current_leader;
                ClientRequestResult {
                    success: false,
                    leader_hint,
                }
            }
        }
    }
}
