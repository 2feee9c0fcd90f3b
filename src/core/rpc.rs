//! Wire types for the three RPC kinds.
//!
//! Every transport carries these same shapes; serde derives make them
//! JSON-serializable for the HTTP transport.

use serde::{Deserialize, Serialize};

use crate::core::log::{Entry, Message};

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting the vote
    pub candidate_id: u64,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for the candidate to update itself
    pub term: u64,
    /// True means the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments (heartbeat when `entries` is empty)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: u64,
    /// Term of the entry at `prev_log_index`
    pub prev_log_term: u64,
    /// Entries to store (empty for a pure heartbeat)
    pub entries: Vec<Entry>,
    /// Leader's commit index
    pub leader_commit: u64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for the leader to update itself
    pub term: u64,
    /// True if the follower contained an entry matching
    /// `prev_log_index`/`prev_log_term`
    pub success: bool,
    /// On a log mismatch, the follower's guess at the highest index where
    /// the logs may still agree; lets the leader jump `next_index` back
    /// instead of decrementing one step at a time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_hint: Option<u64>,
}

/// ClientRequest RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequestArgs {
    /// The payload to append to the replicated log
    pub message: Message,
}

/// ClientRequest RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequestResult {
    /// True once the message is committed (replicated to a majority)
    pub success: bool,
    /// On failure, the server the client should try next, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<u64>,
}
