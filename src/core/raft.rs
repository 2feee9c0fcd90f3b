//! The synchronous consensus state machine.
//!
//! `Raft` owns one server's persistent state and role, and implements the
//! vote, replication and commit rules. It is transport-agnostic and does no
//! IO of its own beyond the pluggable [`Storage`] collaborator; all
//! networking and timers live in the async layers above.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::log::{Entry, Message, RaftLog};
use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, RequestVoteArgs, RequestVoteResult,
};
use crate::storage::{Storage, StorageError};

/// Flat role discriminant, for comparisons and status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

/// A server's role together with its role-specific volatile state.
///
/// Exactly one role is active per server at any instant. The volatile state
/// is discarded on every transition.
#[derive(Debug, Clone)]
pub enum Role {
    /// Passive state, receives updates from the leader
    Follower,
    /// Actively collecting votes to become leader
    Candidate {
        /// Servers that granted a vote this term, self included
        votes_received: Vec<u64>,
    },
    /// Handles client requests and replicates the log
    Leader {
        /// Per peer, index of the next entry to send
        next_index: HashMap<u64, u64>,
        /// Per peer, highest index known to be replicated there
        match_index: HashMap<u64, u64>,
    },
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower => RoleKind::Follower,
            Role::Candidate { .. } => RoleKind::Candidate,
            Role::Leader { .. } => RoleKind::Leader,
        }
    }
}

/// Per-server persistent state.
///
/// `current_term` is non-decreasing over the server's lifetime; `voted_for`
/// is only valid for the term it was set in and is cleared whenever a new
/// term is adopted. Term, vote and log mutations are written through the
/// storage collaborator before any RPC answer leaves the server.
pub struct RaftState {
    pub server_id: u64,
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,
    pub commit_index: u64,
    storage: Box<dyn Storage>,
}

impl RaftState {
    pub fn new(server_id: u64, storage: Box<dyn Storage>) -> Result<Self, StorageError> {
        let current_term = storage.load_term()?;
        let voted_for = storage.load_voted_for()?;
        let log = RaftLog::from_entries(storage.load_log()?);
        Ok(RaftState {
            server_id,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            storage,
        })
    }

    // Storage follows a fail-stop model: a broken persistence contract
    // leaves the server unable to answer any RPC safely.

    fn set_term(&mut self, term: u64) {
        self.storage.save_term(term).expect("failed to persist term");
        self.current_term = term;
    }

    fn set_voted_for(&mut self, voted_for: Option<u64>) {
        self.storage
            .save_voted_for(voted_for)
            .expect("failed to persist vote");
        self.voted_for = voted_for;
    }

    /// Adopt a higher term, clearing the vote recorded for the old one.
    fn adopt_term(&mut self, term: u64) {
        self.set_term(term);
        self.set_voted_for(None);
    }

    /// Append a new entry stamped with `term` and persist it.
    fn append(&mut self, term: u64, message: Message) -> Entry {
        let entry = self.log.append(term, message);
        self.storage
            .append_entries(std::slice::from_ref(&entry))
            .expect("failed to persist log entry");
        entry
    }

    /// Append an entry replicated from a leader and persist it.
    fn append_replicated(&mut self, entry: Entry) {
        self.storage
            .append_entries(std::slice::from_ref(&entry))
            .expect("failed to persist log entry");
        self.log.push(entry);
    }

    /// Drop the log suffix starting at `from_index` and persist the cut.
    fn truncate_from(&mut self, from_index: u64) {
        self.storage
            .truncate_log(from_index)
            .expect("failed to truncate log");
        self.log.truncate_from(from_index);
    }
}

/// The consensus engine for one server.
pub struct Raft {
    pub state: RaftState,
    pub role: Role,
    /// IDs of the other configured cluster members. Fixed at construction;
    /// quorum is always computed over this set plus self, live or not.
    pub peers: Vec<u64>,
    /// Last known leader, updated from valid AppendEntries
    pub current_leader: Option<u64>,
    /// Last time the election timer was reset (valid AppendEntries received,
    /// vote granted, or election started)
    pub last_heartbeat: Instant,
}

impl Raft {
    pub fn new(
        server_id: u64,
        peers: Vec<u64>,
        storage: Box<dyn Storage>,
    ) -> Result<Self, StorageError> {
        Ok(Raft {
            state: RaftState::new(server_id, storage)?,
            role: Role::Follower,
            peers,
            current_leader: None,
            last_heartbeat: Instant::now(),
        })
    }

    pub fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// Configured member count, independent of which servers are alive.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the configured member count.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn last_log_index(&self) -> u64 {
        self.state.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.state.log.last_term()
    }

    /// Whether a candidate's log is at least as up-to-date as ours:
    /// last term compared first, last index breaks the tie.
    fn log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index())
    }

    /// Revert to follower after observing a higher term.
    fn step_down(&mut self, term: u64) {
        let from = self.role_kind();
        self.state.adopt_term(term);
        self.role = Role::Follower;
        if from != RoleKind::Follower {
            info!(
                node = self.state.server_id,
                term, ?from, "stepped down to follower"
            );
        }
    }

    /// Arguments for a RequestVote broadcast in the current term.
    pub fn vote_args(&self) -> RequestVoteArgs {
        RequestVoteArgs {
            term: self.state.current_term,
            candidate_id: self.state.server_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Handle a RequestVote RPC against local state, whatever our role.
    pub fn handle_request_vote(&mut self, req: &RequestVoteArgs) -> RequestVoteResult {
        if req.term < self.state.current_term {
            return RequestVoteResult {
                term: self.state.current_term,
                vote_granted: false,
            };
        }

        if req.term > self.state.current_term {
            self.step_down(req.term);
        }

        let already_voted_other = self
            .state
            .voted_for
            .is_some_and(|v| v != req.candidate_id);

        if already_voted_other || !self.log_up_to_date(req.last_log_term, req.last_log_index) {
            return RequestVoteResult {
                term: self.state.current_term,
                vote_granted: false,
            };
        }

        self.state.set_voted_for(Some(req.candidate_id));
        // A granted vote counts as activity for the election timer
        self.last_heartbeat = Instant::now();
        debug!(
            node = self.state.server_id,
            term = self.state.current_term,
            candidate = req.candidate_id,
            "vote granted"
        );

        RequestVoteResult {
            term: self.state.current_term,
            vote_granted: true,
        }
    }

    /// Handle an AppendEntries RPC (heartbeat or replication).
    pub fn handle_append_entries(&mut self, req: &AppendEntriesArgs) -> AppendEntriesResult {
        if req.term > self.state.current_term {
            self.step_down(req.term);
        }

        if req.term < self.state.current_term {
            return AppendEntriesResult {
                term: self.state.current_term,
                success: false,
                match_hint: None,
            };
        }

        // Valid AppendEntries from the current leader: any non-follower role
        // at this term yields, and the election timer resets.
        if !matches!(self.role, Role::Follower) {
            let from = self.role_kind();
            self.role = Role::Follower;
            info!(
                node = self.state.server_id,
                term = self.state.current_term,
                leader = req.leader_id,
                ?from,
                "yielding to leader"
            );
        }
        self.current_leader = Some(req.leader_id);
        self.last_heartbeat = Instant::now();

        // Consistency check: our log must contain the entry the leader is
        // appending after.
        if req.prev_log_index > 0 {
            match self.state.log.term_at(req.prev_log_index) {
                None => {
                    // Log too short; tell the leader how far we actually go
                    return AppendEntriesResult {
                        term: self.state.current_term,
                        success: false,
                        match_hint: Some(self.last_log_index()),
                    };
                }
                Some(term) if term != req.prev_log_term => {
                    // Conflicting term; hint skips the whole conflicting run
                    let hint = self.state.log.first_index_of_term(req.prev_log_index) - 1;
                    return AppendEntriesResult {
                        term: self.state.current_term,
                        success: false,
                        match_hint: Some(hint),
                    };
                }
                Some(_) => {}
            }
        }

        // Append new entries, truncating any conflicting suffix first.
        let mut last_new_index = req.prev_log_index;
        for entry in &req.entries {
            match self.state.log.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    // Already have it (duplicate delivery); skip
                }
                Some(_) => {
                    self.state.truncate_from(entry.index);
                    self.state.append_replicated(entry.clone());
                    debug!(
                        node = self.state.server_id,
                        index = entry.index,
                        term = entry.term,
                        "replaced conflicting entry"
                    );
                }
                None => {
                    self.state.append_replicated(entry.clone());
                }
            }
            last_new_index = entry.index;
        }

        // Only trust the leader's commit index as far as the entries this
        // request actually matched.
        if req.leader_commit > self.state.commit_index {
            self.state.commit_index = req.leader_commit.min(last_new_index);
        }

        AppendEntriesResult {
            term: self.state.current_term,
            success: true,
            match_hint: None,
        }
    }

    /// Election timer fired: become candidate for the next term and vote
    /// for ourselves.
    pub fn start_election(&mut self) {
        let term = self.state.current_term + 1;
        self.state.set_term(term);
        self.state.set_voted_for(Some(self.state.server_id));
        self.role = Role::Candidate {
            votes_received: vec![self.state.server_id],
        };
        self.current_leader = None;
        self.last_heartbeat = Instant::now();
        info!(node = self.state.server_id, term, "became candidate");
    }

    /// Majority reached: take leadership for the current term.
    pub fn become_leader(&mut self) {
        let next = self.last_log_index() + 1;
        self.role = Role::Leader {
            next_index: self.peers.iter().map(|&p| (p, next)).collect(),
            match_index: self.peers.iter().map(|&p| (p, 0)).collect(),
        };
        self.current_leader = Some(self.state.server_id);
        self.last_heartbeat = Instant::now();
        info!(
            node = self.state.server_id,
            term = self.state.current_term,
            "became leader"
        );
    }

    /// Append a client message to the log (leader only).
    /// Returns None when called on a non-leader.
    pub fn append_message(&mut self, message: Message) -> Option<Entry> {
        if !self.is_leader() {
            return None;
        }
        let term = self.state.current_term;
        let entry = self.state.append(term, message);
        debug!(
            node = self.state.server_id,
            index = entry.index,
            term,
            "appended client entry"
        );
        Some(entry)
    }

    /// Process a vote response. Returns true if this node just won the
    /// election and became leader.
    pub fn handle_request_vote_result(
        &mut self,
        peer_id: u64,
        result: &RequestVoteResult,
    ) -> bool {
        if result.term > self.state.current_term {
            self.step_down(result.term);
            return false;
        }

        let majority = self.majority();
        let current_term = self.state.current_term;
        let won = match &mut self.role {
            Role::Candidate { votes_received } => {
                // Votes only count for the election they were cast in
                if result.vote_granted
                    && result.term == current_term
                    && !votes_received.contains(&peer_id)
                {
                    votes_received.push(peer_id);
                }
                votes_received.len() >= majority
            }
            _ => false,
        };

        if won {
            self.become_leader();
        }
        won
    }

    /// Process an AppendEntries response for entries sent up to
    /// `last_sent_index` (0 for a pure heartbeat). Returns true if the
    /// commit index advanced.
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: u64,
        last_sent_index: u64,
        result: &AppendEntriesResult,
    ) -> bool {
        if result.term > self.state.current_term {
            self.step_down(result.term);
            return false;
        }

        let Role::Leader {
            next_index,
            match_index,
        } = &mut self.role
        else {
            return false;
        };

        if result.success {
            if last_sent_index > 0 {
                let matched = match_index.entry(peer_id).or_insert(0);
                if last_sent_index > *matched {
                    *matched = last_sent_index;
                }
                next_index.insert(peer_id, last_sent_index + 1);
            }
        } else {
            // Log mismatch: back up, preferring the follower's hint but
            // always making progress.
            let next = next_index.entry(peer_id).or_insert(1);
            let fallback = (*next).saturating_sub(1).max(1);
            *next = match result.match_hint {
                Some(hint) => (hint + 1).min(fallback).max(1),
                None => fallback,
            };
            debug!(
                node = self.state.server_id,
                peer = peer_id,
                next = *next,
                "log mismatch, backtracking"
            );
            return false;
        }

        self.advance_commit_index()
    }

    /// Advance the commit index to the highest entry replicated on a
    /// majority, counting only current-term entries directly. Prior-term
    /// entries commit implicitly when a current-term entry covers them.
    fn advance_commit_index(&mut self) -> bool {
        let current_term = self.state.current_term;
        let majority = self.majority();

        let Role::Leader { match_index, .. } = &self.role else {
            return false;
        };

        let mut new_commit = None;
        let mut n = self.state.log.last_index();
        while n > self.state.commit_index {
            match self.state.log.term_at(n) {
                Some(term) if term == current_term => {
                    let replicas = 1 + match_index.values().filter(|&&m| m >= n).count();
                    if replicas >= majority {
                        new_commit = Some(n);
                        break;
                    }
                }
                // Terms only decrease going backwards; nothing older can
                // be counted directly.
                Some(term) if term < current_term => break,
                _ => {}
            }
            n -= 1;
        }

        match new_commit {
            Some(n) => {
                self.state.commit_index = n;
                debug!(
                    node = self.state.server_id,
                    commit_index = n,
                    "advanced commit index"
                );
                true
            }
            None => false,
        }
    }

    /// Build the AppendEntries request for one peer, carrying every entry
    /// from that peer's `next_index` onward. Returns the args and the index
    /// of the last entry included (0 for a pure heartbeat).
    pub fn append_args_for(&self, peer_id: u64) -> Option<(AppendEntriesArgs, u64)> {
        let Role::Leader { next_index, .. } = &self.role else {
            return None;
        };

        let next = next_index.get(&peer_id).copied().unwrap_or(1);
        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.state.log.term_at(prev_log_index).unwrap_or(0)
        };
        let entries: Vec<Entry> = self.state.log.entries_from(next).to_vec();
        let last_sent_index = entries.last().map(|e| e.index).unwrap_or(0);

        let args = AppendEntriesArgs {
            term: self.state.current_term,
            leader_id: self.state.server_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.commit_index,
        };
        Some((args, last_sent_index))
    }
}
