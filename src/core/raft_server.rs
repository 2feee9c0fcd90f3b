//! The per-server event loop and its client-facing handle.
//!
//! One `RaftServer` is one logical thread of control: its loop owns the
//! election deadline and the heartbeat interval and is the only place that
//! initiates role transitions for this server.

use std::pin::pin;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::debug;

use super::config::RaftConfig;
use super::log::Message;
use super::raft::{Raft, RoleKind};
use super::raft_node::{RaftNode, SharedRaft};
use crate::transport::{Transport, TransportError};

/// Errors surfaced by the server's client request path
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// This server is not the leader (includes a leader hint if known)
    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },
    /// The entry could not be committed (majority unreachable this round)
    #[error("entry not committed: majority unreachable")]
    NotCommitted,
    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Commands sent into the server loop
enum Command {
    /// Append a client message and replicate it until committed
    Submit {
        message: Message,
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
}

/// Handle for interacting with a running server
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Submit a message to the cluster through this server.
    ///
    /// Resolves with the committed entry's index once the entry is
    /// replicated to a majority, not merely appended.
    pub async fn submit(&self, message: Message) -> Result<u64, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Submit {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::NotLeader { leader_hint: None })?;

        reply_rx
            .await
            .map_err(|_| RaftError::NotLeader { leader_hint: None })?
    }

    /// Ask the server loop to stop after its current event.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// The role state machine runner for one server.
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    config: RaftConfig,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a server with the default config.
    /// Returns the server and the shared core for RPC handling.
    pub fn new(core: Raft, transport: T) -> (Self, SharedRaft) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a server with a custom config.
    pub fn with_config(core: Raft, transport: T, config: RaftConfig) -> (Self, SharedRaft) {
        config.validate();
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let shared = node.shared_core();
        let server = Self {
            node,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            config,
        };
        (server, shared)
    }

    /// Spawn the event loop.
    ///
    /// Returns the interaction handle and the loop's JoinHandle; aborting
    /// the latter is a crash (timers and in-flight waits die immediately),
    /// as opposed to the handle's graceful `shutdown()`.
    pub fn start(self) -> (RaftHandle, JoinHandle<()>) {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Main event loop.
    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // Delay keeps missed ticks from bursting after a long replication round
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Re-rolled on every pass, so each timer reset randomizes anew
            let election_timeout = self.config.random_election_timeout();
            let deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(deadline));

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                Some(command) = self.command_rx.recv() => match command {
                    Command::Submit { message, reply } => {
                        let result = self.handle_submit(message).await;
                        let _ = reply.send(result);
                    }
                },
                _ = heartbeat.tick() => {
                    if self.node.role_kind().await == RoleKind::Leader {
                        // Leaders keep their own election timer quiet
                        self.node.shared_core().lock().await.last_heartbeat = Instant::now();
                        self.node.send_heartbeat().await;
                    }
                }
                _ = election_sleep => {
                    if self.node.role_kind().await != RoleKind::Leader
                        && self.election_timed_out(election_timeout).await
                    {
                        self.node.start_election().await;
                        if self.node.request_votes().await {
                            // Assert leadership before any follower times out
                            self.node.send_heartbeat().await;
                        }
                    }
                }
                else => break,
            }
        }
        debug!("server loop stopped");
    }

    async fn election_deadline(&self, timeout: Duration) -> Instant {
        self.node.shared_core().lock().await.last_heartbeat + timeout
    }

    /// The deadline is computed from a snapshot of `last_heartbeat`; verify
    /// nothing reset the timer while we were sleeping.
    async fn election_timed_out(&self, timeout: Duration) -> bool {
        let last_heartbeat = self.node.shared_core().lock().await.last_heartbeat;
        Instant::now() >= last_heartbeat + timeout
    }

    /// Append a client message and replicate it, resolving only on commit.
    async fn handle_submit(&self, message: Message) -> Result<u64, RaftError> {
        let entry_index = {
            let mut core = self.node.shared_core().lock_owned().await;
            if !core.is_leader() {
                return Err(RaftError::NotLeader {
                    leader_hint: core.current_leader,
                });
            }
            let entry = core.append_message(message).ok_or(RaftError::NotLeader {
                leader_hint: None,
            })?;
            entry.index
        };

        if self.node.replicate_to_peers(entry_index).await {
            Ok(entry_index)
        } else {
            Err(RaftError::NotCommitted)
        }
    }

    // Driver methods for tests and harnesses that sequence rounds manually.

    pub async fn start_election(&self) {
        self.node.start_election().await;
    }

    pub async fn request_votes(&self) -> bool {
        self.node.request_votes().await
    }

    pub async fn send_heartbeat(&self) -> bool {
        self.node.send_heartbeat().await
    }

    pub async fn replicate_to_peers(&self, entry_index: u64) -> bool {
        self.node.replicate_to_peers(entry_index).await
    }

    pub async fn role_kind(&self) -> RoleKind {
        self.node.role_kind().await
    }

    pub async fn commit_index(&self) -> u64 {
        self.node.commit_index().await
    }
}
