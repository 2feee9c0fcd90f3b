//! Client for submitting messages to the cluster.
//!
//! The client tracks a leader hint, follows redirects, and rotates through
//! the configured servers with a fixed backoff when nobody claims
//! leadership. `send` resolves only once the submitting server reports the
//! message committed.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::core::log::Message;
use crate::core::rpc::ClientRequestArgs;
use crate::transport::Transport;

/// Retry policy for [`RaftClient::send`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Attempts before giving up (redirects count as attempts)
    pub max_retries: usize,
    /// Pause between attempts that were not direct redirects
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 20,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Errors surfaced to client callers
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// No server acknowledged a commit within the retry budget
    #[error("no leader reachable within the retry budget")]
    QuorumUnavailable,
}

/// A cluster client bound to some transport.
pub struct RaftClient<T: Transport> {
    name: String,
    transport: T,
    servers: Vec<u64>,
    leader_hint: Option<u64>,
    next_target: usize,
    config: ClientConfig,
}

impl<T: Transport> RaftClient<T> {
    pub fn new(
        name: impl Into<String>,
        transport: T,
        servers: Vec<u64>,
        leader_hint: Option<u64>,
    ) -> Self {
        Self::with_config(name, transport, servers, leader_hint, ClientConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        transport: T,
        servers: Vec<u64>,
        leader_hint: Option<u64>,
        config: ClientConfig,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            servers,
            leader_hint,
            next_target: 0,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a message, blocking the caller until a server acknowledges
    /// commitment or the retry budget runs out.
    pub async fn send(&mut self, message: Message) -> Result<(), ClientError> {
        for _attempt in 0..self.config.max_retries {
            let target = self.pick_target();

            match self
                .transport
                .client_request(
                    target,
                    ClientRequestArgs {
                        message: message.clone(),
                    },
                )
                .await
            {
                Ok(result) if result.success => {
                    self.leader_hint = Some(target);
                    return Ok(());
                }
                Ok(result) => {
                    self.leader_hint = result.leader_hint;
                    if result.leader_hint.is_some_and(|hint| hint != target) {
                        debug!(
                            client = %self.name,
                            from = target,
                            to = ?result.leader_hint,
                            "redirected to leader"
                        );
                        // Direct redirect: retry immediately
                        continue;
                    }
                }
                Err(err) => {
                    debug!(client = %self.name, target, error = %err, "server unreachable");
                    self.leader_hint = None;
                }
            }

            tokio::time::sleep(self.config.retry_backoff).await;
        }

        Err(ClientError::QuorumUnavailable)
    }

    /// The believed leader if any, otherwise round-robin over the servers.
    fn pick_target(&mut self) -> u64 {
        if let Some(hint) = self.leader_hint {
            return hint;
        }
        let target = self.servers[self.next_target % self.servers.len()];
        self.next_target += 1;
        target
    }
}
