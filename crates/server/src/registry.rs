//! Agent registry and connection router
//!
//! Each accepted connection runs two loops side by side:
//! - outbound: claims commands addressed to this agent from the shared
//!   command mailbox and writes them to the connection;
//! - inbound: reads frames, stamps them with the agent id and publishes them
//!   into the shared delegate mailbox.
//!
//! The delegate mailbox sees `connected` once the handshake succeeds and
//! exactly one matching `disconnected` when the connection ends, however it
//! ends.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use convoy_common::{AgentFrame, Error, Mailbox, Result, RunCommand, RunEvent, ServerFrame};

use crate::transport::TransportError;

/// Longest agent id accepted from a client
const MAX_AGENT_ID_LEN: usize = 128;

/// A run command addressed to one agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCommand {
    pub agent_id: String,
    pub command: RunCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// What upstream consumers receive from connected agents
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum AgentMessage {
    Status {
        agent_id: String,
        status: ConnectionStatus,
    },
    Event {
        agent_id: String,
        #[serde(flatten)]
        event: RunEvent,
    },
}

impl AgentMessage {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentMessage::Status { agent_id, .. } | AgentMessage::Event { agent_id, .. } => agent_id,
        }
    }
}

/// Tracks agent identity and routes traffic between connections and the two
/// shared mailboxes. One per server instance.
#[derive(Debug)]
pub struct AgentRegistry {
    commands: Mailbox<AgentCommand>,
    delegate: Mailbox<AgentMessage>,
    next_id: AtomicU64,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_mailboxes(Mailbox::new(), Mailbox::new())
    }

    pub fn with_mailboxes(commands: Mailbox<AgentCommand>, delegate: Mailbox<AgentMessage>) -> Self {
        Self {
            commands,
            delegate,
            next_id: AtomicU64::new(1),
        }
    }

    /// Inbound command mailbox, filtered per agent by the outbound loops
    pub fn commands(&self) -> &Mailbox<AgentCommand> {
        &self.commands
    }

    /// Status and event messages from every agent
    pub fn delegate(&self) -> &Mailbox<AgentMessage> {
        &self.delegate
    }

    /// Queue a run for an agent. It is delivered as soon as that agent is
    /// connected, or stays pending until it is.
    pub fn dispatch(&self, agent_id: impl Into<String>, command: RunCommand) {
        let agent_id = agent_id.into();
        debug!(%agent_id, test_run_id = %command.test_run_id, "Dispatching run");
        self.commands.send(AgentCommand { agent_id, command });
    }

    /// Accept a client-supplied id or hand out the next server id.
    pub fn assign_id(&self, requested: Option<String>) -> Result<String> {
        match requested {
            None => {
                let n = self.next_id.fetch_add(1, Ordering::Relaxed);
                Ok(format!("agent.{}", n))
            }
            Some(id) => {
                let valid = !id.is_empty()
                    && id.len() <= MAX_AGENT_ID_LEN
                    && id
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
                if valid {
                    Ok(id)
                } else {
                    Err(Error::InvalidAgentId(id))
                }
            }
        }
    }

    /// Serve one agent connection until it closes.
    ///
    /// Resets end the connection quietly; any other transport failure is
    /// returned so the caller can report it. Other connections are never
    /// affected.
    pub async fn serve_connection<R, W>(&self, mut frames: R, mut sink: W) -> Result<()>
    where
        R: Stream<Item = std::result::Result<String, TransportError>> + Unpin + Send,
        W: Sink<String, Error = TransportError> + Unpin + Send,
    {
        let agent_id = match self.handshake(&mut frames).await? {
            Some(agent_id) => agent_id,
            None => {
                debug!("Connection closed before handshake");
                return Ok(());
            }
        };

        info!(%agent_id, "Agent connected");
        self.delegate.send(AgentMessage::Status {
            agent_id: agent_id.clone(),
            status: ConnectionStatus::Connected,
        });
        let _disconnect = Disconnect {
            delegate: self.delegate.clone(),
            agent_id: agent_id.clone(),
        };

        let result = tokio::select! {
            result = self.outbound(&agent_id, &mut sink) => result,
            result = self.inbound(&agent_id, &mut frames) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(TransportError::Reset) => {
                debug!(%agent_id, "Connection reset");
                Ok(())
            }
            Err(TransportError::Fatal(message)) => Err(Error::Transport(format!(
                "agent {}: {}",
                agent_id, message
            ))),
        }
    }

    /// Wait for the `connect` frame. `None` when the peer left first.
    async fn handshake<R>(&self, frames: &mut R) -> Result<Option<String>>
    where
        R: Stream<Item = std::result::Result<String, TransportError>> + Unpin + Send,
    {
        let text = match frames.next().await {
            None | Some(Err(TransportError::Reset)) => return Ok(None),
            Some(Err(TransportError::Fatal(message))) => return Err(Error::Transport(message)),
            Some(Ok(text)) => text,
        };
        match serde_json::from_str::<AgentFrame>(&text) {
            Ok(AgentFrame::Connect { agent_id }) => self.assign_id(agent_id).map(Some),
            Ok(other) => Err(Error::Protocol(format!(
                "expected connect frame, got {:?}",
                other
            ))),
            Err(e) => Err(Error::Protocol(format!("invalid handshake: {}", e))),
        }
    }

    async fn outbound<W>(&self, agent_id: &str, sink: &mut W) -> std::result::Result<(), TransportError>
    where
        W: Sink<String, Error = TransportError> + Unpin + Send,
    {
        loop {
            let id = agent_id.to_string();
            let claimed = self
                .commands
                .receive(move |c: &AgentCommand| c.agent_id == id)
                .await;

            let frame = ServerFrame::Run(claimed.command.clone());
            // Held across the send: a failed or abandoned send keeps the run
            // for this agent's next connection.
            let undelivered = Undelivered {
                commands: self.commands.clone(),
                command: Some(claimed),
            };
            let text =
                serde_json::to_string(&frame).map_err(|e| TransportError::Fatal(e.to_string()))?;
            sink.send(text).await?;
            undelivered.delivered();
            debug!(%agent_id, "Sent run command");
        }
    }

    async fn inbound<R>(&self, agent_id: &str, frames: &mut R) -> std::result::Result<(), TransportError>
    where
        R: Stream<Item = std::result::Result<String, TransportError>> + Unpin + Send,
    {
        while let Some(frame) = frames.next().await {
            let text = frame?;
            match serde_json::from_str::<AgentFrame>(&text) {
                Ok(AgentFrame::Event { event }) => {
                    self.delegate.send(AgentMessage::Event {
                        agent_id: agent_id.to_string(),
                        event,
                    });
                }
                Ok(AgentFrame::Connect { .. }) => {
                    warn!(%agent_id, "Ignoring repeated handshake");
                }
                Err(e) => warn!(%agent_id, "Ignoring malformed frame: {}", e),
            }
        }
        Ok(())
    }
}

/// A claimed command that has not reached the agent yet.
struct Undelivered {
    commands: Mailbox<AgentCommand>,
    command: Option<AgentCommand>,
}

impl Undelivered {
    fn delivered(mut self) {
        self.command = None;
    }
}

impl Drop for Undelivered {
    fn drop(&mut self) {
        if let Some(command) = self.command.take() {
            debug!(
                agent_id = %command.agent_id,
                test_run_id = %command.command.test_run_id,
                "Run not delivered, requeueing"
            );
            self.commands.send(command);
        }
    }
}

/// Publishes `disconnected` when the connection scope ends.
struct Disconnect {
    delegate: Mailbox<AgentMessage>,
    agent_id: String,
}

impl Drop for Disconnect {
    fn drop(&mut self) {
        info!(agent_id = %self.agent_id, "Agent disconnected");
        self.delegate.send(AgentMessage::Status {
            agent_id: std::mem::take(&mut self.agent_id),
            status: ConnectionStatus::Disconnected,
        });
    }
}
