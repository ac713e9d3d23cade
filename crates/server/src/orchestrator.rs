//! Run orchestration
//!
//! Sits on the far side of the registry: posts run commands into the command
//! mailbox and consumes the delegate mailbox, keeping a roster of connected
//! agents and fanning every message out to event-stream subscribers.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use convoy_common::{RunCommand, TestNode};

use crate::registry::{AgentMessage, AgentRegistry, ConnectionStatus};

/// A connected agent as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    /// Live connections under this id
    pub connections: usize,
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    agents: RwLock<BTreeMap<String, AgentInfo>>,
    feed: broadcast::Sender<AgentMessage>,
}

impl Orchestrator {
    pub fn new(registry: Arc<AgentRegistry>, event_buffer: usize) -> Self {
        let (feed, _) = broadcast::channel(event_buffer.max(1));
        Self {
            registry,
            agents: RwLock::new(BTreeMap::new()),
            feed,
        }
    }

    /// Post a run for an agent and return its test run id.
    pub fn start_run(
        &self,
        agent_id: &str,
        manifest_url: String,
        tree: TestNode,
        test_run_id: Option<String>,
    ) -> String {
        let test_run_id = test_run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        info!(%agent_id, %test_run_id, "Starting run from {}", manifest_url);
        self.registry.dispatch(
            agent_id,
            RunCommand {
                test_run_id: test_run_id.clone(),
                manifest_url,
                tree,
            },
        );
        test_run_id
    }

    /// Connected agents, ordered by id
    pub fn agents(&self) -> Vec<AgentInfo> {
        self.agents.read().values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentMessage> {
        self.feed.subscribe()
    }

    /// Consume the delegate mailbox forever.
    pub async fn run(&self) {
        loop {
            let message = self.registry.delegate().receive_any().await;
            self.handle(message);
        }
    }

    fn handle(&self, message: AgentMessage) {
        match &message {
            AgentMessage::Status { agent_id, status } => self.track(agent_id, *status),
            AgentMessage::Event { agent_id, event } => {
                debug!(%agent_id, test_run_id = %event.test_run_id, "{}", event.event.kind());
            }
        }
        // No subscribers is fine
        let _ = self.feed.send(message);
    }

    fn track(&self, agent_id: &str, status: ConnectionStatus) {
        let mut agents = self.agents.write();
        match status {
            ConnectionStatus::Connected => {
                agents
                    .entry(agent_id.to_string())
                    .and_modify(|info| info.connections += 1)
                    .or_insert_with(|| AgentInfo {
                        agent_id: agent_id.to_string(),
                        connected_at: Utc::now(),
                        connections: 1,
                    });
            }
            ConnectionStatus::Disconnected => {
                let gone = match agents.get_mut(agent_id) {
                    Some(info) => {
                        info.connections = info.connections.saturating_sub(1);
                        info.connections == 0
                    }
                    None => false,
                };
                if gone {
                    agents.remove(agent_id);
                }
            }
        }
    }
}
