//! Agent mode: executes runs sent by a convoy server
//!
//! The agent opens the connection with a `connect` frame, then runs every
//! `run` frame it receives through its own [`LaneScheduler`]. Each
//! [`RunEvent`] the scheduler publishes goes back as an `event` frame; the
//! server stamps it with this agent's id. When the connection ends, runs
//! still in progress are halted and their lanes torn down before returning.

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use convoy_common::{AgentFrame, Mailbox, RunEvent, ServerFrame};

use crate::error::{LaneError, LaneResult};
use crate::scheduler::{LaneConfig, LaneScheduler};

pub struct Agent {
    config: LaneConfig,
    agent_id: Option<String>,
}

impl Agent {
    /// `agent_id` is requested from the server; `None` lets it assign one.
    pub fn new(config: LaneConfig, agent_id: Option<String>) -> Self {
        Self { config, agent_id }
    }

    /// Serve one server connection until it closes or fails.
    pub async fn serve<R, E, W, F>(&self, mut frames: R, mut sink: W) -> LaneResult<()>
    where
        R: Stream<Item = Result<String, E>> + Unpin + Send,
        E: Display,
        W: Sink<String, Error = F> + Unpin + Send,
        F: Display,
    {
        let hello = serde_json::to_string(&AgentFrame::Connect {
            agent_id: self.agent_id.clone(),
        })?;
        sink.send(hello).await.map_err(transport)?;
        info!(agent_id = ?self.agent_id, "Connected, waiting for runs");

        let events: Mailbox<RunEvent> = Mailbox::new();
        let scheduler = Arc::new(LaneScheduler::new(self.config.clone(), events.clone()));
        let cancel = CancellationToken::new();
        let runs = TaskTracker::new();

        let result = tokio::select! {
            result = relay(&events, &mut sink) => result,
            result = accept(&mut frames, &scheduler, &cancel, &runs) => result,
        };

        if !runs.is_empty() {
            info!("Connection gone, halting {} run(s)", runs.len());
        }
        cancel.cancel();
        runs.close();
        runs.wait().await;
        result
    }
}

/// Forward scheduler events to the server.
async fn relay<W, F>(events: &Mailbox<RunEvent>, sink: &mut W) -> LaneResult<()>
where
    W: Sink<String, Error = F> + Unpin + Send,
    F: Display,
{
    loop {
        let event = events.receive_any().await;
        let frame = serde_json::to_string(&AgentFrame::Event { event })?;
        sink.send(frame).await.map_err(transport)?;
    }
}

/// Start a scheduler run for every `run` frame.
async fn accept<R, E>(
    frames: &mut R,
    scheduler: &Arc<LaneScheduler>,
    cancel: &CancellationToken,
    runs: &TaskTracker,
) -> LaneResult<()>
where
    R: Stream<Item = Result<String, E>> + Unpin + Send,
    E: Display,
{
    while let Some(frame) = frames.next().await {
        let text = frame.map_err(transport)?;
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Run(command)) => {
                info!(
                    test_run_id = %command.test_run_id,
                    "Run received for {}", command.manifest_url
                );
                let scheduler = scheduler.clone();
                let cancel = cancel.child_token();
                runs.spawn(async move { scheduler.run(&command, cancel).await });
            }
            Err(e) => warn!("Ignoring malformed server frame: {}", e),
        }
    }
    info!("Server closed the connection");
    Ok(())
}

fn transport(e: impl Display) -> LaneError {
    LaneError::Transport(e.to_string())
}
