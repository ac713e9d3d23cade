//! Lane scheduler: one worker process per leaf path
//!
//! For a run, the scheduler enumerates the tree's leaf paths and starts one
//! lane per path, all at once. A lane:
//! - publishes `lane:begin`,
//! - spawns a `convoy-lane` worker in its own process group,
//! - waits for `{"ready":true}` before sending the run command,
//! - re-tags every worker event with the run id and publishes it,
//! - publishes `lane:end` on every way out, including being halted.
//!
//! Lane failures stay inside the lane; the scheduler's caller never sees them
//! as errors.

use futures::{stream, StreamExt};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convoy_common::{LaneCommand, Mailbox, RunCommand, RunEvent, TestEvent, WorkerMessage};

use crate::error::{LaneError, LaneResult};
use crate::process::{ProcessGroup, DEFAULT_KILL_GRACE};
use crate::worker::STEP_TIMEOUT_ENV;

/// Longest protocol line accepted from a worker
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Name of the worker binary
pub const WORKER_BINARY: &str = "convoy-lane";

/// Configuration for spawning lanes
#[derive(Debug, Clone)]
pub struct LaneConfig {
    /// Path to the convoy-lane binary
    pub worker_binary: PathBuf,

    /// Time between SIGTERM and SIGKILL when tearing a lane down
    pub kill_grace: Duration,

    /// Step/assertion deadline handed to workers (None = worker default)
    pub step_timeout: Option<Duration>,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            worker_binary: default_worker_binary(),
            kill_grace: DEFAULT_KILL_GRACE,
            step_timeout: None,
        }
    }
}

/// The worker binary installed next to the current executable, if any,
/// otherwise whatever `convoy-lane` resolves to on PATH.
fn default_worker_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(WORKER_BINARY))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
}

/// Decomposes runs into lanes and supervises them
pub struct LaneScheduler {
    config: Arc<LaneConfig>,
    events: Mailbox<RunEvent>,
}

impl LaneScheduler {
    /// Create a scheduler publishing into `events`
    pub fn new(config: LaneConfig, events: Mailbox<RunEvent>) -> Self {
        Self {
            config: Arc::new(config),
            events,
        }
    }

    /// Mailbox receiving every event of every run
    pub fn events(&self) -> &Mailbox<RunEvent> {
        &self.events
    }

    /// Execute a run to completion, or until `cancel` fires.
    ///
    /// Publishes `run:begin`, then the events of every lane, then `run:end`.
    pub async fn run(&self, command: &RunCommand, cancel: CancellationToken) {
        let tree = &command.tree;
        if !tree.is_leaf() && (!tree.steps.is_empty() || !tree.assertions.is_empty()) {
            warn!(
                "Root '{}' has children; its own steps and assertions are not run",
                tree.description
            );
        }

        let paths = tree.leaf_paths();
        info!(
            test_run_id = %command.test_run_id,
            "Starting run with {} lane(s)",
            paths.len()
        );
        self.events
            .send(RunEvent::new(&command.test_run_id, TestEvent::RunBegin));

        let mut lanes = JoinSet::new();
        for path in paths {
            let lane = Lane {
                test_run_id: command.test_run_id.clone(),
                manifest_url: command.manifest_url.clone(),
                path,
                config: self.config.clone(),
                events: self.events.clone(),
            };
            lanes.spawn(lane.run(cancel.clone()));
        }

        // Halting cancels the lanes rather than aborting them, so each one
        // still tears its process group down before the run ends.
        while let Some(joined) = lanes.join_next().await {
            if let Err(e) = joined {
                error!("Lane task failed: {}", e);
            }
        }

        if cancel.is_cancelled() {
            info!(test_run_id = %command.test_run_id, "Run halted");
        } else {
            info!(test_run_id = %command.test_run_id, "Run finished");
        }
        self.events
            .send(RunEvent::new(&command.test_run_id, TestEvent::RunEnd));
    }
}

/// What the scheduler sees of a worker's stdout
#[derive(Debug)]
enum Inbound {
    Message(WorkerMessage),
    Malformed(String),
    Closed,
}

impl Inbound {
    fn from_line(line: Result<String, tokio_util::codec::LinesCodecError>) -> Self {
        match line {
            Ok(line) => match serde_json::from_str(&line) {
                Ok(message) => Inbound::Message(message),
                Err(_) => Inbound::Malformed(line),
            },
            Err(e) => Inbound::Malformed(e.to_string()),
        }
    }
}

struct Lane {
    test_run_id: String,
    manifest_url: String,
    path: Vec<String>,
    config: Arc<LaneConfig>,
    events: Mailbox<RunEvent>,
}

impl Lane {
    async fn run(self, cancel: CancellationToken) {
        let mut end = LaneEnd::begin(&self.events, &self.test_run_id, &self.path);
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(path = ?self.path, "Lane failed: {}", e);
                return;
            }
        };
        let group = child
            .id()
            .map(|pid| ProcessGroup::new(pid, self.config.kill_grace));
        debug!(path = ?self.path, pid = ?child.id(), "Spawned lane worker");

        let outcome = tokio::select! {
            outcome = self.drive(&mut child) => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        match outcome {
            Some(Ok(status)) => {
                if !status.success() {
                    warn!(path = ?self.path, "Lane worker exited abnormally: {}", status);
                }
                end.exited(status);
            }
            Some(Err(e)) => warn!(path = ?self.path, "Lane failed: {}", e),
            None => info!(path = ?self.path, "Lane halted"),
        }

        // Leftovers of the worker are stopped before lane:end goes out.
        if let Some(group) = group {
            group.shutdown(&mut child).await;
        }
    }

    fn spawn(&self) -> LaneResult<Child> {
        let mut command = Command::new(&self.config.worker_binary);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(timeout) = self.config.step_timeout {
            command.env(STEP_TIMEOUT_ENV, timeout.as_millis().to_string());
        }
        #[cfg(unix)]
        command.process_group(0);

        command.spawn().map_err(|e| {
            LaneError::Spawn(format!(
                "{}: {}",
                self.config.worker_binary.display(),
                e
            ))
        })
    }

    async fn drive(&self, child: &mut Child) -> LaneResult<ExitStatus> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaneError::Protocol("worker stdout not captured".into()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaneError::Protocol("worker stdin not captured".into()))?;

        let inbox: Mailbox<Inbound> = Mailbox::new();
        let lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
            .map(Inbound::from_line)
            .chain(stream::once(async { Inbound::Closed }));
        let _watch = inbox.watch(lines);

        let first = inbox
            .receive(|m: &Inbound| {
                matches!(m, Inbound::Message(WorkerMessage::Ready { .. }) | Inbound::Closed)
            })
            .await;
        if let Inbound::Closed = first {
            warn!(path = ?self.path, "Lane worker exited before becoming ready");
            return Ok(child.wait().await?);
        }

        let run = LaneCommand::Run {
            manifest_url: self.manifest_url.clone(),
            path: self.path.clone(),
            test_run_id: self.test_run_id.clone(),
        };
        let mut line = serde_json::to_string(&run)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        drop(stdin);

        loop {
            match inbox.receive_any().await {
                Inbound::Message(WorkerMessage::Event(event)) => {
                    self.events.send(RunEvent::new(&self.test_run_id, event));
                }
                Inbound::Message(WorkerMessage::Ready { .. }) => {}
                Inbound::Malformed(line) => {
                    warn!(path = ?self.path, "Ignoring malformed worker output: {}", line);
                }
                Inbound::Closed => break,
            }
        }

        Ok(child.wait().await?)
    }
}

/// Publishes `lane:begin` on creation and `lane:end` when dropped.
struct LaneEnd {
    events: Mailbox<RunEvent>,
    test_run_id: String,
    path: Vec<String>,
    exit_code: Option<i32>,
    crashed: bool,
}

impl LaneEnd {
    fn begin(events: &Mailbox<RunEvent>, test_run_id: &str, path: &[String]) -> Self {
        events.send(RunEvent::new(
            test_run_id,
            TestEvent::LaneBegin {
                path: path.to_vec(),
            },
        ));
        Self {
            events: events.clone(),
            test_run_id: test_run_id.to_string(),
            path: path.to_vec(),
            exit_code: None,
            crashed: true,
        }
    }

    fn exited(&mut self, status: ExitStatus) {
        self.exit_code = status.code();
        self.crashed = !status.success();
    }
}

impl Drop for LaneEnd {
    fn drop(&mut self) {
        self.events.send(RunEvent::new(
            self.test_run_id.clone(),
            TestEvent::LaneEnd {
                path: std::mem::take(&mut self.path),
                exit_code: self.exit_code,
                crashed: self.crashed,
            },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_common::TestNode;

    fn command(tree: TestNode) -> RunCommand {
        RunCommand {
            test_run_id: "run-1".into(),
            manifest_url: "unused.yaml".into(),
            tree,
        }
    }

    fn drain(events: &Mailbox<RunEvent>) -> Vec<TestEvent> {
        let mut out = Vec::new();
        while let Some(e) = events.try_receive(convoy_common::mailbox::Any) {
            out.push(e.event);
        }
        out
    }

    #[tokio::test]
    async fn test_spawn_failure_still_ends_every_lane() {
        let events = Mailbox::new();
        let scheduler = LaneScheduler::new(
            LaneConfig {
                worker_binary: PathBuf::from("/nonexistent/convoy-lane"),
                ..Default::default()
            },
            events.clone(),
        );
        let tree = TestNode::new("root")
            .with_child(TestNode::new("a"))
            .with_child(TestNode::new("b").with_child(TestNode::new("c")));

        scheduler.run(&command(tree), CancellationToken::new()).await;

        let events = drain(&events);
        assert_eq!(events.first(), Some(&TestEvent::RunBegin));
        assert_eq!(events.last(), Some(&TestEvent::RunEnd));
        let begins = events.iter().filter(|e| e.kind() == "lane:begin").count();
        let ends: Vec<&TestEvent> = events.iter().filter(|e| e.kind() == "lane:end").collect();
        assert_eq!(begins, 2);
        assert_eq!(ends.len(), 2);
        assert!(ends.iter().all(|e| e.is_failure()));
    }

    #[test]
    fn test_inbound_parsing() {
        assert!(matches!(
            Inbound::from_line(Ok(r#"{"ready":true}"#.into())),
            Inbound::Message(WorkerMessage::Ready { ready: true })
        ));
        assert!(matches!(
            Inbound::from_line(Ok("panic at the disco".into())),
            Inbound::Malformed(_)
        ));
    }
}
