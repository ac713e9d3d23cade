//! Wire types
//!
//! Two protocols share these types:
//! - agent protocol (JSON text frames over a persistent duplex connection):
//!   server sends [`ServerFrame`], agent sends [`AgentFrame`];
//! - lane protocol (JSON lines over a worker's stdio): parent sends
//!   [`LaneCommand`] after the child announced readiness, child sends
//!   [`WorkerMessage`]s until it exits.

use serde::{Deserialize, Serialize};

use crate::tree::TestNode;

/// A request to execute a test tree. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommand {
    pub test_run_id: String,
    pub manifest_url: String,
    pub tree: TestNode,
}

/// Outcome of a step or assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Failed,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Ok => write!(f, "ok"),
            ResultStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress and result events. Ordered within a lane only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TestEvent {
    #[serde(rename = "run:begin")]
    RunBegin,

    #[serde(rename = "run:end")]
    RunEnd,

    #[serde(rename = "lane:begin")]
    LaneBegin { path: Vec<String> },

    #[serde(rename = "lane:end")]
    LaneEnd {
        path: Vec<String>,
        /// Worker exit code; absent when it was killed by a signal or never ran
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        crashed: bool,
    },

    #[serde(rename = "test:running")]
    TestRunning { path: Vec<String> },

    #[serde(rename = "step:running")]
    StepRunning { path: Vec<String>, description: String },

    #[serde(rename = "step:result")]
    StepResult {
        path: Vec<String>,
        description: String,
        status: ResultStatus,
        #[serde(default)]
        timeout: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "assertion:running")]
    AssertionRunning { path: Vec<String>, description: String },

    #[serde(rename = "assertion:result")]
    AssertionResult {
        path: Vec<String>,
        description: String,
        status: ResultStatus,
        #[serde(default)]
        timeout: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl TestEvent {
    /// Wire name of the event, e.g. `step:result`
    pub fn kind(&self) -> &'static str {
        match self {
            TestEvent::RunBegin => "run:begin",
            TestEvent::RunEnd => "run:end",
            TestEvent::LaneBegin { .. } => "lane:begin",
            TestEvent::LaneEnd { .. } => "lane:end",
            TestEvent::TestRunning { .. } => "test:running",
            TestEvent::StepRunning { .. } => "step:running",
            TestEvent::StepResult { .. } => "step:result",
            TestEvent::AssertionRunning { .. } => "assertion:running",
            TestEvent::AssertionResult { .. } => "assertion:result",
        }
    }

    pub fn path(&self) -> Option<&[String]> {
        match self {
            TestEvent::RunBegin | TestEvent::RunEnd => None,
            TestEvent::LaneBegin { path }
            | TestEvent::LaneEnd { path, .. }
            | TestEvent::TestRunning { path }
            | TestEvent::StepRunning { path, .. }
            | TestEvent::StepResult { path, .. }
            | TestEvent::AssertionRunning { path, .. }
            | TestEvent::AssertionResult { path, .. } => Some(path),
        }
    }

    /// A failed step, failed assertion, or crashed lane
    pub fn is_failure(&self) -> bool {
        match self {
            TestEvent::StepResult { status, .. } | TestEvent::AssertionResult { status, .. } => {
                *status == ResultStatus::Failed
            }
            TestEvent::LaneEnd { crashed, .. } => *crashed,
            _ => false,
        }
    }
}

/// A [`TestEvent`] tagged with the run it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub test_run_id: String,
    #[serde(flatten)]
    pub event: TestEvent,
}

impl RunEvent {
    pub fn new(test_run_id: impl Into<String>, event: TestEvent) -> Self {
        Self {
            test_run_id: test_run_id.into(),
            event,
        }
    }
}

/// Server to agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Run(RunCommand),
}

/// Agent to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AgentFrame {
    /// Handshake; must be the first frame on a connection
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    /// A relayed lane event
    Event { event: RunEvent },
}

/// Parent to lane worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LaneCommand {
    Run {
        manifest_url: String,
        path: Vec<String>,
        test_run_id: String,
    },
}

/// Lane worker to parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Ready { ready: bool },
    Event(TestEvent),
}

impl WorkerMessage {
    pub fn ready() -> Self {
        WorkerMessage::Ready { ready: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = TestEvent::StepResult {
            path: vec!["child".into()],
            description: "log in".into(),
            status: ResultStatus::Failed,
            timeout: true,
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "step:result",
                "path": ["child"],
                "description": "log in",
                "status": "failed",
                "timeout": true,
            })
        );
    }

    #[test]
    fn test_run_event_flattens_tag() {
        let tagged = RunEvent::new(
            "run-1",
            TestEvent::LaneEnd {
                path: vec!["a".into()],
                exit_code: Some(0),
                crashed: false,
            },
        );
        let value = serde_json::to_value(&tagged).unwrap();
        assert_eq!(
            value,
            json!({"testRunId": "run-1", "type": "lane:end", "path": ["a"], "exitCode": 0, "crashed": false})
        );
        let back: RunEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, tagged);
    }

    #[test]
    fn test_worker_message_ready_vs_event() {
        let ready: WorkerMessage = serde_json::from_str(r#"{"ready":true}"#).unwrap();
        assert_eq!(ready, WorkerMessage::ready());

        let event: WorkerMessage =
            serde_json::from_str(r#"{"type":"test:running","path":["x"]}"#).unwrap();
        assert_eq!(
            event,
            WorkerMessage::Event(TestEvent::TestRunning {
                path: vec!["x".into()]
            })
        );
    }

    #[test]
    fn test_lane_command_wire_format() {
        let command = LaneCommand::Run {
            manifest_url: "file:///tmp/m.yaml".into(),
            path: vec!["a".into(), "b".into()],
            test_run_id: "run-9".into(),
        };
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            json!({"type": "run", "manifestUrl": "file:///tmp/m.yaml", "path": ["a", "b"], "testRunId": "run-9"})
        );
    }

    #[test]
    fn test_agent_frames() {
        let connect: AgentFrame =
            serde_json::from_str(r#"{"type":"connect","agentId":"chrome-1"}"#).unwrap();
        assert_eq!(
            connect,
            AgentFrame::Connect {
                agent_id: Some("chrome-1".into())
            }
        );
        let anonymous: AgentFrame = serde_json::from_str(r#"{"type":"connect"}"#).unwrap();
        assert_eq!(anonymous, AgentFrame::Connect { agent_id: None });

        let run = ServerFrame::Run(RunCommand {
            test_run_id: "r".into(),
            manifest_url: "m".into(),
            tree: TestNode::new("root"),
        });
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["type"], "run");
        assert_eq!(value["testRunId"], "r");
        assert_eq!(value["manifestUrl"], "m");
        assert_eq!(value["tree"]["description"], "root");
    }
}
