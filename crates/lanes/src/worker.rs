//! Lane worker: executes one leaf path of a test tree
//!
//! The worker walks its path one node at a time. At each node it runs the
//! steps in order, then the assertions concurrently, then descends into the
//! child named by the next path segment. A failed or timed-out step ends the
//! walk: the node's assertions and everything below it never run.

use futures::future::join_all;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use convoy_common::tree::merge_context;
use convoy_common::{
    timebox, Assertion, Context, ResultStatus, Step, TestEvent, TestNode, TimeboxError,
    DEFAULT_DEADLINE,
};

use crate::actions;

/// Environment variable overriding the step and assertion deadline
pub const STEP_TIMEOUT_ENV: &str = "CONVOY_STEP_TIMEOUT_MS";

/// Where a worker reports its events
pub type EventSink = mpsc::UnboundedSender<TestEvent>;

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deadline for each step
    pub step_timeout: Duration,

    /// Deadline for each assertion
    pub assertion_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_DEADLINE,
            assertion_timeout: DEFAULT_DEADLINE,
        }
    }
}

impl WorkerConfig {
    /// Defaults, with both deadlines overridden by `CONVOY_STEP_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(STEP_TIMEOUT_ENV) {
            match raw.parse::<u64>() {
                Ok(ms) => {
                    config.step_timeout = Duration::from_millis(ms);
                    config.assertion_timeout = Duration::from_millis(ms);
                }
                Err(e) => warn!("ignoring {}={:?}: {}", STEP_TIMEOUT_ENV, raw, e),
            }
        }
        config
    }
}

/// Executes a single lane and streams its events
pub struct LaneWorker {
    config: WorkerConfig,
    events: EventSink,
}

impl LaneWorker {
    pub fn new(config: WorkerConfig, events: EventSink) -> Self {
        Self { config, events }
    }

    /// Walk `path` from `root`, running every node along it.
    ///
    /// The root is a suite container: path segments start at its children,
    /// and the root itself only runs when the path is empty. A segment that
    /// names no child silently ends the walk.
    pub async fn run(&self, root: &TestNode, path: &[String]) {
        let mut context = Context::new();
        let mut node = root;
        let mut depth = 0;

        if let Some(first) = path.first() {
            match root.child(first) {
                Some(child) => {
                    node = child;
                    depth = 1;
                }
                None => {
                    debug!("no child '{}' under root, nothing to run", first);
                    return;
                }
            }
        }

        loop {
            let here = &path[..depth];
            self.emit(TestEvent::TestRunning { path: here.to_vec() });

            if !self.run_steps(&node.steps, here, &mut context).await {
                return;
            }
            self.run_assertions(&node.assertions, here, &context).await;

            let Some(segment) = path.get(depth) else {
                return;
            };
            match node.child(segment) {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None => {
                    debug!("no child '{}' under {:?}, ending lane", segment, here);
                    return;
                }
            }
        }
    }

    /// Run steps in order. Returns false at the first failure.
    async fn run_steps(&self, steps: &[Step], path: &[String], context: &mut Context) -> bool {
        for step in steps {
            self.emit(TestEvent::StepRunning {
                path: path.to_vec(),
                description: step.description.clone(),
            });

            let outcome = timebox(
                self.config.step_timeout,
                actions::run_step(step.action.clone(), context.clone()),
            )
            .await;

            let (status, timeout, error) = match outcome {
                Ok(partial) => {
                    if let Some(partial) = partial {
                        merge_context(context, partial);
                    }
                    (ResultStatus::Ok, false, None)
                }
                Err(TimeboxError::Timeout(limit)) => (
                    ResultStatus::Failed,
                    true,
                    Some(format!("step timed out after {}ms", limit.as_millis())),
                ),
                Err(e) => (ResultStatus::Failed, false, Some(e.to_string())),
            };

            self.emit(TestEvent::StepResult {
                path: path.to_vec(),
                description: step.description.clone(),
                status,
                timeout,
                error,
            });

            if status == ResultStatus::Failed {
                return false;
            }
        }
        true
    }

    /// Run all assertions concurrently; failures do not affect siblings.
    async fn run_assertions(&self, assertions: &[Assertion], path: &[String], context: &Context) {
        let checks = assertions.iter().map(|assertion| async move {
            self.emit(TestEvent::AssertionRunning {
                path: path.to_vec(),
                description: assertion.description.clone(),
            });

            let outcome = timebox(
                self.config.assertion_timeout,
                actions::run_check(assertion.check.clone(), context.clone()),
            )
            .await;

            let (status, timeout, error) = match outcome {
                Ok(()) => (ResultStatus::Ok, false, None),
                Err(e) => (ResultStatus::Failed, e.is_timeout(), Some(e.to_string())),
            };

            self.emit(TestEvent::AssertionResult {
                path: path.to_vec(),
                description: assertion.description.clone(),
                status,
                timeout,
                error,
            });
        });
        join_all(checks).await;
    }

    fn emit(&self, event: TestEvent) {
        // The receiving end only goes away when the process is shutting down.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_common::{Check, StepAction};
    use serde_json::json;

    fn collect(mut rx: mpsc::UnboundedReceiver<TestEvent>) -> Vec<TestEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn run_lane(root: &TestNode, path: &[&str]) -> Vec<TestEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        LaneWorker::new(WorkerConfig::default(), tx)
            .run(root, &path)
            .await;
        collect(rx)
    }

    fn kinds(events: &[TestEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind()).collect()
    }

    fn fail(message: &str) -> StepAction {
        StepAction::Fail { message: message.into() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_step_skips_assertions_and_children() {
        let root = TestNode::new("root").with_child(
            TestNode::new("child")
                .with_step("explode", fail("boom"))
                .with_assertion("never", Check::Sleep { ms: 0 })
                .with_child(TestNode::new("grandchild")),
        );

        let events = run_lane(&root, &["child", "grandchild"]).await;
        assert_eq!(kinds(&events), vec!["test:running", "step:running", "step:result"]);
        assert_eq!(
            events[2],
            TestEvent::StepResult {
                path: vec!["child".into()],
                description: "explode".into(),
                status: ResultStatus::Failed,
                timeout: false,
                error: Some("boom".into()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_is_flagged() {
        let root = TestNode::new("slow")
            .with_step("hang", StepAction::Sleep { ms: 10_000 })
            .with_step("after", StepAction::Sleep { ms: 0 });

        let events = run_lane(&root, &[]).await;
        assert_eq!(kinds(&events), vec!["test:running", "step:running", "step:result"]);
        match &events[2] {
            TestEvent::StepResult { status, timeout, .. } => {
                assert_eq!(*status, ResultStatus::Failed);
                assert!(*timeout);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_assertions_are_independent() {
        let root = TestNode::new("root")
            .with_step("seed", StepAction::Set {
                values: [("n".to_string(), json!(1))].into_iter().collect(),
            })
            .with_assertion("bad", Check::Equals { key: "n".into(), value: json!(2) })
            .with_assertion("good", Check::Equals { key: "n".into(), value: json!(1) })
            .with_assertion("slow", Check::Sleep { ms: 5_000 });

        let events = run_lane(&root, &[]).await;
        let results: Vec<(String, ResultStatus, bool)> = events
            .iter()
            .filter_map(|e| match e {
                TestEvent::AssertionResult { description, status, timeout, .. } => {
                    Some((description.clone(), *status, *timeout))
                }
                _ => None,
            })
            .collect();

        assert_eq!(results.len(), 3);
        assert!(results.contains(&("bad".into(), ResultStatus::Failed, false)));
        assert!(results.contains(&("good".into(), ResultStatus::Ok, false)));
        assert!(results.contains(&("slow".into(), ResultStatus::Failed, true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_assertion_reports_running_before_result() {
        let root = TestNode::new("root")
            .with_assertion("a", Check::Sleep { ms: 30 })
            .with_assertion("b", Check::Sleep { ms: 10 });

        let events = run_lane(&root, &[]).await;
        for name in ["a", "b"] {
            let running = events.iter().position(|e| {
                matches!(e, TestEvent::AssertionRunning { description, .. } if description == name)
            });
            let result = events.iter().position(|e| {
                matches!(e, TestEvent::AssertionResult { description, .. } if description == name)
            });
            assert!(running.unwrap() < result.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_flows_down_the_path() {
        let root = TestNode::new("root").with_child(
            TestNode::new("parent")
                .with_step("login", StepAction::Set {
                    values: [("user".to_string(), json!("alice"))].into_iter().collect(),
                })
                .with_child(
                    TestNode::new("child")
                        .with_assertion("user kept", Check::Equals {
                            key: "user".into(),
                            value: json!("alice"),
                        }),
                ),
        );

        let events = run_lane(&root, &["parent", "child"]).await;
        assert!(events.contains(&TestEvent::AssertionResult {
            path: vec!["parent".into(), "child".into()],
            description: "user kept".into(),
            status: ResultStatus::Ok,
            timeout: false,
            error: None,
        }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, TestEvent::TestRunning { .. }))
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_segment_ends_quietly() {
        let root = TestNode::new("root").with_child(TestNode::new("real"));
        assert!(run_lane(&root, &["imaginary"]).await.is_empty());

        let events = run_lane(&root, &["real", "deeper"]).await;
        assert_eq!(kinds(&events), vec!["test:running"]);
    }
}
