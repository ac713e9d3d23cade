//! Run summary built from the event stream

use serde::{Deserialize, Serialize};

use convoy_common::{ResultStatus, TestEvent};

/// Tally of one run's events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub lanes: usize,
    pub crashed_lanes: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    pub steps_timed_out: usize,
    pub assertions_passed: usize,
    pub assertions_failed: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Account for one event
    pub fn record(&mut self, event: &TestEvent) {
        match event {
            TestEvent::LaneEnd { crashed, .. } => {
                self.lanes += 1;
                if *crashed {
                    self.crashed_lanes += 1;
                }
            }
            TestEvent::StepResult { status, timeout, .. } => match status {
                ResultStatus::Ok => self.steps_passed += 1,
                ResultStatus::Failed => {
                    self.steps_failed += 1;
                    if *timeout {
                        self.steps_timed_out += 1;
                    }
                }
            },
            TestEvent::AssertionResult { status, .. } => match status {
                ResultStatus::Ok => self.assertions_passed += 1,
                ResultStatus::Failed => self.assertions_failed += 1,
            },
            _ => {}
        }
    }

    /// Nothing failed and no lane crashed
    pub fn success(&self) -> bool {
        self.crashed_lanes == 0 && self.steps_failed == 0 && self.assertions_failed == 0
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} lane(s), {} crashed; steps: {} passed, {} failed ({} timed out); assertions: {} passed, {} failed ({} ms)",
            self.lanes,
            self.crashed_lanes,
            self.steps_passed,
            self.steps_failed,
            self.steps_timed_out,
            self.assertions_passed,
            self.assertions_failed,
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_failures() {
        let mut summary = RunSummary::default();
        summary.record(&TestEvent::StepResult {
            path: vec![],
            description: "s".into(),
            status: ResultStatus::Failed,
            timeout: true,
            error: None,
        });
        summary.record(&TestEvent::LaneEnd {
            path: vec![],
            exit_code: Some(0),
            crashed: false,
        });
        assert_eq!(summary.lanes, 1);
        assert_eq!(summary.steps_timed_out, 1);
        assert!(!summary.success());
    }

    #[test]
    fn test_clean_run_succeeds() {
        let mut summary = RunSummary::default();
        summary.record(&TestEvent::AssertionResult {
            path: vec!["a".into()],
            description: "ok".into(),
            status: ResultStatus::Ok,
            timeout: false,
            error: None,
        });
        assert!(summary.success());
        assert_eq!(summary.assertions_passed, 1);
    }
}
