//! Run reports and the assertion sink they are reported through.
//!
//! The harness never aborts on a test failure. Everything that went wrong is
//! collected into a [`RunReport`], which is handed to whatever assertion
//! mechanism the host test framework provides via [`Assertion`].

use crate::error::{FailureKind, HarnessError};
use crate::policy::Policy;
use crate::reconcile::SuffixOutcome;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Harness state machine, per policy iteration.
///
/// `Idle -> PolicySet -> ChannelsObserved (isolated only) -> ScenariosRunning
/// -> SnapshotCollected -> Reconciled -> TornDown -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessState {
    /// No iteration in progress.
    Idle,
    /// Cache cleared and policy written.
    PolicySet,
    /// First-party audit installed.
    ChannelsObserved,
    /// Navigations in progress.
    ScenariosRunning,
    /// Cache contents captured.
    SnapshotCollected,
    /// Population compared against expectations.
    Reconciled,
    /// Tabs closed and audit removed.
    TornDown,
}

/// One accumulated failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// State the harness was in when the failure was recorded.
    pub stage: HarnessState,
    /// Classification.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
}

impl Failure {
    /// Records `error` as having happened in `stage`.
    #[must_use]
    pub fn new(stage: HarnessState, error: &HarnessError) -> Self {
        Self {
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Everything that happened during one policy iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationReport {
    /// The policy under test.
    pub policy: Policy,
    /// States visited, in order.
    pub states: Vec<HarnessState>,
    /// Per-kind outcomes; empty when reconciliation was skipped.
    pub outcomes: Vec<SuffixOutcome>,
    /// Failures in the order they were recorded.
    pub failures: Vec<Failure>,
    /// Whether the population was reconciled.
    pub reconciled: bool,
    /// Tabs opened (and closed) during the iteration.
    pub tabs_opened: usize,
    /// Distinct cache entries captured.
    pub entries_captured: usize,
    /// Channels touching the sub-resource host seen by the audit.
    pub channels_audited: usize,
}

impl IterationReport {
    pub(crate) fn new(policy: Policy) -> Self {
        Self {
            policy,
            states: vec![HarnessState::Idle],
            outcomes: Vec::new(),
            failures: Vec::new(),
            reconciled: false,
            tabs_opened: 0,
            entries_captured: 0,
            channels_audited: 0,
        }
    }

    pub(crate) fn advance(&mut self, state: HarnessState) {
        tracing::debug!(policy = %self.policy, ?state, "harness state");
        self.states.push(state);
    }

    pub(crate) fn fail(&mut self, stage: HarnessState, error: &HarnessError) {
        tracing::warn!(policy = %self.policy, ?stage, error = %error, "harness failure");
        self.failures.push(Failure::new(stage, error));
    }

    /// Returns true if nothing failed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// The outcome for `suffix`, if it was reconciled.
    #[must_use]
    pub fn outcome(&self, suffix: &str) -> Option<&SuffixOutcome> {
        self.outcomes.iter().find(|o| o.suffix == suffix)
    }
}

/// The result of a whole harness run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Policy value found before the run (and restored after it).
    pub original_policy: i64,
    /// One report per policy iteration, in run order.
    pub iterations: Vec<IterationReport>,
    /// Failures outside any iteration (restoration, final cleanup).
    pub failures: Vec<Failure>,
}

impl RunReport {
    /// Returns true if no iteration and no cleanup step failed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.iterations.iter().all(IterationReport::passed)
    }

    /// The iteration for `policy`, if it ran.
    #[must_use]
    pub fn iteration(&self, policy: Policy) -> Option<&IterationReport> {
        self.iterations.iter().find(|i| i.policy == policy)
    }

    /// Every failure, iteration failures first.
    pub fn all_failures(&self) -> impl Iterator<Item = &Failure> {
        self.iterations
            .iter()
            .flat_map(|i| i.failures.iter())
            .chain(self.failures.iter())
    }

    /// Emits one check per reconciled kind and one per other failure.
    ///
    /// Population mismatches are already covered by the per-kind checks and
    /// are not repeated.
    pub fn report_to(&self, assertion: &dyn Assertion) {
        for iteration in &self.iterations {
            for outcome in &iteration.outcomes {
                assertion.check(outcome.pass, &format!("[{}] {outcome}", iteration.policy));
            }
            for failure in &iteration.failures {
                if failure.kind != FailureKind::PopulationMismatch {
                    assertion.check(false, &format!("[{}] {}", iteration.policy, failure.message));
                }
            }
        }
        for failure in &self.failures {
            assertion.check(false, &failure.message);
        }
    }

    /// Serializes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; the report's own types always serialize.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// The host test framework's assertion mechanism.
pub trait Assertion {
    /// Reports `message` as passed when `condition` holds, failed otherwise.
    fn check(&self, condition: bool, message: &str);
}

/// Panics on the first failed check, like `assert!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicAssertion;

impl Assertion for PanicAssertion {
    fn check(&self, condition: bool, message: &str) {
        assert!(condition, "{message}");
    }
}

/// Collects checks for later inspection.
#[derive(Debug, Default)]
pub struct RecordingAssertion {
    checks: Mutex<Vec<(bool, String)>>,
}

impl RecordingAssertion {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All checks in order.
    #[must_use]
    pub fn checks(&self) -> Vec<(bool, String)> {
        self.checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages of failed checks.
    #[must_use]
    pub fn failures(&self) -> Vec<String> {
        self.checks()
            .into_iter()
            .filter(|(ok, _)| !ok)
            .map(|(_, message)| message)
            .collect()
    }
}

impl Assertion for RecordingAssertion {
    fn check(&self, condition: bool, message: &str) {
        self.checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((condition, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Tolerance;
    use std::time::Duration;

    fn report() -> RunReport {
        let mut isolated = IterationReport::new(Policy::Isolated);
        isolated.outcomes.push(SuffixOutcome {
            suffix: "img.png".into(),
            tolerance: Tolerance::Strict,
            expected: 2,
            observed: 1,
            pass: false,
        });
        isolated.fail(
            HarnessState::Reconciled,
            &HarnessError::PopulationMismatch {
                suffix: "img.png".into(),
                expected: 2,
                observed: 1,
            },
        );
        isolated.fail(
            HarnessState::ScenariosRunning,
            &HarnessError::timeout("load of http://test2.example.org/", Duration::from_secs(10)),
        );

        let mut shared = IterationReport::new(Policy::NotIsolated);
        shared.outcomes.push(SuffixOutcome {
            suffix: "img.png".into(),
            tolerance: Tolerance::Strict,
            expected: 1,
            observed: 1,
            pass: true,
        });

        RunReport {
            original_policy: 0,
            iterations: vec![isolated, shared],
            failures: Vec::new(),
        }
    }

    #[test]
    fn report_aggregates_failures() {
        let report = report();
        assert!(!report.passed());
        assert!(!report.iteration(Policy::Isolated).unwrap().passed());
        assert!(report.iteration(Policy::NotIsolated).unwrap().passed());
        assert_eq!(report.all_failures().count(), 2);
    }

    #[test]
    fn report_to_does_not_double_count_mismatches() {
        let recorder = RecordingAssertion::new();
        report().report_to(&recorder);

        assert_eq!(recorder.checks().len(), 3);
        assert_eq!(
            recorder.failures(),
            vec![
                "[isolated] Cache entries expected for img.png: 2 (observed 1)".to_string(),
                "[isolated] load of http://test2.example.org/ timed out after 10s".to_string(),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "img.png")]
    fn panic_assertion_panics_on_failure() {
        report().report_to(&PanicAssertion);
    }

    #[test]
    fn report_serializes_to_json() {
        let json = report().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["iterations"][0]["policy"], "isolated");
        assert_eq!(value["iterations"][0]["failures"][1]["kind"], "timeout");
    }
}
