//! The harness: one run over every configured policy.
//!
//! [`CacheHarness`] owns handles to its four collaborators and the run
//! configuration. [`CacheHarness::run`] records the current policy value,
//! runs each policy iteration strictly in sequence, then restores the policy
//! and clears the cache, whatever happened in between.
//!
//! An iteration walks the state machine in [`HarnessState`]. Failures are
//! recorded against the state they happened in and never cut the walk
//! short: tabs are closed and the channel audit removed in `TornDown` even
//! when reconciliation reported mismatches.

use crate::config::{ConfigError, HarnessConfig};
use crate::context::PartitionContext;
use crate::driver::{NavigationService, ScenarioDriver};
use crate::error::Result;
use crate::observer::{ChannelHookRegistry, FirstPartyAudit};
use crate::policy::{Policy, PolicyStore};
use crate::reconcile::{reconcile, ExpectationTable};
use crate::report::{Failure, HarnessState, IterationReport, RunReport};
use crate::scenario::ScenarioSet;
use crate::snapshot::{read_snapshots, CacheStore, SnapshotSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Handles to the process-wide state the harness drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Opens and closes navigation targets.
    pub navigator: Arc<dyn NavigationService>,
    /// The partitioned cache under test.
    pub cache: Arc<dyn CacheStore>,
    /// Channel creation hooks.
    pub hooks: Arc<dyn ChannelHookRegistry>,
    /// Preference store holding the isolation level.
    pub policies: Arc<dyn PolicyStore>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Scoped ownership of the policy value.
///
/// Records the value under `key` on [`begin`](Self::begin); [`restore`]
/// writes it back. `Drop` cannot await, so a session dropped without
/// `restore()` only logs a warning.
///
/// [`restore`]: Self::restore
pub struct PolicySession {
    store: Arc<dyn PolicyStore>,
    key: String,
    original: i64,
    restored: bool,
}

impl PolicySession {
    /// Reads and remembers the current value under `key`.
    ///
    /// # Errors
    ///
    /// Returns the store error; nothing has been changed at that point.
    pub async fn begin(store: Arc<dyn PolicyStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let original = store.get_policy(&key).await?;
        info!(%key, original, "policy session started");

        Ok(Self {
            store,
            key,
            original,
            restored: false,
        })
    }

    /// The value found when the session began.
    #[must_use]
    pub fn original(&self) -> i64 {
        self.original
    }

    /// Writes the legacy level for `policy`.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn apply(&self, policy: Policy) -> Result<()> {
        self.store.set_policy(&self.key, policy.level().value()).await
    }

    /// Writes the original value back.
    ///
    /// # Errors
    ///
    /// Returns the store error. The session counts as restored either way;
    /// there is nothing more it can do.
    pub async fn restore(mut self) -> Result<()> {
        self.restored = true;
        info!(key = %self.key, original = self.original, "restoring policy");
        self.store.set_policy(&self.key, self.original).await
    }
}

impl fmt::Debug for PolicySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicySession")
            .field("key", &self.key)
            .field("original", &self.original)
            .field("restored", &self.restored)
            .finish_non_exhaustive()
    }
}

impl Drop for PolicySession {
    fn drop(&mut self) {
        if !self.restored {
            warn!(
                key = %self.key,
                original = self.original,
                "PolicySession dropped without restore() - policy value left modified"
            );
        }
    }
}

/// Cache-partition verification harness.
pub struct CacheHarness {
    config: HarnessConfig,
    collaborators: Collaborators,
    scenarios: ScenarioSet,
    target_host: String,
    table: ExpectationTable,
    contexts: Vec<PartitionContext>,
}

/// The one sub-resource host every scenario embeds from.
fn target_host(scenarios: &ScenarioSet) -> std::result::Result<String, ConfigError> {
    let invalid = |hint: String| ConfigError::InvalidValue {
        field: "scenarios".to_string(),
        hint,
    };

    let mut hosts = scenarios.sub_resource_hosts().into_iter();
    match (hosts.next(), hosts.next()) {
        (Some(host), None) => Ok(host),
        (None, _) => Err(invalid("at least one scenario is required".to_string())),
        (Some(first), Some(second)) => Err(invalid(format!(
            "scenarios must share one sub-resource host, found '{first}' and '{second}'"
        ))),
    }
}

impl CacheHarness {
    /// Builds a harness from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a config error if `config` does not validate.
    pub fn new(config: HarnessConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let scenarios = config.scenarios();
        let target_host = target_host(&scenarios)?;
        let table = config.expectation_table();
        let contexts = config.partition_contexts()?;

        Ok(Self {
            config,
            collaborators,
            scenarios,
            target_host,
            table,
            contexts,
        })
    }

    /// Replaces the generated scenario matrix with an explicit list.
    ///
    /// The audit and reconciliation then target the scenarios' own
    /// sub-resource host.
    ///
    /// # Errors
    ///
    /// Returns a config error if `scenarios` is empty or embeds from more
    /// than one sub-resource host.
    pub fn with_scenarios(mut self, scenarios: ScenarioSet) -> Result<Self> {
        self.target_host = target_host(&scenarios)?;
        self.scenarios = scenarios;
        Ok(self)
    }

    /// Replaces the configured expectation table.
    #[must_use]
    pub fn with_expectations(mut self, table: ExpectationTable) -> Self {
        self.table = table;
        self
    }

    /// The scenarios each iteration navigates, in order.
    #[must_use]
    pub fn scenarios(&self) -> &ScenarioSet {
        &self.scenarios
    }

    /// The sub-resource host the audit and reconciliation look for.
    #[must_use]
    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    /// Runs every configured policy iteration.
    ///
    /// # Errors
    ///
    /// Only fails if the original policy value cannot be read. Everything
    /// after that is reported in the returned [`RunReport`].
    pub async fn run(&self) -> Result<RunReport> {
        let session = PolicySession::begin(
            self.collaborators.policies.clone(),
            self.config.policy_key.clone(),
        )
        .await?;
        let original_policy = session.original();

        let mut iterations = Vec::with_capacity(self.config.policies.len());
        for &policy in &self.config.policies {
            info!(%policy, scenarios = self.scenarios.len(), "starting policy iteration");
            let report = self.run_policy(&session, policy).await;
            info!(%policy, passed = report.passed(), "policy iteration finished");
            iterations.push(report);
        }

        let mut failures = Vec::new();
        if let Err(err) = session.restore().await {
            failures.push(Failure::new(HarnessState::Idle, &err));
        }
        if let Err(err) = self.collaborators.cache.clear().await {
            failures.push(Failure::new(HarnessState::Idle, &err));
        }

        Ok(RunReport {
            original_policy,
            iterations,
            failures,
        })
    }

    async fn run_policy(&self, session: &PolicySession, policy: Policy) -> IterationReport {
        let mut report = IterationReport::new(policy);

        // PolicySet
        let mut ready = true;
        if let Err(err) = self.collaborators.cache.clear().await {
            report.fail(HarnessState::PolicySet, &err);
            ready = false;
        }
        if let Err(err) = session.apply(policy).await {
            report.fail(HarnessState::PolicySet, &err);
            ready = false;
        }
        report.advance(HarnessState::PolicySet);

        if !ready {
            warn!(%policy, "policy iteration not started");
            report.advance(HarnessState::TornDown);
            report.advance(HarnessState::Idle);
            return report;
        }

        // ChannelsObserved
        let first_parties = self.scenarios.distinct_first_parties();
        let domain_count = first_parties.len();
        let audit = FirstPartyAudit::new(self.target_host.clone(), first_parties);
        let observation = if policy.is_isolated() {
            let observation = audit.start(self.collaborators.hooks.clone());
            report.advance(HarnessState::ChannelsObserved);
            Some(observation)
        } else {
            None
        };

        // ScenariosRunning
        report.advance(HarnessState::ScenariosRunning);
        let mut driver =
            ScenarioDriver::new(self.collaborators.navigator.as_ref(), self.config.load_timeout());
        for err in driver.run_all(&self.scenarios).await {
            report.fail(HarnessState::ScenariosRunning, &err);
        }
        report.tabs_opened = driver.handles().len();

        // SnapshotCollected
        let reads = read_snapshots(
            self.collaborators.cache.as_ref(),
            &self.contexts,
            self.config.snapshot_timeout(),
        )
        .await;
        let mut snapshot = SnapshotSet::new();
        let mut complete = true;
        for read in reads {
            match read.result {
                Ok(entries) => snapshot.extend(entries),
                Err(err) => {
                    complete = false;
                    report.fail(HarnessState::SnapshotCollected, &err);
                }
            }
        }
        report.entries_captured = snapshot.len();
        report.advance(HarnessState::SnapshotCollected);

        // Reconciled
        if complete {
            let outcomes = reconcile(
                &snapshot,
                &self.table,
                &self.target_host,
                domain_count,
                policy,
            );
            for err in outcomes.iter().filter_map(|o| o.to_error()) {
                report.fail(HarnessState::Reconciled, &err);
            }
            report.outcomes = outcomes;
            report.reconciled = true;
        } else {
            warn!(%policy, "snapshot incomplete, skipping reconciliation");
        }
        report.advance(HarnessState::Reconciled);

        // TornDown
        for err in driver.teardown().await {
            report.fail(HarnessState::TornDown, &err);
        }
        if let Some(observation) = observation {
            observation.stop();
            report.channels_audited = audit.matched();
            for err in audit.take_failures() {
                report.fail(HarnessState::ChannelsObserved, &err);
            }
        }
        report.advance(HarnessState::TornDown);
        report.advance(HarnessState::Idle);

        report
    }
}

impl fmt::Debug for CacheHarness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHarness")
            .field("config", &self.config)
            .field("scenarios", &self.scenarios.len())
            .field("target_host", &self.target_host)
            .field("contexts", &self.contexts)
            .finish_non_exhaustive()
    }
}
