//! Scenario driving: opening navigation targets and waiting for them to load.
//!
//! [`ScenarioDriver`] owns every handle it successfully opens, including the
//! ones whose load then timed out, and closes each exactly once in
//! [`ScenarioDriver::teardown`]. Scenarios run strictly in caller order.
//!
//! # Resource Safety
//!
//! Closing a tab is asynchronous, so `Drop` cannot do it. A driver dropped
//! with open tabs logs a warning naming them; call `teardown()` explicitly.

use crate::error::{HarnessError, Result};
use crate::scenario::{Scenario, ScenarioSet};
use crate::wait::bounded;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Opaque handle to an opened navigation target (a tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabHandle(u64);

impl TabHandle {
    /// Wraps a service-assigned id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The service-assigned id.
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TabHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab#{}", self.0)
    }
}

/// Browser navigation collaborator.
#[async_trait]
pub trait NavigationService: Send + Sync {
    /// Opens a new navigation target at `url`.
    async fn open(&self, url: &str) -> Result<TabHandle>;

    /// Resolves once `tab`'s document has finished loading.
    async fn wait_for_load(&self, tab: TabHandle, timeout: Duration) -> Result<()>;

    /// Closes `tab`.
    async fn close(&self, tab: TabHandle) -> Result<()>;
}

/// Opens scenarios one at a time and tracks the resulting tabs.
pub struct ScenarioDriver<'a> {
    navigator: &'a dyn NavigationService,
    load_timeout: Duration,
    tabs: Vec<TabHandle>,
}

impl<'a> ScenarioDriver<'a> {
    /// Creates a driver whose loads are bounded by `load_timeout`.
    pub fn new(navigator: &'a dyn NavigationService, load_timeout: Duration) -> Self {
        Self {
            navigator,
            load_timeout,
            tabs: Vec::new(),
        }
    }

    /// Opens `scenario` and waits for its load-completion signal.
    ///
    /// The handle is tracked for teardown as soon as the open succeeds, so
    /// a load timeout still leaves it to be closed.
    ///
    /// # Errors
    ///
    /// Returns the open failure, or `Timeout` if the load did not complete
    /// within the driver's load timeout.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> Result<TabHandle> {
        let url = scenario.url();
        debug!(%url, "opening scenario");

        let tab = self.navigator.open(&url).await?;
        self.tabs.push(tab);

        let operation = format!("load of {url}");
        bounded(
            self.navigator.wait_for_load(tab, self.load_timeout),
            self.load_timeout,
            &operation,
        )
        .await?;

        debug!(%url, %tab, "scenario loaded");
        Ok(tab)
    }

    /// Runs every scenario in order, continuing past failures.
    ///
    /// Returns the failures, one per scenario that did not load.
    pub async fn run_all(&mut self, scenarios: &ScenarioSet) -> Vec<HarnessError> {
        let mut failures = Vec::new();
        for scenario in scenarios {
            if let Err(err) = self.run_scenario(scenario).await {
                warn!(error = %err, "scenario failed");
                failures.push(err);
            }
        }
        failures
    }

    /// Handles opened so far, in open order.
    #[must_use]
    pub fn handles(&self) -> &[TabHandle] {
        &self.tabs
    }

    /// Closes every opened tab exactly once.
    ///
    /// A failed close does not stop the remaining ones; failures are
    /// returned.
    pub async fn teardown(mut self) -> Vec<HarnessError> {
        let tabs = std::mem::take(&mut self.tabs);
        let mut failures = Vec::new();

        for tab in tabs {
            if let Err(err) = self.navigator.close(tab).await {
                warn!(%tab, error = %err, "failed to close tab");
                failures.push(err);
            }
        }

        failures
    }
}

impl fmt::Debug for ScenarioDriver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioDriver")
            .field("load_timeout", &self.load_timeout)
            .field("tabs", &self.tabs)
            .finish_non_exhaustive()
    }
}

impl Drop for ScenarioDriver<'_> {
    fn drop(&mut self) {
        if !self.tabs.is_empty() {
            warn!(
                tabs = ?self.tabs,
                "ScenarioDriver dropped without teardown() - tabs left open"
            );
        }
    }
}
