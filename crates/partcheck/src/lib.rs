//! # partcheck
//!
//! A verification harness for first-party cache isolation.
//!
//! A browser that isolates by first party keys every cached sub-resource by
//! the site that embedded it. partcheck checks that this actually happens:
//! it loads one set of third-party resources from several first-party pages,
//! once with isolation on and once with it off, then reads the cache back
//! and checks that each resource kind was stored once per first party (or
//! once in total, when isolation is off).
//!
//! ## Architecture
//!
//! - **CacheHarness**: Runs the policy iterations and accumulates a report
//! - **ScenarioDriver**: Opens each first-party page and tracks its tab
//! - **FirstPartyAudit**: Checks channel first parties while isolation is on
//! - **read_snapshot**: Turns a push-style cache visit into a bounded read
//! - **reconcile**: Compares observed populations against expectations
//! - **HarnessConfig**: Layered configuration (defaults, file, environment)
//!
//! The browser itself is reached only through four collaborator traits:
//! [`NavigationService`], [`CacheStore`], [`ChannelHookRegistry`] and
//! [`PolicyStore`]. [`sim::SimulatedBrowser`] implements all four in memory;
//! [`chrome::ChromeNavigator`] navigates a real Chrome.
//!
//! ## Example Usage
//!
//! ```no_run
//! use partcheck::sim::SimulatedBrowser;
//! use partcheck::{CacheHarness, Collaborators, HarnessConfig, PanicAssertion};
//! use std::sync::Arc;
//!
//! # async fn run() -> partcheck::Result<()> {
//! let config = HarnessConfig::load(None)?;
//! let browser = Arc::new(SimulatedBrowser::from_config(&config));
//! let collaborators = Collaborators {
//!     navigator: browser.clone(),
//!     cache: browser.clone(),
//!     hooks: browser.clone(),
//!     policies: browser,
//! };
//!
//! let report = CacheHarness::new(config, collaborators)?.run().await?;
//! report.report_to(&PanicAssertion);
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! Whatever fails along the way, a run closes every tab it opened, removes
//! every channel hook it installed, writes the original policy value back and
//! leaves the cache empty. Failures end up in the [`RunReport`]; only failing
//! to read the original policy value aborts a run.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chrome;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod logger;
pub mod observer;
pub mod policy;
pub mod reconcile;
pub mod report;
pub mod scenario;
pub mod session;
pub mod sim;
pub mod snapshot;
pub mod wait;

// Re-export main types for convenience
pub use config::{ConfigError, HarnessConfig};
pub use context::PartitionContext;
pub use driver::{NavigationService, ScenarioDriver, TabHandle};
pub use error::{FailureKind, HarnessError, Result};
pub use observer::{
    observe, ChannelFilter, ChannelHookRegistry, ChannelObservation, FirstPartyAudit, HookToken,
    ObservedChannel, NO_FIRST_PARTY_HOST,
};
pub use policy::{IsolationLevel, Policy, PolicyStore, DEFAULT_POLICY_KEY};
pub use reconcile::{
    reconcile, Expectation, ExpectationTable, ExpectedCount, SuffixOutcome, Tolerance,
};
pub use report::{
    Assertion, Failure, HarnessState, IterationReport, PanicAssertion, RecordingAssertion,
    RunReport,
};
pub use scenario::{ParentPage, Scenario, ScenarioSet};
pub use session::{CacheHarness, Collaborators, PolicySession};
pub use snapshot::{
    read_snapshot, read_snapshots, CacheEntrySnapshot, CacheStore, CacheVisitor, SnapshotSet,
};
pub use wait::{WaitConfig, DEFAULT_LOAD_TIMEOUT, DEFAULT_SNAPSHOT_TIMEOUT};
