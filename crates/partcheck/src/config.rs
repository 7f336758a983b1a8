//! Harness configuration.
//!
//! Values are layered with figment. Priority: environment variables
//! (`PARTCHECK_*`, `__` separating nested keys) > config file > defaults.
//! The defaults reproduce the stock first-party isolation test: two label
//! passes over `test1`/`test2`, parent pages on `example.com` and
//! `example.org`, sub-resources from `example.net`.

use crate::context::PartitionContext;
use crate::policy::{Policy, DEFAULT_POLICY_KEY};
use crate::reconcile::{
    Expectation, ExpectationTable, ExpectedCount, Tolerance, DEFAULT_RESOURCE_STEM,
    DEFAULT_SUFFIXES,
};
use crate::scenario::{ParentPage, ScenarioSet};
use crate::wait::{DEFAULT_LOAD_TIMEOUT, DEFAULT_SNAPSHOT_TIMEOUT};
use figment::{
    providers::{Env, Format as _, Json, Serialized, Toml},
    Figment,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Conventional config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "partcheck.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PARTCHECK_";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the expected types.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// An explicitly named config file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The config file extension is neither `.toml` nor `.json`.
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// A value parsed but is not usable.
    #[error("invalid config value for '{field}': {hint}")]
    InvalidValue {
        /// Offending field
        field: String,
        /// What is wrong with it
        hint: String,
    },
}

/// Everything a harness run needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Policy store key holding the isolation level.
    #[serde(default = "default_policy_key")]
    pub policy_key: String,

    /// Policies to iterate, in order.
    #[serde(default = "default_policies")]
    pub policies: Vec<Policy>,

    /// Host serving the embedded resources.
    #[serde(default = "default_sub_resource_host")]
    pub sub_resource_host: String,

    /// File stem every embedded resource locator carries.
    #[serde(default = "default_resource_stem")]
    pub resource_stem: String,

    /// Top-level host labels, prefixed to every parent domain.
    #[serde(default = "default_domain_labels")]
    pub domain_labels: Vec<String>,

    /// How many times the label list is navigated.
    #[serde(default = "default_repeat")]
    pub repeat: usize,

    /// Parent pages, one per first-party domain.
    #[serde(default = "default_parents")]
    pub parents: Vec<ParentPage>,

    /// Partition context keys to snapshot.
    #[serde(default = "default_contexts")]
    pub contexts: Vec<String>,

    /// Resource kinds to reconcile.
    #[serde(default = "default_suffixes")]
    pub suffixes: IndexMap<String, Expectation>,

    /// Timeout for each navigation load.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Timeout for each context's snapshot read.
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            policy_key: default_policy_key(),
            policies: default_policies(),
            sub_resource_host: default_sub_resource_host(),
            resource_stem: default_resource_stem(),
            domain_labels: default_domain_labels(),
            repeat: default_repeat(),
            parents: default_parents(),
            contexts: default_contexts(),
            suffixes: default_suffixes(),
            load_timeout_ms: default_load_timeout_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
        }
    }
}

impl HarnessConfig {
    /// Loads configuration from defaults, an optional file and the
    /// environment, then validates it.
    ///
    /// With no explicit path, `partcheck.toml` in the working directory is
    /// used if present. `.json` files are read as JSON, anything else as
    /// TOML.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when an explicit path does not exist, `Load` for
    /// unreadable or ill-typed sources and `InvalidValue` when validation
    /// fails.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        let config_file = config_path.map(Path::to_path_buf).or_else(|| {
            let default_path = Path::new(CONFIG_FILE_NAME);
            default_path.exists().then(|| default_path.to_path_buf())
        });

        if let Some(path) = config_file {
            let json = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => true,
                Some("toml") | None => false,
                Some(other) => return Err(ConfigError::UnsupportedFormat(other.to_string())),
            };
            // figment skips missing files silently
            if !path.exists() {
                return Err(ConfigError::NotFound(path));
            }
            figment = if json {
                figment.merge(Json::file(path))
            } else {
                figment.merge(Toml::file(path))
            };
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(&figment)
    }

    /// Extracts and validates a config from an assembled figment.
    ///
    /// # Errors
    ///
    /// See [`HarnessConfig::load`].
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, hint: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            hint: hint.to_string(),
        };

        if self.policy_key.is_empty() {
            return Err(invalid("policy_key", "must not be empty"));
        }
        if self.policies.is_empty() {
            return Err(invalid("policies", "at least one policy is required"));
        }
        if self.sub_resource_host.is_empty() {
            return Err(invalid("sub_resource_host", "must not be empty"));
        }
        if self.domain_labels.is_empty() || self.repeat == 0 {
            return Err(invalid("domain_labels", "no scenarios would run"));
        }
        if self.parents.is_empty() {
            return Err(invalid("parents", "at least one parent page is required"));
        }
        if self.suffixes.is_empty() {
            return Err(invalid("suffixes", "at least one resource kind is required"));
        }
        if self.load_timeout_ms == 0 {
            return Err(invalid("load_timeout_ms", "must be positive"));
        }
        if self.snapshot_timeout_ms == 0 {
            return Err(invalid("snapshot_timeout_ms", "must be positive"));
        }
        self.partition_contexts()?;

        Ok(())
    }

    /// The scenario matrix described by the labels, repeat count and parents.
    #[must_use]
    pub fn scenarios(&self) -> ScenarioSet {
        ScenarioSet::cross_product(
            &self.domain_labels,
            self.repeat,
            &self.parents,
            &self.sub_resource_host,
        )
    }

    /// The expectation table for the configured kinds.
    #[must_use]
    pub fn expectation_table(&self) -> ExpectationTable {
        self.suffixes.iter().fold(
            ExpectationTable::new(self.resource_stem.clone()),
            |table, (suffix, expectation)| table.with_kind(suffix.clone(), *expectation),
        )
    }

    /// Parses the configured context keys.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for the first malformed key.
    pub fn partition_contexts(&self) -> Result<Vec<PartitionContext>, ConfigError> {
        self.contexts
            .iter()
            .map(|key| {
                key.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "contexts".to_string(),
                    hint: format!("malformed context key '{key}'"),
                })
            })
            .collect()
    }

    /// Navigation load timeout.
    #[must_use]
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Per-context snapshot timeout.
    #[must_use]
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

fn default_policy_key() -> String {
    DEFAULT_POLICY_KEY.into()
}

fn default_policies() -> Vec<Policy> {
    vec![Policy::Isolated, Policy::NotIsolated]
}

fn default_sub_resource_host() -> String {
    "example.net".into()
}

fn default_resource_stem() -> String {
    DEFAULT_RESOURCE_STEM.into()
}

fn default_domain_labels() -> Vec<String> {
    vec!["test1".into(), "test2".into()]
}

fn default_repeat() -> usize {
    2
}

fn default_parents() -> Vec<ParentPage> {
    vec![
        ParentPage::new(
            "example.com",
            "/browser/netwerk/test/browser/firstPartyParent.html",
        ),
        ParentPage::new(
            "example.org",
            "/browser/netwerk/test/browser/firstPartyGrandParent.html",
        ),
    ]
}

fn default_contexts() -> Vec<String> {
    [
        PartitionContext::DEFAULT,
        PartitionContext::PRIVATE,
        PartitionContext::ANONYMOUS_PRIVATE,
    ]
    .iter()
    .map(PartitionContext::key)
    .collect()
}

fn default_suffixes() -> IndexMap<String, Expectation> {
    DEFAULT_SUFFIXES
        .iter()
        .map(|suffix| {
            (
                (*suffix).to_string(),
                Expectation {
                    count: ExpectedCount::PerFirstParty,
                    tolerance: Tolerance::for_suffix(suffix),
                },
            )
        })
        .collect()
}

fn default_load_timeout_ms() -> u64 {
    millis(DEFAULT_LOAD_TIMEOUT)
}

fn default_snapshot_timeout_ms() -> u64 {
    millis(DEFAULT_SNAPSHOT_TIMEOUT)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
