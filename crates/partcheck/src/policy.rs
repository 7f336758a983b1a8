//! Isolation policies and the preference store that holds them.
//!
//! The harness thinks in terms of two policies, [`Policy::Isolated`] and
//! [`Policy::NotIsolated`]. Browsers store the setting as an integer level
//! ([`IsolationLevel`]), so the store contract deals in raw `i64` values;
//! this lets the harness restore whatever value was present before the run,
//! including levels it does not itself exercise.

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Preference key controlling first-party isolation.
pub const DEFAULT_POLICY_KEY: &str = "privacy.thirdparty.isolate";

/// The isolation mode a policy iteration runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Sub-resources are cached once per first-party domain.
    Isolated,
    /// Sub-resources share one cache entry across first parties.
    NotIsolated,
}

impl Policy {
    /// Returns true for [`Policy::Isolated`].
    #[must_use]
    pub fn is_isolated(self) -> bool {
        matches!(self, Policy::Isolated)
    }

    /// The legacy level written to the policy store for this policy.
    #[must_use]
    pub fn level(self) -> IsolationLevel {
        match self {
            Policy::Isolated => IsolationLevel::Always,
            Policy::NotIsolated => IsolationLevel::Off,
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Isolated => f.write_str("isolated"),
            Policy::NotIsolated => f.write_str("not-isolated"),
        }
    }
}

/// Legacy integer encoding of the isolation preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum IsolationLevel {
    /// No isolation.
    Off = 0,
    /// Isolation only for private-browsing channels.
    PrivateOnly = 1,
    /// Isolation for every channel.
    Always = 2,
}

impl IsolationLevel {
    /// Raw value as stored in the policy store.
    #[must_use]
    pub fn value(self) -> i64 {
        self as i64
    }

    /// Whether a channel is isolated under this level.
    #[must_use]
    pub fn isolates(self, private_channel: bool) -> bool {
        match self {
            IsolationLevel::Off => false,
            IsolationLevel::PrivateOnly => private_channel,
            IsolationLevel::Always => true,
        }
    }
}

impl TryFrom<i64> for IsolationLevel {
    type Error = HarnessError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(IsolationLevel::Off),
            1 => Ok(IsolationLevel::PrivateOnly),
            2 => Ok(IsolationLevel::Always),
            other => Err(HarnessError::UnsupportedPolicy(other)),
        }
    }
}

/// Process-wide preference store.
///
/// Implementations are shared mutable state; the harness records the value
/// under its key before a run and writes it back unconditionally afterwards.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Reads the raw value stored under `key`.
    async fn get_policy(&self, key: &str) -> Result<i64>;

    /// Writes the raw value under `key`.
    async fn set_policy(&self, key: &str, value: i64) -> Result<()>;
}
