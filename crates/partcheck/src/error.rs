//! Error types for cache-partition harness operations.
//!
//! This module distinguishes the three failure modes a run reports as test
//! failures (timeouts, first-party misattribution, population mismatches)
//! from the collaborator failures that surround them (navigation, cache store,
//! configuration). Each variant carries enough context to be reported on its
//! own, since most of them end up accumulated in a run report rather than
//! propagated with `?`.

use crate::config::ConfigError;
use crate::driver::TabHandle;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// The main error type for all harness operations.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// An awaited navigation or snapshot read did not complete in time.
    ///
    /// Always surfaced; the harness never retries on its own.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Description of what was being awaited
        operation: String,
        /// How long we waited before giving up
        timeout: Duration,
    },

    /// A channel touching the sub-resource host reported a first party
    /// outside the active scenario set.
    #[error("first party for {uri} is {host}")]
    UnexpectedFirstParty {
        /// Original URI of the offending channel
        uri: String,
        /// First-party host the channel reported
        host: String,
    },

    /// Observed cache population for a resource kind fell outside the
    /// tolerance band of its expectation.
    #[error("cache entries expected for {suffix}: {expected}, observed {observed}")]
    PopulationMismatch {
        /// Resource-kind suffix (e.g. `img.png`)
        suffix: String,
        /// Policy-derived expected count
        expected: usize,
        /// Count found in the snapshot
        observed: usize,
    },

    /// Opening a navigation target failed.
    #[error("navigation to '{url}' failed: {reason}")]
    NavigationFailed {
        /// The URL that failed to open
        url: String,
        /// Reason reported by the navigation service
        reason: String,
    },

    /// A cache visit ended without signalling completion.
    #[error("cache visit for context '{context}' ended without completion")]
    VisitIncomplete {
        /// Key of the partition context being visited
        context: String,
    },

    /// The cache store or policy store rejected an operation.
    #[error("store error: {0}")]
    Store(String),

    /// A tab handle was not known to the navigation service.
    #[error("unknown tab handle {0}")]
    UnknownHandle(TabHandle),

    /// A partition context key could not be parsed.
    #[error("invalid partition context key '{0}'")]
    InvalidContextKey(String),

    /// A legacy isolation level outside the known range.
    #[error("unsupported isolation level {0}")]
    UnsupportedPolicy(i64),

    /// Configuration loading or validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Wraps errors from the chromiumoxide library.
    #[error("chromiumoxide error: {0}")]
    ChromiumOxide(#[from] chromiumoxide::error::CdpError),
}

impl HarnessError {
    /// Creates a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Returns the coarse classification used in run reports.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::UnexpectedFirstParty { .. } => FailureKind::UnexpectedFirstParty,
            Self::PopulationMismatch { .. } => FailureKind::PopulationMismatch,
            Self::NavigationFailed { .. } | Self::UnknownHandle(_) | Self::ChromiumOxide(_) => {
                FailureKind::Navigation
            }
            Self::VisitIncomplete { .. } | Self::Store(_) => FailureKind::Store,
            Self::InvalidContextKey(_) | Self::UnsupportedPolicy(_) | Self::Config(_) => {
                FailureKind::Config
            }
        }
    }
}

/// Classification of an accumulated failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// See [`HarnessError::Timeout`]
    Timeout,
    /// See [`HarnessError::UnexpectedFirstParty`]
    UnexpectedFirstParty,
    /// See [`HarnessError::PopulationMismatch`]
    PopulationMismatch,
    /// Navigation service failures
    Navigation,
    /// Cache or policy store failures
    Store,
    /// Configuration failures
    Config,
}

/// A specialized Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_operation() {
        let err = HarnessError::timeout("load of http://test1.example.com/", Duration::from_secs(10));
        assert_eq!(
            err.to_string(),
            "load of http://test1.example.com/ timed out after 10s"
        );
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[test]
    fn first_party_message_lists_uri_and_host() {
        let err = HarnessError::UnexpectedFirstParty {
            uri: "http://example.net/thirdPartyChild.img.png".into(),
            host: "example.net".into(),
        };
        assert_eq!(
            err.to_string(),
            "first party for http://example.net/thirdPartyChild.img.png is example.net"
        );
    }

    #[test]
    fn store_errors_classify_as_store() {
        let err = HarnessError::VisitIncomplete {
            context: "p,".into(),
        };
        assert_eq!(err.kind(), FailureKind::Store);
    }
}
