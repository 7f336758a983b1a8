//! Partition contexts: the flag combinations that select one slice of a
//! partitioned cache store.
//!
//! Contexts render to and parse from the cache-v2 context key format, where
//! each set flag contributes a comma-terminated token in a fixed order:
//! `a,` (anonymous), `b,` (in browser element), `i<appId>,` and `p,`
//! (private). The default context has the empty key.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one cache partition.
///
/// Two contexts are equal iff all flags match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PartitionContext {
    private: bool,
    anonymous: bool,
    in_browser_element: bool,
    app_id: Option<u32>,
}

impl PartitionContext {
    /// The default (non-private, non-anonymous) context.
    pub const DEFAULT: Self = Self::new(false, false, false, None);

    /// The private-browsing context.
    pub const PRIVATE: Self = Self::new(true, false, false, None);

    /// Private and anonymous; fetch-like loads are cached here.
    pub const ANONYMOUS_PRIVATE: Self = Self::new(true, true, false, None);

    /// Creates a context from its flags.
    #[must_use]
    pub const fn new(
        private: bool,
        anonymous: bool,
        in_browser_element: bool,
        app_id: Option<u32>,
    ) -> Self {
        Self {
            private,
            anonymous,
            in_browser_element,
            app_id,
        }
    }

    /// Returns true for private-browsing contexts.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Returns true for anonymous (credential-less) contexts.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Returns true for contexts owned by an in-browser element.
    #[must_use]
    pub fn is_in_browser_element(&self) -> bool {
        self.in_browser_element
    }

    /// Returns the app id, if any.
    #[must_use]
    pub fn app_id(&self) -> Option<u32> {
        self.app_id
    }

    /// Renders the context key, e.g. `a,p,` for [`Self::ANONYMOUS_PRIVATE`].
    #[must_use]
    pub fn key(&self) -> String {
        let mut key = String::new();
        if self.anonymous {
            key.push_str("a,");
        }
        if self.in_browser_element {
            key.push_str("b,");
        }
        if let Some(app_id) = self.app_id {
            key.push_str(&format!("i{app_id},"));
        }
        if self.private {
            key.push_str("p,");
        }
        key
    }
}

impl fmt::Display for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key();
        if key.is_empty() {
            f.write_str("<default>")
        } else {
            f.write_str(&key)
        }
    }
}

impl FromStr for PartitionContext {
    type Err = HarnessError;

    /// Parses a context key. Tokens must appear in canonical order, each at
    /// most once.
    fn from_str(key: &str) -> Result<Self> {
        let invalid = || HarnessError::InvalidContextKey(key.to_string());
        let mut context = Self::DEFAULT;
        let mut rest = key;

        if let Some(tail) = rest.strip_prefix("a,") {
            context.anonymous = true;
            rest = tail;
        }
        if let Some(tail) = rest.strip_prefix("b,") {
            context.in_browser_element = true;
            rest = tail;
        }
        if let Some(tail) = rest.strip_prefix('i') {
            let (digits, tail) = tail.split_once(',').ok_or_else(invalid)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            context.app_id = Some(digits.parse().map_err(|_| invalid())?);
            rest = tail;
        }
        if let Some(tail) = rest.strip_prefix("p,") {
            context.private = true;
            rest = tail;
        }

        if rest.is_empty() {
            Ok(context)
        } else {
            Err(invalid())
        }
    }
}
