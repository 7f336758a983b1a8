//! Population reconciliation: comparing observed cache population against
//! what the isolation policy predicts, one resource kind at a time.
//!
//! # Tolerance
//!
//! Most kinds are [`Tolerance::Strict`]: the observed count must equal the
//! expected count. Streamed media (audio, video) is [`Tolerance::BestEffort`]
//! because a browser may legitimately skip caching it. For those kinds the
//! pass band only distinguishes shared from isolated population:
//!
//! | expected | pass iff        |
//! |----------|-----------------|
//! | 1        | `observed <= 1` |
//! | > 1      | `observed > 1`  |
//! | 0        | `observed == 0` |
//!
//! Note that `observed == 0` fails when `expected > 1`: an empty cache cannot
//! be told apart from a shared one.

use crate::error::HarnessError;
use crate::policy::Policy;
use crate::snapshot::CacheEntrySnapshot;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// File stem shared by every embedded resource of the stock test pages.
pub const DEFAULT_RESOURCE_STEM: &str = "thirdPartyChild.";

/// The resource kinds embedded by the stock parent pages.
pub const DEFAULT_SUFFIXES: [&str; 17] = [
    "iframe.html",
    "link.css",
    "script.js",
    "img.png",
    "object.png",
    "embed.png",
    "xhr.html",
    "worker.xhr.html",
    "audio.ogg",
    "video.ogv",
    "track.vtt",
    "favicon.ico",
    "fetch.html",
    "worker.fetch.html",
    "request.html",
    "worker.request.html",
    "import.js",
];

/// How strictly a kind's observed count is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    /// Observed must equal expected.
    #[default]
    Strict,
    /// Caching may not happen at all; only the cardinality class is checked.
    BestEffort,
}

impl Tolerance {
    /// The tolerance the legacy encoding assigns to `suffix`: best effort
    /// for audio and video, strict otherwise.
    #[must_use]
    pub fn for_suffix(suffix: &str) -> Self {
        if suffix.starts_with("audio") || suffix.starts_with("video") {
            Tolerance::BestEffort
        } else {
            Tolerance::Strict
        }
    }

    /// Whether `observed` is acceptable against `expected`.
    #[must_use]
    pub fn accepts(self, expected: usize, observed: usize) -> bool {
        match self {
            Tolerance::Strict => observed == expected,
            Tolerance::BestEffort => match expected {
                0 => observed == 0,
                1 => observed <= 1,
                _ => observed > 1,
            },
        }
    }
}

/// Expected-count function `f(policy, domain_count)`.
///
/// Two `Custom` counts compare equal regardless of the function they hold;
/// function pointer addresses are not stable across codegen units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedCount {
    /// One copy per first-party domain when isolated, one shared copy
    /// otherwise.
    #[default]
    PerFirstParty,
    /// A fixed count regardless of policy.
    Fixed(usize),
    /// Arbitrary function; not serializable.
    #[serde(skip)]
    Custom(fn(Policy, usize) -> usize),
}

impl PartialEq for ExpectedCount {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::PerFirstParty, Self::PerFirstParty) | (Self::Custom(_), Self::Custom(_)) => {
                true
            }
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ExpectedCount {}

impl ExpectedCount {
    /// Evaluates the function.
    #[must_use]
    pub fn evaluate(self, policy: Policy, domain_count: usize) -> usize {
        match self {
            ExpectedCount::PerFirstParty => {
                if policy.is_isolated() {
                    domain_count
                } else {
                    1
                }
            }
            ExpectedCount::Fixed(count) => count,
            ExpectedCount::Custom(f) => f(policy, domain_count),
        }
    }
}

/// Expectation for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Expectation {
    /// Expected-count function.
    #[serde(default)]
    pub count: ExpectedCount,
    /// Comparison tolerance.
    #[serde(default)]
    pub tolerance: Tolerance,
}

/// Resource kinds to reconcile, in report order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationTable {
    stem: String,
    kinds: IndexMap<String, Expectation>,
}

impl ExpectationTable {
    /// Creates an empty table whose locators are matched on `stem + suffix`.
    pub fn new(stem: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            kinds: IndexMap::new(),
        }
    }

    /// Adds or replaces a kind.
    #[must_use]
    pub fn with_kind(mut self, suffix: impl Into<String>, expectation: Expectation) -> Self {
        self.insert(suffix, expectation);
        self
    }

    /// Adds or replaces a kind.
    pub fn insert(&mut self, suffix: impl Into<String>, expectation: Expectation) {
        self.kinds.insert(suffix.into(), expectation);
    }

    /// The locator stem.
    #[must_use]
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Kinds in report order.
    pub fn kinds(&self) -> impl Iterator<Item = (&str, &Expectation)> {
        self.kinds.iter().map(|(suffix, e)| (suffix.as_str(), e))
    }

    /// Number of kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if the table has no kinds.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for ExpectationTable {
    /// The legacy table: every default suffix, one copy per first party,
    /// audio and video best effort.
    fn default() -> Self {
        DEFAULT_SUFFIXES
            .iter()
            .fold(Self::new(DEFAULT_RESOURCE_STEM), |table, suffix| {
                table.with_kind(
                    *suffix,
                    Expectation {
                        count: ExpectedCount::PerFirstParty,
                        tolerance: Tolerance::for_suffix(suffix),
                    },
                )
            })
    }
}

/// Pass/fail record for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuffixOutcome {
    /// Resource-kind suffix.
    pub suffix: String,
    /// Tolerance the comparison used.
    pub tolerance: Tolerance,
    /// Policy-derived expectation.
    pub expected: usize,
    /// Count found in the snapshots.
    pub observed: usize,
    /// Whether `observed` was accepted.
    pub pass: bool,
}

impl SuffixOutcome {
    /// The mismatch error for a failed outcome.
    #[must_use]
    pub fn to_error(&self) -> Option<HarnessError> {
        (!self.pass).then(|| HarnessError::PopulationMismatch {
            suffix: self.suffix.clone(),
            expected: self.expected,
            observed: self.observed,
        })
    }
}

impl fmt::Display for SuffixOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache entries expected for {}: {} (observed {})",
            self.suffix, self.expected, self.observed
        )
    }
}

/// Counts entries whose locator contains both `target_host` and `pattern`.
pub fn count_matching<'a>(
    snapshots: impl IntoIterator<Item = &'a CacheEntrySnapshot>,
    target_host: &str,
    pattern: &str,
) -> usize {
    snapshots
        .into_iter()
        .filter(|entry| entry.locator.contains(target_host) && entry.locator.contains(pattern))
        .count()
}

/// Reconciles `snapshots` against `table` for one policy iteration.
///
/// Every kind is checked; a failing kind does not stop the rest.
pub fn reconcile<'a, I>(
    snapshots: I,
    table: &ExpectationTable,
    target_host: &str,
    domain_count: usize,
    policy: Policy,
) -> Vec<SuffixOutcome>
where
    I: IntoIterator<Item = &'a CacheEntrySnapshot>,
    I::IntoIter: Clone,
{
    let snapshots = snapshots.into_iter();

    table
        .kinds()
        .map(|(suffix, expectation)| {
            let pattern = format!("{}{suffix}", table.stem());
            let observed = count_matching(snapshots.clone(), target_host, &pattern);
            let expected = expectation.count.evaluate(policy, domain_count);

            SuffixOutcome {
                suffix: suffix.to_string(),
                tolerance: expectation.tolerance,
                expected,
                observed,
                pass: expectation.tolerance.accepts(expected, observed),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PartitionContext;
    use proptest::prelude::*;

    fn entry(locator: &str, first_party: Option<&str>) -> CacheEntrySnapshot {
        CacheEntrySnapshot {
            context: PartitionContext::DEFAULT,
            locator: locator.to_string(),
            id_enhance: first_party.map(str::to_string),
        }
    }

    fn table(suffix: &str) -> ExpectationTable {
        ExpectationTable::new(DEFAULT_RESOURCE_STEM).with_kind(
            suffix,
            Expectation {
                count: ExpectedCount::PerFirstParty,
                tolerance: Tolerance::for_suffix(suffix),
            },
        )
    }

    fn copies(suffix: &str, n: usize) -> Vec<CacheEntrySnapshot> {
        (0..n)
            .map(|i| {
                entry(
                    &format!("http://example.net/browser/thirdPartyChild.{suffix}"),
                    Some(&format!("fp{i}.test")),
                )
            })
            .collect()
    }

    #[test]
    fn default_table_matches_legacy_kinds() {
        let table = ExpectationTable::default();
        assert_eq!(table.len(), 17);
        let best_effort: Vec<_> = table
            .kinds()
            .filter(|(_, e)| e.tolerance == Tolerance::BestEffort)
            .map(|(s, _)| s)
            .collect();
        assert_eq!(best_effort, ["audio.ogg", "video.ogv"]);
    }

    #[test]
    fn isolated_image_expects_one_copy_per_first_party() {
        let data = copies("img.png", 2);
        let outcomes = reconcile(&data, &table("img.png"), "example.net", 2, Policy::Isolated);

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].expected, 2);
        assert_eq!(outcomes[0].observed, 2);
        assert!(outcomes[0].pass);

        let outcomes = reconcile(&data, &table("img.png"), "example.net", 2, Policy::NotIsolated);
        assert_eq!(outcomes[0].expected, 1);
        assert!(!outcomes[0].pass);
    }

    #[test]
    fn isolated_video_needs_more_than_one_copy() {
        for (observed, pass) in [(2, true), (1, false), (0, false)] {
            let data = copies("video.ogv", observed);
            let outcome =
                &reconcile(&data, &table("video.ogv"), "example.net", 2, Policy::Isolated)[0];
            assert_eq!(outcome.expected, 2);
            assert_eq!(outcome.pass, pass, "observed {observed}");
        }
    }

    #[test]
    fn shared_audio_tolerates_missing_copy() {
        let data = copies("audio.ogg", 0);
        let outcome = &reconcile(&data, &table("audio.ogg"), "example.net", 2, Policy::NotIsolated)[0];
        assert!(outcome.pass);
    }

    #[test]
    fn stem_keeps_worker_variants_apart() {
        let mut data = copies("xhr.html", 1);
        data.extend(copies("worker.xhr.html", 1));

        let outcome = &reconcile(&data, &table("xhr.html"), "example.net", 2, Policy::NotIsolated)[0];
        assert_eq!(outcome.observed, 1);
    }

    #[test]
    fn other_hosts_are_not_counted() {
        let data = vec![entry("http://example.com/thirdPartyChild.img.png", None)];
        assert_eq!(count_matching(&data, "example.net", "thirdPartyChild.img.png"), 0);
    }

    #[test]
    fn failed_outcome_converts_to_mismatch() {
        let outcome = SuffixOutcome {
            suffix: "img.png".into(),
            tolerance: Tolerance::Strict,
            expected: 2,
            observed: 1,
            pass: false,
        };
        assert!(matches!(
            outcome.to_error(),
            Some(HarnessError::PopulationMismatch { expected: 2, observed: 1, .. })
        ));
        assert_eq!(
            outcome.to_string(),
            "Cache entries expected for img.png: 2 (observed 1)"
        );
    }

    #[test]
    fn custom_and_fixed_counts() {
        fn doubled(policy: Policy, n: usize) -> usize {
            if policy.is_isolated() { n * 2 } else { 0 }
        }
        assert_eq!(ExpectedCount::Custom(doubled).evaluate(Policy::Isolated, 3), 6);
        assert_eq!(ExpectedCount::Fixed(4).evaluate(Policy::NotIsolated, 3), 4);
    }

    #[test]
    fn custom_counts_compare_by_variant() {
        fn one(_: Policy, _: usize) -> usize {
            1
        }
        fn many(_: Policy, n: usize) -> usize {
            n
        }
        assert_eq!(ExpectedCount::Custom(one), ExpectedCount::Custom(many));
        assert_ne!(ExpectedCount::Custom(one), ExpectedCount::Fixed(1));
        assert_ne!(ExpectedCount::Fixed(1), ExpectedCount::Fixed(2));
        assert_eq!(ExpectedCount::Fixed(2), ExpectedCount::Fixed(2));
        assert_ne!(ExpectedCount::PerFirstParty, ExpectedCount::Fixed(1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Strict kinds pass only on exact equality.
        #[test]
        fn prop_strict_is_exact(expected in 0usize..8, observed in 0usize..8) {
            prop_assert_eq!(Tolerance::Strict.accepts(expected, observed), expected == observed);
        }

        /// Best-effort kinds under a shared policy accept at most one copy.
        #[test]
        fn prop_best_effort_shared(observed in 0usize..8) {
            prop_assert_eq!(Tolerance::BestEffort.accepts(1, observed), observed <= 1);
        }

        /// Best-effort kinds under isolation accept any count above one.
        #[test]
        fn prop_best_effort_isolated(expected in 2usize..8, observed in 0usize..8) {
            prop_assert_eq!(Tolerance::BestEffort.accepts(expected, observed), observed > 1);
        }

        /// Not isolated always expects one shared copy.
        #[test]
        fn prop_not_isolated_expects_one(domains in 1usize..16) {
            prop_assert_eq!(ExpectedCount::PerFirstParty.evaluate(Policy::NotIsolated, domains), 1);
            prop_assert_eq!(ExpectedCount::PerFirstParty.evaluate(Policy::Isolated, domains), domains);
        }
    }
}
