//! Navigation scenarios.
//!
//! A scenario is one top-level navigation to a parent page that embeds
//! resources from a shared sub-resource host. Scenarios are plain data,
//! enumerated before the run; their order is preserved end to end because
//! repeated first parties are there on purpose.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// One navigation to perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scenario {
    /// Host of the top-level document, e.g. `test1.example.com`.
    pub top_level_domain: String,
    /// Host serving the embedded resources, e.g. `example.net`.
    pub sub_resource_host: String,
    /// Path of the parent page on the top-level host.
    pub parent_page_path: String,
}

impl Scenario {
    /// Creates a scenario.
    pub fn new(
        top_level_domain: impl Into<String>,
        sub_resource_host: impl Into<String>,
        parent_page_path: impl Into<String>,
    ) -> Self {
        Self {
            top_level_domain: top_level_domain.into(),
            sub_resource_host: sub_resource_host.into(),
            parent_page_path: parent_page_path.into(),
        }
    }

    /// The URL to open.
    #[must_use]
    pub fn url(&self) -> String {
        let path = self.parent_page_path.trim_start_matches('/');
        format!("http://{}/{path}", self.top_level_domain)
    }

    /// The first-party domain this navigation is attributed to.
    #[must_use]
    pub fn first_party(&self) -> &str {
        base_domain(&self.top_level_domain)
    }
}

/// Returns the registrable part of `host`: its last two labels.
///
/// Hosts with fewer than three labels are returned unchanged.
#[must_use]
pub fn base_domain(host: &str) -> &str {
    let host = host.trim_end_matches('.');
    match host.rmatch_indices('.').nth(1) {
        Some((index, _)) => &host[index + 1..],
        None => host,
    }
}

/// A parent page on a first-party domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentPage {
    /// First-party domain, e.g. `example.com`.
    pub domain: String,
    /// Path of the page on that domain.
    pub path: String,
}

impl ParentPage {
    /// Creates a parent page description.
    pub fn new(domain: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            path: path.into(),
        }
    }
}

/// An ordered list of scenarios.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSet {
    scenarios: Vec<Scenario>,
}

impl ScenarioSet {
    /// Wraps an explicit scenario list, keeping its order.
    #[must_use]
    pub fn new(scenarios: Vec<Scenario>) -> Self {
        Self { scenarios }
    }

    /// Builds the label x parent matrix.
    ///
    /// The label list is repeated `repeat` times; for every label, one
    /// scenario is produced per parent page at `<label>.<domain><path>`.
    pub fn cross_product(
        labels: &[String],
        repeat: usize,
        parents: &[ParentPage],
        sub_resource_host: &str,
    ) -> Self {
        let scenarios = std::iter::repeat(labels)
            .take(repeat)
            .flatten()
            .flat_map(move |label| {
                parents.iter().map(move |parent| {
                    Scenario::new(
                        format!("{label}.{}", parent.domain),
                        sub_resource_host,
                        parent.path.clone(),
                    )
                })
            })
            .collect();

        Self { scenarios }
    }

    /// Scenarios in run order.
    #[must_use]
    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    /// Number of scenarios.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// Returns true if there is nothing to navigate to.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Distinct first-party domains in first-seen order.
    #[must_use]
    pub fn distinct_first_parties(&self) -> IndexSet<String> {
        self.scenarios
            .iter()
            .map(|s| s.first_party().to_string())
            .collect()
    }

    /// Distinct sub-resource hosts in first-seen order.
    #[must_use]
    pub fn sub_resource_hosts(&self) -> IndexSet<String> {
        self.scenarios
            .iter()
            .map(|s| s.sub_resource_host.clone())
            .collect()
    }
}

impl<'a> IntoIterator for &'a ScenarioSet {
    type Item = &'a Scenario;
    type IntoIter = std::slice::Iter<'a, Scenario>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenarios.iter()
    }
}
