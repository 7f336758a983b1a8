//! In-memory reference substrate.
//!
//! [`SimulatedBrowser`] implements all four collaborator contracts on shared
//! state, behaving the way a first-party-isolating browser does:
//!
//! - opening a parent page creates one channel per embedded resource (plus a
//!   preconnect to the sub-resource host) and fires every registered hook
//!   synchronously, before the resources are cached;
//! - each resource is cached under the partition context its load uses
//!   (fetch-like loads go to the anonymous private context), keyed by the
//!   first party when the current isolation level applies to that context;
//! - streamed media lands in the memory backing store, everything else on
//!   disk, and a visit covers both.
//!
//! Fault injection covers the failure paths: hanging loads, stalled cache
//! visits, media that is never cached, misattributed first parties, failing
//! tab closes and rejected policy writes.

use crate::config::HarnessConfig;
use crate::context::PartitionContext;
use crate::driver::{NavigationService, TabHandle};
use crate::error::{HarnessError, Result};
use crate::observer::{ChannelFilter, ChannelHookRegistry, HookToken, ObservedChannel};
use crate::policy::{IsolationLevel, PolicyStore, DEFAULT_POLICY_KEY};
use crate::reconcile::Tolerance;
use crate::scenario::base_domain;
use crate::snapshot::{CacheStore, CacheVisitor};
use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Directory the embedded resources are served from.
const RESOURCE_DIR: &str = "/browser/netwerk/test/browser/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Backing {
    Disk,
    Memory,
}

type EntryKey = (String, Option<String>);

#[derive(Default)]
struct Faults {
    hang_loads_containing: Option<String>,
    stalled_contexts: HashSet<PartitionContext>,
    skip_media: bool,
    misattribute_to: Option<String>,
    fail_closes: bool,
    rejected_policy: Option<i64>,
}

#[derive(Default)]
struct SimState {
    prefs: HashMap<String, i64>,
    cache: IndexMap<(PartitionContext, Backing), IndexSet<EntryKey>>,
    tabs: HashMap<TabHandle, String>,
    next_tab: u64,
    hooks: IndexMap<HookToken, Arc<dyn ChannelFilter>>,
    next_hook: u64,
    stalled_visitors: Vec<CacheVisitor>,
    faults: Faults,
    channels_created: usize,
    tabs_closed: usize,
    stray_unregisters: usize,
}

/// A browser simulated in memory.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedBrowser {
    sub_resource_host: Arc<str>,
    resource_stem: Arc<str>,
    embedded: Arc<[String]>,
    policy_key: Arc<str>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBrowser {
    /// Creates a browser whose parent pages embed `stem + suffix` from
    /// `sub_resource_host` for every suffix in `embedded`.
    pub fn new(
        sub_resource_host: &str,
        resource_stem: &str,
        embedded: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            sub_resource_host: sub_resource_host.into(),
            resource_stem: resource_stem.into(),
            embedded: embedded.into_iter().collect(),
            policy_key: DEFAULT_POLICY_KEY.into(),
            state: Arc::default(),
        }
    }

    /// Creates a browser serving exactly the kinds `config` reconciles.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        let mut browser = Self::new(
            &config.sub_resource_host,
            &config.resource_stem,
            config.suffixes.keys().cloned(),
        );
        browser.policy_key = config.policy_key.as_str().into();
        browser
    }

    /// Makes loads of URLs containing `pattern` never complete.
    #[must_use]
    pub fn hang_loads_containing(self, pattern: impl Into<String>) -> Self {
        self.state().faults.hang_loads_containing = Some(pattern.into());
        self
    }

    /// Makes visits of `context` never signal completion.
    #[must_use]
    pub fn stall_visits(self, context: PartitionContext) -> Self {
        self.state().faults.stalled_contexts.insert(context);
        self
    }

    /// Never caches best-effort (streamed media) resources.
    #[must_use]
    pub fn skip_media_caching(self) -> Self {
        self.state().faults.skip_media = true;
        self
    }

    /// Reports `host` as every sub-resource channel's first party.
    #[must_use]
    pub fn misattribute_first_party(self, host: impl Into<String>) -> Self {
        self.state().faults.misattribute_to = Some(host.into());
        self
    }

    /// Makes every tab close fail (the tab is still removed).
    #[must_use]
    pub fn fail_closes(self) -> Self {
        self.state().faults.fail_closes = true;
        self
    }

    /// Makes the policy store reject writes of `value`.
    #[must_use]
    pub fn reject_policy_value(self, value: i64) -> Self {
        self.state().faults.rejected_policy = Some(value);
        self
    }

    /// Sets a preference value directly.
    pub fn set_pref(&self, key: &str, value: i64) {
        self.state().prefs.insert(key.to_string(), value);
    }

    /// Reads a preference value directly.
    #[must_use]
    pub fn pref(&self, key: &str) -> Option<i64> {
        self.state().prefs.get(key).copied()
    }

    /// Inserts an entry as if a page had cached it.
    pub fn seed_entry(&self, context: PartitionContext, locator: &str, id_enhance: Option<&str>) {
        self.state()
            .cache
            .entry((context, Backing::Disk))
            .or_default()
            .insert((locator.to_string(), id_enhance.map(str::to_string)));
    }

    /// Total entries across all contexts and backing stores.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.state().cache.values().map(IndexSet::len).sum()
    }

    /// Tabs currently open.
    #[must_use]
    pub fn open_tabs(&self) -> usize {
        self.state().tabs.len()
    }

    /// Tabs closed so far.
    #[must_use]
    pub fn tabs_closed(&self) -> usize {
        self.state().tabs_closed
    }

    /// Hooks currently registered.
    #[must_use]
    pub fn active_hooks(&self) -> usize {
        self.state().hooks.len()
    }

    /// Unregister calls for tokens that were not registered.
    #[must_use]
    pub fn stray_unregisters(&self) -> usize {
        self.state().stray_unregisters
    }

    /// Channels created so far.
    #[must_use]
    pub fn channels_created(&self) -> usize {
        self.state().channels_created
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resource_locator(&self, suffix: &str) -> String {
        format!(
            "http://{}{RESOURCE_DIR}{}{suffix}",
            self.sub_resource_host, self.resource_stem
        )
    }

    /// Fires every hook for `channel` without holding the state lock.
    fn create_channel(&self, channel: &ObservedChannel) {
        let hooks: Vec<_> = {
            let mut state = self.state();
            state.channels_created += 1;
            state.hooks.values().cloned().collect()
        };
        for hook in hooks {
            hook.on_channel(channel);
        }
    }

    fn load_page(&self, url: &str) {
        let host = host_of(url);
        let first_party = base_domain(host).to_string();
        let (level, attributed) = {
            let state = self.state();
            let value = state.prefs.get(&*self.policy_key).copied().unwrap_or(0);
            let level = IsolationLevel::try_from(value).unwrap_or(IsolationLevel::Off);
            let attributed = state
                .faults
                .misattribute_to
                .clone()
                .unwrap_or_else(|| first_party.clone());
            (level, attributed)
        };

        self.create_channel(&ObservedChannel::new(url, Some(first_party.clone())));
        self.create_channel(&ObservedChannel::new(
            format!("http://{}/", self.sub_resource_host),
            Some(attributed.clone()),
        ));

        for suffix in self.embedded.iter() {
            let locator = self.resource_locator(suffix);
            self.create_channel(&ObservedChannel::new(locator.clone(), Some(attributed.clone())));

            let media = Tolerance::for_suffix(suffix) == Tolerance::BestEffort;
            let context = if suffix.contains("fetch") || suffix.contains("request") {
                PartitionContext::ANONYMOUS_PRIVATE
            } else {
                PartitionContext::DEFAULT
            };
            let backing = if media { Backing::Memory } else { Backing::Disk };
            let id_enhance = level
                .isolates(context.is_private())
                .then(|| first_party.clone());

            let mut state = self.state();
            if media && state.faults.skip_media {
                continue;
            }
            state
                .cache
                .entry((context, backing))
                .or_default()
                .insert((locator, id_enhance));
        }

        debug!(url, %first_party, ?level, "simulated page load");
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

#[async_trait]
impl NavigationService for SimulatedBrowser {
    async fn open(&self, url: &str) -> Result<TabHandle> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(HarnessError::NavigationFailed {
                url: url.to_string(),
                reason: "unsupported scheme".into(),
            });
        }

        let tab = {
            let mut state = self.state();
            let tab = TabHandle::new(state.next_tab);
            state.next_tab += 1;
            state.tabs.insert(tab, url.to_string());
            tab
        };

        let hangs = self
            .state()
            .faults
            .hang_loads_containing
            .as_deref()
            .is_some_and(|pattern| url.contains(pattern));
        if !hangs {
            self.load_page(url);
        }

        Ok(tab)
    }

    async fn wait_for_load(&self, tab: TabHandle, timeout: Duration) -> Result<()> {
        let url = self
            .state()
            .tabs
            .get(&tab)
            .cloned()
            .ok_or(HarnessError::UnknownHandle(tab))?;

        let hangs = self
            .state()
            .faults
            .hang_loads_containing
            .as_deref()
            .is_some_and(|pattern| url.contains(pattern));
        if hangs {
            tokio::time::sleep(timeout).await;
            return Err(HarnessError::timeout(format!("load of {url}"), timeout));
        }

        Ok(())
    }

    async fn close(&self, tab: TabHandle) -> Result<()> {
        let mut state = self.state();
        state
            .tabs
            .remove(&tab)
            .ok_or(HarnessError::UnknownHandle(tab))?;
        state.tabs_closed += 1;

        if state.faults.fail_closes {
            return Err(HarnessError::NavigationFailed {
                url: tab.to_string(),
                reason: "close rejected".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SimulatedBrowser {
    async fn clear(&self) -> Result<()> {
        self.state().cache.clear();
        Ok(())
    }

    async fn visit(&self, context: &PartitionContext, visitor: CacheVisitor) -> Result<()> {
        let mut state = self.state();
        let entries: Vec<EntryKey> = [Backing::Disk, Backing::Memory]
            .iter()
            .filter_map(|backing| state.cache.get(&(*context, *backing)))
            .flat_map(|set| set.iter().cloned())
            .collect();

        if state.faults.stalled_contexts.contains(context) {
            for (locator, id_enhance) in entries {
                visitor.on_entry(locator, id_enhance);
            }
            state.stalled_visitors.push(visitor);
            return Ok(());
        }
        drop(state);

        tokio::spawn(async move {
            for (locator, id_enhance) in entries {
                visitor.on_entry(locator, id_enhance);
                tokio::task::yield_now().await;
            }
            visitor.complete();
        });
        Ok(())
    }
}

impl ChannelHookRegistry for SimulatedBrowser {
    fn register(&self, filter: Arc<dyn ChannelFilter>) -> HookToken {
        let mut state = self.state();
        let token = HookToken::new(state.next_hook);
        state.next_hook += 1;
        state.hooks.insert(token, filter);
        token
    }

    fn unregister(&self, token: HookToken) {
        let mut state = self.state();
        if state.hooks.shift_remove(&token).is_none() {
            state.stray_unregisters += 1;
        }
    }
}

#[async_trait]
impl PolicyStore for SimulatedBrowser {
    async fn get_policy(&self, key: &str) -> Result<i64> {
        Ok(self.state().prefs.get(key).copied().unwrap_or(0))
    }

    async fn set_policy(&self, key: &str, value: i64) -> Result<()> {
        let mut state = self.state();
        if state.faults.rejected_policy == Some(value) {
            return Err(HarnessError::Store(format!("write of {key}={value} rejected")));
        }
        state.prefs.insert(key.to_string(), value);
        Ok(())
    }
}
