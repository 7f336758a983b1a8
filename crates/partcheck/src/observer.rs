//! Channel creation observation and first-party auditing.
//!
//! The observer hooks channel creation itself rather than request lifecycle
//! notifications, so channels that never produce a request event (link
//! preconnects and the like) are still seen. Hooks run synchronously on the
//! thread that creates the channel, possibly while other harness work is
//! suspended, so all state reachable from a hook sits behind a mutex.
//!
//! Registration is a strict bracket: [`observe`] returns a
//! [`ChannelObservation`] whose [`stop`](ChannelObservation::stop) consumes
//! it, so a registration cannot be removed twice.

use crate::error::HarnessError;
use indexmap::IndexSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Pseudo host reported for channels without a first party.
pub const NO_FIRST_PARTY_HOST: &str = "--NoFirstPartyHost-";

/// What a channel hook sees of a newly created channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedChannel {
    /// The URI the channel was created for, before redirects.
    pub original_uri: String,
    /// The first-party host attributed to the channel, if any.
    pub first_party_host: Option<String>,
}

impl ObservedChannel {
    /// Creates a channel description.
    pub fn new(original_uri: impl Into<String>, first_party_host: Option<String>) -> Self {
        Self {
            original_uri: original_uri.into(),
            first_party_host,
        }
    }
}

/// A hook invoked once per outbound channel.
pub trait ChannelFilter: Send + Sync {
    /// Called synchronously when `channel` is created.
    fn on_channel(&self, channel: &ObservedChannel);
}

impl<F> ChannelFilter for F
where
    F: Fn(&ObservedChannel) + Send + Sync,
{
    fn on_channel(&self, channel: &ObservedChannel) {
        self(channel);
    }
}

/// Identifies one registration in a [`ChannelHookRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookToken(u64);

impl HookToken {
    /// Wraps a registry-assigned id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The registry-assigned id.
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Process-wide channel creation hook registry.
pub trait ChannelHookRegistry: Send + Sync {
    /// Installs `filter`; it receives every channel created from now on.
    fn register(&self, filter: Arc<dyn ChannelFilter>) -> HookToken;

    /// Removes the registration identified by `token`.
    fn unregister(&self, token: HookToken);
}

/// An installed channel hook. Dropping it without calling
/// [`stop`](Self::stop) still deregisters, but logs a warning.
pub struct ChannelObservation {
    registry: Arc<dyn ChannelHookRegistry>,
    token: Option<HookToken>,
}

impl ChannelObservation {
    /// Deregisters exactly this registration.
    pub fn stop(mut self) {
        if let Some(token) = self.token.take() {
            debug!(token = token.id(), "channel observation stopped");
            self.registry.unregister(token);
        }
    }
}

impl fmt::Debug for ChannelObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelObservation")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelObservation {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            warn!(
                token = token.id(),
                "ChannelObservation dropped without stop() - deregistering via Drop"
            );
            self.registry.unregister(token);
        }
    }
}

/// Registers `on_channel_seen` for every outbound channel.
///
/// The callback is invoked for unrelated channels too; it must do its own
/// filtering.
pub fn observe<F>(registry: Arc<dyn ChannelHookRegistry>, on_channel_seen: F) -> ChannelObservation
where
    F: Fn(&ObservedChannel) + Send + Sync + 'static,
{
    let token = registry.register(Arc::new(on_channel_seen));
    debug!(token = token.id(), "channel observation started");
    ChannelObservation {
        registry,
        token: Some(token),
    }
}

/// A channel matched by the audit, as seen during the observation window.
///
/// Only lives for the duration of one hook call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFirstPartyRecord<'a> {
    /// Original URI of the channel.
    pub channel_uri: &'a str,
    /// Its first-party host, or [`NO_FIRST_PARTY_HOST`].
    pub first_party_host: &'a str,
}

#[derive(Debug, Default)]
struct AuditState {
    matched: usize,
    failures: Vec<HarnessError>,
}

/// Checks that every channel touching the sub-resource host is attributed to
/// one of the expected first-party domains.
#[derive(Debug, Clone)]
pub struct FirstPartyAudit {
    sub_resource_host: String,
    expected: Arc<IndexSet<String>>,
    state: Arc<Mutex<AuditState>>,
}

impl FirstPartyAudit {
    /// Creates an audit for channels whose URI contains `sub_resource_host`.
    pub fn new(
        sub_resource_host: impl Into<String>,
        expected_first_parties: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            sub_resource_host: sub_resource_host.into(),
            expected: Arc::new(expected_first_parties.into_iter().collect()),
            state: Arc::default(),
        }
    }

    /// Installs the audit on `registry`.
    pub fn start(&self, registry: Arc<dyn ChannelHookRegistry>) -> ChannelObservation {
        let audit = self.clone();
        observe(registry, move |channel| audit.inspect(channel))
    }

    fn inspect(&self, channel: &ObservedChannel) {
        if !channel.original_uri.contains(&self.sub_resource_host) {
            return;
        }
        let record = ChannelFirstPartyRecord {
            channel_uri: &channel.original_uri,
            first_party_host: channel
                .first_party_host
                .as_deref()
                .unwrap_or(NO_FIRST_PARTY_HOST),
        };
        self.check(record);
    }

    fn check(&self, record: ChannelFirstPartyRecord<'_>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.matched += 1;

        if !self.expected.contains(record.first_party_host) {
            warn!(
                uri = record.channel_uri,
                host = record.first_party_host,
                "unexpected first party"
            );
            state.failures.push(HarnessError::UnexpectedFirstParty {
                uri: record.channel_uri.to_string(),
                host: record.first_party_host.to_string(),
            });
        }
    }

    /// Number of channels that touched the sub-resource host so far.
    #[must_use]
    pub fn matched(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .matched
    }

    /// Removes and returns the failures recorded so far.
    #[must_use]
    pub fn take_failures(&self) -> Vec<HarnessError> {
        std::mem::take(
            &mut self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .failures,
        )
    }
}
