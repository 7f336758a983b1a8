//! Cache snapshot reading.
//!
//! A [`CacheStore`] is visited one partition context at a time. The store
//! pushes entries into a [`CacheVisitor`] (possibly from another task) and
//! finishes with a completion signal; [`read_snapshot`] turns that push
//! stream into a list of [`CacheEntrySnapshot`]s under a timeout.
//!
//! # Timeouts
//!
//! A read either completes or fails. When the deadline passes, everything
//! accumulated so far is dropped together with the pending future, so a
//! partial list is never returned as success.
//!
//! # Multiple contexts
//!
//! [`read_snapshots`] runs one independently-timed read per context
//! concurrently. A failure in one context leaves the others untouched, and
//! the failed contexts can be read again on their own.

use crate::context::PartitionContext;
use crate::error::{HarnessError, Result};
use crate::wait::bounded;
use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// One cache entry captured at a point in time.
///
/// Produced wholesale by [`read_snapshot`] and discarded after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheEntrySnapshot {
    /// The partition context the entry was found in.
    pub context: PartitionContext,
    /// Resource locator (the cache key's URI).
    pub locator: String,
    /// Extra key material, e.g. the first-party domain under isolation.
    pub id_enhance: Option<String>,
}

/// Events a store pushes while visiting a context.
#[derive(Debug)]
enum VisitEvent {
    Entry {
        locator: String,
        id_enhance: Option<String>,
    },
    Completed,
}

/// Receives the entries of one context visit.
///
/// Cheap to clone; a store may hand clones to worker tasks. Once the visit
/// is over the store calls [`CacheVisitor::complete`] exactly once.
#[derive(Debug, Clone)]
pub struct CacheVisitor {
    sender: mpsc::UnboundedSender<VisitEvent>,
}

impl CacheVisitor {
    fn new(sender: mpsc::UnboundedSender<VisitEvent>) -> Self {
        Self { sender }
    }

    /// Reports one entry. Entries reported after the reader gave up are
    /// dropped.
    pub fn on_entry(&self, locator: impl Into<String>, id_enhance: Option<String>) {
        let _ = self.sender.send(VisitEvent::Entry {
            locator: locator.into(),
            id_enhance,
        });
    }

    /// Signals the end of the visit.
    pub fn complete(self) {
        let _ = self.sender.send(VisitEvent::Completed);
    }
}

/// A partitioned cache store.
///
/// A single `visit` must cover both the persistent and the in-memory backing
/// stores of the context.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Removes every entry from every context.
    async fn clear(&self) -> Result<()>;

    /// Starts visiting `context`, delivering entries to `visitor`.
    ///
    /// May return before the visit is complete; completion is signalled via
    /// [`CacheVisitor::complete`].
    async fn visit(&self, context: &PartitionContext, visitor: CacheVisitor) -> Result<()>;
}

/// Reads every entry of `context`, failing if the visit does not complete
/// within `timeout`.
///
/// # Errors
///
/// Returns `Timeout` when the deadline passes, `VisitIncomplete` if the store
/// drops the visitor without completing, or the store's own error.
pub async fn read_snapshot(
    store: &dyn CacheStore,
    context: PartitionContext,
    timeout: Duration,
) -> Result<Vec<CacheEntrySnapshot>> {
    let operation = format!("cache snapshot for context {context}");
    let entries = bounded(collect(store, context), timeout, &operation).await?;
    debug!(%context, entries = entries.len(), "cache snapshot complete");
    Ok(entries)
}

async fn collect(
    store: &dyn CacheStore,
    context: PartitionContext,
) -> Result<Vec<CacheEntrySnapshot>> {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    store.visit(&context, CacheVisitor::new(sender)).await?;

    let mut entries = Vec::new();
    while let Some(event) = receiver.recv().await {
        match event {
            VisitEvent::Entry {
                locator,
                id_enhance,
            } => entries.push(CacheEntrySnapshot {
                context,
                locator,
                id_enhance,
            }),
            VisitEvent::Completed => return Ok(entries),
        }
    }

    Err(HarnessError::VisitIncomplete {
        context: context.key(),
    })
}

/// Outcome of one context's read within [`read_snapshots`].
#[derive(Debug)]
pub struct ContextRead {
    /// The context that was read.
    pub context: PartitionContext,
    /// Its entries, or why the read failed.
    pub result: Result<Vec<CacheEntrySnapshot>>,
}

/// Reads several contexts concurrently, each under its own `timeout`.
///
/// Duplicate contexts are read once. Results come back in first-seen
/// context order.
pub async fn read_snapshots(
    store: &dyn CacheStore,
    contexts: &[PartitionContext],
    timeout: Duration,
) -> Vec<ContextRead> {
    let unique: IndexSet<PartitionContext> = contexts.iter().copied().collect();

    join_all(unique.into_iter().map(|context| async move {
        ContextRead {
            context,
            result: read_snapshot(store, context, timeout).await,
        }
    }))
    .await
}

/// Merged, de-duplicated entries across several context reads.
///
/// The same physical entry reported by overlapping reads is counted once.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSet {
    entries: IndexSet<CacheEntrySnapshot>,
}

impl SnapshotSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds entries, skipping ones already present.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = CacheEntrySnapshot>) {
        self.entries.extend(entries);
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> indexmap::set::Iter<'_, CacheEntrySnapshot> {
        self.entries.iter()
    }

    /// Number of distinct entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a SnapshotSet {
    type Item = &'a CacheEntrySnapshot;
    type IntoIter = indexmap::set::Iter<'a, CacheEntrySnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<CacheEntrySnapshot> for SnapshotSet {
    fn from_iter<I: IntoIterator<Item = CacheEntrySnapshot>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
