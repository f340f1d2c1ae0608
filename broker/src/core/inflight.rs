//! In-flight request tracking (concurrent call deduplication).
//!
//! The first caller for a key starts the work on its own task; everyone who
//! asks for the same key before it resolves attaches to the same shared
//! future. The entry is removed by the task itself once the work finishes, so
//! a failure is delivered to the current waiters and then forgotten.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error};

use crate::{
    call::{CacheKey, CallContext},
    error::{BrokerResult, ErrorKind},
};

type SharedOutcome<T> = Shared<BoxFuture<'static, BrokerResult<T>>>;

/// A call currently being resolved.
struct InFlightEntry<T: Clone> {
    id: u64,
    outcome: SharedOutcome<T>,
    waiters: Arc<AtomicUsize>,
}

/// Whether this caller started the work or attached to someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRole {
    Leader,
    Follower,
    /// Nothing was in flight and the result was already available.
    Settled,
}

/// Result of [`InFlightTracker::join_or_start`].
#[derive(Debug)]
pub struct Joined<T> {
    pub result: BrokerResult<T>,
    pub role: JoinRole,
}

/// Tracks executing calls by cache key.
pub struct InFlightTracker<T: Clone + Send + Sync + 'static> {
    entries: Arc<DashMap<CacheKey, InFlightEntry<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> InFlightTracker<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Attach to the in-flight call for `key`, or start one with `work`.
    ///
    /// `work` is only invoked when no call is in flight. The work runs on a
    /// spawned task: dropping the returned future does not cancel it, and its
    /// result still reaches every other waiter. `ctx` tags the error returned
    /// if the task dies without producing a result.
    pub async fn join_or_start<F, Fut>(&self, key: &CacheKey, ctx: &CallContext, work: F) -> Joined<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<T>> + Send + 'static,
    {
        self.join_or_start_unless(key, ctx, || None, work).await
    }

    /// Like [`join_or_start`](Self::join_or_start), but `settled` is asked
    /// for an existing result before any work is started.
    ///
    /// `settled` runs under the same shard lock the finishing task needs to
    /// remove its entry. A result stored by the task before it deregisters is
    /// therefore always seen, and a caller that missed it earlier does not
    /// start a second execution.
    pub async fn join_or_start_unless<S, F, Fut>(
        &self,
        key: &CacheKey,
        ctx: &CallContext,
        settled: S,
        work: F,
    ) -> Joined<T>
    where
        S: FnOnce() -> Option<T>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = BrokerResult<T>> + Send + 'static,
    {
        // The entry guard holds the shard lock, so the create-or-attach
        // decision is atomic. It is released before awaiting.
        let (outcome, role) = match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let waiters = entry.get().waiters.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(key = %key, waiters, "Joined in-flight call");
                (entry.get().outcome.clone(), JoinRole::Follower)
            }
            Entry::Vacant(slot) => {
                if let Some(value) = settled() {
                    debug!(key = %key, "Result landed before start, not executing");
                    return Joined {
                        result: Ok(value),
                        role: JoinRole::Settled,
                    };
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let outcome = self.spawn(key.clone(), id, ctx.clone(), work());
                slot.insert(InFlightEntry {
                    id,
                    outcome: outcome.clone(),
                    waiters: Arc::new(AtomicUsize::new(1)),
                });
                (outcome, JoinRole::Leader)
            }
        };

        Joined {
            result: outcome.await,
            role,
        }
    }

    fn spawn<Fut>(&self, key: CacheKey, id: u64, ctx: CallContext, work: Fut) -> SharedOutcome<T>
    where
        Fut: Future<Output = BrokerResult<T>> + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let handle = tokio::spawn(async move {
            let result = work.await;
            // Blocks on the shard lock until the starting caller has inserted
            // the entry, so the removal can never run first.
            entries.remove_if(&key, |_, entry| entry.id == id);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        correlation_id = %ctx.correlation_id,
                        error = %e,
                        "In-flight task for {}.{} terminated abnormally",
                        ctx.service,
                        ctx.tool
                    );
                    Err(ctx.error(ErrorKind::TransportUnavailable(format!(
                        "call task failed: {}",
                        e
                    ))))
                }
            }
        }
        .boxed()
        .shared()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Callers attached to the in-flight call for `key`, including the one
    /// that started it.
    pub fn waiters(&self, key: &CacheKey) -> Option<usize> {
        self.entries
            .get(key)
            .map(|entry| entry.waiters.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InFlightTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}
