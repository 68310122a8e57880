//! Load scheduler
//!
//! Coordinates asynchronous work on one resource's keys:
//! - At most one load per key is in flight; a load whose key is contained in
//!   a pending load joins it instead of fetching again
//! - Operations on overlapping keys run in submission order
//! - A mutation is never joined and every later overlapping load waits for it
//!
//! Each operation runs on its own spawned task, so a caller that stops
//! awaiting does not cancel work other callers joined.

use crate::error::ResourceError;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rescache_key::{KeyModel, NormalizedKey};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Done = Shared<BoxFuture<'static, Result<(), ResourceError>>>;

/// Kind of scheduled operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Fetch from the loader; joinable
    Load,
    /// Local or remote write; never joined
    Mutation,
}

/// Result of a scheduled operation as seen by one caller
#[derive(Debug, Clone)]
pub struct Scheduled {
    /// Outcome shared by every caller of the operation
    pub outcome: Result<(), ResourceError>,
    /// Whether this caller joined an operation someone else submitted
    pub joined: bool,
}

#[derive(Clone)]
struct PendingOp {
    id: u64,
    keys: Vec<NormalizedKey>,
    kind: OpKind,
    submitted_at: u64,
    done: Done,
}

#[derive(Default)]
struct SchedulerState {
    next_id: u64,
    pending: Vec<PendingOp>,
}

/// Removes an operation from the pending list when its task ends, panics
/// included
struct PendingGuard {
    state: Arc<Mutex<SchedulerState>>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.state.lock().pending.retain(|op| op.id != self.id);
    }
}

/// Per-resource scheduler of loads and mutations
#[derive(Clone)]
pub struct LoadScheduler {
    model: Arc<KeyModel>,
    state: Arc<Mutex<SchedulerState>>,
}

impl LoadScheduler {
    /// Create scheduler for a resource's key model
    #[must_use]
    pub fn new(model: Arc<KeyModel>) -> Self {
        Self {
            model,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    /// Schedule a load of `key`
    ///
    /// `generation` is the resource's current outdate generation and `floor`
    /// the generation at which `key` was last outdated. A pending load is
    /// only joined if it was submitted at or after `floor`, so a load never
    /// returns data fetched before the caller's most recent outdate.
    pub async fn load<F, Fut>(&self, key: NormalizedKey, generation: u64, floor: u64, body: F) -> Scheduled
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ResourceError>> + Send + 'static,
    {
        let joined = {
            let state = self.state.lock();
            self.find_joinable(&state.pending, &key, floor)
        };
        if let Some(done) = joined {
            trace!(key = %key, "joining in-flight load");
            return Scheduled {
                outcome: done.await,
                joined: true,
            };
        }
        let done = self.submit(vec![key], OpKind::Load, generation, body);
        Scheduled {
            outcome: done.await,
            joined: false,
        }
    }

    /// Schedule a mutation touching `keys`
    ///
    /// Runs after every pending operation overlapping any of the keys.
    pub async fn mutation<F, Fut>(&self, keys: Vec<NormalizedKey>, body: F) -> Result<(), ResourceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ResourceError>> + Send + 'static,
    {
        self.submit(keys, OpKind::Mutation, 0, body).await
    }

    /// Wait until nothing overlapping `key` is pending
    pub async fn settled(&self, key: &NormalizedKey) {
        loop {
            let waiting: Vec<Done> = {
                let state = self.state.lock();
                state
                    .pending
                    .iter()
                    .filter(|op| self.touches(op, key))
                    .map(|op| op.done.clone())
                    .collect()
            };
            if waiting.is_empty() {
                return;
            }
            futures::future::join_all(waiting).await;
        }
    }

    /// Check if an operation overlapping `key` is pending
    #[must_use]
    pub fn in_flight(&self, key: &NormalizedKey) -> bool {
        self.state.lock().pending.iter().any(|op| self.touches(op, key))
    }

    /// Number of pending operations
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn touches(&self, op: &PendingOp, key: &NormalizedKey) -> bool {
        op.keys.iter().any(|k| self.model.overlaps(k.key(), key.key()))
    }

    fn find_joinable(&self, pending: &[PendingOp], key: &NormalizedKey, floor: u64) -> Option<Done> {
        for (idx, op) in pending.iter().enumerate().rev() {
            if op.kind != OpKind::Load || op.submitted_at < floor {
                continue;
            }
            if !op.keys.iter().any(|k| self.model.contains(k.key(), key.key())) {
                continue;
            }
            let blocked = pending[idx + 1..]
                .iter()
                .any(|later| later.kind == OpKind::Mutation && self.touches(later, key));
            if blocked {
                return None;
            }
            return Some(op.done.clone());
        }
        None
    }

    fn submit<F, Fut>(&self, keys: Vec<NormalizedKey>, kind: OpKind, generation: u64, body: F) -> Done
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ResourceError>> + Send + 'static,
    {
        let label = keys
            .iter()
            .map(|k| k.canonical().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let (tx, rx) = oneshot::channel();
        let aborted_key = label.clone();
        let done: Done = async move {
            rx.await.unwrap_or_else(|_| {
                Err(ResourceError::Aborted {
                    key: aborted_key,
                    reason: "task ended before completing".to_string(),
                })
            })
        }
        .boxed()
        .shared();

        let (id, before) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let before: Vec<Done> = state
                .pending
                .iter()
                .filter(|op| keys.iter().any(|k| self.touches(op, k)))
                .map(|op| op.done.clone())
                .collect();
            debug!(op = id, keys = %label, ?kind, waits_on = before.len(), "scheduling");
            state.pending.push(PendingOp {
                id,
                keys,
                kind,
                submitted_at: generation,
                done: done.clone(),
            });
            (id, before)
        };

        // The task may be dropped in place (runtime shutting down), which
        // runs the guard; the state lock must be free by then.
        let guard = PendingGuard {
            state: Arc::clone(&self.state),
            id,
        };
        tokio::spawn(async move {
            let guard = guard;
            for prior in before {
                let _ = prior.await;
            }
            let result = body().await;
            drop(guard);
            let _ = tx.send(result);
        });
        done
    }
}

impl std::fmt::Debug for LoadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadScheduler").field("pending", &self.pending()).finish()
    }
}
