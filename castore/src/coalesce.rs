use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Returned to every waiter if the shared unit of work panicked or was
/// aborted before producing a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("coalesced task did not complete: {0}")]
pub struct TaskFailed(String);

type SharedResult<V> = Shared<BoxFuture<'static, Result<V, TaskFailed>>>;

struct Inflight<V: Clone> {
    /// Distinguishes this unit from a later one started for the same key.
    id: u64,
    waiters: usize,
    result: SharedResult<V>,
}

/// Merges concurrent requests for the same key into a single unit of work.
///
/// The first caller for a key spawns the unit onto the tokio runtime, later
/// callers join it and all of them receive a clone of its output. Because
/// the unit is spawned, it runs to completion even if the caller that
/// started it goes away.
///
/// An entry is removed when its unit finishes, also if every waiter went
/// away before. A call for the same key arriving after that starts a fresh
/// unit, so there is never more than one unit per key.
pub struct Coalescer<K, V: Clone> {
    inflight: Arc<Mutex<HashMap<K, Inflight<V>>>>,
    next_id: AtomicU64,
}

impl<K, V: Clone> Default for Coalescer<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a unit of work currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Number of callers currently waiting on the unit of work for `key`.
    pub fn waiters(&self, key: &K) -> usize {
        self.inflight
            .lock()
            .get(key)
            .map(|entry| entry.waiters)
            .unwrap_or(0)
    }

    /// Joins the unit of work for `key`, or starts one by calling `make`.
    /// `make` is only called if no unit is in flight for this key.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V, TaskFailed>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (id, result) = {
            let mut inflight = self.inflight.lock();
            let entry = inflight.entry(key.clone()).or_insert_with(|| {
                debug!(key=?key, "starting unit of work");
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let unit = make();
                let done = UnitGuard {
                    inflight: self.inflight.clone(),
                    key: key.clone(),
                    id,
                };
                let handle = tokio::spawn(async move {
                    // dropped on completion, panic and abort alike.
                    let _done = done;
                    unit.await
                });
                Inflight {
                    id,
                    waiters: 0,
                    result: async move { handle.await.map_err(|e| TaskFailed(e.to_string())) }
                        .boxed()
                        .shared(),
                }
            });
            entry.waiters += 1;
            trace!(key=?key, waiters=entry.waiters, "joined unit of work");

            (entry.id, entry.result.clone())
        };

        let _guard = WaiterGuard {
            inflight: &*self.inflight,
            key,
            id,
        };

        result.await
    }
}

/// Removes the entry of a unit once the unit is finished.
struct UnitGuard<K: Eq + Hash, V: Clone> {
    inflight: Arc<Mutex<HashMap<K, Inflight<V>>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V: Clone> Drop for UnitGuard<K, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if inflight.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            inflight.remove(&self.key);
        }
    }
}

/// Deregisters a waiter when it is done, also if its future got dropped.
struct WaiterGuard<'a, K: Eq + Hash, V: Clone> {
    inflight: &'a Mutex<HashMap<K, Inflight<V>>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V: Clone> Drop for WaiterGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if let Some(entry) = inflight.get_mut(&self.key) {
            if entry.id != self.id {
                return;
            }
            entry.waiters -= 1;
        }
    }
}
