//! TTL cache with single-flight fills.
//!
//! Backs both the proxy credential cache and the identity token cache. Expiry uses
//! `tokio::time::Instant` so paused-clock tests can step over TTLs.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<(V, Duration)>>>;

enum Slot<V> {
    Ready { value: V, expires_at: Instant },
    Loading { generation: u64, fetch: SharedFetch<V> },
}

/// Keyed cache where each entry carries its own expiry.
///
/// Concurrent misses for the same key share one fetch; the fetch's result (value or
/// error) is handed to every waiter.
pub struct TtlCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    generation: AtomicU64,
    fetches_started: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            fetches_started: AtomicU64::new(0),
        }
    }

    /// Cached value if present and unexpired. Expired entries are evicted.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready { value, expires_at }) if Instant::now() < *expires_at => {
                Some(value.clone())
            }
            Some(Slot::Ready { .. }) => {
                slots.remove(key);
                None
            }
            _ => None,
        }
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.slots.lock().insert(key, Slot::Ready { value, expires_at });
    }

    /// Drop the entry. An in-flight fetch for the key still completes for its
    /// waiters but is not stored.
    pub fn invalidate(&self, key: &K) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Evict every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => now < *expires_at,
            Slot::Loading { .. } => true,
        });
        before - slots.len()
    }

    /// Entries held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Forget an in-flight fetch whose waiters were dropped, so the next caller
    /// starts a fresh one. Ready entries are kept.
    pub fn abandon_fetch(&self, key: &K) -> bool {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Loading { .. })) {
            slots.remove(key);
            true
        } else {
            false
        }
    }

    pub fn expires_at(&self, key: &K) -> Option<Instant> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready { expires_at, .. }) => Some(*expires_at),
            _ => None,
        }
    }

    /// Number of fetches actually started by [`get_or_fetch`](Self::get_or_fetch).
    pub fn fetches_started(&self) -> u64 {
        self.fetches_started.load(Ordering::SeqCst)
    }

    /// Return the cached value or run `fetch`, sharing it with concurrent callers.
    ///
    /// `fetch` resolves to the value and the TTL it should be cached for.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, Duration)>> + Send + 'static,
    {
        let (generation, shared) = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready { value, expires_at }) if Instant::now() < *expires_at => {
                    return Ok(value.clone());
                }
                Some(Slot::Loading { generation, fetch }) => {
                    debug!("Joining in-flight fetch");
                    (*generation, fetch.clone())
                }
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let shared = fetch().boxed().shared();
                    slots.insert(
                        key.clone(),
                        Slot::Loading {
                            generation,
                            fetch: shared.clone(),
                        },
                    );
                    self.fetches_started.fetch_add(1, Ordering::SeqCst);
                    (generation, shared)
                }
            }
        };

        let result = shared.await;

        let mut slots = self.slots.lock();
        let still_ours = matches!(
            slots.get(&key),
            Some(Slot::Loading { generation: g, .. }) if *g == generation
        );
        if still_ours {
            match &result {
                Ok((value, ttl)) => {
                    slots.insert(
                        key,
                        Slot::Ready {
                            value: value.clone(),
                            expires_at: Instant::now() + *ttl,
                        },
                    );
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }

        result.map(|(value, _)| value)
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
