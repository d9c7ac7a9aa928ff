//! Per-key single-flight guard
//!
//! Prevents redundant concurrent work: at most one holder per key (folder
//! name or thread id). A busy key makes new requests no-ops. Markers older
//! than the configured TTL are considered abandoned and may be reclaimed,
//! so a crashed holder cannot lock a key out forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Marker {
    acquired_at: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    markers: HashMap<String, Marker>,
    next_generation: u64,
}

/// In-flight marker map keyed by folder or thread id
#[derive(Debug)]
pub struct SingleFlight {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl SingleFlight {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Mark `key` busy iff it is not already busy
    ///
    /// Returns `true` when the caller now holds the key. The caller must
    /// [`release`](Self::release) it; prefer [`try_permit`](Self::try_permit),
    /// which releases on drop.
    pub fn acquire(&self, key: &str) -> bool {
        self.acquire_generation(key).is_some()
    }

    /// Clear the marker for `key` unconditionally
    pub fn release(&self, key: &str) {
        self.lock().markers.remove(key);
    }

    /// Acquire `key` and return a permit that releases it when dropped
    pub fn try_permit(self: &Arc<Self>, key: &str) -> Option<SyncPermit> {
        self.acquire_generation(key).map(|generation| SyncPermit {
            guard: Arc::clone(self),
            key: key.to_owned(),
            generation,
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .markers
            .get(key)
            .is_some_and(|m| now.duration_since(m.acquired_at) < self.ttl)
    }

    /// Keys held by a marker younger than the TTL, sorted
    pub fn active_keys(&self) -> Vec<String> {
        let held: Vec<String> = self.lock().markers.keys().cloned().collect();
        let mut keys: Vec<String> = held.into_iter().filter(|k| self.is_busy(k)).collect();
        keys.sort();
        keys
    }

    fn acquire_generation(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(existing) = inner.markers.get(key) {
            let held_for = now.duration_since(existing.acquired_at);
            if held_for < self.ttl {
                debug!(key, "single-flight key busy");
                return None;
            }
            warn!(
                key,
                held_ms = held_for.as_millis() as u64,
                "reclaiming stale single-flight marker"
            );
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.markers.insert(
            key.to_owned(),
            Marker {
                acquired_at: now,
                generation,
            },
        );
        Some(generation)
    }

    fn release_generation(&self, key: &str, generation: u64) {
        let mut inner = self.lock();
        if inner
            .markers
            .get(key)
            .is_some_and(|m| m.generation == generation)
        {
            inner.markers.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// RAII holder of a single-flight key
///
/// Releases its own marker on drop. A marker reclaimed by someone else after
/// the TTL is left alone.
#[derive(Debug)]
pub struct SyncPermit {
    guard: Arc<SingleFlight>,
    key: String,
    generation: u64,
}

impl SyncPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.guard.release_generation(&self.key, self.generation);
    }
}
