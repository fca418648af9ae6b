//! Distance/time matrix cache
//!
//! Memoizes pairwise travel costs keyed by (origin, destination, departure
//! bucket). Points are rounded to 5 decimal places and departure times to
//! 30-minute buckets, so near-identical requests hit the same entry.
//! Bounded capacity with LRU eviction, TTL-bounded entries, and eager
//! invalidation on provider error. Lookups never fail.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::Coordinates;

/// Number of 30-minute departure buckets in an operating day.
pub const DEPART_BUCKETS: u32 = 48;

/// Map a minutes-from-day-start departure to its bucket.
pub fn bucket_for_minute(minute: u32) -> u8 {
    ((minute / 30) % DEPART_BUCKETS) as u8
}

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixSource {
    /// Routing provider value.
    Provider,
    /// Haversine fallback; usable by the solver, never by the assembler.
    Approximate,
}

/// Cached travel cost for one (origin, destination, bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixValue {
    pub distance_m: u64,
    pub duration_s: u64,
    pub source: MatrixSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixKey {
    origin: (i64, i64),
    destination: (i64, i64),
    bucket: u8,
}

impl MatrixKey {
    pub fn new(origin: &Coordinates, destination: &Coordinates, bucket: u8) -> Self {
        Self {
            origin: origin.rounded(),
            destination: destination.rounded(),
            bucket,
        }
    }
}

struct CacheEntry {
    value: MatrixValue,
    inserted_at: Instant,
    /// Monotone access counter for LRU; stale queue records are skipped.
    tick: u64,
}

struct CacheInner {
    entries: HashMap<MatrixKey, CacheEntry>,
    /// Access order queue with lazy deletion: (key, tick-at-push).
    queue: VecDeque<(MatrixKey, u64)>,
    next_tick: u64,
}

/// Shared, bounded LRU+TTL cache. Cheap to clone via `Arc` at the call site;
/// writes are atomic under a single mutex.
pub struct MatrixCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

impl MatrixCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                queue: VecDeque::new(),
                next_tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Look up one pair. Expired entries read as a miss and are dropped.
    pub fn get(&self, origin: &Coordinates, destination: &Coordinates, bucket: u8) -> Option<MatrixValue> {
        let key = MatrixKey::new(origin, destination, bucket);
        let inner = &mut *self.inner.lock();

        let tick = inner.next_tick;
        inner.next_tick += 1;

        let mut expired = false;
        let mut value = None;
        if let Some(entry) = inner.entries.get_mut(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                entry.tick = tick;
                value = Some(entry.value);
            } else {
                expired = true;
            }
        }
        if expired {
            inner.entries.remove(&key);
        }
        if value.is_some() {
            inner.queue.push_back((key, tick));
        }
        value
    }

    /// Look up many pairs for one departure bucket. Misses are `None`.
    pub fn get_many(
        &self,
        pairs: &[(Coordinates, Coordinates)],
        bucket: u8,
    ) -> Vec<Option<MatrixValue>> {
        pairs
            .iter()
            .map(|(o, d)| self.get(o, d, bucket))
            .collect()
    }

    /// Store one pair, evicting least-recently-used entries at capacity.
    pub fn put(
        &self,
        origin: &Coordinates,
        destination: &Coordinates,
        bucket: u8,
        value: MatrixValue,
    ) {
        let key = MatrixKey::new(origin, destination, bucket);
        let inner = &mut *self.inner.lock();

        let tick = inner.next_tick;
        inner.next_tick += 1;

        inner.entries.insert(
            key,
            CacheEntry { value, inserted_at: Instant::now(), tick },
        );
        inner.queue.push_back((key, tick));

        while inner.entries.len() > self.capacity {
            match inner.queue.pop_front() {
                Some((old_key, old_tick)) => {
                    let live = inner
                        .entries
                        .get(&old_key)
                        .map_or(false, |e| e.tick == old_tick);
                    if live {
                        inner.entries.remove(&old_key);
                    }
                    // Stale queue records refer to re-accessed keys; skip.
                }
                None => break,
            }
        }
    }

    /// Eagerly drop one pair, e.g. after a provider error made it suspect.
    pub fn invalidate(&self, origin: &Coordinates, destination: &Coordinates, bucket: u8) {
        let key = MatrixKey::new(origin, destination, bucket);
        self.inner.lock().entries.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
