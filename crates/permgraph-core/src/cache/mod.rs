//! Transitive-closure memoization.
//!
//! Closures are pure functions of the edge set, so the cache is an
//! optimization, never a source of truth. Correctness rests on one rule:
//! **any write to the edge set or the permission catalog bumps the cache
//! generation**, which clears every entry at once. The cache over-invalidates
//! rather than tracking fan-in.
//!
//! # Synchronization Protocol
//!
//! Readers follow get/compute/put:
//!
//! 1. `get` the entry; on a hit, done.
//! 2. Read `generation()` **before** loading edges.
//! 3. Compute from a fresh edge snapshot.
//! 4. `put` with the generation read in step 2.
//!
//! `put` and `invalidate_all` serialize on the same write lock, and `put`
//! drops any value computed under an older generation. A reader that raced
//! with a writer therefore never installs a stale closure; at worst it
//! returns one to its own caller, which the staleness contract allows.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::debug;

use crate::permission::PermissionId;

/// Hard upper bound on cached closures.
pub const MAX_CLOSURE_CACHE_ENTRIES: usize = 10_000;

/// Which way a closure follows the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureDirection {
    /// Transitive dependencies ("what must also be granted").
    Dependencies,
    /// Transitive dependents ("what breaks if revoked").
    Dependents,
}

/// Cache key: one closure per permission per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureKey {
    /// Traversal direction.
    pub direction: ClosureDirection,
    /// Start node.
    pub permission: PermissionId,
}

impl ClosureKey {
    /// Key for the dependency closure of `permission`.
    #[must_use]
    pub const fn dependencies(permission: PermissionId) -> Self {
        Self {
            direction: ClosureDirection::Dependencies,
            permission,
        }
    }

    /// Key for the dependent closure of `permission`.
    #[must_use]
    pub const fn dependents(permission: PermissionId) -> Self {
        Self {
            direction: ClosureDirection::Dependents,
            permission,
        }
    }
}

/// A memoized closure.
pub type Closure = Arc<BTreeSet<PermissionId>>;

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheMetrics {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to compute.
    pub misses: u64,
    /// Generation bumps.
    pub invalidations: u64,
    /// Puts dropped because the generation moved on during compute.
    pub stale_puts: u64,
    /// Puts dropped because the cache was full.
    pub capacity_drops: u64,
}

/// Injectable closure cache.
pub trait ClosureCache: Send + Sync + std::fmt::Debug {
    /// Current generation. Read before computing a value to `put`.
    fn generation(&self) -> u64;

    /// Cached closure, if present.
    fn get(&self, key: ClosureKey) -> Option<Closure>;

    /// Stores a closure computed under `generation`. Returns `false` if the
    /// value was dropped.
    fn put(&self, key: ClosureKey, generation: u64, value: Closure) -> bool;

    /// Drops every entry and advances the generation.
    fn invalidate_all(&self);

    /// Snapshot of the counters.
    fn metrics(&self) -> CacheMetrics;
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    stale_puts: AtomicU64,
    capacity_drops: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            stale_puts: self.stale_puts.load(Ordering::Relaxed),
            capacity_drops: self.capacity_drops.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    generation: u64,
    closures: HashMap<ClosureKey, Closure>,
}

/// Process-local closure cache with generation-based invalidation.
#[derive(Debug)]
pub struct InMemoryClosureCache {
    entries: RwLock<Entries>,
    generation: AtomicU64,
    max_entries: usize,
    counters: Counters,
}

impl Default for InMemoryClosureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClosureCache {
    /// Creates a cache bounded by [`MAX_CLOSURE_CACHE_ENTRIES`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_CLOSURE_CACHE_ENTRIES)
    }

    /// Creates a cache holding at most `max_entries` closures (clamped to
    /// [`MAX_CLOSURE_CACHE_ENTRIES`]).
    #[must_use]
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            generation: AtomicU64::new(0),
            max_entries: max_entries.min(MAX_CLOSURE_CACHE_ENTRIES),
            counters: Counters::default(),
        }
    }

    /// Number of cached closures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closures
            .len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClosureCache for InMemoryClosureCache {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn get(&self, key: ClosureKey) -> Option<Closure> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let hit = entries.closures.get(&key).cloned();
        if hit.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(
                permission_id = %key.permission,
                direction = ?key.direction,
                "Closure cache hit"
            );
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(
                permission_id = %key.permission,
                direction = ?key.direction,
                "Closure cache miss"
            );
        }
        hit
    }

    fn put(&self, key: ClosureKey, generation: u64, value: Closure) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.generation != generation {
            self.counters.stale_puts.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if entries.closures.len() >= self.max_entries && !entries.closures.contains_key(&key) {
            self.counters.capacity_drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        entries.closures.insert(key, value);
        true
    }

    fn invalidate_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.generation += 1;
        entries.closures.clear();
        self.generation.store(entries.generation, Ordering::Release);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn metrics(&self) -> CacheMetrics {
        self.counters.snapshot()
    }
}

/// A cache that never stores anything. Used when caching is disabled.
#[derive(Debug, Default)]
pub struct NoopClosureCache {
    generation: AtomicU64,
    counters: Counters,
}

impl NoopClosureCache {
    /// Creates a disabled cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClosureCache for NoopClosureCache {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn get(&self, _key: ClosureKey) -> Option<Closure> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn put(&self, _key: ClosureKey, _generation: u64, _value: Closure) -> bool {
        false
    }

    fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn metrics(&self) -> CacheMetrics {
        self.counters.snapshot()
    }
}
