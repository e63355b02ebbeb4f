//! In-memory cache statistics, histogram, and their persisted snapshot
//! (spec.md 3.2, 4.2).
//!
//! Grounded on `caddy`'s `database::cache::CacheStats` (plain counter
//! struct with a `update_hit_rate`-style derived accessor) and
//! `enterprise::ratelimit::analytics` for the histogram-over-fixed-bins
//! idiom; the persisted-snapshot split (immutable-after-open fields kept
//! out of the serialized form) mirrors the "shared mutable stats object"
//! note in spec.md 9 — handlers get an immutable snapshot value, never a
//! live reference.

use serde::{Deserialize, Serialize};

use crate::cache_store::Policy;

/// Number of histogram bins (spec.md 3.2): one bucket for sizes 1..9,
/// nine buckets per decade (one per leading digit) through 10^8..10^9-1,
/// and one open-ended bucket for sizes >= 10^9.
pub const HISTOGRAM_BINS: usize = 74;

const FINAL_BUCKET_FLOOR: u64 = 1_000_000_000;

/// Map a record size in bytes to its histogram bucket index.
///
/// Callers must ensure `size >= 1`; every user-key has non-zero length,
/// so a record size of zero would indicate an implementation bug rather
/// than a legitimate entry (spec.md 9, open question (i)).
pub fn bucket_index(size: u64) -> usize {
    assert!(size >= 1, "record size must be at least 1 byte");
    if size < 10 {
        return 0;
    }
    if size >= FINAL_BUCKET_FLOOR {
        return HISTOGRAM_BINS - 1;
    }
    let mut lower = 10u64;
    let mut decade = 1usize;
    while size >= lower * 10 {
        lower *= 10;
        decade += 1;
    }
    let digit = (size / lower) as usize; // 1..=9
    1 + (decade - 1) * 9 + (digit - 1)
}

/// Size histogram over [`HISTOGRAM_BINS`] buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    counts: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            counts: vec![0; HISTOGRAM_BINS],
        }
    }
}

impl Histogram {
    /// Record one entry of the given size.
    pub fn increment(&mut self, size: u64) {
        self.counts[bucket_index(size)] += 1;
    }

    /// Remove one entry of the given size.
    pub fn decrement(&mut self, size: u64) {
        let idx = bucket_index(size);
        self.counts[idx] = self.counts[idx].saturating_sub(1);
    }

    /// Total entries across all buckets; must always equal `size`
    /// (spec.md 8, invariant 1).
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Read-only access to the raw bucket counts.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Rebuild from scratch given every live record size, used when a
    /// cache is opened dirty (spec.md 3.2).
    pub fn rebuild<I: IntoIterator<Item = u64>>(sizes: I) -> Self {
        let mut h = Self::default();
        for size in sizes {
            h.increment(size);
        }
        h
    }
}

/// The fields of [`Stats`] that survive a `clear_stats()` call: identity
/// and the live content accounting, as opposed to the hit/miss history.
#[derive(Debug, Clone)]
struct Identity {
    max_size_in_bytes: i64,
    policy: Policy,
    cache_path: std::path::PathBuf,
}

/// Everything persisted as the `XVALUES` snapshot (spec.md 6.1). Identity
/// fields (`max_size_in_bytes`, `policy`, `cache_path`) are not included:
/// they live in the settings row and are supplied again at every open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub size: u64,
    pub size_in_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub ttl_evictions: u64,
    pub lru_evictions: u64,
    pub hits_since_last_miss: u64,
    pub misses_since_last_hit: u64,
    pub longest_hit_run: u64,
    pub longest_miss_run: u64,
    pub last_hit_time_ms: Option<i64>,
    pub last_miss_time_ms: Option<i64>,
    pub longest_hit_run_time_ms: Option<i64>,
    pub longest_miss_run_time_ms: Option<i64>,
    pub histogram: Histogram,
}

/// Live, in-memory statistics for one cache (spec.md 3.2).
#[derive(Debug, Clone)]
pub struct Stats {
    identity: Identity,
    snapshot: StatsSnapshot,
}

impl Stats {
    /// Start a fresh, all-zero stats block for a newly created cache.
    pub fn new(cache_path: std::path::PathBuf, max_size_in_bytes: i64, policy: Policy) -> Self {
        Self {
            identity: Identity {
                max_size_in_bytes,
                policy,
                cache_path,
            },
            snapshot: StatsSnapshot::default(),
        }
    }

    /// Reconstitute from a persisted snapshot plus the identity fields
    /// read from the settings row at open time.
    pub fn from_snapshot(
        snapshot: StatsSnapshot,
        cache_path: std::path::PathBuf,
        max_size_in_bytes: i64,
        policy: Policy,
    ) -> Self {
        Self {
            identity: Identity {
                max_size_in_bytes,
                policy,
                cache_path,
            },
            snapshot,
        }
    }

    /// The current persistable snapshot, for writing to the `XVALUES`
    /// row or for handing to an event callback as an immutable value.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot.clone()
    }

    pub fn size(&self) -> u64 {
        self.snapshot.size
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.snapshot.size_in_bytes
    }

    pub fn max_size_in_bytes(&self) -> i64 {
        self.identity.max_size_in_bytes
    }

    pub fn set_max_size_in_bytes(&mut self, new_max: i64) {
        self.identity.max_size_in_bytes = new_max;
    }

    pub fn policy(&self) -> Policy {
        self.identity.policy
    }

    pub fn cache_path(&self) -> &std::path::Path {
        &self.identity.cache_path
    }

    pub fn histogram(&self) -> &Histogram {
        &self.snapshot.histogram
    }

    /// Account for a newly inserted entry.
    pub fn add_entry(&mut self, size_bytes: u64) {
        self.snapshot.size += 1;
        self.snapshot.size_in_bytes += size_bytes;
        self.snapshot.histogram.increment(size_bytes);
    }

    /// Account for a removed entry.
    pub fn remove_entry(&mut self, size_bytes: u64) {
        self.snapshot.size = self.snapshot.size.saturating_sub(1);
        self.snapshot.size_in_bytes = self.snapshot.size_in_bytes.saturating_sub(size_bytes);
        self.snapshot.histogram.decrement(size_bytes);
    }

    /// Account for an entry whose record size changed in place (e.g. a
    /// `put_metadata` replacing metadata of a different length).
    pub fn resize_entry(&mut self, old_size_bytes: u64, new_size_bytes: u64) {
        self.snapshot.size_in_bytes = self
            .snapshot
            .size_in_bytes
            .saturating_sub(old_size_bytes)
            .saturating_add(new_size_bytes);
        self.snapshot.histogram.decrement(old_size_bytes);
        self.snapshot.histogram.increment(new_size_bytes);
    }

    pub fn record_ttl_eviction(&mut self) {
        self.snapshot.ttl_evictions += 1;
    }

    pub fn record_lru_eviction(&mut self) {
        self.snapshot.lru_evictions += 1;
    }

    /// Record a cache hit at `now_ms`: updates run-length counters and
    /// the most-recent-hit timestamp (spec.md 4.2).
    pub fn record_hit(&mut self, now_ms: i64) {
        self.snapshot.hits += 1;
        self.snapshot.hits_since_last_miss += 1;
        self.snapshot.misses_since_last_hit = 0;
        if self.snapshot.hits_since_last_miss > self.snapshot.longest_hit_run {
            self.snapshot.longest_hit_run = self.snapshot.hits_since_last_miss;
            self.snapshot.longest_hit_run_time_ms = Some(now_ms);
        }
        self.snapshot.last_hit_time_ms = Some(now_ms);
    }

    /// Record a cache miss at `now_ms`; symmetric with [`Stats::record_hit`].
    pub fn record_miss(&mut self, now_ms: i64) {
        self.snapshot.misses += 1;
        self.snapshot.misses_since_last_hit += 1;
        self.snapshot.hits_since_last_miss = 0;
        if self.snapshot.misses_since_last_hit > self.snapshot.longest_miss_run {
            self.snapshot.longest_miss_run = self.snapshot.misses_since_last_hit;
            self.snapshot.longest_miss_run_time_ms = Some(now_ms);
        }
        self.snapshot.last_miss_time_ms = Some(now_ms);
    }

    /// Reset hit/miss counters and run lengths. Leaves `size`,
    /// `size_in_bytes`, and the histogram untouched, since those reflect
    /// live content rather than history.
    pub fn clear_stats(&mut self) {
        let size = self.snapshot.size;
        let size_in_bytes = self.snapshot.size_in_bytes;
        let histogram = self.snapshot.histogram.clone();
        self.snapshot = StatsSnapshot {
            size,
            size_in_bytes,
            histogram,
            ..StatsSnapshot::default()
        };
    }

    /// Rebuild `size`, `size_in_bytes`, and the histogram from a dirty
    /// open's ATime-index scan (spec.md 3.1, 8 invariant 7); all other
    /// counters reset to zero since they were not flushed cleanly.
    pub fn rebuild_from_scan<I: IntoIterator<Item = u64>>(&mut self, sizes: I) {
        let mut total_bytes = 0u64;
        let mut count = 0u64;
        let histogram = Histogram::rebuild(sizes.into_iter().inspect(|size| {
            total_bytes += size;
            count += 1;
        }));
        self.snapshot = StatsSnapshot {
            size: count,
            size_in_bytes: total_bytes,
            histogram,
            ..StatsSnapshot::default()
        };
    }
}
