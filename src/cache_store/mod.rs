//! `CacheStore`: an LSM-backed persistent cache with size bounds, two
//! discard policies, auxiliary per-entry metadata, atomic read-or-load,
//! statistics, and event notifications (spec.md 4.3).
//!
//! Grounded on `caddy`'s `database::cache::CacheManager` for the overall
//! "own a `sled::Db`, guard mutation with one lock, track a stats
//! struct" shape, and on `enterprise::cache::invalidation` for the
//! "swallow a misbehaving handler" event-dispatch policy. The keyspace
//! multiplexing (one `sled::Db`, one-byte table prefixes, two
//! timestamp-ordered secondary indexes) is this crate's own schema,
//! specified in spec.md 3.1/6.1 and modeled closely on
//! `examples/original_source/src/core/internal/persistent_string_cache_impl.cpp`.

mod eviction;
mod schema;

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use sled::Db;

use crate::codec::{RecordHeader, SENTINEL_EXPIRY_MS};
use crate::error::{Result, ThumbError};
use crate::stats::{Stats, StatsSnapshot};

/// Discard policy for a cache, fixed at creation time (spec.md 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Policy {
    /// Entries never expire; eviction is strictly oldest-access-first.
    LruOnly,
    /// Entries carry a per-entry expiry; expired entries are invisible
    /// and reclaimed first on eviction.
    LruTtl,
}

impl Policy {
    fn to_byte(self) -> u8 {
        match self {
            Policy::LruOnly => b'0',
            Policy::LruTtl => b'1',
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'0' => Ok(Policy::LruOnly),
            b'1' => Ok(Policy::LruTtl),
            other => Err(ThumbError::StoreError(format!(
                "unrecognized persisted policy byte {other}"
            ))),
        }
    }
}

/// Bitmask values for [`CacheStore::set_handler`].
pub const EVENT_PUT: u32 = 1 << 0;
pub const EVENT_INVALIDATE: u32 = 1 << 1;
pub const EVENT_EVICT_TTL: u32 = 1 << 2;
pub const EVENT_EVICT_LRU: u32 = 1 << 3;
const EVENT_ALL: u32 = EVENT_PUT | EVENT_INVALIDATE | EVENT_EVICT_TTL | EVENT_EVICT_LRU;

/// A mutation the cache just completed, delivered to installed handlers
/// after the mutation is durable (spec.md 4.3).
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Put { key: Vec<u8> },
    Invalidate { key: Vec<u8> },
    EvictTtl { key: Vec<u8> },
    EvictLru { key: Vec<u8> },
}

impl CacheEvent {
    fn mask(&self) -> u32 {
        match self {
            CacheEvent::Put { .. } => EVENT_PUT,
            CacheEvent::Invalidate { .. } => EVENT_INVALIDATE,
            CacheEvent::EvictTtl { .. } => EVENT_EVICT_TTL,
            CacheEvent::EvictLru { .. } => EVENT_EVICT_LRU,
        }
    }
}

type EventHandler = Box<dyn Fn(&CacheEvent, &StatsSnapshot) + Send + Sync>;

struct State {
    stats: Stats,
    handlers: Vec<(u32, EventHandler)>,
}

/// A batch of data and metadata for a single entry, as returned by
/// `get_data`/`take_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryData {
    pub value: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// An embedded, persistent, single-writer key-value cache (spec.md 3.1).
pub struct CacheStore {
    name: String,
    path: PathBuf,
    db: Db,
    lock: ReentrantMutex<RefCell<State>>,
}

const BULK_INVALIDATE_BATCH_SIZE: usize = 500;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis() as i64
}

impl CacheStore {
    /// Create or open `path` as a cache bounded by `max_size_in_bytes`
    /// under `policy`. Fails with [`ThumbError::ConfigMismatch`] if an
    /// existing cache's persisted settings disagree, or
    /// [`ThumbError::InvalidArgument`] if `max_size_in_bytes <= 0`.
    pub fn open(path: impl AsRef<Path>, max_size_in_bytes: i64, policy: Policy) -> Result<Self> {
        if max_size_in_bytes <= 0 {
            return Err(ThumbError::InvalidArgument(
                "max_size_in_bytes must be positive".to_string(),
            ));
        }
        Self::open_inner(path, Some((max_size_in_bytes, policy)))
    }

    /// Open an existing cache, trusting its persisted settings. Fails
    /// with [`ThumbError::ConfigMismatch`] if `path` has no cache yet.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(path, None)
    }

    fn open_inner(path: impl AsRef<Path>, requested: Option<(i64, Policy)>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path).map_err(|e| ThumbError::from_sled(&path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string());

        let persisted_schema_version =
            read_settings_u32(&db, &path, schema::SETTINGS_SCHEMA_VERSION)?;
        let mut schema_needs_rewrite = false;
        if let Some(v) = persisted_schema_version {
            if v != schema::CURRENT_SCHEMA_VERSION {
                tracing::warn!(
                    cache = %name, persisted = v, current = schema::CURRENT_SCHEMA_VERSION,
                    "schema version mismatch, wiping cache tables"
                );
                // Wiping removes every Value/Data/Meta/ATime/ETime/Stats
                // row but deliberately leaves the `Y` settings rows alone
                // (spec.md 6.1), so the existing max_size_in_bytes/policy
                // are still read back below rather than re-derived from
                // `requested`.
                wipe_tables(&db).map_err(|e| ThumbError::from_sled(&path, e))?;
                schema_needs_rewrite = true;
            }
        }

        let (max_size_in_bytes, policy) = if persisted_schema_version.is_none() {
            let (max_size_in_bytes, policy) = requested.ok_or_else(|| {
                ThumbError::ConfigMismatch(format!("no existing cache at {}", path.display()))
            })?;
            db.insert(
                schema::SETTINGS_MAX_SIZE,
                max_size_in_bytes.to_string().as_bytes(),
            )
            .map_err(|e| ThumbError::from_sled(&path, e))?;
            db.insert(schema::SETTINGS_POLICY, &[policy.to_byte()][..])
                .map_err(|e| ThumbError::from_sled(&path, e))?;
            db.insert(
                schema::SETTINGS_SCHEMA_VERSION,
                schema::CURRENT_SCHEMA_VERSION.to_string().as_bytes(),
            )
            .map_err(|e| ThumbError::from_sled(&path, e))?;
            (max_size_in_bytes, policy)
        } else {
            let persisted_max = read_settings_i64(&db, &path, schema::SETTINGS_MAX_SIZE)?
                .ok_or_else(|| ThumbError::StoreError("missing MAX_SIZE setting".to_string()))?;
            let persisted_policy_byte =
                db.get(schema::SETTINGS_POLICY)
                    .map_err(|e| ThumbError::from_sled(&path, e))?
                    .ok_or_else(|| ThumbError::StoreError("missing POLICY setting".to_string()))?;
            let persisted_policy = Policy::from_byte(
                *persisted_policy_byte
                    .first()
                    .ok_or_else(|| ThumbError::StoreError("empty POLICY setting".to_string()))?,
            )?;
            if let Some((req_max, req_policy)) = requested {
                if req_max != persisted_max || req_policy != persisted_policy {
                    return Err(ThumbError::ConfigMismatch(format!(
                        "cache at {} was created with max_size_in_bytes={persisted_max} policy={persisted_policy:?}",
                        path.display()
                    )));
                }
            }
            if schema_needs_rewrite {
                db.insert(
                    schema::SETTINGS_SCHEMA_VERSION,
                    schema::CURRENT_SCHEMA_VERSION.to_string().as_bytes(),
                )
                .map_err(|e| ThumbError::from_sled(&path, e))?;
            }
            (persisted_max, persisted_policy)
        };

        let dirty = db
            .get(schema::DIRTY_FLAG_KEY)
            .map_err(|e| ThumbError::from_sled(&path, e))?
            .is_some();

        let mut stats = if dirty {
            tracing::warn!(cache = %name, "cache opened dirty, rebuilding stats from ATime index");
            let mut stats = Stats::new(path.clone(), max_size_in_bytes, policy);
            stats.rebuild_from_scan(scan_atime_sizes(&db)?);
            stats
        } else {
            match read_stats_snapshot(&db, &path)? {
                Some(snapshot) => Stats::from_snapshot(snapshot, path.clone(), max_size_in_bytes, policy),
                None => Stats::new(path.clone(), max_size_in_bytes, policy),
            }
        };
        stats.set_max_size_in_bytes(max_size_in_bytes);

        db.insert(schema::DIRTY_FLAG_KEY, b"1" as &[u8])
            .map_err(|e| ThumbError::from_sled(&path, e))?;

        tracing::info!(cache = %name, path = %path.display(), ?policy, max_size_in_bytes, "cache opened");

        Ok(Self {
            name,
            path,
            db,
            lock: ReentrantMutex::new(RefCell::new(State {
                stats,
                handlers: Vec::new(),
            })),
        })
    }

    /// Human-readable label (the cache directory's final path segment)
    /// used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A point-in-time snapshot of this cache's statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let guard = self.lock.lock();
        guard.borrow().stats.snapshot()
    }

    /// Reset hit/miss counters and run lengths (spec.md 4.2).
    pub fn clear_stats(&self) {
        let guard = self.lock.lock();
        guard.borrow_mut().stats.clear_stats();
    }

    /// Install a callback invoked synchronously, on the caller's thread,
    /// after every mutation matching `event_mask` completes. A panicking
    /// handler is caught and logged, never propagated.
    pub fn set_handler(
        &self,
        event_mask: u32,
        handler: impl Fn(&CacheEvent, &StatsSnapshot) + Send + Sync + 'static,
    ) -> Result<()> {
        if event_mask == 0 || event_mask & !EVENT_ALL != 0 {
            return Err(ThumbError::InvalidArgument(format!(
                "event_mask {event_mask:#x} is zero or out of range"
            )));
        }
        let guard = self.lock.lock();
        guard.borrow_mut().handlers.push((event_mask, Box::new(handler)));
        Ok(())
    }

    fn fire(&self, state: &State, events: &[CacheEvent]) {
        if events.is_empty() || state.handlers.is_empty() {
            return;
        }
        let snapshot = state.stats.snapshot();
        for event in events {
            for (mask, handler) in &state.handlers {
                if mask & event.mask() == 0 {
                    continue;
                }
                let result = catch_unwind(AssertUnwindSafe(|| handler(event, &snapshot)));
                if result.is_err() {
                    tracing::warn!(cache = %self.name, "event handler panicked, ignoring");
                }
            }
        }
    }

    fn read_header(&self, key: &[u8]) -> Result<Option<RecordHeader>> {
        match self
            .db
            .get(schema::data_key(key))
            .map_err(|e| ThumbError::from_sled(&self.path, e))?
        {
            Some(raw) => Ok(Some(RecordHeader::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn read_metadata(&self, key: &[u8]) -> Result<Vec<u8>> {
        Ok(self
            .db
            .get(schema::meta_key(key))
            .map_err(|e| ThumbError::from_sled(&self.path, e))?
            .map(|v| v.to_vec())
            .unwrap_or_default())
    }

    fn require_nonempty(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            Err(ThumbError::InvalidArgument("key must not be empty".to_string()))
        } else {
            Ok(())
        }
    }

    /// Look up `key`. Refreshes its access time on a hit; counts a hit
    /// or a miss (spec.md 4.3).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::require_nonempty(key)?;
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let now = now_ms();
        let header = match self.read_header(key)? {
            Some(h) if !h.is_expired_at(now) => h,
            _ => {
                state.stats.record_miss(now);
                return Ok(None);
            }
        };
        let value = match self
            .db
            .get(schema::value_key(key))
            .map_err(|e| ThumbError::from_sled(&self.path, e))?
        {
            Some(v) => v.to_vec(),
            None => {
                state.stats.record_miss(now);
                return Ok(None);
            }
        };
        self.refresh_access_time(key, &header, now)?;
        state.stats.record_hit(now);
        Ok(Some(value))
    }

    /// As [`CacheStore::get`], but also returns metadata (empty if
    /// none was set).
    pub fn get_data(&self, key: &[u8]) -> Result<Option<EntryData>> {
        Self::require_nonempty(key)?;
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let now = now_ms();
        let header = match self.read_header(key)? {
            Some(h) if !h.is_expired_at(now) => h,
            _ => {
                state.stats.record_miss(now);
                return Ok(None);
            }
        };
        let value = match self
            .db
            .get(schema::value_key(key))
            .map_err(|e| ThumbError::from_sled(&self.path, e))?
        {
            Some(v) => v.to_vec(),
            None => {
                state.stats.record_miss(now);
                return Ok(None);
            }
        };
        let metadata = self.read_metadata(key)?;
        self.refresh_access_time(key, &header, now)?;
        state.stats.record_hit(now);
        Ok(Some(EntryData { value, metadata }))
    }

    /// As [`CacheStore::get_data`], but does not refresh the access time
    /// and is not counted as a hit or a miss.
    pub fn get_metadata(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::require_nonempty(key)?;
        let _guard = self.lock.lock();
        let now = now_ms();
        match self.read_header(key)? {
            Some(h) if !h.is_expired_at(now) => Ok(Some(self.read_metadata(key)?)),
            _ => Ok(None),
        }
    }

    /// Whether `key` exists and is not expired. Does not update access
    /// time or count as a hit/miss.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Self::require_nonempty(key)?;
        let _guard = self.lock.lock();
        let now = now_ms();
        Ok(matches!(self.read_header(key)?, Some(h) if !h.is_expired_at(now)))
    }

    fn refresh_access_time(&self, key: &[u8], header: &RecordHeader, now: i64) -> Result<()> {
        let mut batch = sled::Batch::default();
        batch.remove(schema::atime_key(header.access_time_ms, key));
        batch.insert(
            schema::atime_key(now, key),
            header.record_size.to_string().into_bytes(),
        );
        let updated = RecordHeader {
            access_time_ms: now,
            ..*header
        };
        batch.insert(schema::data_key(key), updated.encode());
        self.db
            .apply_batch(batch)
            .map_err(|e| ThumbError::from_sled(&self.path, e))
    }

    /// Insert or overwrite `key`. Rejects oversized records, non-sentinel
    /// expiries under strict LRU, and already-expired entries
    /// (spec.md 4.3).
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        metadata: Option<&[u8]>,
        expiry_ms: i64,
    ) -> Result<()> {
        Self::require_nonempty(key)?;
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let policy = state.stats.policy();
        if policy == Policy::LruOnly && expiry_ms != SENTINEL_EXPIRY_MS {
            return Err(ThumbError::ConfigMismatch(
                "non-sentinel expiry is not allowed under the lru_only policy".to_string(),
            ));
        }
        let now = now_ms();
        if expiry_ms != SENTINEL_EXPIRY_MS && expiry_ms <= now {
            return Err(ThumbError::InvalidArgument(
                "cannot put an already-expired entry".to_string(),
            ));
        }
        let meta_len = metadata.map_or(0, |m| m.len());
        let record_size = (key.len() + value.len() + meta_len) as i64;
        let max = state.stats.max_size_in_bytes();
        if record_size > max {
            return Err(ThumbError::InvalidArgument(format!(
                "record size {record_size} exceeds max_size_in_bytes {max}"
            )));
        }

        let existing = self.read_header(key)?;
        let old_size = existing.map_or(0, |h| h.record_size);
        let growth = record_size - old_size;
        let free = max - state.stats.size_in_bytes() as i64;
        let bytes_needed = growth - free;
        let outcome =
            eviction::evict(&self.db, policy, now, bytes_needed, Some(key)).map_err(|e| {
                self.wrap_store_error(e)
            })?;

        let mut batch = outcome.batch;
        if let Some(h) = existing {
            batch.remove(schema::atime_key(h.access_time_ms, key));
            if !h.is_sentinel_expiry() {
                batch.remove(schema::etime_key(h.expiry_time_ms, key));
            }
            if metadata.is_none() {
                batch.remove(schema::meta_key(key));
            }
        }
        batch.insert(schema::value_key(key), value);
        let header = RecordHeader {
            access_time_ms: now,
            expiry_time_ms: expiry_ms,
            record_size,
        };
        batch.insert(schema::data_key(key), header.encode());
        batch.insert(
            schema::atime_key(now, key),
            record_size.to_string().into_bytes(),
        );
        if policy == Policy::LruTtl && expiry_ms != SENTINEL_EXPIRY_MS {
            batch.insert(
                schema::etime_key(expiry_ms, key),
                record_size.to_string().into_bytes(),
            );
        }
        if let Some(m) = metadata {
            batch.insert(schema::meta_key(key), m);
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| ThumbError::from_sled(&self.path, e))?;

        if existing.is_some() {
            state.stats.resize_entry(old_size as u64, record_size as u64);
        } else {
            state.stats.add_entry(record_size as u64);
        }
        let mut events = Vec::with_capacity(outcome.evicted.len() + 1);
        for evicted in &outcome.evicted {
            state.stats.remove_entry(evicted.record_size);
            if evicted.via_ttl {
                state.stats.record_ttl_eviction();
                events.push(CacheEvent::EvictTtl {
                    key: evicted.user_key.clone(),
                });
            } else {
                state.stats.record_lru_eviction();
                events.push(CacheEvent::EvictLru {
                    key: evicted.user_key.clone(),
                });
            }
        }
        events.push(CacheEvent::Put { key: key.to_vec() });
        self.fire(&state, &events);
        Ok(())
    }

    fn wrap_store_error(&self, err: ThumbError) -> ThumbError {
        match err {
            ThumbError::StoreError(msg) => ThumbError::StoreError(format!("{}: {msg}", self.name)),
            other => other,
        }
    }

    /// Replace the metadata of an existing, unexpired entry. Fails if no
    /// such entry exists. Never evicts the entry being modified, but may
    /// evict others to make room for a larger metadata payload.
    pub fn put_metadata(&self, key: &[u8], metadata: &[u8]) -> Result<()> {
        Self::require_nonempty(key)?;
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let now = now_ms();
        let header = self
            .read_header(key)?
            .filter(|h| !h.is_expired_at(now))
            .ok_or_else(|| ThumbError::InvalidArgument("no such entry".to_string()))?;

        let new_size = header.record_size - old_metadata_len(&self.db, &self.path, key)?
            + metadata.len() as i64;
        let max = state.stats.max_size_in_bytes();
        if new_size > max {
            return Err(ThumbError::InvalidArgument(format!(
                "record size {new_size} exceeds max_size_in_bytes {max}"
            )));
        }
        let growth = new_size - header.record_size;
        let free = max - state.stats.size_in_bytes() as i64;
        let bytes_needed = growth - free;
        let outcome = eviction::evict(&self.db, state.stats.policy(), now, bytes_needed, Some(key))?;

        let mut batch = outcome.batch;
        batch.insert(schema::meta_key(key), metadata);
        let new_header = RecordHeader {
            record_size: new_size,
            ..header
        };
        batch.insert(schema::data_key(key), new_header.encode());
        batch.insert(
            schema::atime_key(header.access_time_ms, key),
            new_size.to_string().into_bytes(),
        );
        if !header.is_sentinel_expiry() {
            batch.insert(
                schema::etime_key(header.expiry_time_ms, key),
                new_size.to_string().into_bytes(),
            );
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| ThumbError::from_sled(&self.path, e))?;

        state.stats.resize_entry(header.record_size as u64, new_size as u64);
        let mut events = Vec::with_capacity(outcome.evicted.len() + 1);
        for evicted in &outcome.evicted {
            state.stats.remove_entry(evicted.record_size);
            if evicted.via_ttl {
                state.stats.record_ttl_eviction();
                events.push(CacheEvent::EvictTtl { key: evicted.user_key.clone() });
            } else {
                state.stats.record_lru_eviction();
                events.push(CacheEvent::EvictLru { key: evicted.user_key.clone() });
            }
        }
        events.push(CacheEvent::Put { key: key.to_vec() });
        self.fire(&state, &events);
        Ok(())
    }

    /// Atomic get-and-remove. An expired entry is returned as absent and
    /// is also deleted as a side effect.
    pub fn take(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.take_data(key)?.map(|d| d.value))
    }

    /// As [`CacheStore::take`], also returning metadata.
    pub fn take_data(&self, key: &[u8]) -> Result<Option<EntryData>> {
        Self::require_nonempty(key)?;
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let now = now_ms();
        let header = match self.read_header(key)? {
            Some(h) => h,
            None => return Ok(None),
        };
        let was_live = !header.is_expired_at(now);
        let value = self
            .db
            .get(schema::value_key(key))
            .map_err(|e| ThumbError::from_sled(&self.path, e))?
            .map(|v| v.to_vec())
            .unwrap_or_default();
        let metadata = self.read_metadata(key)?;

        let mut batch = sled::Batch::default();
        batch.remove(schema::value_key(key));
        batch.remove(schema::data_key(key));
        batch.remove(schema::meta_key(key));
        batch.remove(schema::atime_key(header.access_time_ms, key));
        if !header.is_sentinel_expiry() {
            batch.remove(schema::etime_key(header.expiry_time_ms, key));
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| ThumbError::from_sled(&self.path, e))?;

        state.stats.remove_entry(header.record_size as u64);
        if was_live {
            self.fire(&state, &[CacheEvent::Invalidate { key: key.to_vec() }]);
            Ok(Some(EntryData { value, metadata }))
        } else {
            Ok(None)
        }
    }

    /// Delete one entry, if it exists.
    pub fn invalidate(&self, key: &[u8]) -> Result<()> {
        self.invalidate_many(std::slice::from_ref(&key.to_vec()))
    }

    /// Delete many entries atomically (a single write batch).
    pub fn invalidate_many(&self, keys: &[Vec<u8>]) -> Result<()> {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let mut batch = sled::Batch::default();
        let mut events = Vec::new();
        for key in keys {
            let header = match self.read_header(key)? {
                Some(h) => h,
                None => continue,
            };
            batch.remove(schema::value_key(key));
            batch.remove(schema::data_key(key));
            batch.remove(schema::meta_key(key));
            batch.remove(schema::atime_key(header.access_time_ms, key));
            if !header.is_sentinel_expiry() {
                batch.remove(schema::etime_key(header.expiry_time_ms, key));
            }
            state.stats.remove_entry(header.record_size as u64);
            events.push(CacheEvent::Invalidate { key: key.clone() });
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| ThumbError::from_sled(&self.path, e))?;
        self.fire(&state, &events);
        Ok(())
    }

    /// Delete every entry, in batches of a fixed size, firing an
    /// `Invalidate` event per deleted entry (spec.md 4.3).
    pub fn invalidate_all(&self) -> Result<()> {
        loop {
            let guard = self.lock.lock();
            let mut state = guard.borrow_mut();
            let (lo, hi) = schema::prefix_range(schema::PREFIX_ATIME);
            let chunk: Vec<Vec<u8>> = self
                .db
                .range(lo..hi)
                .take(BULK_INVALIDATE_BATCH_SIZE)
                .map(|item| {
                    let (index_key, _) = item.map_err(|e| ThumbError::from_sled(&self.path, e))?;
                    let (_time, user_key) = crate::codec::decode_time_key(&index_key[1..])?;
                    Ok(user_key.to_vec())
                })
                .collect::<Result<_>>()?;
            if chunk.is_empty() {
                return Ok(());
            }
            let mut batch = sled::Batch::default();
            let mut events = Vec::with_capacity(chunk.len());
            for key in &chunk {
                if let Some(header) = self.read_header(key)? {
                    batch.remove(schema::value_key(key));
                    batch.remove(schema::data_key(key));
                    batch.remove(schema::meta_key(key));
                    batch.remove(schema::atime_key(header.access_time_ms, key));
                    if !header.is_sentinel_expiry() {
                        batch.remove(schema::etime_key(header.expiry_time_ms, key));
                    }
                    state.stats.remove_entry(header.record_size as u64);
                    events.push(CacheEvent::Invalidate { key: key.clone() });
                }
            }
            self.db
                .apply_batch(batch)
                .map_err(|e| ThumbError::from_sled(&self.path, e))?;
            self.fire(&state, &events);
        }
    }

    /// Set access time to now and expiry as specified. Fails with
    /// [`ThumbError::ConfigMismatch`] for a non-sentinel expiry under
    /// the `lru_only` policy.
    pub fn touch(&self, key: &[u8], expiry_ms: i64) -> Result<()> {
        Self::require_nonempty(key)?;
        let guard = self.lock.lock();
        let state = guard.borrow();
        if state.stats.policy() == Policy::LruOnly && expiry_ms != SENTINEL_EXPIRY_MS {
            return Err(ThumbError::ConfigMismatch(
                "non-sentinel expiry is not allowed under the lru_only policy".to_string(),
            ));
        }
        drop(state);
        let now = now_ms();
        let header = self
            .read_header(key)?
            .filter(|h| !h.is_expired_at(now))
            .ok_or_else(|| ThumbError::InvalidArgument("no such entry".to_string()))?;

        let mut batch = sled::Batch::default();
        batch.remove(schema::atime_key(header.access_time_ms, key));
        batch.insert(
            schema::atime_key(now, key),
            header.record_size.to_string().into_bytes(),
        );
        if !header.is_sentinel_expiry() {
            batch.remove(schema::etime_key(header.expiry_time_ms, key));
        }
        let new_header = RecordHeader {
            access_time_ms: now,
            expiry_time_ms: expiry_ms,
            ..header
        };
        if new_header.expiry_time_ms != SENTINEL_EXPIRY_MS {
            batch.insert(
                schema::etime_key(expiry_ms, key),
                header.record_size.to_string().into_bytes(),
            );
        }
        batch.insert(schema::data_key(key), new_header.encode());
        self.db
            .apply_batch(batch)
            .map_err(|e| ThumbError::from_sled(&self.path, e))
    }

    /// Shrink or grow the size bound. Shrinking evicts down to the new
    /// bound first; growing never touches existing entries.
    pub fn resize(&self, new_max_size_in_bytes: i64) -> Result<()> {
        if new_max_size_in_bytes <= 0 {
            return Err(ThumbError::InvalidArgument(
                "max_size_in_bytes must be positive".to_string(),
            ));
        }
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let now = now_ms();
        let current_bytes = state.stats.size_in_bytes() as i64;
        if current_bytes > new_max_size_in_bytes {
            let outcome = eviction::evict(
                &self.db,
                state.stats.policy(),
                now,
                current_bytes - new_max_size_in_bytes,
                None,
            )?;
            self.db
                .apply_batch(outcome.batch)
                .map_err(|e| ThumbError::from_sled(&self.path, e))?;
            let mut events = Vec::with_capacity(outcome.evicted.len());
            for evicted in &outcome.evicted {
                state.stats.remove_entry(evicted.record_size);
                if evicted.via_ttl {
                    state.stats.record_ttl_eviction();
                    events.push(CacheEvent::EvictTtl { key: evicted.user_key.clone() });
                } else {
                    state.stats.record_lru_eviction();
                    events.push(CacheEvent::EvictLru { key: evicted.user_key.clone() });
                }
            }
            self.fire(&state, &events);
        }
        state.stats.set_max_size_in_bytes(new_max_size_in_bytes);
        self.db
            .insert(
                schema::SETTINGS_MAX_SIZE,
                new_max_size_in_bytes.to_string().as_bytes(),
            )
            .map_err(|e| ThumbError::from_sled(&self.path, e))?;
        Ok(())
    }

    /// Evict, using the normal algorithm, until `size_in_bytes <=
    /// target_bytes`. Unlike [`CacheStore::resize`], does not change the
    /// configured bound.
    pub fn trim_to(&self, target_bytes: i64) -> Result<()> {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        let now = now_ms();
        let current_bytes = state.stats.size_in_bytes() as i64;
        if current_bytes <= target_bytes {
            return Ok(());
        }
        let outcome = eviction::evict(
            &self.db,
            state.stats.policy(),
            now,
            current_bytes - target_bytes,
            None,
        )?;
        self.db
            .apply_batch(outcome.batch)
            .map_err(|e| ThumbError::from_sled(&self.path, e))?;
        let mut events = Vec::with_capacity(outcome.evicted.len());
        for evicted in &outcome.evicted {
            state.stats.remove_entry(evicted.record_size);
            if evicted.via_ttl {
                state.stats.record_ttl_eviction();
                events.push(CacheEvent::EvictTtl { key: evicted.user_key.clone() });
            } else {
                state.stats.record_lru_eviction();
                events.push(CacheEvent::EvictLru { key: evicted.user_key.clone() });
            }
        }
        self.fire(&state, &events);
        Ok(())
    }

    /// Request underlying-store compaction. sled self-manages its log
    /// structure, so this is observationally a no-op beyond flushing to
    /// disk (spec.md 8: "`compact()` is observationally a no-op").
    pub fn compact(&self) -> Result<()> {
        self.db.flush().map_err(|e| ThumbError::from_sled(&self.path, e))?;
        Ok(())
    }

    /// Atomic read-or-load: on a hit, returns the value; on a miss,
    /// invokes `loader`, which is expected to call [`CacheStore::put`]
    /// for this same key, then returns whatever is now stored (absent,
    /// without error, if the loader did not call `put` — spec.md 9,
    /// open question (iii)).
    ///
    /// The cache's exclusive lock is held for the whole call, including
    /// the loader invocation; the loader may re-enter this same cache's
    /// `put`/`get`, but must not call any other cache's operations from
    /// within the loader (doing so could deadlock against that cache's
    /// own lock).
    pub fn get_or_put<F>(&self, key: &[u8], loader: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>,
    {
        let _outer_guard = self.lock.lock();
        if let Some(value) = self.get(key)? {
            return Ok(Some(value));
        }
        loader().map_err(|e| ThumbError::LoaderError(e.to_string()))?;
        self.get(key)
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        let guard = self.lock.lock();
        let state = guard.borrow();
        if let Err(e) = write_stats_snapshot(&self.db, &state.stats.snapshot()) {
            tracing::warn!(cache = %self.name, error = %e, "failed to persist stats on close");
        }
        drop(state);
        if let Err(e) = self.db.remove(schema::DIRTY_FLAG_KEY) {
            tracing::warn!(cache = %self.name, error = %e, "failed to clear dirty flag on close");
        }
        let _ = self.db.flush();
        tracing::info!(cache = %self.name, "cache closed");
    }
}

fn old_metadata_len(db: &Db, path: &Path, key: &[u8]) -> Result<i64> {
    Ok(db
        .get(schema::meta_key(key))
        .map_err(|e| ThumbError::from_sled(path, e))?
        .map(|v| v.len() as i64)
        .unwrap_or(0))
}

fn read_settings_i64(db: &Db, path: &Path, setting_key: &[u8]) -> Result<Option<i64>> {
    match db.get(setting_key).map_err(|e| ThumbError::from_sled(path, e))? {
        Some(raw) => {
            let text = std::str::from_utf8(&raw)
                .map_err(|e| ThumbError::StoreError(format!("non-utf8 setting: {e}")))?;
            Ok(Some(text.parse().map_err(|e| {
                ThumbError::StoreError(format!("malformed setting: {e}"))
            })?))
        }
        None => Ok(None),
    }
}

fn read_settings_u32(db: &Db, path: &Path, setting_key: &[u8]) -> Result<Option<u32>> {
    Ok(read_settings_i64(db, path, setting_key)?.map(|v| v as u32))
}

fn read_stats_snapshot(db: &Db, path: &Path) -> Result<Option<StatsSnapshot>> {
    match db
        .get(schema::STATS_VALUES_KEY)
        .map_err(|e| ThumbError::from_sled(path, e))?
    {
        Some(raw) => Ok(Some(bincode::deserialize(&raw).map_err(|e| {
            ThumbError::StoreError(format!("malformed stats snapshot: {e}"))
        })?)),
        None => Ok(None),
    }
}

fn write_stats_snapshot(db: &Db, snapshot: &StatsSnapshot) -> Result<()> {
    let encoded = bincode::serialize(snapshot)
        .map_err(|e| ThumbError::StoreError(format!("failed to serialize stats: {e}")))?;
    db.insert(schema::STATS_VALUES_KEY, encoded)
        .map_err(|e| ThumbError::from_sled(Path::new(""), e))?;
    Ok(())
}

fn scan_atime_sizes(db: &Db) -> Result<Vec<u64>> {
    let (lo, hi) = schema::prefix_range(schema::PREFIX_ATIME);
    let mut sizes = Vec::new();
    for item in db.range(lo..hi) {
        let (_, value) = item?;
        let text = std::str::from_utf8(&value)
            .map_err(|e| ThumbError::StoreError(format!("non-utf8 atime index value: {e}")))?;
        let size: u64 = text
            .parse()
            .map_err(|e| ThumbError::StoreError(format!("malformed atime index value: {e}")))?;
        sizes.push(size);
    }
    Ok(sizes)
}

fn wipe_tables(db: &Db) -> std::result::Result<(), sled::Error> {
    for prefix in [
        schema::PREFIX_VALUE,
        schema::PREFIX_DATA,
        schema::PREFIX_META,
        schema::PREFIX_ATIME,
        schema::PREFIX_ETIME,
        schema::PREFIX_STATS,
    ] {
        let (lo, hi) = schema::prefix_range(prefix);
        let keys: Vec<_> = db
            .range(lo..hi)
            .keys()
            .collect::<std::result::Result<Vec<_>, sled::Error>>()?;
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key);
        }
        db.apply_batch(batch)?;
    }
    Ok(())
}

pub use eviction::Evicted;

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp(max: i64, policy: Policy) -> (CacheStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path(), max, policy).unwrap();
        (cache, dir)
    }

    /// Scenario 1 (spec.md 8): new cache, one empty-value put.
    #[test]
    fn scenario_put_and_get_empty_value() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        cache.put(b"e", b"", None, SENTINEL_EXPIRY_MS).unwrap();
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.stats().size_in_bytes, 1);
        assert_eq!(cache.get(b"e").unwrap(), Some(Vec::new()));
    }

    /// Scenario 2 (spec.md 8): take removes, contains reflects the rest.
    #[test]
    fn scenario_take_removes_single_entry() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        cache.put(b"1", b"v1", None, SENTINEL_EXPIRY_MS).unwrap();
        cache.put(b"2", b"v2", None, SENTINEL_EXPIRY_MS).unwrap();
        assert_eq!(cache.take(b"1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(cache.stats().size, 1);
        assert!(cache.contains(b"2").unwrap());
    }

    /// Scenario 3 (spec.md 8): trim_to reaps an already-expired entry
    /// before touching anything else.
    #[test]
    fn scenario_trim_to_reaps_expired_before_lru() {
        let (cache, _dir) = open_tmp(3 * 1024, Policy::LruTtl);
        let now = now_ms();
        let val = vec![0u8; 1023]; // key len 1 + value len 1023 = 1024 bytes
        cache.put(b"a", &val, None, SENTINEL_EXPIRY_MS).unwrap();
        cache.put(b"b", &val, None, now + 100).unwrap();
        cache.put(b"c", &val, None, SENTINEL_EXPIRY_MS).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(150));
        cache.trim_to(2 * 1024).unwrap();
        assert_eq!(cache.stats().size, 2);
        assert!(!cache.contains(b"b").unwrap());
        assert!(cache.contains(b"a").unwrap());
        assert!(cache.contains(b"c").unwrap());
    }

    /// Scenario 4 (spec.md 8): a refreshed entry survives LRU eviction.
    #[test]
    fn scenario_get_refresh_changes_eviction_order() {
        let (cache, _dir) = open_tmp(3 * 1024, Policy::LruOnly);
        let val = vec![0u8; 1023];
        cache.put(b"a", &val, None, SENTINEL_EXPIRY_MS).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put(b"b", &val, None, SENTINEL_EXPIRY_MS).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.put(b"c", &val, None, SENTINEL_EXPIRY_MS).unwrap();
        cache.get(b"a").unwrap();
        cache.trim_to(2 * 1024).unwrap();
        assert!(cache.contains(b"a").unwrap());
        assert!(!cache.contains(b"b").unwrap());
        assert!(cache.contains(b"c").unwrap());
    }

    #[test]
    fn put_rejects_oversized_record() {
        let (cache, _dir) = open_tmp(4, Policy::LruOnly);
        let err = cache.put(b"k", b"toolong", None, SENTINEL_EXPIRY_MS).unwrap_err();
        assert!(matches!(err, ThumbError::InvalidArgument(_)));
    }

    #[test]
    fn put_rejects_non_sentinel_expiry_under_lru_only() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        let err = cache.put(b"k", b"v", None, now_ms() + 10_000).unwrap_err();
        assert!(matches!(err, ThumbError::ConfigMismatch(_)));
    }

    #[test]
    fn put_rejects_already_expired_entry() {
        let (cache, _dir) = open_tmp(1024, Policy::LruTtl);
        let err = cache.put(b"k", b"v", None, 1).unwrap_err();
        assert!(matches!(err, ThumbError::InvalidArgument(_)));
    }

    #[test]
    fn reopen_with_mismatched_settings_fails() {
        let dir = tempfile::tempdir().unwrap();
        {
            CacheStore::open(dir.path(), 1024, Policy::LruOnly).unwrap();
        }
        let err = CacheStore::open(dir.path(), 2048, Policy::LruOnly).unwrap_err();
        assert!(matches!(err, ThumbError::ConfigMismatch(_)));
    }

    #[test]
    fn put_metadata_replaces_without_evicting_the_modified_entry() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        cache.put(b"k", b"v", None, SENTINEL_EXPIRY_MS).unwrap();
        cache.put_metadata(b"k", b"meta").unwrap();
        let data = cache.get_data(b"k").unwrap().unwrap();
        assert_eq!(data.value, b"v");
        assert_eq!(data.metadata, b"meta");
    }

    #[test]
    fn put_metadata_fails_without_existing_entry() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        let err = cache.put_metadata(b"missing", b"meta").unwrap_err();
        assert!(matches!(err, ThumbError::InvalidArgument(_)));
    }

    #[test]
    fn touch_preserves_value_and_changes_only_times() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        cache.put(b"k", b"v", Some(b"m"), SENTINEL_EXPIRY_MS).unwrap();
        cache.touch(b"k", SENTINEL_EXPIRY_MS).unwrap();
        let data = cache.get_data(b"k").unwrap().unwrap();
        assert_eq!(data.value, b"v");
        assert_eq!(data.metadata, b"m");
    }

    #[test]
    fn resize_growing_leaves_entries_untouched() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        cache.put(b"k", &vec![0u8; 500], None, SENTINEL_EXPIRY_MS).unwrap();
        cache.resize(2048).unwrap();
        cache.resize(4096).unwrap();
        assert!(cache.contains(b"k").unwrap());
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn get_or_put_invokes_loader_only_on_miss() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        let loads = std::sync::atomic::AtomicUsize::new(0);
        let load = |cache: &CacheStore| {
            cache
                .get_or_put(b"k", || {
                    loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    cache.put(b"k", b"computed", None, SENTINEL_EXPIRY_MS)?;
                    Ok(())
                })
                .unwrap()
        };
        assert_eq!(load(&cache), Some(b"computed".to_vec()));
        assert_eq!(load(&cache), Some(b"computed".to_vec()));
        assert_eq!(loads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn get_or_put_returns_absent_if_loader_skips_put() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        let result = cache
            .get_or_put(b"k", || Ok::<(), Box<dyn std::error::Error + Send + Sync>>(()))
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn invalidate_all_removes_everything_in_batches() {
        let (cache, _dir) = open_tmp(1024 * 1024, Policy::LruOnly);
        for i in 0..10u32 {
            cache
                .put(i.to_string().as_bytes(), b"v", None, SENTINEL_EXPIRY_MS)
                .unwrap();
        }
        cache.invalidate_all().unwrap();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn clean_close_then_reopen_preserves_stats() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheStore::open(dir.path(), 1024, Policy::LruOnly).unwrap();
            cache.put(b"k", b"v", None, SENTINEL_EXPIRY_MS).unwrap();
            cache.get(b"k").unwrap();
        }
        let cache = CacheStore::open(dir.path(), 1024, Policy::LruOnly).unwrap();
        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn set_handler_rejects_zero_or_out_of_range_mask() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        assert!(cache.set_handler(0, |_, _| {}).is_err());
        assert!(cache.set_handler(1 << 31, |_, _| {}).is_err());
    }

    #[test]
    fn put_fires_handler_with_snapshot() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen2 = seen.clone();
        cache
            .set_handler(EVENT_PUT, move |event, _snapshot| {
                if matches!(event, CacheEvent::Put { .. }) {
                    seen2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
            .unwrap();
        cache.put(b"k", b"v", None, SENTINEL_EXPIRY_MS).unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn misbehaving_handler_does_not_break_put() {
        let (cache, _dir) = open_tmp(1024, Policy::LruOnly);
        cache
            .set_handler(EVENT_PUT, |_, _| panic!("misbehaving handler"))
            .unwrap();
        assert!(cache.put(b"k", b"v", None, SENTINEL_EXPIRY_MS).is_ok());
    }
}
