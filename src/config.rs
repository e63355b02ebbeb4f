//! Process-wide tunables, discovered at startup (spec.md 2 Config
//! component; SPEC_FULL.md 4.9).
//!
//! Grounded on `enterprise`'s `EnterpriseConfig::from_file`/`save`
//! pattern: a `serde`-derived struct persisted as JSON, with
//! `THUMBCACHE_*` environment overrides layered on top the same way
//! `src/main.rs` reads `RUST_LOG` via `std::env::var(...).unwrap_or_else(...)`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache_store::Policy;
use crate::error::{Result, ThumbError};

/// Settings for one of the three composed caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub max_size_in_bytes: i64,
    pub policy: Policy,
}

/// Process-wide configuration (spec.md 2, 7; SPEC_FULL.md 4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub image_cache: CacheConfig,
    pub thumbnail_cache: CacheConfig,
    pub failure_cache: CacheConfig,
    pub local_parallelism: usize,
    pub remote_parallelism: usize,
    pub default_extraction_timeout_ms: u64,
    pub not_found_ttl_ms: i64,
    pub hard_error_ttl_ms: i64,
    pub retry_attempt_limit: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
    pub full_size_image_long_edge: u32,
    pub full_size_audio_bounds: (u32, u32),
}

/// Default failure-cache TTL for `NotFound` results: 2 hours
/// (spec.md 7; an inferred default per spec.md 9 open question (ii)).
const DEFAULT_NOT_FOUND_TTL_MS: i64 = 2 * 60 * 60 * 1000;
/// Default failure-cache TTL for `HardError` results: 1 day.
const DEFAULT_HARD_ERROR_TTL_MS: i64 = 24 * 60 * 60 * 1000;
/// Default full-size envelope: 1920px on the long edge for images/video.
const DEFAULT_FULL_SIZE_IMAGE_LONG_EDGE: u32 = 1920;
/// Default full-size envelope for audio (embedded cover art): 200x200.
const DEFAULT_FULL_SIZE_AUDIO_BOUNDS: (u32, u32) = (200, 200);
/// Default per-extractor deadline (spec.md 4.5: "default 10 s").
const DEFAULT_EXTRACTION_TIMEOUT_MS: u64 = 10_000;

impl Config {
    /// Build a config rooted at `base_dir`, with the cache sizes and
    /// policies a fresh install would use.
    pub fn with_defaults_under(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref();
        Config {
            image_cache: CacheConfig {
                path: base_dir.join("image"),
                max_size_in_bytes: 200 * 1024 * 1024,
                policy: Policy::LruOnly,
            },
            thumbnail_cache: CacheConfig {
                path: base_dir.join("thumbnail"),
                max_size_in_bytes: 100 * 1024 * 1024,
                policy: Policy::LruOnly,
            },
            failure_cache: CacheConfig {
                path: base_dir.join("failure"),
                max_size_in_bytes: 8 * 1024 * 1024,
                policy: Policy::LruTtl,
            },
            local_parallelism: crate::rate_limiter::default_local_parallelism(),
            remote_parallelism: crate::rate_limiter::DEFAULT_REMOTE_PARALLELISM,
            default_extraction_timeout_ms: DEFAULT_EXTRACTION_TIMEOUT_MS,
            not_found_ttl_ms: DEFAULT_NOT_FOUND_TTL_MS,
            hard_error_ttl_ms: DEFAULT_HARD_ERROR_TTL_MS,
            retry_attempt_limit: 3,
            retry_backoff_base_ms: 200,
            retry_backoff_cap_ms: 5_000,
            full_size_image_long_edge: DEFAULT_FULL_SIZE_IMAGE_LONG_EDGE,
            full_size_audio_bounds: DEFAULT_FULL_SIZE_AUDIO_BOUNDS,
        }
    }

    /// Load from a JSON file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ThumbError::InvalidArgument(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ThumbError::InvalidArgument(format!("malformed config at {}: {e}", path.display())))
    }

    /// Persist as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| ThumbError::StoreError(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, text)
            .map_err(|e| ThumbError::StoreError(format!("cannot write {}: {e}", path.display())))
    }

    /// Apply `THUMBCACHE_*` environment overrides on top of this config.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_u64("THUMBCACHE_EXTRACTION_TIMEOUT_MS") {
            self.default_extraction_timeout_ms = v;
        }
        if let Some(v) = env_usize("THUMBCACHE_LOCAL_PARALLELISM") {
            self.local_parallelism = v;
        }
        if let Some(v) = env_usize("THUMBCACHE_REMOTE_PARALLELISM") {
            self.remote_parallelism = v;
        }
        if let Some(v) = env_i64("THUMBCACHE_NOT_FOUND_TTL_MS") {
            self.not_found_ttl_ms = v;
        }
        if let Some(v) = env_i64("THUMBCACHE_HARD_ERROR_TTL_MS") {
            self.hard_error_ttl_ms = v;
        }
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
