//! The request pipeline: turns a [`RequestKey`] into thumbnail bytes,
//! composing the three caches, the rate limiter, the extractors, and
//! the imaging helpers (spec.md 4.5).
//!
//! Grounded on `database::connection_pool`'s "one shared map keyed by
//! request identity, attach as a waiter if already in flight" idiom for
//! deduplication, adapted here with `tokio::sync::OnceCell` standing in
//! for a hand-rolled wait-list: the first caller for a key runs
//! the resolution future, every other concurrent caller for the same
//! key awaits that same future rather than starting its own (spec.md
//! 4.5's "in-flight table" and 9's ordering note). The `dashmap` entry
//! used to install the cell is the "short lock... covering in-flight
//! registration" spec.md 9 asks for; cache checks (steps 3-5) then run
//! once, inside the cell's initializer, under no lock at all, which is
//! sufficient because only one initializer ever runs per key.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::cache_store::CacheStore;
use crate::codec::SENTINEL_EXPIRY_MS;
use crate::config::Config;
use crate::error::{Result, ThumbError};
use crate::extractors::{LocalExtractor, RemoteDownloader};
use crate::imaging;
use crate::rate_limiter::{Pool, RateLimiter};
use crate::request::{InputIdentity, RequestKey};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis() as i64
}

/// The three caches plus the extractor/rate-limiter machinery needed to
/// answer a thumbnail request end to end.
pub struct Pipeline {
    image_cache: CacheStore,
    thumbnail_cache: CacheStore,
    failure_cache: CacheStore,
    rate_limiter: RateLimiter,
    local_extractor: Arc<dyn LocalExtractor>,
    remote_downloader: Arc<dyn RemoteDownloader>,
    config: Config,
    in_flight: DashMap<Vec<u8>, Arc<OnceCell<Vec<u8>>>>,
}

impl Pipeline {
    pub fn new(
        image_cache: CacheStore,
        thumbnail_cache: CacheStore,
        failure_cache: CacheStore,
        local_extractor: Arc<dyn LocalExtractor>,
        remote_downloader: Arc<dyn RemoteDownloader>,
        config: Config,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.local_parallelism, config.remote_parallelism);
        Self {
            image_cache,
            thumbnail_cache,
            failure_cache,
            rate_limiter,
            local_extractor,
            remote_downloader,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Resolve `request` to thumbnail bytes, per spec.md 4.5's 9-step
    /// algorithm. Concurrent calls for an equal `request` share one
    /// extraction attempt.
    #[tracing::instrument(skip(self, request), fields(request_key = ?request.content_key()))]
    pub async fn thumbnail(&self, request: RequestKey) -> Result<Vec<u8>> {
        let key_bytes = request.encode();

        let cell = self
            .in_flight
            .entry(key_bytes.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let outcome = match cell.get_or_try_init(|| self.resolve(&request, &key_bytes)).await {
            Ok(bytes) => Ok(bytes.clone()),
            Err(e) => Err(e),
        };

        // A fresh attempt is allowed the next time this key is requested,
        // whether this one succeeded or failed.
        self.in_flight.remove(&key_bytes);
        outcome
    }

    async fn resolve(&self, request: &RequestKey, key_bytes: &[u8]) -> Result<Vec<u8>> {
        if self.failure_cache.contains(key_bytes)? {
            tracing::debug!("short-circuited by failure cache");
            return Err(ThumbError::NotFound);
        }
        if let Some(bytes) = self.thumbnail_cache.get(key_bytes)? {
            return Ok(bytes);
        }

        let content_key_bytes = request.content_key().encode();
        let full_size = match self.image_cache.get(&content_key_bytes)? {
            Some(bytes) => bytes,
            None => {
                self.extract_and_store_full_size(request, &content_key_bytes, key_bytes)
                    .await?
            }
        };

        let size = request.size();
        if size.is_unbounded() {
            // Step 8: an unbounded target returns the stored full-size
            // bytes unchanged, not a re-encoded copy.
            self.thumbnail_cache
                .put(key_bytes, &full_size, None, SENTINEL_EXPIRY_MS)?;
            return Ok(full_size);
        }

        let full_image = imaging::decode_and_orient(&full_size)?;
        let thumbnail = imaging::scale_to_bounds(&full_image, size.width, size.height);
        let thumbnail_bytes = imaging::encode_png(&thumbnail)?;
        self.thumbnail_cache
            .put(key_bytes, &thumbnail_bytes, None, SENTINEL_EXPIRY_MS)?;
        Ok(thumbnail_bytes)
    }

    /// Steps 6-7: extract (under rate-limiter admission, with retry and
    /// failure-cache recording), decode, scale to the full-size
    /// envelope, and store in the image cache. `key_bytes` is the
    /// request key the failure cache records against, the same key
    /// `resolve` checks at step 3 (spec.md 4.5, 8 scenario 5).
    async fn extract_and_store_full_size(
        &self,
        request: &RequestKey,
        content_key_bytes: &[u8],
        key_bytes: &[u8],
    ) -> Result<Vec<u8>> {
        let pool = match request.content_key().identity() {
            InputIdentity::LocalFile { .. } => Pool::Local,
            InputIdentity::Remote { .. } => Pool::Remote,
        };
        let _admission = self.rate_limiter.acquire(pool).await;

        let raw = match self.extract_with_retry(request).await {
            Ok(raw) => raw,
            Err(e) if e.is_cacheable_failure() => {
                self.record_failure(key_bytes, &e);
                return Err(ThumbError::NotFound);
            }
            Err(e) => return Err(e),
        };

        let decoded = imaging::decode_and_orient(&raw)?;
        let (envelope_w, envelope_h) = self.full_size_envelope(request);
        let envelope = imaging::scale_to_bounds(&decoded, envelope_w, envelope_h);
        let encoded = imaging::encode_png(&envelope)?;
        self.image_cache
            .put(content_key_bytes, &encoded, None, SENTINEL_EXPIRY_MS)?;
        Ok(encoded)
    }

    /// The bounding box step 7 scales the extracted full-size image
    /// into, before any per-request target is applied: audio covers get
    /// the smaller embedded-art envelope, everything else gets the
    /// configured long-edge bound on both axes.
    fn full_size_envelope(&self, request: &RequestKey) -> (u32, u32) {
        match request.content_key().identity() {
            InputIdentity::LocalFile { canonical_path, .. } if is_audio_path(canonical_path) => {
                self.config.full_size_audio_bounds
            }
            _ => (
                self.config.full_size_image_long_edge,
                self.config.full_size_image_long_edge,
            ),
        }
    }

    async fn extract_with_retry(&self, request: &RequestKey) -> Result<Vec<u8>> {
        let deadline = Duration::from_millis(self.config.default_extraction_timeout_ms);
        let mut attempt = 0u32;
        loop {
            let outcome = match request.content_key().identity() {
                InputIdentity::LocalFile { canonical_path, .. } => {
                    self.local_extractor
                        .extract(std::path::Path::new(canonical_path), deadline)
                        .await
                }
                InputIdentity::Remote { artist, album, kind } => {
                    self.remote_downloader.download(artist, album, *kind, deadline).await
                }
            };
            match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retriable() && attempt < self.config.retry_attempt_limit => {
                    attempt += 1;
                    let backoff = self.backoff_for(attempt);
                    tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying extraction");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .config
            .retry_backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.retry_backoff_cap_ms);
        Duration::from_millis(ms)
    }

    /// Record a cacheable failure under `key_bytes` (the request key, not
    /// the content key), so the next call for the same request/size pair
    /// is short-circuited by `resolve`'s step-3 `contains` check.
    fn record_failure(&self, key_bytes: &[u8], error: &ThumbError) {
        let ttl_ms = match error {
            ThumbError::HardError(_) => self.config.hard_error_ttl_ms,
            _ => self.config.not_found_ttl_ms,
        };
        let expiry = now_ms() + ttl_ms;
        if let Err(store_err) = self.failure_cache.put(key_bytes, b"", None, expiry) {
            tracing::warn!(error = %store_err, "failed to record failure-cache entry");
        }
    }
}

fn is_audio_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    [".mp3", ".flac", ".ogg", ".oga", ".m4a", ".wav", ".opus"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}
