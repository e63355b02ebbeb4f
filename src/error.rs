//! Crate-wide error taxonomy.
//!
//! One enum covers both cache-layer failures (spec.md 7) and the
//! extractor/pipeline failures layered on top of it, mirroring the shape of
//! `caddy`'s `DatabaseError`/`EnterpriseError`: one variant per kind, a
//! `{0}`-style message, and a single crate-wide `Result` alias.

use std::path::PathBuf;

use thiserror::Error;

/// All error kinds produced by this crate.
#[derive(Error, Debug)]
pub enum ThumbError {
    /// API misuse: empty key, negative size, out-of-range event mask, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Open of an existing cache with conflicting settings (size/policy),
    /// or an operation that requires a setting the current policy forbids
    /// (e.g. a non-sentinel expiry under strict LRU).
    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    /// The underlying store reported checksum or format damage. Operator
    /// recovery is to delete the cache directory named here.
    #[error("cache at {path} is corrupt: {detail}")]
    CorruptionError {
        /// Path to the damaged cache directory.
        path: PathBuf,
        /// Underlying diagnostic detail.
        detail: String,
    },

    /// Any other underlying-store failure.
    #[error("store error: {0}")]
    StoreError(String),

    /// A `get_or_put` loader returned an error; the inner message is
    /// wrapped, not swallowed.
    #[error("loader error: {0}")]
    LoaderError(String),

    /// An extractor reported definitive absence (e.g. HTTP 404, no
    /// embedded cover art).
    #[error("not found")]
    NotFound,

    /// An extractor reported a transient failure (timeout, 5xx, 429,
    /// connectivity). Callers retry with backoff.
    #[error("temporary error: {0}")]
    TemporaryError(String),

    /// An extractor reported a non-retriable, input-specific failure
    /// (4xx other than 404, a crashing subprocess, pipeline failure).
    #[error("hard error: {0}")]
    HardError(String),

    /// The caller cancelled the request. Never recorded in the failure
    /// cache.
    #[error("cancelled")]
    Cancelled,

    /// The caller-supplied deadline elapsed. Treated as `TemporaryError`
    /// for retry purposes.
    #[error("timed out")]
    Timeout,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ThumbError>;

impl ThumbError {
    /// True for failures that should be recorded in the failure cache
    /// (see spec.md 4.5 step 6 and 7's error-kind table).
    pub fn is_cacheable_failure(&self) -> bool {
        matches!(self, ThumbError::NotFound | ThumbError::HardError(_))
    }

    /// True for failures that the pipeline's retry loop should back off
    /// and retry, rather than surface immediately.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ThumbError::TemporaryError(_) | ThumbError::Timeout)
    }
}

impl ThumbError {
    /// Classify an underlying sled failure, attaching the cache path so
    /// `CorruptionError` carries an actionable location (spec.md 7).
    pub(crate) fn from_sled(path: &std::path::Path, err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { at, bt: _ } => ThumbError::CorruptionError {
                path: path.to_path_buf(),
                detail: format!("corruption at {:?}", at),
            },
            other => ThumbError::StoreError(other.to_string()),
        }
    }
}

/// Path-less conversion, used deep inside helpers (e.g. the eviction
/// scan) that do not carry the cache path. Call sites that know the
/// path and want a precise `CorruptionError` should use
/// [`ThumbError::from_sled`] instead.
impl From<sled::Error> for ThumbError {
    fn from(err: sled::Error) -> Self {
        ThumbError::from_sled(std::path::Path::new(""), err)
    }
}
