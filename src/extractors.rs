//! Pure interfaces between the pipeline and the outside world (spec.md
//! 4.4): local media extraction and remote art downloads. Both return
//! opaque byte buffers; decoding and scaling live in [`crate::imaging`].
//!
//! Grounded on spec.md 4.4's two-interface split and, for the
//! `#[async_trait]` shape, on `enterprise/ratelimit/distributed.rs`'s own
//! use of `async-trait` (already a workspace dependency). Fake
//! implementations for tests are grounded on
//! `original_source/tests/TestUrlDownloader.h`'s idiom: a preprogrammed,
//! deterministic stand-in keyed by request identity.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, ThumbError};
use crate::request::ArtKind;

/// Produces raw bytes for a local file: the file's own bytes for an
/// image input, or an extracted representative frame / embedded cover
/// art for video/audio, via a supervised subprocess (spec.md 4.4).
#[async_trait]
pub trait LocalExtractor: Send + Sync {
    async fn extract(&self, canonical_path: &Path, deadline: Duration) -> Result<Vec<u8>>;
}

/// Fetches remote album or artist art (spec.md 4.4).
#[async_trait]
pub trait RemoteDownloader: Send + Sync {
    async fn download(
        &self,
        artist: &str,
        album: &str,
        kind: ArtKind,
        deadline: Duration,
    ) -> Result<Vec<u8>>;
}

/// Genuine default `LocalExtractor`: runs a configured external binary
/// under [`crate::subprocess::run_extractor`]'s exit-code contract and
/// reads back whatever it wrote. The extractor binary itself is out of
/// scope (see SPEC_FULL.md 1); this is the real supervision mechanics
/// around it.
pub struct SubprocessLocalExtractor {
    executable: PathBuf,
}

impl SubprocessLocalExtractor {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl LocalExtractor for SubprocessLocalExtractor {
    async fn extract(&self, canonical_path: &Path, deadline: Duration) -> Result<Vec<u8>> {
        let output_path = std::env::temp_dir().join(format!("thumbcache-{}.out", Uuid::new_v4()));
        let input_url = format!("file://{}", canonical_path.display());
        let output_target = output_path.to_string_lossy().into_owned();

        let result =
            crate::subprocess::run_extractor(&self.executable, &input_url, &output_target, deadline)
                .await;
        let outcome = match result {
            Ok(()) => std::fs::read(&output_path)
                .map_err(|e| ThumbError::HardError(format!("failed to read extractor output: {e}"))),
            Err(e) => Err(e),
        };
        let _ = std::fs::remove_file(&output_path);
        outcome
    }
}

/// Default `RemoteDownloader`: real network art-fetching is out of
/// scope (see SPEC_FULL.md 1), so this always reports absence. Local
/// files still resolve end to end without a configured backend.
pub struct UnsupportedRemoteDownloader;

#[async_trait]
impl RemoteDownloader for UnsupportedRemoteDownloader {
    async fn download(
        &self,
        _artist: &str,
        _album: &str,
        _kind: ArtKind,
        _deadline: Duration,
    ) -> Result<Vec<u8>> {
        Err(ThumbError::NotFound)
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use crate::error::ThumbError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Always reports `NotFound`, counting invocations so tests can
    /// assert in-flight deduplication (spec.md 8, scenario 5).
    #[derive(Default)]
    pub struct NullLocalExtractor {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl LocalExtractor for NullLocalExtractor {
        async fn extract(&self, _canonical_path: &Path, _deadline: Duration) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ThumbError::NotFound)
        }
    }

    /// Always reports `NotFound`.
    #[derive(Default)]
    pub struct NullRemoteDownloader {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteDownloader for NullRemoteDownloader {
        async fn download(
            &self,
            _artist: &str,
            _album: &str,
            _kind: ArtKind,
            _deadline: Duration,
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ThumbError::NotFound)
        }
    }

    /// A preprogrammed outcome for one (artist, album, kind) triple.
    #[derive(Clone)]
    pub enum FakeOutcome {
        Bytes(Vec<u8>),
        NotFound,
        Temporary,
        Hard,
    }

    /// Deterministic downloader keyed by (artist, album, kind), with a
    /// call counter for dedup assertions.
    #[derive(Default)]
    pub struct FakeDownloader {
        outcomes: Mutex<HashMap<(String, String, bool), FakeOutcome>>,
        pub calls: AtomicUsize,
    }

    impl FakeDownloader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn program(&self, artist: &str, album: &str, kind: ArtKind, outcome: FakeOutcome) {
            self.outcomes.lock().unwrap().insert(
                (artist.to_string(), album.to_string(), kind == ArtKind::Artist),
                outcome,
            );
        }
    }

    #[async_trait]
    impl RemoteDownloader for FakeDownloader {
        async fn download(
            &self,
            artist: &str,
            album: &str,
            kind: ArtKind,
            _deadline: Duration,
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = (artist.to_string(), album.to_string(), kind == ArtKind::Artist);
            match self.outcomes.lock().unwrap().get(&key) {
                Some(FakeOutcome::Bytes(bytes)) => Ok(bytes.clone()),
                Some(FakeOutcome::NotFound) | None => Err(ThumbError::NotFound),
                Some(FakeOutcome::Temporary) => {
                    Err(ThumbError::TemporaryError("fake transient failure".to_string()))
                }
                Some(FakeOutcome::Hard) => Err(ThumbError::HardError("fake hard failure".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn null_local_extractor_counts_calls() {
        let extractor = NullLocalExtractor::default();
        let _ = extractor
            .extract(Path::new("/tmp/x.mp3"), Duration::from_secs(1))
            .await;
        let _ = extractor
            .extract(Path::new("/tmp/x.mp3"), Duration::from_secs(1))
            .await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fake_downloader_returns_programmed_outcome() {
        let downloader = FakeDownloader::new();
        downloader.program("Air", "Moon Safari", ArtKind::Album, FakeOutcome::Bytes(vec![1, 2, 3]));
        let result = downloader
            .download("Air", "Moon Safari", ArtKind::Album, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fake_downloader_defaults_to_not_found() {
        let downloader = FakeDownloader::new();
        let result = downloader
            .download("Unknown", "Unknown", ArtKind::Album, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ThumbError::NotFound)));
    }
}
