//! End-to-end `Pipeline` scenarios built entirely on the public API
//! (spec.md 8): a local file resolves to a bounded thumbnail, a second
//! identical request is served from the thumbnail cache without
//! re-extracting, and a request for a different target size reuses the
//! already-extracted full-size image.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgba};

use thumbcache::extractors::UnsupportedRemoteDownloader;
use thumbcache::{CacheStore, Config, LocalExtractor, Pipeline, Policy, RequestKey, Result, TargetSize};

/// The simplest real `LocalExtractor`: a local image file's own bytes
/// are the extracted representation (spec.md 4.4's "image input" case),
/// counting calls so tests can assert on extraction frequency.
struct DirectFileExtractor {
    calls: AtomicUsize,
}

impl DirectFileExtractor {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl LocalExtractor for DirectFileExtractor {
    async fn extract(&self, canonical_path: &Path, _deadline: Duration) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::read(canonical_path)
            .map_err(|e| thumbcache::ThumbError::HardError(format!("read failed: {e}")))
    }
}

fn write_test_png(path: &Path, width: u32, height: u32) {
    let image = DynamicImage::ImageRgba8(ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    }));
    image.save(path).unwrap();
}

fn build_pipeline(dir: &Path, extractor: Arc<DirectFileExtractor>) -> Pipeline {
    let image_cache = CacheStore::open(dir.join("image"), 64 * 1024 * 1024, Policy::LruOnly).unwrap();
    let thumbnail_cache =
        CacheStore::open(dir.join("thumbnail"), 64 * 1024 * 1024, Policy::LruOnly).unwrap();
    let failure_cache = CacheStore::open(dir.join("failure"), 1024 * 1024, Policy::LruTtl).unwrap();
    let config = Config::with_defaults_under(dir);
    Pipeline::new(
        image_cache,
        thumbnail_cache,
        failure_cache,
        extractor,
        Arc::new(UnsupportedRemoteDownloader),
        config,
    )
}

#[tokio::test]
async fn resolves_a_local_file_to_a_bounded_thumbnail() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("cover.png");
    write_test_png(&source, 800, 600);

    let extractor = Arc::new(DirectFileExtractor::new());
    let pipeline = build_pipeline(dir.path(), extractor.clone());

    let identity = thumbcache::request::local_file_identity(&source).unwrap();
    let request = RequestKey::new(identity, TargetSize { width: 200, height: 200 });

    let bytes = pipeline.thumbnail(request).await.unwrap();
    let thumbnail = image::load_from_memory(&bytes).unwrap();
    let (w, h) = thumbnail.dimensions();
    assert!(w <= 200 && h <= 200);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_repeat_request_hits_the_thumbnail_cache() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("cover.png");
    write_test_png(&source, 500, 500);

    let extractor = Arc::new(DirectFileExtractor::new());
    let pipeline = build_pipeline(dir.path(), extractor.clone());

    let identity = thumbcache::request::local_file_identity(&source).unwrap();
    let request = RequestKey::new(identity, TargetSize { width: 128, height: 128 });

    pipeline.thumbnail(request.clone()).await.unwrap();
    pipeline.thumbnail(request).await.unwrap();

    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_different_target_size_reuses_the_extracted_full_size_image() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("cover.png");
    write_test_png(&source, 500, 500);

    let extractor = Arc::new(DirectFileExtractor::new());
    let pipeline = build_pipeline(dir.path(), extractor.clone());

    let identity = thumbcache::request::local_file_identity(&source).unwrap();
    pipeline
        .thumbnail(RequestKey::new(identity.clone(), TargetSize { width: 64, height: 64 }))
        .await
        .unwrap();
    pipeline
        .thumbnail(RequestKey::new(identity, TargetSize { width: 256, height: 256 }))
        .await
        .unwrap();

    // Both sizes decode from the one image-cache entry; the extractor
    // only ran for the first request.
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
}

/// An extractor that always reports a non-retriable, input-specific
/// failure, counting calls so tests can assert on failure-cache
/// short-circuiting.
struct AlwaysHardErrorExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl LocalExtractor for AlwaysHardErrorExtractor {
    async fn extract(&self, _canonical_path: &Path, _deadline: Duration) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(thumbcache::ThumbError::HardError("unsupported codec".to_string()))
    }
}

#[tokio::test]
async fn a_hard_extraction_failure_is_recorded_and_short_circuits_next_call() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("broken.mov");
    std::fs::write(&source, b"not actually a video").unwrap();

    let extractor = Arc::new(AlwaysHardErrorExtractor { calls: AtomicUsize::new(0) });
    let image_cache = CacheStore::open(dir.path().join("image"), 64 * 1024 * 1024, Policy::LruOnly).unwrap();
    let thumbnail_cache =
        CacheStore::open(dir.path().join("thumbnail"), 64 * 1024 * 1024, Policy::LruOnly).unwrap();
    let failure_cache = CacheStore::open(dir.path().join("failure"), 1024 * 1024, Policy::LruTtl).unwrap();
    let pipeline = Pipeline::new(
        image_cache,
        thumbnail_cache,
        failure_cache,
        extractor.clone(),
        Arc::new(UnsupportedRemoteDownloader),
        Config::with_defaults_under(dir.path()),
    );

    let identity = thumbcache::request::local_file_identity(&source).unwrap();
    let request = RequestKey::new(identity, TargetSize { width: 64, height: 64 });

    let first = pipeline.thumbnail(request.clone()).await;
    assert!(matches!(first, Err(thumbcache::ThumbError::NotFound)));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

    // The pipeline masks HardError as NotFound once recorded, and the
    // second call never reaches the extractor again.
    let second = pipeline.thumbnail(request).await;
    assert!(matches!(second, Err(thumbcache::ThumbError::NotFound)));
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
}
