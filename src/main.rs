//! thumbcache - persistent thumbnail cache and request pipeline demo
//!
//! A thin CLI wrapping [`thumbcache::Pipeline`]: given a local media
//! path and a target size, resolves a thumbnail through the image,
//! thumbnail, and failure caches and writes the PNG bytes to stdout or
//! a file.

use std::path::PathBuf;
use std::sync::Arc;

use thumbcache::{
    config::Config, extractors::SubprocessLocalExtractor, extractors::UnsupportedRemoteDownloader,
    request::local_file_identity, CacheStore, Pipeline, RequestKey, TargetSize,
};

fn init_logging() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

struct Args {
    input: PathBuf,
    width: u32,
    height: u32,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut width = 256u32;
    let mut height = 256u32;
    let mut output = None;
    let mut config = None;

    let mut positional = Vec::new();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--size" => {
                let spec = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--size requires WxH"))?;
                let (w, h) = spec
                    .split_once('x')
                    .ok_or_else(|| anyhow::anyhow!("--size must look like 256x256"))?;
                width = w.parse()?;
                height = h.parse()?;
            }
            "--output" => output = Some(PathBuf::from(iter.next().ok_or_else(|| {
                anyhow::anyhow!("--output requires a path")
            })?)),
            "--config" => config = Some(PathBuf::from(iter.next().ok_or_else(|| {
                anyhow::anyhow!("--config requires a path")
            })?)),
            other => positional.push(other.to_string()),
        }
    }
    let input = positional.into_iter().next().map(PathBuf::from);

    Ok(Args {
        input: input.ok_or_else(|| anyhow::anyhow!("usage: thumbcache <path> [--size WxH] [--output FILE] [--config FILE]"))?,
        width,
        height,
        output,
        config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    tracing::info!("thumbcache starting");

    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let base_dir = dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("thumbcache");
            Config::with_defaults_under(base_dir)
        }
    }
    .with_env_overrides();

    let image_cache = CacheStore::open(
        &config.image_cache.path,
        config.image_cache.max_size_in_bytes,
        config.image_cache.policy,
    )?;
    let thumbnail_cache = CacheStore::open(
        &config.thumbnail_cache.path,
        config.thumbnail_cache.max_size_in_bytes,
        config.thumbnail_cache.policy,
    )?;
    let failure_cache = CacheStore::open(
        &config.failure_cache.path,
        config.failure_cache.max_size_in_bytes,
        config.failure_cache.policy,
    )?;

    let extractor_binary =
        std::env::var("THUMBCACHE_EXTRACTOR_BINARY").unwrap_or_else(|_| "thumbnail-extractor".to_string());

    let pipeline = Pipeline::new(
        image_cache,
        thumbnail_cache,
        failure_cache,
        Arc::new(SubprocessLocalExtractor::new(extractor_binary)),
        Arc::new(UnsupportedRemoteDownloader),
        config,
    );

    let identity = local_file_identity(&args.input)?;
    let request = RequestKey::new(identity, TargetSize { width: args.width, height: args.height });

    let bytes = pipeline.thumbnail(request).await?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, &bytes)?;
            tracing::info!(path = %path.display(), bytes = bytes.len(), "wrote thumbnail");
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&bytes)?;
        }
    }

    Ok(())
}
