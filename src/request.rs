//! Request identity: the tagged union and binary encoding of spec.md
//! 3.3 / 6.2.
//!
//! Grounded on `original_source/src/core/internal/artcache.cpp`'s
//! key-construction scheme for the domain tag and content-digest idea;
//! `RequestKey` doubles as the in-flight table's key, so it derives
//! `Hash`/`Eq` the way `database::connection_pool` keys its
//! pooled-connection map.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{Result, ThumbError};

/// Distinguishes album art requests from artist art requests sharing
/// the same (artist, album) strings (spec.md 3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtKind {
    Album,
    Artist,
}

/// What is being thumbnailed, independent of target size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InputIdentity {
    /// A local file, identified by its canonical path plus a digest of
    /// (device, inode, mtime, size) so a changed-in-place file is a
    /// different content key.
    LocalFile {
        canonical_path: String,
        digest: [u8; 32],
    },
    /// Remote cover art or artist art for (artist, album).
    Remote { artist: String, album: String, kind: ArtKind },
}

/// Identity without target size; selects the image-cache entry
/// (spec.md, GLOSSARY: "Content key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey(InputIdentity);

/// Non-negative target size; `(0, 0)` means "unbounded / stored
/// representation" (spec.md 6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const UNBOUNDED: TargetSize = TargetSize { width: 0, height: 0 };

    pub fn is_unbounded(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

/// Content key plus target size; selects the thumbnail-cache entry
/// (spec.md, GLOSSARY: "Request key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    content: ContentKey,
    size: TargetSize,
}

const TAG_LOCAL_FILE: u8 = 0;
const TAG_REMOTE_ALBUM: u8 = 1;
const TAG_REMOTE_ARTIST: u8 = 2;

impl RequestKey {
    pub fn new(identity: InputIdentity, size: TargetSize) -> Self {
        Self {
            content: ContentKey(identity),
            size,
        }
    }

    /// The content key (identity, no size) that indexes the image cache.
    pub fn content_key(&self) -> &ContentKey {
        &self.content
    }

    pub fn size(&self) -> TargetSize {
        self.size
    }

    /// Binary encoding: domain tag, then the input identifier, then the
    /// size as two 32-bit signed integers (spec.md 6.2).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.content.encode();
        out.extend_from_slice(&(self.size.width as i32).to_be_bytes());
        out.extend_from_slice(&(self.size.height as i32).to_be_bytes());
        out
    }
}

impl ContentKey {
    /// The identity this content key wraps, for dispatch onto the
    /// local-extractor or remote-downloader path.
    pub fn identity(&self) -> &InputIdentity {
        &self.0
    }

    /// Binary encoding of the identity alone (the request-key encoding
    /// minus the trailing size fields).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.0 {
            InputIdentity::LocalFile {
                canonical_path,
                digest,
            } => {
                out.push(TAG_LOCAL_FILE);
                out.extend_from_slice(&(canonical_path.len() as u32).to_be_bytes());
                out.extend_from_slice(canonical_path.as_bytes());
                out.extend_from_slice(digest);
            }
            InputIdentity::Remote { artist, album, kind } => {
                out.push(match kind {
                    ArtKind::Album => TAG_REMOTE_ALBUM,
                    ArtKind::Artist => TAG_REMOTE_ARTIST,
                });
                out.extend_from_slice(&(artist.len() as u32).to_be_bytes());
                out.extend_from_slice(artist.as_bytes());
                out.extend_from_slice(&(album.len() as u32).to_be_bytes());
                out.extend_from_slice(album.as_bytes());
            }
        }
        out
    }
}

/// Build a local-file identity from a path on disk, canonicalizing it
/// and deriving the content digest from filesystem metadata.
pub fn local_file_identity(path: &Path) -> Result<InputIdentity> {
    let canonical = std::fs::canonicalize(path)
        .map_err(|e| ThumbError::InvalidArgument(format!("cannot canonicalize {}: {e}", path.display())))?;
    let metadata = std::fs::metadata(&canonical)
        .map_err(|e| ThumbError::InvalidArgument(format!("cannot stat {}: {e}", canonical.display())))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&metadata.dev().to_be_bytes());
    hasher.update(&metadata.ino().to_be_bytes());
    hasher.update(&metadata.mtime().to_be_bytes());
    hasher.update(&metadata.size().to_be_bytes());
    let digest = *hasher.finalize().as_bytes();
    Ok(InputIdentity::LocalFile {
        canonical_path: canonical.to_string_lossy().into_owned(),
        digest,
    })
}
