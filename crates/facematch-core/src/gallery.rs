//! Directory of named reference images ("known faces").
//!
//! Each file `<name>.<ext>` is one identity. Embeddings are recomputed from
//! disk on every scan unless the optional cache is enabled; the cache is
//! keyed by path and invalidated whenever the file's mtime or length change,
//! so outcomes are identical either way.

use crate::extractor::FaceExtractor;
use crate::loader::{self, ImageLoader};
use crate::types::{Embedding, GalleryFace};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;

const MAX_NAME_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid identity name: {0}")]
    InvalidName(String),
    #[error("unsupported image extension: {0:?}")]
    InvalidExtension(String),
}

/// One registered identity on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryEntry {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
struct CachedEncoding {
    modified: SystemTime,
    len: u64,
    /// `None` records that the image held no usable face.
    embedding: Option<Embedding>,
}

pub struct Gallery {
    dir: PathBuf,
    cache: Option<Mutex<HashMap<PathBuf, CachedEncoding>>>,
}

impl Gallery {
    /// Open the gallery at `dir`, creating it if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GalleryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, cache: None })
    }

    /// Enable or disable the per-entry embedding cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled.then(|| Mutex::new(HashMap::new()));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All reference images, ordered by file name.
    ///
    /// The order only makes scans reproducible; which of two exactly tied
    /// identities wins is not part of the contract.
    pub fn entries(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            let path = dirent.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !loader::is_accepted_extension(file_name) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            entries.push(GalleryEntry {
                name: name.to_string(),
                path: path.clone(),
            });
        }
        entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(entries)
    }

    /// Encode every entry's first face. Entries that cannot be read, decoded
    /// or that contain no face are logged and skipped.
    pub fn encode(
        &self,
        extractor: &dyn FaceExtractor,
        loader: &ImageLoader,
    ) -> Result<Vec<GalleryFace>, GalleryError> {
        let entries = self.entries()?;
        if let Some(Ok(mut cache)) = self.cache.as_ref().map(Mutex::lock) {
            cache.retain(|path, _| entries.iter().any(|e| &e.path == path));
        }
        let mut faces = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(embedding) = self.encode_entry(&entry, extractor, loader) {
                faces.push(GalleryFace {
                    name: entry.name,
                    path: entry.path,
                    embedding,
                });
            }
        }
        tracing::debug!(faces = faces.len(), dir = %self.dir.display(), "gallery encoded");
        Ok(faces)
    }

    fn encode_entry(
        &self,
        entry: &GalleryEntry,
        extractor: &dyn FaceExtractor,
        loader: &ImageLoader,
    ) -> Option<Embedding> {
        let Some(cache) = &self.cache else {
            return first_face(entry, extractor, loader);
        };

        let meta = match std::fs::metadata(&entry.path) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(name = %entry.name, error = %e, "skipping unreadable gallery entry");
                return None;
            }
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let len = meta.len();

        if let Ok(cache) = cache.lock() {
            if let Some(hit) = cache.get(&entry.path) {
                if hit.modified == modified && hit.len == len {
                    return hit.embedding.clone();
                }
            }
        }

        let embedding = first_face(entry, extractor, loader);
        if let Ok(mut cache) = cache.lock() {
            cache.insert(
                entry.path.clone(),
                CachedEncoding {
                    modified,
                    len,
                    embedding: embedding.clone(),
                },
            );
        }
        embedding
    }

    /// Write `bytes` as `<name>.<extension>`. Any other reference image for
    /// `name`, whatever its extension, is removed so one file per identity remains.
    pub fn register(
        &self,
        name: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<GalleryEntry, GalleryError> {
        validate_name(name)?;
        let extension = extension.to_ascii_lowercase();
        if !loader::ACCEPTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(GalleryError::InvalidExtension(extension));
        }

        let path = self.dir.join(format!("{name}.{extension}"));
        std::fs::write(&path, bytes)?;
        for stale in self.entries()? {
            if stale.name == name && stale.path != path {
                std::fs::remove_file(&stale.path)?;
                tracing::info!(name, path = %stale.path.display(), "removed replaced reference image");
            }
        }
        tracing::info!(name, path = %path.display(), "registered identity");

        Ok(GalleryEntry {
            name: name.to_string(),
            path,
        })
    }
}

fn first_face(
    entry: &GalleryEntry,
    extractor: &dyn FaceExtractor,
    loader: &ImageLoader,
) -> Option<Embedding> {
    let image = match loader.load_path(&entry.path) {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!(name = %entry.name, error = %e, "skipping undecodable gallery entry");
            return None;
        }
    };
    match extractor.extract(&image) {
        Ok(faces) => match faces.into_iter().next() {
            Some(face) => Some(face.embedding),
            None => {
                tracing::warn!(name = %entry.name, "no face in gallery entry, skipping");
                None
            }
        },
        Err(e) => {
            tracing::warn!(name = %entry.name, error = %e, "face extraction failed for gallery entry");
            None
        }
    }
}

/// Identity names become file stems, so they must be plain, short and visible.
pub fn validate_name(name: &str) -> Result<(), GalleryError> {
    let invalid = |why: &str| Err(GalleryError::InvalidName(format!("{name:?}: {why}")));

    if name.trim().is_empty() {
        return invalid("must not be empty");
    }
    if name.chars().count() > MAX_NAME_LEN {
        return invalid("too long");
    }
    if name.starts_with('.') {
        return invalid("must not start with '.'");
    }
    if name.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control()) {
        return invalid("contains a path separator or control character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{EuclideanMatcher, Matcher};
    use crate::testing::{tiles_png, TileExtractor};
    use crate::types::Embedding;
    use tempfile::TempDir;

    fn gallery_with(files: &[(&str, Vec<u8>)]) -> (TempDir, Gallery) {
        let dir = TempDir::new().unwrap();
        for (file, bytes) in files {
            std::fs::write(dir.path().join(file), bytes).unwrap();
        }
        let gallery = Gallery::open(dir.path()).unwrap();
        (dir, gallery)
    }

    #[test]
    fn test_entries_filters_and_sorts() {
        let (dir, gallery) = gallery_with(&[
            ("zoe.png", tiles_png(&[[1, 1, 1]])),
            ("alice.jpg", tiles_png(&[[1, 1, 1]])),
            ("notes.txt", b"hello".to_vec()),
        ]);
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let names: Vec<_> = gallery.entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["alice", "zoe"]);
    }

    #[test]
    fn test_empty_gallery_encodes_to_nothing() {
        let (_dir, gallery) = gallery_with(&[]);
        let faces = gallery
            .encode(&TileExtractor::new(), &ImageLoader::default())
            .unwrap();
        assert!(faces.is_empty());

        let outcome = EuclideanMatcher::default().best_match(&Embedding::new(vec![1.0; 3]), &faces);
        assert!(!outcome.is_match());
    }

    #[test]
    fn test_bad_entries_skipped_without_affecting_others() {
        let (_dir, gallery) = gallery_with(&[
            ("alice.png", tiles_png(&[[130, 100, 100]])),
            ("blank.png", tiles_png(&[[0, 0, 0]])),
            ("corrupt.jpg", b"not an image".to_vec()),
            ("bob.png", tiles_png(&[[200, 200, 200]])),
        ]);

        let faces = gallery
            .encode(&TileExtractor::new(), &ImageLoader::default())
            .unwrap();
        let names: Vec<_> = faces.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);

        let probe = Embedding::new(vec![1.0, 1.0, 1.0]);
        let outcome = EuclideanMatcher::default().best_match(&probe, &faces);
        assert_eq!(outcome.name.as_deref(), Some("alice"));
        assert_eq!(outcome.score(), Some(0.7));
    }

    #[test]
    fn test_first_face_of_reference_is_used() {
        let (_dir, gallery) = gallery_with(&[(
            "pair.png",
            tiles_png(&[[100, 100, 100], [50, 50, 50]]),
        )]);
        let faces = gallery
            .encode(&TileExtractor::new(), &ImageLoader::default())
            .unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].embedding.values, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_cache_reuses_and_invalidates() {
        let (dir, gallery) = gallery_with(&[("alice.png", tiles_png(&[[100, 100, 100]]))]);
        let gallery = gallery.with_cache(true);
        let extractor = TileExtractor::new();
        let loader = ImageLoader::default();

        let first = gallery.encode(&extractor, &loader).unwrap();
        let second = gallery.encode(&extractor, &loader).unwrap();
        assert_eq!(extractor.calls(), 1);
        assert_eq!(first[0].embedding, second[0].embedding);

        // Different content and length → cache miss, fresh embedding.
        std::fs::write(
            dir.path().join("alice.png"),
            tiles_png(&[[150, 100, 100], [0, 0, 0]]),
        )
        .unwrap();
        let third = gallery.encode(&extractor, &loader).unwrap();
        assert_eq!(extractor.calls(), 2);
        assert_eq!(third[0].embedding.values, vec![1.5, 1.0, 1.0]);
    }

    #[test]
    fn test_cache_matches_uncached() {
        let files = [
            ("a.png", tiles_png(&[[120, 100, 100]])),
            ("b.png", tiles_png(&[[0, 0, 0]])),
            ("c.png", tiles_png(&[[100, 110, 100]])),
        ];
        let (_d1, plain) = gallery_with(&files);
        let (_d2, cached) = gallery_with(&files);
        let cached = cached.with_cache(true);
        let extractor = TileExtractor::new();
        let loader = ImageLoader::default();
        let probe = Embedding::new(vec![1.0, 1.0, 1.0]);
        let matcher = EuclideanMatcher::default();

        let expected = matcher.best_match(&probe, &plain.encode(&extractor, &loader).unwrap());
        for _ in 0..2 {
            let got = matcher.best_match(&probe, &cached.encode(&extractor, &loader).unwrap());
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_register_writes_file() {
        let (dir, gallery) = gallery_with(&[]);
        let entry = gallery.register("Carol", "PNG", b"bytes").unwrap();
        assert_eq!(entry.name, "Carol");
        assert_eq!(entry.path, dir.path().join("Carol.png"));
        assert_eq!(std::fs::read(&entry.path).unwrap(), b"bytes");

        gallery.register("Carol", "png", b"newer").unwrap();
        assert_eq!(std::fs::read(&entry.path).unwrap(), b"newer");
    }

    #[test]
    fn test_register_other_extension_replaces_identity() {
        let (dir, gallery) = gallery_with(&[("bob.png", b"bob".to_vec())]);
        gallery.register("alice", "png", b"old").unwrap();
        let entry = gallery.register("alice", "jpg", b"new").unwrap();

        let entries = gallery.entries().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(entries[0], entry);
        assert!(!dir.path().join("alice.png").exists());
        assert_eq!(std::fs::read(dir.path().join("alice.jpg")).unwrap(), b"new");
    }

    #[test]
    fn test_cache_drops_removed_entries() {
        let (dir, gallery) = gallery_with(&[
            ("alice.png", tiles_png(&[[100, 100, 100]])),
            ("bob.png", tiles_png(&[[120, 100, 100]])),
        ]);
        let gallery = gallery.with_cache(true);
        let extractor = TileExtractor::new();
        let loader = ImageLoader::default();

        gallery.encode(&extractor, &loader).unwrap();
        assert_eq!(gallery.cache.as_ref().unwrap().lock().unwrap().len(), 2);

        std::fs::remove_file(dir.path().join("bob.png")).unwrap();
        let faces = gallery.encode(&extractor, &loader).unwrap();
        assert_eq!(faces.len(), 1);

        let cache = gallery.cache.as_ref().unwrap().lock().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(&dir.path().join("alice.png")));
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let (_dir, gallery) = gallery_with(&[]);
        for name in ["", "  ", "../evil", "a/b", ".hidden", "back\\slash"] {
            assert!(
                matches!(gallery.register(name, "jpg", b"x"), Err(GalleryError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
        assert!(matches!(
            gallery.register("dave", "gif", b"x"),
            Err(GalleryError::InvalidExtension(_))
        ));
        assert!(validate_name(&"x".repeat(65)).is_err());
        assert!(validate_name("Mary Jane").is_ok());
    }
}
