//! Uniquely named files in the temporary storage area.

use image::{ImageFormat, RgbImage};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Extension given to every stored file regardless of the source format.
const STORED_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("temp storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// A file written into the upload store.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub file_name: String,
    /// Public URL under the store's prefix.
    pub url: String,
}

/// Writes uploads and derived images to a temp directory under unique names.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    url_prefix: String,
}

impl UploadStore {
    /// Open the store, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>, url_prefix: &str) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let dir = std::fs::canonicalize(&dir)?;
        Ok(Self {
            dir,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Prefix without a trailing slash.
    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.url_prefix, file_name)
    }

    /// Write `bytes` to a new file. Never overwrites an existing file.
    pub fn persist(&self, bytes: &[u8]) -> Result<StoredFile, StorageError> {
        self.create_with(|w| w.write_all(bytes).map_err(StorageError::from))
    }

    /// Encode `image` as JPEG into a new file.
    pub fn persist_image(&self, image: &RgbImage) -> Result<StoredFile, StorageError> {
        self.create_with(|w| {
            image.write_to(w, ImageFormat::Jpeg)?;
            Ok(())
        })
    }

    /// Copy an existing file (e.g. a gallery reference) into the store.
    pub fn copy_in(&self, source: &Path) -> Result<StoredFile, StorageError> {
        let bytes = std::fs::read(source)?;
        self.persist(&bytes)
    }

    /// Map a public file name back to its path inside the store.
    ///
    /// Rejects anything that is not a bare file name.
    pub fn resolve(&self, file_name: &str) -> Option<PathBuf> {
        if file_name.is_empty()
            || file_name.starts_with('.')
            || file_name.contains(['/', '\\'])
            || file_name.contains("..")
        {
            return None;
        }
        Some(self.dir.join(file_name))
    }

    fn create_with<F>(&self, write: F) -> Result<StoredFile, StorageError>
    where
        F: FnOnce(&mut BufWriter<std::fs::File>) -> Result<(), StorageError>,
    {
        let file_name = format!("{}.{STORED_EXTENSION}", Uuid::new_v4());
        let path = self.dir.join(&file_name);

        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;

        tracing::debug!(path = %path.display(), "stored temp file");
        Ok(StoredFile {
            url: self.url_for(&file_name),
            path,
            file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    #[test]
    fn test_persist_unique_names() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::open(dir.path().join("temp"), "/static/temp/").unwrap();

        let a = store.persist(b"first").unwrap();
        let b = store.persist(b"second").unwrap();

        assert_ne!(a.file_name, b.file_name);
        assert!(a.file_name.ends_with(".jpg"));
        assert!(a.path.is_absolute());
        assert_eq!(a.url, format!("/static/temp/{}", a.file_name));
        assert_eq!(std::fs::read(&a.path).unwrap(), b"first");
        assert_eq!(std::fs::read(&b.path).unwrap(), b"second");
    }

    #[test]
    fn test_persist_image_is_jpeg() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::open(dir.path(), "/t").unwrap();

        let stored = store
            .persist_image(&RgbImage::from_pixel(8, 8, Rgb([9, 9, 9])))
            .unwrap();
        let bytes = std::fs::read(&stored.path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_copy_in() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("alice.png");
        std::fs::write(&source, b"reference").unwrap();
        let store = UploadStore::open(dir.path().join("temp"), "/t").unwrap();

        let copy = store.copy_in(&source).unwrap();
        assert_eq!(std::fs::read(copy.path).unwrap(), b"reference");
        assert!(source.exists());
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::open(dir.path(), "/t").unwrap();

        assert!(store.resolve("abc.jpg").is_some());
        assert!(store.resolve("../secret").is_none());
        assert!(store.resolve("a/b.jpg").is_none());
        assert!(store.resolve(".hidden").is_none());
        assert!(store.resolve("").is_none());
    }
}
