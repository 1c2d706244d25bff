//! Per-request orchestration: validate, persist, decode, extract, match.
//!
//! Everything here is blocking; async callers run it on a blocking pool.

use crate::extractor::{ExtractError, FaceExtractor};
use crate::gallery::{self, Gallery, GalleryError};
use crate::loader::{self, crop_face, ImageLoader, LoadError, ResizePolicy};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
use crate::types::{BoundingBox, DetectedFace};
use crate::uploads::{StorageError, StoredFile, UploadStore};
use image::RgbImage;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Explicit settings for [`FaceService`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub known_faces_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub temp_url_prefix: String,
    pub tolerance: f32,
    pub resize: ResizePolicy,
    pub gallery_cache: bool,
    pub require_face_on_register: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            known_faces_dir: PathBuf::from("known_faces"),
            temp_dir: PathBuf::from("static/temp"),
            temp_url_prefix: "/static/temp".to_string(),
            tolerance: DEFAULT_TOLERANCE,
            resize: ResizePolicy::Original,
            gallery_cache: false,
            require_face_on_register: true,
        }
    }
}

/// An uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Match against the known-faces gallery.
    Db,
    /// Match against the first face of a second upload.
    Upload,
}

impl std::str::FromStr for CompareMode {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "db" => Ok(Self::Db),
            "upload" => Ok(Self::Upload),
            _ => Err(ServiceError::Validation(
                "Invalid mode. Use 'db' or 'upload'".into(),
            )),
        }
    }
}

/// Which uploaded image an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    First,
    Second,
    Registration,
}

impl fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageSlot::First => "first",
            ImageSlot::Second => "second",
            ImageSlot::Registration => "uploaded",
        })
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("could not read {slot} image: {source}")]
    Image {
        slot: ImageSlot,
        image_url: Option<String>,
        source: LoadError,
    },
    #[error("No face found in {slot} image")]
    NoFaceDetected {
        slot: ImageSlot,
        image_url: Option<String>,
    },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("face extraction: {0}")]
    Extraction(#[from] ExtractError),
    #[error("gallery: {0}")]
    Gallery(GalleryError),
    #[error("worker: {0}")]
    Worker(String),
}

impl From<GalleryError> for ServiceError {
    fn from(e: GalleryError) -> Self {
        match e {
            GalleryError::InvalidName(_) | GalleryError::InvalidExtension(_) => {
                ServiceError::Validation(e.to_string())
            }
            other => ServiceError::Gallery(other),
        }
    }
}

impl ServiceError {
    /// Whether the client caused the failure (bad input rather than a server fault).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation(_)
                | ServiceError::Image { .. }
                | ServiceError::NoFaceDetected { .. }
        )
    }

    /// URL of the persisted image the error refers to, if one was saved.
    pub fn image_url(&self) -> Option<&str> {
        match self {
            ServiceError::Image { image_url, .. } | ServiceError::NoFaceDetected { image_url, .. } => {
                image_url.as_deref()
            }
            _ => None,
        }
    }
}

/// Match summary for one detected query face.
#[derive(Debug, Clone, Serialize)]
pub struct FaceResult {
    pub face_index: usize,
    pub bbox: BoundingBox,
    pub matched: bool,
    pub verdict: String,
    pub name: Option<String>,
    pub distance: Option<f32>,
    pub score: Option<f32>,
    pub face_url: String,
    pub match_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompareResponse {
    pub mode: CompareMode,
    pub query_url: String,
    pub faces: Vec<FaceResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub name: String,
    pub message: String,
    /// Faces found at registration; absent when the check is disabled.
    pub faces_detected: Option<usize>,
}

/// A persisted, decoded upload together with its faces.
struct PreparedImage {
    stored: StoredFile,
    image: RgbImage,
    faces: Vec<DetectedFace>,
}

pub struct FaceService {
    extractor: Arc<dyn FaceExtractor>,
    loader: ImageLoader,
    gallery: Gallery,
    uploads: UploadStore,
    matcher: EuclideanMatcher,
    require_face_on_register: bool,
}

impl FaceService {
    pub fn new(
        settings: ServiceSettings,
        extractor: Arc<dyn FaceExtractor>,
    ) -> Result<Self, ServiceError> {
        let gallery = Gallery::open(&settings.known_faces_dir)?.with_cache(settings.gallery_cache);
        let uploads = UploadStore::open(&settings.temp_dir, &settings.temp_url_prefix)?;
        Ok(Self {
            extractor,
            loader: ImageLoader::new(settings.resize),
            gallery,
            uploads,
            matcher: EuclideanMatcher {
                tolerance: settings.tolerance,
            },
            require_face_on_register: settings.require_face_on_register,
        })
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Compare the faces in `file1` against the gallery (`db`) or the first
    /// face of `file2` (`upload`).
    ///
    /// Mode and required fields are validated before anything is written or
    /// decoded.
    pub fn compare(
        &self,
        mode: &str,
        file1: Option<UploadedFile>,
        file2: Option<UploadedFile>,
    ) -> Result<CompareResponse, ServiceError> {
        let mode: CompareMode = mode.parse()?;
        let file1 = require_image(file1, "file1", "First image is required")?;
        let file2 = match mode {
            CompareMode::Upload => Some(require_image(
                file2,
                "file2",
                "Second image required for mode='upload'",
            )?),
            CompareMode::Db => None,
        };

        let query = self.prepare(ImageSlot::First, &file1)?;
        tracing::info!(?mode, faces = query.faces.len(), "comparing query image");

        let faces = match (mode, file2) {
            (CompareMode::Upload, Some(file2)) => {
                let target = self.prepare(ImageSlot::Second, &file2)?;
                self.compare_with_target(&query, &target)?
            }
            _ => self.compare_with_gallery(&query)?,
        };

        Ok(CompareResponse {
            mode,
            query_url: query.stored.url,
            faces,
        })
    }

    fn compare_with_gallery(&self, query: &PreparedImage) -> Result<Vec<FaceResult>, ServiceError> {
        let gallery = self.gallery.encode(self.extractor.as_ref(), &self.loader)?;
        let mut copies: HashMap<PathBuf, String> = HashMap::new();

        let mut results = Vec::with_capacity(query.faces.len());
        for (face_index, face) in query.faces.iter().enumerate() {
            let outcome = self.matcher.best_match(&face.embedding, &gallery);
            let face_url = self.persist_crop(query, &face.bbox)?;

            let (verdict, match_url) = match (&outcome.name, outcome.score()) {
                (Some(name), Some(score)) => {
                    let url = match &outcome.path {
                        Some(path) => match copies.get(path) {
                            Some(url) => Some(url.clone()),
                            None => {
                                let url = self.uploads.copy_in(path)?.url;
                                copies.insert(path.clone(), url.clone());
                                Some(url)
                            }
                        },
                        None => None,
                    };
                    (format!("Match found: {name} (score: {score:.2})"), url)
                }
                _ => ("No match found in database.".to_string(), None),
            };

            results.push(FaceResult {
                face_index,
                bbox: face.bbox.clone(),
                matched: outcome.is_match(),
                verdict,
                score: outcome.score(),
                name: outcome.name,
                distance: outcome.distance,
                face_url,
                match_url,
            });
        }
        Ok(results)
    }

    fn compare_with_target(
        &self,
        query: &PreparedImage,
        target: &PreparedImage,
    ) -> Result<Vec<FaceResult>, ServiceError> {
        let Some(target_face) = target.faces.first() else {
            return Err(ServiceError::NoFaceDetected {
                slot: ImageSlot::Second,
                image_url: Some(target.stored.url.clone()),
            });
        };

        let mut results = Vec::with_capacity(query.faces.len());
        for (face_index, face) in query.faces.iter().enumerate() {
            let v = self.matcher.verify(&face.embedding, &target_face.embedding);
            let score = v.score();
            let verdict = if v.matched {
                format!("Images match! (score: {score:.2})")
            } else {
                format!("Images do not match (score: {score:.2})")
            };

            results.push(FaceResult {
                face_index,
                bbox: face.bbox.clone(),
                matched: v.matched,
                verdict,
                name: None,
                distance: Some(v.distance),
                score: Some(score),
                face_url: self.persist_crop(query, &face.bbox)?,
                match_url: Some(target.stored.url.clone()),
            });
        }
        Ok(results)
    }

    /// Register `file` under `name` in the gallery.
    pub fn register(
        &self,
        name: &str,
        file: Option<UploadedFile>,
    ) -> Result<RegisterResponse, ServiceError> {
        let name = name.trim();
        gallery::validate_name(name)?;
        let file = require_image(file, "file", "Image file is required")?;
        let extension = loader::extension_of(&file.file_name).ok_or_else(|| {
            ServiceError::Validation(format!("unsupported file type: {}", file.file_name))
        })?;

        let image = self
            .loader
            .load_bytes(&file.bytes)
            .map_err(|source| ServiceError::Image {
                slot: ImageSlot::Registration,
                image_url: None,
                source,
            })?;

        let faces_detected = if self.require_face_on_register {
            let count = self.extractor.extract(&image)?.len();
            if count == 0 {
                return Err(ServiceError::NoFaceDetected {
                    slot: ImageSlot::Registration,
                    image_url: None,
                });
            }
            Some(count)
        } else {
            None
        };

        self.gallery.register(name, &extension, &file.bytes)?;
        Ok(RegisterResponse {
            name: name.to_string(),
            message: format!("{name} registered successfully!"),
            faces_detected,
        })
    }

    /// Names of all registered identities, ordered by file name.
    pub fn gallery_names(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.gallery.entries()?.into_iter().map(|e| e.name).collect())
    }

    fn prepare(&self, slot: ImageSlot, file: &UploadedFile) -> Result<PreparedImage, ServiceError> {
        let stored = self.uploads.persist(&file.bytes)?;

        let image = match self.loader.load_bytes(&file.bytes) {
            Ok(image) => image,
            Err(source) => {
                tracing::info!(%slot, error = %source, url = %stored.url, "upload rejected");
                return Err(ServiceError::Image {
                    slot,
                    image_url: Some(stored.url),
                    source,
                });
            }
        };

        let faces = self.extractor.extract(&image)?;
        if faces.is_empty() {
            return Err(ServiceError::NoFaceDetected {
                slot,
                image_url: Some(stored.url),
            });
        }

        Ok(PreparedImage {
            stored,
            image,
            faces,
        })
    }

    /// Persist the face crop; falls back to the full image if the box is empty.
    fn persist_crop(&self, query: &PreparedImage, bbox: &BoundingBox) -> Result<String, ServiceError> {
        match crop_face(&query.image, bbox) {
            Some(crop) => Ok(self.uploads.persist_image(&crop)?.url),
            None => Ok(query.stored.url.clone()),
        }
    }
}

fn require_image(
    file: Option<UploadedFile>,
    field: &str,
    missing: &str,
) -> Result<UploadedFile, ServiceError> {
    let file = file.ok_or_else(|| ServiceError::Validation(missing.to_string()))?;
    if !loader::is_accepted_extension(&file.file_name) {
        return Err(ServiceError::Validation(format!(
            "{field}: unsupported file type {:?}; accepted: {}",
            file.file_name,
            loader::ACCEPTED_EXTENSIONS.join(", ")
        )));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiles_png, TileExtractor};
    use tempfile::TempDir;

    const QUERY: [u8; 3] = [100, 100, 100];
    const NEAR: [u8; 3] = [130, 100, 100];
    const FAR: [u8; 3] = [200, 200, 200];
    const BLACK: [u8; 3] = [0, 0, 0];

    struct Fixture {
        dir: TempDir,
        extractor: Arc<TileExtractor>,
        service: FaceService,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let extractor = Arc::new(TileExtractor::new());
            let settings = ServiceSettings {
                known_faces_dir: dir.path().join("known_faces"),
                temp_dir: dir.path().join("temp"),
                ..ServiceSettings::default()
            };
            let service = FaceService::new(settings, extractor.clone()).unwrap();
            Self {
                dir,
                extractor,
                service,
            }
        }

        fn add_known(&self, file: &str, colors: &[[u8; 3]]) {
            std::fs::write(self.dir.path().join("known_faces").join(file), tiles_png(colors)).unwrap();
        }

        fn temp_files(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("temp")).unwrap().count()
        }
    }

    fn upload(name: &str, colors: &[[u8; 3]]) -> Option<UploadedFile> {
        Some(UploadedFile {
            file_name: name.into(),
            bytes: tiles_png(colors),
        })
    }

    #[test]
    fn test_db_mode_matches_gallery() {
        let fx = Fixture::new();
        fx.add_known("alice.png", &[NEAR]);
        fx.add_known("bob.png", &[FAR]);

        let resp = fx.service.compare("db", upload("q.png", &[QUERY]), None).unwrap();
        assert_eq!(resp.mode, CompareMode::Db);
        assert_eq!(resp.faces.len(), 1);

        let face = &resp.faces[0];
        assert!(face.matched);
        assert_eq!(face.name.as_deref(), Some("alice"));
        assert_eq!(face.score, Some(0.7));
        assert_eq!(face.verdict, "Match found: alice (score: 0.70)");
        assert!(face.match_url.as_deref().unwrap().starts_with("/static/temp/"));
        assert!(face.face_url.starts_with("/static/temp/"));
    }

    #[test]
    fn test_db_mode_empty_gallery_no_match() {
        let fx = Fixture::new();
        let resp = fx.service.compare("db", upload("q.jpg", &[QUERY]), None).unwrap();

        let face = &resp.faces[0];
        assert!(!face.matched);
        assert_eq!(face.name, None);
        assert_eq!(face.score, None);
        assert_eq!(face.distance, None);
        assert_eq!(face.match_url, None);
        assert_eq!(face.verdict, "No match found in database.");
    }

    #[test]
    fn test_db_mode_faceless_reference_ignored() {
        let fx = Fixture::new();
        fx.add_known("alice.png", &[NEAR]);
        fx.add_known("empty.png", &[BLACK]);
        std::fs::write(fx.dir.path().join("known_faces/broken.jpg"), b"garbage").unwrap();

        let resp = fx.service.compare("db", upload("q.png", &[QUERY]), None).unwrap();
        assert_eq!(resp.faces[0].name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_db_mode_two_faces_two_results() {
        let fx = Fixture::new();
        fx.add_known("alice.png", &[NEAR]);

        let resp = fx
            .service
            .compare("db", upload("group.png", &[QUERY, FAR]), None)
            .unwrap();
        assert_eq!(resp.faces.len(), 2);
        assert_eq!(resp.faces[0].face_index, 0);
        assert!(resp.faces[0].matched);
        assert_eq!(resp.faces[1].face_index, 1);
        assert!(!resp.faces[1].matched);
        assert_ne!(resp.faces[0].face_url, resp.faces[1].face_url);
        // Gallery is encoded once per request, not once per query face.
        assert_eq!(fx.extractor.calls(), 2);
    }

    #[test]
    fn test_upload_mode_match() {
        let fx = Fixture::new();
        let resp = fx
            .service
            .compare("upload", upload("a.png", &[QUERY]), upload("b.png", &[NEAR]))
            .unwrap();

        let face = &resp.faces[0];
        assert!(face.matched);
        assert_eq!(face.score, Some(0.7));
        assert_eq!(face.verdict, "Images match! (score: 0.70)");
        assert!(face.match_url.is_some());
    }

    #[test]
    fn test_upload_mode_uses_first_target_face_only() {
        let fx = Fixture::new();
        let resp = fx
            .service
            .compare(
                "upload",
                upload("a.png", &[QUERY]),
                upload("b.png", &[FAR, QUERY]),
            )
            .unwrap();

        let face = &resp.faces[0];
        assert!(!face.matched);
        assert!(face.verdict.starts_with("Images do not match (score: "));
        assert!(face.score.is_some());
    }

    #[test]
    fn test_upload_mode_missing_second_file() {
        let fx = Fixture::new();
        let err = fx
            .service
            .compare("upload", upload("a.png", &[QUERY]), None)
            .unwrap_err();

        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("Second image")));
        assert_eq!(fx.extractor.calls(), 0);
        assert_eq!(fx.temp_files(), 0);
    }

    #[test]
    fn test_invalid_mode_touches_nothing() {
        let fx = Fixture::new();
        let err = fx
            .service
            .compare("both", upload("a.png", &[QUERY]), upload("b.png", &[QUERY]))
            .unwrap_err();

        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Invalid mode. Use 'db' or 'upload'");
        assert_eq!(fx.temp_files(), 0);
    }

    #[test]
    fn test_bad_extension_rejected_before_persisting() {
        let fx = Fixture::new();
        let err = fx
            .service
            .compare("db", upload("face.gif", &[QUERY]), None)
            .unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(fx.temp_files(), 0);
    }

    #[test]
    fn test_no_face_references_saved_file() {
        let fx = Fixture::new();
        let err = fx
            .service
            .compare("db", upload("blank.png", &[BLACK]), None)
            .unwrap_err();

        assert!(matches!(
            err,
            ServiceError::NoFaceDetected {
                slot: ImageSlot::First,
                ..
            }
        ));
        assert_eq!(err.to_string(), "No face found in first image");
        assert!(err.image_url().unwrap().starts_with("/static/temp/"));
        assert_eq!(fx.temp_files(), 1);
    }

    #[test]
    fn test_undecodable_upload() {
        let fx = Fixture::new();
        let file = Some(UploadedFile {
            file_name: "x.jpg".into(),
            bytes: b"nope".to_vec(),
        });
        let err = fx.service.compare("db", file, None).unwrap_err();

        assert!(matches!(err, ServiceError::Image { .. }));
        assert!(err.is_client_error());
        assert!(err.image_url().is_some());
    }

    #[test]
    fn test_no_face_in_second_image() {
        let fx = Fixture::new();
        let err = fx
            .service
            .compare("upload", upload("a.png", &[QUERY]), upload("b.png", &[BLACK]))
            .unwrap_err();
        assert_eq!(err.to_string(), "No face found in second image");
    }

    #[test]
    fn test_register_then_match() {
        let fx = Fixture::new();
        let resp = fx.service.register("carol", upload("c.PNG", &[NEAR])).unwrap();
        assert_eq!(resp.message, "carol registered successfully!");
        assert_eq!(resp.faces_detected, Some(1));
        assert_eq!(fx.service.gallery_names().unwrap(), vec!["carol"]);

        let result = fx.service.compare("db", upload("q.png", &[QUERY]), None).unwrap();
        assert_eq!(result.faces[0].name.as_deref(), Some("carol"));
    }

    #[test]
    fn test_match_url_shows_matched_reference() {
        let fx = Fixture::new();
        fx.service.register("alice", upload("old.png", &[FAR])).unwrap();
        fx.service.register("alice", upload("new.jpg", &[NEAR])).unwrap();
        assert_eq!(fx.service.gallery_names().unwrap(), vec!["alice"]);

        let resp = fx.service.compare("db", upload("q.png", &[QUERY]), None).unwrap();
        let face = &resp.faces[0];
        assert_eq!(face.name.as_deref(), Some("alice"));
        assert_eq!(face.score, Some(0.7));

        let shown = face.match_url.as_deref().unwrap();
        let file_name = shown.rsplit('/').next().unwrap();
        let copy = fx.service.uploads().resolve(file_name).unwrap();
        assert_eq!(std::fs::read(copy).unwrap(), tiles_png(&[NEAR]));
    }

    #[test]
    fn test_duplicate_names_link_the_winning_file() {
        let fx = Fixture::new();
        fx.add_known("alice.jpg", &[NEAR]);
        fx.add_known("alice.png", &[FAR]);

        let resp = fx.service.compare("db", upload("q.png", &[QUERY]), None).unwrap();
        let face = &resp.faces[0];
        assert_eq!(face.name.as_deref(), Some("alice"));

        let file_name = face.match_url.as_deref().unwrap().rsplit('/').next().unwrap();
        let copy = fx.service.uploads().resolve(file_name).unwrap();
        assert_eq!(std::fs::read(copy).unwrap(), tiles_png(&[NEAR]));
    }

    #[test]
    fn test_register_requires_face() {
        let fx = Fixture::new();
        let err = fx.service.register("nobody", upload("n.png", &[BLACK])).unwrap_err();
        assert!(matches!(err, ServiceError::NoFaceDetected { .. }));
        assert!(fx.service.gallery_names().unwrap().is_empty());
    }

    #[test]
    fn test_register_rejects_path_names() {
        let fx = Fixture::new();
        let err = fx
            .service
            .register("../../etc/passwd", upload("c.png", &[NEAR]))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn test_response_serializes_mode_lowercase() {
        let fx = Fixture::new();
        let resp = fx.service.compare("db", upload("q.png", &[QUERY]), None).unwrap();
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["mode"], "db");
        assert!(json["faces"][0]["score"].is_null());
    }
}
