//! Image decoding into canonical RGB8 pixel buffers.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, RgbImage};
use std::path::Path;
use thiserror::Error;

/// File extensions accepted for uploads and gallery entries.
pub const ACCEPTED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("not a valid image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("unsupported image shape: {0}")]
    UnsupportedShape(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Dimension policy applied after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizePolicy {
    /// Keep original dimensions (needed for reliable multi-face detection).
    #[default]
    Original,
    /// Resize exactly to the given dimensions.
    Fixed { width: u32, height: u32 },
}

impl std::str::FromStr for ResizePolicy {
    type Err = String;

    /// Parses `original` or `WIDTHxHEIGHT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("original") {
            return Ok(Self::Original);
        }
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected 'original' or WIDTHxHEIGHT, got {s:?}"))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("bad width in {s:?}"))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("bad height in {s:?}"))?;
        if width == 0 || height == 0 {
            return Err(format!("resize dimensions must be non-zero, got {s:?}"));
        }
        Ok(Self::Fixed { width, height })
    }
}

/// Decodes uploads and reference images into RGB8.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageLoader {
    resize: ResizePolicy,
}

impl ImageLoader {
    pub fn new(resize: ResizePolicy) -> Self {
        Self { resize }
    }

    pub fn resize_policy(&self) -> ResizePolicy {
        self.resize
    }

    pub fn load_bytes(&self, bytes: &[u8]) -> Result<RgbImage, LoadError> {
        let decoded = image::load_from_memory(bytes)?;
        self.canonicalize(decoded)
    }

    pub fn load_path(&self, path: &Path) -> Result<RgbImage, LoadError> {
        let bytes = std::fs::read(path)?;
        self.load_bytes(&bytes)
    }

    fn canonicalize(&self, decoded: DynamicImage) -> Result<RgbImage, LoadError> {
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(LoadError::UnsupportedShape(format!(
                "empty image {}x{}",
                decoded.width(),
                decoded.height()
            )));
        }

        match decoded.color() {
            ColorType::L8
            | ColorType::La8
            | ColorType::Rgb8
            | ColorType::Rgba8
            | ColorType::L16
            | ColorType::La16
            | ColorType::Rgb16
            | ColorType::Rgba16
            | ColorType::Rgb32F
            | ColorType::Rgba32F => {}
            other => {
                return Err(LoadError::UnsupportedShape(format!(
                    "cannot convert {other:?} to 3-channel RGB"
                )))
            }
        }

        let rgb = decoded.into_rgb8();
        Ok(match self.resize {
            ResizePolicy::Original => rgb,
            ResizePolicy::Fixed { width, height } => {
                imageops::resize(&rgb, width, height, FilterType::Triangle)
            }
        })
    }
}

/// Whether `file_name` carries an accepted image extension (case-insensitive).
pub fn is_accepted_extension(file_name: &str) -> bool {
    extension_of(file_name).is_some()
}

/// The lowercased accepted extension of `file_name`, if any.
pub fn extension_of(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    ACCEPTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Slice a detected face out of `image`, clamped to the image bounds.
///
/// Returns `None` when the clamped region is empty.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = bbox.x.max(0.0).min(w).floor();
    let y0 = bbox.y.max(0.0).min(h).floor();
    let x1 = (bbox.x + bbox.width).max(0.0).min(w).ceil();
    let y1 = (bbox.y + bbox.height).max(0.0).min(h).ceil();

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let view = imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    );
    Some(view.to_image())
}
