//! Deterministic stand-ins for the ONNX models, for tests in this and dependent crates.

use crate::extractor::{ExtractError, FaceExtractor};
use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Side length of one synthetic face tile.
pub const TILE: u32 = 20;

/// Treats every non-black `TILE`×`TILE` tile as a face whose embedding is
/// its top-left color divided by 100.
#[derive(Debug, Default)]
pub struct TileExtractor {
    calls: AtomicUsize,
}

impl TileExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of images passed to [`FaceExtractor::extract`] so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceExtractor for TileExtractor {
    fn extract(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut faces = Vec::new();
        for ty in 0..image.height() / TILE {
            for tx in 0..image.width() / TILE {
                let Rgb([r, g, b]) = *image.get_pixel(tx * TILE, ty * TILE);
                if (r, g, b) == (0, 0, 0) {
                    continue;
                }
                faces.push(DetectedFace {
                    bbox: BoundingBox {
                        x: (tx * TILE) as f32,
                        y: (ty * TILE) as f32,
                        width: TILE as f32,
                        height: TILE as f32,
                        confidence: 1.0,
                        landmarks: None,
                    },
                    embedding: Embedding::new(vec![
                        r as f32 / 100.0,
                        g as f32 / 100.0,
                        b as f32 / 100.0,
                    ]),
                });
            }
        }
        Ok(faces)
    }
}

/// A one-row strip of solid tiles, PNG-encoded. `[0, 0, 0]` tiles hold no face.
pub fn tiles_png(colors: &[[u8; 3]]) -> Vec<u8> {
    let width = TILE * colors.len().max(1) as u32;
    let image = RgbImage::from_fn(width, TILE, |x, _| {
        colors
            .get((x / TILE) as usize)
            .map(|c| Rgb(*c))
            .unwrap_or(Rgb([0, 0, 0]))
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("png encode into memory");
    buf.into_inner()
}
