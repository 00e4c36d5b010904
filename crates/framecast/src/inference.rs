//! Inference collaborator used by the consumer.

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferError {
    #[error("Empty frame ({0}x{1})")]
    EmptyFrame(u32, u32),

    #[error("Inference failed: {0}")]
    Failed(String),
}

/// A single detection in frame pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    /// `[x_min, y_min, x_max, y_max]`, inclusive
    pub bbox: [u32; 4],
}

pub type Detections = Vec<Detection>;

/// Synchronous, possibly slow, detector. Called from a blocking thread.
pub trait Inferer: Send + Sync {
    fn infer(&self, frame: &RgbImage) -> Result<Detections, InferError>;
}

/// Finds the bounding box of pixels brighter than a luma threshold
#[derive(Debug, Clone)]
pub struct LumaThresholdDetector {
    pub threshold: u8,
}

impl Default for LumaThresholdDetector {
    fn default() -> Self {
        Self { threshold: 200 }
    }
}

fn luma(pixel: &image::Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u8
}

impl Inferer for LumaThresholdDetector {
    fn infer(&self, frame: &RgbImage) -> Result<Detections, InferError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(InferError::EmptyFrame(width, height));
        }

        let mut bbox: Option<[u32; 4]> = None;
        let mut bright = 0u64;
        for (x, y, pixel) in frame.enumerate_pixels() {
            if luma(pixel) < self.threshold {
                continue;
            }
            bright += 1;
            bbox = Some(match bbox {
                None => [x, y, x, y],
                Some([x0, y0, x1, y1]) => [x0.min(x), y0.min(y), x1.max(x), y1.max(y)],
            });
        }

        Ok(bbox
            .map(|bbox| {
                let area = u64::from(bbox[2] - bbox[0] + 1) * u64::from(bbox[3] - bbox[1] + 1);
                vec![Detection {
                    label: "bright_region".to_string(),
                    score: bright as f32 / area as f32,
                    bbox,
                }]
            })
            .unwrap_or_default())
    }
}
