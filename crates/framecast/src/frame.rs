//! Frames, processing requests and the image helpers shared by both branches.

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::FrameSize;

/// A captured frame tagged with its correlation id.
///
/// Immutable once built; derived copies keep the id of the capture they came from.
#[derive(Debug, Clone)]
pub struct Frame {
    payload: Arc<RgbImage>,
    correlation_id: Uuid,
}

impl Frame {
    /// Tag a freshly captured image with a new correlation id
    pub fn capture(payload: RgbImage) -> Self {
        Self {
            payload: Arc::new(payload),
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn payload(&self) -> &RgbImage {
        &self.payload
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Copy of this frame scaled to `size`, same correlation id
    pub fn resized(&self, size: FrameSize) -> Frame {
        Frame {
            payload: Arc::new(resize(&self.payload, size)),
            correlation_id: self.correlation_id,
        }
    }

    /// Self-contained request for the work queue
    pub fn into_request(self) -> ProcessingRequest {
        ProcessingRequest {
            correlation_id: self.correlation_id,
            payload: Arc::try_unwrap(self.payload).unwrap_or_else(|shared| (*shared).clone()),
        }
    }
}

/// Work queue element. Owns its pixels outright.
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    pub correlation_id: Uuid,
    pub payload: RgbImage,
}

/// Live view wire message, relayed verbatim from the hub to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiMessage {
    /// Base64 encoded JPEG
    pub frame: String,
    pub correlation_id: String,
}

impl UiMessage {
    pub fn from_frame(frame: &Frame, quality: u8) -> Result<Self, image::ImageError> {
        let jpeg = encode_jpeg(frame.payload(), quality)?;
        Ok(Self {
            frame: base64::engine::general_purpose::STANDARD.encode(jpeg),
            correlation_id: frame.correlation_id().to_string(),
        })
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

pub fn resize(image: &RgbImage, size: FrameSize) -> RgbImage {
    if image.width() == size.width && image.height() == size.height {
        return image.clone();
    }
    image::imageops::resize(image, size.width, size.height, FilterType::Triangle)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder.encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )?;
    }
    Ok(out.into_inner())
}
