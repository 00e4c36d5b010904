//! Frame sources feeding the producer.
//!
//! Decoding is not this crate's concern: a source hands out RGB frames,
//! reports end-of-stream by returning `None` and can be rewound.

use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::SourceConfig;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("No frames found in {0}")]
    NoFrames(PathBuf),

    #[error("Invalid source dimensions {0}x{1}")]
    InvalidDimensions(u32, u32),
}

/// A readable, rewindable stream of frames
pub trait FrameSource: Send {
    /// Next frame, or `None` on end-of-stream / read failure
    fn read(&mut self) -> Option<RgbImage>;

    /// Rewind to the first frame
    fn reset_to_start(&mut self);

    fn is_open(&self) -> bool;
}

/// Acquires (and re-acquires) a frame source
pub trait SourceFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError>;
}

impl SourceFactory for SourceConfig {
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        match self {
            SourceConfig::Synthetic {
                width,
                height,
                frames,
            } => Ok(Box::new(SyntheticSource::new(*width, *height, *frames)?)),
            SourceConfig::ImageDir { path } => Ok(Box::new(ImageDirSource::open(path)?)),
        }
    }
}

/// Moving gradient test pattern of a fixed length
#[derive(Debug)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frames: u32,
    position: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frames: u32) -> Result<Self, SourceError> {
        if width == 0 || height == 0 {
            return Err(SourceError::InvalidDimensions(width, height));
        }
        Ok(Self {
            width,
            height,
            frames,
            position: 0,
        })
    }

    pub fn position(&self) -> u32 {
        self.position
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Option<RgbImage> {
        if self.position >= self.frames {
            return None;
        }
        let shift = self.position;
        self.position += 1;
        Some(RgbImage::from_fn(self.width, self.height, |x, y| {
            let band = ((x + shift * 4) % 256) as u8;
            Rgb([band, (y % 256) as u8, (shift % 256) as u8])
        }))
    }

    fn reset_to_start(&mut self) {
        self.position = 0;
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Plays the images of a directory as a looping sequence.
///
/// All frames are decoded on open; the source reports itself closed once the
/// directory disappears so the producer re-acquires it.
#[derive(Debug)]
pub struct ImageDirSource {
    dir: PathBuf,
    frames: Vec<RgbImage>,
    position: usize,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

impl ImageDirSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref().to_path_buf();
        let entries = std::fs::read_dir(&dir).map_err(|e| SourceError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let image = image::open(&path).map_err(|e| SourceError::Decode {
                path: path.clone(),
                source: e,
            })?;
            frames.push(image.to_rgb8());
        }

        if frames.is_empty() {
            return Err(SourceError::NoFrames(dir));
        }

        log::info!("Loaded {} frames from {}", frames.len(), dir.display());

        Ok(Self {
            dir,
            frames,
            position: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn read(&mut self) -> Option<RgbImage> {
        let frame = self.frames.get(self.position)?.clone();
        self.position += 1;
        Some(frame)
    }

    fn reset_to_start(&mut self) {
        self.position = 0;
    }

    fn is_open(&self) -> bool {
        self.dir.is_dir()
    }
}
