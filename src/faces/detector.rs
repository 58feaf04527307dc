//! Detector contract consumed by the analysis and search jobs.
//!
//! A detector turns a video into a lazy stream of per-frame detections that
//! already carry provisional track ids, and compares a reference face
//! against the consolidated persons of one video.

use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::db::{BoundingBox, Match, Person, Video};
use crate::storage::MediaStorage;

/// One detected person in one frame
#[derive(Debug, Clone)]
pub struct Detection {
    /// Provisional id linking detections of the same person across frames
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub confidence: f64,
    /// Encoded face crop, if the detector produced one
    pub face_image: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FrameDetections {
    pub frame_number: i64,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
}

/// A video as handed to the detector. The content stays in storage and is
/// read through [`VideoSource::open`].
#[derive(Clone)]
pub struct VideoSource {
    pub video_id: i64,
    pub duration: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub size_bytes: i64,
    pub filename: String,
    pub storage: Arc<dyn MediaStorage>,
}

impl VideoSource {
    pub fn new(video: &Video, storage: Arc<dyn MediaStorage>) -> Self {
        Self {
            video_id: video.id,
            duration: video.duration,
            width: video.width,
            height: video.height,
            size_bytes: video.size_bytes,
            filename: video.filename.clone(),
            storage,
        }
    }

    /// Opens a fresh reader over the stored content.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        self.storage.open_video(&self.filename)
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceSource {
    pub reference_image_id: i64,
    pub bytes: Vec<u8>,
}

/// Finite, single-pass sequence of sampled frames.
pub struct FrameStream<'a> {
    /// Number of frames the stream is expected to yield, used for progress
    pub expected_frames: usize,
    frames: Box<dyn Iterator<Item = Result<FrameDetections>> + Send + 'a>,
}

impl<'a> FrameStream<'a> {
    pub fn new<I>(expected_frames: usize, frames: I) -> Self
    where
        I: Iterator<Item = Result<FrameDetections>> + Send + 'a,
    {
        Self {
            expected_frames,
            frames: Box::new(frames),
        }
    }
}

impl Iterator for FrameStream<'_> {
    type Item = Result<FrameDetections>;

    fn next(&mut self) -> Option<Self::Item> {
        self.frames.next()
    }
}

/// The reference image itself cannot be used, so no video can match it.
#[derive(Debug, Error)]
#[error("reference image {reference_image_id} is unusable: {reason}")]
pub struct ReferenceError {
    pub reference_image_id: i64,
    pub reason: String,
}

pub trait Detector: Send + Sync {
    /// Samples the video at `sample_rate_hz` frames per second.
    fn detect_frames<'a>(
        &'a self,
        video: &'a VideoSource,
        sample_rate_hz: u32,
    ) -> Result<FrameStream<'a>>;

    /// Compares the reference face against the persons of one video.
    /// Errors carrying a [`ReferenceError`] fail the whole search; any other
    /// error only skips this video.
    fn match_reference(&self, reference: &ReferenceSource, roster: &[Person]) -> Result<Vec<Match>>;
}
