//! Deterministic stand-in detector.
//!
//! The hash of the video content seeds a random scene of people walking
//! across the frame.
//! Identical input always yields identical detections, track ids and face
//! crops, so results are reproducible across runs.

use std::io::Cursor;

use anyhow::{ensure, Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use super::detector::{
    Detection, Detector, FrameDetections, FrameStream, ReferenceError, ReferenceSource, VideoSource,
};
use super::matching::{face_signature, match_roster};
use super::tracker::IouTracker;
use crate::db::{BoundingBox, Match, Person};

/// Frame rate assumed when converting sample timestamps to frame numbers.
const SOURCE_FPS: f64 = 30.0;
const DEFAULT_WIDTH: f64 = 1280.0;
const DEFAULT_HEIGHT: f64 = 720.0;
/// Rough bytes per second used when the video has no recorded duration.
const BYTES_PER_SECOND: f64 = 250_000.0;
const FACE_SIZE: u32 = 16;
const MAX_LOST_FRAMES: usize = 2;

const PALETTE: [[u8; 3]; 8] = [
    [220, 40, 40],
    [40, 200, 60],
    [40, 70, 220],
    [230, 200, 30],
    [200, 50, 200],
    [30, 200, 210],
    [240, 130, 20],
    [120, 40, 160],
];

pub struct SimulatedDetector {
    match_threshold: f64,
}

impl SimulatedDetector {
    pub fn new(match_threshold: f64) -> Self {
        Self { match_threshold }
    }
}

/// Duration of a video in seconds, estimated from its size when unknown.
fn effective_duration(video: &VideoSource) -> f64 {
    match video.duration {
        Some(d) if d > 0.0 => d,
        _ => (video.size_bytes as f64 / BYTES_PER_SECOND).clamp(5.0, 600.0),
    }
}

#[derive(Debug, Clone)]
struct Walker {
    top: [u8; 3],
    bottom: [u8; 3],
    x: f64,
    y: f64,
    vx: f64,
    vy: f64,
    size: f64,
    enter: f64,
    exit: f64,
    confidence: f64,
}

impl Walker {
    fn random(rng: &mut StdRng, width: f64, height: f64, duration: f64) -> Self {
        let size = rng.gen_range(0.08..0.2) * width.min(height);
        let enter = rng.gen_range(0.0..duration * 0.6);
        let stay = rng.gen_range(duration * 0.2..=duration);
        let top = rng.gen_range(0..PALETTE.len());
        let bottom = (top + rng.gen_range(1..PALETTE.len())) % PALETTE.len();
        Self {
            top: PALETTE[top],
            bottom: PALETTE[bottom],
            x: rng.gen_range(0.0..width - size),
            y: rng.gen_range(0.0..height - size),
            vx: rng.gen_range(-40.0..40.0),
            vy: rng.gen_range(-15.0..15.0),
            size,
            enter,
            exit: (enter + stay).min(duration),
            confidence: rng.gen_range(0.72..0.98),
        }
    }

    fn bbox_at(&self, t: f64, width: f64, height: f64) -> Option<BoundingBox> {
        if t < self.enter || t > self.exit {
            return None;
        }
        let dt = t - self.enter;
        Some(BoundingBox {
            x: reflect(self.x + self.vx * dt, width - self.size),
            y: reflect(self.y + self.vy * dt, height - self.size),
            width: self.size,
            height: self.size,
        })
    }
}

/// Folds a coordinate back into `[0, max]` as if bouncing off the edges.
fn reflect(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    let period = 2.0 * max;
    let folded = value.rem_euclid(period);
    if folded > max {
        period - folded
    } else {
        folded
    }
}

/// Two-tone crop with per-frame noise, PNG encoded.
fn render_face(walker: &Walker, rng: &mut StdRng) -> Result<Vec<u8>> {
    let mut img = RgbImage::new(FACE_SIZE, FACE_SIZE);
    for (_, y, pixel) in img.enumerate_pixels_mut() {
        let base = if y < FACE_SIZE / 2 { walker.top } else { walker.bottom };
        *pixel = Rgb(base.map(|c| (c as i16 + rng.gen_range(-4..=4)).clamp(0, 255) as u8));
    }

    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("Failed to encode face crop")?;
    Ok(bytes)
}

impl Detector for SimulatedDetector {
    fn detect_frames<'a>(
        &'a self,
        video: &'a VideoSource,
        sample_rate_hz: u32,
    ) -> Result<FrameStream<'a>> {
        ensure!(sample_rate_hz > 0, "sample rate must be positive");

        let mut hasher = Sha256::new();
        let read = std::io::copy(&mut video.open()?, &mut hasher)
            .with_context(|| format!("Failed to read video {}", video.video_id))?;
        ensure!(read > 0, "video {} is empty", video.video_id);
        let seed: [u8; 32] = hasher.finalize().into();
        let mut rng = StdRng::from_seed(seed);

        let width = video
            .width
            .filter(|w| *w > 0)
            .map_or(DEFAULT_WIDTH, |w| w as f64);
        let height = video
            .height
            .filter(|h| *h > 0)
            .map_or(DEFAULT_HEIGHT, |h| h as f64);
        let duration = effective_duration(video);
        let total = ((duration * sample_rate_hz as f64).floor() as usize).max(1);

        let walker_count = rng.gen_range(1..=4);
        let walkers: Vec<Walker> = (0..walker_count)
            .map(|_| Walker::random(&mut rng, width, height, duration))
            .collect();
        let mut tracker = IouTracker::new(MAX_LOST_FRAMES);

        let frames = (0..total).map(move |i| -> Result<FrameDetections> {
            let timestamp = i as f64 / sample_rate_hz as f64;

            let mut visible = Vec::new();
            for walker in &walkers {
                if let Some(bbox) = walker.bbox_at(timestamp, width, height) {
                    let jitter: f64 = rng.gen_range(-0.2..0.02);
                    visible.push((walker, bbox, (walker.confidence + jitter).clamp(0.0, 1.0)));
                }
            }

            let boxes: Vec<(BoundingBox, f64)> =
                visible.iter().map(|(_, bbox, conf)| (*bbox, *conf)).collect();
            let ids = tracker.assign(&boxes);

            let mut detections = Vec::with_capacity(visible.len());
            for ((walker, bbox, confidence), id) in visible.into_iter().zip(ids) {
                let Some(track_id) = id else {
                    continue;
                };
                detections.push(Detection {
                    track_id,
                    bbox,
                    confidence,
                    face_image: Some(render_face(walker, &mut rng)?),
                });
            }

            Ok(FrameDetections {
                frame_number: (timestamp * SOURCE_FPS).round() as i64,
                timestamp,
                detections,
            })
        });

        Ok(FrameStream::new(total, frames))
    }

    fn match_reference(&self, reference: &ReferenceSource, roster: &[Person]) -> Result<Vec<Match>> {
        let signature = face_signature(&reference.bytes).map_err(|e| ReferenceError {
            reference_image_id: reference.reference_image_id,
            reason: format!("{:#}", e),
        })?;
        Ok(match_roster(&signature, roster, self.match_threshold))
    }
}
