use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::consolidation::{Consolidation, Consolidator};
use super::detector::{Detector, VideoSource};
use crate::tasks::{TaskProgress, UpdateSender};

/// Runs a detector over one video and consolidates its output.
///
/// Blocking; meant to run on a blocking thread. Progress is reported per
/// sampled frame and stops short of 100 until the result is committed.
pub struct FrameProcessor {
    detector: Arc<dyn Detector>,
    sample_rate_hz: u32,
    min_confidence: f64,
}

impl FrameProcessor {
    pub fn new(detector: Arc<dyn Detector>, sample_rate_hz: u32, min_confidence: f64) -> Self {
        Self {
            detector,
            sample_rate_hz,
            min_confidence,
        }
    }

    pub fn process(
        &self,
        video: &VideoSource,
        updates: &UpdateSender,
        cancel_flag: &AtomicBool,
    ) -> Result<Consolidation> {
        let stream = self.detector.detect_frames(video, self.sample_rate_hz)?;
        let total = stream.expected_frames;

        let mut consolidator = Consolidator::new();
        let mut processed = 0;
        let mut last_percent = 0;

        for frame in stream {
            if cancel_flag.load(Ordering::SeqCst) {
                bail!("processing of video {} interrupted", video.video_id);
            }

            let mut frame = frame?;
            // Weak detections are dropped before they count anywhere.
            frame
                .detections
                .retain(|d| d.confidence >= self.min_confidence);
            consolidator.push(frame);

            processed += 1;
            let percent = TaskProgress::new(processed, total).percent().min(99);
            if percent > last_percent {
                last_percent = percent;
                let _ = updates.send(TaskProgress::new(processed, total));
            }
        }

        Ok(consolidator.finish())
    }
}
