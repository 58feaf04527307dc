//! Greedy IoU tracker assigning provisional track ids.
//!
//! Confident detections are associated with live tracks first; weaker ones
//! may only extend a track that is still unmatched this frame and never
//! open a new one. Tracks that go unmatched for more than `max_lost` frames
//! are dropped, so a person who leaves and comes back gets a new id.

use std::collections::HashSet;

use crate::db::BoundingBox;

const HIGH_CONFIDENCE: f64 = 0.5;
const MIN_IOU: f64 = 0.3;

#[derive(Debug, Clone)]
struct Track {
    id: u64,
    bbox: BoundingBox,
    frames_lost: usize,
    matched: bool,
}

pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u64,
    max_lost: usize,
}

impl IouTracker {
    pub fn new(max_lost: usize) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            max_lost,
        }
    }

    /// Assigns a track id to each detection of one frame, in input order.
    /// Low-confidence detections that extend no existing track get `None`.
    pub fn assign(&mut self, detections: &[(BoundingBox, f64)]) -> Vec<Option<u64>> {
        let mut ids = vec![None; detections.len()];
        for track in &mut self.tracks {
            track.matched = false;
        }
        let existing = self.tracks.len();

        let (high, low): (Vec<usize>, Vec<usize>) =
            (0..detections.len()).partition(|&i| detections[i].1 >= HIGH_CONFIDENCE);

        for stage in [&high, &low] {
            let candidates: Vec<usize> = (0..self.tracks.len())
                .filter(|&t| !self.tracks[t].matched)
                .collect();
            for (t, d) in greedy_pairs(&self.tracks, &candidates, detections, stage) {
                let track = &mut self.tracks[t];
                track.bbox = detections[d].0;
                track.frames_lost = 0;
                track.matched = true;
                ids[d] = Some(track.id);
            }
        }

        for &d in &high {
            if ids[d].is_none() {
                self.tracks.push(Track {
                    id: self.next_id,
                    bbox: detections[d].0,
                    frames_lost: 0,
                    matched: true,
                });
                ids[d] = Some(self.next_id);
                self.next_id += 1;
            }
        }

        for track in self.tracks.iter_mut().take(existing) {
            if !track.matched {
                track.frames_lost += 1;
            }
        }
        let max_lost = self.max_lost;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        ids
    }
}

/// Track/detection pairs above `MIN_IOU`, best overlap first, each side used
/// at most once.
fn greedy_pairs(
    tracks: &[Track],
    track_indices: &[usize],
    detections: &[(BoundingBox, f64)],
    detection_indices: &[usize],
) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
    for &t in track_indices {
        for &d in detection_indices {
            let iou = tracks[t].bbox.iou(&detections[d].0);
            if iou >= MIN_IOU {
                pairs.push((t, d, iou));
            }
        }
    }
    pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut used_tracks = HashSet::new();
    let mut used_detections = HashSet::new();
    pairs
        .into_iter()
        .filter(|&(t, d, _)| {
            if used_tracks.contains(&t) || used_detections.contains(&d) {
                return false;
            }
            used_tracks.insert(t);
            used_detections.insert(d);
            true
        })
        .map(|(t, d, _)| (t, d))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f64, confidence: f64) -> (BoundingBox, f64) {
        (
            BoundingBox {
                x,
                y: 0.0,
                width: 50.0,
                height: 50.0,
            },
            confidence,
        )
    }

    #[test]
    fn test_ids_follow_overlapping_boxes() {
        let mut tracker = IouTracker::new(2);
        let first = tracker.assign(&[at(0.0, 0.9), at(200.0, 0.9)]);
        assert_eq!(first, vec![Some(1), Some(2)]);

        // Input order does not matter, overlap does.
        let second = tracker.assign(&[at(205.0, 0.9), at(5.0, 0.9)]);
        assert_eq!(second, vec![Some(2), Some(1)]);
    }

    #[test]
    fn test_low_confidence_extends_but_never_creates() {
        let mut tracker = IouTracker::new(2);
        tracker.assign(&[at(0.0, 0.9)]);

        let ids = tracker.assign(&[at(3.0, 0.3), at(400.0, 0.3)]);
        assert_eq!(ids, vec![Some(1), None]);
    }

    #[test]
    fn test_lost_tracks_expire() {
        let mut tracker = IouTracker::new(1);
        tracker.assign(&[at(0.0, 0.9)]);
        tracker.assign(&[]);
        // Still within max_lost.
        assert_eq!(tracker.assign(&[at(0.0, 0.9)]), vec![Some(1)]);

        tracker.assign(&[]);
        tracker.assign(&[]);
        assert_eq!(tracker.assign(&[at(0.0, 0.9)]), vec![Some(2)]);
    }
}
