//! Identity consolidation: turns tracked per-frame detections into persons.
//!
//! Detections are grouped by provisional track id. Each group becomes one
//! person, numbered from 1 in order of first appearance, with a single best
//! face (highest confidence, earliest on ties).

use std::collections::{HashMap, HashSet};

use super::detector::FrameDetections;
use crate::db::{person_label, BoundingBox, PeoplePerFrame, TrackingData};

#[derive(Debug, Clone)]
pub struct FaceSample {
    pub frame_number: i64,
    pub timestamp: f64,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub image: Vec<u8>,
}

/// A consolidated identity, not yet persisted.
#[derive(Debug, Clone)]
pub struct PersonTrack {
    pub track_id: u64,
    pub person_number: i64,
    pub first_frame: i64,
    pub last_frame: i64,
    pub first_seen: f64,
    pub last_seen: f64,
    /// Distinct frames the person was observed in
    pub total_frames: i64,
    /// Face crops in stream order
    pub faces: Vec<FaceSample>,
    /// Index into `faces` of the representative crop
    pub best_face: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Consolidation {
    pub total_frames: i64,
    pub total_people: i64,
    pub people_per_frame: Vec<PeoplePerFrame>,
    pub tracking_data: Vec<TrackingData>,
    pub persons: Vec<PersonTrack>,
}

impl Consolidation {
    pub fn unique_people(&self) -> i64 {
        self.persons.len() as i64
    }
}

struct Candidate {
    first_frame: i64,
    last_frame: i64,
    first_seen: f64,
    last_seen: f64,
    frames: HashSet<i64>,
    faces: Vec<FaceSample>,
}

struct RawDetection {
    track_id: u64,
    frame_number: i64,
    timestamp: f64,
    bbox: BoundingBox,
    confidence: f64,
}

/// Accumulates frames as they stream out of the detector.
#[derive(Default)]
pub struct Consolidator {
    total_frames: i64,
    total_people: i64,
    people_per_frame: Vec<PeoplePerFrame>,
    raw: Vec<RawDetection>,
    candidates: HashMap<u64, Candidate>,
}

impl Consolidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: FrameDetections) {
        let count = frame.detections.len() as i64;
        let confidence = if count == 0 {
            0.0
        } else {
            frame.detections.iter().map(|d| d.confidence).sum::<f64>() / count as f64
        };

        self.total_frames += 1;
        self.total_people += count;
        self.people_per_frame.push(PeoplePerFrame {
            frame_number: frame.frame_number,
            timestamp: frame.timestamp,
            count,
            confidence,
        });

        for detection in frame.detections {
            self.raw.push(RawDetection {
                track_id: detection.track_id,
                frame_number: frame.frame_number,
                timestamp: frame.timestamp,
                bbox: detection.bbox,
                confidence: detection.confidence,
            });

            let candidate = self
                .candidates
                .entry(detection.track_id)
                .or_insert_with(|| Candidate {
                    first_frame: frame.frame_number,
                    last_frame: frame.frame_number,
                    first_seen: frame.timestamp,
                    last_seen: frame.timestamp,
                    frames: HashSet::new(),
                    faces: Vec::new(),
                });
            candidate.first_frame = candidate.first_frame.min(frame.frame_number);
            candidate.last_frame = candidate.last_frame.max(frame.frame_number);
            candidate.first_seen = candidate.first_seen.min(frame.timestamp);
            candidate.last_seen = candidate.last_seen.max(frame.timestamp);
            candidate.frames.insert(frame.frame_number);

            if let Some(image) = detection.face_image {
                candidate.faces.push(FaceSample {
                    frame_number: frame.frame_number,
                    timestamp: frame.timestamp,
                    bbox: detection.bbox,
                    confidence: detection.confidence,
                    image,
                });
            }
        }
    }

    pub fn finish(self) -> Consolidation {
        let mut ordered: Vec<(u64, Candidate)> = self.candidates.into_iter().collect();
        ordered.sort_by(|(a_id, a), (b_id, b)| {
            a.first_seen
                .total_cmp(&b.first_seen)
                .then(a.first_frame.cmp(&b.first_frame))
                .then(a_id.cmp(b_id))
        });

        let mut numbers = HashMap::with_capacity(ordered.len());
        let persons: Vec<PersonTrack> = ordered
            .into_iter()
            .enumerate()
            .map(|(idx, (track_id, candidate))| {
                let person_number = idx as i64 + 1;
                numbers.insert(track_id, person_number);
                PersonTrack {
                    track_id,
                    person_number,
                    first_frame: candidate.first_frame,
                    last_frame: candidate.last_frame,
                    first_seen: candidate.first_seen,
                    last_seen: candidate.last_seen,
                    total_frames: candidate.frames.len() as i64,
                    best_face: best_face(&candidate.faces),
                    faces: candidate.faces,
                }
            })
            .collect();

        let tracking_data = self
            .raw
            .into_iter()
            .map(|d| TrackingData {
                person_id: person_label(numbers.get(&d.track_id).copied().unwrap_or_default()),
                frame_number: d.frame_number,
                timestamp: d.timestamp,
                bbox: d.bbox,
                confidence: d.confidence,
            })
            .collect();

        Consolidation {
            total_frames: self.total_frames,
            total_people: self.total_people,
            people_per_frame: self.people_per_frame,
            tracking_data,
            persons,
        }
    }
}

/// Consolidates a complete sequence of frames.
pub fn consolidate<I>(frames: I) -> Consolidation
where
    I: IntoIterator<Item = FrameDetections>,
{
    let mut consolidator = Consolidator::new();
    for frame in frames {
        consolidator.push(frame);
    }
    consolidator.finish()
}

/// Highest confidence wins; on equal confidence the earliest crop wins.
fn best_face(faces: &[FaceSample]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, face) in faces.iter().enumerate() {
        let better = match best {
            None => true,
            Some(b) => {
                let current = &faces[b];
                face.confidence > current.confidence
                    || (face.confidence == current.confidence && face.timestamp < current.timestamp)
            }
        };
        if better {
            best = Some(idx);
        }
    }
    best
}
