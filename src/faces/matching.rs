//! Reference-face matching and per-video aggregation of matches.

use anyhow::{Context, Result};
use image::imageops::FilterType;

use crate::db::{Match, Person};

/// Side of the colour grid a face crop is reduced to.
const SIGNATURE_GRID: u32 = 4;

/// Reduces an encoded face crop to a mean-centred colour layout vector.
pub fn face_signature(image_bytes: &[u8]) -> Result<Vec<f32>> {
    let img = image::load_from_memory(image_bytes).context("Failed to decode face image")?;
    let small = img
        .resize_exact(SIGNATURE_GRID, SIGNATURE_GRID, FilterType::Triangle)
        .to_rgb8();

    let mut signature: Vec<f32> = small
        .pixels()
        .flat_map(|p| p.0.map(|c| c as f32 / 255.0))
        .collect();
    let mean = signature.iter().sum::<f32>() / signature.len() as f32;
    for value in &mut signature {
        *value -= mean;
    }

    Ok(signature)
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Maps a cosine similarity in [-1, 1] to a confidence in [0, 1].
pub fn similarity_to_confidence(similarity: f32) -> f64 {
    ((similarity as f64 + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Every face of the roster whose similarity to the reference reaches
/// `threshold` becomes a match. Faces that fail to decode are skipped.
pub fn match_roster(reference: &[f32], roster: &[Person], threshold: f64) -> Vec<Match> {
    let mut matches = Vec::new();
    for person in roster {
        for face in &person.faces {
            let signature = match face_signature(&face.face_image) {
                Ok(signature) => signature,
                Err(e) => {
                    tracing::debug!(face_id = face.id, error = %e, "Skipping undecodable face");
                    continue;
                }
            };
            let confidence = similarity_to_confidence(cosine_similarity(reference, &signature));
            if confidence >= threshold {
                matches.push(Match {
                    person_number: person.person_number,
                    frame_number: face.frame_number,
                    timestamp: face.timestamp,
                    bbox: face.bbox,
                    confidence,
                });
            }
        }
    }
    matches
}

/// Aggregates of one video's match list.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSummary {
    pub first_appearance: f64,
    pub last_appearance: f64,
    pub total_appearances: i64,
    pub confidence: f64,
}

/// Matches found in one video during a search.
#[derive(Debug, Clone)]
pub struct VideoMatches {
    pub video_id: i64,
    pub matches: Vec<Match>,
}

impl VideoMatches {
    /// Orders matches by timestamp, then frame, then person.
    pub fn new(video_id: i64, mut matches: Vec<Match>) -> Self {
        matches.sort_by(|a, b| {
            a.timestamp
                .total_cmp(&b.timestamp)
                .then(a.frame_number.cmp(&b.frame_number))
                .then(a.person_number.cmp(&b.person_number))
        });
        Self { video_id, matches }
    }

    /// `None` when there are no matches.
    pub fn summary(&self) -> Option<MatchSummary> {
        let first = self.matches.first()?;
        let mut summary = MatchSummary {
            first_appearance: first.timestamp,
            last_appearance: first.timestamp,
            total_appearances: self.matches.len() as i64,
            confidence: first.confidence,
        };
        for m in &self.matches {
            summary.first_appearance = summary.first_appearance.min(m.timestamp);
            summary.last_appearance = summary.last_appearance.max(m.timestamp);
            summary.confidence = summary.confidence.max(m.confidence);
        }
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BoundingBox, PersonFace};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(top: [u8; 3], bottom: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_fn(16, 16, |_, y| if y < 8 { Rgb(top) } else { Rgb(bottom) });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn person(number: i64, faces: Vec<(f64, Vec<u8>)>) -> Person {
        Person {
            id: number,
            analysis_result_id: 1,
            video_id: 1,
            person_number: number,
            person_id: format!("person_{}", number),
            first_frame: 0,
            last_frame: 0,
            first_seen: 0.0,
            last_seen: 0.0,
            total_frames: faces.len() as i64,
            faces: faces
                .into_iter()
                .enumerate()
                .map(|(i, (timestamp, face_image))| PersonFace {
                    id: i as i64,
                    person_id: number,
                    frame_number: (timestamp * 30.0) as i64,
                    timestamp,
                    bbox: BoundingBox {
                        x: 0.0,
                        y: 0.0,
                        width: 16.0,
                        height: 16.0,
                    },
                    confidence: 0.9,
                    face_image,
                    is_best_face: i == 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
        assert_eq!(similarity_to_confidence(-1.0), 0.0);
    }

    #[test]
    fn test_identical_faces_match() {
        let red_blue = png([200, 20, 20], [20, 20, 200]);
        let reference = face_signature(&red_blue).unwrap();
        assert_eq!(reference.len(), 48);

        let roster = vec![
            person(1, vec![(1.0, red_blue.clone()), (2.0, red_blue.clone())]),
            person(2, vec![(1.5, png([20, 200, 20], [200, 200, 20]))]),
            person(3, vec![(3.0, b"not an image".to_vec())]),
        ];
        let matches = match_roster(&reference, &roster, 0.95);

        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.person_number == 1));
        assert!(matches[0].confidence > 0.99);
    }

    #[test]
    fn test_summary() {
        let roster = vec![person(1, vec![(4.0, vec![]), (1.0, vec![]), (2.0, vec![])])];
        let matches: Vec<Match> = roster[0]
            .faces
            .iter()
            .zip([0.7, 0.9, 0.8])
            .map(|(f, confidence)| Match {
                person_number: 1,
                frame_number: f.frame_number,
                timestamp: f.timestamp,
                bbox: f.bbox,
                confidence,
            })
            .collect();

        let video = VideoMatches::new(7, matches);
        assert_eq!(video.matches[0].timestamp, 1.0);
        let summary = video.summary().unwrap();
        assert_eq!(summary.first_appearance, 1.0);
        assert_eq!(summary.last_appearance, 4.0);
        assert_eq!(summary.total_appearances, 3);
        assert_eq!(summary.confidence, 0.9);

        assert!(VideoMatches::new(8, vec![]).summary().is_none());
    }
}
