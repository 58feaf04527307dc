//! Analysis results, consolidated persons and their faces.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize, Serializer};

use super::backend::ResultStore;
use super::catalog::VideoStatus;
use super::sqlite::{invalid_json, optional, SqliteDb};
use crate::faces::consolidation::Consolidation;

/// Bounding box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union, 0 for disjoint or degenerate boxes
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeoplePerFrame {
    pub frame_number: i64,
    pub timestamp: f64,
    pub count: i64,
    /// Mean confidence of the frame's detections, 0 when empty
    pub confidence: f64,
}

/// One raw detection, labelled with the person it was consolidated into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingData {
    pub person_id: String,
    pub frame_number: i64,
    pub timestamp: f64,
    pub bbox: BoundingBox,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub id: i64,
    pub job_id: i64,
    pub video_id: i64,
    pub total_frames: i64,
    /// Sum of per-frame counts
    pub total_people: i64,
    /// Number of consolidated persons
    pub unique_people: i64,
    pub people_per_frame: Vec<PeoplePerFrame>,
    pub tracking_data: Vec<TrackingData>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Person {
    pub id: i64,
    pub analysis_result_id: i64,
    pub video_id: i64,
    pub person_number: i64,
    pub person_id: String,
    pub first_frame: i64,
    pub last_frame: i64,
    pub first_seen: f64,
    pub last_seen: f64,
    pub total_frames: i64,
    pub faces: Vec<PersonFace>,
}

impl Person {
    pub fn best_face(&self) -> Option<&PersonFace> {
        self.faces.iter().find(|f| f.is_best_face)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonFace {
    pub id: i64,
    pub person_id: i64,
    pub frame_number: i64,
    pub timestamp: f64,
    pub bbox: BoundingBox,
    pub confidence: f64,
    #[serde(serialize_with = "serialize_base64")]
    pub face_image: Vec<u8>,
    pub is_best_face: bool,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

/// Label used for a person in tracking data and search output.
pub fn person_label(person_number: i64) -> String {
    format!("person_{}", person_number)
}

const RESULT_COLUMNS: &str = "r.id, r.job_id, r.video_id, r.total_frames, r.total_people, \
                              r.unique_people, r.people_per_frame, r.tracking_data, r.created_at";

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisResult> {
    let people_per_frame: String = row.get(6)?;
    let tracking_data: String = row.get(7)?;
    Ok(AnalysisResult {
        id: row.get(0)?,
        job_id: row.get(1)?,
        video_id: row.get(2)?,
        total_frames: row.get(3)?,
        total_people: row.get(4)?,
        unique_people: row.get(5)?,
        people_per_frame: serde_json::from_str(&people_per_frame)
            .map_err(|e| invalid_json(6, e))?,
        tracking_data: serde_json::from_str(&tracking_data).map_err(|e| invalid_json(7, e))?,
        created_at: row.get(8)?,
    })
}

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    let person_number: i64 = row.get(3)?;
    Ok(Person {
        id: row.get(0)?,
        analysis_result_id: row.get(1)?,
        video_id: row.get(2)?,
        person_number,
        person_id: person_label(person_number),
        first_frame: row.get(4)?,
        last_frame: row.get(5)?,
        first_seen: row.get(6)?,
        last_seen: row.get(7)?,
        total_frames: row.get(8)?,
        faces: Vec::new(),
    })
}

fn face_from_row(row: &Row<'_>) -> rusqlite::Result<PersonFace> {
    Ok(PersonFace {
        id: row.get(0)?,
        person_id: row.get(1)?,
        frame_number: row.get(2)?,
        timestamp: row.get(3)?,
        bbox: BoundingBox {
            x: row.get(4)?,
            y: row.get(5)?,
            width: row.get(6)?,
            height: row.get(7)?,
        },
        confidence: row.get(8)?,
        face_image: row.get(9)?,
        is_best_face: row.get(10)?,
    })
}

/// Latest completed analysis result of a video.
const LATEST_RESULT_QUERY: &str = r#"
    FROM analysis_results r
    JOIN analysis_jobs j ON j.id = r.job_id
    WHERE r.video_id = ? AND j.status = 'completed'
    ORDER BY j.created_at DESC, j.id DESC
    LIMIT 1
"#;

impl ResultStore for SqliteDb {
    fn commit_analysis(
        &self,
        job_id: i64,
        video_id: i64,
        analysis: &Consolidation,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let running: bool = tx.query_row(
            r#"
            SELECT EXISTS(SELECT 1 FROM analysis_jobs
                          WHERE id = ? AND video_id = ? AND status = 'running')
            "#,
            params![job_id, video_id],
            |row| row.get(0),
        )?;
        if !running {
            return Ok(false);
        }

        let now = Utc::now();
        tx.execute(
            r#"
            INSERT INTO analysis_results (job_id, video_id, total_frames, total_people,
                                          unique_people, people_per_frame, tracking_data, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                job_id,
                video_id,
                analysis.total_frames,
                analysis.total_people,
                analysis.unique_people(),
                serde_json::to_string(&analysis.people_per_frame)?,
                serde_json::to_string(&analysis.tracking_data)?,
                now,
            ],
        )
        .context("Failed to insert analysis result")?;
        let result_id = tx.last_insert_rowid();

        {
            let mut insert_person = tx.prepare_cached(
                r#"
                INSERT INTO persons (analysis_result_id, video_id, person_number, first_frame,
                                     last_frame, first_seen, last_seen, total_frames)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            let mut insert_face = tx.prepare_cached(
                r#"
                INSERT INTO person_faces (person_id, video_id, frame_number, timestamp,
                                          bbox_x, bbox_y, bbox_w, bbox_h, confidence,
                                          face_image, is_best_face)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;

            for person in &analysis.persons {
                let person_id = insert_person.insert(params![
                    result_id,
                    video_id,
                    person.person_number,
                    person.first_frame,
                    person.last_frame,
                    person.first_seen,
                    person.last_seen,
                    person.total_frames,
                ])?;

                for (idx, face) in person.faces.iter().enumerate() {
                    insert_face.execute(params![
                        person_id,
                        video_id,
                        face.frame_number,
                        face.timestamp,
                        face.bbox.x,
                        face.bbox.y,
                        face.bbox.width,
                        face.bbox.height,
                        face.confidence,
                        face.image,
                        person.best_face == Some(idx),
                    ])?;
                }
            }
        }

        tx.execute(
            r#"
            UPDATE analysis_jobs
            SET status = 'completed', progress = 100, completed_at = ?,
                error_code = NULL, error_message = NULL
            WHERE id = ?
            "#,
            params![now, job_id],
        )?;
        tx.execute(
            "UPDATE videos SET status = ?, updated_at = ? WHERE id = ?",
            params![VideoStatus::Analyzed, now, video_id],
        )?;
        tx.commit()?;

        Ok(true)
    }

    fn analysis_result(&self, video_id: i64) -> Result<Option<AnalysisResult>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            &format!("SELECT {} {}", RESULT_COLUMNS, LATEST_RESULT_QUERY),
            [video_id],
            result_from_row,
        ))
    }

    fn persons(&self, video_id: i64) -> Result<Vec<Person>> {
        let conn = self.conn()?;
        let result_id: Option<i64> = optional(conn.query_row(
            &format!("SELECT r.id {}", LATEST_RESULT_QUERY),
            [video_id],
            |row| row.get(0),
        ))?;
        let Some(result_id) = result_id else {
            return Ok(Vec::new());
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT id, analysis_result_id, video_id, person_number, first_frame, last_frame,
                   first_seen, last_seen, total_frames
            FROM persons
            WHERE analysis_result_id = ?
            ORDER BY person_number
            "#,
        )?;
        let mut persons = stmt
            .query_map([result_id], person_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut faces_stmt = conn.prepare(
            r#"
            SELECT id, person_id, frame_number, timestamp, bbox_x, bbox_y, bbox_w, bbox_h,
                   confidence, face_image, is_best_face
            FROM person_faces
            WHERE person_id = ?
            ORDER BY timestamp, id
            "#,
        )?;
        for person in &mut persons {
            person.faces = faces_stmt
                .query_map([person.id], face_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        Ok(persons)
    }

    fn settle_video_status(&self, video_id: i64, fallback: VideoStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE videos
            SET status = CASE
                    WHEN EXISTS (SELECT 1 FROM analysis_jobs j
                                 WHERE j.video_id = videos.id AND j.status = 'completed')
                    THEN 'analyzed' ELSE ?1 END,
                updated_at = ?2
            WHERE id = ?3
            "#,
            params![fallback, Utc::now(), video_id],
        )?;
        Ok(())
    }
}
