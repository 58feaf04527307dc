//! Person search results.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::backend::SearchStore;
use super::results::BoundingBox;
use super::sqlite::{invalid_json, optional, SqliteDb};
use crate::faces::matching::VideoMatches;

/// A frame-level hit of the reference face on a consolidated person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub person_number: i64,
    pub frame_number: i64,
    pub timestamp: f64,
    pub bbox: BoundingBox,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub search_job_id: i64,
    pub video_id: i64,
    pub reference_image_id: i64,
    pub matches: Vec<Match>,
    pub first_appearance: f64,
    pub last_appearance: f64,
    pub total_appearances: i64,
    /// Highest match confidence
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

fn search_result_from_row(row: &Row<'_>) -> rusqlite::Result<SearchResult> {
    let matches: String = row.get(4)?;
    Ok(SearchResult {
        id: row.get(0)?,
        search_job_id: row.get(1)?,
        video_id: row.get(2)?,
        reference_image_id: row.get(3)?,
        matches: serde_json::from_str(&matches).map_err(|e| invalid_json(4, e))?,
        first_appearance: row.get(5)?,
        last_appearance: row.get(6)?,
        total_appearances: row.get(7)?,
        confidence: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl SearchStore for SqliteDb {
    fn commit_search(&self, job_id: i64, results: &[VideoMatches]) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let reference_image_id: Option<i64> = optional(tx.query_row(
            "SELECT reference_image_id FROM search_jobs WHERE id = ? AND status = 'running'",
            [job_id],
            |row| row.get(0),
        ))?;
        let Some(reference_image_id) = reference_image_id else {
            return Ok(false);
        };

        let now = Utc::now();
        {
            // A video deleted while the search ran is skipped, not an error.
            let mut insert = tx.prepare_cached(
                r#"
                INSERT INTO search_results (search_job_id, video_id, reference_image_id, matches,
                                            first_appearance, last_appearance, total_appearances,
                                            confidence, created_at)
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                WHERE EXISTS (SELECT 1 FROM videos WHERE id = ?2)
                "#,
            )?;
            for video in results {
                // Videos without matches get no row.
                let Some(summary) = video.summary() else {
                    continue;
                };
                insert.execute(params![
                    job_id,
                    video.video_id,
                    reference_image_id,
                    serde_json::to_string(&video.matches)?,
                    summary.first_appearance,
                    summary.last_appearance,
                    summary.total_appearances,
                    summary.confidence,
                    now,
                ])?;
            }
        }

        tx.execute(
            r#"
            UPDATE search_jobs
            SET status = 'completed', progress = 100, completed_at = ?,
                error_code = NULL, error_message = NULL
            WHERE id = ?
            "#,
            params![now, job_id],
        )?;
        tx.commit()?;

        Ok(true)
    }

    fn search_results(&self, search_job_id: i64) -> Result<Vec<SearchResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, search_job_id, video_id, reference_image_id, matches, first_appearance,
                   last_appearance, total_appearances, confidence, created_at
            FROM search_results
            WHERE search_job_id = ?
            ORDER BY id
            "#,
        )?;
        let results = stmt
            .query_map([search_job_id], search_result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::catalog::tests::{add_reference, add_video, test_db};
    use crate::db::{CatalogStore, JobKind, JobStatus, JobStore};

    fn hit(timestamp: f64, confidence: f64) -> Match {
        Match {
            person_number: 1,
            frame_number: (timestamp * 30.0) as i64,
            timestamp,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            },
            confidence,
        }
    }

    #[test]
    fn test_commit_skips_videos_without_matches() {
        let db = test_db();
        let image = add_reference(&db, "face.png");
        let a = add_video(&db, "a.mp4");
        let b = add_video(&db, "b.mp4");
        let job = db.insert_search_job(image.id, &[]).unwrap();
        db.mark_running(JobKind::Search, job.id).unwrap();

        let results = vec![
            VideoMatches::new(a.id, vec![hit(4.0, 0.8), hit(1.0, 0.9), hit(2.5, 0.85)]),
            VideoMatches::new(b.id, vec![]),
        ];
        assert!(db.commit_search(job.id, &results).unwrap());

        let stored = db.search_results(job.id).unwrap();
        assert_eq!(stored.len(), 1);
        let row = &stored[0];
        assert_eq!(row.video_id, a.id);
        assert_eq!(row.reference_image_id, image.id);
        assert_eq!(row.first_appearance, 1.0);
        assert_eq!(row.last_appearance, 4.0);
        assert_eq!(row.total_appearances, 3);
        assert_eq!(row.confidence, 0.9);
        assert_eq!(row.matches.len(), 3);

        let job = db.get_search_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_commit_skips_deleted_videos() {
        let db = test_db();
        let image = add_reference(&db, "face.png");
        let kept = add_video(&db, "kept.mp4");
        let gone = add_video(&db, "gone.mp4");
        let job = db.insert_search_job(image.id, &[]).unwrap();
        db.mark_running(JobKind::Search, job.id).unwrap();
        assert!(db.delete_video(gone.id).unwrap());

        let results = vec![
            VideoMatches::new(gone.id, vec![hit(1.0, 0.95)]),
            VideoMatches::new(kept.id, vec![hit(2.0, 0.8)]),
        ];
        assert!(db.commit_search(job.id, &results).unwrap());

        let stored = db.search_results(job.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].video_id, kept.id);
        assert_eq!(
            db.get_search_job(job.id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn test_commit_after_cancel_is_discarded() {
        let db = test_db();
        let image = add_reference(&db, "face.png");
        let video = add_video(&db, "a.mp4");
        let job = db.insert_search_job(image.id, &[video.id]).unwrap();
        db.cancel_pending(JobKind::Search, job.id).unwrap();

        let results = vec![VideoMatches::new(video.id, vec![hit(1.0, 0.9)])];
        assert!(!db.commit_search(job.id, &results).unwrap());
        assert!(db.search_results(job.id).unwrap().is_empty());
    }

    #[test]
    fn test_deleting_reference_cascades() {
        let db = test_db();
        let image = add_reference(&db, "face.png");
        let video = add_video(&db, "a.mp4");
        let job = db.insert_search_job(image.id, &[]).unwrap();
        db.mark_running(JobKind::Search, job.id).unwrap();
        db.commit_search(job.id, &[VideoMatches::new(video.id, vec![hit(1.0, 0.9)])])
            .unwrap();

        assert!(db.delete_reference_image(image.id).unwrap());
        assert!(db.get_search_job(job.id).unwrap().is_none());
        assert!(db.search_results(job.id).unwrap().is_empty());
    }
}
