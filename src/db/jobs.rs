//! Analysis and search job rows and their state machine.
//!
//! `pending -> running -> {completed, failed, cancelled}`, plus
//! `pending -> cancelled`. Every transition is a guarded UPDATE so a
//! terminal row can never change again.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Row, TransactionBehavior};
use serde::Serialize;

use super::backend::JobStore;
use super::sqlite::{invalid_json, optional, SqliteDb};
use crate::error::JobErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Analysis,
    Search,
}

impl JobKind {
    fn table(&self) -> &'static str {
        match self {
            JobKind::Analysis => "analysis_jobs",
            JobKind::Search => "search_jobs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        JobStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown job status {:?}", s).into()))
    }
}

impl ToSql for JobErrorCode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobErrorCode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        JobErrorCode::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown job error code {:?}", s).into()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub id: i64,
    pub video_id: i64,
    pub status: JobStatus,
    pub progress: u8,
    pub error_code: Option<JobErrorCode>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchJob {
    pub id: i64,
    pub reference_image_id: i64,
    /// Requested targets; empty means every analyzed video.
    pub video_ids: Vec<i64>,
    pub status: JobStatus,
    pub progress: u8,
    pub error_code: Option<JobErrorCode>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of the atomic check-and-insert for analysis jobs.
#[derive(Debug, Clone)]
pub enum ActiveJobInsert {
    Created(AnalysisJob),
    /// The video already has this pending or running job.
    Active(AnalysisJob),
    MissingVideo,
}

/// How an active job ends.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTermination {
    Completed,
    Failed { code: JobErrorCode, message: String },
    Cancelled,
}

impl JobTermination {
    pub fn failed(code: JobErrorCode, message: impl Into<String>) -> Self {
        JobTermination::Failed {
            code,
            message: message.into(),
        }
    }

    fn columns(&self) -> (JobStatus, Option<JobErrorCode>, Option<&str>) {
        match self {
            JobTermination::Completed => (JobStatus::Completed, None, None),
            JobTermination::Failed { code, message } => {
                (JobStatus::Failed, Some(*code), Some(message.as_str()))
            }
            JobTermination::Cancelled => (
                JobStatus::Cancelled,
                Some(JobErrorCode::Cancelled),
                Some("cancelled by operator"),
            ),
        }
    }
}

const ANALYSIS_COLUMNS: &str = "id, video_id, status, progress, error_code, error_message, \
                                created_at, started_at, completed_at";

fn analysis_job_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisJob> {
    Ok(AnalysisJob {
        id: row.get(0)?,
        video_id: row.get(1)?,
        status: row.get(2)?,
        progress: row.get(3)?,
        error_code: row.get(4)?,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

const SEARCH_COLUMNS: &str = "id, reference_image_id, video_ids, status, progress, error_code, \
                              error_message, created_at, started_at, completed_at";

fn search_job_from_row(row: &Row<'_>) -> rusqlite::Result<SearchJob> {
    let video_ids: String = row.get(2)?;
    Ok(SearchJob {
        id: row.get(0)?,
        reference_image_id: row.get(1)?,
        video_ids: serde_json::from_str(&video_ids).map_err(|e| invalid_json(2, e))?,
        status: row.get(3)?,
        progress: row.get(4)?,
        error_code: row.get(5)?,
        error_message: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

impl JobStore for SqliteDb {
    fn insert_analysis_job(&self, video_id: i64) -> Result<ActiveJobInsert> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let video_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM videos WHERE id = ?)",
            [video_id],
            |row| row.get(0),
        )?;
        if !video_exists {
            return Ok(ActiveJobInsert::MissingVideo);
        }

        let active = optional(tx.query_row(
            &format!(
                r#"
                SELECT {} FROM analysis_jobs
                WHERE video_id = ? AND status IN ('pending', 'running')
                ORDER BY created_at DESC, id DESC
                LIMIT 1
                "#,
                ANALYSIS_COLUMNS
            ),
            [video_id],
            analysis_job_from_row,
        ))?;
        if let Some(job) = active {
            return Ok(ActiveJobInsert::Active(job));
        }

        tx.execute(
            "INSERT INTO analysis_jobs (video_id, status, progress, created_at) VALUES (?, ?, 0, ?)",
            params![video_id, JobStatus::Pending, Utc::now()],
        )?;
        let id = tx.last_insert_rowid();
        let job = tx.query_row(
            &format!("SELECT {} FROM analysis_jobs WHERE id = ?", ANALYSIS_COLUMNS),
            [id],
            analysis_job_from_row,
        )?;
        tx.commit()?;

        Ok(ActiveJobInsert::Created(job))
    }

    fn get_analysis_job(&self, id: i64) -> Result<Option<AnalysisJob>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            &format!("SELECT {} FROM analysis_jobs WHERE id = ?", ANALYSIS_COLUMNS),
            [id],
            analysis_job_from_row,
        ))
    }

    fn latest_analysis_job(&self, video_id: i64) -> Result<Option<AnalysisJob>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            &format!(
                r#"
                SELECT {} FROM analysis_jobs
                WHERE video_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT 1
                "#,
                ANALYSIS_COLUMNS
            ),
            [video_id],
            analysis_job_from_row,
        ))
    }

    fn insert_search_job(&self, reference_image_id: i64, video_ids: &[i64]) -> Result<SearchJob> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO search_jobs (reference_image_id, video_ids, status, progress, created_at)
            VALUES (?, ?, ?, 0, ?)
            "#,
            params![
                reference_image_id,
                serde_json::to_string(video_ids)?,
                JobStatus::Pending,
                Utc::now(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let job = conn.query_row(
            &format!("SELECT {} FROM search_jobs WHERE id = ?", SEARCH_COLUMNS),
            [id],
            search_job_from_row,
        )?;
        Ok(job)
    }

    fn get_search_job(&self, id: i64) -> Result<Option<SearchJob>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            &format!("SELECT {} FROM search_jobs WHERE id = ?", SEARCH_COLUMNS),
            [id],
            search_job_from_row,
        ))
    }

    fn mark_running(&self, kind: JobKind, id: i64) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let now = Utc::now();
        let updated = conn.execute(
            &format!(
                r#"
                UPDATE {}
                SET status = 'running', progress = 0, started_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
                kind.table()
            ),
            params![now, id],
        )?;
        Ok((updated == 1).then_some(now))
    }

    fn update_progress(&self, kind: JobKind, id: i64, progress: u8) -> Result<()> {
        let conn = self.conn()?;
        let progress = progress.min(100);
        conn.execute(
            &format!(
                "UPDATE {} SET progress = ?1 WHERE id = ?2 AND status = 'running' AND progress < ?1",
                kind.table()
            ),
            params![progress, id],
        )?;
        Ok(())
    }

    fn finish_job(&self, kind: JobKind, id: i64, termination: &JobTermination) -> Result<bool> {
        let conn = self.conn()?;
        let (status, code, message) = termination.columns();
        let updated = conn.execute(
            &format!(
                r#"
                UPDATE {}
                SET status = ?1,
                    error_code = ?2,
                    error_message = ?3,
                    completed_at = ?4,
                    progress = CASE WHEN ?1 = 'completed' THEN 100 ELSE progress END
                WHERE id = ?5 AND status IN ('pending', 'running')
                "#,
                kind.table()
            ),
            params![status, code, message, Utc::now(), id],
        )?;
        Ok(updated == 1)
    }

    fn cancel_pending(&self, kind: JobKind, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            &format!(
                r#"
                UPDATE {}
                SET status = 'cancelled', error_code = ?, error_message = 'cancelled before start',
                    completed_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
                kind.table()
            ),
            params![JobErrorCode::Cancelled, Utc::now(), id],
        )?;
        Ok(updated == 1)
    }

    fn discard_pending(&self, kind: JobKind, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE id = ? AND status = 'pending'", kind.table()),
            [id],
        )?;
        Ok(deleted == 1)
    }

    fn fail_interrupted_jobs(&self) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let mut failed = 0;
        for kind in [JobKind::Analysis, JobKind::Search] {
            failed += tx.execute(
                &format!(
                    r#"
                    UPDATE {}
                    SET status = 'failed', error_code = ?, error_message = 'interrupted by restart',
                        completed_at = ?
                    WHERE status IN ('pending', 'running')
                    "#,
                    kind.table()
                ),
                params![JobErrorCode::Internal, now],
            )?;
        }

        tx.execute(
            r#"
            UPDATE videos
            SET status = CASE
                    WHEN EXISTS (SELECT 1 FROM analysis_jobs j
                                 WHERE j.video_id = videos.id AND j.status = 'completed')
                    THEN 'analyzed' ELSE 'failed' END,
                updated_at = ?
            WHERE status = 'analyzing'
            "#,
            [now],
        )?;
        tx.commit()?;

        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::catalog::tests::{add_reference, add_video, test_db};
    use crate::db::{CatalogStore, VideoStatus};
    use std::sync::Arc;

    fn created(outcome: ActiveJobInsert) -> AnalysisJob {
        match outcome {
            ActiveJobInsert::Created(job) => job,
            other => panic!("expected a new job, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_rejects_second_active_job() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");

        let job = created(db.insert_analysis_job(video.id).unwrap());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);

        match db.insert_analysis_job(video.id).unwrap() {
            ActiveJobInsert::Active(existing) => assert_eq!(existing.id, job.id),
            other => panic!("expected conflict, got {:?}", other),
        }

        // Still rejected while running.
        db.mark_running(JobKind::Analysis, job.id).unwrap().unwrap();
        assert!(matches!(
            db.insert_analysis_job(video.id).unwrap(),
            ActiveJobInsert::Active(_)
        ));

        // A terminal job frees the slot.
        let termination = JobTermination::failed(JobErrorCode::Processing, "decoder error");
        assert!(db.finish_job(JobKind::Analysis, job.id, &termination).unwrap());
        let next = created(db.insert_analysis_job(video.id).unwrap());
        assert_ne!(next.id, job.id);
    }

    #[test]
    fn test_insert_for_missing_video() {
        let db = test_db();
        assert!(matches!(
            db.insert_analysis_job(99).unwrap(),
            ActiveJobInsert::MissingVideo
        ));
    }

    #[test]
    fn test_concurrent_inserts_create_one_job() {
        let db = Arc::new(test_db());
        let video = add_video(&db, "a.mp4");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.insert_analysis_job(video.id).unwrap())
            })
            .collect();

        let created_count = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| matches!(outcome, ActiveJobInsert::Created(_)))
            .count();
        assert_eq!(created_count, 1);
    }

    #[test]
    fn test_progress_never_decreases() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        let job = created(db.insert_analysis_job(video.id).unwrap());

        // Ignored while pending.
        db.update_progress(JobKind::Analysis, job.id, 30).unwrap();
        assert_eq!(db.get_analysis_job(job.id).unwrap().unwrap().progress, 0);

        let started = db.mark_running(JobKind::Analysis, job.id).unwrap();
        assert!(started.is_some());
        db.update_progress(JobKind::Analysis, job.id, 40).unwrap();
        db.update_progress(JobKind::Analysis, job.id, 20).unwrap();
        let loaded = db.get_analysis_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.progress, 40);
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[test]
    fn test_terminal_jobs_do_not_transition() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        let job = created(db.insert_analysis_job(video.id).unwrap());
        db.mark_running(JobKind::Analysis, job.id).unwrap();

        assert!(db
            .finish_job(JobKind::Analysis, job.id, &JobTermination::Completed)
            .unwrap());
        assert!(!db
            .finish_job(JobKind::Analysis, job.id, &JobTermination::Cancelled)
            .unwrap());
        assert!(db.mark_running(JobKind::Analysis, job.id).unwrap().is_none());

        let loaded = db.get_analysis_job(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.progress, 100);
        assert!(loaded.completed_at.is_some());
        assert!(loaded.error_code.is_none());
    }

    #[test]
    fn test_cancel_pending_only() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        let job = created(db.insert_analysis_job(video.id).unwrap());

        assert!(db.cancel_pending(JobKind::Analysis, job.id).unwrap());
        assert!(!db.cancel_pending(JobKind::Analysis, job.id).unwrap());
        assert_eq!(
            db.get_analysis_job(job.id).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        // A cancelled job can no longer be picked up by a worker.
        assert!(db.mark_running(JobKind::Analysis, job.id).unwrap().is_none());
    }

    #[test]
    fn test_discard_pending_frees_the_video() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        let job = created(db.insert_analysis_job(video.id).unwrap());

        assert!(db.discard_pending(JobKind::Analysis, job.id).unwrap());
        assert!(db.get_analysis_job(job.id).unwrap().is_none());
        assert!(db.latest_analysis_job(video.id).unwrap().is_none());
        created(db.insert_analysis_job(video.id).unwrap());

        let running = created(db.insert_analysis_job(add_video(&db, "b.mp4").id).unwrap());
        db.mark_running(JobKind::Analysis, running.id).unwrap();
        assert!(!db.discard_pending(JobKind::Analysis, running.id).unwrap());
        assert!(db.get_analysis_job(running.id).unwrap().is_some());
    }

    #[test]
    fn test_latest_job_is_newest() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        let first = created(db.insert_analysis_job(video.id).unwrap());
        db.finish_job(JobKind::Analysis, first.id, &JobTermination::Cancelled)
            .unwrap();
        let second = created(db.insert_analysis_job(video.id).unwrap());

        let latest = db.latest_analysis_job(video.id).unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(db.latest_analysis_job(video.id + 1).unwrap().is_none());
    }

    #[test]
    fn test_search_job_keeps_targets() {
        let db = test_db();
        let image = add_reference(&db, "face.png");
        let a = db.insert_search_job(image.id, &[3, 1]).unwrap();
        let b = db.insert_search_job(image.id, &[]).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(db.get_search_job(a.id).unwrap().unwrap().video_ids, vec![3, 1]);
        assert!(db.get_search_job(b.id).unwrap().unwrap().video_ids.is_empty());
    }

    #[test]
    fn test_fail_interrupted_jobs() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        let image = add_reference(&db, "face.png");
        let analysis = created(db.insert_analysis_job(video.id).unwrap());
        db.mark_running(JobKind::Analysis, analysis.id).unwrap();
        db.set_video_status(video.id, VideoStatus::Analyzing).unwrap();
        let search = db.insert_search_job(image.id, &[]).unwrap();

        assert_eq!(db.fail_interrupted_jobs().unwrap(), 2);

        let analysis = db.get_analysis_job(analysis.id).unwrap().unwrap();
        assert_eq!(analysis.status, JobStatus::Failed);
        assert_eq!(analysis.error_code, Some(JobErrorCode::Internal));
        let search = db.get_search_job(search.id).unwrap().unwrap();
        assert_eq!(search.status, JobStatus::Failed);
        assert_eq!(
            db.get_video(video.id).unwrap().unwrap().status,
            VideoStatus::Failed
        );
    }

    #[test]
    fn test_deleting_video_cascades_to_jobs() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        let job = created(db.insert_analysis_job(video.id).unwrap());

        assert!(db.delete_video(video.id).unwrap());
        assert!(db.get_analysis_job(job.id).unwrap().is_none());
    }
}
