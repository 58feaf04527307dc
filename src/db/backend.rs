//! Store traits injected into the job services.
//!
//! Every method is a single atomic operation at the persistence boundary:
//! a reader observes a row either before or after an update, never halfway.

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::catalog::{NewReferenceImage, NewVideo, ReferenceImage, Video, VideoStatus};
use super::jobs::{ActiveJobInsert, AnalysisJob, JobKind, JobTermination, SearchJob};
use super::results::{AnalysisResult, Person};
use super::search::SearchResult;
use crate::faces::consolidation::Consolidation;
use crate::faces::matching::VideoMatches;

/// Videos and reference images.
pub trait CatalogStore: Send + Sync {
    fn insert_video(&self, video: &NewVideo) -> Result<Video>;

    fn get_video(&self, id: i64) -> Result<Option<Video>>;

    /// All videos, newest first, optionally filtered by status.
    fn list_videos(&self, status: Option<VideoStatus>) -> Result<Vec<Video>>;

    fn set_video_status(&self, id: i64, status: VideoStatus) -> Result<()>;

    /// Deletes the video and cascades to its jobs and results.
    fn delete_video(&self, id: i64) -> Result<bool>;

    fn insert_reference_image(&self, image: &NewReferenceImage) -> Result<ReferenceImage>;

    fn get_reference_image(&self, id: i64) -> Result<Option<ReferenceImage>>;

    fn list_reference_images(&self) -> Result<Vec<ReferenceImage>>;

    /// Deletes the image and cascades to its search jobs and results.
    fn delete_reference_image(&self, id: i64) -> Result<bool>;
}

/// Analysis and search job rows.
pub trait JobStore: Send + Sync {
    /// Check-and-insert in one transaction: creates a `pending` analysis job
    /// unless the video is missing or already has an active job.
    fn insert_analysis_job(&self, video_id: i64) -> Result<ActiveJobInsert>;

    fn get_analysis_job(&self, id: i64) -> Result<Option<AnalysisJob>>;

    /// Most recently created analysis job for the video, whatever its status.
    fn latest_analysis_job(&self, video_id: i64) -> Result<Option<AnalysisJob>>;

    fn insert_search_job(&self, reference_image_id: i64, video_ids: &[i64]) -> Result<SearchJob>;

    fn get_search_job(&self, id: i64) -> Result<Option<SearchJob>>;

    /// `pending -> running`. Returns the start time, or `None` when the job
    /// is no longer pending (cancelled or deleted while queued).
    fn mark_running(&self, kind: JobKind, id: i64) -> Result<Option<DateTime<Utc>>>;

    /// Raises progress of a running job. Lower values are ignored so
    /// progress never decreases.
    fn update_progress(&self, kind: JobKind, id: i64, progress: u8) -> Result<()>;

    /// Moves an active job to a terminal state. Returns `false` if the job
    /// was already terminal.
    fn finish_job(&self, kind: JobKind, id: i64, termination: &JobTermination) -> Result<bool>;

    /// `pending -> cancelled`. Returns `false` if the job was not pending.
    fn cancel_pending(&self, kind: JobKind, id: i64) -> Result<bool>;

    /// Deletes a job that never left `pending`. Returns `false` if a worker
    /// already picked it up.
    fn discard_pending(&self, kind: JobKind, id: i64) -> Result<bool>;

    /// Fails every job left active by a previous process and settles the
    /// status of videos stuck in `analyzing`. Returns the number of jobs.
    fn fail_interrupted_jobs(&self) -> Result<usize>;
}

/// Write-once analysis results.
pub trait ResultStore: Send + Sync {
    /// Persists the result, persons and faces, completes the job and marks
    /// the video analyzed, all in one transaction. Returns `false` (and
    /// writes nothing) if the job is no longer running.
    fn commit_analysis(&self, job_id: i64, video_id: i64, analysis: &Consolidation)
        -> Result<bool>;

    /// Result of the latest completed analysis job of the video.
    fn analysis_result(&self, video_id: i64) -> Result<Option<AnalysisResult>>;

    /// Persons (with faces) of the latest completed analysis of the video.
    fn persons(&self, video_id: i64) -> Result<Vec<Person>>;

    /// Sets the video back to `analyzed` if an earlier analysis completed,
    /// otherwise to `fallback`. Used after a failed or cancelled run.
    fn settle_video_status(&self, video_id: i64, fallback: VideoStatus) -> Result<()>;
}

/// Write-once person search results.
pub trait SearchStore: Send + Sync {
    /// Writes one row per video with matches and completes the job in one
    /// transaction. Returns `false` if the job is no longer running.
    fn commit_search(&self, job_id: i64, results: &[VideoMatches]) -> Result<bool>;

    fn search_results(&self, search_job_id: i64) -> Result<Vec<SearchResult>>;
}

/// Everything the engine needs from persistence.
pub trait Store: CatalogStore + JobStore + ResultStore + SearchStore {}

impl<T: CatalogStore + JobStore + ResultStore + SearchStore> Store for T {}
