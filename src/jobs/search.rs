//! Person search: matches a reference face against analyzed videos.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, error, info, warn};

use super::discard_rejected;
use super::executor::{drive, DriveOutcome};
use crate::config::SearchConfig;
use crate::db::{
    CatalogStore, JobKind, JobStore, JobTermination, ReferenceImage, ResultStore, SearchJob,
    SearchResult, SearchStore, Store, VideoStatus,
};
use crate::error::{JobErrorCode, ServiceError, ServiceResult};
use crate::faces::matching::VideoMatches;
use crate::faces::{Detector, ReferenceError, ReferenceSource};
use crate::storage::MediaStorage;
use crate::tasks::{RunningJobs, SubmitError, TaskProgress, UpdateSender, WorkerPool};

pub struct SearchService {
    store: Arc<dyn Store>,
    running: Arc<RunningJobs>,
    pool: WorkerPool<i64>,
}

impl SearchService {
    pub fn start(
        config: SearchConfig,
        store: Arc<dyn Store>,
        storage: Arc<dyn MediaStorage>,
        detector: Arc<dyn Detector>,
        running: Arc<RunningJobs>,
    ) -> Self {
        let runner = Arc::new(SearchRunner {
            config: config.clone(),
            store: store.clone(),
            storage,
            detector,
            running: running.clone(),
        });
        let pool = WorkerPool::start(
            "search",
            config.max_concurrent_jobs,
            config.queue_capacity,
            move |job_id| runner.clone().run(job_id),
        );

        Self {
            store,
            running,
            pool,
        }
    }

    /// Queues a search for the reference face. An empty `video_ids` targets
    /// every video analyzed by the time the job runs.
    pub fn search_person(
        &self,
        reference_image_id: i64,
        video_ids: &[i64],
    ) -> ServiceResult<SearchJob> {
        if self.store.get_reference_image(reference_image_id)?.is_none() {
            return Err(ServiceError::not_found("reference image", reference_image_id));
        }

        let job = self.store.insert_search_job(reference_image_id, video_ids)?;
        if let Err(e) = self.pool.submit(job.id) {
            warn!(job_id = job.id, error = %e, "Search job rejected");
            discard_rejected(self.store.as_ref(), JobKind::Search, job.id, &e);
            return Err(match e {
                SubmitError::Full => ServiceError::QueueFull,
                SubmitError::Closed => ServiceError::Internal(e.into()),
            });
        }

        info!(
            job_id = job.id,
            reference_image_id,
            videos = video_ids.len(),
            "Search job queued"
        );
        Ok(job)
    }

    pub fn job(&self, job_id: i64) -> ServiceResult<SearchJob> {
        self.store
            .get_search_job(job_id)?
            .ok_or_else(|| ServiceError::not_found("search job", job_id))
    }

    /// Per-video results of the job; empty until it completes.
    pub fn results(&self, job_id: i64) -> ServiceResult<Vec<SearchResult>> {
        self.job(job_id)?;
        Ok(self.store.search_results(job_id)?)
    }

    pub fn cancel(&self, job_id: i64) -> ServiceResult<SearchJob> {
        self.job(job_id)?;

        if self.store.cancel_pending(JobKind::Search, job_id)? {
            info!(job_id, "Pending search job cancelled");
            return self.job(job_id);
        }
        if self.running.cancel(JobKind::Search, job_id) {
            info!(job_id, "Search cancellation requested");
            return self.job(job_id);
        }

        let current = self.job(job_id)?;
        Err(ServiceError::InvalidState {
            id: job_id,
            status: current.status.as_str().to_string(),
        })
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

struct SearchRunner {
    config: SearchConfig,
    store: Arc<dyn Store>,
    storage: Arc<dyn MediaStorage>,
    detector: Arc<dyn Detector>,
    running: Arc<RunningJobs>,
}

impl SearchRunner {
    async fn run(self: Arc<Self>, job_id: i64) {
        let guard = self.running.register(JobKind::Search, job_id);

        match self.store.mark_running(JobKind::Search, job_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(job_id, "Search job no longer pending, skipping");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to start search job");
                return;
            }
        }

        let job = match self.store.get_search_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(job_id, error = %e, "Failed to load search job");
                self.terminate(
                    job_id,
                    JobTermination::failed(JobErrorCode::Internal, "failed to load search job"),
                );
                return;
            }
        };
        info!(
            job_id,
            reference_image_id = job.reference_image_id,
            "Search started"
        );

        let worker = self.clone();
        let outcome = drive(
            move |updates, cancel_flag| worker.search(&job, &updates, &cancel_flag),
            guard.cancel_flag(),
            self.config.job_timeout(),
            |percent| {
                let percent = percent.min(99);
                if let Err(e) = self.store.update_progress(JobKind::Search, job_id, percent) {
                    warn!(job_id, error = %e, "Failed to record progress");
                }
            },
        )
        .await;

        match outcome {
            DriveOutcome::Finished(Ok(results)) => match self.store.commit_search(job_id, &results)
            {
                Ok(true) => info!(
                    job_id,
                    videos = results.len(),
                    matched = results.iter().filter(|r| !r.matches.is_empty()).count(),
                    "Search completed"
                ),
                Ok(false) => warn!(job_id, "Search result discarded, job no longer running"),
                Err(e) => {
                    error!(job_id, error = %e, "Failed to store search results");
                    self.terminate(
                        job_id,
                        JobTermination::failed(
                            JobErrorCode::Internal,
                            "failed to store search results",
                        ),
                    );
                }
            },
            DriveOutcome::Finished(Err(e)) => {
                warn!(job_id, error = %e, "Search failed");
                self.terminate(
                    job_id,
                    JobTermination::failed(JobErrorCode::Processing, format!("{:#}", e)),
                );
            }
            DriveOutcome::TimedOut => {
                warn!(job_id, "Search timed out");
                self.terminate(
                    job_id,
                    JobTermination::failed(
                        JobErrorCode::Timeout,
                        format!("search exceeded the {}s timeout", self.config.job_timeout_secs),
                    ),
                );
            }
            DriveOutcome::Cancelled => {
                info!(job_id, "Search cancelled");
                self.terminate(job_id, JobTermination::Cancelled);
            }
        }
    }

    /// Blocking part of the job. Only problems with the reference image end
    /// it with an error; a video that cannot be searched is skipped.
    fn search(
        &self,
        job: &SearchJob,
        updates: &UpdateSender,
        cancel_flag: &AtomicBool,
    ) -> Result<Vec<VideoMatches>> {
        let image = self
            .store
            .get_reference_image(job.reference_image_id)?
            .ok_or_else(|| ReferenceError {
                reference_image_id: job.reference_image_id,
                reason: "image no longer exists".to_string(),
            })?;
        let reference = self.load_reference(&image)?;

        let targets = self.resolve_targets(job)?;
        let total = targets.len();

        let mut results = Vec::new();
        for (done, video_id) in targets.into_iter().enumerate() {
            if cancel_flag.load(Ordering::SeqCst) {
                bail!("search {} interrupted", job.id);
            }

            match self.search_video(&reference, video_id) {
                Ok(matches) => results.push(matches),
                Err(e) if e.downcast_ref::<ReferenceError>().is_some() => return Err(e),
                Err(e) => {
                    warn!(job_id = job.id, video_id, error = %e, "Skipping video in search")
                }
            }
            let _ = updates.send(TaskProgress::new(done + 1, total));
        }

        Ok(results)
    }

    fn load_reference(&self, image: &ReferenceImage) -> Result<ReferenceSource> {
        let bytes = self.storage.read_reference(image).map_err(|e| ReferenceError {
            reference_image_id: image.id,
            reason: format!("{:#}", e),
        })?;
        Ok(ReferenceSource {
            reference_image_id: image.id,
            bytes,
        })
    }

    /// Explicit targets keep their order; videos that are gone or have no
    /// completed analysis are dropped.
    fn resolve_targets(&self, job: &SearchJob) -> Result<Vec<i64>> {
        if job.video_ids.is_empty() {
            return Ok(self
                .store
                .list_videos(Some(VideoStatus::Analyzed))?
                .into_iter()
                .map(|v| v.id)
                .collect());
        }

        let mut targets = Vec::with_capacity(job.video_ids.len());
        for &video_id in &job.video_ids {
            if targets.contains(&video_id) {
                continue;
            }
            if self.store.analysis_result(video_id)?.is_some() {
                targets.push(video_id);
            } else {
                debug!(job_id = job.id, video_id, "Video not analyzed, excluded from search");
            }
        }
        Ok(targets)
    }

    fn search_video(&self, reference: &ReferenceSource, video_id: i64) -> Result<VideoMatches> {
        let roster = self.store.persons(video_id)?;
        let matches = self.detector.match_reference(reference, &roster)?;
        debug!(video_id, persons = roster.len(), matches = matches.len(), "Video searched");
        Ok(VideoMatches::new(video_id, matches))
    }

    fn terminate(&self, job_id: i64, termination: JobTermination) {
        match self.store.finish_job(JobKind::Search, job_id, &termination) {
            Ok(true) => {}
            Ok(false) => debug!(job_id, "Search job already terminal"),
            Err(e) => error!(job_id, error = %e, "Failed to finish search job"),
        }
    }
}
