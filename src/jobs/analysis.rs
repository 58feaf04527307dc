//! Analysis job lifecycle: creation, execution and queries.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::discard_rejected;
use super::executor::{drive, DriveOutcome};
use crate::config::AnalysisConfig;
use crate::db::{
    ActiveJobInsert, AnalysisJob, AnalysisResult, CatalogStore, JobKind, JobStore,
    JobTermination, Person, ResultStore, Store, VideoStatus,
};
use crate::error::{JobErrorCode, ServiceError, ServiceResult};
use crate::faces::{Detector, FrameProcessor, VideoSource};
use crate::storage::MediaStorage;
use crate::tasks::{RunningJobs, SubmitError, WorkerPool};

#[derive(Debug, Clone, Copy)]
struct AnalysisTicket {
    job_id: i64,
    video_id: i64,
}

/// Owns the analysis worker pool and the operations on analysis jobs.
pub struct AnalysisService {
    store: Arc<dyn Store>,
    running: Arc<RunningJobs>,
    pool: WorkerPool<AnalysisTicket>,
}

impl AnalysisService {
    /// Spawns the workers on the current tokio runtime.
    pub fn start(
        config: AnalysisConfig,
        store: Arc<dyn Store>,
        storage: Arc<dyn MediaStorage>,
        detector: Arc<dyn Detector>,
        running: Arc<RunningJobs>,
    ) -> Self {
        let runner = Arc::new(AnalysisRunner {
            processor: Arc::new(FrameProcessor::new(
                detector,
                config.frame_rate,
                config.confidence,
            )),
            config: config.clone(),
            store: store.clone(),
            storage,
            running: running.clone(),
        });
        let pool = WorkerPool::start(
            "analysis",
            config.max_concurrent_jobs,
            config.queue_capacity,
            move |ticket| runner.clone().run(ticket),
        );

        Self {
            store,
            running,
            pool,
        }
    }

    /// Creates a pending job and queues it. Rejects the request if the video
    /// already has an active job.
    pub fn start_analysis(&self, video_id: i64) -> ServiceResult<AnalysisJob> {
        let job = match self.store.insert_analysis_job(video_id)? {
            ActiveJobInsert::Created(job) => job,
            ActiveJobInsert::Active(existing) => {
                return Err(ServiceError::Conflict {
                    existing: Box::new(existing),
                })
            }
            ActiveJobInsert::MissingVideo => return Err(ServiceError::not_found("video", video_id)),
        };

        let ticket = AnalysisTicket {
            job_id: job.id,
            video_id,
        };
        if let Err(e) = self.pool.submit(ticket) {
            warn!(job_id = job.id, video_id, error = %e, "Analysis job rejected");
            discard_rejected(self.store.as_ref(), JobKind::Analysis, job.id, &e);
            return Err(match e {
                SubmitError::Full => ServiceError::QueueFull,
                SubmitError::Closed => ServiceError::Internal(e.into()),
            });
        }

        info!(job_id = job.id, video_id, "Analysis job queued");
        Ok(job)
    }

    /// Most recent analysis job of the video, whatever its state.
    pub fn status_for_video(&self, video_id: i64) -> ServiceResult<AnalysisJob> {
        self.store
            .latest_analysis_job(video_id)?
            .ok_or_else(|| ServiceError::not_found("analysis job for video", video_id))
    }

    pub fn job(&self, job_id: i64) -> ServiceResult<AnalysisJob> {
        self.store
            .get_analysis_job(job_id)?
            .ok_or_else(|| ServiceError::not_found("analysis job", job_id))
    }

    /// Result of the most recently completed analysis of the video.
    pub fn result(&self, video_id: i64) -> ServiceResult<AnalysisResult> {
        self.store
            .analysis_result(video_id)?
            .ok_or_else(|| ServiceError::not_found("analysis result for video", video_id))
    }

    /// Persons of the most recently completed analysis, with their faces.
    pub fn persons(&self, video_id: i64) -> ServiceResult<Vec<Person>> {
        // Distinguishes "never analyzed" from "analyzed, nobody seen".
        self.result(video_id)?;
        Ok(self.store.persons(video_id)?)
    }

    /// Cancels a pending job outright, or asks the worker of a running job
    /// to stop.
    pub fn cancel(&self, job_id: i64) -> ServiceResult<AnalysisJob> {
        let job = self.job(job_id)?;

        if self.store.cancel_pending(JobKind::Analysis, job_id)? {
            info!(job_id, video_id = job.video_id, "Pending analysis job cancelled");
            return self.job(job_id);
        }
        if self.running.cancel(JobKind::Analysis, job_id) {
            info!(job_id, video_id = job.video_id, "Cancellation requested");
            return self.job(job_id);
        }

        let current = self.job(job_id)?;
        Err(ServiceError::InvalidState {
            id: job_id,
            status: current.status.as_str().to_string(),
        })
    }

    /// Stops accepting jobs and waits for queued and running ones.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

struct AnalysisRunner {
    config: AnalysisConfig,
    store: Arc<dyn Store>,
    storage: Arc<dyn MediaStorage>,
    processor: Arc<FrameProcessor>,
    running: Arc<RunningJobs>,
}

impl AnalysisRunner {
    async fn run(self: Arc<Self>, ticket: AnalysisTicket) {
        let AnalysisTicket { job_id, video_id } = ticket;
        // Registered before the job turns running so a cancel never misses it.
        let guard = self.running.register(JobKind::Analysis, job_id);

        match self.store.mark_running(JobKind::Analysis, job_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(job_id, "Analysis job no longer pending, skipping");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to start analysis job");
                return;
            }
        }
        if let Err(e) = self.store.set_video_status(video_id, VideoStatus::Analyzing) {
            warn!(job_id, video_id, error = %e, "Failed to update video status");
        }
        info!(job_id, video_id, "Analysis started");

        let video = match self.store.get_video(video_id) {
            Ok(Some(video)) => video,
            Ok(None) => {
                self.terminate(
                    ticket,
                    JobTermination::failed(JobErrorCode::Processing, "video no longer exists"),
                );
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to load video");
                self.terminate(
                    ticket,
                    JobTermination::failed(JobErrorCode::Internal, "failed to load video"),
                );
                return;
            }
        };

        let source = VideoSource::new(&video, self.storage.clone());
        let processor = self.processor.clone();
        let outcome = drive(
            move |updates, cancel_flag| processor.process(&source, &updates, &cancel_flag),
            guard.cancel_flag(),
            self.config.job_timeout(),
            |percent| {
                // 100 is only reached by the commit.
                let percent = percent.min(99);
                if let Err(e) = self.store.update_progress(JobKind::Analysis, job_id, percent) {
                    warn!(job_id, error = %e, "Failed to record progress");
                }
            },
        )
        .await;

        match outcome {
            DriveOutcome::Finished(Ok(analysis)) => {
                match self.store.commit_analysis(job_id, video_id, &analysis) {
                    Ok(true) => info!(
                        job_id,
                        video_id,
                        total_frames = analysis.total_frames,
                        total_people = analysis.total_people,
                        unique_people = analysis.unique_people(),
                        "Analysis completed"
                    ),
                    Ok(false) => {
                        warn!(job_id, video_id, "Analysis result discarded, job no longer running")
                    }
                    Err(e) => {
                        error!(job_id, video_id, error = %e, "Failed to store analysis result");
                        self.terminate(
                            ticket,
                            JobTermination::failed(
                                JobErrorCode::Internal,
                                "failed to store analysis result",
                            ),
                        );
                    }
                }
            }
            DriveOutcome::Finished(Err(e)) => {
                warn!(job_id, video_id, error = %e, "Analysis failed");
                self.terminate(
                    ticket,
                    JobTermination::failed(JobErrorCode::Processing, format!("{:#}", e)),
                );
            }
            DriveOutcome::TimedOut => {
                warn!(job_id, video_id, "Analysis timed out");
                self.terminate(
                    ticket,
                    JobTermination::failed(
                        JobErrorCode::Timeout,
                        format!(
                            "analysis exceeded the {}s timeout",
                            self.config.job_timeout_secs
                        ),
                    ),
                );
            }
            DriveOutcome::Cancelled => {
                info!(job_id, video_id, "Analysis cancelled");
                self.terminate(ticket, JobTermination::Cancelled);
            }
        }
    }

    /// Ends the job and puts the video back in a settled state.
    fn terminate(&self, ticket: AnalysisTicket, termination: JobTermination) {
        let fallback = match termination {
            JobTermination::Cancelled => VideoStatus::Uploaded,
            _ => VideoStatus::Failed,
        };
        match self
            .store
            .finish_job(JobKind::Analysis, ticket.job_id, &termination)
        {
            Ok(true) => {
                if let Err(e) = self.store.settle_video_status(ticket.video_id, fallback) {
                    warn!(video_id = ticket.video_id, error = %e, "Failed to update video status");
                }
            }
            Ok(false) => debug!(job_id = ticket.job_id, "Analysis job already terminal"),
            Err(e) => error!(job_id = ticket.job_id, error = %e, "Failed to finish analysis job"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{JobStatus, Match, NewVideo, SqliteDb};
    use crate::faces::detector::{Detection, FrameDetections, FrameStream, ReferenceSource};
    use crate::faces::SimulatedDetector;
    use crate::storage::MemoryStorage;
    use anyhow::{bail, Result};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Detector with a scripted scene; optionally blocks or fails.
    pub(crate) struct ScriptedDetector {
        pub frames: usize,
        pub frame_delay: Duration,
        pub fail: bool,
        /// While set, `detect_frames` does not return.
        pub hold: Arc<AtomicBool>,
    }

    impl ScriptedDetector {
        pub(crate) fn quick() -> Self {
            Self {
                frames: 3,
                frame_delay: Duration::ZERO,
                fail: false,
                hold: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl crate::faces::Detector for ScriptedDetector {
        fn detect_frames<'a>(
            &'a self,
            _video: &'a VideoSource,
            _sample_rate_hz: u32,
        ) -> Result<FrameStream<'a>> {
            while self.hold.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            if self.fail {
                bail!("corrupt video stream");
            }
            let frames = (0..self.frames).map(move |i| -> Result<FrameDetections> {
                std::thread::sleep(self.frame_delay);
                let detection = |track_id: u64, confidence: f64| Detection {
                    track_id,
                    bbox: crate::db::BoundingBox {
                        x: track_id as f64 * 100.0,
                        y: 0.0,
                        width: 50.0,
                        height: 50.0,
                    },
                    confidence,
                    face_image: Some(vec![track_id as u8, i as u8]),
                };
                Ok(FrameDetections {
                    frame_number: i as i64 * 30,
                    timestamp: i as f64,
                    detections: vec![detection(1, 0.9), detection(2, 0.8)],
                })
            });
            Ok(FrameStream::new(self.frames, frames))
        }

        fn match_reference(&self, _: &ReferenceSource, _: &[Person]) -> Result<Vec<Match>> {
            Ok(Vec::new())
        }
    }

    pub(crate) struct Fixture {
        pub store: Arc<SqliteDb>,
        pub storage: Arc<MemoryStorage>,
        pub running: Arc<RunningJobs>,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let store = SqliteDb::open_in_memory().unwrap();
            store.initialize().unwrap();
            Self {
                store: Arc::new(store),
                storage: Arc::new(MemoryStorage::new()),
                running: RunningJobs::new(),
            }
        }

        pub(crate) fn add_video(&self, name: &str, bytes: &[u8]) -> i64 {
            let filename = self.storage.store_video(name, bytes).unwrap();
            self.store
                .insert_video(&NewVideo {
                    filename,
                    original_filename: name.to_string(),
                    size_bytes: bytes.len() as i64,
                    duration: Some(4.0),
                    ..Default::default()
                })
                .unwrap()
                .id
        }

        pub(crate) fn analysis(
            &self,
            detector: impl crate::faces::Detector + 'static,
            config: AnalysisConfig,
        ) -> AnalysisService {
            AnalysisService::start(
                config,
                self.store.clone(),
                self.storage.clone(),
                Arc::new(detector),
                self.running.clone(),
            )
        }
    }

    pub(crate) fn config() -> AnalysisConfig {
        AnalysisConfig {
            max_concurrent_jobs: 2,
            queue_capacity: 8,
            job_timeout_secs: 30,
            frame_rate: 1,
            confidence: 0.5,
        }
    }

    pub(crate) async fn wait_terminal(service: &AnalysisService, job_id: i64) -> AnalysisJob {
        for _ in 0..500 {
            let job = service.job(job_id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_analysis_completes() {
        let fx = Fixture::new();
        let video_id = fx.add_video("a.mp4", b"clip");
        let service = fx.analysis(ScriptedDetector::quick(), config());

        let job = service.start_analysis(video_id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let job = wait_terminal(&service, job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        let result = service.result(video_id).unwrap();
        assert_eq!(result.total_frames, 3);
        assert_eq!(result.total_people, 6);
        assert_eq!(result.unique_people, 2);
        assert_eq!(service.persons(video_id).unwrap().len(), 2);
        assert_eq!(
            fx.store.get_video(video_id).unwrap().unwrap().status,
            VideoStatus::Analyzed
        );
        assert_eq!(service.status_for_video(video_id).unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_missing_video_and_conflict() {
        let fx = Fixture::new();
        let video_id = fx.add_video("a.mp4", b"clip");
        let detector = ScriptedDetector::quick();
        detector.hold.store(true, Ordering::SeqCst);
        let hold = detector.hold.clone();
        let service = fx.analysis(detector, config());

        assert!(matches!(
            service.start_analysis(999),
            Err(ServiceError::NotFound { kind: "video", id: 999 })
        ));

        let first = service.start_analysis(video_id).unwrap();
        match service.start_analysis(video_id) {
            Err(ServiceError::Conflict { existing }) => assert_eq!(existing.id, first.id),
            other => panic!("expected conflict, got {:?}", other.map(|j| j.id)),
        }

        hold.store(false, Ordering::SeqCst);
        wait_terminal(&service, first.id).await;
        // A finished job no longer blocks new ones.
        assert!(service.start_analysis(video_id).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_start_creates_one_job() {
        let fx = Fixture::new();
        let video_id = fx.add_video("a.mp4", b"clip");
        let detector = ScriptedDetector::quick();
        detector.hold.store(true, Ordering::SeqCst);
        let hold = detector.hold.clone();
        let service = Arc::new(fx.analysis(detector, config()));

        let attempts: Vec<_> = (0..6)
            .map(|_| {
                let service = service.clone();
                tokio::task::spawn_blocking(move || service.start_analysis(video_id))
            })
            .collect();

        let mut created = Vec::new();
        let mut conflicts = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(job) => created.push(job.id),
                Err(ServiceError::Conflict { existing }) => {
                    assert!(existing.status.is_active());
                    conflicts += 1;
                }
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(created.len(), 1);
        assert_eq!(conflicts, 5);

        hold.store(false, Ordering::SeqCst);
        let job = wait_terminal(&service, created[0]).await;
        assert_eq!(job.status, JobStatus::Completed);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_detector_failure_marks_job_failed() {
        let fx = Fixture::new();
        let video_id = fx.add_video("a.mp4", b"clip");
        let mut detector = ScriptedDetector::quick();
        detector.fail = true;
        let service = fx.analysis(detector, config());

        let job = service.start_analysis(video_id).unwrap();
        let job = wait_terminal(&service, job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code, Some(JobErrorCode::Processing));
        assert!(job.error_message.unwrap().contains("corrupt video stream"));

        // A failed job never exposes a result.
        assert!(matches!(
            service.result(video_id),
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            service.persons(video_id),
            Err(ServiceError::NotFound { .. })
        ));
        assert_eq!(
            fx.store.get_video(video_id).unwrap().unwrap().status,
            VideoStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_timeout_discards_late_result() {
        let fx = Fixture::new();
        let video_id = fx.add_video("a.mp4", b"clip");
        let mut detector = ScriptedDetector::quick();
        detector.frames = 20;
        detector.frame_delay = Duration::from_millis(100);
        let mut cfg = config();
        cfg.job_timeout_secs = 1;
        let service = fx.analysis(detector, cfg);

        let job = service.start_analysis(video_id).unwrap();
        let job = wait_terminal(&service, job.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code, Some(JobErrorCode::Timeout));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(fx.store.analysis_result(video_id).unwrap().is_none());
        assert_eq!(service.job(job.id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_running() {
        let fx = Fixture::new();
        let a = fx.add_video("a.mp4", b"a");
        let b = fx.add_video("b.mp4", b"b");
        let mut detector = ScriptedDetector::quick();
        detector.frames = 200;
        detector.frame_delay = Duration::from_millis(10);
        let mut cfg = config();
        cfg.max_concurrent_jobs = 1;
        let service = fx.analysis(detector, cfg);

        let running = service.start_analysis(a).unwrap();
        let pending = service.start_analysis(b).unwrap();
        for _ in 0..100 {
            if service.job(running.id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let cancelled = service.cancel(pending.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        service.cancel(running.id).unwrap();
        let job = wait_terminal(&service, running.id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error_code, Some(JobErrorCode::Cancelled));
        assert_eq!(
            fx.store.get_video(a).unwrap().unwrap().status,
            VideoStatus::Uploaded
        );

        assert!(matches!(
            service.cancel(running.id),
            Err(ServiceError::InvalidState { .. })
        ));
        assert!(matches!(
            service.cancel(12345),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let fx = Fixture::new();
        let video_id = fx.add_video("a.mp4", b"clip");
        let mut detector = ScriptedDetector::quick();
        detector.frames = 30;
        detector.frame_delay = Duration::from_millis(5);
        let service = fx.analysis(detector, config());

        let job = service.start_analysis(video_id).unwrap();
        let mut last = 0;
        loop {
            let current = service.job(job.id).unwrap();
            assert!(current.progress >= last);
            last = current.progress;
            if current.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_simulated_detector_end_to_end() {
        let fx = Fixture::new();
        let video_id = fx.add_video("walk.mp4", b"a short walk in the park");
        let service = fx.analysis(SimulatedDetector::new(0.75), config());

        let job = service.start_analysis(video_id).unwrap();
        let job = wait_terminal(&service, job.id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let result = service.result(video_id).unwrap();
        assert_eq!(result.total_frames, 4);
        for person in service.persons(video_id).unwrap() {
            assert_eq!(person.faces.iter().filter(|f| f.is_best_face).count(), 1);
            let best = person.best_face().unwrap();
            assert!(person.faces.iter().all(|f| f.confidence <= best.confidence));
        }
    }

    #[tokio::test]
    async fn test_queue_full_leaves_no_job_behind() {
        let fx = Fixture::new();
        let ids: Vec<i64> = (0..3)
            .map(|i| fx.add_video(&format!("{}.mp4", i), &[i as u8]))
            .collect();
        let detector = ScriptedDetector::quick();
        detector.hold.store(true, Ordering::SeqCst);
        let hold = detector.hold.clone();
        let mut cfg = config();
        cfg.max_concurrent_jobs = 1;
        cfg.queue_capacity = 1;
        let service = fx.analysis(detector, cfg);

        let first = service.start_analysis(ids[0]).unwrap();
        for _ in 0..100 {
            if service.job(first.id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        service.start_analysis(ids[1]).unwrap();
        assert!(matches!(
            service.start_analysis(ids[2]),
            Err(ServiceError::QueueFull)
        ));
        assert!(matches!(
            service.status_for_video(ids[2]),
            Err(ServiceError::NotFound { .. })
        ));

        hold.store(false, Ordering::SeqCst);
        service.shutdown().await;
        // Once the queue drains the rejected video can be analyzed.
        let service = fx.analysis(ScriptedDetector::quick(), config());
        let retry = service.start_analysis(ids[2]).unwrap();
        let done = wait_terminal(&service, retry.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        service.shutdown().await;
    }
}
