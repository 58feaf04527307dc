use serde::Serialize;
use tracing::info;

use super::analysis::AnalysisService;
use crate::db::AnalysisJob;
use crate::error::{ServiceError, ServiceResult};

/// A video of the batch that did not get a job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub video_id: i64,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub jobs: Vec<AnalysisJob>,
    pub failures: Vec<BatchFailure>,
    /// Number of jobs created
    pub count: usize,
}

impl AnalysisService {
    /// Starts one analysis per video. A video that cannot be started does
    /// not stop the others.
    pub fn start_batch(&self, video_ids: &[i64]) -> ServiceResult<BatchOutcome> {
        if video_ids.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "video_ids must not be empty".to_string(),
            ));
        }

        let mut jobs = Vec::with_capacity(video_ids.len());
        let mut failures = Vec::new();
        for &video_id in video_ids {
            match self.start_analysis(video_id) {
                Ok(job) => jobs.push(job),
                Err(e) => failures.push(BatchFailure {
                    video_id,
                    code: e.code(),
                    message: e.to_string(),
                }),
            }
        }

        info!(
            requested = video_ids.len(),
            started = jobs.len(),
            failed = failures.len(),
            "Batch analysis submitted"
        );
        Ok(BatchOutcome {
            count: jobs.len(),
            jobs,
            failures,
        })
    }
}
