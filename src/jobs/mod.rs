//! Background analysis and search jobs.
//!
//! Services validate requests and create `pending` rows synchronously; the
//! work runs on bounded worker pools and is observable only by polling the
//! job row.

use tracing::error;

use crate::db::{JobKind, JobStore, JobTermination, Store};
use crate::error::JobErrorCode;
use crate::tasks::SubmitError;

pub mod analysis;
pub mod batch;
pub mod executor;
pub mod search;

pub use analysis::AnalysisService;
pub use batch::{BatchFailure, BatchOutcome};
pub use search::SearchService;

/// Removes a job the worker pool refused, so callers never see a job they
/// were told was not created. Falls back to failing the row if it cannot
/// be deleted, which still frees the video for a new analysis.
pub(crate) fn discard_rejected(
    store: &dyn Store,
    kind: JobKind,
    job_id: i64,
    reason: &SubmitError,
) {
    let err = match store.discard_pending(kind, job_id) {
        Ok(_) => return,
        Err(e) => e,
    };
    error!(job_id, error = %err, "Failed to discard rejected job");
    let termination = JobTermination::failed(JobErrorCode::Internal, reason.to_string());
    if let Err(e) = store.finish_job(kind, job_id, &termination) {
        error!(job_id, error = %e, "Failed to fail rejected job");
    }
}
