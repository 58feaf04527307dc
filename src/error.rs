//! Errors returned synchronously by the job services.
//!
//! Failures that happen inside a background job are never returned here;
//! they are recorded on the job row (see [`JobErrorCode`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::AnalysisJob;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// The video already has an active analysis job. Callers should poll
    /// `existing` instead of retrying.
    #[error("video {} already has active analysis job {}", .existing.video_id, .existing.id)]
    Conflict { existing: Box<AnalysisJob> },

    #[error("job {id} is already {status}")]
    InvalidState { id: i64, status: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("job queue is full, try again later")]
    QueueFull,

    /// Persistence or storage failure. The source is kept for logging but
    /// never shown to callers.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        ServiceError::NotFound { kind, id }
    }

    /// Stable machine-readable code, used by the CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::Conflict { .. } => "conflict",
            ServiceError::InvalidState { .. } => "invalid_state",
            ServiceError::InvalidArgument(_) => "invalid_argument",
            ServiceError::QueueFull => "queue_full",
            ServiceError::Internal(_) => "internal",
        }
    }
}

/// Why a job ended in `failed` or `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobErrorCode {
    /// Detector or decode failure.
    Processing,
    /// The job ran past its configured timeout.
    Timeout,
    /// Aborted by an operator.
    Cancelled,
    /// Persistence failure or an interrupted process.
    Internal,
}

impl JobErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorCode::Processing => "processing",
            JobErrorCode::Timeout => "timeout",
            JobErrorCode::Cancelled => "cancelled",
            JobErrorCode::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(JobErrorCode::Processing),
            "timeout" => Some(JobErrorCode::Timeout),
            "cancelled" => Some(JobErrorCode::Cancelled),
            "internal" => Some(JobErrorCode::Internal),
            _ => None,
        }
    }
}
