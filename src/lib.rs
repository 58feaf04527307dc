//! Video people analysis and reference-face search.
//!
//! Uploaded videos are analysed by background jobs that turn per-frame
//! detections into consolidated person identities. Reference images can
//! then be searched for across the analysed corpus.

pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod faces;
pub mod jobs;
pub mod logging;
pub mod storage;
pub mod tasks;

pub use engine::Engine;
pub use error::{ServiceError, ServiceResult};
