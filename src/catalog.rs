//! Upload and catalog operations for videos and reference images.

use std::sync::Arc;

use tracing::{info, warn};

use crate::db::{
    CatalogStore, JobKind, JobStore, NewReferenceImage, NewVideo, ReferenceImage, Store, Video,
    VideoStatus,
};
use crate::error::{ServiceError, ServiceResult};
use crate::storage::{file_extension, MediaStorage};
use crate::tasks::RunningJobs;

/// Supported video extensions
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm"];

/// Supported image extensions
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tiff", "webp"];

pub struct CatalogService {
    store: Arc<dyn Store>,
    storage: Arc<dyn MediaStorage>,
    running: Arc<RunningJobs>,
}

fn check_upload(original_filename: &str, bytes: &[u8], allowed: &[&str]) -> ServiceResult<()> {
    if bytes.is_empty() {
        return Err(ServiceError::InvalidArgument(format!(
            "{} is empty",
            original_filename
        )));
    }
    match file_extension(original_filename) {
        Some(ext) if allowed.contains(&ext.as_str()) => Ok(()),
        _ => Err(ServiceError::InvalidArgument(format!(
            "unsupported file type: {} (expected one of {})",
            original_filename,
            allowed.join(", ")
        ))),
    }
}

impl CatalogService {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn MediaStorage>,
        running: Arc<RunningJobs>,
    ) -> Self {
        Self {
            store,
            storage,
            running,
        }
    }

    /// Stores the bytes and records the video as `uploaded`.
    pub fn register_video(
        &self,
        original_filename: &str,
        bytes: &[u8],
        duration: Option<f64>,
    ) -> ServiceResult<Video> {
        check_upload(original_filename, bytes, VIDEO_EXTENSIONS)?;
        if let Some(d) = duration {
            if !d.is_finite() || d <= 0.0 {
                return Err(ServiceError::InvalidArgument(format!(
                    "duration must be positive, got {}",
                    d
                )));
            }
        }

        let filename = self.storage.store_video(original_filename, bytes)?;
        let record = NewVideo {
            filename,
            original_filename: original_filename.to_string(),
            size_bytes: bytes.len() as i64,
            duration,
            ..Default::default()
        };
        match self.store.insert_video(&record) {
            Ok(video) => {
                info!(video_id = video.id, filename = %video.filename, "Video registered");
                Ok(video)
            }
            Err(e) => {
                if let Err(cleanup) = self.storage.remove_video(&record.filename) {
                    warn!(filename = %record.filename, error = %cleanup, "Failed to remove orphaned upload");
                }
                Err(e.into())
            }
        }
    }

    pub fn list_videos(&self, status: Option<VideoStatus>) -> ServiceResult<Vec<Video>> {
        Ok(self.store.list_videos(status)?)
    }

    pub fn get_video(&self, id: i64) -> ServiceResult<Video> {
        self.store
            .get_video(id)?
            .ok_or_else(|| ServiceError::not_found("video", id))
    }

    /// Removes the video with its jobs and results. An analysis still
    /// running for it is told to stop.
    pub fn delete_video(&self, id: i64) -> ServiceResult<Video> {
        let video = self.get_video(id)?;

        if let Some(job) = self.store.latest_analysis_job(id)? {
            if job.status.is_active() && self.running.cancel(JobKind::Analysis, job.id) {
                info!(video_id = id, job_id = job.id, "Stopping analysis of deleted video");
            }
        }

        if !self.store.delete_video(id)? {
            return Err(ServiceError::not_found("video", id));
        }
        if let Err(e) = self.storage.remove_video(&video.filename) {
            warn!(video_id = id, error = %e, "Failed to remove stored video");
        }
        info!(video_id = id, "Video deleted");
        Ok(video)
    }

    pub fn register_reference_image(
        &self,
        original_filename: &str,
        bytes: &[u8],
        description: Option<String>,
    ) -> ServiceResult<ReferenceImage> {
        check_upload(original_filename, bytes, IMAGE_EXTENSIONS)?;

        let filename = self.storage.store_reference(original_filename, bytes)?;
        let record = NewReferenceImage {
            filename,
            original_filename: original_filename.to_string(),
            size_bytes: bytes.len() as i64,
            description,
        };
        match self.store.insert_reference_image(&record) {
            Ok(image) => {
                info!(reference_image_id = image.id, "Reference image registered");
                Ok(image)
            }
            Err(e) => {
                if let Err(cleanup) = self.storage.remove_reference(&record.filename) {
                    warn!(filename = %record.filename, error = %cleanup, "Failed to remove orphaned upload");
                }
                Err(e.into())
            }
        }
    }

    pub fn list_reference_images(&self) -> ServiceResult<Vec<ReferenceImage>> {
        Ok(self.store.list_reference_images()?)
    }

    pub fn get_reference_image(&self, id: i64) -> ServiceResult<ReferenceImage> {
        self.store
            .get_reference_image(id)?
            .ok_or_else(|| ServiceError::not_found("reference image", id))
    }

    /// Removes the image together with its search jobs and results.
    pub fn delete_reference_image(&self, id: i64) -> ServiceResult<ReferenceImage> {
        let image = self.get_reference_image(id)?;
        if !self.store.delete_reference_image(id)? {
            return Err(ServiceError::not_found("reference image", id));
        }
        if let Err(e) = self.storage.remove_reference(&image.filename) {
            warn!(reference_image_id = id, error = %e, "Failed to remove stored image");
        }
        info!(reference_image_id = id, "Reference image deleted");
        Ok(image)
    }
}
