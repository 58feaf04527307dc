//! Videos and reference images.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Row};
use serde::Serialize;

use super::backend::CatalogStore;
use super::sqlite::{optional, SqliteDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Uploaded,
    Analyzing,
    Analyzed,
    Failed,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Uploaded => "uploaded",
            VideoStatus::Analyzing => "analyzing",
            VideoStatus::Analyzed => "analyzed",
            VideoStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(VideoStatus::Uploaded),
            "analyzing" => Some(VideoStatus::Analyzing),
            "analyzed" => Some(VideoStatus::Analyzed),
            "failed" => Some(VideoStatus::Failed),
            _ => None,
        }
    }
}

impl ToSql for VideoStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for VideoStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        VideoStatus::parse(s).ok_or_else(|| {
            FromSqlError::Other(format!("unknown video status {:?}", s).into())
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Video {
    pub id: i64,
    /// Name under which storage keeps the bytes.
    pub filename: String,
    pub original_filename: String,
    pub size_bytes: i64,
    pub duration: Option<f64>,
    pub frame_count: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub status: VideoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub filename: String,
    pub original_filename: String,
    pub size_bytes: i64,
    pub duration: Option<f64>,
    pub frame_count: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceImage {
    pub id: i64,
    pub filename: String,
    pub original_filename: String,
    pub size_bytes: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewReferenceImage {
    pub filename: String,
    pub original_filename: String,
    pub size_bytes: i64,
    pub description: Option<String>,
}

const VIDEO_COLUMNS: &str = "id, filename, original_filename, size_bytes, duration, frame_count, \
                             width, height, status, created_at, updated_at";

fn video_from_row(row: &Row<'_>) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get(0)?,
        filename: row.get(1)?,
        original_filename: row.get(2)?,
        size_bytes: row.get(3)?,
        duration: row.get(4)?,
        frame_count: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        status: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const REFERENCE_COLUMNS: &str =
    "id, filename, original_filename, size_bytes, description, created_at";

fn reference_from_row(row: &Row<'_>) -> rusqlite::Result<ReferenceImage> {
    Ok(ReferenceImage {
        id: row.get(0)?,
        filename: row.get(1)?,
        original_filename: row.get(2)?,
        size_bytes: row.get(3)?,
        description: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl CatalogStore for SqliteDb {
    fn insert_video(&self, video: &NewVideo) -> Result<Video> {
        let conn = self.conn()?;
        let now = Utc::now();
        conn.execute(
            r#"
            INSERT INTO videos (filename, original_filename, size_bytes, duration, frame_count,
                                width, height, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                video.filename,
                video.original_filename,
                video.size_bytes,
                video.duration,
                video.frame_count,
                video.width,
                video.height,
                VideoStatus::Uploaded,
                now,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let video = conn.query_row(
            &format!("SELECT {} FROM videos WHERE id = ?", VIDEO_COLUMNS),
            [id],
            video_from_row,
        )?;
        Ok(video)
    }

    fn get_video(&self, id: i64) -> Result<Option<Video>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            &format!("SELECT {} FROM videos WHERE id = ?", VIDEO_COLUMNS),
            [id],
            video_from_row,
        ))
    }

    fn list_videos(&self, status: Option<VideoStatus>) -> Result<Vec<Video>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM videos
            WHERE ?1 IS NULL OR status = ?1
            ORDER BY created_at DESC, id DESC
            "#,
            VIDEO_COLUMNS
        ))?;
        let videos = stmt
            .query_map([status], video_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(videos)
    }

    fn set_video_status(&self, id: i64, status: VideoStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET status = ?, updated_at = ? WHERE id = ?",
            params![status, Utc::now(), id],
        )?;
        Ok(())
    }

    fn delete_video(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM videos WHERE id = ?", [id])?;
        Ok(deleted > 0)
    }

    fn insert_reference_image(&self, image: &NewReferenceImage) -> Result<ReferenceImage> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO reference_images (filename, original_filename, size_bytes, description, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                image.filename,
                image.original_filename,
                image.size_bytes,
                image.description,
                Utc::now(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let image = conn.query_row(
            &format!("SELECT {} FROM reference_images WHERE id = ?", REFERENCE_COLUMNS),
            [id],
            reference_from_row,
        )?;
        Ok(image)
    }

    fn get_reference_image(&self, id: i64) -> Result<Option<ReferenceImage>> {
        let conn = self.conn()?;
        optional(conn.query_row(
            &format!("SELECT {} FROM reference_images WHERE id = ?", REFERENCE_COLUMNS),
            [id],
            reference_from_row,
        ))
    }

    fn list_reference_images(&self) -> Result<Vec<ReferenceImage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM reference_images ORDER BY created_at DESC, id DESC",
            REFERENCE_COLUMNS
        ))?;
        let images = stmt
            .query_map([], reference_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    fn delete_reference_image(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM reference_images WHERE id = ?", [id])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_db() -> SqliteDb {
        let db = SqliteDb::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    pub(crate) fn add_video(db: &SqliteDb, name: &str) -> Video {
        db.insert_video(&NewVideo {
            filename: format!("stored-{}", name),
            original_filename: name.to_string(),
            size_bytes: 1024,
            duration: Some(3.0),
            ..Default::default()
        })
        .unwrap()
    }

    pub(crate) fn add_reference(db: &SqliteDb, name: &str) -> ReferenceImage {
        db.insert_reference_image(&NewReferenceImage {
            filename: format!("stored-{}", name),
            original_filename: name.to_string(),
            size_bytes: 64,
            description: Some("red jacket".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn test_video_roundtrip_and_status() {
        let db = test_db();
        let video = add_video(&db, "a.mp4");
        assert_eq!(video.status, VideoStatus::Uploaded);
        assert_eq!(video.original_filename, "a.mp4");

        db.set_video_status(video.id, VideoStatus::Analyzed).unwrap();
        let loaded = db.get_video(video.id).unwrap().unwrap();
        assert_eq!(loaded.status, VideoStatus::Analyzed);
        assert_eq!(loaded.duration, Some(3.0));
    }

    #[test]
    fn test_list_videos_filters_by_status() {
        let db = test_db();
        let a = add_video(&db, "a.mp4");
        let _b = add_video(&db, "b.mp4");
        db.set_video_status(a.id, VideoStatus::Analyzed).unwrap();

        assert_eq!(db.list_videos(None).unwrap().len(), 2);
        let analyzed = db.list_videos(Some(VideoStatus::Analyzed)).unwrap();
        assert_eq!(analyzed.len(), 1);
        assert_eq!(analyzed[0].id, a.id);
    }

    #[test]
    fn test_delete_missing_rows() {
        let db = test_db();
        assert!(!db.delete_video(42).unwrap());
        assert!(!db.delete_reference_image(42).unwrap());

        let image = add_reference(&db, "face.png");
        assert!(db.delete_reference_image(image.id).unwrap());
        assert!(db.get_reference_image(image.id).unwrap().is_none());
    }
}
