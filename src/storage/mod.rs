//! Byte storage for uploaded videos and reference images.
//!
//! The catalog keeps only the generated stored filename; jobs resolve a
//! record to its bytes through [`MediaStorage`] and never build paths.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::StorageConfig;
use crate::db::ReferenceImage;

pub trait MediaStorage: Send + Sync {
    /// Stores an uploaded video and returns its stored filename.
    fn store_video(&self, original_filename: &str, bytes: &[u8]) -> Result<String>;

    fn store_reference(&self, original_filename: &str, bytes: &[u8]) -> Result<String>;

    /// Streams a stored video by its stored filename.
    fn open_video(&self, filename: &str) -> Result<Box<dyn Read + Send>>;

    fn read_reference(&self, image: &ReferenceImage) -> Result<Vec<u8>>;

    /// Removes a stored video by its stored filename. Missing files are fine.
    fn remove_video(&self, filename: &str) -> Result<()>;

    fn remove_reference(&self, filename: &str) -> Result<()>;
}

/// Stored name: upload time, content hash prefix and the original
/// extension, so names never collide and never contain user input.
pub fn stored_filename(original_filename: &str, bytes: &[u8]) -> String {
    let hash = format!("{:x}", Sha256::digest(bytes));
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    match file_extension(original_filename) {
        Some(ext) => format!("{}_{}.{}", stamp, &hash[..12], ext),
        None => format!("{}_{}", stamp, &hash[..12]),
    }
}

/// Lowercased extension without the dot.
pub fn file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Files under the configured video and reference directories.
pub struct FsStorage {
    videos_dir: PathBuf,
    references_dir: PathBuf,
}

impl FsStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        for dir in [&config.videos_dir, &config.references_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;
        }
        Ok(Self {
            videos_dir: config.videos_dir.clone(),
            references_dir: config.references_dir.clone(),
        })
    }

    fn write(dir: &Path, original_filename: &str, bytes: &[u8]) -> Result<String> {
        let name = stored_filename(original_filename, bytes);
        std::fs::write(dir.join(&name), bytes)
            .with_context(|| format!("Failed to store {}", original_filename))?;
        Ok(name)
    }

    fn read(dir: &Path, name: &str) -> Result<Vec<u8>> {
        std::fs::read(dir.join(name)).with_context(|| format!("Failed to read stored file {}", name))
    }

    fn remove(dir: &Path, name: &str) -> Result<()> {
        match std::fs::remove_file(dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove stored file {}", name)),
        }
    }
}

impl MediaStorage for FsStorage {
    fn store_video(&self, original_filename: &str, bytes: &[u8]) -> Result<String> {
        Self::write(&self.videos_dir, original_filename, bytes)
    }

    fn store_reference(&self, original_filename: &str, bytes: &[u8]) -> Result<String> {
        Self::write(&self.references_dir, original_filename, bytes)
    }

    fn open_video(&self, filename: &str) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.videos_dir.join(filename))
            .with_context(|| format!("Failed to open stored file {}", filename))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn read_reference(&self, image: &ReferenceImage) -> Result<Vec<u8>> {
        Self::read(&self.references_dir, &image.filename)
    }

    fn remove_video(&self, filename: &str) -> Result<()> {
        Self::remove(&self.videos_dir, filename)
    }

    fn remove_reference(&self, filename: &str) -> Result<()> {
        Self::remove(&self.references_dir, filename)
    }
}

/// In-memory storage for embedding and tests.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.files
            .lock()
            .map_err(|_| anyhow!("memory storage lock poisoned"))
    }

    fn put(&self, prefix: &str, original_filename: &str, bytes: &[u8]) -> Result<String> {
        let name = format!("{}/{}", prefix, stored_filename(original_filename, bytes));
        self.files()?.insert(name.clone(), bytes.to_vec());
        Ok(name)
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.files()?
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("stored file {} is missing", name))
    }

    /// Drops a stored file, simulating storage loss.
    pub fn forget(&self, name: &str) -> Result<bool> {
        Ok(self.files()?.remove(name).is_some())
    }
}

impl MediaStorage for MemoryStorage {
    fn store_video(&self, original_filename: &str, bytes: &[u8]) -> Result<String> {
        self.put("videos", original_filename, bytes)
    }

    fn store_reference(&self, original_filename: &str, bytes: &[u8]) -> Result<String> {
        self.put("references", original_filename, bytes)
    }

    fn open_video(&self, filename: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.get(filename)?)))
    }

    fn read_reference(&self, image: &ReferenceImage) -> Result<Vec<u8>> {
        self.get(&image.filename)
    }

    fn remove_video(&self, filename: &str) -> Result<()> {
        self.forget(filename).map(|_| ())
    }

    fn remove_reference(&self, filename: &str) -> Result<()> {
        self.forget(filename).map(|_| ())
    }
}
