use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_videos_dir")]
    pub videos_dir: PathBuf,

    #[serde(default = "default_references_dir")]
    pub references_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            videos_dir: default_videos_dir(),
            references_dir: default_references_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Number of analysis jobs allowed in `running` at once.
    #[serde(default = "default_analysis_concurrency")]
    pub max_concurrent_jobs: usize,

    /// Jobs waiting for a worker beyond this are rejected up front.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Sampled frames per second of video.
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Detections below this confidence are dropped before consolidation.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_analysis_concurrency(),
            queue_capacity: default_queue_capacity(),
            job_timeout_secs: default_job_timeout_secs(),
            frame_rate: default_frame_rate(),
            confidence: default_confidence(),
        }
    }
}

impl AnalysisConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_concurrency")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Minimum similarity (0.0 - 1.0) for a face to count as a match.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_search_concurrency(),
            queue_capacity: default_queue_capacity(),
            job_timeout_secs: default_job_timeout_secs(),
            match_threshold: default_match_threshold(),
        }
    }
}

impl SearchConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vidsight")
}

fn default_db_path() -> PathBuf {
    data_dir().join("vidsight.db")
}

fn default_videos_dir() -> PathBuf {
    data_dir().join("videos")
}

fn default_references_dir() -> PathBuf {
    data_dir().join("references")
}

fn default_analysis_concurrency() -> usize {
    3
}

fn default_search_concurrency() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_job_timeout_secs() -> u64 {
    3600 // 1 hour
}

fn default_frame_rate() -> u32 {
    1
}

fn default_confidence() -> f64 {
    0.7
}

fn default_match_threshold() -> f64 {
    0.75
}

impl Config {
    /// Load from `VIDSIGHT_CONFIG` or the default location, writing a
    /// default config file on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis.max_concurrent_jobs == 0 || self.search.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if self.analysis.queue_capacity == 0 || self.search.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.analysis.frame_rate == 0 {
            bail!("analysis.frame_rate must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.analysis.confidence) {
            bail!("analysis.confidence must be within 0.0..=1.0");
        }
        if !(0.0..=1.0).contains(&self.search.match_threshold) {
            bail!("search.match_threshold must be within 0.0..=1.0");
        }
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vidsight")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("VIDSIGHT_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [analysis]
            max_concurrent_jobs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.analysis.max_concurrent_jobs, 5);
        assert_eq!(config.analysis.frame_rate, 1);
        assert_eq!(config.analysis.job_timeout_secs, 3600);
        assert_eq!(config.search.max_concurrent_jobs, 2);
        assert!((config.search.match_threshold - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.analysis.frame_rate = 4;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.analysis.frame_rate, 4);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.analysis.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.confidence = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.frame_rate = 0;
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }
}
