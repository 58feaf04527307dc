//! Wires the store, storage, detector and job services together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::catalog::CatalogService;
use crate::config::Config;
use crate::db::{JobStore, SqliteDb, Store};
use crate::faces::{Detector, SimulatedDetector};
use crate::jobs::{AnalysisService, SearchService};
use crate::storage::{FsStorage, MediaStorage};
use crate::tasks::RunningJobs;

pub struct Engine {
    pub catalog: CatalogService,
    pub analysis: AnalysisService,
    pub search: SearchService,
    running: Arc<RunningJobs>,
}

impl Engine {
    /// Opens the configured SQLite database and media directories with the
    /// built-in simulated detector.
    pub fn open(config: &Config) -> Result<Self> {
        let db = SqliteDb::open(&config.database.sqlite_path)?;
        db.initialize().context("Failed to initialize database")?;
        let storage = FsStorage::new(&config.storage)?;
        let detector = SimulatedDetector::new(config.search.match_threshold);

        Self::start(config, Arc::new(db), Arc::new(storage), Arc::new(detector))
    }

    /// Fails jobs a previous process left active, then starts the worker
    /// pools. Must be called inside a tokio runtime.
    pub fn start(
        config: &Config,
        store: Arc<dyn Store>,
        storage: Arc<dyn MediaStorage>,
        detector: Arc<dyn Detector>,
    ) -> Result<Self> {
        let interrupted = store
            .fail_interrupted_jobs()
            .context("Failed to recover interrupted jobs")?;
        if interrupted > 0 {
            warn!(count = interrupted, "Marked jobs interrupted by restart as failed");
        }

        let running = RunningJobs::new();
        let catalog = CatalogService::new(store.clone(), storage.clone(), running.clone());
        let analysis = AnalysisService::start(
            config.analysis.clone(),
            store.clone(),
            storage.clone(),
            detector.clone(),
            running.clone(),
        );
        let search = SearchService::start(
            config.search.clone(),
            store,
            storage,
            detector,
            running.clone(),
        );

        info!(
            analysis_workers = config.analysis.max_concurrent_jobs,
            search_workers = config.search.max_concurrent_jobs,
            "Engine started"
        );
        Ok(Self {
            catalog,
            analysis,
            search,
            running,
        })
    }

    /// Number of jobs currently executing.
    pub fn running_jobs(&self) -> usize {
        self.running.len()
    }

    /// Lets queued jobs finish and waits for the workers. With `abort`,
    /// running jobs are cancelled first.
    pub async fn shutdown(&self, abort: bool) {
        if abort {
            self.running.cancel_all();
        }
        self.analysis.shutdown().await;
        self.search.shutdown().await;
        info!("Engine stopped");
    }
}
