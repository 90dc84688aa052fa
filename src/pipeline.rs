//! Wiring of the store, cache, writer, scheduler and job sources.

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::ImageCache;
use crate::config::Config;
use crate::db::Database;
use crate::metadata::{ExifToolWriter, MetadataService, MetadataWriter};
use crate::tasks::{ExifJobSource, IndexingJobSource, JobScheduler};

pub struct Pipeline {
    pub config: Config,
    pub db: Arc<Database>,
    pub cache: Arc<ImageCache>,
    pub scheduler: Arc<JobScheduler>,
    pub service: MetadataService,
}

impl Pipeline {
    /// Open the configured database and wire everything to `exiftool`.
    pub fn build(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.db_path)?);
        db.initialize()?;
        let writer = Arc::new(ExifToolWriter::new(
            config.metadata_write.exiftool_path.clone(),
            config.metadata_write.tool_timeout(),
        ));
        Ok(Self::with_writer(config, db, writer))
    }

    pub fn with_writer(config: Config, db: Arc<Database>, writer: Arc<dyn MetadataWriter>) -> Self {
        let cache = Arc::new(ImageCache::new(db.clone(), config.cache.ttl()));
        let scheduler = Arc::new(JobScheduler::new(&config.scheduler));

        scheduler.add_job_source(Arc::new(ExifJobSource::new(
            Arc::clone(&db),
            Arc::clone(&cache),
            writer,
            &config.metadata_write,
        )));
        if config.indexing.enabled {
            scheduler.add_job_source(Arc::new(IndexingJobSource::new(
                Arc::clone(&db),
                Arc::clone(&cache),
                config.indexing.batch_size,
            )));
        }

        let service = MetadataService::new(Arc::clone(&db), Arc::clone(&cache))
            .with_scheduler(Arc::clone(&scheduler));

        Self {
            config,
            db,
            cache,
            scheduler,
            service,
        }
    }

    /// Preload the cache. Failures are logged; the cache fills lazily instead.
    pub fn warm_up(&self) -> usize {
        match self.cache.warm_up(self.config.cache.warmup_count) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = %e, "Failed to warm image cache");
                0
            }
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        info!(db = %self.config.db_path.display(), "Starting metadata pipeline");
        self.scheduler.start()
    }
}
