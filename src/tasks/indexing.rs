//! Job source that re-reads technical metadata from files that changed on disk.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Job, JobPriority, JobSource};
use crate::cache::ImageCache;
use crate::db::Database;
use crate::scanner::{extract_metadata, sha256_file, ExtractedMetadata};

pub const INDEXING_SOURCE_NAME: &str = "indexing";

pub struct IndexingJobSource {
    db: Arc<Database>,
    cache: Arc<ImageCache>,
    batch_size: usize,
}

impl IndexingJobSource {
    pub fn new(db: Arc<Database>, cache: Arc<ImageCache>, batch_size: usize) -> Self {
        Self {
            db,
            cache,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl JobSource for IndexingJobSource {
    fn name(&self) -> &str {
        INDEXING_SOURCE_NAME
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Low
    }

    async fn get_pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>> {
        let images = self.db.images_needing_reindex(max_count.min(self.batch_size))?;
        Ok(images
            .into_iter()
            .map(|(image_id, path)| {
                Box::new(ReindexJob {
                    image_id,
                    path,
                    db: Arc::clone(&self.db),
                    cache: Arc::clone(&self.cache),
                }) as Box<dyn Job>
            })
            .collect())
    }
}

pub struct ReindexJob {
    image_id: i64,
    path: PathBuf,
    db: Arc<Database>,
    cache: Arc<ImageCache>,
}

#[async_trait]
impl Job for ReindexJob {
    fn name(&self) -> &str {
        "reindex"
    }

    fn description(&self) -> String {
        format!("Re-read metadata from {}", self.path.display())
    }

    fn can_process(&self) -> bool {
        self.path.exists()
    }

    async fn process(&self) -> Result<()> {
        let path = self.path.clone();
        let extracted = tokio::task::spawn_blocking(move || -> Result<(ExtractedMetadata, String)> {
            let metadata = extract_metadata(&path)?;
            let sha256 = sha256_file(&path)?;
            Ok((metadata, sha256))
        })
        .await
        .context("Metadata extraction task failed")?;

        let result = match extracted {
            Ok((metadata, sha256)) => {
                self.db
                    .store_extracted_metadata(self.image_id, Some(&metadata), Some(&sha256))?;
                debug!(
                    image_id = self.image_id,
                    width = metadata.width,
                    height = metadata.height,
                    "Re-indexed image metadata"
                );
                Ok(())
            }
            Err(e) => {
                // Mark scanned anyway so an unreadable file is not retried every cycle.
                warn!(image_id = self.image_id, path = %self.path.display(), error = %e, "Failed to re-index image");
                self.db.store_extracted_metadata(self.image_id, None, None)?;
                Err(e)
            }
        };

        self.cache.evict(self.image_id);
        result
    }
}
