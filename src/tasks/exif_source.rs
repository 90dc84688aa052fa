//! Job source that writes conflated metadata edits back to image files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{Job, JobPriority, JobSource};
use crate::cache::ImageCache;
use crate::config::MetadataWriteConfig;
use crate::db::Database;
use crate::metadata::{
    ConflatedOperation, ConflationEngine, FieldEdit, ImageBatch, MetadataWriter, OperationState,
};

pub const EXIF_SOURCE_NAME: &str = "exif-write";

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct ExifJobSource {
    db: Arc<Database>,
    cache: Arc<ImageCache>,
    writer: Arc<dyn MetadataWriter>,
    engine: ConflationEngine,
    retention: chrono::Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl ExifJobSource {
    pub fn new(
        db: Arc<Database>,
        cache: Arc<ImageCache>,
        writer: Arc<dyn MetadataWriter>,
        config: &MetadataWriteConfig,
    ) -> Self {
        Self {
            engine: ConflationEngine::new(Arc::clone(&db), config.debounce(), config.batch_size),
            db,
            cache,
            writer,
            retention: chrono::Duration::days(i64::from(config.retention_days)),
            last_sweep: Mutex::new(None),
        }
    }

    /// Delete old terminal operations, at most once per [`SWEEP_INTERVAL`].
    fn maybe_sweep(&self) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|p| p.into_inner());
            if last.is_some_and(|at| at.elapsed() < SWEEP_INTERVAL) {
                return;
            }
            *last = Some(Instant::now());
        }

        match self.db.sweep_terminal_operations(Utc::now() - self.retention) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Swept finished metadata operations"),
            Err(e) => warn!(error = %e, "Failed to sweep finished metadata operations"),
        }
    }

    fn job_for_batch(&self, batch: ImageBatch) -> Result<Option<ExifWriteJob>> {
        let Some(path) = self.db.image_path(batch.image_id)? else {
            warn!(image_id = batch.image_id, "Pending operations for unknown image");
            self.db
                .set_operation_state(&batch.operation_ids(), OperationState::Failed)?;
            return Ok(None);
        };

        Ok(Some(ExifWriteJob {
            image_id: batch.image_id,
            path,
            operations: batch.operations,
            db: Arc::clone(&self.db),
            cache: Arc::clone(&self.cache),
            writer: Arc::clone(&self.writer),
        }))
    }
}

#[async_trait]
impl JobSource for ExifJobSource {
    fn name(&self) -> &str {
        EXIF_SOURCE_NAME
    }

    fn priority(&self) -> JobPriority {
        JobPriority::High
    }

    async fn get_pending_jobs(&self, max_count: usize) -> Result<Vec<Box<dyn Job>>> {
        self.maybe_sweep();

        // Batches beyond max_count stay pending and are picked up next cycle.
        let batches = self
            .engine
            .collect(Utc::now())
            .context("Failed to conflate pending operations")?;

        let mut jobs: Vec<Box<dyn Job>> = Vec::new();
        for batch in batches.into_iter().take(max_count) {
            if let Some(job) = self.job_for_batch(batch)? {
                jobs.push(Box::new(job));
            }
        }
        Ok(jobs)
    }
}

/// Writes one image's conflated edits in a single tool invocation.
pub struct ExifWriteJob {
    image_id: i64,
    path: PathBuf,
    operations: Vec<ConflatedOperation>,
    db: Arc<Database>,
    cache: Arc<ImageCache>,
    writer: Arc<dyn MetadataWriter>,
}

impl ExifWriteJob {
    pub fn image_id(&self) -> i64 {
        self.image_id
    }

    /// Validated edits plus the ids they settle. Invalid operations are
    /// returned separately so they can be failed without being written.
    fn prepare(&self) -> (Vec<FieldEdit>, Vec<i64>, Vec<i64>) {
        let mut edits = Vec::with_capacity(self.operations.len());
        let mut ids = Vec::new();
        let mut invalid = Vec::new();

        for conflated in &self.operations {
            match FieldEdit::from_operation(&conflated.operation) {
                Ok(edit) => {
                    edits.push(edit);
                    ids.extend(conflated.operation_ids());
                }
                Err(e) => {
                    warn!(
                        image_id = self.image_id,
                        operation_id = conflated.operation.id,
                        field = conflated.operation.field.as_str(),
                        error = %e,
                        "Rejecting invalid metadata operation"
                    );
                    invalid.extend(conflated.operation_ids());
                }
            }
        }
        (edits, ids, invalid)
    }
}

#[async_trait]
impl Job for ExifWriteJob {
    fn name(&self) -> &str {
        "exif-write"
    }

    fn description(&self) -> String {
        format!(
            "Write {} metadata edit(s) to {}",
            self.operations.len(),
            self.path.display()
        )
    }

    async fn process(&self) -> Result<()> {
        let (edits, ids, invalid) = self.prepare();
        if !invalid.is_empty() {
            self.db.set_operation_state(&invalid, OperationState::Failed)?;
        }
        if edits.is_empty() {
            return Ok(());
        }

        match self.writer.write(&self.path, &edits).await {
            Ok(()) => {
                let settled = self.db.set_operation_state(&ids, OperationState::Written);
                let touched = self.db.touch_image(self.image_id);
                self.cache.evict(self.image_id);
                settled?;
                touched?;
                debug!(
                    image_id = self.image_id,
                    operations = ?ids,
                    "Metadata operations written"
                );
                Ok(())
            }
            Err(write_error) => {
                error!(
                    image_id = self.image_id,
                    path = %self.path.display(),
                    operations = ?ids,
                    error = %write_error,
                    "Metadata write failed"
                );

                // Restore the file before touching the store.
                match self.writer.recover(&self.path) {
                    Ok(true) => {
                        info!(image_id = self.image_id, "Recovered original after failed write")
                    }
                    Ok(false) => {}
                    Err(e) => error!(
                        image_id = self.image_id,
                        path = %self.path.display(),
                        error = %e,
                        "Failed to recover original after failed write"
                    ),
                }
                self.cache.evict(self.image_id);

                if let Err(e) = self.db.set_operation_state(&ids, OperationState::Failed) {
                    error!(
                        image_id = self.image_id,
                        operations = ?ids,
                        error = %e,
                        "Failed to mark metadata operations failed"
                    );
                }

                Err(anyhow::Error::new(write_error)
                    .context(format!("Failed to write metadata to {}", self.path.display())))
            }
        }
    }
}
