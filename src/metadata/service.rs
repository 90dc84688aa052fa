use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::{FieldEdit, FieldValue, NewOperation, OperationType};
use crate::cache::ImageCache;
use crate::db::Database;
use crate::tasks::{JobScheduler, EXIF_SOURCE_NAME};

/// Entry point for metadata edits.
///
/// Edits take effect in the database immediately; the file write-back is
/// left to the scheduler.
pub struct MetadataService {
    db: Arc<Database>,
    cache: Arc<ImageCache>,
    scheduler: Option<Arc<JobScheduler>>,
}

impl MetadataService {
    pub fn new(db: Arc<Database>, cache: Arc<ImageCache>) -> Self {
        Self {
            db,
            cache,
            scheduler: None,
        }
    }

    /// Wake `scheduler` whenever new operations are submitted.
    pub fn with_scheduler(mut self, scheduler: Arc<JobScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Record `add` and `remove` edits for one image and return the new
    /// operation ids.
    ///
    /// Every value is validated before anything is stored. Removes are
    /// logged before adds, so a value both added and removed in one call
    /// ends up added.
    pub fn submit_operations(
        &self,
        image_id: i64,
        add: &[FieldValue],
        remove: &[FieldValue],
        actor_id: Option<i64>,
    ) -> Result<Vec<i64>> {
        self.submit_operations_at(image_id, add, remove, actor_id, Utc::now())
    }

    pub fn submit_operations_at(
        &self,
        image_id: i64,
        add: &[FieldValue],
        remove: &[FieldValue],
        actor_id: Option<i64>,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        if add.is_empty() && remove.is_empty() {
            return Ok(Vec::new());
        }

        let changes = remove
            .iter()
            .map(|fv| (fv, OperationType::Remove))
            .chain(add.iter().map(|fv| (fv, OperationType::Add)));

        let mut edits = Vec::with_capacity(add.len() + remove.len());
        let mut operations = Vec::with_capacity(add.len() + remove.len());
        for (fv, op) in changes {
            edits.push(FieldEdit::parse(fv.field, op, &fv.value)?);
            operations.push(NewOperation {
                image_id,
                field: fv.field,
                op,
                payload: fv.value.clone(),
                timestamp,
                actor_id,
            });
        }

        if self.db.image_path(image_id)?.is_none() {
            bail!("Unknown image {image_id}");
        }

        let ids = self.db.submit_edits(image_id, &operations, &edits)?;
        self.cache.evict(image_id);

        info!(
            image_id,
            added = add.len(),
            removed = remove.len(),
            ?actor_id,
            "Queued metadata operations"
        );

        if let Some(scheduler) = &self.scheduler {
            scheduler.flag_new_jobs(EXIF_SOURCE_NAME);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldKind, OperationState};
    use std::time::Duration;

    fn setup() -> (Arc<Database>, Arc<ImageCache>, MetadataService, i64) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let image_id = db.add_test_image("/photos", "a.jpg").unwrap();
        let cache = Arc::new(ImageCache::new(db.clone(), Duration::from_secs(60)));
        let service = MetadataService::new(db.clone(), cache.clone());
        (db, cache, service, image_id)
    }

    #[test]
    fn test_submit_logs_and_applies() {
        let (db, cache, service, image_id) = setup();
        let before = cache.get_cached_image(image_id).unwrap();
        assert!(before.tags.is_empty());

        let ids = service
            .submit_operations(
                image_id,
                &[FieldValue::keyword("sunset"), FieldValue::new(FieldKind::Rating, "4")],
                &[],
                Some(7),
            )
            .unwrap();
        assert_eq!(ids.len(), 2);

        let ops = db.operations_for_image(image_id).unwrap();
        assert!(ops.iter().all(|o| o.state == OperationState::Pending));
        assert!(ops.iter().all(|o| o.actor_id == Some(7)));

        // Evicted, so the next read sees the new relations.
        let after = cache.get_cached_image(image_id).unwrap();
        assert_eq!(after.keywords(), vec!["sunset"]);
        assert_eq!(after.metadata.as_ref().unwrap().rating, Some(4));
    }

    #[test]
    fn test_add_wins_over_remove_in_same_call() {
        let (db, cache, service, image_id) = setup();
        service
            .submit_operations(
                image_id,
                &[FieldValue::keyword("cat")],
                &[FieldValue::keyword("cat")],
                None,
            )
            .unwrap();

        let ops = db.operations_for_image(image_id).unwrap();
        assert_eq!(ops[0].op, OperationType::Remove);
        assert_eq!(ops[1].op, OperationType::Add);
        assert_eq!(ops[0].timestamp, ops[1].timestamp);
        assert!(ops[1].id > ops[0].id);
        assert_eq!(cache.get_cached_image(image_id).unwrap().keywords(), vec!["cat"]);
    }

    #[test]
    fn test_invalid_value_stores_nothing() {
        let (db, _, service, image_id) = setup();
        let result = service.submit_operations(
            image_id,
            &[FieldValue::keyword("ok"), FieldValue::new(FieldKind::Rating, "9")],
            &[],
            None,
        );
        assert!(result.is_err());
        assert!(db.operations_for_image(image_id).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_image_is_rejected() {
        let (_, _, service, _) = setup();
        assert!(service
            .submit_operations(999, &[FieldValue::keyword("x")], &[], None)
            .is_err());
    }

    #[test]
    fn test_failed_relation_edit_logs_nothing() {
        let (db, _, service, image_id) = setup();
        db.conn().execute_batch("DROP TABLE image_tags").unwrap();

        let result = service.submit_operations(image_id, &[FieldValue::keyword("cat")], &[], None);
        assert!(result.is_err());
        assert!(db.operations_for_image(image_id).unwrap().is_empty());
    }

    #[test]
    fn test_empty_submission_is_noop() {
        let (db, _, service, image_id) = setup();
        assert!(service.submit_operations(image_id, &[], &[], None).unwrap().is_empty());
        assert!(db.operations_for_image(image_id).unwrap().is_empty());
    }
}
