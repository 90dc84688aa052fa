//! Reduction of the pending-operation backlog to its minimal effective set.
//!
//! Operations are grouped by what they target, then each group is reduced
//! by an explicit `(timestamp, id)` ordering:
//!
//! - keywords group by `(image, payload)`, compared case-sensitively
//! - single-valued fields group by `(image, field)`
//! - face regions are never grouped
//!
//! The newest operation in a group survives. Operations immediately preceding
//! it with the same effect are absorbed into it: they are not written again,
//! but they take the survivor's final state. Everything older than the first
//! differing operation is discarded.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{FieldKind, OperationState, PendingOperation, Reduction};
use crate::db::Database;

/// A surviving operation plus the earlier duplicates folded into it.
#[derive(Debug, Clone)]
pub struct ConflatedOperation {
    pub operation: PendingOperation,
    pub absorbed: Vec<i64>,
}

impl ConflatedOperation {
    /// The survivor's id followed by every absorbed id.
    pub fn operation_ids(&self) -> impl Iterator<Item = i64> + '_ {
        std::iter::once(self.operation.id).chain(self.absorbed.iter().copied())
    }
}

/// All surviving operations for one image, oldest first.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub image_id: i64,
    pub operations: Vec<ConflatedOperation>,
}

impl ImageBatch {
    pub fn operation_ids(&self) -> Vec<i64> {
        self.operations
            .iter()
            .flat_map(|c| c.operation_ids())
            .collect()
    }
}

/// Result of a conflation pass.
#[derive(Debug, Clone, Default)]
pub struct Conflation {
    pub batches: BTreeMap<i64, ImageBatch>,
    pub discarded: Vec<i64>,
}

impl Conflation {
    pub fn surviving_count(&self) -> usize {
        self.batches.values().map(|b| b.operations.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Set {
        image_id: i64,
        field: FieldKind,
        payload: String,
    },
    Single {
        image_id: i64,
        field: FieldKind,
    },
    Each {
        operation_id: i64,
    },
}

impl GroupKey {
    fn for_operation(op: &PendingOperation) -> Self {
        match op.field.reduction() {
            Reduction::SetValued => GroupKey::Set {
                image_id: op.image_id,
                field: op.field,
                payload: op.payload.clone(),
            },
            Reduction::SingleValued => GroupKey::Single {
                image_id: op.image_id,
                field: op.field,
            },
            Reduction::AppendOnly => GroupKey::Each {
                operation_id: op.id,
            },
        }
    }
}

/// Reduce a batch of pending operations. Input order does not matter.
pub fn conflate(mut operations: Vec<PendingOperation>) -> Conflation {
    operations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

    let mut groups: BTreeMap<GroupKey, Vec<PendingOperation>> = BTreeMap::new();
    for op in operations {
        groups.entry(GroupKey::for_operation(&op)).or_default().push(op);
    }

    let mut result = Conflation::default();

    for (_, mut group) in groups {
        // Groups are non-empty and oldest first.
        let Some(survivor) = group.pop() else {
            continue;
        };

        let mut absorbed = Vec::new();
        while let Some(previous) = group.last() {
            if !previous.same_effect(&survivor) {
                break;
            }
            absorbed.push(previous.id);
            group.pop();
        }
        result.discarded.extend(group.iter().map(|op| op.id));

        result
            .batches
            .entry(survivor.image_id)
            .or_insert_with(|| ImageBatch {
                image_id: survivor.image_id,
                operations: Vec::new(),
            })
            .operations
            .push(ConflatedOperation {
                operation: survivor,
                absorbed,
            });
    }

    for batch in result.batches.values_mut() {
        batch.operations.sort_by(|a, b| {
            a.operation
                .timestamp
                .cmp(&b.operation.timestamp)
                .then(a.operation.id.cmp(&b.operation.id))
        });
    }
    result.discarded.sort_unstable();

    result
}

/// Pulls eligible operations from the log, conflates them and persists the
/// discards.
pub struct ConflationEngine {
    db: Arc<Database>,
    debounce: Duration,
    batch_size: usize,
}

impl ConflationEngine {
    pub fn new(db: Arc<Database>, debounce: Duration, batch_size: usize) -> Self {
        Self {
            db,
            debounce,
            batch_size: batch_size.max(1),
        }
    }

    /// Conflate the pending operations of every image that has had no new
    /// edit for at least `debounce` as of `now`.
    ///
    /// Discarded operations are marked before this returns, so a crash
    /// between here and the write cannot resurrect them.
    pub fn collect(&self, now: DateTime<Utc>) -> Result<Vec<ImageBatch>> {
        // An out-of-range debounce holds everything back rather than nothing.
        let cutoff = chrono::Duration::from_std(self.debounce)
            .ok()
            .and_then(|debounce| now.checked_sub_signed(debounce));
        let Some(cutoff) = cutoff else {
            return Ok(Vec::new());
        };

        let operations = self.db.pending_operations_before(cutoff, self.batch_size)?;
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        let fetched = operations.len();

        let conflation = conflate(operations);
        if !conflation.discarded.is_empty() {
            self.db
                .set_operation_state(&conflation.discarded, OperationState::Discarded)?;
        }

        info!(
            fetched,
            surviving = conflation.surviving_count(),
            discarded = conflation.discarded.len(),
            images = conflation.batches.len(),
            "Conflated pending metadata operations"
        );
        for batch in conflation.batches.values() {
            debug!(
                image_id = batch.image_id,
                operations = ?batch.operation_ids(),
                "Image write batch"
            );
        }

        Ok(conflation.batches.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{NewOperation, OperationType};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn op(id: i64, image_id: i64, field: FieldKind, kind: OperationType, payload: &str, secs: i64) -> PendingOperation {
        PendingOperation {
            id,
            image_id,
            field,
            op: kind,
            payload: payload.to_string(),
            timestamp: at(secs),
            actor_id: None,
            state: OperationState::Pending,
        }
    }

    fn surviving_ids(conflation: &Conflation, image_id: i64) -> Vec<i64> {
        conflation.batches[&image_id]
            .operations
            .iter()
            .map(|c| c.operation.id)
            .collect()
    }

    #[test]
    fn test_alternating_keyword_keeps_latest() {
        use OperationType::*;
        let ops = vec![
            op(1, 7, FieldKind::Keyword, Add, "cat", 1),
            op(2, 7, FieldKind::Keyword, Remove, "cat", 2),
            op(3, 7, FieldKind::Keyword, Add, "cat", 3),
            op(4, 7, FieldKind::Keyword, Remove, "cat", 4),
        ];

        let conflation = conflate(ops);

        assert_eq!(surviving_ids(&conflation, 7), vec![4]);
        assert!(conflation.batches[&7].operations[0].absorbed.is_empty());
        assert_eq!(conflation.discarded, vec![1, 2, 3]);
    }

    #[test]
    fn test_input_order_is_irrelevant() {
        use OperationType::*;
        let ops = vec![
            op(4, 7, FieldKind::Keyword, Remove, "cat", 4),
            op(1, 7, FieldKind::Keyword, Add, "cat", 1),
            op(3, 7, FieldKind::Keyword, Add, "cat", 3),
            op(2, 7, FieldKind::Keyword, Remove, "cat", 2),
        ];

        let conflation = conflate(ops);
        assert_eq!(surviving_ids(&conflation, 7), vec![4]);
        assert_eq!(conflation.discarded, vec![1, 2, 3]);
    }

    #[test]
    fn test_identical_trailing_edits_are_absorbed() {
        let ops = vec![
            op(1, 7, FieldKind::Keyword, OperationType::Add, "sunset", 0),
            op(2, 7, FieldKind::Keyword, OperationType::Add, "sunset", 2),
        ];

        let conflation = conflate(ops);

        let batch = &conflation.batches[&7];
        assert_eq!(batch.operations.len(), 1);
        assert_eq!(batch.operations[0].operation.id, 2);
        assert_eq!(batch.operations[0].absorbed, vec![1]);
        assert_eq!(batch.operation_ids(), vec![2, 1]);
        assert!(conflation.discarded.is_empty());
    }

    #[test]
    fn test_keywords_are_case_sensitive() {
        let ops = vec![
            op(1, 7, FieldKind::Keyword, OperationType::Add, "Cat", 1),
            op(2, 7, FieldKind::Keyword, OperationType::Remove, "cat", 2),
        ];

        let conflation = conflate(ops);
        assert_eq!(surviving_ids(&conflation, 7), vec![1, 2]);
        assert!(conflation.discarded.is_empty());
    }

    #[test]
    fn test_single_valued_latest_wins_across_payloads() {
        use OperationType::*;
        let ops = vec![
            op(1, 7, FieldKind::Caption, Add, "first", 1),
            op(2, 7, FieldKind::Caption, Add, "second", 2),
            op(3, 7, FieldKind::Rating, Add, "3", 3),
            op(4, 7, FieldKind::Caption, Add, "third", 4),
            op(5, 7, FieldKind::Rating, Add, "5", 5),
        ];

        let conflation = conflate(ops);
        assert_eq!(surviving_ids(&conflation, 7), vec![4, 5]);
        assert_eq!(conflation.discarded, vec![1, 2, 3]);
    }

    #[test]
    fn test_face_regions_are_not_reduced() {
        let region = r#"{"x":0.1,"y":0.1,"w":0.2,"h":0.2}"#;
        let ops = vec![
            op(1, 7, FieldKind::FaceRegion, OperationType::Add, region, 1),
            op(2, 7, FieldKind::FaceRegion, OperationType::Add, region, 2),
            op(3, 7, FieldKind::FaceRegion, OperationType::Add, region, 3),
        ];

        let conflation = conflate(ops);
        assert_eq!(surviving_ids(&conflation, 7), vec![1, 2, 3]);
        assert!(conflation.discarded.is_empty());
    }

    #[test]
    fn test_timestamp_tie_broken_by_id() {
        let ops = vec![
            op(9, 7, FieldKind::Caption, OperationType::Add, "later insert", 1),
            op(8, 7, FieldKind::Caption, OperationType::Add, "earlier insert", 1),
        ];

        let conflation = conflate(ops);
        assert_eq!(surviving_ids(&conflation, 7), vec![9]);
        assert_eq!(conflation.discarded, vec![8]);
    }

    #[test]
    fn test_images_are_isolated() {
        use OperationType::*;
        let interleaved = vec![
            op(1, 1, FieldKind::Keyword, Add, "cat", 1),
            op(2, 2, FieldKind::Keyword, Remove, "cat", 2),
            op(3, 1, FieldKind::Keyword, Remove, "cat", 3),
            op(4, 2, FieldKind::Keyword, Add, "cat", 4),
            op(5, 1, FieldKind::Caption, Add, "one", 5),
        ];
        let only_b = vec![
            op(2, 2, FieldKind::Keyword, Remove, "cat", 2),
            op(4, 2, FieldKind::Keyword, Add, "cat", 4),
        ];

        let together = conflate(interleaved);
        let alone = conflate(only_b);

        assert_eq!(surviving_ids(&together, 2), surviving_ids(&alone, 2));
        assert_eq!(surviving_ids(&together, 1), vec![3, 5]);
        assert_eq!(together.discarded, vec![1, 2]);
        assert_eq!(alone.discarded, vec![2]);
    }

    fn engine_fixture() -> (Arc<Database>, i64, i64) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let quiet = db.add_test_image("/photos", "a.jpg").unwrap();
        let busy = db.add_test_image("/photos", "b.jpg").unwrap();
        (db, quiet, busy)
    }

    fn keyword_op(image_id: i64, kind: OperationType, secs: i64) -> NewOperation {
        NewOperation {
            image_id,
            field: FieldKind::Keyword,
            op: kind,
            payload: "cat".to_string(),
            timestamp: at(secs),
            actor_id: Some(3),
        }
    }

    #[test]
    fn test_engine_respects_debounce_and_persists_discards() {
        let (db, quiet, busy) = engine_fixture();
        let ids = db
            .insert_operations(&[
                keyword_op(quiet, OperationType::Add, 10),
                keyword_op(quiet, OperationType::Remove, 20),
                keyword_op(busy, OperationType::Add, 40),
                keyword_op(busy, OperationType::Add, 95),
            ])
            .unwrap();

        let engine = ConflationEngine::new(Arc::clone(&db), Duration::from_secs(30), 100);
        let batches = engine.collect(at(100)).unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].image_id, quiet);
        assert_eq!(batches[0].operations.len(), 1);
        assert_eq!(batches[0].operations[0].operation.id, ids[1]);

        let states = |image_id| -> Vec<_> {
            db.operations_for_image(image_id)
                .unwrap()
                .into_iter()
                .map(|o| (o.id, o.state))
                .collect()
        };
        assert_eq!(
            states(quiet),
            vec![(ids[0], OperationState::Discarded), (ids[1], OperationState::Pending)]
        );
        // The edit at 40 is past the cutoff, but the one at 95 keeps the image waiting.
        assert_eq!(
            states(busy),
            vec![(ids[2], OperationState::Pending), (ids[3], OperationState::Pending)]
        );
    }

    #[test]
    fn test_engine_huge_debounce_holds_everything() {
        let (db, quiet, _) = engine_fixture();
        db.insert_operations(&[keyword_op(quiet, OperationType::Add, 10)])
            .unwrap();

        let engine = ConflationEngine::new(Arc::clone(&db), Duration::from_secs(u64::MAX), 100);
        assert!(engine.collect(at(100)).unwrap().is_empty());
        assert_eq!(
            db.operations_for_image(quiet).unwrap()[0].state,
            OperationState::Pending
        );
    }
}
