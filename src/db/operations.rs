//! The pending-operation log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Row, Transaction};
use std::collections::BTreeSet;

use super::images::apply_edits;
use super::{from_millis, placeholders, to_millis, Database};
use crate::metadata::{
    FieldEdit, FieldKind, NewOperation, OperationState, OperationType, PendingOperation,
};

const OPERATION_COLUMNS: &str = "id, image_id, field, op, payload, timestamp, actor_id, state";

fn parse_column<T>(idx: usize, value: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognised value {value:?}").into(),
        )
    })
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    Ok(PendingOperation {
        id: row.get(0)?,
        image_id: row.get(1)?,
        field: parse_column(2, row.get(2)?, FieldKind::from_str)?,
        op: parse_column(3, row.get(3)?, OperationType::from_str)?,
        payload: row.get(4)?,
        timestamp: from_millis(row.get(5)?),
        actor_id: row.get(6)?,
        state: parse_column(7, row.get(7)?, OperationState::from_str)?,
    })
}

fn insert_rows(tx: &Transaction<'_>, operations: &[NewOperation]) -> Result<Vec<i64>> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO pending_operations (image_id, field, op, payload, timestamp, actor_id, state)
        VALUES (?, ?, ?, ?, ?, ?, 'pending')
        "#,
    )?;
    let mut ids = Vec::with_capacity(operations.len());
    for op in operations {
        stmt.execute(params![
            op.image_id,
            op.field.as_str(),
            op.op.as_str(),
            op.payload,
            to_millis(op.timestamp),
            op.actor_id,
        ])?;
        ids.push(tx.last_insert_rowid());
    }
    Ok(ids)
}

impl Database {
    /// Append operations to the log in one transaction, returning their ids
    /// in input order.
    pub fn insert_operations(&self, operations: &[NewOperation]) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ids = insert_rows(&tx, operations)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Log `operations` and mirror `edits` into the image's relations as one
    /// unit. Either both land or neither does.
    pub fn submit_edits(
        &self,
        image_id: i64,
        operations: &[NewOperation],
        edits: &[FieldEdit],
    ) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ids = insert_rows(&tx, operations)?;
        apply_edits(&tx, image_id, edits)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Pending operations of images that have been quiet since `cutoff`.
    ///
    /// An image is eligible only once its newest pending operation is at or
    /// before `cutoff`, so an edit inside the debounce window holds back the
    /// whole image. The newest `limit` operations of eligible images pick the
    /// images for this pass; every pending operation of those images is then
    /// returned, so an image's backlog is never split across passes.
    pub fn pending_operations_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingOperation>> {
        let conn = self.conn();
        let cutoff = to_millis(cutoff);

        let mut stmt = conn.prepare(
            r#"
            SELECT image_id FROM pending_operations
            WHERE state = 'pending' AND image_id IN (
                SELECT image_id FROM pending_operations
                WHERE state = 'pending'
                GROUP BY image_id
                HAVING MAX(timestamp) <= ?
            )
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )?;
        let image_ids: BTreeSet<i64> = stmt
            .query_map(params![cutoff, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        if image_ids.is_empty() {
            return Ok(Vec::new());
        }

        let image_ids: Vec<i64> = image_ids.into_iter().collect();
        let mut operations = Vec::new();
        for chunk in image_ids.chunks(500) {
            let sql = format!(
                r#"
                SELECT {OPERATION_COLUMNS} FROM pending_operations
                WHERE state = 'pending' AND timestamp <= ? AND image_id IN ({})
                ORDER BY timestamp, id
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let values = std::iter::once(cutoff).chain(chunk.iter().copied());
            let rows = stmt.query_map(params_from_iter(values), row_to_operation)?;
            for row in rows {
                operations.push(row?);
            }
        }
        Ok(operations)
    }

    /// Move operations out of `Pending`. Operations already in a terminal state
    /// are left untouched. Returns the number of rows changed.
    pub fn set_operation_state(&self, ids: &[i64], state: OperationState) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());
        let mut changed = 0;
        for chunk in ids.chunks(500) {
            let sql = format!(
                r#"
                UPDATE pending_operations
                SET state = ?, state_changed_at = ?
                WHERE state = 'pending' AND id IN ({})
                "#,
                placeholders(chunk.len())
            );
            let values: Vec<rusqlite::types::Value> = [
                rusqlite::types::Value::Text(state.as_str().to_string()),
                rusqlite::types::Value::Integer(now),
            ]
            .into_iter()
            .chain(chunk.iter().map(|id| rusqlite::types::Value::Integer(*id)))
            .collect();
            changed += tx.execute(&sql, params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Every logged operation for an image, oldest first.
    pub fn operations_for_image(&self, image_id: i64) -> Result<Vec<PendingOperation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE image_id = ? ORDER BY timestamp, id"
        ))?;
        let operations = stmt
            .query_map([image_id], row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    /// Pending operations across all images, oldest first.
    pub fn list_pending_operations(&self, limit: usize) -> Result<Vec<PendingOperation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {OPERATION_COLUMNS} FROM pending_operations
            WHERE state = 'pending'
            ORDER BY timestamp, id
            LIMIT ?
            "#
        ))?;
        let operations = stmt
            .query_map([limit as i64], row_to_operation)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(operations)
    }

    pub fn count_operations_by_state(&self) -> Result<Vec<(OperationState, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM pending_operations GROUP BY state ORDER BY state",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((
                    parse_column(0, row.get(0)?, OperationState::from_str)?,
                    row.get::<_, i64>(1)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(counts)
    }

    /// Delete terminal operations that left `Pending` before `before`.
    /// Pending operations are never removed.
    pub fn sweep_terminal_operations(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let removed = conn.execute(
            r#"
            DELETE FROM pending_operations
            WHERE state != 'pending'
              AND COALESCE(state_changed_at, timestamp) < ?
            "#,
            [to_millis(before)],
        )?;
        Ok(removed)
    }
}
