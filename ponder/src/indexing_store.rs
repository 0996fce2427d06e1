// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The typed row store backing user indexing functions.
//!
//! Operations are keyed by `(table, id)` and scoped to the live tables of
//! the current build. Every write is validated against the schema and tagged
//! with the checkpoint of the event being processed; the inverse operation
//! is appended to a shadow revert log so `revert(to)` can undo everything
//! strictly above a checkpoint after a reorg. The same log reconstructs
//! finalized row states for cache promotion.

use std::collections::BTreeMap;
use std::sync::Arc;

use ponder_db::{Db, DbKind, DbTransaction, SqlType, SqlValue};
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::common::Common;
use crate::error::{PonderError, PonderResult};
use crate::metrics::PonderMetrics;
use crate::schema::{row_from_json, row_to_json, Column, ColumnType, Row, Scalar, Schema, Value};

pub const CHECKPOINT_COLUMN: &str = "_checkpoint";

/// How an update computes the new column values.
pub enum Update {
    Set(Row),
    With(Box<dyn Fn(&Row) -> Row + Send + Sync>),
}

impl Update {
    fn apply(&self, current: &Row) -> Row {
        match self {
            Update::Set(data) => data.clone(),
            Update::With(f) => f(current),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// One `findMany` predicate against a single column.
#[derive(Debug, Clone)]
pub struct WhereFilter {
    pub column: String,
    pub op: WhereOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhereOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl WhereOp {
    fn sql(&self) -> &'static str {
        match self {
            WhereOp::Eq => "=",
            WhereOp::Ne => "<>",
            WhereOp::Gt => ">",
            WhereOp::Gte => ">=",
            WhereOp::Lt => "<",
            WhereOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindManyArgs {
    pub filters: Vec<WhereFilter>,
    /// Defaults to the primary key, ascending.
    pub order_by: Option<(String, Direction)>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Row>,
    pub page_info: PageInfo,
}

/// Rows a cache promotion must apply for one table.
#[derive(Debug, Default)]
pub struct SnapshotDelta {
    /// `(id key, row, write checkpoint)` for rows that exist at the
    /// finalized checkpoint.
    pub upserts: Vec<(String, Row, Checkpoint)>,
    /// Row ids deleted at or before the finalized checkpoint.
    pub deletes: Vec<String>,
}

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct IndexingStore {
    db: Db,
    schema: Schema,
    /// logical table name → fully qualified (quoted) physical name.
    tables: BTreeMap<String, String>,
    /// Fully qualified revert log table.
    revert_table: String,
    metrics: Arc<PonderMetrics>,
}

impl IndexingStore {
    pub fn new(
        db: Db,
        schema: Schema,
        tables: BTreeMap<String, String>,
        revert_table: String,
        common: &Common,
    ) -> Self {
        Self {
            db,
            schema,
            tables,
            revert_table,
            metrics: common.metrics.clone(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn tables(&self) -> &BTreeMap<String, String> {
        &self.tables
    }

    fn physical(&self, table: &str) -> PonderResult<&str> {
        self.tables.get(table).map(String::as_str).ok_or_else(|| {
            PonderError::SchemaViolation(format!("table '{table}' does not exist in the schema"))
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn create(
        &self,
        table: &str,
        checkpoint: &Checkpoint,
        id: Value,
        mut data: Row,
    ) -> PonderResult<Row> {
        self.count_op(table, "create");
        data.insert("id".to_string(), id);
        let row = self.complete_row(table, data)?;
        let mut tx = self.db.begin().await?;
        self.insert_row_tx(&mut tx, table, &row, checkpoint).await?;
        tx.commit().await?;
        self.log_dangling_references(table, &row).await;
        Ok(row)
    }

    /// Atomic batch create: either every row lands or none does.
    pub async fn create_many(
        &self,
        table: &str,
        checkpoint: &Checkpoint,
        rows: Vec<Row>,
    ) -> PonderResult<Vec<Row>> {
        self.count_op(table, "createMany");
        let mut completed = Vec::with_capacity(rows.len());
        for data in rows {
            completed.push(self.complete_row(table, data)?);
        }
        let mut tx = self.db.begin().await?;
        for row in &completed {
            self.insert_row_tx(&mut tx, table, row, checkpoint).await?;
        }
        tx.commit().await?;
        Ok(completed)
    }

    pub async fn update(
        &self,
        table: &str,
        checkpoint: &Checkpoint,
        id: Value,
        update: Update,
    ) -> PonderResult<Row> {
        self.count_op(table, "update");
        let key = id.as_key()?;
        let mut tx = self.db.begin().await?;
        let current = self
            .find_unique_tx(&mut tx, table, &id)
            .await?
            .ok_or_else(|| PonderError::NotFound {
                table: table.to_string(),
                id: key.clone(),
            })?;
        let (current_row, current_checkpoint) = current;
        let row = self
            .merged_row(table, &current_row, update.apply(&current_row))?;
        self.update_row_tx(&mut tx, table, &id, &row, checkpoint).await?;
        self.append_revert_tx(
            &mut tx,
            table,
            &key,
            checkpoint,
            "update",
            Some((&current_row, &current_checkpoint)),
        )
        .await?;
        tx.commit().await?;
        self.log_dangling_references(table, &row).await;
        Ok(row)
    }

    pub async fn upsert(
        &self,
        table: &str,
        checkpoint: &Checkpoint,
        id: Value,
        create: Row,
        update: Update,
    ) -> PonderResult<Row> {
        self.count_op(table, "upsert");
        let key = id.as_key()?;
        let mut tx = self.db.begin().await?;
        match self.find_unique_tx(&mut tx, table, &id).await? {
            Some((current_row, current_checkpoint)) => {
                let row = self
                    .merged_row(table, &current_row, update.apply(&current_row))?;
                self.update_row_tx(&mut tx, table, &id, &row, checkpoint).await?;
                self.append_revert_tx(
                    &mut tx,
                    table,
                    &key,
                    checkpoint,
                    "update",
                    Some((&current_row, &current_checkpoint)),
                )
                .await?;
                tx.commit().await?;
                Ok(row)
            }
            None => {
                let mut data = create;
                data.insert("id".to_string(), id);
                let row = self.complete_row(table, data)?;
                self.insert_row_tx(&mut tx, table, &row, checkpoint).await?;
                tx.commit().await?;
                Ok(row)
            }
        }
    }

    pub async fn delete(
        &self,
        table: &str,
        checkpoint: &Checkpoint,
        id: Value,
    ) -> PonderResult<bool> {
        self.count_op(table, "delete");
        let key = id.as_key()?;
        let mut tx = self.db.begin().await?;
        let Some((current_row, current_checkpoint)) =
            self.find_unique_tx(&mut tx, table, &id).await?
        else {
            tx.rollback().await?;
            return Ok(false);
        };
        let physical = self.physical(table)?;
        let sql = format!(
            "DELETE FROM {physical} WHERE \"id\" = {}",
            self.db.placeholder(1)
        );
        tx.execute(&sql, &[self.id_to_sql(table, &id)?]).await?;
        self.append_revert_tx(
            &mut tx,
            table,
            &key,
            checkpoint,
            "delete",
            Some((&current_row, &current_checkpoint)),
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn find_unique(&self, table: &str, id: &Value) -> PonderResult<Option<Row>> {
        self.count_op(table, "findUnique");
        let mut tx = self.db.begin().await?;
        let found = self.find_unique_tx(&mut tx, table, id).await?;
        tx.rollback().await?;
        Ok(found.map(|(row, _)| row))
    }

    pub async fn find_many(&self, table: &str, args: FindManyArgs) -> PonderResult<Page> {
        self.count_op(table, "findMany");
        let schema_table = self.schema.table(table)?.clone();
        let physical = self.physical(table)?;
        let (order_column, direction) = match &args.order_by {
            Some((column, direction)) => (column.clone(), *direction),
            None => ("id".to_string(), Direction::Asc),
        };
        let order_def = schema_table.column(&order_column).ok_or_else(|| {
            PonderError::SchemaViolation(format!(
                "table '{table}' has no column '{order_column}' to order by"
            ))
        })?;
        if order_def.list {
            return Err(PonderError::SchemaViolation(format!(
                "cannot order by list column '{order_column}'"
            )));
        }

        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let mut params: Vec<SqlValue> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();

        for filter in &args.filters {
            let column = schema_table.column(&filter.column).ok_or_else(|| {
                PonderError::SchemaViolation(format!(
                    "table '{table}' has no column '{}'",
                    filter.column
                ))
            })?;
            let cell = self.value_to_sql(column, &filter.value)?;
            params.push(cell);
            clauses.push(format!(
                "\"{}\" {} {}",
                filter.column,
                filter.op.sql(),
                self.db.placeholder(params.len())
            ));
        }

        // Cursors compare against the order column; `before` flips the scan.
        // When both are given, `after` wins.
        let backwards = args.before.is_some() && args.after.is_none();
        if let Some(cursor) = args.after.as_deref().or(args.before.as_deref()) {
            let value = decode_cursor(cursor)?;
            let cell = self.value_to_sql(order_def, &value)?;
            params.push(cell);
            let cmp = match (direction, backwards) {
                (Direction::Asc, false) | (Direction::Desc, true) => ">",
                _ => "<",
            };
            clauses.push(format!(
                "\"{order_column}\" {cmp} {}",
                self.db.placeholder(params.len())
            ));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let effective_direction = match (direction, backwards) {
            (Direction::Asc, false) | (Direction::Desc, true) => "ASC",
            _ => "DESC",
        };
        params.push(SqlValue::Integer(limit as i64 + 1));
        let sql = format!(
            "SELECT {} FROM {physical} {where_sql} ORDER BY \"{order_column}\" {effective_direction} LIMIT {}",
            self.select_columns(&schema_table),
            self.db.placeholder(params.len()),
        );
        let rows = self
            .db
            .fetch_all(&sql, &params, &self.column_types(&schema_table))
            .await?;

        let mut items: Vec<Row> = rows
            .iter()
            .take(limit as usize)
            .map(|cells| self.decode_row(&schema_table, cells).map(|(row, _)| row))
            .collect::<PonderResult<_>>()?;
        let has_next_page = rows.len() as u64 > limit;
        if backwards {
            items.reverse();
        }
        let end_cursor = items
            .last()
            .and_then(|row| row.get(&order_column))
            .map(|value| encode_cursor(value));
        Ok(Page {
            items,
            page_info: PageInfo {
                has_next_page,
                end_cursor,
            },
        })
    }

    // ------------------------------------------------------------------
    // Reorg support
    // ------------------------------------------------------------------

    /// Undo every write strictly above `to`, newest first.
    pub async fn revert(&self, to: &Checkpoint) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        let select = format!(
            "SELECT seq, table_name, row_id, op, prev, prev_checkpoint FROM {}
             WHERE checkpoint > {} ORDER BY seq DESC",
            self.revert_table,
            self.db.placeholder(1)
        );
        let entries = tx
            .fetch_all(
                &select,
                &[SqlValue::Text(to.encode())],
                &[
                    SqlType::Integer,
                    SqlType::Text,
                    SqlType::Text,
                    SqlType::Text,
                    SqlType::Text,
                    SqlType::Text,
                ],
            )
            .await?;
        for entry in &entries {
            let table = entry[1].as_text().unwrap_or_default().to_string();
            let row_id = entry[2].as_text().unwrap_or_default().to_string();
            let op = entry[3].as_text().unwrap_or_default().to_string();
            let prev = entry[4].as_text().map(str::to_string);
            let prev_checkpoint = entry[5].as_text().map(str::to_string);
            self.undo_tx(&mut tx, &table, &row_id, &op, prev, prev_checkpoint)
                .await?;
            self.metrics
                .store_reverted_writes
                .with_label_values(&[&table])
                .inc();
        }
        let delete = format!(
            "DELETE FROM {} WHERE checkpoint > {}",
            self.revert_table,
            self.db.placeholder(1)
        );
        tx.execute(&delete, &[SqlValue::Text(to.encode())]).await?;
        tx.commit().await?;
        debug!("Reverted {} writes above {to}", entries.len());
        Ok(())
    }

    /// Drop revert entries at or below `up_to`. Called after promotion:
    /// nothing at or below the finalized checkpoint can be rolled back.
    pub async fn prune_revert_log(&self, up_to: &Checkpoint) -> PonderResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE checkpoint <= {}",
            self.revert_table,
            self.db.placeholder(1)
        );
        self.db.execute(&sql, &[SqlValue::Text(up_to.encode())]).await?;
        Ok(())
    }

    /// Compute the cache-promotion delta for one table: the state every row
    /// had at `finalized`. Rows whose only writes are above `finalized` are
    /// reconstructed through the revert log.
    pub async fn finalized_snapshot_delta(
        &self,
        table: &str,
        finalized: &Checkpoint,
    ) -> PonderResult<SnapshotDelta> {
        let schema_table = self.schema.table(table)?.clone();
        let physical = self.physical(table)?;
        let mut delta = SnapshotDelta::default();

        // Rows last written at or below the finalized checkpoint are
        // promoted as-is.
        let sql = format!(
            "SELECT {} FROM {physical} WHERE \"{CHECKPOINT_COLUMN}\" <= {}",
            self.select_columns(&schema_table),
            self.db.placeholder(1)
        );
        let rows = self
            .db
            .fetch_all(
                &sql,
                &[SqlValue::Text(finalized.encode())],
                &self.column_types(&schema_table),
            )
            .await?;
        let mut settled: Vec<String> = Vec::new();
        for cells in &rows {
            let (row, checkpoint) = self.decode_row(&schema_table, cells)?;
            let key = row
                .get("id")
                .ok_or_else(|| PonderError::Database("row without id".to_string()))?
                .as_key()?;
            settled.push(key.clone());
            delta.upserts.push((key, row, checkpoint));
        }

        // Rows with unfinalized writes: walk their revert entries newest
        // first to recover the state at the finalized checkpoint.
        let select = format!(
            "SELECT row_id, op, prev, prev_checkpoint FROM {}
             WHERE table_name = {} AND checkpoint > {} ORDER BY seq DESC",
            self.revert_table,
            self.db.placeholder(1),
            self.db.placeholder(2)
        );
        let entries = self
            .db
            .fetch_all(
                &select,
                &[
                    SqlValue::Text(table.to_string()),
                    SqlValue::Text(finalized.encode()),
                ],
                &[SqlType::Text, SqlType::Text, SqlType::Text, SqlType::Text],
            )
            .await?;
        let mut reconstructed: BTreeMap<String, Option<(Row, Checkpoint)>> = BTreeMap::new();
        for entry in &entries {
            let row_id = entry[0].as_text().unwrap_or_default().to_string();
            let op = entry[1].as_text().unwrap_or_default();
            let state = match op {
                "create" => None,
                _ => {
                    let prev = entry[2].as_text().ok_or_else(|| {
                        PonderError::Database("revert entry without prev row".to_string())
                    })?;
                    let row = row_from_json(&serde_json::from_str(prev).map_err(|e| {
                        PonderError::Database(format!("malformed revert row: {e}"))
                    })?)?;
                    let checkpoint = entry[3]
                        .as_text()
                        .map(Checkpoint::decode)
                        .transpose()?
                        .unwrap_or(Checkpoint::ZERO);
                    Some((row, checkpoint))
                }
            };
            // Newest-first walk: the last assignment per row wins, which is
            // the oldest entry above the finalized checkpoint.
            reconstructed.insert(row_id, state);
        }
        for (row_id, state) in reconstructed {
            match state {
                Some((row, checkpoint)) => delta.upserts.push((row_id, row, checkpoint)),
                None => delta.deletes.push(row_id),
            }
        }

        // Deletions that already finalized must also leave the cache.
        let select = format!(
            "SELECT row_id FROM {}
             WHERE table_name = {} AND checkpoint <= {} AND op = 'delete' ORDER BY seq",
            self.revert_table,
            self.db.placeholder(1),
            self.db.placeholder(2)
        );
        let deleted = self
            .db
            .fetch_all(
                &select,
                &[
                    SqlValue::Text(table.to_string()),
                    SqlValue::Text(finalized.encode()),
                ],
                &[SqlType::Text],
            )
            .await?;
        for entry in deleted {
            let row_id = entry[0].as_text().unwrap_or_default().to_string();
            if !settled.contains(&row_id) && !delta.deletes.contains(&row_id) {
                delta.deletes.push(row_id);
            }
        }
        Ok(delta)
    }

    /// Apply a finalized-snapshot delta to another physical table with the
    /// same columns (the cache table for this build). Idempotent: upserts
    /// are delete-then-insert by id.
    pub(crate) async fn apply_snapshot_to(
        &self,
        target: &str,
        table: &str,
        delta: &SnapshotDelta,
    ) -> PonderResult<()> {
        let schema_table = self.schema.table(table)?.clone();
        let mut tx = self.db.begin().await?;
        for (key, row, checkpoint) in &delta.upserts {
            let delete = format!(
                "DELETE FROM {target} WHERE \"id\" = {}",
                self.db.placeholder(1)
            );
            tx.execute(&delete, &[self.key_to_sql(&schema_table, key)?])
                .await?;
            let mut columns: Vec<String> = Vec::new();
            let mut params: Vec<SqlValue> = Vec::new();
            for column in &schema_table.columns {
                let value = row.get(&column.name).unwrap_or(&Value::Null);
                columns.push(format!("\"{}\"", column.name));
                params.push(self.value_to_sql(column, value)?);
            }
            columns.push(format!("\"{CHECKPOINT_COLUMN}\""));
            params.push(SqlValue::Text(checkpoint.encode()));
            let insert = format!(
                "INSERT INTO {target} ({}) VALUES ({})",
                columns.join(", "),
                self.db.placeholders(1, params.len())
            );
            tx.execute(&insert, &params).await?;
        }
        for key in &delta.deletes {
            let delete = format!(
                "DELETE FROM {target} WHERE \"id\" = {}",
                self.db.placeholder(1)
            );
            tx.execute(&delete, &[self.key_to_sql(&schema_table, key)?])
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn undo_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        table: &str,
        row_id: &str,
        op: &str,
        prev: Option<String>,
        prev_checkpoint: Option<String>,
    ) -> PonderResult<()> {
        let schema_table = self.schema.table(table)?.clone();
        let physical = self.physical(table)?;
        match op {
            "create" => {
                let sql = format!(
                    "DELETE FROM {physical} WHERE \"id\" = {}",
                    self.db.placeholder(1)
                );
                tx.execute(&sql, &[self.key_to_sql(&schema_table, row_id)?])
                    .await?;
            }
            "update" | "delete" => {
                let prev = prev.ok_or_else(|| {
                    PonderError::Database("revert entry without prev row".to_string())
                })?;
                let row = row_from_json(&serde_json::from_str(&prev).map_err(|e| {
                    PonderError::Database(format!("malformed revert row: {e}"))
                })?)?;
                let checkpoint = prev_checkpoint
                    .as_deref()
                    .map(Checkpoint::decode)
                    .transpose()?
                    .unwrap_or(Checkpoint::ZERO);
                // Delete-then-insert covers both undo paths.
                let sql = format!(
                    "DELETE FROM {physical} WHERE \"id\" = {}",
                    self.db.placeholder(1)
                );
                tx.execute(&sql, &[self.key_to_sql(&schema_table, row_id)?])
                    .await?;
                self.raw_insert_tx(tx, table, &row, &checkpoint).await?;
            }
            other => {
                return Err(PonderError::Database(format!(
                    "unknown revert op: {other:?}"
                )))
            }
        }
        Ok(())
    }

    async fn find_unique_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        table: &str,
        id: &Value,
    ) -> PonderResult<Option<(Row, Checkpoint)>> {
        let schema_table = self.schema.table(table)?.clone();
        let physical = self.physical(table)?;
        let sql = format!(
            "SELECT {} FROM {physical} WHERE \"id\" = {}",
            self.select_columns(&schema_table),
            self.db.placeholder(1)
        );
        let row = tx
            .fetch_optional(
                &sql,
                &[self.id_to_sql(table, id)?],
                &self.column_types(&schema_table),
            )
            .await?;
        row.map(|cells| self.decode_row(&schema_table, &cells)).transpose()
    }

    /// Insert with uniqueness check and a `create` revert entry.
    async fn insert_row_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        table: &str,
        row: &Row,
        checkpoint: &Checkpoint,
    ) -> PonderResult<()> {
        let id = row
            .get("id")
            .ok_or_else(|| PonderError::SchemaViolation("row is missing 'id'".to_string()))?;
        let key = id.as_key()?;
        if self.find_unique_tx(tx, table, id).await?.is_some() {
            return Err(PonderError::UniqueViolation {
                table: table.to_string(),
                id: key,
            });
        }
        self.raw_insert_tx(tx, table, row, checkpoint).await?;
        self.append_revert_tx(tx, table, &key, checkpoint, "create", None)
            .await?;
        Ok(())
    }

    async fn raw_insert_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        table: &str,
        row: &Row,
        checkpoint: &Checkpoint,
    ) -> PonderResult<()> {
        let schema_table = self.schema.table(table)?.clone();
        let physical = self.physical(table)?;
        let mut columns: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for column in &schema_table.columns {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            columns.push(format!("\"{}\"", column.name));
            params.push(self.value_to_sql(column, value)?);
        }
        columns.push(format!("\"{CHECKPOINT_COLUMN}\""));
        params.push(SqlValue::Text(checkpoint.encode()));
        let sql = format!(
            "INSERT INTO {physical} ({}) VALUES ({})",
            columns.join(", "),
            self.db.placeholders(1, params.len())
        );
        tx.execute(&sql, &params).await?;
        Ok(())
    }

    async fn update_row_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        table: &str,
        id: &Value,
        row: &Row,
        checkpoint: &Checkpoint,
    ) -> PonderResult<()> {
        let schema_table = self.schema.table(table)?.clone();
        let physical = self.physical(table)?;
        let mut assignments: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for column in &schema_table.columns {
            if column.name == "id" {
                continue;
            }
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            params.push(self.value_to_sql(column, value)?);
            assignments.push(format!("\"{}\" = {}", column.name, self.db.placeholder(params.len())));
        }
        params.push(SqlValue::Text(checkpoint.encode()));
        assignments.push(format!(
            "\"{CHECKPOINT_COLUMN}\" = {}",
            self.db.placeholder(params.len())
        ));
        params.push(self.id_to_sql(table, id)?);
        let sql = format!(
            "UPDATE {physical} SET {} WHERE \"id\" = {}",
            assignments.join(", "),
            self.db.placeholder(params.len())
        );
        tx.execute(&sql, &params).await?;
        Ok(())
    }

    async fn append_revert_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        table: &str,
        row_id: &str,
        checkpoint: &Checkpoint,
        op: &str,
        prev: Option<(&Row, &Checkpoint)>,
    ) -> PonderResult<()> {
        let sql = format!(
            "INSERT INTO {} (table_name, row_id, checkpoint, op, prev, prev_checkpoint)
             VALUES ({})",
            self.revert_table,
            self.db.placeholders(1, 6)
        );
        let (prev_json, prev_checkpoint) = match prev {
            Some((row, cp)) => (
                SqlValue::Text(row_to_json(row).to_string()),
                SqlValue::Text(cp.encode()),
            ),
            None => (SqlValue::Null, SqlValue::Null),
        };
        tx.execute(
            &sql,
            &[
                SqlValue::Text(table.to_string()),
                SqlValue::Text(row_id.to_string()),
                SqlValue::Text(checkpoint.encode()),
                SqlValue::Text(op.to_string()),
                prev_json,
                prev_checkpoint,
            ],
        )
        .await?;
        Ok(())
    }

    /// Validate and fill a full row for insertion: every non-optional column
    /// must be present, optional columns default to null.
    fn complete_row(&self, table: &str, data: Row) -> PonderResult<Row> {
        let schema_table = self.schema.table(table)?;
        let mut row = Row::new();
        for column in &schema_table.columns {
            let value = data.get(&column.name).cloned().unwrap_or(Value::Null);
            self.validate_value(table, column, &value)?;
            row.insert(column.name.clone(), value);
        }
        for name in data.keys() {
            if schema_table.column(name).is_none() {
                return Err(PonderError::SchemaViolation(format!(
                    "table '{table}' has no column '{name}'"
                )));
            }
        }
        Ok(row)
    }

    /// Validate a partial update merged over the current row.
    fn merged_row(&self, table: &str, current: &Row, data: Row) -> PonderResult<Row> {
        let schema_table = self.schema.table(table)?;
        let mut row = current.clone();
        for (name, value) in data {
            let column = schema_table.column(&name).ok_or_else(|| {
                PonderError::SchemaViolation(format!("table '{table}' has no column '{name}'"))
            })?;
            if name == "id" && Some(&value) != current.get("id") {
                return Err(PonderError::SchemaViolation(format!(
                    "table '{table}': 'id' cannot be updated"
                )));
            }
            self.validate_value(table, column, &value)?;
            row.insert(name, value);
        }
        Ok(row)
    }

    fn validate_value(&self, table: &str, column: &Column, value: &Value) -> PonderResult<()> {
        let violation = |message: String| Err(PonderError::SchemaViolation(message));
        if matches!(value, Value::Null) {
            if column.optional {
                return Ok(());
            }
            return violation(format!(
                "table '{table}': column '{}' is not optional",
                column.name
            ));
        }
        if column.list {
            let Value::List(items) = value else {
                return violation(format!(
                    "table '{table}': column '{}' expects a list",
                    column.name
                ));
            };
            let scalar = self.schema.storage_scalar(column)?;
            for item in items {
                self.validate_scalar(table, &column.name, scalar, item)?;
                if let (ColumnType::Enum { name }, Value::String(s)) = (&column.column_type, item) {
                    self.validate_enum_member(table, &column.name, name, s)?;
                }
            }
            return Ok(());
        }
        let scalar = self.schema.storage_scalar(column)?;
        self.validate_scalar(table, &column.name, scalar, value)?;
        if let (ColumnType::Enum { name }, Value::String(s)) = (&column.column_type, value) {
            self.validate_enum_member(table, &column.name, name, s)?;
        }
        Ok(())
    }

    fn validate_scalar(
        &self,
        table: &str,
        column: &str,
        scalar: Scalar,
        value: &Value,
    ) -> PonderResult<()> {
        let ok = matches!(
            (scalar, value),
            (Scalar::String, Value::String(_))
                | (Scalar::BigInt, Value::BigInt(_))
                | (Scalar::Int, Value::Int(_))
                | (Scalar::Float, Value::Float(_))
                | (Scalar::Boolean, Value::Boolean(_))
                | (Scalar::Bytes, Value::Bytes(_))
        );
        if ok {
            Ok(())
        } else {
            Err(PonderError::SchemaViolation(format!(
                "table '{table}': column '{column}' expects {scalar:?}, got {value:?}"
            )))
        }
    }

    fn validate_enum_member(
        &self,
        table: &str,
        column: &str,
        enum_name: &str,
        value: &str,
    ) -> PonderResult<()> {
        let def = self.schema.enums.get(enum_name).ok_or_else(|| {
            PonderError::SchemaViolation(format!("unknown enum '{enum_name}'"))
        })?;
        if def.values.iter().any(|v| v == value) {
            Ok(())
        } else {
            Err(PonderError::SchemaViolation(format!(
                "table '{table}': column '{column}': '{value}' is not a member of enum '{enum_name}'"
            )))
        }
    }

    /// Reference integrity is advisory: a write pointing at a missing row is
    /// logged, never rejected.
    async fn log_dangling_references(&self, table: &str, row: &Row) {
        let Ok(schema_table) = self.schema.table(table) else {
            return;
        };
        for column in schema_table.columns.clone() {
            let ColumnType::Reference { table: target } = &column.column_type else {
                continue;
            };
            let Some(value) = row.get(&column.name) else {
                continue;
            };
            if matches!(value, Value::Null) {
                continue;
            }
            match self.find_unique(target, value).await {
                Ok(Some(_)) => {}
                Ok(None) => debug!(
                    "{table}.{} references missing row {target}.{:?}",
                    column.name, value
                ),
                Err(_) => {}
            }
        }
    }

    fn select_columns(&self, table: &crate::schema::Table) -> String {
        let mut names: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect();
        names.push(format!("\"{CHECKPOINT_COLUMN}\""));
        names.join(", ")
    }

    fn column_types(&self, table: &crate::schema::Table) -> Vec<SqlType> {
        let mut types: Vec<SqlType> = table
            .columns
            .iter()
            .map(|c| self.sql_type_for(c))
            .collect();
        types.push(SqlType::Text);
        types
    }

    fn sql_type_for(&self, column: &Column) -> SqlType {
        if column.list {
            return SqlType::Text;
        }
        let scalar = self
            .schema
            .storage_scalar(column)
            .unwrap_or(Scalar::String);
        scalar_sql_type(self.db.kind(), scalar)
    }

    fn value_to_sql(&self, column: &Column, value: &Value) -> PonderResult<SqlValue> {
        if matches!(value, Value::Null) {
            return Ok(SqlValue::Null);
        }
        if column.list {
            let Value::List(items) = value else {
                return Err(PonderError::SchemaViolation(format!(
                    "column '{}' expects a list",
                    column.name
                )));
            };
            let json = serde_json::Value::Array(items.iter().map(Value::to_json).collect());
            return Ok(SqlValue::Text(json.to_string()));
        }
        let scalar = self.schema.storage_scalar(column)?;
        Ok(match (scalar, value) {
            (Scalar::String, Value::String(s)) => SqlValue::Text(s.clone()),
            (Scalar::BigInt, Value::BigInt(v)) => crate::bigint::i256_to_sql(self.db.kind(), *v),
            (Scalar::Int, Value::Int(v)) => SqlValue::Integer(*v),
            (Scalar::Float, Value::Float(v)) => SqlValue::Real(*v),
            (Scalar::Boolean, Value::Boolean(v)) => SqlValue::Boolean(*v),
            (Scalar::Bytes, Value::Bytes(b)) => SqlValue::Blob(b.clone()),
            _ => {
                return Err(PonderError::SchemaViolation(format!(
                    "column '{}' expects {scalar:?}, got {value:?}",
                    column.name
                )))
            }
        })
    }

    fn value_from_sql(&self, column: &Column, cell: &SqlValue) -> PonderResult<Value> {
        if cell.is_null() {
            return Ok(Value::Null);
        }
        if column.list {
            let text = cell.as_text().ok_or_else(|| {
                PonderError::Database(format!("list column '{}' is not text", column.name))
            })?;
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| PonderError::Database(format!("malformed list column: {e}")))?;
            let items = json
                .as_array()
                .ok_or_else(|| PonderError::Database("list column is not an array".to_string()))?
                .iter()
                .map(Value::from_json)
                .collect::<PonderResult<Vec<_>>>()?;
            return Ok(Value::List(items));
        }
        let scalar = self.schema.storage_scalar(column)?;
        Ok(match (scalar, cell) {
            (Scalar::String, SqlValue::Text(s)) => Value::String(s.clone()),
            (Scalar::BigInt, cell) => Value::BigInt(crate::bigint::i256_from_sql(cell)?),
            (Scalar::Int, SqlValue::Integer(v)) => Value::Int(*v),
            (Scalar::Float, SqlValue::Real(v)) => Value::Float(*v),
            (Scalar::Boolean, SqlValue::Boolean(v)) => Value::Boolean(*v),
            (Scalar::Bytes, SqlValue::Blob(b)) => Value::Bytes(b.clone()),
            (scalar, cell) => {
                return Err(PonderError::Database(format!(
                    "column '{}' expected {scalar:?}, got {cell:?}",
                    column.name
                )))
            }
        })
    }

    fn decode_row(
        &self,
        table: &crate::schema::Table,
        cells: &[SqlValue],
    ) -> PonderResult<(Row, Checkpoint)> {
        let mut row = Row::new();
        for (i, column) in table.columns.iter().enumerate() {
            let cell = cells.get(i).ok_or_else(|| {
                PonderError::Database("row shorter than expected".to_string())
            })?;
            row.insert(column.name.clone(), self.value_from_sql(column, cell)?);
        }
        let checkpoint = cells
            .get(table.columns.len())
            .and_then(|c| c.as_text())
            .map(Checkpoint::decode)
            .transpose()?
            .unwrap_or(Checkpoint::ZERO);
        Ok((row, checkpoint))
    }

    fn id_to_sql(&self, table: &str, id: &Value) -> PonderResult<SqlValue> {
        let schema_table = self.schema.table(table)?;
        let id_column = schema_table.id_column().ok_or_else(|| {
            PonderError::SchemaViolation(format!("table '{table}' is missing 'id'"))
        })?;
        self.value_to_sql(id_column, id)
    }

    /// Convert a stored key string back into the id's SQL form.
    fn key_to_sql(&self, table: &crate::schema::Table, key: &str) -> PonderResult<SqlValue> {
        let id_column = table.id_column().ok_or_else(|| {
            PonderError::SchemaViolation(format!("table '{}' is missing 'id'", table.name))
        })?;
        let scalar = self.schema.storage_scalar(id_column)?;
        let value = match scalar {
            Scalar::String => Value::String(key.to_string()),
            Scalar::BigInt => Value::BigInt(crate::bigint::decode_i256(key)?),
            Scalar::Int => Value::Int(key.parse::<i64>().map_err(|_| {
                PonderError::Database(format!("malformed int key: {key:?}"))
            })?),
            Scalar::Bytes => Value::Bytes(
                hex::decode(key.trim_start_matches("0x"))
                    .map_err(|_| PonderError::Database(format!("malformed bytes key: {key:?}")))?,
            ),
            _ => {
                return Err(PonderError::SchemaViolation(
                    "id must be string, bigint, int or bytes".to_string(),
                ))
            }
        };
        self.value_to_sql(id_column, &value)
    }

    fn count_op(&self, table: &str, op: &str) {
        self.metrics
            .store_operations
            .with_label_values(&[table, op])
            .inc();
    }
}

fn encode_cursor(value: &Value) -> String {
    value.to_json().to_string()
}

fn decode_cursor(cursor: &str) -> PonderResult<Value> {
    let json: serde_json::Value = serde_json::from_str(cursor)
        .map_err(|_| PonderError::Database(format!("malformed cursor: {cursor:?}")))?;
    Value::from_json(&json)
}

/// DDL for a live or cache table of the given schema table.
pub(crate) fn create_table_ddl(
    kind: DbKind,
    schema: &Schema,
    table: &crate::schema::Table,
    physical: &str,
) -> String {
    let mut columns: Vec<String> = Vec::new();
    for column in &table.columns {
        let sql_type = if column.list {
            "TEXT"
        } else {
            let scalar = schema.storage_scalar(column).unwrap_or(Scalar::String);
            scalar_ddl(kind, scalar)
        };
        let nullable = if column.optional { "" } else { " NOT NULL" };
        let primary = if column.name == "id" { " PRIMARY KEY" } else { "" };
        columns.push(format!("\"{}\" {sql_type}{nullable}{primary}", column.name));
    }
    columns.push(format!("\"{CHECKPOINT_COLUMN}\" TEXT NOT NULL"));
    format!(
        "CREATE TABLE IF NOT EXISTS {physical} ({})",
        columns.join(", ")
    )
}

/// DDL for the shadow revert log.
pub(crate) fn revert_log_ddl(kind: DbKind, physical: &str) -> String {
    let seq = match kind {
        DbKind::Sqlite => "seq INTEGER PRIMARY KEY AUTOINCREMENT",
        DbKind::Postgres => "seq BIGSERIAL PRIMARY KEY",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {physical} (
            {seq},
            table_name TEXT NOT NULL,
            row_id TEXT NOT NULL,
            checkpoint TEXT NOT NULL,
            op TEXT NOT NULL,
            prev TEXT,
            prev_checkpoint TEXT
        )"
    )
}

pub(crate) fn scalar_ddl(kind: DbKind, scalar: Scalar) -> &'static str {
    match (kind, scalar) {
        (_, Scalar::String) => "TEXT",
        (DbKind::Sqlite, Scalar::BigInt) => "CHAR(79)",
        (DbKind::Postgres, Scalar::BigInt) => "NUMERIC(78)",
        (DbKind::Sqlite, Scalar::Int) => "INTEGER",
        (DbKind::Postgres, Scalar::Int) => "BIGINT",
        (DbKind::Sqlite, Scalar::Float) => "REAL",
        (DbKind::Postgres, Scalar::Float) => "DOUBLE PRECISION",
        (DbKind::Sqlite, Scalar::Boolean) => "INTEGER",
        (DbKind::Postgres, Scalar::Boolean) => "BOOLEAN",
        (DbKind::Sqlite, Scalar::Bytes) => "BLOB",
        (DbKind::Postgres, Scalar::Bytes) => "BYTEA",
    }
}

pub(crate) fn scalar_sql_type(kind: DbKind, scalar: Scalar) -> SqlType {
    match scalar {
        Scalar::String => SqlType::Text,
        Scalar::BigInt => match kind {
            DbKind::Sqlite => SqlType::Text,
            DbKind::Postgres => SqlType::Numeric,
        },
        Scalar::Int => SqlType::Integer,
        Scalar::Float => SqlType::Real,
        Scalar::Boolean => SqlType::Boolean,
        Scalar::Bytes => SqlType::Blob,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;
    use ethers::types::I256;

    fn schema() -> Schema {
        SchemaBuilder::default()
            .enumeration("Mood", &["happy", "grumpy"])
            .table("Pet", |t| {
                t.id(Scalar::String)
                    .column("name", Scalar::String)
                    .optional_column("age", Scalar::Int)
                    .enum_column("mood", "Mood")
                    .list_column("nicknames", Scalar::String)
            })
            .table("Person", |t| {
                t.id(Scalar::String)
                    .column("balance", Scalar::BigInt)
                    .optional_reference_column("petId", "Pet")
            })
            .build()
            .unwrap()
    }

    async fn test_store() -> IndexingStore {
        let db = ponder_db::Db::sqlite_in_memory(None).await.unwrap();
        let schema = schema();
        let mut tables = BTreeMap::new();
        for (name, table) in &schema.tables {
            let physical = format!("\"live_{name}\"");
            db.execute(
                &create_table_ddl(db.kind(), &schema, table, &physical),
                &[],
            )
            .await
            .unwrap();
            tables.insert(name.clone(), physical);
        }
        db.execute(&revert_log_ddl(db.kind(), "\"revert_log\""), &[])
            .await
            .unwrap();
        IndexingStore::new(
            db,
            schema,
            tables,
            "\"revert_log\"".to_string(),
            &Common::for_testing(),
        )
    }

    fn cp(n: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp: n,
            chain_id: 1,
            block_number: n,
            transaction_index: 0,
            event_index: 0,
        }
    }

    fn pet(name: &str, mood: &str) -> Row {
        Row::from([
            ("name".to_string(), Value::String(name.to_string())),
            ("mood".to_string(), Value::String(mood.to_string())),
            (
                "nicknames".to_string(),
                Value::List(vec![Value::String(format!("lil {name}"))]),
            ),
        ])
    }

    #[tokio::test]
    async fn test_create_and_find_unique() {
        let store = test_store().await;
        let id = Value::String("pet1".to_string());
        let created = store
            .create("Pet", &cp(1), id.clone(), pet("Rex", "happy"))
            .await
            .unwrap();
        assert_eq!(created.get("age"), Some(&Value::Null));

        let found = store.find_unique("Pet", &id).await.unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&Value::String("Rex".to_string())));
        assert_eq!(
            found.get("nicknames"),
            Some(&Value::List(vec![Value::String("lil Rex".to_string())]))
        );
        assert!(store
            .find_unique("Pet", &Value::String("missing".to_string()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let store = test_store().await;
        let id = Value::String("pet1".to_string());
        store
            .create("Pet", &cp(1), id.clone(), pet("Rex", "happy"))
            .await
            .unwrap();
        let err = store
            .create("Pet", &cp(2), id, pet("Rex2", "grumpy"))
            .await
            .unwrap_err();
        assert!(matches!(err, PonderError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_schema_validation_on_write() {
        let store = test_store().await;
        // Wrong type for name.
        let mut bad = pet("Rex", "happy");
        bad.insert("name".to_string(), Value::Int(7));
        let err = store
            .create("Pet", &cp(1), Value::String("p".to_string()), bad)
            .await
            .unwrap_err();
        assert!(matches!(err, PonderError::SchemaViolation(_)));

        // Invalid enum member.
        let err = store
            .create(
                "Pet",
                &cp(1),
                Value::String("p".to_string()),
                pet("Rex", "angry"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a member of enum"));

        // Missing non-optional column.
        let err = store
            .create(
                "Pet",
                &cp(1),
                Value::String("p".to_string()),
                Row::from([("name".to_string(), Value::String("Rex".to_string()))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PonderError::SchemaViolation(_)));

        // Unknown column.
        let mut extra = pet("Rex", "happy");
        extra.insert("color".to_string(), Value::String("red".to_string()));
        let err = store
            .create("Pet", &cp(1), Value::String("p".to_string()), extra)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no column 'color'"));
    }

    #[tokio::test]
    async fn test_update_with_function() {
        let store = test_store().await;
        let id = Value::String("pet1".to_string());
        store
            .create("Pet", &cp(1), id.clone(), pet("Rex", "happy"))
            .await
            .unwrap();
        let updated = store
            .update(
                "Pet",
                &cp(2),
                id.clone(),
                Update::With(Box::new(|row| {
                    let name = match row.get("name") {
                        Some(Value::String(s)) => s.clone(),
                        _ => String::new(),
                    };
                    Row::from([(
                        "name".to_string(),
                        Value::String(format!("{name} Jr")),
                    )])
                })),
            )
            .await
            .unwrap();
        assert_eq!(
            updated.get("name"),
            Some(&Value::String("Rex Jr".to_string()))
        );
        // Untouched columns survive.
        assert_eq!(
            updated.get("mood"),
            Some(&Value::String("happy".to_string()))
        );
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let store = test_store().await;
        let err = store
            .update(
                "Pet",
                &cp(1),
                Value::String("nope".to_string()),
                Update::Set(Row::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PonderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_upsert() {
        let store = test_store().await;
        let id = Value::String("pet1".to_string());
        // Insert path.
        let row = store
            .upsert(
                "Pet",
                &cp(1),
                id.clone(),
                pet("Rex", "happy"),
                Update::Set(Row::new()),
            )
            .await
            .unwrap();
        assert_eq!(row.get("name"), Some(&Value::String("Rex".to_string())));
        // Update path.
        let row = store
            .upsert(
                "Pet",
                &cp(2),
                id,
                pet("Ignored", "happy"),
                Update::Set(Row::from([(
                    "mood".to_string(),
                    Value::String("grumpy".to_string()),
                )])),
            )
            .await
            .unwrap();
        assert_eq!(row.get("name"), Some(&Value::String("Rex".to_string())));
        assert_eq!(row.get("mood"), Some(&Value::String("grumpy".to_string())));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = test_store().await;
        let id = Value::String("pet1".to_string());
        store
            .create("Pet", &cp(1), id.clone(), pet("Rex", "happy"))
            .await
            .unwrap();
        assert!(store.delete("Pet", &cp(2), id.clone()).await.unwrap());
        assert!(!store.delete("Pet", &cp(3), id.clone()).await.unwrap());
        assert!(store.find_unique("Pet", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bigint_roundtrip_through_store() {
        let store = test_store().await;
        let id = Value::String("p1".to_string());
        let balance = Value::BigInt(I256::from(-12345));
        store
            .create(
                "Person",
                &cp(1),
                id.clone(),
                Row::from([("balance".to_string(), balance.clone())]),
            )
            .await
            .unwrap();
        let found = store.find_unique("Person", &id).await.unwrap().unwrap();
        assert_eq!(found.get("balance"), Some(&balance));
    }

    #[tokio::test]
    async fn test_find_many_pagination_and_filters() {
        let store = test_store().await;
        for i in 0..7 {
            store
                .create(
                    "Pet",
                    &cp(i),
                    Value::String(format!("pet{i}")),
                    pet(&format!("Pet{i}"), "happy"),
                )
                .await
                .unwrap();
        }

        let first = store
            .find_many(
                "Pet",
                FindManyArgs {
                    limit: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(first.page_info.has_next_page);

        let second = store
            .find_many(
                "Pet",
                FindManyArgs {
                    limit: Some(10),
                    after: first.page_info.end_cursor.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.items.len(), 4);
        assert!(!second.page_info.has_next_page);
        let ids: Vec<&Value> = second.items.iter().map(|r| r.get("id").unwrap()).collect();
        assert_eq!(ids[0], &Value::String("pet3".to_string()));

        // Filtered scan.
        let filtered = store
            .find_many(
                "Pet",
                FindManyArgs {
                    filters: vec![WhereFilter {
                        column: "name".to_string(),
                        op: WhereOp::Eq,
                        value: Value::String("Pet5".to_string()),
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.items.len(), 1);

        // Descending order.
        let descending = store
            .find_many(
                "Pet",
                FindManyArgs {
                    order_by: Some(("id".to_string(), Direction::Desc)),
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            descending.items[0].get("id"),
            Some(&Value::String("pet6".to_string()))
        );
    }

    #[tokio::test]
    async fn test_revert_undoes_writes_above_checkpoint() {
        let store = test_store().await;
        let id = Value::String("pet1".to_string());
        store
            .create("Pet", &cp(10), id.clone(), pet("Rex", "happy"))
            .await
            .unwrap();
        store
            .update(
                "Pet",
                &cp(20),
                id.clone(),
                Update::Set(Row::from([(
                    "mood".to_string(),
                    Value::String("grumpy".to_string()),
                )])),
            )
            .await
            .unwrap();
        store
            .create(
                "Pet",
                &cp(25),
                Value::String("pet2".to_string()),
                pet("Max", "happy"),
            )
            .await
            .unwrap();
        store.delete("Pet", &cp(30), id.clone()).await.unwrap();

        // Roll back to checkpoint 20: the delete is undone, pet2 vanishes,
        // the mood update (at 20, not above) survives.
        store.revert(&cp(20)).await.unwrap();
        let rex = store.find_unique("Pet", &id).await.unwrap().unwrap();
        assert_eq!(rex.get("mood"), Some(&Value::String("grumpy".to_string())));
        assert!(store
            .find_unique("Pet", &Value::String("pet2".to_string()))
            .await
            .unwrap()
            .is_none());

        // Roll back to checkpoint 10: the update is undone too.
        store.revert(&cp(10)).await.unwrap();
        let rex = store.find_unique("Pet", &id).await.unwrap().unwrap();
        assert_eq!(rex.get("mood"), Some(&Value::String("happy".to_string())));

        // Roll back to zero: nothing remains.
        store.revert(&Checkpoint::ZERO).await.unwrap();
        assert!(store.find_unique("Pet", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalized_snapshot_delta() {
        let store = test_store().await;
        let fin = cp(100);
        // Row settled below the finalized checkpoint.
        store
            .create(
                "Pet",
                &cp(50),
                Value::String("old".to_string()),
                pet("Old", "happy"),
            )
            .await
            .unwrap();
        // Row created below, updated above: promoted at its state as of 100.
        store
            .create(
                "Pet",
                &cp(60),
                Value::String("mixed".to_string()),
                pet("Mixed", "happy"),
            )
            .await
            .unwrap();
        store
            .update(
                "Pet",
                &cp(150),
                Value::String("mixed".to_string()),
                Update::Set(Row::from([(
                    "mood".to_string(),
                    Value::String("grumpy".to_string()),
                )])),
            )
            .await
            .unwrap();
        // Row created entirely above: absent from the snapshot.
        store
            .create(
                "Pet",
                &cp(150),
                Value::String("new".to_string()),
                pet("New", "happy"),
            )
            .await
            .unwrap();
        // Row deleted below the finalized checkpoint.
        store
            .create(
                "Pet",
                &cp(10),
                Value::String("gone".to_string()),
                pet("Gone", "happy"),
            )
            .await
            .unwrap();
        store
            .delete("Pet", &cp(20), Value::String("gone".to_string()))
            .await
            .unwrap();

        let delta = store.finalized_snapshot_delta("Pet", &fin).await.unwrap();
        let upsert_ids: Vec<&str> = delta.upserts.iter().map(|(id, _, _)| id.as_str()).collect();
        assert!(upsert_ids.contains(&"old"));
        assert!(upsert_ids.contains(&"mixed"));
        assert!(!upsert_ids.contains(&"new"));
        assert!(delta.deletes.contains(&"gone".to_string()));
        // The reconstructed row carries the pre-update mood.
        let mixed = delta
            .upserts
            .iter()
            .find(|(id, _, _)| id == "mixed")
            .unwrap();
        assert_eq!(
            mixed.1.get("mood"),
            Some(&Value::String("happy".to_string()))
        );
    }
}
