// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Database service: live-table provisioning per build, the namespace lock
//! and the finalized cache.
//!
//! One live writer per `(database, namespace)`: the lock row is acquired
//! with a single-row compare-and-set transaction and kept alive by a
//! heartbeat. Live tables are physical `ponder_<hash>` tables plus
//! user-friendly views named after the schema tables; anything that does not
//! match the registry is never touched. Finalized rows are demoted into the
//! cache (an `ATTACH`ed database on SQLite, a `ponder_cache` schema on
//! Postgres) keyed by `(build id, table)`, and adopted back on the next
//! setup of the same build.

use std::collections::BTreeMap;
use std::sync::Arc;

use ponder_db::{Db, DbKind, SqlType, SqlValue};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::common::{Clock, Common};
use crate::error::{PonderError, PonderResult};
use crate::indexing_store::{
    create_table_ddl, revert_log_ddl, IndexingStore, CHECKPOINT_COLUMN,
};
use crate::schema::Schema;

const LOCK_TABLE: &str = "namespace_lock";
const REGISTRY_TABLE: &str = "ponder_registry";
const CACHE_REGISTRY_TABLE: &str = "ponder_cache_registry";
const CACHE_SCHEMA: &str = "ponder_cache";

#[derive(Debug)]
pub struct SetupOutput {
    pub store: IndexingStore,
    /// Where indexing should resume: the zero checkpoint for a fresh build,
    /// the persisted finalized checkpoint otherwise.
    pub checkpoint: Checkpoint,
}

pub struct DatabaseService {
    db: Db,
    namespace: String,
    clock: Clock,
    common: Common,
}

impl DatabaseService {
    /// Open the service and run its own migrations (lock table, registry,
    /// cache schema). The SQLite cache database must already be attached as
    /// `ponder_cache` on the handle.
    pub async fn new(
        db: Db,
        namespace: String,
        clock: Clock,
        common: Common,
    ) -> PonderResult<Self> {
        let service = Self {
            db,
            namespace,
            clock,
            common,
        };
        service.migrate().await?;
        Ok(service)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn migrate(&self) -> PonderResult<()> {
        if self.db.kind() == DbKind::Postgres {
            self.db
                .execute(
                    &format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.namespace),
                    &[],
                )
                .await?;
            self.db
                .execute(&format!("CREATE SCHEMA IF NOT EXISTS {CACHE_SCHEMA}"), &[])
                .await?;
        }
        let int = match self.db.kind() {
            DbKind::Sqlite => "INTEGER",
            DbKind::Postgres => "BIGINT",
        };
        self.db
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        namespace TEXT PRIMARY KEY,
                        is_locked {int} NOT NULL,
                        heartbeat_at {int} NOT NULL,
                        build_id TEXT NOT NULL,
                        finalized_checkpoint TEXT NOT NULL,
                        schema_json TEXT NOT NULL
                    )",
                    self.qualified(LOCK_TABLE)
                ),
                &[],
            )
            .await?;
        self.db
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        physical TEXT PRIMARY KEY,
                        namespace TEXT NOT NULL,
                        build_id TEXT NOT NULL,
                        table_name TEXT NOT NULL,
                        kind TEXT NOT NULL
                    )",
                    self.qualified(REGISTRY_TABLE)
                ),
                &[],
            )
            .await?;
        self.db
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        physical TEXT PRIMARY KEY,
                        build_id TEXT NOT NULL,
                        table_name TEXT NOT NULL,
                        checkpoint TEXT NOT NULL,
                        touched_at {int} NOT NULL
                    )",
                    cache_qualified(CACHE_REGISTRY_TABLE)
                ),
                &[],
            )
            .await?;
        Ok(())
    }

    /// Acquire the namespace and provision live tables for `build_id`.
    pub async fn setup(&self, schema: &Schema, build_id: &str) -> PonderResult<SetupOutput> {
        schema.validate()?;
        let schema_json = schema.to_stable_json();
        let prior = self.acquire_lock(build_id, &schema_json).await?;

        // Same build and schema: reuse the live tables and resume from the
        // persisted finalized checkpoint.
        if let Some(prior) = &prior {
            if prior.build_id == build_id && prior.schema_json == schema_json {
                let registered = self.registered_tables(build_id).await?;
                if registered.len() == schema.tables.len() {
                    info!(
                        "[{}] Reusing live tables for build {build_id}",
                        self.namespace
                    );
                    let store = self.store_for(schema, build_id);
                    return Ok(SetupOutput {
                        store,
                        checkpoint: Checkpoint::decode(&prior.finalized_checkpoint)
                            .unwrap_or(Checkpoint::ZERO),
                    });
                }
            }
        }

        // A different build owned this namespace before: its views and
        // physical tables go away. Only registry-listed objects are dropped.
        self.drop_registered_except(build_id).await?;

        // Fresh live tables, revert log and views.
        for (name, table) in &schema.tables {
            let physical = self.qualified(&physical_name(&self.namespace, build_id, name));
            self.db
                .execute(
                    &create_table_ddl(self.db.kind(), schema, table, &physical),
                    &[],
                )
                .await?;
            self.register(
                &physical_name(&self.namespace, build_id, name),
                build_id,
                name,
                "table",
            )
            .await?;

            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("\"{}\"", c.name))
                .collect();
            let view = self.qualified(name);
            self.db
                .execute(&format!("DROP VIEW IF EXISTS {view}"), &[])
                .await?;
            self.db
                .execute(
                    &format!(
                        "CREATE VIEW {view} AS SELECT {} FROM {physical}",
                        columns.join(", ")
                    ),
                    &[],
                )
                .await?;
            self.register(name, build_id, name, "view").await?;
        }
        let revert_physical = self.qualified(&revert_log_name(&self.namespace, build_id));
        self.db
            .execute(&revert_log_ddl(self.db.kind(), &revert_physical), &[])
            .await?;
        self.register(
            &revert_log_name(&self.namespace, build_id),
            build_id,
            "_revert_log",
            "table",
        )
        .await?;

        let store = self.store_for(schema, build_id);

        // Adopt finalized rows from the cache when this build ran before.
        let checkpoint = match self.adopt_cache(schema, build_id).await? {
            Some(checkpoint) => {
                info!(
                    "[{}] Adopted cached rows for build {build_id} at {checkpoint}",
                    self.namespace
                );
                checkpoint
            }
            None => Checkpoint::ZERO,
        };
        self.set_finalized_checkpoint(&checkpoint).await?;

        Ok(SetupOutput { store, checkpoint })
    }

    /// Renew the lease. Spawned every `heartbeat_interval`.
    pub async fn heartbeat(&self) -> PonderResult<()> {
        let sql = format!(
            "UPDATE {} SET heartbeat_at = {} WHERE namespace = {} AND is_locked = {}",
            self.qualified(LOCK_TABLE),
            self.db.placeholder(1),
            self.db.placeholder(2),
            self.db.placeholder(3),
        );
        self.db
            .execute(
                &sql,
                &[
                    SqlValue::Integer(self.clock.now_ms()),
                    SqlValue::Text(self.namespace.clone()),
                    int_bool(self.db.kind(), true),
                ],
            )
            .await?;
        Ok(())
    }

    pub fn spawn_heartbeat(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(service.common.options.heartbeat_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = service.heartbeat().await {
                            warn!("[{}] Heartbeat failed: {e}", service.namespace);
                        }
                    }
                }
            }
        })
    }

    /// Demote finalized rows into the cache, advance the persisted finalized
    /// checkpoint and prune the revert log. Idempotent.
    pub async fn promote(
        &self,
        store: &IndexingStore,
        build_id: &str,
        finalized: &Checkpoint,
    ) -> PonderResult<()> {
        for name in store.schema().tables.keys().cloned().collect::<Vec<_>>() {
            let cache_name = cache_table_name(build_id, &name);
            let cache_physical = cache_qualified(&cache_name);
            let table = store.schema().table(&name)?.clone();
            self.db
                .execute(
                    &create_table_ddl(self.db.kind(), store.schema(), &table, &cache_physical),
                    &[],
                )
                .await?;
            let delta = store.finalized_snapshot_delta(&name, finalized).await?;
            let promoted = delta.upserts.len();
            store.apply_snapshot_to(&cache_physical, &name, &delta).await?;
            self.common
                .metrics
                .cache_promotions
                .with_label_values(&[&name])
                .inc_by(promoted as u64);

            let sql = format!(
                "INSERT INTO {} (physical, build_id, table_name, checkpoint, touched_at)
                 VALUES ({})
                 ON CONFLICT (physical) DO UPDATE SET checkpoint = excluded.checkpoint,
                     touched_at = excluded.touched_at",
                cache_qualified(CACHE_REGISTRY_TABLE),
                self.db.placeholders(1, 5)
            );
            self.db
                .execute(
                    &sql,
                    &[
                        SqlValue::Text(cache_name),
                        SqlValue::Text(build_id.to_string()),
                        SqlValue::Text(name.clone()),
                        SqlValue::Text(finalized.encode()),
                        SqlValue::Integer(self.clock.now_ms()),
                    ],
                )
                .await?;
        }

        // Monotonic: never move the persisted checkpoint backwards.
        if let Some(stored) = self.finalized_checkpoint().await? {
            if *finalized <= stored {
                return Ok(());
            }
        }
        self.set_finalized_checkpoint(finalized).await?;
        store.prune_revert_log(finalized).await?;
        debug!("[{}] Promoted cache to {finalized}", self.namespace);
        Ok(())
    }

    /// Flush the cache and release the lock.
    pub async fn kill(
        &self,
        store: &IndexingStore,
        build_id: &str,
        finalized: &Checkpoint,
    ) -> PonderResult<()> {
        if let Err(e) = self.promote(store, build_id, finalized).await {
            warn!("[{}] Cache flush on shutdown failed: {e}", self.namespace);
        }
        self.release().await
    }

    pub async fn release(&self) -> PonderResult<()> {
        let sql = format!(
            "UPDATE {} SET is_locked = {} WHERE namespace = {}",
            self.qualified(LOCK_TABLE),
            self.db.placeholder(1),
            self.db.placeholder(2),
        );
        self.db
            .execute(
                &sql,
                &[
                    int_bool(self.db.kind(), false),
                    SqlValue::Text(self.namespace.clone()),
                ],
            )
            .await?;
        info!("[{}] Released namespace lock", self.namespace);
        Ok(())
    }

    /// Drop cache table sets beyond the `keep` most recently touched builds.
    pub async fn evict_stale_cache(&self, keep: usize) -> PonderResult<()> {
        let sql = format!(
            "SELECT DISTINCT build_id, MAX(touched_at) FROM {} GROUP BY build_id ORDER BY MAX(touched_at) DESC",
            cache_qualified(CACHE_REGISTRY_TABLE)
        );
        let rows = self
            .db
            .fetch_all(&sql, &[], &[SqlType::Text, SqlType::Integer])
            .await?;
        for row in rows.into_iter().skip(keep) {
            let Some(build_id) = row[0].as_text() else {
                continue;
            };
            let tables = self
                .db
                .fetch_all(
                    &format!(
                        "SELECT physical FROM {} WHERE build_id = {}",
                        cache_qualified(CACHE_REGISTRY_TABLE),
                        self.db.placeholder(1)
                    ),
                    &[SqlValue::Text(build_id.to_string())],
                    &[SqlType::Text],
                )
                .await?;
            for table in tables {
                if let Some(physical) = table[0].as_text() {
                    self.db
                        .execute(
                            &format!("DROP TABLE IF EXISTS {}", cache_qualified(physical)),
                            &[],
                        )
                        .await?;
                }
            }
            self.db
                .execute(
                    &format!(
                        "DELETE FROM {} WHERE build_id = {}",
                        cache_qualified(CACHE_REGISTRY_TABLE),
                        self.db.placeholder(1)
                    ),
                    &[SqlValue::Text(build_id.to_string())],
                )
                .await?;
            info!("[{}] Evicted cache for build {build_id}", self.namespace);
        }
        Ok(())
    }

    pub async fn finalized_checkpoint(&self) -> PonderResult<Option<Checkpoint>> {
        let sql = format!(
            "SELECT finalized_checkpoint FROM {} WHERE namespace = {}",
            self.qualified(LOCK_TABLE),
            self.db.placeholder(1)
        );
        let row = self
            .db
            .fetch_optional(
                &sql,
                &[SqlValue::Text(self.namespace.clone())],
                &[SqlType::Text],
            )
            .await?;
        row.and_then(|r| r.into_iter().next())
            .and_then(SqlValue::into_text)
            .map(|s| Checkpoint::decode(&s))
            .transpose()
    }

    // ------------------------------------------------------------------
    // Lock internals
    // ------------------------------------------------------------------

    async fn acquire_lock(
        &self,
        build_id: &str,
        schema_json: &str,
    ) -> PonderResult<Option<LockRow>> {
        let now = self.clock.now_ms();
        let lease_ttl = self.common.options.lease_ttl_ms as i64;
        let mut tx = self.db.begin().await?;
        let select = format!(
            "SELECT is_locked, heartbeat_at, build_id, finalized_checkpoint, schema_json
             FROM {} WHERE namespace = {}{}",
            self.qualified(LOCK_TABLE),
            self.db.placeholder(1),
            match self.db.kind() {
                DbKind::Sqlite => "",
                DbKind::Postgres => " FOR UPDATE",
            }
        );
        let row = tx
            .fetch_optional(
                &select,
                &[SqlValue::Text(self.namespace.clone())],
                &[
                    SqlType::Integer,
                    SqlType::Integer,
                    SqlType::Text,
                    SqlType::Text,
                    SqlType::Text,
                ],
            )
            .await?;

        let prior = match row {
            None => {
                let insert = format!(
                    "INSERT INTO {} (namespace, is_locked, heartbeat_at, build_id,
                        finalized_checkpoint, schema_json) VALUES ({})",
                    self.qualified(LOCK_TABLE),
                    self.db.placeholders(1, 6)
                );
                tx.execute(
                    &insert,
                    &[
                        SqlValue::Text(self.namespace.clone()),
                        int_bool(self.db.kind(), true),
                        SqlValue::Integer(now),
                        SqlValue::Text(build_id.to_string()),
                        SqlValue::Text(Checkpoint::ZERO.encode()),
                        SqlValue::Text(schema_json.to_string()),
                    ],
                )
                .await?;
                None
            }
            Some(cells) => {
                let prior = LockRow {
                    is_locked: lock_flag(&cells[0]),
                    heartbeat_at: cells[1].as_integer().unwrap_or(0),
                    build_id: cells[2].as_text().unwrap_or_default().to_string(),
                    finalized_checkpoint: cells[3].as_text().unwrap_or_default().to_string(),
                    schema_json: cells[4].as_text().unwrap_or_default().to_string(),
                };
                let expired = now - prior.heartbeat_at > lease_ttl;
                if prior.is_locked && !expired {
                    tx.rollback().await?;
                    self.common
                        .metrics
                        .namespace_lock_acquisitions
                        .with_label_values(&["contended"])
                        .inc();
                    return Err(PonderError::NamespaceLocked {
                        namespace: self.namespace.clone(),
                        ms_until_expiry: lease_ttl - (now - prior.heartbeat_at),
                    });
                }
                if prior.is_locked && expired {
                    warn!(
                        "[{}] Taking over an expired lease (heartbeat {}ms old)",
                        self.namespace,
                        now - prior.heartbeat_at
                    );
                }
                let update = format!(
                    "UPDATE {} SET is_locked = {}, heartbeat_at = {}, build_id = {},
                        schema_json = {} WHERE namespace = {}",
                    self.qualified(LOCK_TABLE),
                    self.db.placeholder(1),
                    self.db.placeholder(2),
                    self.db.placeholder(3),
                    self.db.placeholder(4),
                    self.db.placeholder(5),
                );
                tx.execute(
                    &update,
                    &[
                        int_bool(self.db.kind(), true),
                        SqlValue::Integer(now),
                        SqlValue::Text(build_id.to_string()),
                        SqlValue::Text(schema_json.to_string()),
                        SqlValue::Text(self.namespace.clone()),
                    ],
                )
                .await?;
                Some(prior)
            }
        };
        tx.commit().await?;
        self.common
            .metrics
            .namespace_lock_acquisitions
            .with_label_values(&["acquired"])
            .inc();
        info!("[{}] Acquired namespace lock", self.namespace);
        Ok(prior)
    }

    async fn set_finalized_checkpoint(&self, checkpoint: &Checkpoint) -> PonderResult<()> {
        let sql = format!(
            "UPDATE {} SET finalized_checkpoint = {} WHERE namespace = {}",
            self.qualified(LOCK_TABLE),
            self.db.placeholder(1),
            self.db.placeholder(2),
        );
        self.db
            .execute(
                &sql,
                &[
                    SqlValue::Text(checkpoint.encode()),
                    SqlValue::Text(self.namespace.clone()),
                ],
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Table provisioning
    // ------------------------------------------------------------------

    fn store_for(&self, schema: &Schema, build_id: &str) -> IndexingStore {
        let tables: BTreeMap<String, String> = schema
            .tables
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    self.qualified(&physical_name(&self.namespace, build_id, name)),
                )
            })
            .collect();
        IndexingStore::new(
            self.db.clone(),
            schema.clone(),
            tables,
            self.qualified(&revert_log_name(&self.namespace, build_id)),
            &self.common,
        )
    }

    async fn register(
        &self,
        physical: &str,
        build_id: &str,
        table_name: &str,
        kind: &str,
    ) -> PonderResult<()> {
        let sql = format!(
            "INSERT INTO {} (physical, namespace, build_id, table_name, kind)
             VALUES ({})
             ON CONFLICT (physical) DO UPDATE SET build_id = excluded.build_id,
                 table_name = excluded.table_name, kind = excluded.kind",
            self.qualified(REGISTRY_TABLE),
            self.db.placeholders(1, 5)
        );
        self.db
            .execute(
                &sql,
                &[
                    SqlValue::Text(physical.to_string()),
                    SqlValue::Text(self.namespace.clone()),
                    SqlValue::Text(build_id.to_string()),
                    SqlValue::Text(table_name.to_string()),
                    SqlValue::Text(kind.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn registered_tables(&self, build_id: &str) -> PonderResult<Vec<String>> {
        let sql = format!(
            "SELECT table_name FROM {} WHERE namespace = {} AND build_id = {} AND kind = 'table'
             AND table_name <> '_revert_log'",
            self.qualified(REGISTRY_TABLE),
            self.db.placeholder(1),
            self.db.placeholder(2),
        );
        let rows = self
            .db
            .fetch_all(
                &sql,
                &[
                    SqlValue::Text(self.namespace.clone()),
                    SqlValue::Text(build_id.to_string()),
                ],
                &[SqlType::Text],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.into_iter().next().and_then(SqlValue::into_text))
            .collect())
    }

    /// Drop every registered object in this namespace belonging to another
    /// build. Tables that are not in the registry are left alone.
    async fn drop_registered_except(&self, build_id: &str) -> PonderResult<()> {
        let sql = format!(
            "SELECT physical, kind FROM {} WHERE namespace = {} AND build_id <> {}",
            self.qualified(REGISTRY_TABLE),
            self.db.placeholder(1),
            self.db.placeholder(2),
        );
        let rows = self
            .db
            .fetch_all(
                &sql,
                &[
                    SqlValue::Text(self.namespace.clone()),
                    SqlValue::Text(build_id.to_string()),
                ],
                &[SqlType::Text, SqlType::Text],
            )
            .await?;
        // Views first, then the tables under them.
        for pass in ["view", "table"] {
            for row in &rows {
                let (Some(physical), Some(kind)) = (row[0].as_text(), row[1].as_text()) else {
                    continue;
                };
                if kind != pass {
                    continue;
                }
                let statement = match kind {
                    "view" => format!("DROP VIEW IF EXISTS {}", self.qualified(physical)),
                    _ => format!("DROP TABLE IF EXISTS {}", self.qualified(physical)),
                };
                self.db.execute(&statement, &[]).await?;
            }
        }
        let delete = format!(
            "DELETE FROM {} WHERE namespace = {} AND build_id <> {}",
            self.qualified(REGISTRY_TABLE),
            self.db.placeholder(1),
            self.db.placeholder(2),
        );
        self.db
            .execute(
                &delete,
                &[
                    SqlValue::Text(self.namespace.clone()),
                    SqlValue::Text(build_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Copy cached finalized rows into the fresh live tables. Returns the
    /// common checkpoint when every schema table has a cache entry.
    async fn adopt_cache(
        &self,
        schema: &Schema,
        build_id: &str,
    ) -> PonderResult<Option<Checkpoint>> {
        let sql = format!(
            "SELECT table_name, physical, checkpoint FROM {} WHERE build_id = {}",
            cache_qualified(CACHE_REGISTRY_TABLE),
            self.db.placeholder(1)
        );
        let rows = self
            .db
            .fetch_all(
                &sql,
                &[SqlValue::Text(build_id.to_string())],
                &[SqlType::Text, SqlType::Text, SqlType::Text],
            )
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut by_table: BTreeMap<String, (String, Checkpoint)> = BTreeMap::new();
        for row in rows {
            let table = row[0].as_text().unwrap_or_default().to_string();
            let physical = row[1].as_text().unwrap_or_default().to_string();
            let checkpoint = Checkpoint::decode(row[2].as_text().unwrap_or_default())?;
            by_table.insert(table, (physical, checkpoint));
        }
        if !schema.tables.keys().all(|name| by_table.contains_key(name)) {
            // Partial cache (interrupted promotion); start cold.
            return Ok(None);
        }

        let mut common_checkpoint = Checkpoint::MAX;
        let now = self.clock.now_ms();
        for (name, table) in &schema.tables {
            let (cache_physical, checkpoint) = &by_table[name];
            let live = self.qualified(&physical_name(&self.namespace, build_id, name));
            let mut columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("\"{}\"", c.name))
                .collect();
            columns.push(format!("\"{CHECKPOINT_COLUMN}\""));
            let column_list = columns.join(", ");
            // A crash between table creation and adoption may leave rows
            // behind; the copy tolerates them.
            let __debug_sql = format!(
                        "INSERT INTO {live} ({column_list}) SELECT {column_list} FROM {}
                         ON CONFLICT (\"id\") DO NOTHING",
                        cache_qualified(cache_physical)
                    );
            eprintln!("DEBUG SQL: {__debug_sql}");
            self.db
                .execute(
                    &__debug_sql,
                    &[],
                )
                .await?;
            common_checkpoint = common_checkpoint.min(*checkpoint);
            self.db
                .execute(
                    &format!(
                        "UPDATE {} SET touched_at = {} WHERE physical = {}",
                        cache_qualified(CACHE_REGISTRY_TABLE),
                        self.db.placeholder(1),
                        self.db.placeholder(2)
                    ),
                    &[
                        SqlValue::Integer(now),
                        SqlValue::Text(cache_physical.clone()),
                    ],
                )
                .await?;
        }
        Ok(Some(common_checkpoint))
    }

    fn qualified(&self, name: &str) -> String {
        match self.db.kind() {
            DbKind::Sqlite => format!("\"{name}\""),
            DbKind::Postgres => format!("\"{}\".\"{name}\"", self.namespace),
        }
    }
}

struct LockRow {
    is_locked: bool,
    heartbeat_at: i64,
    build_id: String,
    finalized_checkpoint: String,
    schema_json: String,
}

fn lock_flag(cell: &SqlValue) -> bool {
    match cell {
        SqlValue::Boolean(b) => *b,
        SqlValue::Integer(v) => *v != 0,
        _ => false,
    }
}

// The lock table stores flags as integers on both backends.
fn int_bool(_kind: DbKind, value: bool) -> SqlValue {
    SqlValue::Integer(value as i64)
}

/// `ponder_` + first ten hex chars of a stable content hash.
pub fn physical_name(namespace: &str, build_id: &str, table: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0]);
    hasher.update(build_id.as_bytes());
    hasher.update([0]);
    hasher.update(table.as_bytes());
    format!("ponder_{}", &hex::encode(hasher.finalize())[..10])
}

fn revert_log_name(namespace: &str, build_id: &str) -> String {
    physical_name(namespace, build_id, "__revert_log")
}

fn cache_table_name(build_id: &str, table: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"cache");
    hasher.update([0]);
    hasher.update(build_id.as_bytes());
    hasher.update([0]);
    hasher.update(table.as_bytes());
    format!("ponder_{}", &hex::encode(hasher.finalize())[..10])
}

fn cache_qualified(name: &str) -> String {
    format!("{CACHE_SCHEMA}.\"{name}\"")
}
