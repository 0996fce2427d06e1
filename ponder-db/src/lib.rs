// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Database handle shared by the sync store, the indexing store and the
//! database service.
//!
//! One [`Db`] value wraps either a SQLite pool or a Postgres pool and exposes
//! dynamic SQL execution with typed parameters. Callers own their SQL text;
//! this crate only smooths over the dialect differences that matter here:
//! placeholder syntax, 256-bit integer columns (padded text vs NUMERIC) and
//! where the cache database lives (an `ATTACH`ed file vs a schema).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Row, SqlitePool};
use tracing::info;

mod value;

pub use value::{SqlType, SqlValue};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid numeric literal: {0}")]
    InvalidNumeric(String),
    #[error("invalid database url: {0}")]
    InvalidUrl(String),
    #[error("column {index} decoded to unexpected type")]
    UnexpectedColumnType { index: usize },
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

/// Pool sizing and timeout knobs.
#[derive(Debug, Clone)]
pub struct DbArgs {
    /// Number of connections to keep in the pool. SQLite is clamped to one
    /// writer connection regardless of this value.
    pub connection_pool_size: u32,
    /// Time spent waiting for a connection from the pool, in milliseconds.
    pub connection_timeout_ms: u64,
    /// Time spent waiting for statements to complete, in milliseconds.
    /// Advisory on SQLite.
    pub statement_timeout_ms: Option<u64>,
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            connection_pool_size: 10,
            connection_timeout_ms: 60_000,
            statement_timeout_ms: None,
        }
    }
}

impl DbArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Clone, Debug)]
enum DbInner {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

/// A handle to the backing database. Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct Db {
    inner: DbInner,
}

impl Db {
    /// Open (creating if missing) a SQLite database file. `attach` names a
    /// secondary database file made visible under the given alias on every
    /// pooled connection.
    pub async fn sqlite(
        path: impl AsRef<Path>,
        attach: Option<(PathBuf, String)>,
        args: DbArgs,
    ) -> DbResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbError::InvalidUrl(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(DbError::Sqlx)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(false)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let attach_sql = attach.map(|(file, alias)| {
            format!("ATTACH DATABASE '{}' AS {alias}", file.display().to_string().replace('\'', "''"))
        });

        // SQLite permits a single writer; one connection sidesteps writer
        // contention and keeps ATTACH state stable across the pool. The
        // connection is pinned: recycling it would also discard an
        // in-memory database.
        let mut pool_opts = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(args.connection_timeout());
        if let Some(sql) = attach_sql {
            pool_opts = pool_opts.after_connect(move |conn, _meta| {
                let sql = sql.clone();
                Box::pin(async move {
                    sqlx::query(&sql).execute(conn).await?;
                    Ok(())
                })
            });
        }

        let pool = pool_opts.connect_with(opts).await?;
        info!("Opened sqlite database at {}", path.display());
        Ok(Self {
            inner: DbInner::Sqlite(pool),
        })
    }

    /// An in-memory SQLite database. Test-oriented; the cache alias, when
    /// requested, is a second in-memory database.
    pub async fn sqlite_in_memory(attach_alias: Option<&str>) -> DbResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:").map_err(DbError::Sqlx)?;
        let attach_sql = attach_alias.map(|alias| format!("ATTACH DATABASE ':memory:' AS {alias}"));
        let mut pool_opts = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        if let Some(sql) = attach_sql {
            pool_opts = pool_opts.after_connect(move |conn, _meta| {
                let sql = sql.clone();
                Box::pin(async move {
                    sqlx::query(&sql).execute(conn).await?;
                    Ok(())
                })
            });
        }
        let pool = pool_opts.connect_with(opts).await?;
        Ok(Self {
            inner: DbInner::Sqlite(pool),
        })
    }

    /// Connect to Postgres at `connection_string`. The statement timeout, if
    /// configured, is installed on every pooled connection.
    pub async fn postgres(connection_string: &str, args: DbArgs) -> DbResult<Self> {
        let opts = PgConnectOptions::from_str(connection_string)
            .map_err(|e| DbError::InvalidUrl(e.to_string()))?;

        let statement_timeout = args.statement_timeout_ms;
        let mut pool_opts = PgPoolOptions::new()
            .max_connections(args.connection_pool_size)
            .acquire_timeout(args.connection_timeout());
        if let Some(timeout_ms) = statement_timeout {
            pool_opts = pool_opts.after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = {timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            });
        }

        let pool = pool_opts.connect_with(opts).await?;
        info!("Connected to postgres database");
        Ok(Self {
            inner: DbInner::Postgres(pool),
        })
    }

    pub fn kind(&self) -> DbKind {
        match &self.inner {
            DbInner::Sqlite(_) => DbKind::Sqlite,
            DbInner::Postgres(_) => DbKind::Postgres,
        }
    }

    /// The placeholder for the `idx`-th (1-based) bind parameter in this
    /// dialect. Parameters are always bound in order, so SQLite's anonymous
    /// `?` markers line up with Postgres' `$n`.
    pub fn placeholder(&self, idx: usize) -> String {
        match self.kind() {
            DbKind::Sqlite => "?".to_string(),
            DbKind::Postgres => format!("${idx}"),
        }
    }

    /// A comma-separated placeholder list for parameters `start..start + n`.
    pub fn placeholders(&self, start: usize, n: usize) -> String {
        (0..n)
            .map(|i| self.placeholder(start + i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        match &self.inner {
            DbInner::Sqlite(pool) => {
                let q = bind_sqlite(sqlx::query(sql), params);
                Ok(q.execute(pool).await?.rows_affected())
            }
            DbInner::Postgres(pool) => {
                let q = bind_postgres(sqlx::query(sql), params)?;
                Ok(q.execute(pool).await?.rows_affected())
            }
        }
    }

    pub async fn fetch_all(
        &self,
        sql: &str,
        params: &[SqlValue],
        columns: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        match &self.inner {
            DbInner::Sqlite(pool) => {
                let rows = bind_sqlite(sqlx::query(sql), params).fetch_all(pool).await?;
                rows.iter().map(|r| decode_sqlite(r, columns)).collect()
            }
            DbInner::Postgres(pool) => {
                let rows = bind_postgres(sqlx::query(sql), params)?
                    .fetch_all(pool)
                    .await?;
                rows.iter().map(|r| decode_postgres(r, columns)).collect()
            }
        }
    }

    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[SqlValue],
        columns: &[SqlType],
    ) -> DbResult<Option<Vec<SqlValue>>> {
        match &self.inner {
            DbInner::Sqlite(pool) => {
                let row = bind_sqlite(sqlx::query(sql), params)
                    .fetch_optional(pool)
                    .await?;
                row.as_ref().map(|r| decode_sqlite(r, columns)).transpose()
            }
            DbInner::Postgres(pool) => {
                let row = bind_postgres(sqlx::query(sql), params)?
                    .fetch_optional(pool)
                    .await?;
                row.as_ref().map(|r| decode_postgres(r, columns)).transpose()
            }
        }
    }

    pub async fn begin(&self) -> DbResult<DbTransaction<'_>> {
        Ok(match &self.inner {
            DbInner::Sqlite(pool) => DbTransaction::Sqlite(pool.begin().await?),
            DbInner::Postgres(pool) => DbTransaction::Postgres(pool.begin().await?),
        })
    }
}

/// An in-progress transaction. Dropping it without [`commit`](Self::commit)
/// rolls back.
pub enum DbTransaction<'c> {
    Sqlite(sqlx::Transaction<'c, sqlx::Sqlite>),
    Postgres(sqlx::Transaction<'c, sqlx::Postgres>),
}

impl DbTransaction<'_> {
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        match self {
            DbTransaction::Sqlite(tx) => {
                let q = bind_sqlite(sqlx::query(sql), params);
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
            DbTransaction::Postgres(tx) => {
                let q = bind_postgres(sqlx::query(sql), params)?;
                Ok(q.execute(&mut **tx).await?.rows_affected())
            }
        }
    }

    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        columns: &[SqlType],
    ) -> DbResult<Vec<Vec<SqlValue>>> {
        match self {
            DbTransaction::Sqlite(tx) => {
                let rows = bind_sqlite(sqlx::query(sql), params)
                    .fetch_all(&mut **tx)
                    .await?;
                rows.iter().map(|r| decode_sqlite(r, columns)).collect()
            }
            DbTransaction::Postgres(tx) => {
                let rows = bind_postgres(sqlx::query(sql), params)?
                    .fetch_all(&mut **tx)
                    .await?;
                rows.iter().map(|r| decode_postgres(r, columns)).collect()
            }
        }
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        columns: &[SqlType],
    ) -> DbResult<Option<Vec<SqlValue>>> {
        match self {
            DbTransaction::Sqlite(tx) => {
                let row = bind_sqlite(sqlx::query(sql), params)
                    .fetch_optional(&mut **tx)
                    .await?;
                row.as_ref().map(|r| decode_sqlite(r, columns)).transpose()
            }
            DbTransaction::Postgres(tx) => {
                let row = bind_postgres(sqlx::query(sql), params)?
                    .fetch_optional(&mut **tx)
                    .await?;
                row.as_ref().map(|r| decode_postgres(r, columns)).transpose()
            }
        }
    }

    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::Sqlite(tx) => tx.commit().await?,
            DbTransaction::Postgres(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::Sqlite(tx) => tx.rollback().await?,
            DbTransaction::Postgres(tx) => tx.rollback().await?,
        }
        Ok(())
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;
type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_sqlite<'q>(mut q: SqliteQuery<'q>, params: &'q [SqlValue]) -> SqliteQuery<'q> {
    for p in params {
        q = match p {
            SqlValue::Null => q.bind(Option::<String>::None),
            SqlValue::Boolean(v) => q.bind(*v),
            SqlValue::Integer(v) => q.bind(*v),
            SqlValue::Real(v) => q.bind(*v),
            SqlValue::Text(s) => q.bind(s.as_str()),
            SqlValue::Blob(b) => q.bind(b.as_slice()),
            // 256-bit integers land in padded-text columns on SQLite.
            SqlValue::Numeric(s) => q.bind(s.as_str()),
        };
    }
    q
}

fn bind_postgres<'q>(mut q: PgQuery<'q>, params: &'q [SqlValue]) -> DbResult<PgQuery<'q>> {
    for p in params {
        q = match p {
            SqlValue::Null => q.bind(Option::<String>::None),
            SqlValue::Boolean(v) => q.bind(*v),
            SqlValue::Integer(v) => q.bind(*v),
            SqlValue::Real(v) => q.bind(*v),
            SqlValue::Text(s) => q.bind(s.as_str()),
            SqlValue::Blob(b) => q.bind(b.as_slice()),
            SqlValue::Numeric(s) => {
                let decimal = BigDecimal::from_str(s.trim_start_matches('+'))
                    .map_err(|_| DbError::InvalidNumeric(s.clone()))?;
                q.bind(decimal)
            }
        };
    }
    Ok(q)
}

fn decode_sqlite(row: &SqliteRow, columns: &[SqlType]) -> DbResult<Vec<SqlValue>> {
    let mut out = Vec::with_capacity(columns.len());
    for (i, ty) in columns.iter().enumerate() {
        let value = match ty {
            SqlType::Boolean => row
                .try_get::<Option<bool>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Boolean),
            SqlType::Integer => row
                .try_get::<Option<i64>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Integer),
            SqlType::Real => row
                .try_get::<Option<f64>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Real),
            SqlType::Text => row
                .try_get::<Option<String>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Text),
            SqlType::Blob => row
                .try_get::<Option<Vec<u8>>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Blob),
            SqlType::Numeric => row
                .try_get::<Option<String>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Numeric),
        };
        out.push(value);
    }
    Ok(out)
}

fn decode_postgres(row: &PgRow, columns: &[SqlType]) -> DbResult<Vec<SqlValue>> {
    let mut out = Vec::with_capacity(columns.len());
    for (i, ty) in columns.iter().enumerate() {
        let value = match ty {
            SqlType::Boolean => row
                .try_get::<Option<bool>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Boolean),
            SqlType::Integer => row
                .try_get::<Option<i64>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Integer),
            SqlType::Real => row
                .try_get::<Option<f64>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Real),
            SqlType::Text => row
                .try_get::<Option<String>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Text),
            SqlType::Blob => row
                .try_get::<Option<Vec<u8>>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Blob),
            SqlType::Numeric => row
                .try_get::<Option<BigDecimal>, _>(i)?
                .map_or(SqlValue::Null, |d| {
                    SqlValue::Numeric(d.normalized().to_string())
                }),
        };
        out.push(value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let db = Db::sqlite_in_memory(None).await.unwrap();
        db.execute(
            "CREATE TABLE t (a INTEGER, b TEXT, c BLOB, d REAL, e INTEGER)",
            &[],
        )
        .await
        .unwrap();
        db.execute(
            &format!("INSERT INTO t VALUES ({})", db.placeholders(1, 5)),
            &[
                SqlValue::Integer(42),
                SqlValue::Text("hello".to_string()),
                SqlValue::Blob(vec![1, 2, 3]),
                SqlValue::Real(1.5),
                SqlValue::Boolean(true),
            ],
        )
        .await
        .unwrap();

        let rows = db
            .fetch_all(
                "SELECT a, b, c, d, e FROM t",
                &[],
                &[
                    SqlType::Integer,
                    SqlType::Text,
                    SqlType::Blob,
                    SqlType::Real,
                    SqlType::Boolean,
                ],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], SqlValue::Integer(42));
        assert_eq!(rows[0][1], SqlValue::Text("hello".to_string()));
        assert_eq!(rows[0][2], SqlValue::Blob(vec![1, 2, 3]));
        assert_eq!(rows[0][3], SqlValue::Real(1.5));
        assert_eq!(rows[0][4], SqlValue::Boolean(true));
    }

    #[tokio::test]
    async fn test_sqlite_nulls() {
        let db = Db::sqlite_in_memory(None).await.unwrap();
        db.execute("CREATE TABLE t (a INTEGER, b TEXT)", &[])
            .await
            .unwrap();
        db.execute(
            &format!("INSERT INTO t VALUES ({})", db.placeholders(1, 2)),
            &[SqlValue::Null, SqlValue::Null],
        )
        .await
        .unwrap();
        let row = db
            .fetch_optional(
                "SELECT a, b FROM t",
                &[],
                &[SqlType::Integer, SqlType::Text],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, vec![SqlValue::Null, SqlValue::Null]);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let db = Db::sqlite_in_memory(None).await.unwrap();
        db.execute("CREATE TABLE t (a INTEGER)", &[]).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        tx.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        let rows = db
            .fetch_all("SELECT a FROM t", &[], &[SqlType::Integer])
            .await
            .unwrap();
        assert!(rows.is_empty());

        let mut tx = db.begin().await.unwrap();
        tx.execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
        tx.commit().await.unwrap();
        let rows = db
            .fetch_all("SELECT a FROM t", &[], &[SqlType::Integer])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Integer(2)]]);
    }

    #[tokio::test]
    async fn test_attached_cache_database() {
        let db = Db::sqlite_in_memory(Some("ponder_cache")).await.unwrap();
        db.execute("CREATE TABLE ponder_cache.c (a INTEGER)", &[])
            .await
            .unwrap();
        db.execute("INSERT INTO ponder_cache.c VALUES (7)", &[])
            .await
            .unwrap();
        let rows = db
            .fetch_all("SELECT a FROM ponder_cache.c", &[], &[SqlType::Integer])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Integer(7)]]);
    }

    #[tokio::test]
    async fn test_sqlite_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ponder.db");
        let db = Db::sqlite(&path, None, DbArgs::default()).await.unwrap();
        db.execute("CREATE TABLE t (a TEXT)", &[]).await.unwrap();
        assert!(path.exists());
        assert_eq!(db.kind(), DbKind::Sqlite);
    }

    #[test]
    fn test_placeholders() {
        // Placeholder rendering is pure string work; exercise it through a
        // quick in-memory handle.
        let rt = tokio::runtime::Runtime::new().unwrap();
        let db = rt.block_on(Db::sqlite_in_memory(None)).unwrap();
        assert_eq!(db.placeholder(3), "?");
        assert_eq!(db.placeholders(1, 3), "?, ?, ?");
    }
}
