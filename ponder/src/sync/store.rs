// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistent store for raw chain data.
//!
//! One row per chain-scoped primary key; inserts are idempotent so the sync
//! tasks can blindly re-persist whatever they fetched. Interval rows record
//! which `(filter, block-range)` pairs are already cached; they are merged on
//! insert so the set stays pairwise disjoint. `get_log_events` is the read
//! path for the event stream: a checkpoint-ordered join of logs against
//! blocks, transactions and (optionally) receipts.

use std::collections::HashSet;
use std::str::FromStr;

use ethers::types::{Address, Bloom, Bytes, H256, H64, U256};
use ponder_db::{Db, DbKind, DbTransaction, SqlType, SqlValue};
use tracing::debug;

use super::intervals;
use super::types::{
    FactorySpec, LogEvent, LogFilterSpec, SyncBlock, SyncLog, SyncTransaction,
    SyncTransactionReceipt,
};
use crate::checkpoint::Checkpoint;
use crate::common::Common;
use crate::error::{PonderError, PonderResult};

const BLOCKS: &str = "ponder_sync_blocks";
const TRANSACTIONS: &str = "ponder_sync_transactions";
const RECEIPTS: &str = "ponder_sync_transaction_receipts";
const LOGS: &str = "ponder_sync_logs";
const RPC_RESULTS: &str = "ponder_sync_rpc_request_results";
const LOG_FILTERS: &str = "ponder_sync_log_filters";
const FACTORIES: &str = "ponder_sync_factories";
const LOG_FILTER_INTERVALS: &str = "ponder_sync_log_filter_intervals";
const FACTORY_INTERVALS: &str = "ponder_sync_factory_log_filter_intervals";

/// Which interval table a range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    LogFilter,
    Factory,
}

impl IntervalKind {
    fn table(&self) -> &'static str {
        match self {
            IntervalKind::LogFilter => LOG_FILTER_INTERVALS,
            IntervalKind::Factory => FACTORY_INTERVALS,
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            IntervalKind::LogFilter => "log_filter_id",
            IntervalKind::Factory => "factory_id",
        }
    }
}

/// Everything fetched for one historical chunk, persisted atomically.
#[derive(Debug, Default)]
pub struct ChunkData {
    pub blocks: Vec<SyncBlock>,
    pub transactions: Vec<SyncTransaction>,
    pub receipts: Vec<SyncTransactionReceipt>,
    pub logs: Vec<SyncLog>,
    pub interval: Option<(IntervalKind, String, (u64, u64))>,
}

pub struct GetLogEventsArgs<'a> {
    /// Exclusive lower bound.
    pub from: Checkpoint,
    /// Inclusive upper bound.
    pub to: Checkpoint,
    pub filters: &'a [LogFilterSpec],
    pub limit: u64,
}

#[derive(Clone)]
pub struct SyncStore {
    db: Db,
}

impl SyncStore {
    pub fn new(db: Db, _common: &Common) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn big_ddl(&self) -> &'static str {
        match self.db.kind() {
            DbKind::Sqlite => "TEXT",
            DbKind::Postgres => "NUMERIC(78)",
        }
    }

    fn int_ddl(&self) -> &'static str {
        match self.db.kind() {
            DbKind::Sqlite => "INTEGER",
            DbKind::Postgres => "BIGINT",
        }
    }

    fn blob_ddl(&self) -> &'static str {
        match self.db.kind() {
            DbKind::Sqlite => "BLOB",
            DbKind::Postgres => "BYTEA",
        }
    }

    fn bool_ddl(&self) -> &'static str {
        match self.db.kind() {
            DbKind::Sqlite => "INTEGER",
            DbKind::Postgres => "BOOLEAN",
        }
    }

    fn big(&self) -> SqlType {
        match self.db.kind() {
            DbKind::Sqlite => SqlType::Text,
            DbKind::Postgres => SqlType::Numeric,
        }
    }

    /// Create the raw tables. Runs once at startup; every statement is
    /// idempotent.
    pub async fn migrate(&self) -> PonderResult<()> {
        let big = self.big_ddl();
        let int = self.int_ddl();
        let blob = self.blob_ddl();
        let boolean = self.bool_ddl();

        let statements = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {BLOCKS} (
                    hash TEXT PRIMARY KEY,
                    chain_id {int} NOT NULL,
                    number {int} NOT NULL,
                    timestamp {int} NOT NULL,
                    parent_hash TEXT NOT NULL,
                    miner TEXT NOT NULL,
                    gas_limit {big} NOT NULL,
                    gas_used {big} NOT NULL,
                    base_fee_per_gas {big},
                    difficulty {big} NOT NULL,
                    total_difficulty {big},
                    extra_data {blob} NOT NULL,
                    logs_bloom TEXT,
                    mix_hash TEXT,
                    nonce TEXT,
                    receipts_root TEXT NOT NULL,
                    sha3_uncles TEXT NOT NULL,
                    size {big},
                    state_root TEXT NOT NULL,
                    transactions_root TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {BLOCKS}_chain_number ON {BLOCKS} (chain_id, number)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {TRANSACTIONS} (
                    hash TEXT PRIMARY KEY,
                    chain_id {int} NOT NULL,
                    block_hash TEXT NOT NULL,
                    block_number {int} NOT NULL,
                    transaction_index {int} NOT NULL,
                    from_address TEXT NOT NULL,
                    to_address TEXT,
                    input {blob} NOT NULL,
                    value {big} NOT NULL,
                    gas {big} NOT NULL,
                    gas_price {big},
                    max_fee_per_gas {big},
                    max_priority_fee_per_gas {big},
                    nonce {big} NOT NULL,
                    r {big} NOT NULL,
                    s {big} NOT NULL,
                    v {int} NOT NULL,
                    transaction_type {int},
                    access_list TEXT
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {TRANSACTIONS}_chain_number ON {TRANSACTIONS} (chain_id, block_number)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {RECEIPTS} (
                    transaction_hash TEXT PRIMARY KEY,
                    chain_id {int} NOT NULL,
                    block_hash TEXT NOT NULL,
                    block_number {int} NOT NULL,
                    transaction_index {int} NOT NULL,
                    from_address TEXT NOT NULL,
                    to_address TEXT,
                    contract_address TEXT,
                    cumulative_gas_used {big} NOT NULL,
                    effective_gas_price {big},
                    gas_used {big},
                    logs TEXT NOT NULL,
                    logs_bloom TEXT NOT NULL,
                    status {int},
                    transaction_type {int}
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {RECEIPTS}_chain_number ON {RECEIPTS} (chain_id, block_number)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {LOGS} (
                    id TEXT PRIMARY KEY,
                    chain_id {int} NOT NULL,
                    address TEXT NOT NULL,
                    block_hash TEXT NOT NULL,
                    block_number {int} NOT NULL,
                    log_index {int} NOT NULL,
                    transaction_hash TEXT NOT NULL,
                    transaction_index {int} NOT NULL,
                    topic0 TEXT,
                    topic1 TEXT,
                    topic2 TEXT,
                    topic3 TEXT,
                    data {blob} NOT NULL,
                    checkpoint TEXT NOT NULL
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS {LOGS}_checkpoint ON {LOGS} (checkpoint)"),
            format!(
                "CREATE INDEX IF NOT EXISTS {LOGS}_chain_number ON {LOGS} (chain_id, block_number)"
            ),
            format!("CREATE INDEX IF NOT EXISTS {LOGS}_address ON {LOGS} (address)"),
            format!(
                "CREATE TABLE IF NOT EXISTS {RPC_RESULTS} (
                    chain_id {int} NOT NULL,
                    block_number {int} NOT NULL,
                    request TEXT NOT NULL,
                    result TEXT NOT NULL,
                    PRIMARY KEY (chain_id, block_number, request)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {LOG_FILTERS} (
                    id TEXT PRIMARY KEY,
                    chain_id {int} NOT NULL,
                    addresses TEXT NOT NULL,
                    topic0 TEXT,
                    topic1 TEXT,
                    topic2 TEXT,
                    topic3 TEXT,
                    include_transaction_receipts {boolean} NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {FACTORIES} (
                    id TEXT PRIMARY KEY,
                    chain_id {int} NOT NULL,
                    address TEXT NOT NULL,
                    event_selector TEXT NOT NULL,
                    child_address_location TEXT NOT NULL,
                    topic0 TEXT,
                    topic1 TEXT,
                    topic2 TEXT,
                    topic3 TEXT,
                    include_transaction_receipts {boolean} NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {LOG_FILTER_INTERVALS} (
                    log_filter_id TEXT NOT NULL,
                    start_block {int} NOT NULL,
                    end_block {int} NOT NULL,
                    PRIMARY KEY (log_filter_id, start_block)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {FACTORY_INTERVALS} (
                    factory_id TEXT NOT NULL,
                    start_block {int} NOT NULL,
                    end_block {int} NOT NULL,
                    PRIMARY KEY (factory_id, start_block)
                )"
            ),
        ];
        for statement in statements {
            self.db.execute(&statement, &[]).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Filter metadata
    // ------------------------------------------------------------------

    pub async fn insert_log_filter(&self, filter: &LogFilterSpec) -> PonderResult<()> {
        let sql = format!(
            "INSERT INTO {LOG_FILTERS}
                (id, chain_id, addresses, topic0, topic1, topic2, topic3, include_transaction_receipts)
             VALUES ({}) ON CONFLICT (id) DO NOTHING",
            self.db.placeholders(1, 8)
        );
        let topics = &filter.selection.topics;
        self.db
            .execute(
                &sql,
                &[
                    SqlValue::Text(filter.id.clone()),
                    SqlValue::Integer(filter.chain_id as i64),
                    SqlValue::Text(encode_addresses(&filter.selection.addresses)),
                    topic_json(&topics[0]),
                    topic_json(&topics[1]),
                    topic_json(&topics[2]),
                    topic_json(&topics[3]),
                    SqlValue::Boolean(filter.include_transaction_receipts),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn insert_factory(&self, factory: &FactorySpec) -> PonderResult<()> {
        let sql = format!(
            "INSERT INTO {FACTORIES}
                (id, chain_id, address, event_selector, child_address_location,
                 topic0, topic1, topic2, topic3, include_transaction_receipts)
             VALUES ({}) ON CONFLICT (id) DO NOTHING",
            self.db.placeholders(1, 10)
        );
        self.db
            .execute(
                &sql,
                &[
                    SqlValue::Text(factory.id.clone()),
                    SqlValue::Integer(factory.chain_id as i64),
                    SqlValue::Text(format!("{:?}", factory.address)),
                    SqlValue::Text(format!("{:?}", factory.event_selector)),
                    SqlValue::Text(String::from(factory.child_address_location)),
                    topic_json(&factory.topics[0]),
                    topic_json(&factory.topics[1]),
                    topic_json(&factory.topics[2]),
                    topic_json(&factory.topics[3]),
                    SqlValue::Boolean(factory.include_transaction_receipts),
                ],
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw inserts
    // ------------------------------------------------------------------

    pub async fn insert_block(&self, block: &SyncBlock) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        self.insert_block_tx(&mut tx, block).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_logs(&self, logs: &[SyncLog]) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        for log in logs {
            self.insert_log_tx(&mut tx, log).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_transactions(&self, txs: &[SyncTransaction]) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        for transaction in txs {
            self.insert_transaction_tx(&mut tx, transaction).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_receipts(&self, receipts: &[SyncTransactionReceipt]) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        for receipt in receipts {
            self.insert_receipt_tx(&mut tx, receipt).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist one historical chunk and its interval in a single transaction.
    pub async fn insert_chunk(&self, chunk: &ChunkData) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        for block in &chunk.blocks {
            self.insert_block_tx(&mut tx, block).await?;
        }
        for transaction in &chunk.transactions {
            self.insert_transaction_tx(&mut tx, transaction).await?;
        }
        for receipt in &chunk.receipts {
            self.insert_receipt_tx(&mut tx, receipt).await?;
        }
        for log in &chunk.logs {
            self.insert_log_tx(&mut tx, log).await?;
        }
        if let Some((kind, id, range)) = &chunk.interval {
            self.insert_interval_tx(&mut tx, *kind, id, *range).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_block_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        block: &SyncBlock,
    ) -> PonderResult<()> {
        let kind = self.db.kind();
        let sql = format!(
            "INSERT INTO {BLOCKS}
                (hash, chain_id, number, timestamp, parent_hash, miner, gas_limit, gas_used,
                 base_fee_per_gas, difficulty, total_difficulty, extra_data, logs_bloom, mix_hash,
                 nonce, receipts_root, sha3_uncles, size, state_root, transactions_root)
             VALUES ({}) ON CONFLICT (hash) DO NOTHING",
            self.db.placeholders(1, 20)
        );
        tx.execute(
            &sql,
            &[
                SqlValue::Text(format!("{:?}", block.hash)),
                SqlValue::Integer(block.chain_id as i64),
                SqlValue::Integer(block.number as i64),
                SqlValue::Integer(block.timestamp as i64),
                SqlValue::Text(format!("{:?}", block.parent_hash)),
                SqlValue::Text(format!("{:?}", block.miner)),
                crate::bigint::u256_to_sql(kind, block.gas_limit),
                crate::bigint::u256_to_sql(kind, block.gas_used),
                opt_u256(kind, block.base_fee_per_gas),
                crate::bigint::u256_to_sql(kind, block.difficulty),
                opt_u256(kind, block.total_difficulty),
                SqlValue::Blob(block.extra_data.to_vec()),
                opt_text(block.logs_bloom.map(|b| format!("{b:?}"))),
                opt_text(block.mix_hash.map(|h| format!("{h:?}"))),
                opt_text(block.nonce.map(|n| format!("{n:?}"))),
                SqlValue::Text(format!("{:?}", block.receipts_root)),
                SqlValue::Text(format!("{:?}", block.sha3_uncles)),
                opt_u256(kind, block.size),
                SqlValue::Text(format!("{:?}", block.state_root)),
                SqlValue::Text(format!("{:?}", block.transactions_root)),
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_transaction_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        transaction: &SyncTransaction,
    ) -> PonderResult<()> {
        let kind = self.db.kind();
        let sql = format!(
            "INSERT INTO {TRANSACTIONS}
                (hash, chain_id, block_hash, block_number, transaction_index, from_address,
                 to_address, input, value, gas, gas_price, max_fee_per_gas,
                 max_priority_fee_per_gas, nonce, r, s, v, transaction_type, access_list)
             VALUES ({}) ON CONFLICT (hash) DO NOTHING",
            self.db.placeholders(1, 19)
        );
        tx.execute(
            &sql,
            &[
                SqlValue::Text(format!("{:?}", transaction.hash)),
                SqlValue::Integer(transaction.chain_id as i64),
                SqlValue::Text(format!("{:?}", transaction.block_hash)),
                SqlValue::Integer(transaction.block_number as i64),
                SqlValue::Integer(transaction.transaction_index as i64),
                SqlValue::Text(format!("{:?}", transaction.from)),
                opt_text(transaction.to.map(|a| format!("{a:?}"))),
                SqlValue::Blob(transaction.input.to_vec()),
                crate::bigint::u256_to_sql(kind, transaction.value),
                crate::bigint::u256_to_sql(kind, transaction.gas),
                opt_u256(kind, transaction.gas_price),
                opt_u256(kind, transaction.max_fee_per_gas),
                opt_u256(kind, transaction.max_priority_fee_per_gas),
                crate::bigint::u256_to_sql(kind, transaction.nonce),
                crate::bigint::u256_to_sql(kind, transaction.r),
                crate::bigint::u256_to_sql(kind, transaction.s),
                SqlValue::Integer(transaction.v as i64),
                opt_int(transaction.transaction_type),
                opt_text(transaction.access_list.clone()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_receipt_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        receipt: &SyncTransactionReceipt,
    ) -> PonderResult<()> {
        let kind = self.db.kind();
        let sql = format!(
            "INSERT INTO {RECEIPTS}
                (transaction_hash, chain_id, block_hash, block_number, transaction_index,
                 from_address, to_address, contract_address, cumulative_gas_used,
                 effective_gas_price, gas_used, logs, logs_bloom, status, transaction_type)
             VALUES ({}) ON CONFLICT (transaction_hash) DO NOTHING",
            self.db.placeholders(1, 15)
        );
        tx.execute(
            &sql,
            &[
                SqlValue::Text(format!("{:?}", receipt.transaction_hash)),
                SqlValue::Integer(receipt.chain_id as i64),
                SqlValue::Text(format!("{:?}", receipt.block_hash)),
                SqlValue::Integer(receipt.block_number as i64),
                SqlValue::Integer(receipt.transaction_index as i64),
                SqlValue::Text(format!("{:?}", receipt.from)),
                opt_text(receipt.to.map(|a| format!("{a:?}"))),
                opt_text(receipt.contract_address.map(|a| format!("{a:?}"))),
                crate::bigint::u256_to_sql(kind, receipt.cumulative_gas_used),
                opt_u256(kind, receipt.effective_gas_price),
                opt_u256(kind, receipt.gas_used),
                SqlValue::Text(receipt.logs.clone()),
                SqlValue::Text(format!("{:?}", receipt.logs_bloom)),
                opt_int(receipt.status),
                opt_int(receipt.transaction_type),
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_log_tx(&self, tx: &mut DbTransaction<'_>, log: &SyncLog) -> PonderResult<()> {
        let sql = format!(
            "INSERT INTO {LOGS}
                (id, chain_id, address, block_hash, block_number, log_index, transaction_hash,
                 transaction_index, topic0, topic1, topic2, topic3, data, checkpoint)
             VALUES ({}) ON CONFLICT (id) DO NOTHING",
            self.db.placeholders(1, 14)
        );
        tx.execute(
            &sql,
            &[
                SqlValue::Text(log.id.clone()),
                SqlValue::Integer(log.chain_id as i64),
                SqlValue::Text(format!("{:?}", log.address)),
                SqlValue::Text(format!("{:?}", log.block_hash)),
                SqlValue::Integer(log.block_number as i64),
                SqlValue::Integer(log.log_index as i64),
                SqlValue::Text(format!("{:?}", log.transaction_hash)),
                SqlValue::Integer(log.transaction_index as i64),
                opt_text(log.topic0.map(|t| format!("{t:?}"))),
                opt_text(log.topic1.map(|t| format!("{t:?}"))),
                opt_text(log.topic2.map(|t| format!("{t:?}"))),
                opt_text(log.topic3.map(|t| format!("{t:?}"))),
                SqlValue::Blob(log.data.to_vec()),
                SqlValue::Text(log.checkpoint.encode()),
            ],
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Intervals
    // ------------------------------------------------------------------

    pub async fn insert_log_filter_interval(
        &self,
        filter_id: &str,
        range: (u64, u64),
    ) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        self.insert_interval_tx(&mut tx, IntervalKind::LogFilter, filter_id, range)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_log_filter_intervals(&self, filter_id: &str) -> PonderResult<Vec<(u64, u64)>> {
        self.get_intervals(IntervalKind::LogFilter, filter_id).await
    }

    pub async fn insert_factory_log_filter_interval(
        &self,
        factory_id: &str,
        range: (u64, u64),
    ) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        self.insert_interval_tx(&mut tx, IntervalKind::Factory, factory_id, range)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_factory_log_filter_intervals(
        &self,
        factory_id: &str,
    ) -> PonderResult<Vec<(u64, u64)>> {
        self.get_intervals(IntervalKind::Factory, factory_id).await
    }

    async fn get_intervals(&self, kind: IntervalKind, id: &str) -> PonderResult<Vec<(u64, u64)>> {
        let sql = format!(
            "SELECT start_block, end_block FROM {} WHERE {} = {} ORDER BY start_block",
            kind.table(),
            kind.id_column(),
            self.db.placeholder(1)
        );
        let rows = self
            .db
            .fetch_all(
                &sql,
                &[SqlValue::Text(id.to_string())],
                &[SqlType::Integer, SqlType::Integer],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let start = cell_i64(&row[0])? as u64;
                let end = cell_i64(&row[1])? as u64;
                Ok((start, end))
            })
            .collect()
    }

    /// Merge-on-insert: read the stored set, merge the new range in, rewrite.
    async fn insert_interval_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        kind: IntervalKind,
        id: &str,
        range: (u64, u64),
    ) -> PonderResult<()> {
        if range.0 > range.1 {
            return Ok(());
        }
        let select = format!(
            "SELECT start_block, end_block FROM {} WHERE {} = {}",
            kind.table(),
            kind.id_column(),
            self.db.placeholder(1)
        );
        let rows = tx
            .fetch_all(
                &select,
                &[SqlValue::Text(id.to_string())],
                &[SqlType::Integer, SqlType::Integer],
            )
            .await?;
        let mut set: Vec<(u64, u64)> = rows
            .into_iter()
            .map(|row| {
                Ok::<_, PonderError>((cell_i64(&row[0])? as u64, cell_i64(&row[1])? as u64))
            })
            .collect::<PonderResult<_>>()?;
        set.push(range);
        let merged = intervals::merge(set);
        self.rewrite_intervals_tx(tx, kind, id, &merged).await
    }

    async fn rewrite_intervals_tx(
        &self,
        tx: &mut DbTransaction<'_>,
        kind: IntervalKind,
        id: &str,
        set: &[(u64, u64)],
    ) -> PonderResult<()> {
        let delete = format!(
            "DELETE FROM {} WHERE {} = {}",
            kind.table(),
            kind.id_column(),
            self.db.placeholder(1)
        );
        tx.execute(&delete, &[SqlValue::Text(id.to_string())]).await?;
        let insert = format!(
            "INSERT INTO {} ({}, start_block, end_block) VALUES ({})",
            kind.table(),
            kind.id_column(),
            self.db.placeholders(1, 3)
        );
        for &(start, end) in set {
            tx.execute(
                &insert,
                &[
                    SqlValue::Text(id.to_string()),
                    SqlValue::Integer(start as i64),
                    SqlValue::Integer(end as i64),
                ],
            )
            .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Hashes from `hashes` that are not yet in the blocks table.
    pub async fn missing_block_hashes(&self, hashes: &[H256]) -> PonderResult<Vec<H256>> {
        self.missing_hashes(BLOCKS, "hash", hashes).await
    }

    /// Transaction hashes from `hashes` without a stored receipt.
    pub async fn missing_receipt_hashes(&self, hashes: &[H256]) -> PonderResult<Vec<H256>> {
        self.missing_hashes(RECEIPTS, "transaction_hash", hashes).await
    }

    /// Transaction hashes from `hashes` not yet in the transactions table.
    pub async fn missing_transaction_hashes(&self, hashes: &[H256]) -> PonderResult<Vec<H256>> {
        self.missing_hashes(TRANSACTIONS, "hash", hashes).await
    }

    /// Timestamps for the given block hashes, for hashes that are stored.
    pub async fn get_block_timestamps(
        &self,
        hashes: &[H256],
    ) -> PonderResult<std::collections::HashMap<H256, u64>> {
        if hashes.is_empty() {
            return Ok(Default::default());
        }
        let sql = format!(
            "SELECT hash, timestamp FROM {BLOCKS} WHERE hash IN ({})",
            self.db.placeholders(1, hashes.len())
        );
        let params: Vec<SqlValue> = hashes
            .iter()
            .map(|h| SqlValue::Text(format!("{h:?}")))
            .collect();
        let rows = self
            .db
            .fetch_all(&sql, &params, &[SqlType::Text, SqlType::Integer])
            .await?;
        rows.into_iter()
            .map(|row| {
                let hash = parse_h256(row[0].as_text().unwrap_or_default())?;
                Ok((hash, cell_i64(&row[1])? as u64))
            })
            .collect()
    }

    /// The stored block with the highest number `<= number` on a chain.
    pub async fn latest_block_at_or_before(
        &self,
        chain_id: u64,
        number: u64,
    ) -> PonderResult<Option<(u64, u64)>> {
        let sql = format!(
            "SELECT number, timestamp FROM {BLOCKS}
             WHERE chain_id = {} AND number <= {}
             ORDER BY number DESC LIMIT 1",
            self.db.placeholder(1),
            self.db.placeholder(2)
        );
        let row = self
            .db
            .fetch_optional(
                &sql,
                &[
                    SqlValue::Integer(chain_id as i64),
                    SqlValue::Integer(number as i64),
                ],
                &[SqlType::Integer, SqlType::Integer],
            )
            .await?;
        row.map(|r| Ok((cell_i64(&r[0])? as u64, cell_i64(&r[1])? as u64)))
            .transpose()
    }

    async fn missing_hashes(
        &self,
        table: &str,
        column: &str,
        hashes: &[H256],
    ) -> PonderResult<Vec<H256>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {column} FROM {table} WHERE {column} IN ({})",
            self.db.placeholders(1, hashes.len())
        );
        let params: Vec<SqlValue> = hashes
            .iter()
            .map(|h| SqlValue::Text(format!("{h:?}")))
            .collect();
        let rows = self.db.fetch_all(&sql, &params, &[SqlType::Text]).await?;
        let present: HashSet<String> = rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(SqlValue::into_text))
            .collect();
        Ok(hashes
            .iter()
            .filter(|h| !present.contains(&format!("{h:?}")))
            .copied()
            .collect())
    }

    /// Child addresses a factory has announced up to (and including)
    /// `up_to_block`, derived from logs already in the store.
    pub async fn get_factory_child_addresses(
        &self,
        factory: &FactorySpec,
        up_to_block: u64,
    ) -> PonderResult<Vec<Address>> {
        let sql = format!(
            "SELECT {} FROM {LOGS} l
             WHERE l.chain_id = {} AND l.address = {} AND l.topic0 = {} AND l.block_number <= {}
             ORDER BY l.block_number, l.log_index",
            LOG_COLUMNS,
            self.db.placeholder(1),
            self.db.placeholder(2),
            self.db.placeholder(3),
            self.db.placeholder(4),
        );
        let rows = self
            .db
            .fetch_all(
                &sql,
                &[
                    SqlValue::Integer(factory.chain_id as i64),
                    SqlValue::Text(format!("{:?}", factory.address)),
                    SqlValue::Text(format!("{:?}", factory.event_selector)),
                    SqlValue::Integer(up_to_block as i64),
                ],
                &log_column_types(),
            )
            .await?;
        let mut children = Vec::new();
        let mut seen = HashSet::new();
        for row in rows {
            let log = decode_log(&mut RowReader::new(&row))?;
            if let Some(child) = factory.extract_child(&log) {
                if seen.insert(child) {
                    children.push(child);
                }
            }
        }
        Ok(children)
    }

    /// Checkpoint-ordered page of events in `(from, to]` matching any of the
    /// given filters. The caller resumes with the last yielded checkpoint as
    /// the next `from`.
    pub async fn get_log_events(&self, args: GetLogEventsArgs<'_>) -> PonderResult<Vec<LogEvent>> {
        if args.filters.is_empty() {
            return Ok(Vec::new());
        }

        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(args.from.encode()),
            SqlValue::Text(args.to.encode()),
        ];
        let mut clauses: Vec<String> = Vec::new();
        for filter in args.filters {
            let mut parts = vec![format!("l.chain_id = {}", next(&self.db, &mut params, SqlValue::Integer(filter.chain_id as i64)))];
            if !filter.selection.addresses.is_empty() {
                let markers: Vec<String> = filter
                    .selection
                    .addresses
                    .iter()
                    .map(|a| next(&self.db, &mut params, SqlValue::Text(format!("{a:?}"))))
                    .collect();
                parts.push(format!("l.address IN ({})", markers.join(", ")));
            }
            for (i, slot) in filter.selection.topics.iter().enumerate() {
                if let Some(values) = slot {
                    if values.is_empty() {
                        continue;
                    }
                    let markers: Vec<String> = values
                        .iter()
                        .map(|t| next(&self.db, &mut params, SqlValue::Text(format!("{t:?}"))))
                        .collect();
                    parts.push(format!("l.topic{i} IN ({})", markers.join(", ")));
                }
            }
            clauses.push(format!("({})", parts.join(" AND ")));
        }

        let limit_marker = next(&self.db, &mut params, SqlValue::Integer(args.limit as i64));
        let sql = format!(
            "SELECT {LOG_COLUMNS}, {BLOCK_COLUMNS}, {TX_COLUMNS}, {RECEIPT_COLUMNS}
             FROM {LOGS} l
             JOIN {BLOCKS} b ON b.hash = l.block_hash
             JOIN {TRANSACTIONS} t ON t.hash = l.transaction_hash
             LEFT JOIN {RECEIPTS} r ON r.transaction_hash = l.transaction_hash
             WHERE l.checkpoint > {} AND l.checkpoint <= {} AND ({})
             ORDER BY l.checkpoint ASC
             LIMIT {limit_marker}",
            self.db.placeholder(1),
            self.db.placeholder(2),
            clauses.join(" OR "),
        );

        let mut columns = log_column_types();
        columns.extend(block_column_types(self.big()));
        columns.extend(tx_column_types(self.big()));
        columns.extend(receipt_column_types(self.big()));

        let rows = self.db.fetch_all(&sql, &params, &columns).await?;
        debug!("get_log_events fetched {} rows", rows.len());
        rows.into_iter()
            .map(|row| {
                let mut reader = RowReader::new(&row);
                let log = decode_log(&mut reader)?;
                let block = decode_block(&mut reader)?;
                let transaction = decode_transaction(&mut reader)?;
                let receipt = decode_receipt_opt(&mut reader)?;
                Ok(LogEvent {
                    log,
                    block,
                    transaction,
                    receipt,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // RPC memoization
    // ------------------------------------------------------------------

    pub async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
        result: &str,
    ) -> PonderResult<()> {
        let sql = format!(
            "INSERT INTO {RPC_RESULTS} (chain_id, block_number, request, result)
             VALUES ({}) ON CONFLICT (chain_id, block_number, request) DO NOTHING",
            self.db.placeholders(1, 4)
        );
        self.db
            .execute(
                &sql,
                &[
                    SqlValue::Integer(chain_id as i64),
                    SqlValue::Integer(block_number as i64),
                    SqlValue::Text(request.to_string()),
                    SqlValue::Text(result.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
    ) -> PonderResult<Option<String>> {
        let sql = format!(
            "SELECT result FROM {RPC_RESULTS}
             WHERE chain_id = {} AND block_number = {} AND request = {}",
            self.db.placeholder(1),
            self.db.placeholder(2),
            self.db.placeholder(3)
        );
        let row = self
            .db
            .fetch_optional(
                &sql,
                &[
                    SqlValue::Integer(chain_id as i64),
                    SqlValue::Integer(block_number as i64),
                    SqlValue::Text(request.to_string()),
                ],
                &[SqlType::Text],
            )
            .await?;
        Ok(row.and_then(|r| r.into_iter().next()).and_then(SqlValue::into_text))
    }

    // ------------------------------------------------------------------
    // Reorg support
    // ------------------------------------------------------------------

    /// Atomically remove blocks, transactions, receipts, logs and interval
    /// coverage strictly above `from_block` on one chain.
    pub async fn prune_by_block(&self, chain_id: u64, from_block: u64) -> PonderResult<()> {
        let mut tx = self.db.begin().await?;
        for table in [BLOCKS, TRANSACTIONS, RECEIPTS, LOGS] {
            let column = if table == BLOCKS { "number" } else { "block_number" };
            let sql = format!(
                "DELETE FROM {table} WHERE chain_id = {} AND {column} > {}",
                self.db.placeholder(1),
                self.db.placeholder(2)
            );
            tx.execute(
                &sql,
                &[
                    SqlValue::Integer(chain_id as i64),
                    SqlValue::Integer(from_block as i64),
                ],
            )
            .await?;
        }
        let sql = format!(
            "DELETE FROM {RPC_RESULTS} WHERE chain_id = {} AND block_number > {}",
            self.db.placeholder(1),
            self.db.placeholder(2)
        );
        tx.execute(
            &sql,
            &[
                SqlValue::Integer(chain_id as i64),
                SqlValue::Integer(from_block as i64),
            ],
        )
        .await?;

        // Truncate interval coverage for every filter on this chain.
        for (kind, source_table) in [
            (IntervalKind::LogFilter, LOG_FILTERS),
            (IntervalKind::Factory, FACTORIES),
        ] {
            let select = format!(
                "SELECT id FROM {source_table} WHERE chain_id = {}",
                self.db.placeholder(1)
            );
            let ids = tx
                .fetch_all(
                    &select,
                    &[SqlValue::Integer(chain_id as i64)],
                    &[SqlType::Text],
                )
                .await?;
            let mut filter_ids: Vec<String> = ids
                .into_iter()
                .filter_map(|row| row.into_iter().next().and_then(SqlValue::into_text))
                .collect();
            if kind == IntervalKind::LogFilter {
                // Factory discovery scans live in the log-filter interval
                // table under a derived id.
                let factories = tx
                    .fetch_all(
                        &format!(
                            "SELECT id FROM {FACTORIES} WHERE chain_id = {}",
                            self.db.placeholder(1)
                        ),
                        &[SqlValue::Integer(chain_id as i64)],
                        &[SqlType::Text],
                    )
                    .await?;
                filter_ids.extend(factories.into_iter().filter_map(|row| {
                    row.into_iter()
                        .next()
                        .and_then(SqlValue::into_text)
                        .map(|id| format!("{id}/discovery"))
                }));
            }
            for id in filter_ids {
                let select = format!(
                    "SELECT start_block, end_block FROM {} WHERE {} = {}",
                    kind.table(),
                    kind.id_column(),
                    self.db.placeholder(1)
                );
                let rows = tx
                    .fetch_all(
                        &select,
                        &[SqlValue::Text(id.clone())],
                        &[SqlType::Integer, SqlType::Integer],
                    )
                    .await?;
                let set: Vec<(u64, u64)> = rows
                    .into_iter()
                    .map(|row| {
                        Ok::<_, PonderError>((
                            cell_i64(&row[0])? as u64,
                            cell_i64(&row[1])? as u64,
                        ))
                    })
                    .collect::<PonderResult<_>>()?;
                let truncated = intervals::truncate(&set, from_block);
                if truncated != set {
                    self.rewrite_intervals_tx(&mut tx, kind, &id, &truncated).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Column lists and decoding
// ----------------------------------------------------------------------

const LOG_COLUMNS: &str = "l.id, l.chain_id, l.address, l.block_hash, l.block_number, \
    l.log_index, l.transaction_hash, l.transaction_index, l.topic0, l.topic1, l.topic2, \
    l.topic3, l.data, l.checkpoint";

const BLOCK_COLUMNS: &str = "b.hash, b.chain_id, b.number, b.timestamp, b.parent_hash, b.miner, \
    b.gas_limit, b.gas_used, b.base_fee_per_gas, b.difficulty, b.total_difficulty, b.extra_data, \
    b.logs_bloom, b.mix_hash, b.nonce, b.receipts_root, b.sha3_uncles, b.size, b.state_root, \
    b.transactions_root";

const TX_COLUMNS: &str = "t.hash, t.chain_id, t.block_hash, t.block_number, \
    t.transaction_index, t.from_address, t.to_address, t.input, t.value, t.gas, t.gas_price, \
    t.max_fee_per_gas, t.max_priority_fee_per_gas, t.nonce, t.r, t.s, t.v, t.transaction_type, \
    t.access_list";

const RECEIPT_COLUMNS: &str = "r.transaction_hash, r.chain_id, r.block_hash, r.block_number, \
    r.transaction_index, r.from_address, r.to_address, r.contract_address, \
    r.cumulative_gas_used, r.effective_gas_price, r.gas_used, r.logs, r.logs_bloom, r.status, \
    r.transaction_type";

fn log_column_types() -> Vec<SqlType> {
    vec![
        SqlType::Text,    // id
        SqlType::Integer, // chain_id
        SqlType::Text,    // address
        SqlType::Text,    // block_hash
        SqlType::Integer, // block_number
        SqlType::Integer, // log_index
        SqlType::Text,    // transaction_hash
        SqlType::Integer, // transaction_index
        SqlType::Text,    // topic0
        SqlType::Text,    // topic1
        SqlType::Text,    // topic2
        SqlType::Text,    // topic3
        SqlType::Blob,    // data
        SqlType::Text,    // checkpoint
    ]
}

fn block_column_types(big: SqlType) -> Vec<SqlType> {
    vec![
        SqlType::Text,    // hash
        SqlType::Integer, // chain_id
        SqlType::Integer, // number
        SqlType::Integer, // timestamp
        SqlType::Text,    // parent_hash
        SqlType::Text,    // miner
        big,              // gas_limit
        big,              // gas_used
        big,              // base_fee_per_gas
        big,              // difficulty
        big,              // total_difficulty
        SqlType::Blob,    // extra_data
        SqlType::Text,    // logs_bloom
        SqlType::Text,    // mix_hash
        SqlType::Text,    // nonce
        SqlType::Text,    // receipts_root
        SqlType::Text,    // sha3_uncles
        big,              // size
        SqlType::Text,    // state_root
        SqlType::Text,    // transactions_root
    ]
}

fn tx_column_types(big: SqlType) -> Vec<SqlType> {
    vec![
        SqlType::Text,    // hash
        SqlType::Integer, // chain_id
        SqlType::Text,    // block_hash
        SqlType::Integer, // block_number
        SqlType::Integer, // transaction_index
        SqlType::Text,    // from_address
        SqlType::Text,    // to_address
        SqlType::Blob,    // input
        big,              // value
        big,              // gas
        big,              // gas_price
        big,              // max_fee_per_gas
        big,              // max_priority_fee_per_gas
        big,              // nonce
        big,              // r
        big,              // s
        SqlType::Integer, // v
        SqlType::Integer, // transaction_type
        SqlType::Text,    // access_list
    ]
}

fn receipt_column_types(big: SqlType) -> Vec<SqlType> {
    vec![
        SqlType::Text,    // transaction_hash
        SqlType::Integer, // chain_id
        SqlType::Text,    // block_hash
        SqlType::Integer, // block_number
        SqlType::Integer, // transaction_index
        SqlType::Text,    // from_address
        SqlType::Text,    // to_address
        SqlType::Text,    // contract_address
        big,              // cumulative_gas_used
        big,              // effective_gas_price
        big,              // gas_used
        SqlType::Text,    // logs
        SqlType::Text,    // logs_bloom
        SqlType::Integer, // status
        SqlType::Integer, // transaction_type
    ]
}

struct RowReader<'a> {
    cells: &'a [SqlValue],
    index: usize,
}

impl<'a> RowReader<'a> {
    fn new(cells: &'a [SqlValue]) -> Self {
        Self { cells, index: 0 }
    }

    fn cell(&mut self) -> PonderResult<&'a SqlValue> {
        let cell = self
            .cells
            .get(self.index)
            .ok_or_else(|| PonderError::Database("row shorter than expected".to_string()))?;
        self.index += 1;
        Ok(cell)
    }

    fn text(&mut self) -> PonderResult<&'a str> {
        let index = self.index;
        self.cell()?.as_text().ok_or_else(|| {
            PonderError::Database(format!("expected text in column {index}"))
        })
    }

    fn opt_text(&mut self) -> PonderResult<Option<&'a str>> {
        let cell = self.cell()?;
        Ok(cell.as_text())
    }

    fn i64(&mut self) -> PonderResult<i64> {
        let index = self.index;
        self.cell()?.as_integer().ok_or_else(|| {
            PonderError::Database(format!("expected integer in column {index}"))
        })
    }

    fn u64(&mut self) -> PonderResult<u64> {
        Ok(self.i64()? as u64)
    }

    fn opt_u64(&mut self) -> PonderResult<Option<u64>> {
        Ok(self.cell()?.as_integer().map(|v| v as u64))
    }

    fn blob(&mut self) -> PonderResult<Vec<u8>> {
        match self.cell()? {
            SqlValue::Blob(b) => Ok(b.clone()),
            other => Err(PonderError::Database(format!(
                "expected blob, got {other:?}"
            ))),
        }
    }

    fn u256(&mut self) -> PonderResult<U256> {
        crate::bigint::u256_from_sql(self.cell()?)
    }

    fn opt_u256(&mut self) -> PonderResult<Option<U256>> {
        let cell = self.cell()?;
        if cell.is_null() {
            Ok(None)
        } else {
            crate::bigint::u256_from_sql(cell).map(Some)
        }
    }

    fn h256(&mut self) -> PonderResult<H256> {
        parse_h256(self.text()?)
    }

    fn opt_h256(&mut self) -> PonderResult<Option<H256>> {
        self.opt_text()?.map(parse_h256).transpose()
    }

    fn address(&mut self) -> PonderResult<Address> {
        parse_address(self.text()?)
    }

    fn opt_address(&mut self) -> PonderResult<Option<Address>> {
        self.opt_text()?.map(parse_address).transpose()
    }
}

fn parse_h256(s: &str) -> PonderResult<H256> {
    H256::from_str(s).map_err(|_| PonderError::Database(format!("malformed hash: {s:?}")))
}

fn parse_address(s: &str) -> PonderResult<Address> {
    Address::from_str(s).map_err(|_| PonderError::Database(format!("malformed address: {s:?}")))
}

fn decode_log(reader: &mut RowReader<'_>) -> PonderResult<SyncLog> {
    let id = reader.text()?.to_string();
    let chain_id = reader.u64()?;
    let address = reader.address()?;
    let block_hash = reader.h256()?;
    let block_number = reader.u64()?;
    let log_index = reader.u64()?;
    let transaction_hash = reader.h256()?;
    let transaction_index = reader.u64()?;
    let topic0 = reader.opt_h256()?;
    let topic1 = reader.opt_h256()?;
    let topic2 = reader.opt_h256()?;
    let topic3 = reader.opt_h256()?;
    let data = Bytes::from(reader.blob()?);
    let checkpoint = Checkpoint::decode(reader.text()?)?;
    Ok(SyncLog {
        id,
        chain_id,
        address,
        block_hash,
        block_number,
        log_index,
        transaction_hash,
        transaction_index,
        topic0,
        topic1,
        topic2,
        topic3,
        data,
        checkpoint,
    })
}

fn decode_block(reader: &mut RowReader<'_>) -> PonderResult<SyncBlock> {
    Ok(SyncBlock {
        hash: reader.h256()?,
        chain_id: reader.u64()?,
        number: reader.u64()?,
        timestamp: reader.u64()?,
        parent_hash: reader.h256()?,
        miner: reader.address()?,
        gas_limit: reader.u256()?,
        gas_used: reader.u256()?,
        base_fee_per_gas: reader.opt_u256()?,
        difficulty: reader.u256()?,
        total_difficulty: reader.opt_u256()?,
        extra_data: Bytes::from(reader.blob()?),
        logs_bloom: reader
            .opt_text()?
            .map(|s| {
                Bloom::from_str(s)
                    .map_err(|_| PonderError::Database(format!("malformed bloom: {s:?}")))
            })
            .transpose()?,
        mix_hash: reader.opt_h256()?,
        nonce: reader
            .opt_text()?
            .map(|s| {
                H64::from_str(s)
                    .map_err(|_| PonderError::Database(format!("malformed nonce: {s:?}")))
            })
            .transpose()?,
        receipts_root: reader.h256()?,
        sha3_uncles: reader.h256()?,
        size: reader.opt_u256()?,
        state_root: reader.h256()?,
        transactions_root: reader.h256()?,
    })
}

fn decode_transaction(reader: &mut RowReader<'_>) -> PonderResult<SyncTransaction> {
    Ok(SyncTransaction {
        hash: reader.h256()?,
        chain_id: reader.u64()?,
        block_hash: reader.h256()?,
        block_number: reader.u64()?,
        transaction_index: reader.u64()?,
        from: reader.address()?,
        to: reader.opt_address()?,
        input: Bytes::from(reader.blob()?),
        value: reader.u256()?,
        gas: reader.u256()?,
        gas_price: reader.opt_u256()?,
        max_fee_per_gas: reader.opt_u256()?,
        max_priority_fee_per_gas: reader.opt_u256()?,
        nonce: reader.u256()?,
        r: reader.u256()?,
        s: reader.u256()?,
        v: reader.u64()?,
        transaction_type: reader.opt_u64()?,
        access_list: reader.opt_text()?.map(|s| s.to_string()),
    })
}

fn decode_receipt_opt(reader: &mut RowReader<'_>) -> PonderResult<Option<SyncTransactionReceipt>> {
    // LEFT JOIN miss: the first receipt column is null.
    let transaction_hash = match reader.opt_text()? {
        Some(s) => parse_h256(s)?,
        None => {
            // Skip the remaining receipt columns.
            for _ in 1..receipt_column_types(SqlType::Text).len() {
                reader.cell()?;
            }
            return Ok(None);
        }
    };
    Ok(Some(SyncTransactionReceipt {
        transaction_hash,
        chain_id: reader.u64()?,
        block_hash: reader.h256()?,
        block_number: reader.u64()?,
        transaction_index: reader.u64()?,
        from: reader.address()?,
        to: reader.opt_address()?,
        contract_address: reader.opt_address()?,
        cumulative_gas_used: reader.u256()?,
        effective_gas_price: reader.opt_u256()?,
        gas_used: reader.opt_u256()?,
        logs: reader.text()?.to_string(),
        logs_bloom: {
            let s = reader.text()?;
            Bloom::from_str(s)
                .map_err(|_| PonderError::Database(format!("malformed bloom: {s:?}")))?
        },
        status: reader.opt_u64()?,
        transaction_type: reader.opt_u64()?,
    }))
}

fn cell_i64(cell: &SqlValue) -> PonderResult<i64> {
    cell.as_integer()
        .ok_or_else(|| PonderError::Database(format!("expected integer, got {cell:?}")))
}

fn opt_text(value: Option<String>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Text)
}

fn opt_int(value: Option<u64>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| SqlValue::Integer(v as i64))
}

fn opt_u256(kind: DbKind, value: Option<U256>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| crate::bigint::u256_to_sql(kind, v))
}

fn topic_json(slot: &Option<Vec<H256>>) -> SqlValue {
    match slot {
        None => SqlValue::Null,
        Some(values) => SqlValue::Text(
            serde_json::to_string(&values.iter().map(|v| format!("{v:?}")).collect::<Vec<_>>())
                .unwrap_or_else(|_| "[]".to_string()),
        ),
    }
}

fn encode_addresses(addresses: &[Address]) -> String {
    serde_json::to_string(&addresses.iter().map(|a| format!("{a:?}")).collect::<Vec<_>>())
        .unwrap_or_else(|_| "[]".to_string())
}

fn next(db: &Db, params: &mut Vec<SqlValue>, value: SqlValue) -> String {
    params.push(value);
    db.placeholder(params.len())
}
