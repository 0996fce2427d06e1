// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The contract between the engine and the host's indexing functions.
//!
//! The host supplies, per handler: a name (`"{Contract}:{Event}"`), the
//! tables it reads and writes (derived by the host's own static analysis;
//! the engine consumes them as data) and an async callback. The engine calls
//! back with a decoded-enough [`Event`] and a [`Context`] exposing the
//! indexing store (writes tagged with the event's checkpoint), a memoized
//! read-only call client and network info.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Bytes};
use futures::future::BoxFuture;

use crate::checkpoint::Checkpoint;
use crate::error::PonderResult;
use crate::graph::HandlerSpec;
use crate::indexing_store::{FindManyArgs, IndexingStore, Page, Update};
use crate::rpc::ChainClient;
use crate::schema::{Row, Value};
use crate::sync::store::SyncStore;
use crate::sync::types::{SyncBlock, SyncLog, SyncTransaction, SyncTransactionReceipt};

/// One on-chain event routed to a handler.
#[derive(Debug, Clone)]
pub struct Event {
    pub contract: String,
    pub name: String,
    pub network: NetworkInfo,
    pub checkpoint: Checkpoint,
    pub log: SyncLog,
    pub block: SyncBlock,
    pub transaction: SyncTransaction,
    pub receipt: Option<SyncTransactionReceipt>,
}

#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub name: String,
    pub chain_id: u64,
}

/// Indexing store handle bound to the current event's checkpoint.
#[derive(Clone)]
pub struct ContextDb {
    store: IndexingStore,
    checkpoint: Checkpoint,
}

impl ContextDb {
    pub fn new(store: IndexingStore, checkpoint: Checkpoint) -> Self {
        Self { store, checkpoint }
    }

    pub async fn create(&self, table: &str, id: Value, data: Row) -> PonderResult<Row> {
        self.store.create(table, &self.checkpoint, id, data).await
    }

    pub async fn create_many(&self, table: &str, rows: Vec<Row>) -> PonderResult<Vec<Row>> {
        self.store.create_many(table, &self.checkpoint, rows).await
    }

    pub async fn update(&self, table: &str, id: Value, update: Update) -> PonderResult<Row> {
        self.store.update(table, &self.checkpoint, id, update).await
    }

    pub async fn upsert(
        &self,
        table: &str,
        id: Value,
        create: Row,
        update: Update,
    ) -> PonderResult<Row> {
        self.store
            .upsert(table, &self.checkpoint, id, create, update)
            .await
    }

    pub async fn delete(&self, table: &str, id: Value) -> PonderResult<bool> {
        self.store.delete(table, &self.checkpoint, id).await
    }

    pub async fn find_unique(&self, table: &str, id: &Value) -> PonderResult<Option<Row>> {
        self.store.find_unique(table, id).await
    }

    pub async fn find_many(&self, table: &str, args: FindManyArgs) -> PonderResult<Page> {
        self.store.find_many(table, args).await
    }
}

/// Read-only contract views backed by `eth_call`, memoized per block in the
/// sync store so replays never hit the node again.
pub struct ContractReader {
    client: Arc<dyn ChainClient>,
    store: SyncStore,
    chain_id: u64,
}

impl ContractReader {
    pub fn new(client: Arc<dyn ChainClient>, store: SyncStore, chain_id: u64) -> Self {
        Self {
            client,
            store,
            chain_id,
        }
    }

    pub async fn call(&self, to: Address, data: Bytes, block: u64) -> PonderResult<Bytes> {
        let request = format!("{to:?}:0x{}", hex::encode(&data));
        if let Some(cached) = self
            .store
            .get_rpc_request_result(self.chain_id, block, &request)
            .await?
        {
            let bytes = hex::decode(cached.trim_start_matches("0x")).map_err(|_| {
                crate::error::PonderError::Database(format!(
                    "malformed memoized call result: {cached:?}"
                ))
            })?;
            return Ok(Bytes::from(bytes));
        }
        let result = self.client.call(to, data, block).await?;
        self.store
            .insert_rpc_request_result(
                self.chain_id,
                block,
                &request,
                &format!("0x{}", hex::encode(&result)),
            )
            .await?;
        Ok(result)
    }
}

/// Everything a handler invocation may touch.
#[derive(Clone)]
pub struct Context {
    pub db: ContextDb,
    pub client: Option<Arc<ContractReader>>,
    pub network: NetworkInfo,
}

#[async_trait]
pub trait IndexingFunction: Send + Sync {
    /// `"{Contract}:{Event}"`.
    fn name(&self) -> &str;
    fn reads(&self) -> BTreeSet<String>;
    fn writes(&self) -> BTreeSet<String>;
    async fn invoke(&self, event: Event, context: Context) -> anyhow::Result<()>;

    fn spec(&self) -> HandlerSpec {
        HandlerSpec {
            name: self.name().to_string(),
            reads: self.reads(),
            writes: self.writes(),
        }
    }
}

type HandlerFn =
    dyn Fn(Event, Context) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Closure-backed [`IndexingFunction`]; the shape hosts (and tests) build.
pub struct FnHandler {
    name: String,
    reads: BTreeSet<String>,
    writes: BTreeSet<String>,
    callback: Arc<HandlerFn>,
}

impl FnHandler {
    pub fn new(
        name: impl Into<String>,
        reads: impl IntoIterator<Item = impl Into<String>>,
        writes: impl IntoIterator<Item = impl Into<String>>,
        callback: impl Fn(Event, Context) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            reads: reads.into_iter().map(Into::into).collect(),
            writes: writes.into_iter().map(Into::into).collect(),
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl IndexingFunction for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn reads(&self) -> BTreeSet<String> {
        self.reads.clone()
    }

    fn writes(&self) -> BTreeSet<String> {
        self.writes.clone()
    }

    async fn invoke(&self, event: Event, context: Context) -> anyhow::Result<()> {
        (self.callback)(event, context).await
    }
}
