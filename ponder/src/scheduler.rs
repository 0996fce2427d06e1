// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Indexing scheduler.
//!
//! Consumes batches from the event stream and dispatches them to handlers
//! layer by layer: within a layer handlers run concurrently (bounded by
//! `max_concurrency`), across layers a handler only starts once every
//! handler with an edge into it has finished the whole batch. A handler's
//! own events always execute sequentially in checkpoint order, which is what
//! a self-loop requires. A handler failure aborts the batch: user errors are
//! reloadable (a code edit is expected to fix them), schema violations are
//! fatal.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::common::Common;
use crate::error::PonderError;
use crate::graph::{ConcurrencyMode, DependencyGraph, HandlerSpec};
use crate::handler::{Context, ContextDb, ContractReader, Event, IndexingFunction, NetworkInfo};
use crate::indexing_store::IndexingStore;
use crate::sources::SourceRegistry;
use crate::stream::EventBatch;

/// How a batch failed; decides between reload and process exit.
#[derive(Debug)]
pub enum BatchError {
    Reloadable(PonderError),
    Fatal(PonderError),
}

impl BatchError {
    pub fn error(&self) -> &PonderError {
        match self {
            BatchError::Reloadable(e) | BatchError::Fatal(e) => e,
        }
    }
}

pub struct Scheduler {
    handlers: BTreeMap<String, Arc<dyn IndexingFunction>>,
    graph: DependencyGraph,
    layers: Vec<Vec<String>>,
    store: IndexingStore,
    registry: SourceRegistry,
    /// chain id → (network name, memoized call client).
    clients: HashMap<u64, (String, Arc<ContractReader>)>,
    common: Common,
}

impl Scheduler {
    pub fn new(
        handlers: Vec<Arc<dyn IndexingFunction>>,
        mode: ConcurrencyMode,
        store: IndexingStore,
        registry: SourceRegistry,
        clients: HashMap<u64, (String, Arc<ContractReader>)>,
        common: Common,
    ) -> Self {
        let specs: Vec<HandlerSpec> = handlers.iter().map(|h| h.spec()).collect();
        let graph = DependencyGraph::build(&specs, mode);
        let layers = graph.layers();
        Self {
            handlers: handlers
                .into_iter()
                .map(|h| (h.name().to_string(), h))
                .collect(),
            graph,
            layers,
            store,
            registry,
            clients,
            common,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Execute one batch. On success the caller advances the engine
    /// checkpoint to `batch.to`.
    pub async fn process_batch(&self, batch: &EventBatch) -> Result<(), BatchError> {
        let mut per_handler: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        let mut unclaimed = 0usize;
        for log_event in &batch.events {
            let Some((contract, event_name, network)) = self.registry.label(&log_event.log) else {
                unclaimed += 1;
                continue;
            };
            let handler_name = format!("{contract}:{event_name}");
            if !self.handlers.contains_key(&handler_name) {
                unclaimed += 1;
                continue;
            }
            let event = Event {
                contract: contract.to_string(),
                name: event_name.to_string(),
                network: NetworkInfo {
                    name: network.to_string(),
                    chain_id: log_event.log.chain_id,
                },
                checkpoint: log_event.checkpoint(),
                log: log_event.log.clone(),
                block: log_event.block.clone(),
                transaction: log_event.transaction.clone(),
                receipt: log_event.receipt.clone(),
            };
            per_handler.entry(handler_name).or_default().push(event);
        }
        if unclaimed > 0 {
            debug!("{unclaimed} events in batch had no registered handler");
        }
        if per_handler.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.common.options.max_concurrency.max(1)));
        for layer in &self.layers {
            let mut join_set: JoinSet<Result<(), (String, anyhow::Error)>> = JoinSet::new();
            for handler_name in layer {
                let Some(events) = per_handler.remove(handler_name) else {
                    continue;
                };
                let handler = self.handlers[handler_name].clone();
                let store = self.store.clone();
                let clients = self.clients.clone();
                let metrics = self.common.metrics.clone();
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                join_set.spawn(async move {
                    let _permit = permit;
                    // Events run in checkpoint order; a self-looping handler
                    // is thereby serialized per instance.
                    for event in events {
                        let context = Context {
                            db: ContextDb::new(store.clone(), event.checkpoint),
                            client: clients
                                .get(&event.network.chain_id)
                                .map(|(_, client)| client.clone()),
                            network: event.network.clone(),
                        };
                        metrics
                            .events_processed
                            .with_label_values(&[handler.name()])
                            .inc();
                        if let Err(e) = handler.invoke(event, context).await {
                            metrics
                                .handler_errors
                                .with_label_values(&[handler.name()])
                                .inc();
                            return Err((handler.name().to_string(), e));
                        }
                    }
                    Ok(())
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let result = joined.map_err(|e| {
                    BatchError::Fatal(PonderError::Database(format!("handler task panicked: {e}")))
                })?;
                if let Err((handler, cause)) = result {
                    join_set.abort_all();
                    return Err(classify(handler, cause));
                }
            }
        }
        Ok(())
    }
}

fn classify(handler: String, cause: anyhow::Error) -> BatchError {
    match cause.downcast_ref::<PonderError>() {
        // Bad writes against the schema point at broken handler code the
        // host cannot hot-fix mid-batch.
        Some(e @ PonderError::SchemaViolation(_)) | Some(e @ PonderError::Database(_)) => {
            error!("[{handler}] fatal store error: {e}");
            BatchError::Fatal(e.clone())
        }
        _ => {
            warn!("[{handler}] handler error: {cause:#}");
            BatchError::Reloadable(PonderError::UserHandler {
                handler,
                message: format!("{cause:#}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::handler::FnHandler;
    use crate::indexing_store::{create_table_ddl, revert_log_ddl, Update};
    use crate::schema::{Row, Scalar, Schema, SchemaBuilder, Value};
    use crate::sources::build_sources;
    use crate::sync::types::tests_support::{block_at, log_at, transaction_at};
    use crate::sync::types::LogEvent;
    use ethers::types::{Address, H256};
    use std::collections::BTreeMap as StdBTreeMap;
    use std::sync::Mutex;

    fn schema() -> Schema {
        SchemaBuilder::default()
            .table("A", |t| t.id(Scalar::String).column("count", Scalar::Int))
            .table("B", |t| t.id(Scalar::String).column("count", Scalar::Int))
            .table("C", |t| t.id(Scalar::String).column("count", Scalar::Int))
            .build()
            .unwrap()
    }

    async fn test_store(schema: &Schema) -> IndexingStore {
        let db = ponder_db::Db::sqlite_in_memory(None).await.unwrap();
        let mut tables = StdBTreeMap::new();
        for (name, table) in &schema.tables {
            let physical = format!("\"live_{name}\"");
            db.execute(&create_table_ddl(db.kind(), schema, table, &physical), &[])
                .await
                .unwrap();
            tables.insert(name.clone(), physical);
        }
        db.execute(&revert_log_ddl(db.kind(), "\"revert_log\""), &[])
            .await
            .unwrap();
        IndexingStore::new(
            db,
            schema.clone(),
            tables,
            "\"revert_log\"".to_string(),
            &Common::for_testing(),
        )
    }

    fn registry_for(events: &[(&str, H256)]) -> SourceRegistry {
        use crate::config::{DatabaseConfig, NetworkConfig, PonderConfig};
        let config = PonderConfig {
            networks: vec![NetworkConfig {
                name: "testnet".to_string(),
                chain_id: 1,
                transport: "http://localhost:8545".to_string(),
                polling_interval_ms: None,
                max_requests_per_second: None,
                max_concurrent_requests: None,
            }],
            contracts: vec![crate::config::ContractConfig {
                name: "App".to_string(),
                network: "testnet".to_string(),
                address: Some(vec![format!("{:?}", Address::repeat_byte(0xaa))]),
                factory: None,
                start_block: 0,
                end_block: None,
                filter: None,
                include_transaction_receipts: false,
                event_names: events
                    .iter()
                    .map(|(name, topic)| (format!("{topic:?}"), name.to_string()))
                    .collect(),
            }],
            database: DatabaseConfig::Sqlite {
                directory: "/tmp".into(),
            },
            options: None,
        };
        build_sources(&config).unwrap().registry
    }

    fn batch(events: Vec<(H256, u64)>) -> EventBatch {
        // (topic0, checkpoint seed); one log per entry.
        let block = block_at(1, 100, 1_000);
        let tx = transaction_at(1, &block, 0);
        let events: Vec<LogEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, (topic, seed))| {
                let mut log = log_at(1, &block, &tx, i as u64, 1_000);
                log.topic0 = Some(topic);
                log.checkpoint = Checkpoint {
                    block_timestamp: seed,
                    chain_id: 1,
                    block_number: 100,
                    transaction_index: 0,
                    event_index: i as u64,
                };
                LogEvent {
                    log,
                    block: block.clone(),
                    transaction: tx.clone(),
                    receipt: None,
                }
            })
            .collect();
        EventBatch {
            from: Checkpoint::ZERO,
            to: Checkpoint::MAX,
            events,
        }
    }

    fn tracing_handler(
        name: &str,
        reads: &[&str],
        writes: &[&str],
        trace: Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn IndexingFunction> {
        let handler_name = name.to_string();
        Arc::new(FnHandler::new(
            name,
            reads.iter().copied(),
            writes.iter().copied(),
            move |event, _context| {
                let trace = trace.clone();
                let handler_name = handler_name.clone();
                Box::pin(async move {
                    // A suspension point so concurrent handlers interleave.
                    tokio::task::yield_now().await;
                    trace
                        .lock()
                        .unwrap()
                        .push(format!("{handler_name}@{}", event.checkpoint.block_timestamp));
                    Ok(())
                })
            },
        ))
    }

    fn deposit_topic() -> H256 {
        H256::repeat_byte(0x01)
    }

    fn burn_topic() -> H256 {
        H256::repeat_byte(0x02)
    }

    fn withdraw_topic() -> H256 {
        H256::repeat_byte(0x03)
    }

    fn farm_topic() -> H256 {
        H256::repeat_byte(0x04)
    }

    fn seed_registry() -> SourceRegistry {
        registry_for(&[
            ("Deposit", deposit_topic()),
            ("Burn", burn_topic()),
            ("Withdraw", withdraw_topic()),
            ("Farm", farm_topic()),
        ])
    }

    #[tokio::test]
    async fn test_dag_ordering_deposits_before_burns() {
        telemetry_subscribers::init_for_testing();
        let schema = schema();
        let store = test_store(&schema).await;
        let trace = Arc::new(Mutex::new(Vec::new()));
        let handlers: Vec<Arc<dyn IndexingFunction>> = vec![
            tracing_handler("App:Deposit", &[], &["A"], trace.clone()),
            tracing_handler("App:Burn", &["A"], &["B"], trace.clone()),
            tracing_handler("App:Withdraw", &["A"], &["A"], trace.clone()),
            tracing_handler("App:Farm", &["C"], &["C"], trace.clone()),
        ];
        let scheduler = Scheduler::new(
            handlers,
            ConcurrencyMode::Dag,
            store,
            seed_registry(),
            HashMap::new(),
            Common::for_testing(),
        );

        let batch = batch(vec![
            (deposit_topic(), 10),
            (burn_topic(), 20),
            (deposit_topic(), 30),
            (farm_topic(), 40),
            (burn_topic(), 50),
            (withdraw_topic(), 60),
        ]);
        scheduler.process_batch(&batch).await.unwrap();

        let trace = trace.lock().unwrap().clone();
        // Every Deposit completes before any Burn or Withdraw starts.
        let last_deposit = trace
            .iter()
            .rposition(|t| t.starts_with("App:Deposit"))
            .unwrap();
        let first_burn = trace
            .iter()
            .position(|t| t.starts_with("App:Burn"))
            .unwrap();
        let first_withdraw = trace
            .iter()
            .position(|t| t.starts_with("App:Withdraw"))
            .unwrap();
        assert!(last_deposit < first_burn);
        assert!(last_deposit < first_withdraw);

        // Per-handler event order is checkpoint order.
        let burns: Vec<&String> = trace.iter().filter(|t| t.starts_with("App:Burn")).collect();
        assert_eq!(burns, vec!["App:Burn@20", "App:Burn@50"]);
    }

    #[tokio::test]
    async fn test_handler_effects_are_visible_downstream() {
        telemetry_subscribers::init_for_testing();
        let schema = schema();
        let store = test_store(&schema).await;
        // Deposit writes a counter row in A; Burn copies it into B.
        let deposit: Arc<dyn IndexingFunction> = Arc::new(FnHandler::new(
            "App:Deposit",
            Vec::<String>::new(),
            ["A"],
            |_event, context| {
                Box::pin(async move {
                    context
                        .db
                        .upsert(
                            "A",
                            Value::String("acc".to_string()),
                            Row::from([("count".to_string(), Value::Int(1))]),
                            Update::With(Box::new(|row| {
                                let count = match row.get("count") {
                                    Some(Value::Int(v)) => *v,
                                    _ => 0,
                                };
                                Row::from([("count".to_string(), Value::Int(count + 1))])
                            })),
                        )
                        .await?;
                    Ok(())
                })
            },
        ));
        let burn: Arc<dyn IndexingFunction> = Arc::new(FnHandler::new(
            "App:Burn",
            ["A"],
            ["B"],
            |event, context| {
                Box::pin(async move {
                    let observed = context
                        .db
                        .find_unique("A", &Value::String("acc".to_string()))
                        .await?
                        .and_then(|row| match row.get("count") {
                            Some(Value::Int(v)) => Some(*v),
                            _ => None,
                        })
                        .unwrap_or(0);
                    context
                        .db
                        .create(
                            "B",
                            Value::String(format!("burn{}", event.checkpoint.block_timestamp)),
                            Row::from([("count".to_string(), Value::Int(observed))]),
                        )
                        .await?;
                    Ok(())
                })
            },
        ));
        let scheduler = Scheduler::new(
            vec![deposit, burn],
            ConcurrencyMode::Dag,
            store.clone(),
            seed_registry(),
            HashMap::new(),
            Common::for_testing(),
        );

        let batch = batch(vec![(deposit_topic(), 10), (deposit_topic(), 20), (burn_topic(), 30)]);
        scheduler.process_batch(&batch).await.unwrap();

        // Burn observed both deposits.
        let row = store
            .find_unique("B", &Value::String("burn30".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("count"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_user_error_is_reloadable() {
        telemetry_subscribers::init_for_testing();
        let schema = schema();
        let store = test_store(&schema).await;
        let failing: Arc<dyn IndexingFunction> = Arc::new(FnHandler::new(
            "App:Deposit",
            Vec::<String>::new(),
            ["A"],
            |_event, _context| Box::pin(async { anyhow::bail!("user bug") }),
        ));
        let scheduler = Scheduler::new(
            vec![failing],
            ConcurrencyMode::Dag,
            store,
            seed_registry(),
            HashMap::new(),
            Common::for_testing(),
        );
        let err = scheduler
            .process_batch(&batch(vec![(deposit_topic(), 10)]))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Reloadable(_)));
        assert!(matches!(err.error(), PonderError::UserHandler { .. }));
    }

    #[tokio::test]
    async fn test_schema_violation_is_fatal() {
        telemetry_subscribers::init_for_testing();
        let schema = schema();
        let store = test_store(&schema).await;
        let bad_writer: Arc<dyn IndexingFunction> = Arc::new(FnHandler::new(
            "App:Deposit",
            Vec::<String>::new(),
            ["A"],
            |_event, context| {
                Box::pin(async move {
                    // Wrong value type for the count column.
                    context
                        .db
                        .create(
                            "A",
                            Value::String("x".to_string()),
                            Row::from([(
                                "count".to_string(),
                                Value::String("not an int".to_string()),
                            )]),
                        )
                        .await?;
                    Ok(())
                })
            },
        ));
        let scheduler = Scheduler::new(
            vec![bad_writer],
            ConcurrencyMode::Dag,
            store,
            seed_registry(),
            HashMap::new(),
            Common::for_testing(),
        );
        let err = scheduler
            .process_batch(&batch(vec![(deposit_topic(), 10)]))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_events_without_handlers_are_skipped() {
        telemetry_subscribers::init_for_testing();
        let schema = schema();
        let store = test_store(&schema).await;
        let scheduler = Scheduler::new(
            vec![],
            ConcurrencyMode::Dag,
            store,
            seed_registry(),
            HashMap::new(),
            Common::for_testing(),
        );
        // No handlers registered: the batch is a no-op, not an error.
        scheduler
            .process_batch(&batch(vec![(deposit_topic(), 10)]))
            .await
            .unwrap();
    }
}
