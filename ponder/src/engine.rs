// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Composition root.
//!
//! `Engine::run` performs the initial build (sources, build id, schema),
//! acquires the namespace, provisions live tables, then spawns per-network
//! historical and realtime sync tasks and drives the stream → scheduler loop
//! until killed or until an error decides otherwise. Error routing follows
//! the taxonomy: user handler errors end the run as reloadable (the host is
//! expected to hot-reload and start a new engine), schema and database
//! errors are fatal, reorgs are absorbed by prune + revert + replay.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::build_id::{build_id, HandlerSource};
use crate::checkpoint::Checkpoint;
use crate::common::{Clock, Common};
use crate::config::{DatabaseConfig, PonderConfig};
use crate::database::{DatabaseService, SetupOutput};
use crate::error::{PonderError, PonderResult};
use crate::graph::ConcurrencyMode;
use crate::handler::{ContractReader, IndexingFunction};
use crate::rpc::{ChainClient, RequestQueue};
use crate::scheduler::{BatchError, Scheduler};
use crate::schema::Schema;
use crate::sources::{build_sources, Sources};
use crate::stream::EventStream;
use crate::sync::historical::{HistoricalSource, HistoricalSync};
use crate::sync::realtime::RealtimeSync;
use crate::sync::store::SyncStore;
use crate::sync::SyncEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Clean,
    FatalError,
    IndexingError,
    FailedBuild,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Clean => "Received shutdown signal",
            ShutdownReason::FatalError => "Received fatal error",
            ShutdownReason::IndexingError => "Encountered indexing error",
            ShutdownReason::FailedBuild => "Failed initial build",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Clean => 0,
            _ => 1,
        }
    }
}

/// Which sync task produced an event; realtime progress is gated on
/// historical completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Historical,
    Realtime,
}

struct NetworkRuntime {
    name: String,
    historical_done: bool,
    /// Whether a realtime task follows the head for this network. Bounded
    /// sources that end below the tip have none; their finality comes from
    /// historical completion instead.
    has_realtime: bool,
    /// Latest realtime progress buffered until historical completes.
    buffered: Option<Checkpoint>,
    safe_tx: watch::Sender<Checkpoint>,
    finalized: Option<Checkpoint>,
}

pub struct Engine {
    common: Common,
    config: PonderConfig,
    schema: Schema,
    handlers: Vec<Arc<dyn IndexingFunction>>,
    handler_sources: Vec<HandlerSource>,
    mode: ConcurrencyMode,
    clock: Clock,
    injected_db: Option<ponder_db::Db>,
    injected_clients: HashMap<String, Arc<dyn ChainClient>>,
}

impl Engine {
    pub fn new(
        config: PonderConfig,
        schema: Schema,
        handlers: Vec<Arc<dyn IndexingFunction>>,
        handler_sources: Vec<HandlerSource>,
        mode: ConcurrencyMode,
        common: Common,
    ) -> Self {
        Self {
            common,
            config,
            schema,
            handlers,
            handler_sources,
            mode,
            clock: Clock::system(),
            injected_db: None,
            injected_clients: HashMap::new(),
        }
    }

    /// Use an existing database handle instead of opening one from config.
    pub fn with_database(mut self, db: ponder_db::Db) -> Self {
        self.injected_db = Some(db);
        self
    }

    /// Use a pre-built chain client for a network (tests, custom transports).
    pub fn with_client(mut self, network: &str, client: Arc<dyn ChainClient>) -> Self {
        self.injected_clients.insert(network.to_string(), client);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run until `cancel` fires or an error ends the run. The returned
    /// reason maps to the process exit code.
    pub async fn run(self, cancel: CancellationToken) -> ShutdownReason {
        match self.run_inner(cancel).await {
            Ok(reason) => {
                info!("Shutting down: {}", reason.as_str());
                reason
            }
            Err(e) => {
                let reason = if e.is_fatal() {
                    ShutdownReason::FatalError
                } else {
                    ShutdownReason::FailedBuild
                };
                error!("Shutting down: {} ({e})", reason.as_str());
                reason
            }
        }
    }

    async fn run_inner(self, cancel: CancellationToken) -> PonderResult<ShutdownReason> {
        // ---- Initial build ------------------------------------------------
        let (sources, id) = match self.initial_build() {
            Ok(build) => build,
            Err(e) => {
                error!("Initial build failed: {e}");
                return Ok(ShutdownReason::FailedBuild);
            }
        };
        info!("Build id {id}");

        // ---- Storage ------------------------------------------------------
        let db = match self.injected_db.clone() {
            Some(db) => db,
            None => open_database(&self.config).await?,
        };
        let sync_store = SyncStore::new(db.clone(), &self.common);
        sync_store.migrate().await?;
        let database = Arc::new(
            DatabaseService::new(
                db.clone(),
                self.config.user_namespace(),
                self.clock.clone(),
                self.common.clone(),
            )
            .await?,
        );
        let SetupOutput {
            store,
            checkpoint: resume_from,
        } = database.setup(&self.schema, &id).await?;

        let children = cancel.child_token();
        let heartbeat = database.spawn_heartbeat(children.clone());

        // ---- Per-network sync --------------------------------------------
        let (tagged_tx, mut events_rx) = mpsc::channel::<(Origin, SyncEvent)>(256);
        let mut networks: HashMap<u64, NetworkRuntime> = HashMap::new();
        let mut safe_rxs: HashMap<u64, watch::Receiver<Checkpoint>> = HashMap::new();
        let mut clients: HashMap<u64, (String, Arc<ContractReader>)> = HashMap::new();
        let mut tasks = Vec::new();

        for network in &self.config.networks {
            let (filters, factories) = sources.for_chain(network.chain_id);
            if filters.is_empty() && factories.is_empty() {
                continue;
            }
            let client: Arc<dyn ChainClient> = match self.injected_clients.get(&network.name) {
                Some(client) => client.clone(),
                None => {
                    let queue = RequestQueue::from_config(network, &self.common)?;
                    queue.validate_chain_id().await?;
                    Arc::new(queue)
                }
            };
            let latest = client.latest_block().await?;
            let latest_number = latest
                .number
                .ok_or_else(|| {
                    PonderError::InvalidChainResponse("latest block without number".to_string())
                })?
                .as_u64();

            let historical_sources: Vec<HistoricalSource> = filters
                .iter()
                .map(|f| HistoricalSource::LogFilter {
                    spec: f.spec.clone(),
                    start_block: f.start_block,
                    end_block: f.end_block.unwrap_or(latest_number).min(latest_number),
                })
                .chain(factories.iter().map(|f| HistoricalSource::Factory {
                    spec: f.spec.clone(),
                    start_block: f.start_block,
                    end_block: f.end_block.unwrap_or(latest_number).min(latest_number),
                }))
                .collect();

            let (sync_tx, sync_rx) = mpsc::channel::<SyncEvent>(64);
            tasks.push(spawn_forwarder(sync_rx, tagged_tx.clone(), Origin::Historical));
            let historical = Arc::new(HistoricalSync::new(
                network.name.clone(),
                network.chain_id,
                client.clone(),
                sync_store.clone(),
                historical_sources,
                self.common.clone(),
                sync_tx,
            ));
            tasks.push(tokio::spawn({
                let children = children.clone();
                async move { historical.run(children).await }
            }));

            // Realtime is pointless when every source ends below the tip.
            let ends_before_tip = filters
                .iter()
                .map(|f| f.end_block)
                .chain(factories.iter().map(|f| f.end_block))
                .all(|end| end.map(|e| e < latest_number).unwrap_or(false));
            if !ends_before_tip {
                let (rt_tx, rt_rx) = mpsc::channel::<SyncEvent>(64);
                tasks.push(spawn_forwarder(rt_rx, tagged_tx.clone(), Origin::Realtime));
                let mut realtime = RealtimeSync::new(
                    network.name.clone(),
                    network.chain_id,
                    client.clone(),
                    sync_store.clone(),
                    filters.iter().map(|f| f.spec.clone()).collect(),
                    factories.iter().map(|f| f.spec.clone()).collect(),
                    self.common.clone(),
                    rt_tx,
                );
                realtime.seed(latest_number).await?;
                tasks.push(tokio::spawn({
                    let children = children.clone();
                    async move { realtime.run(children).await }
                }));
            }

            let (safe_tx, safe_rx) = watch::channel(resume_from);
            networks.insert(
                network.chain_id,
                NetworkRuntime {
                    name: network.name.clone(),
                    historical_done: false,
                    has_realtime: !ends_before_tip,
                    buffered: None,
                    safe_tx,
                    finalized: None,
                },
            );
            safe_rxs.insert(network.chain_id, safe_rx);
            clients.insert(
                network.chain_id,
                (
                    network.name.clone(),
                    Arc::new(ContractReader::new(
                        client.clone(),
                        sync_store.clone(),
                        network.chain_id,
                    )),
                ),
            );
        }

        // ---- Stream and scheduler ----------------------------------------
        let mut stream = EventStream::new(
            sync_store.clone(),
            sources.filters.iter().map(|f| f.spec.clone()).collect(),
            sources.factories.iter().map(|f| f.spec.clone()).collect(),
            resume_from,
            safe_rxs,
            self.common.options.events_page_size,
        );
        let scheduler = Scheduler::new(
            self.handlers.clone(),
            self.mode,
            store.clone(),
            sources.registry.clone(),
            clients,
            self.common.clone(),
        );

        let mut engine_checkpoint = resume_from;
        let mut promoted = resume_from;

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ShutdownReason::Clean,
                Some((origin, event)) = events_rx.recv() => {
                    match self.handle_sync_event(
                        origin,
                        event,
                        &mut networks,
                        &store,
                        &mut stream,
                        &mut engine_checkpoint,
                    ).await {
                        Ok(None) => {}
                        Ok(Some(reason)) => break reason,
                        Err(e) => {
                            error!("Sync event handling failed: {e}");
                            break ShutdownReason::FatalError;
                        }
                    }
                    if let Err(e) = maybe_promote(
                        &database, &store, &id, &networks, engine_checkpoint, &mut promoted,
                    ).await {
                        error!("Cache promotion failed: {e}");
                        break ShutdownReason::FatalError;
                    }
                }
                batch = stream.next_batch() => {
                    match batch {
                        Ok(Some(batch)) => {
                            match scheduler.process_batch(&batch).await {
                                Ok(()) => {
                                    engine_checkpoint = batch.to;
                                    if let Err(e) = maybe_promote(
                                        &database, &store, &id, &networks,
                                        engine_checkpoint, &mut promoted,
                                    ).await {
                                        error!("Cache promotion failed: {e}");
                                        break ShutdownReason::FatalError;
                                    }
                                }
                                Err(BatchError::Reloadable(e)) => {
                                    warn!("Batch aborted: {e}");
                                    break ShutdownReason::IndexingError;
                                }
                                Err(BatchError::Fatal(e)) => {
                                    error!("Batch failed fatally: {e}");
                                    break ShutdownReason::FatalError;
                                }
                            }
                        }
                        Ok(None) => break ShutdownReason::Clean,
                        Err(e) => {
                            error!("Event stream failed: {e}");
                            break ShutdownReason::FatalError;
                        }
                    }
                }
            }
        };

        // ---- Shutdown -----------------------------------------------------
        stream.kill();
        children.cancel();
        let final_promotion = global_finalized(&networks)
            .map(|f| f.min(engine_checkpoint))
            .unwrap_or(promoted);
        if let Err(e) = database.kill(&store, &id, &final_promotion).await {
            warn!("Shutdown flush failed: {e}");
        }
        for task in tasks {
            task.abort();
        }
        heartbeat.abort();
        Ok(reason)
    }

    /// Validate the schema and config and derive the build id. Failures here
    /// are build failures, not runtime errors.
    fn initial_build(&self) -> PonderResult<(Sources, String)> {
        self.schema.validate()?;
        let sources = build_sources(&self.config)?;
        if sources.filters.is_empty() && sources.factories.is_empty() {
            return Err(PonderError::InvalidConfig(
                "no contracts configured".to_string(),
            ));
        }
        let id = build_id(&self.config, &self.schema, &self.handler_sources);
        Ok((sources, id))
    }

    async fn handle_sync_event(
        &self,
        origin: Origin,
        event: SyncEvent,
        networks: &mut HashMap<u64, NetworkRuntime>,
        store: &crate::indexing_store::IndexingStore,
        stream: &mut EventStream,
        engine_checkpoint: &mut Checkpoint,
    ) -> PonderResult<Option<ShutdownReason>> {
        let chain_id = event.chain_id();
        let Some(net) = networks.get_mut(&chain_id) else {
            return Ok(None);
        };
        match event {
            SyncEvent::Progress { checkpoint, .. } => match origin {
                Origin::Historical => {
                    net.safe_tx.send_replace(checkpoint);
                }
                Origin::Realtime if net.historical_done => {
                    net.safe_tx.send_replace(checkpoint);
                }
                Origin::Realtime => net.buffered = Some(checkpoint),
            },
            SyncEvent::HistoricalComplete { .. } => {
                info!("[{}] Historical sync caught up", net.name);
                net.historical_done = true;
                if let Some(checkpoint) = net.buffered.take() {
                    net.safe_tx.send_replace(checkpoint);
                }
                // A network whose sources all end below the tip never runs
                // realtime, so no FinalizedAdvanced ever arrives for it.
                // Its entire bounded range is deep history: treat the
                // completed range as finalized so promotion can progress.
                if !net.has_realtime {
                    let completed = *net.safe_tx.borrow();
                    net.finalized = Some(match net.finalized {
                        Some(current) => current.max(completed),
                        None => completed,
                    });
                }
            }
            SyncEvent::Reorg {
                ancestor_block,
                checkpoint,
                ..
            } => {
                warn!(
                    "[{}] Rolling indexing back to block {ancestor_block}",
                    net.name
                );
                store.revert(&checkpoint).await?;
                stream.reset(checkpoint);
                net.safe_tx.send_replace(checkpoint);
                if *engine_checkpoint > checkpoint {
                    *engine_checkpoint = checkpoint;
                }
            }
            SyncEvent::FinalizedAdvanced { checkpoint, .. } => {
                net.finalized = Some(match net.finalized {
                    Some(current) => current.max(checkpoint),
                    None => checkpoint,
                });
            }
            SyncEvent::Stalled { .. } => {
                warn!("[{}] Network stalled", net.name);
            }
            SyncEvent::Recovered { .. } => {
                info!("[{}] Network recovered", net.name);
            }
            SyncEvent::Fatal { error, .. } => {
                error!("[{}] Sync failed: {error}", net.name);
                return Ok(Some(ShutdownReason::FatalError));
            }
        }
        Ok(None)
    }
}

fn spawn_forwarder(
    mut rx: mpsc::Receiver<SyncEvent>,
    tx: mpsc::Sender<(Origin, SyncEvent)>,
    origin: Origin,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if tx.send((origin, event)).await.is_err() {
                break;
            }
        }
    })
}

fn global_finalized(networks: &HashMap<u64, NetworkRuntime>) -> Option<Checkpoint> {
    networks
        .values()
        .map(|n| n.finalized)
        .collect::<Option<Vec<_>>>()
        .and_then(|f| f.into_iter().min())
}

/// Promote once every network has finalized past the last promotion, never
/// past what has actually been indexed.
async fn maybe_promote(
    database: &Arc<DatabaseService>,
    store: &crate::indexing_store::IndexingStore,
    build_id: &str,
    networks: &HashMap<u64, NetworkRuntime>,
    engine_checkpoint: Checkpoint,
    promoted: &mut Checkpoint,
) -> PonderResult<()> {
    let Some(finalized) = global_finalized(networks) else {
        return Ok(());
    };
    let candidate = finalized.min(engine_checkpoint);
    if candidate > *promoted {
        database.promote(store, build_id, &candidate).await?;
        *promoted = candidate;
    }
    Ok(())
}

async fn open_database(config: &PonderConfig) -> PonderResult<ponder_db::Db> {
    match &config.database {
        DatabaseConfig::Sqlite { directory } => Ok(ponder_db::Db::sqlite(
            directory.join("ponder.db"),
            Some((directory.join("ponder_cache.db"), "ponder_cache".to_string())),
            ponder_db::DbArgs::default(),
        )
        .await?),
        DatabaseConfig::Postgres {
            connection_string, ..
        } => Ok(ponder_db::Db::postgres(connection_string, ponder_db::DbArgs::default()).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContractConfig, DatabaseConfig, NetworkConfig};
    use crate::handler::FnHandler;
    use crate::schema::{Row, Scalar, SchemaBuilder, Value};
    use crate::sync::test_chain::TestChain;
    use ethers::types::{Address, H256};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_shutdown_reasons() {
        assert_eq!(ShutdownReason::Clean.exit_code(), 0);
        assert_eq!(ShutdownReason::FatalError.exit_code(), 1);
        assert_eq!(ShutdownReason::FatalError.as_str(), "Received fatal error");
        assert_eq!(
            ShutdownReason::IndexingError.as_str(),
            "Encountered indexing error"
        );
        assert_eq!(ShutdownReason::FailedBuild.as_str(), "Failed initial build");
    }

    fn test_config() -> PonderConfig {
        PonderConfig {
            networks: vec![NetworkConfig {
                name: "testnet".to_string(),
                chain_id: 1,
                transport: "http://localhost:8545".to_string(),
                polling_interval_ms: None,
                max_requests_per_second: None,
                max_concurrent_requests: None,
            }],
            contracts: vec![ContractConfig {
                name: "Token".to_string(),
                network: "testnet".to_string(),
                address: Some(vec![format!("{:?}", Address::repeat_byte(0xaa))]),
                factory: None,
                start_block: 0,
                end_block: None,
                filter: None,
                include_transaction_receipts: false,
                event_names: BTreeMap::from([(
                    format!("{:?}", H256::repeat_byte(0x11)),
                    "Transfer".to_string(),
                )]),
            }],
            database: DatabaseConfig::Sqlite {
                directory: "/tmp/unused".into(),
            },
            options: None,
        }
    }

    fn transfer_schema() -> Schema {
        SchemaBuilder::default()
            .table("Transfer", |t| {
                t.id(Scalar::String).column("block", Scalar::Int)
            })
            .build()
            .unwrap()
    }

    fn transfer_handler() -> Arc<dyn IndexingFunction> {
        Arc::new(FnHandler::new(
            "Token:Transfer",
            Vec::<String>::new(),
            ["Transfer"],
            |event, context| {
                Box::pin(async move {
                    context
                        .db
                        .create(
                            "Transfer",
                            Value::String(event.log.id.clone()),
                            Row::from([(
                                "block".to_string(),
                                Value::Int(event.block.number as i64),
                            )]),
                        )
                        .await?;
                    Ok(())
                })
            },
        ))
    }

    fn fast_common() -> Common {
        let mut options = crate::config::Options::default();
        options.polling_interval_ms = 25;
        options.finality_block_count = 2;
        options.max_block_range = 5;
        Common::new(options, &prometheus::Registry::new())
    }

    #[tokio::test]
    async fn test_engine_indexes_historical_and_realtime_events() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 10));
        chain.add_log(3, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);

        let db = ponder_db::Db::sqlite_in_memory(Some("ponder_cache"))
            .await
            .unwrap();
        let common = fast_common();
        let engine = Engine::new(
            test_config(),
            transfer_schema(),
            vec![transfer_handler()],
            vec![HandlerSource {
                name: "Token:Transfer".to_string(),
                source: "create Transfer row".to_string(),
                upstream: vec![],
            }],
            ConcurrencyMode::Dag,
            common.clone(),
        )
        .with_database(db.clone())
        .with_client("testnet", chain.clone() as Arc<dyn ChainClient>);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        // The historical log lands first.
        let store_probe = async {
            loop {
                let rows = db
                    .fetch_all(
                        "SELECT name FROM sqlite_master WHERE type = 'view' AND name = 'Transfer'",
                        &[],
                        &[ponder_db::SqlType::Text],
                    )
                    .await
                    .unwrap();
                if !rows.is_empty() {
                    let count = db
                        .fetch_all(
                            "SELECT block FROM \"Transfer\"",
                            &[],
                            &[ponder_db::SqlType::Integer],
                        )
                        .await
                        .unwrap();
                    if !count.is_empty() {
                        break count;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        let rows = tokio::time::timeout(Duration::from_secs(10), store_probe)
            .await
            .expect("historical event was never indexed");
        assert_eq!(rows[0][0], ponder_db::SqlValue::Integer(3));

        // A new head with a log flows through realtime sync.
        chain.push_block();
        chain.add_log(10, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);
        let realtime_probe = async {
            loop {
                let rows = db
                    .fetch_all(
                        "SELECT block FROM \"Transfer\" ORDER BY block",
                        &[],
                        &[ponder_db::SqlType::Integer],
                    )
                    .await
                    .unwrap();
                if rows.len() == 2 {
                    break rows;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        let rows = tokio::time::timeout(Duration::from_secs(10), realtime_probe)
            .await
            .expect("realtime event was never indexed");
        assert_eq!(rows[1][0], ponder_db::SqlValue::Integer(10));

        cancel.cancel();
        let reason = handle.await.unwrap();
        assert_eq!(reason, ShutdownReason::Clean);

        // The lock is released on shutdown.
        let lock = db
            .fetch_optional(
                "SELECT is_locked FROM \"namespace_lock\" WHERE namespace = 'public'",
                &[],
                &[ponder_db::SqlType::Integer],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock[0], ponder_db::SqlValue::Integer(0));
    }

    #[tokio::test]
    async fn test_engine_promotes_historical_only_network() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 10));
        chain.add_log(3, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);

        // Every source ends below the tip: no realtime task, so finality
        // must come from historical completion.
        let mut config = test_config();
        config.contracts[0].end_block = Some(5);

        let db = ponder_db::Db::sqlite_in_memory(Some("ponder_cache"))
            .await
            .unwrap();
        let engine = Engine::new(
            config,
            transfer_schema(),
            vec![transfer_handler()],
            vec![],
            ConcurrencyMode::Dag,
            fast_common(),
        )
        .with_database(db.clone())
        .with_client("testnet", chain as Arc<dyn ChainClient>);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        // The bounded range finalizes once the backfill completes, which
        // must advance the persisted checkpoint and flush the cache.
        let promoted = async {
            loop {
                let row = db
                    .fetch_optional(
                        "SELECT finalized_checkpoint FROM \"namespace_lock\"
                         WHERE namespace = 'public'",
                        &[],
                        &[ponder_db::SqlType::Text],
                    )
                    .await
                    .unwrap();
                if let Some(row) = row {
                    if let Some(encoded) = row[0].as_text() {
                        if encoded != Checkpoint::ZERO.encode() {
                            break Checkpoint::decode(encoded).unwrap();
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        let finalized = tokio::time::timeout(Duration::from_secs(10), promoted)
            .await
            .expect("finalized checkpoint never advanced");
        assert_eq!(finalized.block_number, 5);

        let cache_rows = db
            .fetch_all(
                "SELECT table_name, checkpoint FROM ponder_cache.\"ponder_cache_registry\"",
                &[],
                &[ponder_db::SqlType::Text, ponder_db::SqlType::Text],
            )
            .await
            .unwrap();
        assert!(
            cache_rows
                .iter()
                .any(|r| r[0].as_text() == Some("Transfer")),
            "expected the Transfer table to be demoted to the cache"
        );

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), ShutdownReason::Clean);
    }

    #[tokio::test]
    async fn test_engine_reorg_undoes_indexed_rows() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 10));
        let db = ponder_db::Db::sqlite_in_memory(Some("ponder_cache"))
            .await
            .unwrap();
        let engine = Engine::new(
            test_config(),
            transfer_schema(),
            vec![transfer_handler()],
            vec![],
            ConcurrencyMode::Dag,
            fast_common(),
        )
        .with_database(db.clone())
        .with_client("testnet", chain.clone() as Arc<dyn ChainClient>);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        // Two new heads; the second carries a log that gets indexed.
        chain.push_block();
        chain.push_block();
        chain.add_log(11, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);
        let indexed = async {
            loop {
                let rows = db
                    .fetch_all(
                        "SELECT name FROM sqlite_master WHERE type = 'view' AND name = 'Transfer'",
                        &[],
                        &[ponder_db::SqlType::Text],
                    )
                    .await
                    .unwrap();
                if !rows.is_empty() {
                    let rows = db
                        .fetch_all(
                            "SELECT block FROM \"Transfer\"",
                            &[],
                            &[ponder_db::SqlType::Integer],
                        )
                        .await
                        .unwrap();
                    if !rows.is_empty() {
                        break rows;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        let rows = tokio::time::timeout(Duration::from_secs(10), indexed)
            .await
            .expect("event was never indexed");
        assert_eq!(rows[0][0], ponder_db::SqlValue::Integer(11));

        // Reorg out block 11; the canonical branch carries no log, so the
        // indexed row must be rolled back.
        chain.reorg(10, 3);
        let reverted = async {
            loop {
                let rows = db
                    .fetch_all(
                        "SELECT block FROM \"Transfer\"",
                        &[],
                        &[ponder_db::SqlType::Integer],
                    )
                    .await
                    .unwrap();
                if rows.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), reverted)
            .await
            .expect("indexed row survived the reorg");

        cancel.cancel();
        let reason = handle.await.unwrap();
        assert_eq!(reason, ShutdownReason::Clean);
    }

    #[tokio::test]
    async fn test_engine_fails_build_on_bad_config() {
        telemetry_subscribers::init_for_testing();
        let mut config = test_config();
        config.contracts[0].network = "unknown".to_string();
        let db = ponder_db::Db::sqlite_in_memory(Some("ponder_cache"))
            .await
            .unwrap();
        let engine = Engine::new(
            config,
            transfer_schema(),
            vec![transfer_handler()],
            vec![],
            ConcurrencyMode::Dag,
            fast_common(),
        )
        .with_database(db);
        let reason = engine.run(CancellationToken::new()).await;
        assert_eq!(reason, ShutdownReason::FailedBuild);
    }

    #[tokio::test]
    async fn test_engine_surfaces_handler_error_as_reloadable() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 10));
        chain.add_log(3, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);
        let db = ponder_db::Db::sqlite_in_memory(Some("ponder_cache"))
            .await
            .unwrap();
        let failing: Arc<dyn IndexingFunction> = Arc::new(FnHandler::new(
            "Token:Transfer",
            Vec::<String>::new(),
            ["Transfer"],
            |_event, _context| Box::pin(async { anyhow::bail!("broken handler") }),
        ));
        let engine = Engine::new(
            test_config(),
            transfer_schema(),
            vec![failing],
            vec![],
            ConcurrencyMode::Dag,
            fast_common(),
        )
        .with_database(db)
        .with_client("testnet", chain as Arc<dyn ChainClient>);

        let reason = tokio::time::timeout(
            Duration::from_secs(10),
            engine.run(CancellationToken::new()),
        )
        .await
        .expect("engine should stop on handler error");
        assert_eq!(reason, ShutdownReason::IndexingError);
    }
}
