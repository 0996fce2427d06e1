// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Historical backfill.
//!
//! Computes the gap set (requested ranges minus cached intervals), splits
//! gaps into chunks of at most `max_block_range` blocks and processes chunks
//! with bounded parallelism. Each chunk is one round trip per entity class:
//! logs, then the blocks and transactions the logs reference, then receipts
//! when the filter asks for them, all persisted in a single sync-store
//! transaction together with the chunk's interval.
//!
//! Factory sources run in two passes: the factory's own creation logs are
//! scanned first (the "discovery" filter), then the announced children are
//! treated as a dynamic address list for a second scan tracked under the
//! factory's interval id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ethers::types::H256;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::intervals;
use super::store::{ChunkData, IntervalKind, SyncStore};
use super::types::{FactorySpec, LogFilterSpec, SyncBlock, SyncLog, SyncTransaction, SyncTransactionReceipt};
use super::SyncEvent;
use crate::checkpoint::Checkpoint;
use crate::common::Common;
use crate::error::{PonderError, PonderResult};
use crate::rpc::{ChainClient, LogSelection};

#[derive(Debug, Clone)]
pub enum HistoricalSource {
    LogFilter {
        spec: LogFilterSpec,
        start_block: u64,
        end_block: u64,
    },
    Factory {
        spec: FactorySpec,
        start_block: u64,
        end_block: u64,
    },
}

impl HistoricalSource {
    fn range(&self) -> (u64, u64) {
        match self {
            HistoricalSource::LogFilter {
                start_block,
                end_block,
                ..
            }
            | HistoricalSource::Factory {
                start_block,
                end_block,
                ..
            } => (*start_block, *end_block),
        }
    }
}

/// One unit of fetch work after gap subtraction.
struct ChunkTask {
    selection: LogSelection,
    interval: (IntervalKind, String),
    include_receipts: bool,
    range: (u64, u64),
}

pub struct HistoricalSync {
    network: String,
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    store: SyncStore,
    sources: Vec<HistoricalSource>,
    common: Common,
    events: mpsc::Sender<SyncEvent>,
}

impl HistoricalSync {
    pub fn new(
        network: String,
        chain_id: u64,
        client: Arc<dyn ChainClient>,
        store: SyncStore,
        sources: Vec<HistoricalSource>,
        common: Common,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        Self {
            network,
            chain_id,
            client,
            store,
            sources,
            common,
            events,
        }
    }

    /// Fill every gap, reporting progress as the contiguous cached prefix
    /// advances, then emit `HistoricalComplete`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.run_inner(cancel).await {
            if !matches!(e, PonderError::Killed) {
                warn!("[{}] Historical sync failed: {e}", self.network);
                let _ = self
                    .events
                    .send(SyncEvent::Fatal {
                        chain_id: self.chain_id,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn run_inner(&self, cancel: CancellationToken) -> PonderResult<()> {
        self.register_sources().await?;

        // Pass 1: factory child discovery. Must complete before the child
        // scans know their address lists.
        let discovery: Vec<ChunkTask> = {
            let mut tasks = Vec::new();
            for source in &self.sources {
                if let HistoricalSource::Factory {
                    spec,
                    start_block,
                    end_block,
                } = source
                {
                    let cached = self
                        .store
                        .get_log_filter_intervals(&spec.discovery_filter_id())
                        .await?;
                    for gap in intervals::subtract((*start_block, *end_block), &cached) {
                        for range in intervals::chunk(gap, self.common.options.max_block_range) {
                            tasks.push(ChunkTask {
                                selection: spec.discovery_selection(),
                                interval: (IntervalKind::LogFilter, spec.discovery_filter_id()),
                                include_receipts: false,
                                range,
                            });
                        }
                    }
                }
            }
            tasks
        };
        if !discovery.is_empty() {
            info!(
                "[{}] Resolving factory children ({} chunks)",
                self.network,
                discovery.len()
            );
            self.drive_chunks(discovery, &cancel, false).await?;
        }

        // Pass 2: the real scans, factories now expanded to their children.
        let mut tasks = Vec::new();
        for source in &self.sources {
            match source {
                HistoricalSource::LogFilter {
                    spec,
                    start_block,
                    end_block,
                } => {
                    let cached = self.store.get_log_filter_intervals(&spec.id).await?;
                    for gap in intervals::subtract((*start_block, *end_block), &cached) {
                        for range in intervals::chunk(gap, self.common.options.max_block_range) {
                            tasks.push(ChunkTask {
                                selection: spec.selection.clone(),
                                interval: (IntervalKind::LogFilter, spec.id.clone()),
                                include_receipts: spec.include_transaction_receipts,
                                range,
                            });
                        }
                    }
                }
                HistoricalSource::Factory {
                    spec,
                    start_block,
                    end_block,
                } => {
                    let children = self
                        .store
                        .get_factory_child_addresses(spec, *end_block)
                        .await?;
                    if children.is_empty() {
                        // No children announced in range; the scan is
                        // trivially complete.
                        self.store
                            .insert_factory_log_filter_interval(&spec.id, (*start_block, *end_block))
                            .await?;
                        continue;
                    }
                    debug!(
                        "[{}] Factory {} resolved {} children",
                        self.network,
                        spec.id,
                        children.len()
                    );
                    let selection = LogSelection {
                        addresses: children,
                        topics: spec.topics.clone(),
                    };
                    let cached = self.store.get_factory_log_filter_intervals(&spec.id).await?;
                    for gap in intervals::subtract((*start_block, *end_block), &cached) {
                        for range in intervals::chunk(gap, self.common.options.max_block_range) {
                            tasks.push(ChunkTask {
                                selection: selection.clone(),
                                interval: (IntervalKind::Factory, spec.id.clone()),
                                include_receipts: spec.include_transaction_receipts,
                                range,
                            });
                        }
                    }
                }
            }
        }

        info!(
            "[{}] Historical sync starting ({} chunks to fetch)",
            self.network,
            tasks.len()
        );
        self.drive_chunks(tasks, &cancel, true).await?;

        self.report_progress().await?;
        let _ = self
            .events
            .send(SyncEvent::HistoricalComplete {
                chain_id: self.chain_id,
            })
            .await;
        info!("[{}] Historical sync complete", self.network);
        Ok(())
    }

    async fn register_sources(&self) -> PonderResult<()> {
        for source in &self.sources {
            match source {
                HistoricalSource::LogFilter { spec, .. } => {
                    self.store.insert_log_filter(spec).await?;
                }
                HistoricalSource::Factory { spec, .. } => {
                    self.store.insert_factory(spec).await?;
                    // The discovery scan needs its own filter row so reorg
                    // pruning can find and truncate its intervals.
                    self.store
                        .insert_log_filter(&LogFilterSpec {
                            id: spec.discovery_filter_id(),
                            chain_id: spec.chain_id,
                            selection: spec.discovery_selection(),
                            include_transaction_receipts: false,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Run chunk tasks with bounded parallelism; optionally report progress
    /// after each completion.
    async fn drive_chunks(
        &self,
        tasks: Vec<ChunkTask>,
        cancel: &CancellationToken,
        report: bool,
    ) -> PonderResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.common.options.historical_concurrency.max(1)));
        let mut join_set = tokio::task::JoinSet::new();

        for task in tasks {
            if cancel.is_cancelled() {
                return Err(PonderError::Killed);
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            let client = self.client.clone();
            let store = self.store.clone();
            let chain_id = self.chain_id;
            join_set.spawn(async move {
                let _permit = permit;
                process_chunk(client, store, chain_id, task).await
            });

            // Drain completions opportunistically so progress moves while
            // chunks are still queueing.
            while let Some(result) = join_set.try_join_next() {
                result.map_err(|e| PonderError::Database(format!("chunk task panicked: {e}")))??;
                if report {
                    self.report_progress().await?;
                }
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(PonderError::Killed);
                }
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(result) => {
                            result.map_err(|e| {
                                PonderError::Database(format!("chunk task panicked: {e}"))
                            })??;
                            if report {
                                self.report_progress().await?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Progress is the minimum over sources of the contiguous cached prefix;
    /// the published checkpoint is the block-max checkpoint at that height.
    async fn report_progress(&self) -> PonderResult<()> {
        let mut min_prefix: Option<u64> = None;
        for source in &self.sources {
            let (start, _end) = source.range();
            let cached = match source {
                HistoricalSource::LogFilter { spec, .. } => {
                    self.store.get_log_filter_intervals(&spec.id).await?
                }
                HistoricalSource::Factory { spec, .. } => {
                    self.store.get_factory_log_filter_intervals(&spec.id).await?
                }
            };
            match intervals::contiguous_prefix_end(start, &cached) {
                Some(prefix) => {
                    min_prefix = Some(min_prefix.map_or(prefix, |m: u64| m.min(prefix)))
                }
                // A source with nothing cached pins progress at zero.
                None => return Ok(()),
            }
        }
        let Some(prefix) = min_prefix else {
            return Ok(());
        };
        let Some((_, timestamp)) = self
            .store
            .latest_block_at_or_before(self.chain_id, prefix)
            .await?
        else {
            return Ok(());
        };
        self.common
            .metrics
            .historical_cached_blocks
            .with_label_values(&[&self.network])
            .set(prefix as i64);
        // When no block is stored exactly at the prefix, the nearest older
        // timestamp keeps the global ordering conservative.
        let checkpoint = Checkpoint::block_max(timestamp, self.chain_id, prefix);
        let _ = self
            .events
            .send(SyncEvent::Progress {
                chain_id: self.chain_id,
                checkpoint,
            })
            .await;
        Ok(())
    }
}

/// How long a chunk keeps retrying transient upstream failures before the
/// whole backfill gives up. The request queue already retries per request;
/// this outer budget rides out longer node outages.
const CHUNK_RETRY_BUDGET: std::time::Duration = std::time::Duration::from_secs(300);

/// Fetch and persist one chunk.
async fn process_chunk(
    client: Arc<dyn ChainClient>,
    store: SyncStore,
    chain_id: u64,
    task: ChunkTask,
) -> PonderResult<()> {
    let (from, to) = task.range;
    let retry_policy = backoff::ExponentialBackoff {
        max_elapsed_time: Some(CHUNK_RETRY_BUDGET),
        ..Default::default()
    };
    let raw_logs = backoff::future::retry(retry_policy, || async {
        client
            .logs(&task.selection, from, to)
            .await
            .map_err(|e| match e {
                PonderError::TransientRpc(_) => {
                    debug!("Retrying chunk [{from}, {to}]: {e}");
                    backoff::Error::transient(e)
                }
                // Permanent failures (bad params, unsplittable ranges) are
                // not going to heal with time.
                other => backoff::Error::permanent(other),
            })
    })
    .await?;

    // Resolve the blocks the logs live in, batched by hash. Blocks carrying
    // transactions we have not stored yet must be (re)fetched even if the
    // header row exists.
    let mut log_block_hashes: Vec<H256> = Vec::new();
    let mut log_tx_hashes: Vec<H256> = Vec::new();
    let mut seen_blocks = HashSet::new();
    let mut seen_txs = HashSet::new();
    for log in &raw_logs {
        if let (Some(block_hash), Some(tx_hash)) = (log.block_hash, log.transaction_hash) {
            if seen_blocks.insert(block_hash) {
                log_block_hashes.push(block_hash);
            }
            if seen_txs.insert(tx_hash) {
                log_tx_hashes.push(tx_hash);
            }
        }
    }

    let missing_blocks: HashSet<H256> = store
        .missing_block_hashes(&log_block_hashes)
        .await?
        .into_iter()
        .collect();
    let missing_txs = store.missing_transaction_hashes(&log_tx_hashes).await?;
    let mut blocks_to_fetch: HashSet<H256> = missing_blocks;
    for log in &raw_logs {
        if let (Some(block_hash), Some(tx_hash)) = (log.block_hash, log.transaction_hash) {
            if missing_txs.contains(&tx_hash) {
                blocks_to_fetch.insert(block_hash);
            }
        }
    }

    let fetched = futures::future::try_join_all(
        blocks_to_fetch
            .iter()
            .map(|hash| client.block_by_hash(*hash)),
    )
    .await?;

    let mut chunk = ChunkData::default();
    let mut timestamps: HashMap<H256, u64> = HashMap::new();
    let needed_txs: HashSet<H256> = log_tx_hashes.iter().copied().collect();
    for block in &fetched {
        let sync_block = SyncBlock::from_rpc(chain_id, block)?;
        timestamps.insert(sync_block.hash, sync_block.timestamp);
        for tx in &block.transactions {
            if needed_txs.contains(&tx.hash) {
                chunk.transactions.push(SyncTransaction::from_rpc(chain_id, tx)?);
            }
        }
        chunk.blocks.push(sync_block);
    }

    // Timestamps for blocks already in the store.
    let known: Vec<H256> = log_block_hashes
        .iter()
        .filter(|h| !timestamps.contains_key(h))
        .copied()
        .collect();
    timestamps.extend(store.get_block_timestamps(&known).await?);

    for log in &raw_logs {
        let block_hash = log
            .block_hash
            .ok_or_else(|| PonderError::InvalidChainResponse("log without blockHash".to_string()))?;
        let timestamp = *timestamps.get(&block_hash).ok_or_else(|| {
            PonderError::InvalidChainResponse(format!(
                "no timestamp for block {block_hash:?} referenced by log"
            ))
        })?;
        chunk.logs.push(SyncLog::from_rpc(chain_id, log, timestamp)?);
    }

    if task.include_receipts {
        let missing = store.missing_receipt_hashes(&log_tx_hashes).await?;
        let receipts = futures::future::try_join_all(
            missing.iter().map(|hash| client.transaction_receipt(*hash)),
        )
        .await?;
        chunk.receipts = receipts
            .iter()
            .map(|r| SyncTransactionReceipt::from_rpc(chain_id, r))
            .collect::<PonderResult<Vec<_>>>()?;
    }

    // Anchor the chunk end so progress checkpoints always have a timestamp,
    // even when the chunk carried no logs.
    let end_anchor_missing = store
        .latest_block_at_or_before(chain_id, to)
        .await?
        .map_or(true, |(number, _)| number != to)
        && !chunk.blocks.iter().any(|b| b.number == to);
    if end_anchor_missing {
        let block = client.block_by_number(to).await?;
        chunk.blocks.push(SyncBlock::from_rpc(chain_id, &block)?);
    }

    let (kind, id) = task.interval;
    chunk.interval = Some((kind, id, (from, to)));
    store.insert_chunk(&chunk).await?;
    Ok(())
}
