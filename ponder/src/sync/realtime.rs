// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Realtime head following.
//!
//! Keeps an in-memory window of the last `finality_block_count` headers.
//! A new head whose parent hash matches the tip extends the chain: logs for
//! the new range are fetched and persisted and a progress checkpoint is
//! emitted. A mismatch walks back to the common ancestor, prunes the sync
//! store above it and tells the engine to roll the indexing store back; the
//! canonical chain is then re-synced forward. Blocks deeper than the window
//! finalize and advance the finalized checkpoint monotonically.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use ethers::types::{Address, Block, Transaction, H256};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{ChunkData, SyncStore};
use super::types::{FactorySpec, LogFilterSpec, SyncBlock, SyncLog, SyncTransaction, SyncTransactionReceipt};
use super::SyncEvent;
use crate::checkpoint::Checkpoint;
use crate::common::Common;
use crate::error::{PonderError, PonderResult};
use crate::rpc::{ChainClient, LogSelection};

/// Per-network lifecycle. `Errored` is terminal and bubbles to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Syncing,
    Realtime,
    Stalled,
    Errored,
}

#[derive(Debug, Clone)]
struct WindowHeader {
    hash: H256,
    parent_hash: H256,
    timestamp: u64,
}

/// Sliding window of recent headers keyed by block number.
#[derive(Debug, Default)]
struct BlockWindow {
    headers: BTreeMap<u64, WindowHeader>,
}

impl BlockWindow {
    fn insert(&mut self, block: &SyncBlock) {
        self.headers.insert(
            block.number,
            WindowHeader {
                hash: block.hash,
                parent_hash: block.parent_hash,
                timestamp: block.timestamp,
            },
        );
    }

    fn get(&self, number: u64) -> Option<&WindowHeader> {
        self.headers.get(&number)
    }

    fn tip(&self) -> Option<(u64, &WindowHeader)> {
        self.headers.iter().next_back().map(|(n, h)| (*n, h))
    }

    fn truncate_above(&mut self, number: u64) {
        self.headers.retain(|n, _| *n <= number);
    }

    fn prune_below(&mut self, number: u64) {
        self.headers.retain(|n, _| *n >= number);
    }

    fn min(&self) -> Option<u64> {
        self.headers.keys().next().copied()
    }
}

pub struct RealtimeSync {
    network: String,
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    store: SyncStore,
    filters: Vec<LogFilterSpec>,
    factories: Vec<FactorySpec>,
    common: Common,
    events: mpsc::Sender<SyncEvent>,

    window: BlockWindow,
    children: HashMap<String, HashSet<Address>>,
    state: NetworkState,
    last_finalized: u64,
}

impl RealtimeSync {
    pub fn new(
        network: String,
        chain_id: u64,
        client: Arc<dyn ChainClient>,
        store: SyncStore,
        filters: Vec<LogFilterSpec>,
        factories: Vec<FactorySpec>,
        common: Common,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        Self {
            network,
            chain_id,
            client,
            store,
            filters,
            factories,
            common,
            events,
            window: BlockWindow::default(),
            children: HashMap::new(),
            state: NetworkState::Syncing,
            last_finalized: 0,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    /// Seed the window at `start_block` (the boundary with historical sync)
    /// and resolve the factory children announced so far.
    pub async fn seed(&mut self, start_block: u64) -> PonderResult<()> {
        let block = self.client.block_by_number(start_block).await?;
        let sync_block = SyncBlock::from_rpc(self.chain_id, &block)?;
        self.store.insert_block(&sync_block).await?;
        self.window.insert(&sync_block);
        self.last_finalized = start_block.saturating_sub(self.common.options.finality_block_count);
        for factory in &self.factories {
            let resolved = self
                .store
                .get_factory_child_addresses(factory, start_block)
                .await?;
            self.children
                .insert(factory.id.clone(), resolved.into_iter().collect());
        }
        self.state = NetworkState::Realtime;
        info!(
            "[{}] Realtime sync seeded at block {start_block}",
            self.network
        );
        Ok(())
    }

    /// Poll loop. `seed` must have been called.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = time::interval(std::time::Duration::from_millis(
            self.common.options.polling_interval_ms,
        ));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let stall_timeout = std::time::Duration::from_millis(self.common.options.stall_timeout_ms);
        let mut last_head_at = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] Realtime sync cancelled", self.network);
                    return;
                }
                _ = interval.tick() => {
                    let head = match self.client.latest_block().await {
                        Ok(head) => head,
                        Err(PonderError::TransientRpc(e)) => {
                            warn!("[{}] Failed to poll head: {e}", self.network);
                            continue;
                        }
                        Err(e) => {
                            self.state = NetworkState::Errored;
                            let _ = self.events.send(SyncEvent::Fatal {
                                chain_id: self.chain_id,
                                error: e.to_string(),
                            }).await;
                            return;
                        }
                    };
                    match self.process_head(&head).await {
                        Ok(true) => {
                            last_head_at = Instant::now();
                            if self.state == NetworkState::Stalled {
                                self.state = NetworkState::Realtime;
                                let _ = self.events.send(SyncEvent::Recovered {
                                    chain_id: self.chain_id,
                                }).await;
                            }
                        }
                        Ok(false) => {
                            if self.state == NetworkState::Realtime
                                && last_head_at.elapsed() > stall_timeout
                            {
                                warn!("[{}] No new head for {:?}", self.network, stall_timeout);
                                self.state = NetworkState::Stalled;
                                let _ = self.events.send(SyncEvent::Stalled {
                                    chain_id: self.chain_id,
                                }).await;
                            }
                        }
                        Err(e) => {
                            self.state = NetworkState::Errored;
                            let _ = self.events.send(SyncEvent::Fatal {
                                chain_id: self.chain_id,
                                error: e.to_string(),
                            }).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handle one observed head. Returns whether the chain advanced.
    pub async fn process_head(&mut self, head: &Block<Transaction>) -> PonderResult<bool> {
        let head_number = head
            .number
            .ok_or_else(|| PonderError::InvalidChainResponse("head without number".to_string()))?
            .as_u64();
        let head_hash = head
            .hash
            .ok_or_else(|| PonderError::InvalidChainResponse("head without hash".to_string()))?;

        let (tip_number, tip_header) = match self.window.tip() {
            Some((n, h)) => (n, h.clone()),
            None => {
                return Err(PonderError::InvalidChainResponse(
                    "realtime sync not seeded".to_string(),
                ))
            }
        };

        if head_number <= tip_number {
            // Same-height head with a different hash is a reorg at the tip.
            if let Some(known) = self.window.get(head_number) {
                if known.hash != head_hash {
                    let ancestor = self.find_ancestor(head).await?;
                    self.rollback_to(ancestor).await?;
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        // Collect the connecting segment tip+1 ..= head.
        let mut segment: Vec<Block<Transaction>> = vec![head.clone()];
        let mut cursor = head.clone();
        while cursor
            .number
            .map(|n| n.as_u64() > tip_number + 1)
            .unwrap_or(false)
        {
            let parent = self.client.block_by_hash(cursor.parent_hash).await?;
            segment.push(parent.clone());
            cursor = parent;
        }
        segment.reverse();

        if segment[0].parent_hash != tip_header.hash {
            let ancestor = self.find_ancestor(&segment[0]).await?;
            self.rollback_to(ancestor).await?;
            // The canonical segment re-syncs on the next poll.
            return Ok(true);
        }

        self.extend(&segment).await?;
        Ok(true)
    }

    /// Extend the canonical chain with a connected ascending segment.
    async fn extend(&mut self, segment: &[Block<Transaction>]) -> PonderResult<()> {
        let from = segment
            .first()
            .and_then(|b| b.number)
            .map(|n| n.as_u64())
            .ok_or_else(|| PonderError::InvalidChainResponse("segment without number".to_string()))?;
        let to = segment
            .last()
            .and_then(|b| b.number)
            .map(|n| n.as_u64())
            .ok_or_else(|| PonderError::InvalidChainResponse("segment without number".to_string()))?;

        let mut chunk = ChunkData::default();
        let mut timestamps: HashMap<H256, u64> = HashMap::new();
        let mut block_txs: HashMap<H256, Vec<Transaction>> = HashMap::new();
        for block in segment {
            let sync_block = SyncBlock::from_rpc(self.chain_id, block)?;
            timestamps.insert(sync_block.hash, sync_block.timestamp);
            block_txs.insert(sync_block.hash, block.transactions.clone());
            self.window.insert(&sync_block);
            chunk.blocks.push(sync_block);
        }

        let mut needed_txs: HashSet<H256> = HashSet::new();
        let mut receipt_txs: HashSet<H256> = HashSet::new();
        let mut intervals: Vec<(bool, String)> = Vec::new();

        // New factory children first, so their logs in this very range match.
        for factory in &self.factories {
            let creation_logs = self
                .client
                .logs(&factory.discovery_selection(), from, to)
                .await?;
            for raw in &creation_logs {
                let block_hash = raw.block_hash.unwrap_or_default();
                let timestamp = timestamps.get(&block_hash).copied().unwrap_or_default();
                let log = SyncLog::from_rpc(self.chain_id, raw, timestamp)?;
                needed_txs.insert(log.transaction_hash);
                chunk.logs.push(log.clone());
                if let Some(child) = factory.extract_child(&log) {
                    let set = self.children.entry(factory.id.clone()).or_default();
                    if set.insert(child) {
                        debug!(
                            "[{}] Factory {} announced child {child:?}",
                            self.network, factory.id
                        );
                    }
                }
            }
        }

        for filter in &self.filters {
            let logs = self.client.logs(&filter.selection, from, to).await?;
            for raw in &logs {
                let block_hash = raw.block_hash.unwrap_or_default();
                let timestamp = timestamps.get(&block_hash).copied().unwrap_or_default();
                let log = SyncLog::from_rpc(self.chain_id, raw, timestamp)?;
                needed_txs.insert(log.transaction_hash);
                if filter.include_transaction_receipts {
                    receipt_txs.insert(log.transaction_hash);
                }
                chunk.logs.push(log);
            }
            intervals.push((false, filter.id.clone()));
        }

        for factory in &self.factories {
            let Some(children) = self.children.get(&factory.id) else {
                continue;
            };
            if !children.is_empty() {
                let selection = LogSelection {
                    addresses: children.iter().copied().collect(),
                    topics: factory.topics.clone(),
                };
                let logs = self.client.logs(&selection, from, to).await?;
                for raw in &logs {
                    let block_hash = raw.block_hash.unwrap_or_default();
                    let timestamp = timestamps.get(&block_hash).copied().unwrap_or_default();
                    let log = SyncLog::from_rpc(self.chain_id, raw, timestamp)?;
                    needed_txs.insert(log.transaction_hash);
                    if factory.include_transaction_receipts {
                        receipt_txs.insert(log.transaction_hash);
                    }
                    chunk.logs.push(log);
                }
            }
            intervals.push((true, factory.id.clone()));
            intervals.push((false, factory.discovery_filter_id()));
        }

        for txs in block_txs.values() {
            for tx in txs {
                if needed_txs.contains(&tx.hash) {
                    chunk
                        .transactions
                        .push(SyncTransaction::from_rpc(self.chain_id, tx)?);
                }
            }
        }

        let receipt_hashes: Vec<H256> = receipt_txs.into_iter().collect();
        if !receipt_hashes.is_empty() {
            let receipts = futures::future::try_join_all(
                receipt_hashes
                    .iter()
                    .map(|hash| self.client.transaction_receipt(*hash)),
            )
            .await?;
            chunk.receipts = receipts
                .iter()
                .map(|r| SyncTransactionReceipt::from_rpc(self.chain_id, r))
                .collect::<PonderResult<Vec<_>>>()?;
        }

        chunk.logs.sort_by_key(|l| l.checkpoint);
        chunk.logs.dedup_by(|a, b| a.id == b.id);
        self.store.insert_chunk(&chunk).await?;
        for (is_factory, id) in intervals {
            if is_factory {
                self.store
                    .insert_factory_log_filter_interval(&id, (from, to))
                    .await?;
            } else {
                self.store.insert_log_filter_interval(&id, (from, to)).await?;
            }
        }

        let head_timestamp = segment
            .last()
            .map(|b| b.timestamp.as_u64())
            .unwrap_or_default();
        self.common
            .metrics
            .sync_latest_block
            .with_label_values(&[&self.network])
            .set(to as i64);
        let _ = self
            .events
            .send(SyncEvent::Progress {
                chain_id: self.chain_id,
                checkpoint: Checkpoint::block_max(head_timestamp, self.chain_id, to),
            })
            .await;

        self.advance_finality(to).await?;
        Ok(())
    }

    /// Promote blocks deeper than the finality window and shrink the window.
    async fn advance_finality(&mut self, head_number: u64) -> PonderResult<()> {
        let finalized = head_number.saturating_sub(self.common.options.finality_block_count);
        if finalized <= self.last_finalized {
            return Ok(());
        }
        self.last_finalized = finalized;
        let timestamp = match self.window.get(finalized) {
            Some(header) => header.timestamp,
            None => match self.store.latest_block_at_or_before(self.chain_id, finalized).await? {
                Some((_, ts)) => ts,
                None => return Ok(()),
            },
        };
        self.window.prune_below(finalized);
        self.common
            .metrics
            .sync_finalized_block
            .with_label_values(&[&self.network])
            .set(finalized as i64);
        let _ = self
            .events
            .send(SyncEvent::FinalizedAdvanced {
                chain_id: self.chain_id,
                checkpoint: Checkpoint::block_max(timestamp, self.chain_id, finalized),
            })
            .await;
        Ok(())
    }

    /// Walk back from a disconnected block to the first window entry on the
    /// canonical chain. Fails when the fork is below the window (deeper than
    /// the finality window).
    async fn find_ancestor(&self, disconnected: &Block<Transaction>) -> PonderResult<u64> {
        let mut cursor = disconnected.clone();
        loop {
            let number = cursor
                .number
                .ok_or_else(|| {
                    PonderError::InvalidChainResponse("block without number".to_string())
                })?
                .as_u64();
            if number == 0 {
                return Ok(0);
            }
            let parent_number = number - 1;
            if let Some(known) = self.window.get(parent_number) {
                if known.hash == cursor.parent_hash {
                    return Ok(parent_number);
                }
            }
            if self.window.min().map(|min| parent_number < min).unwrap_or(true) {
                return Err(PonderError::InvalidChainResponse(format!(
                    "[{}] reorg deeper than the finality window (fork below block {parent_number})",
                    self.network
                )));
            }
            cursor = self.client.block_by_hash(cursor.parent_hash).await?;
        }
    }

    async fn rollback_to(&mut self, ancestor: u64) -> PonderResult<()> {
        warn!(
            "[{}] Reorg detected, rolling back to block {ancestor}",
            self.network
        );
        self.common
            .metrics
            .realtime_reorgs
            .with_label_values(&[&self.network])
            .inc();
        self.store.prune_by_block(self.chain_id, ancestor).await?;
        self.window.truncate_above(ancestor);
        let timestamp = match self.window.get(ancestor) {
            Some(header) => header.timestamp,
            None => self
                .store
                .latest_block_at_or_before(self.chain_id, ancestor)
                .await?
                .map(|(_, ts)| ts)
                .unwrap_or_default(),
        };
        // Drop children discovered above the ancestor.
        for factory in &self.factories {
            let resolved = self
                .store
                .get_factory_child_addresses(factory, ancestor)
                .await?;
            self.children
                .insert(factory.id.clone(), resolved.into_iter().collect());
        }
        let _ = self
            .events
            .send(SyncEvent::Reorg {
                chain_id: self.chain_id,
                ancestor_block: ancestor,
                checkpoint: Checkpoint::block_max(timestamp, self.chain_id, ancestor),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::store::GetLogEventsArgs;
    use crate::sync::test_chain::TestChain;
    use ethers::types::H256;

    async fn store() -> SyncStore {
        let db = ponder_db::Db::sqlite_in_memory(None).await.unwrap();
        let store = SyncStore::new(db, &Common::for_testing());
        store.migrate().await.unwrap();
        store
    }

    fn watched_filter() -> LogFilterSpec {
        LogFilterSpec {
            id: "lf_rt".to_string(),
            chain_id: 1,
            selection: LogSelection {
                addresses: vec![Address::repeat_byte(0xaa)],
                topics: Default::default(),
            },
            include_transaction_receipts: false,
        }
    }

    async fn realtime(
        chain: Arc<TestChain>,
        store: &SyncStore,
        finality: u64,
    ) -> (RealtimeSync, mpsc::Receiver<SyncEvent>) {
        let mut common = Common::for_testing();
        let mut options = (*common.options).clone();
        options.finality_block_count = finality;
        common.options = Arc::new(options);
        let (tx, rx) = mpsc::channel(64);
        let sync = RealtimeSync::new(
            "testnet".to_string(),
            1,
            chain,
            store.clone(),
            vec![watched_filter()],
            vec![],
            common,
            tx,
        );
        (sync, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_extend_persists_logs_and_emits_progress() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 5));
        let store = store().await;
        let (mut sync, mut rx) = realtime(chain.clone(), &store, 64).await;
        sync.seed(4).await.unwrap();
        assert_eq!(sync.state(), NetworkState::Realtime);

        chain.push_block();
        chain.add_log(5, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);
        let head = chain.head();
        assert!(sync.process_head(&head).await.unwrap());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::Progress { chain_id: 1, checkpoint } if checkpoint.block_number == 5
        )));

        let stored = store
            .get_log_events(GetLogEventsArgs {
                from: Checkpoint::ZERO,
                to: Checkpoint::MAX,
                filters: &[watched_filter()],
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].block.number, 5);
        // The synced range is recorded so a restart does not refetch it.
        assert_eq!(
            store.get_log_filter_intervals("lf_rt").await.unwrap(),
            vec![(5, 5)]
        );
    }

    #[tokio::test]
    async fn test_same_head_is_a_noop() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 5));
        let store = store().await;
        let (mut sync, _rx) = realtime(chain.clone(), &store, 64).await;
        sync.seed(4).await.unwrap();
        let head = chain.head();
        assert!(!sync.process_head(&head).await.unwrap());
    }

    #[tokio::test]
    async fn test_multi_block_gap_is_backfilled() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 5));
        let store = store().await;
        let (mut sync, mut rx) = realtime(chain.clone(), &store, 64).await;
        sync.seed(4).await.unwrap();

        chain.push_block();
        chain.push_block();
        chain.push_block();
        chain.add_log(6, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);
        let head = chain.head();
        assert!(sync.process_head(&head).await.unwrap());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::Progress { checkpoint, .. } if checkpoint.block_number == 7
        )));
        assert_eq!(
            store.get_log_filter_intervals("lf_rt").await.unwrap(),
            vec![(5, 7)]
        );
    }

    #[tokio::test]
    async fn test_reorg_prunes_and_replays() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 5));
        let store = store().await;
        let (mut sync, mut rx) = realtime(chain.clone(), &store, 64).await;
        sync.seed(4).await.unwrap();

        // Advance to block 6 with a log at 5 on the soon-orphaned branch.
        chain.push_block();
        chain.push_block();
        chain.add_log(5, Address::repeat_byte(0xaa), vec![H256::repeat_byte(0x11)]);
        let head = chain.head();
        sync.process_head(&head).await.unwrap();
        drain(&mut rx);

        // Reorg: blocks above 4 replaced; the orphaned log disappears.
        chain.reorg(4, 3);
        let head = chain.head();
        sync.process_head(&head).await.unwrap();
        let events = drain(&mut rx);
        let reorg = events
            .iter()
            .find_map(|e| match e {
                SyncEvent::Reorg {
                    ancestor_block, ..
                } => Some(*ancestor_block),
                _ => None,
            })
            .expect("expected a reorg event");
        assert_eq!(reorg, 4);

        // Orphaned data is gone.
        let stored = store
            .get_log_events(GetLogEventsArgs {
                from: Checkpoint::ZERO,
                to: Checkpoint::MAX,
                filters: &[watched_filter()],
                limit: 10,
            })
            .await
            .unwrap();
        assert!(stored.is_empty());

        // Next poll extends along the canonical branch.
        let head = chain.head();
        sync.process_head(&head).await.unwrap();
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::Progress { checkpoint, .. } if checkpoint.block_number == 7
        )));
    }

    #[tokio::test]
    async fn test_finalized_checkpoint_is_monotonic() {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(TestChain::new(1, 5));
        let store = store().await;
        let (mut sync, mut rx) = realtime(chain.clone(), &store, 2).await;
        sync.seed(4).await.unwrap();

        let mut finalized = Vec::new();
        for _ in 0..4 {
            chain.push_block();
            let head = chain.head();
            sync.process_head(&head).await.unwrap();
            for event in drain(&mut rx) {
                if let SyncEvent::FinalizedAdvanced { checkpoint, .. } = event {
                    finalized.push(checkpoint);
                }
            }
        }
        assert!(!finalized.is_empty());
        let mut sorted = finalized.clone();
        sorted.sort();
        assert_eq!(finalized, sorted, "finalized advancement must be monotonic");
    }
}
