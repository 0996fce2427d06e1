// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint-ordered event stream.
//!
//! Merges per-network cursors over the sync store into a single ordered
//! sequence of batches. A batch `[from, to]` never reaches past the minimum
//! of the per-network safe checkpoints, so an event is only yielded once
//! every network has caught up to its position in global time. The stream is
//! lazy and restartable from any checkpoint; `kill()` makes it finite.

use std::collections::HashMap;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::error::PonderResult;
use crate::sync::store::{GetLogEventsArgs, SyncStore};
use crate::sync::types::{FactorySpec, LogEvent, LogFilterSpec};

#[derive(Debug)]
pub struct EventBatch {
    pub events: Vec<LogEvent>,
    /// Exclusive lower bound.
    pub from: Checkpoint,
    /// Inclusive upper bound; the engine checkpoint after this batch.
    pub to: Checkpoint,
}

pub struct EventStream {
    store: SyncStore,
    filters: Vec<LogFilterSpec>,
    factories: Vec<FactorySpec>,
    cursor: Checkpoint,
    safe: HashMap<u64, watch::Receiver<Checkpoint>>,
    page_size: u64,
    kill: CancellationToken,
}

impl EventStream {
    pub fn new(
        store: SyncStore,
        filters: Vec<LogFilterSpec>,
        factories: Vec<FactorySpec>,
        from: Checkpoint,
        safe: HashMap<u64, watch::Receiver<Checkpoint>>,
        page_size: u64,
    ) -> Self {
        Self {
            store,
            filters,
            factories,
            cursor: from,
            safe,
            page_size,
            kill: CancellationToken::new(),
        }
    }

    pub fn cursor(&self) -> Checkpoint {
        self.cursor
    }

    pub fn kill_handle(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Rewind after a reorg: events above `to` will be re-yielded once the
    /// sync store has the canonical chain again.
    pub fn reset(&mut self, to: Checkpoint) {
        if self.cursor > to {
            self.cursor = to;
        }
    }

    /// The next batch, waiting for safe-checkpoint movement when drained.
    /// Returns `None` once killed (or when there are no networks).
    pub async fn next_batch(&mut self) -> PonderResult<Option<EventBatch>> {
        loop {
            if self.kill.is_cancelled() {
                return Ok(None);
            }
            let Some(to) = self.safe_upper_bound() else {
                return Ok(None);
            };
            if to > self.cursor {
                let filters = self.query_filters().await?;
                let from = self.cursor;
                let events = self
                    .store
                    .get_log_events(GetLogEventsArgs {
                        from,
                        to,
                        filters: &filters,
                        limit: self.page_size,
                    })
                    .await?;
                // A full page ends mid-window; resume from its last event.
                let batch_to = if events.len() as u64 == self.page_size {
                    events.last().map(|e| e.checkpoint()).unwrap_or(to)
                } else {
                    to
                };
                self.cursor = batch_to;
                debug!(
                    "Event stream batch ({} events) up to {}",
                    events.len(),
                    batch_to
                );
                return Ok(Some(EventBatch {
                    events,
                    from,
                    to: batch_to,
                }));
            }

            // Drained: wait for any network to advance, or for kill.
            let changed: Vec<_> = self
                .safe
                .values_mut()
                .map(|rx| Box::pin(rx.changed()))
                .collect();
            tokio::select! {
                _ = self.kill.cancelled() => return Ok(None),
                (result, _, _) = futures::future::select_all(changed) => {
                    if result.is_err() {
                        // A sync task dropped its sender; treat as kill.
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn safe_upper_bound(&self) -> Option<Checkpoint> {
        self.safe.values().map(|rx| *rx.borrow()).min()
    }

    /// Static filters plus factory child filters resolved from the store.
    async fn query_filters(&self) -> PonderResult<Vec<LogFilterSpec>> {
        let mut filters = self.filters.clone();
        for factory in &self.factories {
            let children = self
                .store
                .get_factory_child_addresses(factory, u64::MAX)
                .await?;
            if children.is_empty() {
                continue;
            }
            filters.push(LogFilterSpec {
                id: factory.id.clone(),
                chain_id: factory.chain_id,
                selection: crate::rpc::LogSelection {
                    addresses: children,
                    topics: factory.topics.clone(),
                },
                include_transaction_receipts: factory.include_transaction_receipts,
            });
        }
        Ok(filters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Common;
    use crate::rpc::LogSelection;
    use crate::sync::store::ChunkData;
    use crate::sync::types::tests_support::{block_at, log_at, transaction_at};

    async fn store() -> SyncStore {
        let db = ponder_db::Db::sqlite_in_memory(None).await.unwrap();
        let store = SyncStore::new(db, &Common::for_testing());
        store.migrate().await.unwrap();
        store
    }

    fn filter(chain_id: u64) -> LogFilterSpec {
        LogFilterSpec {
            id: format!("lf_{chain_id}"),
            chain_id,
            selection: LogSelection::default(),
            include_transaction_receipts: false,
        }
    }

    async fn seed_events(store: &SyncStore, chain_id: u64, specs: &[(u64, u64)]) {
        // specs: (block_number, timestamp)
        for &(number, timestamp) in specs {
            let block = block_at(chain_id, number, timestamp);
            let tx = transaction_at(chain_id, &block, 0);
            store
                .insert_chunk(&ChunkData {
                    blocks: vec![block.clone()],
                    transactions: vec![tx.clone()],
                    receipts: vec![],
                    logs: vec![log_at(chain_id, &block, &tx, 0, timestamp)],
                    interval: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_merges_networks_in_checkpoint_order() {
        let store = store().await;
        // Chain 1 events at t=100, 300; chain 2 events at t=200, 400.
        seed_events(&store, 1, &[(10, 100), (11, 300)]).await;
        seed_events(&store, 2, &[(20, 200), (21, 400)]).await;

        let (tx1, rx1) = watch::channel(Checkpoint::block_max(300, 1, 11));
        let (tx2, rx2) = watch::channel(Checkpoint::block_max(400, 2, 21));
        let mut stream = EventStream::new(
            store,
            vec![filter(1), filter(2)],
            vec![],
            Checkpoint::ZERO,
            HashMap::from([(1, rx1), (2, rx2)]),
            100,
        );

        // Safe bound is min(chain1, chain2) = chain 1's t=300 position, so
        // the batch includes everything up to t=300 but not chain 2's t=400.
        let batch = stream.next_batch().await.unwrap().unwrap();
        let timestamps: Vec<u64> = batch
            .events
            .iter()
            .map(|e| e.checkpoint().block_timestamp)
            .collect();
        assert_eq!(timestamps, vec![100, 200, 300]);

        // Chain 1 catches up; the remaining event is released.
        tx1.send(Checkpoint::block_max(500, 1, 12)).unwrap();
        let batch = stream.next_batch().await.unwrap().unwrap();
        let timestamps: Vec<u64> = batch
            .events
            .iter()
            .map(|e| e.checkpoint().block_timestamp)
            .collect();
        assert_eq!(timestamps, vec![400]);
        drop(tx2);
    }

    #[tokio::test]
    async fn test_pagination_resumes_mid_window() {
        let store = store().await;
        seed_events(&store, 1, &[(10, 100), (11, 110), (12, 120), (13, 130)]).await;
        let (_tx, rx) = watch::channel(Checkpoint::block_max(130, 1, 13));
        let mut stream = EventStream::new(
            store,
            vec![filter(1)],
            vec![],
            Checkpoint::ZERO,
            HashMap::from([(1, rx)]),
            3,
        );

        let first = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(first.events.len(), 3);
        let second = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(second.events.len(), 1);
        assert!(first.to < second.to);
        assert_eq!(second.events[0].checkpoint().block_timestamp, 130);
    }

    #[tokio::test]
    async fn test_restartable_from_checkpoint() {
        let store = store().await;
        seed_events(&store, 1, &[(10, 100), (11, 110)]).await;
        let (_tx, rx) = watch::channel(Checkpoint::block_max(110, 1, 11));
        let resume_from = Checkpoint::block_max(100, 1, 10);
        let mut stream = EventStream::new(
            store,
            vec![filter(1)],
            vec![],
            resume_from,
            HashMap::from([(1, rx)]),
            100,
        );
        let batch = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].checkpoint().block_timestamp, 110);
    }

    #[tokio::test]
    async fn test_kill_makes_stream_finite() {
        let store = store().await;
        let (_tx, rx) = watch::channel(Checkpoint::ZERO);
        let mut stream = EventStream::new(
            store,
            vec![filter(1)],
            vec![],
            Checkpoint::ZERO,
            HashMap::from([(1, rx)]),
            100,
        );
        stream.kill();
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_window_advances_cursor() {
        let store = store().await;
        let (_tx, rx) = watch::channel(Checkpoint::block_max(100, 1, 10));
        let mut stream = EventStream::new(
            store,
            vec![filter(1)],
            vec![],
            Checkpoint::ZERO,
            HashMap::from([(1, rx)]),
            100,
        );
        let batch = stream.next_batch().await.unwrap().unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(batch.to, Checkpoint::block_max(100, 1, 10));
        assert_eq!(stream.cursor(), batch.to);
    }
}
