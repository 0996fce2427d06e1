// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

#[derive(Clone, Debug)]
pub struct PonderMetrics {
    pub(crate) rpc_requests: IntCounterVec,
    pub(crate) rpc_request_errors: IntCounterVec,
    pub(crate) rpc_request_latency: HistogramVec,

    pub(crate) sync_latest_block: IntGaugeVec,
    pub(crate) sync_finalized_block: IntGaugeVec,
    pub(crate) historical_cached_blocks: IntGaugeVec,
    pub(crate) realtime_reorgs: IntCounterVec,

    pub(crate) events_processed: IntCounterVec,
    pub(crate) handler_errors: IntCounterVec,
    pub(crate) store_operations: IntCounterVec,
    pub(crate) store_reverted_writes: IntCounterVec,

    pub(crate) cache_promotions: IntCounterVec,
    pub(crate) namespace_lock_acquisitions: IntCounterVec,
}

impl PonderMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            rpc_requests: register_int_counter_vec_with_registry!(
                "ponder_rpc_requests",
                "Total number of JSON-RPC requests issued",
                &["network", "method"],
                registry,
            )
            .unwrap(),
            rpc_request_errors: register_int_counter_vec_with_registry!(
                "ponder_rpc_request_errors",
                "Total number of failed JSON-RPC requests by error type",
                &["network", "method", "error_type"],
                registry,
            )
            .unwrap(),
            rpc_request_latency: register_histogram_vec_with_registry!(
                "ponder_rpc_request_latency",
                "Latency of JSON-RPC requests in seconds",
                &["network", "method"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            sync_latest_block: register_int_gauge_vec_with_registry!(
                "ponder_sync_latest_block",
                "Latest block number observed per network",
                &["network"],
                registry,
            )
            .unwrap(),
            sync_finalized_block: register_int_gauge_vec_with_registry!(
                "ponder_sync_finalized_block",
                "Finalized block number per network",
                &["network"],
                registry,
            )
            .unwrap(),
            historical_cached_blocks: register_int_gauge_vec_with_registry!(
                "ponder_historical_cached_blocks",
                "Highest contiguously cached block per network",
                &["network"],
                registry,
            )
            .unwrap(),
            realtime_reorgs: register_int_counter_vec_with_registry!(
                "ponder_realtime_reorgs",
                "Total number of reorgs handled per network",
                &["network"],
                registry,
            )
            .unwrap(),
            events_processed: register_int_counter_vec_with_registry!(
                "ponder_events_processed",
                "Total number of events dispatched per indexing function",
                &["handler"],
                registry,
            )
            .unwrap(),
            handler_errors: register_int_counter_vec_with_registry!(
                "ponder_handler_errors",
                "Total number of indexing function failures",
                &["handler"],
                registry,
            )
            .unwrap(),
            store_operations: register_int_counter_vec_with_registry!(
                "ponder_store_operations",
                "Total number of indexing store operations",
                &["table", "operation"],
                registry,
            )
            .unwrap(),
            store_reverted_writes: register_int_counter_vec_with_registry!(
                "ponder_store_reverted_writes",
                "Total number of writes undone by reorg rollback",
                &["table"],
                registry,
            )
            .unwrap(),
            cache_promotions: register_int_counter_vec_with_registry!(
                "ponder_cache_promotions",
                "Total number of rows promoted to the finalized cache",
                &["table"],
                registry,
            )
            .unwrap(),
            namespace_lock_acquisitions: register_int_counter_vec_with_registry!(
                "ponder_namespace_lock_acquisitions",
                "Namespace lock acquisition attempts by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
        }
    }
}
