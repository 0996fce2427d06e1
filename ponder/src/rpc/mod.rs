// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-network RPC access.
//!
//! [`RequestQueue`] is the only component that talks to a node. Everything
//! above it sees the [`ChainClient`] trait, which makes the sync layer
//! testable against canned chains.

use async_trait::async_trait;
use ethers::types::{Address, Block, Bytes, Log, Transaction, TransactionReceipt, H256};

use crate::error::PonderResult;

mod request_queue;

pub use request_queue::{Bisect, RangeSplitter, RateLimitedClient, RequestQueue};

#[cfg(test)]
pub mod mock_provider;

/// Address/topic constraints for a log query. Empty address list means any
/// address; `None` topic means any value at that position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSelection {
    pub addresses: Vec<Address>,
    pub topics: [Option<Vec<H256>>; 4],
}

/// Read-only chain access used by the sync layer and contract views.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> PonderResult<u64>;
    /// The current head, with full transactions.
    async fn latest_block(&self) -> PonderResult<Block<Transaction>>;
    async fn block_by_number(&self, number: u64) -> PonderResult<Block<Transaction>>;
    async fn block_by_hash(&self, hash: H256) -> PonderResult<Block<Transaction>>;
    async fn logs(&self, selection: &LogSelection, from: u64, to: u64) -> PonderResult<Vec<Log>>;
    async fn transaction_receipt(&self, hash: H256) -> PonderResult<TransactionReceipt>;
    async fn call(&self, to: Address, data: Bytes, block: u64) -> PonderResult<Bytes>;
}
