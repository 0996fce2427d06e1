// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Raw chain rows as persisted by the sync store, plus the runtime filter
//! specs derived from the contract configuration.
//!
//! The RPC boundary speaks `ethers` types; everything past the sync store
//! speaks these rows. Conversions harden against the nullable fields a node
//! may omit (pending blocks, pre-EIP-1559 transactions).

use ethers::types::{
    Address, Block, Bloom, Bytes, Log, Transaction, TransactionReceipt, H256, H64, U256,
};

use crate::checkpoint::Checkpoint;
use crate::config::ChildAddressLocation;
use crate::error::{PonderError, PonderResult};
use crate::rpc::LogSelection;

fn missing(entity: &str, field: &str) -> PonderError {
    PonderError::InvalidChainResponse(format!("node returned {entity} without {field}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBlock {
    pub chain_id: u64,
    pub hash: H256,
    pub number: u64,
    pub timestamp: u64,
    pub parent_hash: H256,
    pub miner: Address,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub base_fee_per_gas: Option<U256>,
    pub difficulty: U256,
    pub total_difficulty: Option<U256>,
    pub extra_data: Bytes,
    pub logs_bloom: Option<Bloom>,
    pub mix_hash: Option<H256>,
    pub nonce: Option<H64>,
    pub receipts_root: H256,
    pub sha3_uncles: H256,
    pub size: Option<U256>,
    pub state_root: H256,
    pub transactions_root: H256,
}

impl SyncBlock {
    pub fn from_rpc(chain_id: u64, block: &Block<Transaction>) -> PonderResult<Self> {
        Ok(Self {
            chain_id,
            hash: block.hash.ok_or_else(|| missing("block", "hash"))?,
            number: block
                .number
                .ok_or_else(|| missing("block", "number"))?
                .as_u64(),
            timestamp: block.timestamp.as_u64(),
            parent_hash: block.parent_hash,
            miner: block.author.unwrap_or_default(),
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            base_fee_per_gas: block.base_fee_per_gas,
            difficulty: block.difficulty,
            total_difficulty: block.total_difficulty,
            extra_data: block.extra_data.clone(),
            logs_bloom: block.logs_bloom,
            mix_hash: block.mix_hash,
            nonce: block.nonce,
            receipts_root: block.receipts_root,
            sha3_uncles: block.uncles_hash,
            size: block.size,
            state_root: block.state_root,
            transactions_root: block.transactions_root,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTransaction {
    pub chain_id: u64,
    pub hash: H256,
    pub block_hash: H256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
    pub gas: U256,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub nonce: U256,
    pub r: U256,
    pub s: U256,
    pub v: u64,
    pub transaction_type: Option<u64>,
    /// EIP-2930 access list, JSON-encoded.
    pub access_list: Option<String>,
}

impl SyncTransaction {
    pub fn from_rpc(chain_id: u64, tx: &Transaction) -> PonderResult<Self> {
        Ok(Self {
            chain_id,
            hash: tx.hash,
            block_hash: tx
                .block_hash
                .ok_or_else(|| missing("transaction", "blockHash"))?,
            block_number: tx
                .block_number
                .ok_or_else(|| missing("transaction", "blockNumber"))?
                .as_u64(),
            transaction_index: tx
                .transaction_index
                .ok_or_else(|| missing("transaction", "transactionIndex"))?
                .as_u64(),
            from: tx.from,
            to: tx.to,
            input: tx.input.clone(),
            value: tx.value,
            gas: tx.gas,
            gas_price: tx.gas_price,
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            nonce: tx.nonce,
            r: tx.r,
            s: tx.s,
            v: tx.v.as_u64(),
            transaction_type: tx.transaction_type.map(|t| t.as_u64()),
            access_list: tx
                .access_list
                .as_ref()
                .map(|list| serde_json::to_string(list).unwrap_or_default()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTransactionReceipt {
    pub chain_id: u64,
    pub transaction_hash: H256,
    pub block_hash: H256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub contract_address: Option<Address>,
    pub cumulative_gas_used: U256,
    pub effective_gas_price: Option<U256>,
    pub gas_used: Option<U256>,
    /// Receipt logs, JSON-encoded.
    pub logs: String,
    pub logs_bloom: Bloom,
    pub status: Option<u64>,
    pub transaction_type: Option<u64>,
}

impl SyncTransactionReceipt {
    pub fn from_rpc(chain_id: u64, receipt: &TransactionReceipt) -> PonderResult<Self> {
        Ok(Self {
            chain_id,
            transaction_hash: receipt.transaction_hash,
            block_hash: receipt
                .block_hash
                .ok_or_else(|| missing("receipt", "blockHash"))?,
            block_number: receipt
                .block_number
                .ok_or_else(|| missing("receipt", "blockNumber"))?
                .as_u64(),
            transaction_index: receipt.transaction_index.as_u64(),
            from: receipt.from,
            to: receipt.to,
            contract_address: receipt.contract_address,
            cumulative_gas_used: receipt.cumulative_gas_used,
            effective_gas_price: receipt.effective_gas_price,
            gas_used: receipt.gas_used,
            logs: serde_json::to_string(&receipt.logs).unwrap_or_else(|_| "[]".to_string()),
            logs_bloom: receipt.logs_bloom,
            status: receipt.status.map(|s| s.as_u64()),
            transaction_type: receipt.transaction_type.map(|t| t.as_u64()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLog {
    /// `{blockHash}-{logIndex}`, the chain-scoped primary key.
    pub id: String,
    pub chain_id: u64,
    pub address: Address,
    pub block_hash: H256,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: H256,
    pub transaction_index: u64,
    pub topic0: Option<H256>,
    pub topic1: Option<H256>,
    pub topic2: Option<H256>,
    pub topic3: Option<H256>,
    pub data: Bytes,
    pub checkpoint: Checkpoint,
}

impl SyncLog {
    pub fn from_rpc(chain_id: u64, log: &Log, block_timestamp: u64) -> PonderResult<Self> {
        let block_hash = log.block_hash.ok_or_else(|| missing("log", "blockHash"))?;
        let block_number = log
            .block_number
            .ok_or_else(|| missing("log", "blockNumber"))?
            .as_u64();
        let log_index = log
            .log_index
            .ok_or_else(|| missing("log", "logIndex"))?
            .as_u64();
        let transaction_index = log
            .transaction_index
            .ok_or_else(|| missing("log", "transactionIndex"))?
            .as_u64();
        let topic = |i: usize| log.topics.get(i).copied();
        Ok(Self {
            id: format!("{block_hash:?}-{log_index}"),
            chain_id,
            address: log.address,
            block_hash,
            block_number,
            log_index,
            transaction_hash: log
                .transaction_hash
                .ok_or_else(|| missing("log", "transactionHash"))?,
            transaction_index,
            topic0: topic(0),
            topic1: topic(1),
            topic2: topic(2),
            topic3: topic(3),
            data: log.data.clone(),
            checkpoint: Checkpoint {
                block_timestamp,
                chain_id,
                block_number,
                transaction_index,
                event_index: log_index,
            },
        })
    }
}

/// A fully joined event as yielded by the sync store.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub log: SyncLog,
    pub block: SyncBlock,
    pub transaction: SyncTransaction,
    pub receipt: Option<SyncTransactionReceipt>,
}

impl LogEvent {
    pub fn checkpoint(&self) -> Checkpoint {
        self.log.checkpoint
    }
}

/// A log filter with persisted identity. `selection.addresses` may carry
/// resolved factory children when used as a query filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilterSpec {
    pub id: String,
    pub chain_id: u64,
    pub selection: LogSelection,
    pub include_transaction_receipts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorySpec {
    pub id: String,
    pub chain_id: u64,
    pub address: Address,
    pub event_selector: H256,
    pub child_address_location: ChildAddressLocation,
    /// Topic constraints applied to the children's logs.
    pub topics: [Option<Vec<H256>>; 4],
    pub include_transaction_receipts: bool,
}

impl FactorySpec {
    /// Selection matching the factory's own child-creation logs.
    pub fn discovery_selection(&self) -> LogSelection {
        LogSelection {
            addresses: vec![self.address],
            topics: [Some(vec![self.event_selector]), None, None, None],
        }
    }

    /// Identity of the interval row tracking the discovery scan.
    pub fn discovery_filter_id(&self) -> String {
        format!("{}/discovery", self.id)
    }

    /// Pull the child address out of a creation log.
    pub fn extract_child(&self, log: &SyncLog) -> Option<Address> {
        let from_word = |word: &[u8]| {
            if word.len() == 32 {
                Some(Address::from_slice(&word[12..32]))
            } else {
                None
            }
        };
        match self.child_address_location {
            ChildAddressLocation::Topic1 => log.topic1.map(|t| Address::from_slice(&t[12..32])),
            ChildAddressLocation::Topic2 => log.topic2.map(|t| Address::from_slice(&t[12..32])),
            ChildAddressLocation::Topic3 => log.topic3.map(|t| Address::from_slice(&t[12..32])),
            ChildAddressLocation::Offset(offset) => {
                let data = log.data.as_ref();
                if data.len() < offset + 32 {
                    return None;
                }
                from_word(&data[offset..offset + 32])
            }
        }
    }
}

/// Row constructors shared by the sync, stream and scheduler tests.
#[cfg(test)]
pub mod tests_support {
    use super::*;

    fn hash_for(chain_id: u64, number: u64) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&chain_id.to_be_bytes());
        bytes[8..16].copy_from_slice(&number.to_be_bytes());
        H256::from(bytes)
    }

    pub fn block_at(chain_id: u64, number: u64, timestamp: u64) -> SyncBlock {
        SyncBlock {
            chain_id,
            hash: hash_for(chain_id, number),
            number,
            timestamp,
            parent_hash: if number == 0 {
                H256::zero()
            } else {
                hash_for(chain_id, number - 1)
            },
            miner: Address::repeat_byte(0x01),
            gas_limit: U256::from(30_000_000u64),
            gas_used: U256::from(21_000u64),
            base_fee_per_gas: Some(U256::from(7u64)),
            difficulty: U256::zero(),
            total_difficulty: None,
            extra_data: Bytes::default(),
            logs_bloom: None,
            mix_hash: None,
            nonce: None,
            receipts_root: H256::zero(),
            sha3_uncles: H256::zero(),
            size: None,
            state_root: H256::zero(),
            transactions_root: H256::zero(),
        }
    }

    pub fn transaction_at(chain_id: u64, block: &SyncBlock, index: u64) -> SyncTransaction {
        let mut bytes = [0u8; 32];
        bytes[..32].copy_from_slice(block.hash.as_bytes());
        bytes[31] = bytes[31].wrapping_add(index as u8 + 1);
        SyncTransaction {
            chain_id,
            hash: H256::from(bytes),
            block_hash: block.hash,
            block_number: block.number,
            transaction_index: index,
            from: Address::repeat_byte(0x02),
            to: Some(Address::repeat_byte(0x03)),
            input: Bytes::default(),
            value: U256::zero(),
            gas: U256::from(21_000u64),
            gas_price: Some(U256::from(1_000_000_000u64)),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            nonce: U256::from(index),
            r: U256::one(),
            s: U256::one(),
            v: 27,
            transaction_type: Some(2),
            access_list: None,
        }
    }

    pub fn log_at(
        chain_id: u64,
        block: &SyncBlock,
        tx: &SyncTransaction,
        log_index: u64,
        timestamp: u64,
    ) -> SyncLog {
        SyncLog {
            id: format!("{:?}-{log_index}", block.hash),
            chain_id,
            address: Address::repeat_byte(0xaa),
            block_hash: block.hash,
            block_number: block.number,
            log_index,
            transaction_hash: tx.hash,
            transaction_index: tx.transaction_index,
            topic0: Some(H256::repeat_byte(0x11)),
            topic1: None,
            topic2: None,
            topic3: None,
            data: Bytes::default(),
            checkpoint: Checkpoint {
                block_timestamp: timestamp,
                chain_id,
                block_number: block.number,
                transaction_index: tx.transaction_index,
                event_index: log_index,
            },
        }
    }
}
