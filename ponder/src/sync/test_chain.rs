// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A mutable canned chain for sync and engine tests: blocks can be appended,
//! logs attached, and reorgs injected by replacing everything above an
//! ancestor with a fork branch.

use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{
    Address, Block, Bytes, Log, Transaction, TransactionReceipt, H256, U256, U64,
};

use crate::error::{PonderError, PonderResult};
use crate::rpc::{ChainClient, LogSelection};

#[derive(Default)]
pub struct TestChain {
    pub chain_id: u64,
    pub blocks: Mutex<Vec<Block<Transaction>>>,
    pub logs: Mutex<Vec<Log>>,
    pub log_queries: Mutex<Vec<(u64, u64)>>,
}

pub fn make_block(number: u64, fork: u8) -> Block<Transaction> {
    let salt = (fork as u64) << 32;
    let hash = H256::from_low_u64_be(number + 0x1000 + salt);
    let parent_hash = if number == 0 {
        H256::zero()
    } else if fork > 0 {
        H256::from_low_u64_be(number - 1 + 0x1000 + salt)
    } else {
        H256::from_low_u64_be(number - 1 + 0x1000)
    };
    let tx = Transaction {
        hash: H256::from_low_u64_be(number + 0x9000 + salt),
        block_hash: Some(hash),
        block_number: Some(U64::from(number)),
        transaction_index: Some(U64::from(0)),
        from: Address::repeat_byte(0x02),
        to: Some(Address::repeat_byte(0x03)),
        gas: U256::from(21_000u64),
        ..Default::default()
    };
    Block {
        hash: Some(hash),
        parent_hash,
        number: Some(U64::from(number)),
        timestamp: U256::from(number * 12 + 1_000),
        transactions: vec![tx],
        ..Default::default()
    }
}

impl TestChain {
    pub fn new(chain_id: u64, block_count: u64) -> Self {
        Self {
            chain_id,
            blocks: Mutex::new((0..block_count).map(|n| make_block(n, 0)).collect()),
            logs: Mutex::new(Vec::new()),
            log_queries: Mutex::new(Vec::new()),
        }
    }

    pub fn head(&self) -> Block<Transaction> {
        self.blocks.lock().unwrap().last().unwrap().clone()
    }

    pub fn push_block(&self) -> Block<Transaction> {
        let mut blocks = self.blocks.lock().unwrap();
        let next = blocks.last().unwrap().number.unwrap().as_u64() + 1;
        blocks.push(make_block(next, 0));
        blocks.last().unwrap().clone()
    }

    pub fn add_log(&self, block_number: u64, address: Address, topics: Vec<H256>) {
        let blocks = self.blocks.lock().unwrap();
        let block = blocks
            .iter()
            .find(|b| b.number == Some(U64::from(block_number)))
            .expect("block exists");
        let tx = &block.transactions[0];
        let mut logs = self.logs.lock().unwrap();
        let log_index = logs
            .iter()
            .filter(|l| l.block_number == block.number)
            .count() as u64;
        logs.push(Log {
            address,
            topics,
            data: Bytes::default(),
            block_hash: block.hash,
            block_number: block.number,
            transaction_hash: Some(tx.hash),
            transaction_index: Some(U64::from(0)),
            log_index: Some(U256::from(log_index)),
            ..Default::default()
        });
    }

    /// Replace blocks above `ancestor` with a fork branch of `new_length`
    /// blocks, dropping orphaned logs.
    pub fn reorg(&self, ancestor: u64, new_length: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        let ancestor_hash = blocks
            .iter()
            .find(|b| b.number == Some(U64::from(ancestor)))
            .expect("ancestor exists")
            .hash
            .unwrap();
        blocks.retain(|b| b.number.unwrap().as_u64() <= ancestor);
        self.logs
            .lock()
            .unwrap()
            .retain(|l| l.block_number.unwrap().as_u64() <= ancestor);
        for i in 0..new_length {
            let number = ancestor + 1 + i;
            let mut block = make_block(number, 1);
            if i == 0 {
                block.parent_hash = ancestor_hash;
            }
            blocks.push(block);
        }
    }
}

#[async_trait]
impl ChainClient for TestChain {
    async fn chain_id(&self) -> PonderResult<u64> {
        Ok(self.chain_id)
    }

    async fn latest_block(&self) -> PonderResult<Block<Transaction>> {
        Ok(self.head())
    }

    async fn block_by_number(&self, number: u64) -> PonderResult<Block<Transaction>> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.number == Some(U64::from(number)))
            .cloned()
            .ok_or(PonderError::BlockNotFound {
                chain_id: self.chain_id,
                block: number.to_string(),
            })
    }

    async fn block_by_hash(&self, hash: H256) -> PonderResult<Block<Transaction>> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.hash == Some(hash))
            .cloned()
            .ok_or(PonderError::BlockNotFound {
                chain_id: self.chain_id,
                block: format!("{hash:?}"),
            })
    }

    async fn logs(&self, selection: &LogSelection, from: u64, to: u64) -> PonderResult<Vec<Log>> {
        self.log_queries.lock().unwrap().push((from, to));
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let number = log.block_number.unwrap().as_u64();
                number >= from
                    && number <= to
                    && (selection.addresses.is_empty()
                        || selection.addresses.contains(&log.address))
                    && selection.topics.iter().enumerate().all(|(i, slot)| {
                        slot.as_ref().map_or(true, |values| {
                            log.topics.get(i).map_or(false, |t| values.contains(t))
                        })
                    })
            })
            .cloned()
            .collect())
    }

    async fn transaction_receipt(&self, hash: H256) -> PonderResult<TransactionReceipt> {
        let blocks = self.blocks.lock().unwrap();
        for block in blocks.iter() {
            for tx in &block.transactions {
                if tx.hash == hash {
                    return Ok(TransactionReceipt {
                        transaction_hash: hash,
                        transaction_index: U64::from(0),
                        block_hash: block.hash,
                        block_number: block.number,
                        from: tx.from,
                        to: tx.to,
                        cumulative_gas_used: U256::from(21_000u64),
                        status: Some(U64::from(1)),
                        ..Default::default()
                    });
                }
            }
        }
        Err(PonderError::TransactionReceiptNotFound {
            chain_id: self.chain_id,
            hash: format!("{hash:?}"),
        })
    }

    async fn call(&self, _to: Address, _data: Bytes, _block: u64) -> PonderResult<Bytes> {
        Ok(Bytes::default())
    }
}
