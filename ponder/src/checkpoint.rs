// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The global clock of the engine.
//!
//! A checkpoint identifies a position in multi-chain history. All
//! cross-component ordering (event batching, reorg rollback, finality,
//! cache promotion) reduces to comparing checkpoints. The encoded form is
//! fixed-width decimal so that byte-lexicographic order over the encoding
//! equals tuple order, which lets the sync store sort and range-scan on a
//! plain text column.

use std::fmt;

use crate::error::{PonderError, PonderResult};

const TIMESTAMP_DIGITS: usize = 10;
const CHAIN_ID_DIGITS: usize = 16;
const BLOCK_NUMBER_DIGITS: usize = 16;
const TRANSACTION_INDEX_DIGITS: usize = 16;
const EVENT_INDEX_DIGITS: usize = 16;

pub const ENCODED_LEN: usize = TIMESTAMP_DIGITS
    + CHAIN_ID_DIGITS
    + BLOCK_NUMBER_DIGITS
    + TRANSACTION_INDEX_DIGITS
    + EVENT_INDEX_DIGITS;

const MAX_TIMESTAMP: u64 = 9_999_999_999;
const MAX_WIDE: u64 = 9_999_999_999_999_999;

/// A totally ordered position in multi-chain history.
///
/// Field order matters: the derived `Ord` is the lexicographic tuple order
/// `(block_timestamp, chain_id, block_number, transaction_index, event_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_index: u64,
}

impl Checkpoint {
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
        transaction_index: 0,
        event_index: 0,
    };

    pub const MAX: Checkpoint = Checkpoint {
        block_timestamp: MAX_TIMESTAMP,
        chain_id: MAX_WIDE,
        block_number: MAX_WIDE,
        transaction_index: MAX_WIDE,
        event_index: MAX_WIDE,
    };

    /// The highest checkpoint within the given block. Used as the inclusive
    /// upper bound when a whole block is known to be synced.
    pub fn block_max(block_timestamp: u64, chain_id: u64, block_number: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: MAX_WIDE,
            event_index: MAX_WIDE,
        }
    }

    /// Fixed-width decimal encoding; byte-lex order equals tuple order.
    pub fn encode(&self) -> String {
        format!(
            "{:0tw$}{:0cw$}{:0bw$}{:0xw$}{:0ew$}",
            self.block_timestamp.min(MAX_TIMESTAMP),
            self.chain_id.min(MAX_WIDE),
            self.block_number.min(MAX_WIDE),
            self.transaction_index.min(MAX_WIDE),
            self.event_index.min(MAX_WIDE),
            tw = TIMESTAMP_DIGITS,
            cw = CHAIN_ID_DIGITS,
            bw = BLOCK_NUMBER_DIGITS,
            xw = TRANSACTION_INDEX_DIGITS,
            ew = EVENT_INDEX_DIGITS,
        )
    }

    pub fn decode(s: &str) -> PonderResult<Checkpoint> {
        if s.len() != ENCODED_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PonderError::Database(format!(
                "malformed checkpoint encoding: {s:?}"
            )));
        }
        let mut offset = 0;
        let mut next = |width: usize| -> PonderResult<u64> {
            let part = &s[offset..offset + width];
            offset += width;
            part.parse::<u64>().map_err(|_| {
                PonderError::Database(format!("malformed checkpoint segment: {part:?}"))
            })
        };
        Ok(Checkpoint {
            block_timestamp: next(TIMESTAMP_DIGITS)?,
            chain_id: next(CHAIN_ID_DIGITS)?,
            block_number: next(BLOCK_NUMBER_DIGITS)?,
            transaction_index: next(TRANSACTION_INDEX_DIGITS)?,
            event_index: next(EVENT_INDEX_DIGITS)?,
        })
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_index
        )
    }
}
