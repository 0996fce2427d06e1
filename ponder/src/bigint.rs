// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Storage codec for 256-bit integers.
//!
//! SQLite has no numeric type wide enough for EVM quantities, so they are
//! stored as fixed-width decimal text whose byte order matches numeric
//! order. Negative values are stored as `-` followed by the two's-complement
//! magnitude: `-` sorts before any digit, and among negatives the complement
//! grows with the value, so text order stays numeric. Postgres stores the
//! plain value in a `NUMERIC(78)` column instead.

use ethers::types::{I256, U256};
use ponder_db::{DbKind, SqlValue};

use crate::error::{PonderError, PonderResult};

/// Width of the encoded form: 78 digits cover 2^256, plus one position for
/// the sign slot.
pub const ENCODED_WIDTH: usize = 79;

/// Encode a signed 256-bit integer as order-preserving decimal text.
pub fn encode_i256(value: I256) -> String {
    if value.is_negative() {
        // into_raw() yields 2^256 + value for negatives, always 78 digits
        // once padded, so text order matches numeric order.
        format!("-{:078}", value.into_raw())
    } else {
        format!("{:079}", value.into_raw())
    }
}

pub fn decode_i256(s: &str) -> PonderResult<I256> {
    let malformed = || PonderError::Database(format!("malformed bigint encoding: {s:?}"));
    let raw = if let Some(magnitude) = s.strip_prefix('-') {
        U256::from_dec_str(magnitude).map_err(|_| malformed())?
    } else {
        U256::from_dec_str(s).map_err(|_| malformed())?
    };
    Ok(I256::from_raw(raw))
}

/// Encode an unsigned 256-bit quantity (block gas, wei values, ...).
pub fn encode_u256(value: U256) -> String {
    format!("{value:079}")
}

pub fn decode_u256(s: &str) -> PonderResult<U256> {
    U256::from_dec_str(s).map_err(|_| PonderError::Database(format!("malformed uint encoding: {s:?}")))
}

/// Marshal a signed bigint for the given backend.
pub fn i256_to_sql(kind: DbKind, value: I256) -> SqlValue {
    match kind {
        DbKind::Sqlite => SqlValue::Text(encode_i256(value)),
        DbKind::Postgres => SqlValue::Numeric(value.to_string()),
    }
}

pub fn i256_from_sql(value: &SqlValue) -> PonderResult<I256> {
    match value {
        SqlValue::Text(s) => decode_i256(s),
        SqlValue::Numeric(s) => I256::from_dec_str(s)
            .map_err(|_| PonderError::Database(format!("malformed numeric: {s:?}"))),
        other => Err(PonderError::Database(format!(
            "expected bigint column, got {other:?}"
        ))),
    }
}

pub fn u256_to_sql(kind: DbKind, value: U256) -> SqlValue {
    match kind {
        DbKind::Sqlite => SqlValue::Text(encode_u256(value)),
        DbKind::Postgres => SqlValue::Numeric(value.to_string()),
    }
}

pub fn u256_from_sql(value: &SqlValue) -> PonderResult<U256> {
    match value {
        SqlValue::Text(s) => decode_u256(s),
        SqlValue::Numeric(s) => U256::from_dec_str(s)
            .map_err(|_| PonderError::Database(format!("malformed numeric: {s:?}"))),
        other => Err(PonderError::Database(format!(
            "expected uint column, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i256_roundtrip() {
        let cases = vec![
            I256::zero(),
            I256::one(),
            I256::from(-1),
            I256::from(i64::MAX),
            I256::from(i64::MIN),
            I256::MAX,
            I256::MIN,
        ];
        for v in cases {
            let encoded = encode_i256(v);
            assert_eq!(encoded.len(), ENCODED_WIDTH);
            assert_eq!(decode_i256(&encoded).unwrap(), v, "roundtrip for {v}");
        }
    }

    #[test]
    fn test_u256_roundtrip() {
        for v in [U256::zero(), U256::one(), U256::MAX, U256::from(u128::MAX)] {
            let encoded = encode_u256(v);
            assert_eq!(encoded.len(), ENCODED_WIDTH);
            assert_eq!(decode_u256(&encoded).unwrap(), v);
        }
    }

    #[test]
    fn test_text_order_matches_numeric_order() {
        let samples = vec![
            I256::MIN,
            I256::from(-1_000_000),
            I256::from(-2),
            I256::from(-1),
            I256::zero(),
            I256::one(),
            I256::from(2),
            I256::from(1_000_000),
            I256::MAX,
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(
                    a.cmp(b),
                    encode_i256(*a).cmp(&encode_i256(*b)),
                    "text order mismatch for {a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn test_sql_marshaling() {
        let v = I256::from(-42);
        match i256_to_sql(DbKind::Sqlite, v) {
            SqlValue::Text(s) => assert_eq!(decode_i256(&s).unwrap(), v),
            other => panic!("expected text, got {other:?}"),
        }
        match i256_to_sql(DbKind::Postgres, v) {
            SqlValue::Numeric(s) => assert_eq!(s, "-42"),
            other => panic!("expected numeric, got {other:?}"),
        }
        assert_eq!(
            i256_from_sql(&SqlValue::Numeric("-42".to_string())).unwrap(),
            v
        );
    }
}
