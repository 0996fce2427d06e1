// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Canned-response JSON-RPC provider for tests.
//!
//! Responses are keyed by `(method, params)` so tests stay precise about
//! what they expect the engine to send. Errors are queued FIFO in front of
//! the canned response, which makes "fail twice, then succeed" scenarios a
//! two-liner.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, MockError};
use ethers::types::U256;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

type Key = (String, String);

#[derive(Clone, Debug, Default)]
pub struct EthMockProvider {
    responses: Arc<Mutex<HashMap<Key, Value>>>,
    errors: Arc<Mutex<HashMap<Key, Vec<ethers::providers::JsonRpcError>>>>,
}

impl EthMockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn key<T: Serialize>(method: &str, params: T) -> Key {
        (
            method.to_string(),
            serde_json::to_string(&params).expect("mock params serialize"),
        )
    }

    /// Register the canned success response for `(method, params)`.
    pub fn add_response<T: Serialize>(&self, method: &str, params: T, response: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(Self::key(method, params), response);
    }

    /// Queue a JSON-RPC error consumed before the canned response.
    pub fn push_error<T: Serialize>(&self, method: &str, params: T, code: i64, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .entry(Self::key(method, params))
            .or_default()
            .push(ethers::providers::JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            });
    }

    /// Convenience for mocking `eth_chainId`.
    pub fn mock_chain_id(&self, chain_id: u64) {
        self.add_response(
            "eth_chainId",
            (),
            serde_json::to_value(U256::from(chain_id)).unwrap(),
        );
    }
}

#[async_trait]
impl JsonRpcClient for EthMockProvider {
    type Error = MockError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, Self::Error> {
        let key = Self::key(method, &params);
        if let Some(queue) = self.errors.lock().unwrap().get_mut(&key) {
            if !queue.is_empty() {
                return Err(MockError::JsonRpcError(queue.remove(0)));
            }
        }
        let value = self
            .responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(MockError::EmptyResponses)?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_keyed_by_params() {
        let mock = EthMockProvider::new();
        mock.add_response("eth_getBalance", ("0xaa",), serde_json::json!("0x1"));
        mock.add_response("eth_getBalance", ("0xbb",), serde_json::json!("0x2"));

        let a: String = mock.request("eth_getBalance", ("0xaa",)).await.unwrap();
        let b: String = mock.request("eth_getBalance", ("0xbb",)).await.unwrap();
        assert_eq!(a, "0x1");
        assert_eq!(b, "0x2");

        let missing: Result<String, _> = mock.request("eth_getBalance", ("0xcc",)).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_errors_drain_before_response() {
        let mock = EthMockProvider::new();
        mock.push_error("eth_blockNumber", (), -32005, "rate limited");
        mock.add_response("eth_blockNumber", (), serde_json::json!("0x10"));

        let first: Result<String, _> = mock.request("eth_blockNumber", ()).await;
        assert!(first.is_err());
        let second: String = mock.request("eth_blockNumber", ()).await.unwrap();
        assert_eq!(second, "0x10");
    }
}
