// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Rate-limited, retrying RPC client.
//!
//! Two layers: [`RateLimitedClient`] is a `JsonRpcClient` wrapper that
//! enforces the in-flight cap and the minimum inter-request delay and feeds
//! the per-method metrics. [`RequestQueue`] sits above the provider and owns
//! error classification, the retry budget, per-request timeouts and
//! `eth_getLogs` range splitting.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, Block, BlockId, BlockNumber, Bytes, Filter, Log, Transaction, TransactionReceipt,
    TransactionRequest, H256,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{ChainClient, LogSelection};
use crate::common::Common;
use crate::config::NetworkConfig;
use crate::error::{PonderError, PonderResult};
use crate::metrics::PonderMetrics;

/// How a failed request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcFailure {
    /// Worth retrying: 5xx, 429, limit exceeded, timeouts.
    Transient,
    /// Fail immediately: invalid params, reverted calls.
    Permanent,
    /// `eth_getLogs` result-set cap; recoverable by splitting the range.
    RangeTooLarge,
}

pub(crate) fn classify_rpc_error(error: &str) -> RpcFailure {
    let e = error.to_lowercase();
    const RANGE_MARKERS: &[&str] = &[
        "query returned more than",
        "log response size exceeded",
        "response size exceeded",
        "response too large",
        "block range is too",
        "range too large",
    ];
    if RANGE_MARKERS.iter().any(|m| e.contains(m)) {
        return RpcFailure::RangeTooLarge;
    }
    const TRANSIENT_MARKERS: &[&str] = &[
        "429",
        "too many requests",
        "rate limit",
        "limit exceeded",
        "quota exceeded",
        "-32005",
        "timeout",
        "timed out",
        "500",
        "502",
        "503",
        "504",
        "connection",
        "reset by peer",
        "server error",
    ];
    if TRANSIENT_MARKERS.iter().any(|m| e.contains(m)) {
        RpcFailure::Transient
    } else {
        RpcFailure::Permanent
    }
}

/// Proposes sub-ranges when the node rejects a log query as too large. The
/// concrete heuristics (parsing suggested ranges out of provider error
/// messages) are supplied by the host; [`Bisect`] is the fallback.
pub trait RangeSplitter: Send + Sync {
    fn propose(&self, from: u64, to: u64, error: &str) -> Option<Vec<(u64, u64)>>;
}

/// Split the failed range in half.
pub struct Bisect;

impl RangeSplitter for Bisect {
    fn propose(&self, from: u64, to: u64, _: &str) -> Option<Vec<(u64, u64)>> {
        if from >= to {
            return None;
        }
        let mid = from + (to - from) / 2;
        Some(vec![(from, mid), (mid + 1, to)])
    }
}

/// `JsonRpcClient` wrapper enforcing the per-network request budget.
#[derive(Debug)]
pub struct RateLimitedClient<P> {
    inner: P,
    network: String,
    metrics: Arc<PonderMetrics>,
    semaphore: Arc<tokio::sync::Semaphore>,
    min_request_delay: Duration,
    last_request_time: Arc<Mutex<Instant>>,
}

impl<P> RateLimitedClient<P> {
    pub fn new(
        inner: P,
        network: &str,
        max_concurrent_requests: u32,
        max_requests_per_second: u32,
        metrics: Arc<PonderMetrics>,
    ) -> Self {
        let min_request_delay =
            Duration::from_secs_f64(1.0 / max_requests_per_second.max(1) as f64);
        Self {
            inner,
            network: network.to_string(),
            metrics,
            semaphore: Arc::new(tokio::sync::Semaphore::new(
                max_concurrent_requests.max(1) as usize
            )),
            min_request_delay,
            last_request_time: Arc::new(Mutex::new(Instant::now() - min_request_delay)),
        }
    }
}

#[async_trait]
impl<P> JsonRpcClient for RateLimitedClient<P>
where
    P: JsonRpcClient + 'static,
{
    type Error = P::Error;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, Self::Error> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        // Pace requests so the node never sees more than the configured
        // requests/sec from this instance.
        let mut last_request = self.last_request_time.lock().await;
        let elapsed = Instant::now().saturating_duration_since(*last_request);
        if elapsed < self.min_request_delay {
            tokio::time::sleep(self.min_request_delay - elapsed).await;
        }
        *last_request = Instant::now();
        drop(last_request);

        self.metrics
            .rpc_requests
            .with_label_values(&[&self.network, method])
            .inc();
        let _timer = self
            .metrics
            .rpc_request_latency
            .with_label_values(&[&self.network, method])
            .start_timer();

        self.inner.request(method, params).await
    }
}

/// Typed RPC surface for one network.
pub struct RequestQueue<P> {
    provider: Provider<RateLimitedClient<P>>,
    network: String,
    chain_id: u64,
    request_timeout: Duration,
    max_retries: u32,
    splitter: Arc<dyn RangeSplitter>,
    metrics: Arc<PonderMetrics>,
}

impl RequestQueue<Http> {
    /// Build the production HTTP queue from a network config.
    pub fn from_config(config: &NetworkConfig, common: &Common) -> PonderResult<Self> {
        let url = Url::parse(&config.transport)
            .map_err(|e| PonderError::PermanentRpc(format!("invalid transport url: {e}")))?;
        let client = RateLimitedClient::new(
            Http::new(url),
            &config.name,
            config
                .max_concurrent_requests
                .unwrap_or(common.options.max_concurrent_requests),
            config
                .max_requests_per_second
                .unwrap_or(common.options.max_requests_per_second),
            common.metrics.clone(),
        );
        Ok(Self::new(client, config.name.clone(), config.chain_id, common))
    }
}

impl<P: JsonRpcClient + 'static> RequestQueue<P> {
    pub fn new(client: RateLimitedClient<P>, network: String, chain_id: u64, common: &Common) -> Self {
        Self {
            provider: Provider::new(client),
            network,
            chain_id,
            request_timeout: common.options.request_timeout(),
            max_retries: common.options.max_retries,
            splitter: Arc::new(Bisect),
            metrics: common.metrics.clone(),
        }
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn RangeSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Verify the node serves the configured chain. Called once at startup.
    pub async fn validate_chain_id(&self) -> PonderResult<()> {
        let actual = ChainClient::chain_id(self).await?;
        if actual != self.chain_id {
            return Err(PonderError::InvalidChainResponse(format!(
                "[{}] chain id mismatch: expected {}, node reports {}",
                self.network, self.chain_id, actual
            )));
        }
        info!("[{}] Connected to chain {}", self.network, actual);
        Ok(())
    }

    async fn with_retry<T, F, Fut>(
        &self,
        method: &'static str,
        f: F,
    ) -> Result<T, (RpcFailure, String)>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let error = match tokio::time::timeout(self.request_timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => format!("{e:?}"),
                Err(_) => format!("request timed out after {:?}", self.request_timeout),
            };
            let failure = classify_rpc_error(&error);
            self.metrics
                .rpc_request_errors
                .with_label_values(&[
                    &self.network,
                    method,
                    match failure {
                        RpcFailure::Transient => "transient",
                        RpcFailure::Permanent => "permanent",
                        RpcFailure::RangeTooLarge => "range_too_large",
                    },
                ])
                .inc();
            match failure {
                RpcFailure::Transient if attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "[{}] {} failed (attempt {}/{}), retrying in {:?}: {}",
                        self.network,
                        method,
                        attempt + 1,
                        self.max_retries,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err((failure, error)),
            }
        }
    }

    fn to_error(&self, (failure, message): (RpcFailure, String)) -> PonderError {
        match failure {
            RpcFailure::Transient => PonderError::TransientRpc(message),
            // An unsplittable too-large response is a node-side cap we
            // cannot work around.
            RpcFailure::Permanent | RpcFailure::RangeTooLarge => {
                PonderError::PermanentRpc(message)
            }
        }
    }

    fn build_filter(selection: &LogSelection, from: u64, to: u64) -> Filter {
        let mut filter = Filter::new().from_block(from).to_block(to);
        match selection.addresses.len() {
            0 => {}
            1 => filter = filter.address(selection.addresses[0]),
            _ => filter = filter.address(selection.addresses.clone()),
        }
        let topics: Vec<Option<ethers::types::Topic>> = selection
            .topics
            .iter()
            .map(|slot| {
                slot.as_ref().map(|values| {
                    values
                        .iter()
                        .copied()
                        .collect::<Vec<H256>>()
                        .into()
                })
            })
            .collect();
        filter.topics = [
            topics[0].clone(),
            topics[1].clone(),
            topics[2].clone(),
            topics[3].clone(),
        ];
        filter
    }

    fn get_logs_inner<'a>(
        &'a self,
        selection: &'a LogSelection,
        from: u64,
        to: u64,
    ) -> BoxFuture<'a, PonderResult<Vec<Log>>> {
        async move {
            let filter = Self::build_filter(selection, from, to);
            match self
                .with_retry("eth_getLogs", || self.provider.get_logs(&filter))
                .await
            {
                Ok(logs) => Ok(logs),
                Err((RpcFailure::RangeTooLarge, message)) if from < to => {
                    let ranges = self
                        .splitter
                        .propose(from, to, &message)
                        .unwrap_or_else(|| {
                            Bisect
                                .propose(from, to, &message)
                                .expect("from < to always bisects")
                        });
                    debug!(
                        "[{}] eth_getLogs [{from}, {to}] too large, retrying as {} sub-ranges",
                        self.network,
                        ranges.len()
                    );
                    let futures = ranges
                        .into_iter()
                        .map(|(f, t)| self.get_logs_inner(selection, f, t));
                    let nested = futures::future::try_join_all(futures).await?;
                    Ok(nested.into_iter().flatten().collect())
                }
                Err(failure) => Err(self.to_error(failure)),
            }
        }
        .boxed()
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    // 0.5s, 1s, 2s, 4s, ... capped at 30s.
    Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6))).min(Duration::from_secs(30))
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainClient for RequestQueue<P> {
    async fn chain_id(&self) -> PonderResult<u64> {
        self.with_retry("eth_chainId", || self.provider.get_chainid())
            .await
            .map(|id| id.as_u64())
            .map_err(|e| self.to_error(e))
    }

    async fn latest_block(&self) -> PonderResult<Block<Transaction>> {
        self.with_retry("eth_getBlockByNumber", || {
            self.provider.get_block_with_txs(BlockNumber::Latest)
        })
        .await
        .map_err(|e| self.to_error(e))?
        .ok_or_else(|| PonderError::InvalidChainResponse("node has no latest block".to_string()))
    }

    async fn block_by_number(&self, number: u64) -> PonderResult<Block<Transaction>> {
        self.with_retry("eth_getBlockByNumber", || {
            self.provider.get_block_with_txs(BlockId::from(number))
        })
        .await
        .map_err(|e| self.to_error(e))?
        .ok_or(PonderError::BlockNotFound {
            chain_id: self.chain_id,
            block: number.to_string(),
        })
    }

    async fn block_by_hash(&self, hash: H256) -> PonderResult<Block<Transaction>> {
        self.with_retry("eth_getBlockByHash", || {
            self.provider.get_block_with_txs(BlockId::from(hash))
        })
        .await
        .map_err(|e| self.to_error(e))?
        .ok_or(PonderError::BlockNotFound {
            chain_id: self.chain_id,
            block: format!("{hash:?}"),
        })
    }

    async fn logs(&self, selection: &LogSelection, from: u64, to: u64) -> PonderResult<Vec<Log>> {
        self.get_logs_inner(selection, from, to).await
    }

    async fn transaction_receipt(&self, hash: H256) -> PonderResult<TransactionReceipt> {
        self.with_retry("eth_getTransactionReceipt", || {
            self.provider.get_transaction_receipt(hash)
        })
        .await
        .map_err(|e| self.to_error(e))?
        .ok_or(PonderError::TransactionReceiptNotFound {
            chain_id: self.chain_id,
            hash: format!("{hash:?}"),
        })
    }

    async fn call(&self, to: Address, data: Bytes, block: u64) -> PonderResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.with_retry("eth_call", || {
            self.provider.call(&tx, Some(BlockId::from(block)))
        })
        .await
        .map_err(|e| self.to_error(e))
    }
}
