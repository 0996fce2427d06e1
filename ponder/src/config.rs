// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Config surface recognized by the engine. File loading and watching are
//! the host's responsibility; the engine receives these values directly.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    /// HTTP JSON-RPC endpoint.
    pub transport: String,
    #[serde(default)]
    pub polling_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_requests_per_second: Option<u32>,
    #[serde(default)]
    pub max_concurrent_requests: Option<u32>,
}

/// Where a factory log carries the child address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChildAddressLocation {
    Topic1,
    Topic2,
    Topic3,
    /// Byte offset into the (ABI-encoded) data section.
    Offset(usize),
}

impl TryFrom<String> for ChildAddressLocation {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "topic1" => Ok(ChildAddressLocation::Topic1),
            "topic2" => Ok(ChildAddressLocation::Topic2),
            "topic3" => Ok(ChildAddressLocation::Topic3),
            other => other
                .strip_prefix("offset")
                .and_then(|n| n.parse::<usize>().ok())
                .map(ChildAddressLocation::Offset)
                .ok_or_else(|| format!("invalid child address location: {other:?}")),
        }
    }
}

impl From<ChildAddressLocation> for String {
    fn from(loc: ChildAddressLocation) -> String {
        match loc {
            ChildAddressLocation::Topic1 => "topic1".to_string(),
            ChildAddressLocation::Topic2 => "topic2".to_string(),
            ChildAddressLocation::Topic3 => "topic3".to_string(),
            ChildAddressLocation::Offset(n) => format!("offset{n}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// The factory contract address.
    pub address: String,
    /// Topic0 of the child-creation event.
    pub event_selector: String,
    pub child_address_location: ChildAddressLocation,
}

/// Optional topic constraints applied on top of a contract's address filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilterConfig {
    #[serde(default)]
    pub topic0: Option<Vec<String>>,
    #[serde(default)]
    pub topic1: Option<Vec<String>>,
    #[serde(default)]
    pub topic2: Option<Vec<String>>,
    #[serde(default)]
    pub topic3: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub name: String,
    /// Name of the network this deployment lives on.
    pub network: String,
    /// Static address(es). Mutually exclusive with `factory`.
    #[serde(default)]
    pub address: Option<Vec<String>>,
    #[serde(default)]
    pub factory: Option<FactoryConfig>,
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub filter: Option<EventFilterConfig>,
    #[serde(default)]
    pub include_transaction_receipts: bool,
    /// topic0 (hex) → event name, produced by the host's ABI tooling. Used
    /// to route logs to indexing functions named `"{contract}:{event}"`.
    #[serde(default)]
    pub event_names: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite {
        directory: PathBuf,
    },
    Postgres {
        connection_string: String,
        #[serde(default)]
        user_namespace: Option<String>,
    },
}

/// Engine tuning knobs; every component receives these through
/// [`crate::common::Common`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub max_block_range: u64,
    pub finality_block_count: u64,
    pub lease_ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_concurrency: usize,
    pub polling_interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub max_requests_per_second: u32,
    pub max_concurrent_requests: u32,
    /// Sync chunks processed concurrently per network.
    pub historical_concurrency: usize,
    /// Rows per page when draining the sync store into the event stream.
    pub events_page_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_block_range: 10_000,
            finality_block_count: 64,
            lease_ttl_ms: 60_000,
            heartbeat_interval_ms: 10_000,
            max_concurrency: 8,
            polling_interval_ms: 1_000,
            stall_timeout_ms: 120_000,
            request_timeout_ms: 10_000,
            max_retries: 5,
            max_requests_per_second: 50,
            max_concurrent_requests: 10,
            historical_concurrency: 4,
            events_page_size: 1_000,
        }
    }
}

impl Options {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PonderConfig {
    pub networks: Vec<NetworkConfig>,
    pub contracts: Vec<ContractConfig>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub options: Option<Options>,
}

impl PonderConfig {
    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn user_namespace(&self) -> String {
        match &self.database {
            DatabaseConfig::Postgres {
                user_namespace: Some(ns),
                ..
            } => ns.clone(),
            _ => "public".to_string(),
        }
    }
}
