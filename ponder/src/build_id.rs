// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Content-addressed build identity.
//!
//! A build ID names a (handler code, schema, config) triple. Any change
//! produces a new ID, which gives a fresh set of live tables while the
//! finalized cache for unchanged upstream builds stays reusable. Hashing is
//! over stably ordered inputs so the ID is identical across platforms.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::config::PonderConfig;
use crate::schema::Schema;

/// Hex length of a build ID and of physical table-name hashes.
pub const BUILD_ID_LEN: usize = 10;

/// Handler source material supplied by the host. `upstream` lists the names
/// of handlers whose effects this handler depends on; their hashes feed into
/// this handler's hash so a change anywhere upstream invalidates the build.
#[derive(Debug, Clone)]
pub struct HandlerSource {
    pub name: String,
    pub source: String,
    pub upstream: Vec<String>,
}

pub fn build_id(config: &PonderConfig, schema: &Schema, handlers: &[HandlerSource]) -> String {
    let mut hasher = Sha256::new();

    // Config subset: only fields that affect indexing output.
    let mut networks: Vec<_> = config
        .networks
        .iter()
        .map(|n| (n.name.clone(), n.chain_id))
        .collect();
    networks.sort();
    for (name, chain_id) in networks {
        hasher.update(name.as_bytes());
        hasher.update(chain_id.to_be_bytes());
    }
    let mut contracts: Vec<String> = config
        .contracts
        .iter()
        .map(|c| {
            serde_json::to_string(&(
                &c.name,
                &c.network,
                &c.address,
                &c.factory,
                c.start_block,
                c.end_block,
                &c.filter,
                c.include_transaction_receipts,
                &c.event_names,
            ))
            .expect("contract config serialization is infallible")
        })
        .collect();
    contracts.sort();
    for contract in contracts {
        hasher.update(contract.as_bytes());
    }

    hasher.update(schema.to_stable_json().as_bytes());

    let handler_hashes = handler_hashes(handlers);
    for (name, hash) in &handler_hashes {
        hasher.update(name.as_bytes());
        hasher.update(hash.as_bytes());
    }

    hex::encode(hasher.finalize())[..BUILD_ID_LEN].to_string()
}

/// Per-handler content hashes including resolved upstream hashes. Upstream
/// resolution is iterative to a fixed point, which also terminates for
/// cyclic handler dependencies.
pub fn handler_hashes(handlers: &[HandlerSource]) -> BTreeMap<String, String> {
    let mut hashes: BTreeMap<String, String> = handlers
        .iter()
        .map(|h| (h.name.clone(), hash_str(&h.source)))
        .collect();

    for _ in 0..handlers.len() {
        let mut next = BTreeMap::new();
        for handler in handlers {
            let mut hasher = Sha256::new();
            hasher.update(handler.source.as_bytes());
            let mut upstream = handler.upstream.clone();
            upstream.sort();
            for dep in upstream {
                if let Some(hash) = hashes.get(&dep) {
                    hasher.update(hash.as_bytes());
                }
            }
            next.insert(handler.name.clone(), hex::encode(hasher.finalize()));
        }
        if next == hashes {
            break;
        }
        hashes = next;
    }
    hashes
}

fn hash_str(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, NetworkConfig, PonderConfig};
    use crate::schema::Scalar;

    fn config() -> PonderConfig {
        PonderConfig {
            networks: vec![NetworkConfig {
                name: "mainnet".to_string(),
                chain_id: 1,
                transport: "http://localhost:8545".to_string(),
                polling_interval_ms: None,
                max_requests_per_second: None,
                max_concurrent_requests: None,
            }],
            contracts: vec![],
            database: DatabaseConfig::Sqlite {
                directory: "/tmp/ponder".into(),
            },
            options: None,
        }
    }

    fn schema() -> Schema {
        Schema::builder()
            .table("Pet", |t| t.id(Scalar::String).column("name", Scalar::String))
            .build()
            .unwrap()
    }

    fn handler(name: &str, source: &str, upstream: &[&str]) -> HandlerSource {
        HandlerSource {
            name: name.to_string(),
            source: source.to_string(),
            upstream: upstream.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_deterministic() {
        let handlers = vec![handler("Pet:Created", "fn a() {}", &[])];
        let a = build_id(&config(), &schema(), &handlers);
        let b = build_id(&config(), &schema(), &handlers);
        assert_eq!(a, b);
        assert_eq!(a.len(), BUILD_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_source_change_changes_id() {
        let before = build_id(
            &config(),
            &schema(),
            &[handler("Pet:Created", "fn a() {}", &[])],
        );
        let after = build_id(
            &config(),
            &schema(),
            &[handler("Pet:Created", "fn a() { /* edited */ }", &[])],
        );
        assert_ne!(before, after);
    }

    #[test]
    fn test_schema_change_changes_id() {
        let handlers = vec![handler("Pet:Created", "fn a() {}", &[])];
        let other_schema = Schema::builder()
            .table("Pet", |t| {
                t.id(Scalar::String)
                    .column("name", Scalar::String)
                    .optional_column("age", Scalar::Int)
            })
            .build()
            .unwrap();
        assert_ne!(
            build_id(&config(), &schema(), &handlers),
            build_id(&config(), &other_schema, &handlers)
        );
    }

    #[test]
    fn test_upstream_change_propagates() {
        let before = handler_hashes(&[
            handler("A", "a-v1", &[]),
            handler("B", "b", &["A"]),
        ]);
        let after = handler_hashes(&[
            handler("A", "a-v2", &[]),
            handler("B", "b", &["A"]),
        ]);
        // B's own source is unchanged but its hash moves with A's.
        assert_ne!(before.get("B"), after.get("B"));
    }

    #[test]
    fn test_upstream_order_is_irrelevant() {
        let a = handler_hashes(&[
            handler("A", "a", &[]),
            handler("B", "b", &[]),
            handler("C", "c", &["A", "B"]),
        ]);
        let b = handler_hashes(&[
            handler("A", "a", &[]),
            handler("B", "b", &[]),
            handler("C", "c", &["B", "A"]),
        ]);
        assert_eq!(a.get("C"), b.get("C"));
    }
}
