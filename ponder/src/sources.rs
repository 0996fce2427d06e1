// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Translates the contract configuration into runtime sync specs (log
//! filters, factories) and the registry that routes stored logs back to
//! named indexing functions.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use ethers::types::{Address, H256};
use sha2::{Digest, Sha256};

use crate::config::{ContractConfig, PonderConfig};
use crate::error::{PonderError, PonderResult};
use crate::rpc::LogSelection;
use crate::sync::types::{FactorySpec, LogFilterSpec, SyncLog};

#[derive(Debug, Clone)]
pub struct SourceFilter {
    pub contract: String,
    pub network: String,
    pub spec: LogFilterSpec,
    pub start_block: u64,
    pub end_block: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SourceFactory {
    pub contract: String,
    pub network: String,
    pub spec: FactorySpec,
    pub start_block: u64,
    pub end_block: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct Sources {
    pub filters: Vec<SourceFilter>,
    pub factories: Vec<SourceFactory>,
    pub registry: SourceRegistry,
}

impl Sources {
    pub fn for_chain(&self, chain_id: u64) -> (Vec<SourceFilter>, Vec<SourceFactory>) {
        (
            self.filters
                .iter()
                .filter(|f| f.spec.chain_id == chain_id)
                .cloned()
                .collect(),
            self.factories
                .iter()
                .filter(|f| f.spec.chain_id == chain_id)
                .cloned()
                .collect(),
        )
    }
}

/// Routes a stored log to `(contract, event)` for handler dispatch.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entries: Vec<RegistryEntry>,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    contract: String,
    network: String,
    chain_id: u64,
    /// `None` for factory sources, whose address set is dynamic.
    addresses: Option<HashSet<Address>>,
    /// The factory's own address; its creation logs are not user events.
    factory_address: Option<Address>,
    event_names: HashMap<H256, String>,
}

impl SourceRegistry {
    /// `(contract, event, network)` for a log, or `None` when no configured
    /// source claims it.
    pub fn label(&self, log: &SyncLog) -> Option<(&str, &str, &str)> {
        let topic0 = log.topic0?;
        self.entries.iter().find_map(|entry| {
            if entry.chain_id != log.chain_id {
                return None;
            }
            if let Some(addresses) = &entry.addresses {
                if !addresses.contains(&log.address) {
                    return None;
                }
            }
            if entry.factory_address == Some(log.address) {
                return None;
            }
            entry
                .event_names
                .get(&topic0)
                .map(|event| (entry.contract.as_str(), event.as_str(), entry.network.as_str()))
        })
    }
}

pub fn build_sources(config: &PonderConfig) -> PonderResult<Sources> {
    let mut sources = Sources::default();
    for contract in &config.contracts {
        let network = config.network(&contract.network).ok_or_else(|| {
            PonderError::InvalidConfig(format!(
                "contract '{}' references unknown network '{}'",
                contract.name, contract.network
            ))
        })?;
        let event_names = parse_event_names(contract)?;
        let topics = parse_topics(contract, &event_names)?;

        match (&contract.address, &contract.factory) {
            (Some(addresses), None) => {
                let addresses = addresses
                    .iter()
                    .map(|a| parse_address(a))
                    .collect::<PonderResult<Vec<_>>>()?;
                let selection = LogSelection {
                    addresses: addresses.clone(),
                    topics: topics.clone(),
                };
                let id = filter_id("lf", network.chain_id, &selection, contract);
                sources.filters.push(SourceFilter {
                    contract: contract.name.clone(),
                    network: contract.network.clone(),
                    spec: LogFilterSpec {
                        id,
                        chain_id: network.chain_id,
                        selection,
                        include_transaction_receipts: contract.include_transaction_receipts,
                    },
                    start_block: contract.start_block,
                    end_block: contract.end_block,
                });
                sources.registry.entries.push(RegistryEntry {
                    contract: contract.name.clone(),
                    network: contract.network.clone(),
                    chain_id: network.chain_id,
                    addresses: Some(addresses.into_iter().collect()),
                    factory_address: None,
                    event_names: event_names.clone(),
                });
            }
            (None, Some(factory)) => {
                let factory_address = parse_address(&factory.address)?;
                let event_selector = parse_h256(&factory.event_selector)?;
                let selection = LogSelection {
                    addresses: vec![factory_address],
                    topics: topics.clone(),
                };
                let id = filter_id("f", network.chain_id, &selection, contract);
                sources.factories.push(SourceFactory {
                    contract: contract.name.clone(),
                    network: contract.network.clone(),
                    spec: FactorySpec {
                        id,
                        chain_id: network.chain_id,
                        address: factory_address,
                        event_selector,
                        child_address_location: factory.child_address_location,
                        topics: topics.clone(),
                        include_transaction_receipts: contract.include_transaction_receipts,
                    },
                    start_block: contract.start_block,
                    end_block: contract.end_block,
                });
                sources.registry.entries.push(RegistryEntry {
                    contract: contract.name.clone(),
                    network: contract.network.clone(),
                    chain_id: network.chain_id,
                    addresses: None,
                    factory_address: Some(factory_address),
                    event_names: event_names.clone(),
                });
            }
            (Some(_), Some(_)) => {
                return Err(PonderError::InvalidConfig(format!(
                    "contract '{}' sets both 'address' and 'factory'",
                    contract.name
                )))
            }
            (None, None) => {
                return Err(PonderError::InvalidConfig(format!(
                    "contract '{}' needs either 'address' or 'factory'",
                    contract.name
                )))
            }
        }
    }
    Ok(sources)
}

fn parse_event_names(contract: &ContractConfig) -> PonderResult<HashMap<H256, String>> {
    contract
        .event_names
        .iter()
        .map(|(selector, name)| Ok((parse_h256(selector)?, name.clone())))
        .collect()
}

/// Topic constraints: an explicit filter wins; otherwise the registered
/// event selectors bound topic0 so unrelated logs are never fetched.
fn parse_topics(
    contract: &ContractConfig,
    event_names: &HashMap<H256, String>,
) -> PonderResult<[Option<Vec<H256>>; 4]> {
    let parse_slot = |slot: &Option<Vec<String>>| -> PonderResult<Option<Vec<H256>>> {
        slot.as_ref()
            .map(|values| values.iter().map(|v| parse_h256(v)).collect())
            .transpose()
    };
    let mut topics: [Option<Vec<H256>>; 4] = Default::default();
    if let Some(filter) = &contract.filter {
        topics = [
            parse_slot(&filter.topic0)?,
            parse_slot(&filter.topic1)?,
            parse_slot(&filter.topic2)?,
            parse_slot(&filter.topic3)?,
        ];
    }
    if topics[0].is_none() && !event_names.is_empty() && contract.factory.is_none() {
        let mut selectors: Vec<H256> = event_names.keys().copied().collect();
        selectors.sort();
        topics[0] = Some(selectors);
    }
    Ok(topics)
}

fn parse_address(s: &str) -> PonderResult<Address> {
    Address::from_str(s)
        .map_err(|_| PonderError::InvalidConfig(format!("invalid address: {s:?}")))
}

fn parse_h256(s: &str) -> PonderResult<H256> {
    H256::from_str(s).map_err(|_| PonderError::InvalidConfig(format!("invalid topic: {s:?}")))
}

/// Stable identity for a filter: the same configuration always maps to the
/// same interval rows across restarts.
fn filter_id(
    prefix: &str,
    chain_id: u64,
    selection: &LogSelection,
    contract: &ContractConfig,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chain_id.to_be_bytes());
    for address in &selection.addresses {
        hasher.update(address.as_bytes());
    }
    for slot in &selection.topics {
        match slot {
            None => hasher.update([0u8]),
            Some(values) => {
                hasher.update([1u8]);
                for value in values {
                    hasher.update(value.as_bytes());
                }
            }
        }
    }
    hasher.update([contract.include_transaction_receipts as u8]);
    format!("{prefix}_{}", &hex::encode(hasher.finalize())[..10])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ChildAddressLocation, DatabaseConfig, FactoryConfig, NetworkConfig,
    };
    use crate::sync::types::tests_support::{block_at, log_at, transaction_at};
    use std::collections::BTreeMap;

    fn base_config() -> PonderConfig {
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

    fn token_contract() -> ContractConfig {
        ContractConfig {
            name: "Token".to_string(),
            network: "mainnet".to_string(),
            address: Some(vec![format!("{:?}", Address::repeat_byte(0xaa))]),
            factory: None,
            start_block: 100,
            end_block: None,
            filter: None,
            include_transaction_receipts: false,
            event_names: BTreeMap::from([(
                format!("{:?}", H256::repeat_byte(0x11)),
                "Transfer".to_string(),
            )]),
        }
    }

    #[test]
    fn test_static_contract_becomes_log_filter() {
        let mut config = base_config();
        config.contracts.push(token_contract());
        let sources = build_sources(&config).unwrap();
        assert_eq!(sources.filters.len(), 1);
        assert!(sources.factories.is_empty());
        let filter = &sources.filters[0];
        assert_eq!(filter.spec.chain_id, 1);
        assert!(filter.spec.id.starts_with("lf_"));
        // topic0 is bounded by the registered event selectors.
        assert_eq!(
            filter.spec.selection.topics[0],
            Some(vec![H256::repeat_byte(0x11)])
        );
    }

    #[test]
    fn test_filter_ids_are_stable() {
        let mut config = base_config();
        config.contracts.push(token_contract());
        let a = build_sources(&config).unwrap().filters[0].spec.id.clone();
        let b = build_sources(&config).unwrap().filters[0].spec.id.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn test_factory_contract() {
        let mut config = base_config();
        config.contracts.push(ContractConfig {
            name: "Pool".to_string(),
            network: "mainnet".to_string(),
            address: None,
            factory: Some(FactoryConfig {
                address: format!("{:?}", Address::repeat_byte(0xfa)),
                event_selector: format!("{:?}", H256::repeat_byte(0x99)),
                child_address_location: ChildAddressLocation::Topic1,
            }),
            start_block: 0,
            end_block: None,
            filter: None,
            include_transaction_receipts: true,
            event_names: BTreeMap::from([(
                format!("{:?}", H256::repeat_byte(0x22)),
                "Swap".to_string(),
            )]),
        });
        let sources = build_sources(&config).unwrap();
        assert_eq!(sources.factories.len(), 1);
        let factory = &sources.factories[0];
        assert_eq!(factory.spec.address, Address::repeat_byte(0xfa));
        assert!(factory.spec.include_transaction_receipts);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = base_config();
        let mut contract = token_contract();
        contract.network = "base".to_string();
        config.contracts.push(contract);
        assert!(matches!(
            build_sources(&config),
            Err(PonderError::InvalidConfig(_))
        ));

        let mut config = base_config();
        let mut contract = token_contract();
        contract.address = None;
        config.contracts.push(contract);
        assert!(build_sources(&config).is_err());
    }

    #[test]
    fn test_registry_labels_logs() {
        let mut config = base_config();
        config.contracts.push(token_contract());
        let sources = build_sources(&config).unwrap();

        let block = block_at(1, 100, 1_000);
        let tx = transaction_at(1, &block, 0);
        let mut log = log_at(1, &block, &tx, 0, 1_000);
        log.address = Address::repeat_byte(0xaa);
        log.topic0 = Some(H256::repeat_byte(0x11));
        let (contract, event, network) = sources.registry.label(&log).unwrap();
        assert_eq!(contract, "Token");
        assert_eq!(event, "Transfer");
        assert_eq!(network, "mainnet");

        // Wrong address: unclaimed.
        log.address = Address::repeat_byte(0xbb);
        assert!(sources.registry.label(&log).is_none());

        // Unknown selector: unclaimed.
        log.address = Address::repeat_byte(0xaa);
        log.topic0 = Some(H256::repeat_byte(0x77));
        assert!(sources.registry.label(&log).is_none());
    }
}
