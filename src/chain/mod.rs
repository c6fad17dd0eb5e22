//! Chain module - per-network node connections and finality watching
//!
//! This module provides:
//! - The `ChainConnector` contract for one-shot RPC calls and push subscriptions
//! - A WebSocket JSON-RPC connector
//! - Block/event matching for a target extrinsic
//! - Runtime metadata tracking per network
//! - The per-transaction confirmation watcher

pub mod finality;
pub mod matcher;
pub mod provider;
pub mod runtime;

pub use finality::{ConfirmationWatcher, WatchEvent};
pub use matcher::BlockLookup;
pub use provider::WsConnector;
pub use runtime::RuntimeTypes;

use crate::config::{NetworkConfig, Settings};
use crate::error::{WatcherError, WatcherResult};
use crate::events::TypeRegistry;

use alloy_primitives::B256;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Live push subscription
pub struct Subscription {
    pub id: String,
    pub unsubscribe_method: String,
    /// Notification payloads, or transport errors affecting the subscription
    pub notifications: mpsc::UnboundedReceiver<WatcherResult<Value>>,
}

/// RPC access to one network's node
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// One-shot request
    async fn send(&self, method: &str, params: Value) -> WatcherResult<Value>;

    async fn subscribe(
        &self,
        method: &str,
        unsubscribe_method: &str,
        params: Value,
    ) -> WatcherResult<Subscription>;

    async fn unsubscribe(&self, unsubscribe_method: &str, id: &str) -> WatcherResult<()>;
}

/// A connected network and the metadata needed to watch it
pub struct NetworkHandle {
    pub key: String,
    pub name: String,
    pub genesis_hash: B256,
    pub explorer_url: Option<String>,
    pub types: RuntimeTypes,
    pub connector: Arc<dyn ChainConnector>,
}

impl NetworkHandle {
    /// Registry for the runtime the node last reported
    pub async fn registry(&self) -> Arc<TypeRegistry> {
        self.types.registry().await
    }

    pub async fn refresh_runtime(&self) -> WatcherResult<bool> {
        self.types.refresh(self.connector.as_ref()).await
    }

    /// Look for `target` in a block. A block whose events cannot be read is
    /// retried once after picking up a newer runtime's metadata.
    pub async fn find_in_block(&self, block_hash: &B256, target: &B256) -> BlockLookup {
        let registry = self.registry().await;
        let lookup =
            matcher::find_in_block(self.connector.as_ref(), &registry, block_hash, target).await;
        if !matches!(lookup, BlockLookup::TransportError(_)) {
            return lookup;
        }

        match self.refresh_runtime().await {
            Ok(true) => {
                let registry = self.registry().await;
                matcher::find_in_block(self.connector.as_ref(), &registry, block_hash, target)
                    .await
            }
            Ok(false) => lookup,
            Err(e) => {
                debug!("Runtime refresh for {} failed: {}", self.name, e);
                lookup
            }
        }
    }

    /// Block explorer link for an extrinsic
    pub fn explorer_link(&self, hash: &B256, location: Option<(u64, u32)>) -> Option<String> {
        let base = self.explorer_url.as_deref()?.trim_end_matches('/');
        Some(match location {
            Some((block, index)) => format!("{}/extrinsic/{}-{}", base, block, index),
            None => format!("{}/extrinsic/{}", base, hash),
        })
    }

    /// Tags attached to reported errors
    pub fn tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("network", self.name.clone()),
            ("genesis_hash", self.genesis_hash.to_string()),
        ]
    }

    async fn health_check(&self) -> bool {
        match self.connector.send("system_health", Value::Array(vec![])).await {
            Ok(health) => {
                let syncing = health
                    .get("isSyncing")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if syncing {
                    info!("Network {} node is still syncing", self.name);
                }
                true
            }
            Err(e) => {
                error!("Health check failed for network {}: {}", self.name, e);
                false
            }
        }
    }
}

/// Manages connections to all configured networks
pub struct ChainManager {
    /// Networks indexed by genesis hash
    networks: DashMap<B256, Arc<NetworkHandle>>,
}

impl ChainManager {
    /// Connect to every enabled network
    pub async fn new(settings: &Settings) -> WatcherResult<Self> {
        let manager = Self::empty();

        for (key, network_config) in settings.enabled_networks() {
            info!(
                "Initializing network {} ({})",
                network_config.name, network_config.genesis_hash
            );

            let handle = Self::connect(key, network_config).await?;
            if let Err(e) = handle.refresh_runtime().await {
                warn!(
                    "No runtime metadata for {} ({}), decoding with the static registry",
                    network_config.name, e
                );
            }
            manager.insert(Arc::new(handle));

            info!("Network {} initialized successfully", network_config.name);
        }

        Ok(manager)
    }

    pub fn empty() -> Self {
        Self {
            networks: DashMap::new(),
        }
    }

    async fn connect(key: &str, config: &NetworkConfig) -> WatcherResult<NetworkHandle> {
        let genesis_hash = config.genesis_hash()?;
        let registry = match &config.registry_path {
            Some(path) => TypeRegistry::from_json_file(path)?,
            None => TypeRegistry::polkadot(),
        };
        let connector = WsConnector::connect(&config.name, &config.ws_url).await?;

        Ok(NetworkHandle {
            key: key.to_string(),
            name: config.name.clone(),
            genesis_hash,
            explorer_url: config.explorer_url.clone(),
            types: RuntimeTypes::new(&config.name, registry),
            connector: Arc::new(connector),
        })
    }

    pub fn insert(&self, handle: Arc<NetworkHandle>) {
        self.networks.insert(handle.genesis_hash, handle);
    }

    /// Get a network by genesis hash
    pub fn get(&self, genesis_hash: &B256) -> WatcherResult<Arc<NetworkHandle>> {
        self.networks
            .get(genesis_hash)
            .map(|n| n.clone())
            .ok_or_else(|| WatcherError::NetworkNotFound {
                network: genesis_hash.to_string(),
            })
    }

    /// Health check for all networks
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let handles: Vec<Arc<NetworkHandle>> =
            self.networks.iter().map(|e| e.value().clone()).collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let healthy = handle.health_check().await;
            crate::metrics::record_chain_health(&handle.name, healthy);
            results.push((handle.name.clone(), healthy));
        }
        results
    }

    /// Pick up runtime upgrades on every network
    pub async fn refresh_runtimes(&self) {
        let handles: Vec<Arc<NetworkHandle>> =
            self.networks.iter().map(|e| e.value().clone()).collect();

        for handle in handles {
            if let Err(e) = handle.refresh_runtime().await {
                warn!("Runtime refresh for {} failed: {}", handle.name, e);
            }
        }
    }

    /// Names of all connected networks
    pub fn connected_networks(&self) -> Vec<String> {
        self.networks.iter().map(|e| e.value().name.clone()).collect()
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted in-process connector

    use super::*;
    use crate::tx::blake2_256;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub const FINALIZED: &str = "chain_subscribeFinalizedHeads";
    pub const NEW_HEADS: &str = "chain_subscribeNewHeads";

    struct FakeBlock {
        number: u64,
        extrinsics: Vec<Vec<u8>>,
        events: Option<Vec<u8>>,
    }

    #[derive(Default)]
    struct FakeState {
        blocks: HashMap<B256, FakeBlock>,
        hashes: HashMap<u64, B256>,
        subscribers: HashMap<String, Vec<(String, mpsc::UnboundedSender<WatcherResult<Value>>)>>,
        unsubscribed: Vec<(String, String)>,
        failing: Vec<String>,
        next_id: u64,
        runtime: Option<(u32, Vec<u8>)>,
        metadata_fetches: usize,
    }

    /// Connector serving blocks and events from memory
    #[derive(Default)]
    pub struct FakeConnector {
        state: Mutex<FakeState>,
    }

    impl FakeConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Store a block; returns its hash
        pub fn add_block(&self, number: u64, extrinsics: Vec<Vec<u8>>, events: Vec<u8>) -> B256 {
            let mut raw = [0xbb; 32];
            raw[24..].copy_from_slice(&number.to_be_bytes());
            let hash = B256::from(raw);

            let mut state = self.state.lock().unwrap();
            state.hashes.insert(number, hash);
            state.blocks.insert(
                hash,
                FakeBlock {
                    number,
                    extrinsics,
                    events: Some(events),
                },
            );
            hash
        }

        /// Serve `state_getRuntimeVersion` and `state_getMetadata`
        pub fn set_runtime(&self, spec_version: u32, metadata: Vec<u8>) {
            self.state.lock().unwrap().runtime = Some((spec_version, metadata));
        }

        pub fn metadata_fetches(&self) -> usize {
            self.state.lock().unwrap().metadata_fetches
        }

        /// Make every request for `method` fail
        pub fn fail(&self, method: &str) {
            self.state.lock().unwrap().failing.push(method.to_string());
        }

        pub fn subscriber_count(&self, method: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .subscribers
                .get(method)
                .map(|s| s.len())
                .unwrap_or(0)
        }

        /// Subscriptions torn down so far as `(unsubscribe_method, id)`
        pub fn unsubscribed(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().unsubscribed.clone()
        }

        /// Yield until a subscriber for `method` exists
        pub async fn wait_for_subscriber(&self, method: &str) {
            for _ in 0..10_000 {
                if self.subscriber_count(method) > 0 {
                    return;
                }
                tokio::task::yield_now().await;
            }
            panic!("nobody subscribed to {}", method);
        }

        /// Push a header for block `number` to all subscribers of `method`
        pub fn push_header(&self, method: &str, number: u64) {
            let header = json!({ "number": format!("0x{:x}", number) });
            self.push(method, || Ok(header.clone()));
        }

        pub fn push_error(&self, method: &str, message: &str) {
            self.push(method, || Err(WatcherError::Subscription(message.to_string())));
        }

        fn push(&self, method: &str, item: impl Fn() -> WatcherResult<Value>) {
            let state = self.state.lock().unwrap();
            for (_, sender) in state.subscribers.get(method).into_iter().flatten() {
                let _ = sender.send(item());
            }
        }

        fn block_json(block: &FakeBlock) -> Value {
            json!({
                "block": {
                    "header": { "number": format!("0x{:x}", block.number) },
                    "extrinsics": block
                        .extrinsics
                        .iter()
                        .map(|e| format!("0x{}", hex::encode(e)))
                        .collect::<Vec<_>>(),
                },
                "justifications": null,
            })
        }
    }

    /// Opaque extrinsic bytes and their hash
    pub fn extrinsic(seed: u8) -> (Vec<u8>, B256) {
        let bytes = vec![0x10, 0x84, seed, seed, seed];
        let hash = blake2_256(&bytes);
        (bytes, hash)
    }

    fn param_hash(params: &Value, index: usize) -> WatcherResult<B256> {
        params
            .get(index)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<B256>().ok())
            .ok_or_else(|| WatcherError::Rpc {
                code: -32602,
                message: "invalid params".to_string(),
            })
    }

    #[async_trait]
    impl ChainConnector for FakeConnector {
        async fn send(&self, method: &str, params: Value) -> WatcherResult<Value> {
            let mut state = self.state.lock().unwrap();
            if state.failing.iter().any(|m| m == method) {
                return Err(WatcherError::ChainConnection {
                    network: "fake".to_string(),
                    message: format!("{} unavailable", method),
                });
            }

            match method {
                "chain_getBlockHash" => {
                    let number = params.get(0).and_then(Value::as_u64).unwrap_or_default();
                    Ok(state
                        .hashes
                        .get(&number)
                        .map(|h| Value::String(h.to_string()))
                        .unwrap_or(Value::Null))
                }
                "chain_getBlock" => {
                    let hash = param_hash(&params, 0)?;
                    Ok(state
                        .blocks
                        .get(&hash)
                        .map(Self::block_json)
                        .unwrap_or(Value::Null))
                }
                "state_getStorage" => {
                    let hash = param_hash(&params, 1)?;
                    Ok(state
                        .blocks
                        .get(&hash)
                        .and_then(|b| b.events.as_ref())
                        .map(|e| Value::String(format!("0x{}", hex::encode(e))))
                        .unwrap_or(Value::Null))
                }
                "system_health" => Ok(json!({ "peers": 3, "isSyncing": false, "shouldHavePeers": true })),
                "state_getRuntimeVersion" if state.runtime.is_some() => {
                    let spec_version = state.runtime.as_ref().map(|(v, _)| *v);
                    Ok(json!({ "specName": "polkadot", "specVersion": spec_version }))
                }
                "state_getMetadata" if state.runtime.is_some() => {
                    state.metadata_fetches += 1;
                    let metadata = state.runtime.as_ref().map(|(_, m)| hex::encode(m));
                    Ok(Value::String(format!("0x{}", metadata.unwrap_or_default())))
                }
                other => Err(WatcherError::Rpc {
                    code: -32601,
                    message: format!("method {} not found", other),
                }),
            }
        }

        async fn subscribe(
            &self,
            method: &str,
            unsubscribe_method: &str,
            _params: Value,
        ) -> WatcherResult<Subscription> {
            let mut state = self.state.lock().unwrap();
            if state.failing.iter().any(|m| m == method) {
                return Err(WatcherError::Subscription(format!("{} refused", method)));
            }

            state.next_id += 1;
            let id = format!("sub-{}", state.next_id);
            let (tx, rx) = mpsc::unbounded_channel();
            state
                .subscribers
                .entry(method.to_string())
                .or_default()
                .push((id.clone(), tx));

            Ok(Subscription {
                id,
                unsubscribe_method: unsubscribe_method.to_string(),
                notifications: rx,
            })
        }

        async fn unsubscribe(&self, unsubscribe_method: &str, id: &str) -> WatcherResult<()> {
            let mut state = self.state.lock().unwrap();
            for subscribers in state.subscribers.values_mut() {
                subscribers.retain(|(sub_id, _)| sub_id != id);
            }
            state
                .unsubscribed
                .push((unsubscribe_method.to_string(), id.to_string()));
            Ok(())
        }
    }

    /// Network handle around a fake connector
    pub fn network(connector: Arc<FakeConnector>) -> Arc<NetworkHandle> {
        Arc::new(NetworkHandle {
            key: "polkadot".to_string(),
            name: "Polkadot".to_string(),
            genesis_hash: crate::tx::payload::fixtures::GENESIS.parse().unwrap(),
            explorer_url: Some("https://polkadot.subscan.io".to_string()),
            types: RuntimeTypes::new("Polkadot", TypeRegistry::polkadot()),
            connector,
        })
    }
}
