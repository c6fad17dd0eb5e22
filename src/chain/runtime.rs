//! Live runtime metadata per network, refetched after runtime upgrades

use super::ChainConnector;
use crate::error::{WatcherError, WatcherResult};
use crate::events::{RuntimeMetadata, TypeRegistry};
use crate::tx::hex_bytes;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Type registry of one network, following the runtime its node runs
pub struct RuntimeTypes {
    network: String,
    /// Static table, kept as the fallback beneath any fetched metadata
    base: TypeRegistry,
    current: RwLock<Arc<TypeRegistry>>,
}

impl RuntimeTypes {
    pub fn new(network: &str, base: TypeRegistry) -> Self {
        Self {
            network: network.to_string(),
            current: RwLock::new(Arc::new(base.clone())),
            base,
        }
    }

    pub async fn registry(&self) -> Arc<TypeRegistry> {
        self.current.read().await.clone()
    }

    /// Load the node's metadata unless its spec version is already loaded.
    /// Returns whether the registry changed.
    pub async fn refresh(&self, connector: &dyn ChainConnector) -> WatcherResult<bool> {
        let version = connector
            .send("state_getRuntimeVersion", Value::Array(vec![]))
            .await?;
        let spec_version = version
            .get("specVersion")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                WatcherError::Decode(format!("runtime version without specVersion: {}", version))
            })?;

        if self.registry().await.spec_version() == Some(spec_version) {
            debug!("Runtime {} of {} already loaded", spec_version, self.network);
            return Ok(false);
        }

        let raw = match connector
            .send("state_getMetadata", Value::Array(vec![]))
            .await?
        {
            Value::String(raw) => hex_bytes(&raw)?,
            other => {
                return Err(WatcherError::Decode(format!(
                    "unexpected state_getMetadata result: {}",
                    other
                )))
            }
        };
        let runtime = RuntimeMetadata::decode(&raw, spec_version)?;
        let registry = self.base.clone().with_runtime(Arc::new(runtime));
        *self.current.write().await = Arc::new(registry);

        crate::metrics::record_runtime_version(&self.network, spec_version);
        info!(
            "Loaded runtime {} metadata for {} ({} bytes)",
            spec_version,
            self.network,
            raw.len()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::*;
    use crate::events::metadata::fixtures::metadata_bytes;

    #[tokio::test]
    async fn test_refresh_follows_spec_version() {
        let fake = FakeConnector::new();
        fake.set_runtime(9_420, metadata_bytes(14));
        let types = RuntimeTypes::new("Polkadot", TypeRegistry::polkadot());
        assert_eq!(types.registry().await.spec_version(), None);

        assert!(types.refresh(&*fake).await.unwrap());
        assert_eq!(types.registry().await.spec_version(), Some(9_420));
        assert!(!types.refresh(&*fake).await.unwrap());
        assert_eq!(fake.metadata_fetches(), 1);

        // runtime upgrade
        fake.set_runtime(9_430, metadata_bytes(15));
        assert!(types.refresh(&*fake).await.unwrap());
        assert_eq!(types.registry().await.spec_version(), Some(9_430));
        assert_eq!(fake.metadata_fetches(), 2);
        assert_eq!(types.registry().await.spec_name, "polkadot");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_static_table() {
        let fake = FakeConnector::new();
        let types = RuntimeTypes::new("Polkadot", TypeRegistry::polkadot());
        assert!(types.refresh(&*fake).await.is_err());

        fake.set_runtime(9_420, b"garbage".to_vec());
        assert!(matches!(
            types.refresh(&*fake).await,
            Err(WatcherError::Decode(_))
        ));
        let registry = types.registry().await;
        assert!(registry.runtime.is_none());
        assert!(registry.lookup_call(&[5, 3]).is_ok());
    }
}
