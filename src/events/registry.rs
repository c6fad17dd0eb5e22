//! Per-chain type registry: call and event layouts needed to assemble
//! extrinsics and walk `System.Events` storage.
//!
//! The static table covers a known runtime. Once the node's metadata has
//! been fetched it is attached as `runtime` and consulted first.

use super::metadata::RuntimeMetadata;
use crate::error::{WatcherError, WatcherResult};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Field types that may appear in an event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    U128,
    Bool,
    AccountId32,
    H256,
    /// Compact encoded unsigned integer
    Compact,
    /// Length prefixed byte vector
    Bytes,
    DispatchInfo,
    DispatchError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEntry {
    pub pallet_index: u8,
    pub call_index: u8,
    pub section: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub pallet_index: u8,
    pub variant_index: u8,
    pub section: String,
    pub method: String,
    #[serde(default)]
    pub fields: Vec<FieldType>,
}

/// Runtime type information for one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRegistry {
    pub spec_name: String,
    pub calls: Vec<CallEntry>,
    pub events: Vec<EventEntry>,
    #[serde(skip)]
    pub runtime: Option<Arc<RuntimeMetadata>>,
}

impl TypeRegistry {
    /// Load a registry from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> WatcherResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WatcherError::Config(format!("failed to read registry {:?}: {}", path, e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            WatcherError::Config(format!("failed to parse registry {:?}: {}", path, e))
        })
    }

    /// Same table, with the live runtime's metadata attached
    pub fn with_runtime(mut self, runtime: Arc<RuntimeMetadata>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn spec_version(&self) -> Option<u32> {
        self.runtime.as_ref().map(|r| r.spec_version)
    }

    /// Resolve the call at the start of SCALE encoded call data
    pub fn lookup_call(&self, call: &[u8]) -> WatcherResult<CallEntry> {
        let (pallet_index, call_index) = match call {
            [pallet, call, ..] => (*pallet, *call),
            _ => {
                return Err(WatcherError::InvalidPayload(format!(
                    "call data too short ({} bytes)",
                    call.len()
                )))
            }
        };
        if let Some(entry) = self
            .runtime
            .as_ref()
            .and_then(|r| r.lookup_call(pallet_index, call_index))
        {
            return Ok(entry);
        }
        self.calls
            .iter()
            .find(|c| c.pallet_index == pallet_index && c.call_index == call_index)
            .cloned()
            .ok_or(WatcherError::UnknownCall {
                pallet_index,
                call_index,
            })
    }

    pub fn lookup_event(&self, pallet_index: u8, variant_index: u8) -> Option<&EventEntry> {
        self.events
            .iter()
            .find(|e| e.pallet_index == pallet_index && e.variant_index == variant_index)
    }

    /// Built-in registry matching a Polkadot-like relay chain runtime
    pub fn polkadot() -> Self {
        use FieldType::*;

        let calls = [
            (0, 0, "system", "remark"),
            (0, 1, "system", "setHeapPages"),
            (0, 2, "system", "setCode"),
            (0, 7, "system", "remarkWithEvent"),
            (5, 0, "balances", "transferAllowDeath"),
            (5, 2, "balances", "forceTransfer"),
            (5, 3, "balances", "transferKeepAlive"),
            (5, 4, "balances", "transferAll"),
            (7, 0, "staking", "bond"),
            (7, 1, "staking", "bondExtra"),
            (7, 2, "staking", "unbond"),
            (7, 3, "staking", "withdrawUnbonded"),
            (7, 5, "staking", "nominate"),
            (7, 6, "staking", "chill"),
            (26, 0, "utility", "batch"),
            (26, 1, "utility", "asDerivative"),
            (26, 2, "utility", "batchAll"),
            (26, 4, "utility", "forceBatch"),
            (29, 0, "proxy", "proxy"),
        ]
        .into_iter()
        .map(|(pallet_index, call_index, section, method)| CallEntry {
            pallet_index,
            call_index,
            section: section.to_string(),
            method: method.to_string(),
        })
        .collect();

        let events = vec![
            (0, 0, "system", "ExtrinsicSuccess", vec![DispatchInfo]),
            (0, 1, "system", "ExtrinsicFailed", vec![DispatchError, DispatchInfo]),
            (0, 2, "system", "CodeUpdated", vec![]),
            (0, 3, "system", "NewAccount", vec![AccountId32]),
            (0, 4, "system", "KilledAccount", vec![AccountId32]),
            (0, 5, "system", "Remarked", vec![AccountId32, H256]),
            (5, 0, "balances", "Endowed", vec![AccountId32, U128]),
            (5, 1, "balances", "DustLost", vec![AccountId32, U128]),
            (5, 2, "balances", "Transfer", vec![AccountId32, AccountId32, U128]),
            (5, 3, "balances", "BalanceSet", vec![AccountId32, U128]),
            (5, 4, "balances", "Reserved", vec![AccountId32, U128]),
            (5, 5, "balances", "Unreserved", vec![AccountId32, U128]),
            (5, 7, "balances", "Deposit", vec![AccountId32, U128]),
            (5, 8, "balances", "Withdraw", vec![AccountId32, U128]),
            (5, 9, "balances", "Slashed", vec![AccountId32, U128]),
            (7, 0, "staking", "EraPaid", vec![U32, U128, U128]),
            (7, 1, "staking", "Rewarded", vec![AccountId32, U128]),
            (7, 4, "staking", "Bonded", vec![AccountId32, U128]),
            (7, 5, "staking", "Unbonded", vec![AccountId32, U128]),
            (7, 6, "staking", "Withdrawn", vec![AccountId32, U128]),
            (26, 0, "utility", "BatchInterrupted", vec![U32, DispatchError]),
            (26, 1, "utility", "BatchCompleted", vec![]),
            (26, 2, "utility", "BatchCompletedWithErrors", vec![]),
            (26, 3, "utility", "ItemCompleted", vec![]),
            (26, 4, "utility", "ItemFailed", vec![DispatchError]),
            (32, 0, "transactionPayment", "TransactionFeePaid", vec![AccountId32, U128, U128]),
        ]
        .into_iter()
        .map(|(pallet_index, variant_index, section, method, fields)| EventEntry {
            pallet_index,
            variant_index,
            section: section.to_string(),
            method: method.to_string(),
            fields,
        })
        .collect();

        Self {
            spec_name: "polkadot".to_string(),
            calls,
            events,
            runtime: None,
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::polkadot()
    }
}
