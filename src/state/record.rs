//! Transaction record data model

use crate::error::{WatcherError, WatcherResult};
use crate::tx::address::decode_account;

use alloy_primitives::{Address, B256};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a recorded transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Watch gave up without an answer from the chain
    Unknown,
    Pending,
    Success,
    Error,
    /// Another transaction settled the same nonce slot
    Replaced,
}

impl TxStatus {
    /// Terminal statuses are only written by the reconciler
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Success | TxStatus::Error | TxStatus::Replaced)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Unknown => "unknown",
            TxStatus::Pending => "pending",
            TxStatus::Success => "success",
            TxStatus::Error => "error",
            TxStatus::Replaced => "replaced",
        }
    }

    pub fn all() -> [TxStatus; 5] {
        [
            TxStatus::Unknown,
            TxStatus::Pending,
            TxStatus::Success,
            TxStatus::Error,
            TxStatus::Replaced,
        ]
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(TxStatus::Unknown),
            "pending" => Ok(TxStatus::Pending),
            "success" => Ok(TxStatus::Success),
            "error" => Ok(TxStatus::Error),
            "replaced" => Ok(TxStatus::Replaced),
            other => Err(WatcherError::Decode(format!("unknown status '{}'", other))),
        }
    }
}

/// Network a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NetworkRef {
    Evm { evm_network_id: u64 },
    Substrate { genesis_hash: B256 },
}

impl NetworkRef {
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkRef::Evm { .. } => "evm",
            NetworkRef::Substrate { .. } => "substrate",
        }
    }

    /// Identifier as stored in the database
    pub fn id_string(&self) -> String {
        match self {
            NetworkRef::Evm { evm_network_id } => evm_network_id.to_string(),
            NetworkRef::Substrate { genesis_hash } => genesis_hash.to_string(),
        }
    }

    pub fn from_parts(kind: &str, id: &str) -> WatcherResult<Self> {
        match kind {
            "evm" => id
                .parse::<u64>()
                .map(|evm_network_id| NetworkRef::Evm { evm_network_id })
                .map_err(|e| WatcherError::Decode(format!("invalid evm network id: {}", e))),
            "substrate" => id
                .parse::<B256>()
                .map(|genesis_hash| NetworkRef::Substrate { genesis_hash })
                .map_err(|e| WatcherError::Decode(format!("invalid genesis hash: {}", e))),
            other => Err(WatcherError::Decode(format!(
                "unknown network kind '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for NetworkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id_string())
    }
}

/// Sender's ordering lane on one network
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub account: String,
    pub network: NetworkRef,
}

/// Optional transfer details shown in the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub token_id: String,
    pub value: String,
    pub to: String,
}

/// A transaction tracked by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub hash: B256,
    /// Normalized sender address
    pub account: String,
    pub network: NetworkRef,
    pub nonce: u64,
    pub status: TxStatus,
    pub block_number: Option<u64>,
    /// Set once the status was observed in a finalized block
    pub confirmed: bool,
    pub is_replacement: bool,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    pub label: String,
    pub site_url: Option<String>,
    pub transfer: Option<TransferInfo>,
}

impl TransactionRecord {
    /// Create a freshly submitted record
    pub fn new_pending(
        hash: B256,
        account: String,
        network: NetworkRef,
        nonce: u64,
        label: impl Into<String>,
    ) -> Self {
        Self {
            hash,
            account,
            network,
            nonce,
            status: TxStatus::Pending,
            block_number: None,
            confirmed: false,
            is_replacement: false,
            timestamp: Utc::now().timestamp_millis(),
            label: label.into(),
            site_url: None,
            transfer: None,
        }
    }

    pub fn slot(&self) -> SlotKey {
        SlotKey {
            account: self.account.clone(),
            network: self.network,
        }
    }

    pub fn shares_slot(&self, other: &TransactionRecord) -> bool {
        self.account == other.account && self.network == other.network && self.nonce == other.nonce
    }
}

/// Normalize an account address so records compare equal regardless of
/// the display format the wallet used.
pub fn normalize_address(account: &str, network: &NetworkRef) -> WatcherResult<String> {
    match network {
        NetworkRef::Evm { .. } => {
            let address = Address::from_str(account.trim()).map_err(|e| {
                WatcherError::InvalidPayload(format!("invalid evm address {}: {}", account, e))
            })?;
            Ok(format!("0x{}", hex::encode(address.as_slice())))
        }
        NetworkRef::Substrate { .. } => {
            let id = decode_account(account)?;
            Ok(format!("0x{}", hex::encode(id)))
        }
    }
}
