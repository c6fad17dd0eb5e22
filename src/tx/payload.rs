//! Signed payload as produced by the wallet signer

use super::{hex_bytes, parse_quantity};
use crate::error::{WatcherError, WatcherResult};

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

/// Unsigned extrinsic fields the user signed over.
///
/// Numeric fields are hex strings, matching the signer payload JSON the
/// wallet extension hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPayload {
    pub address: String,
    pub block_hash: String,
    pub block_number: String,
    pub era: String,
    pub genesis_hash: String,
    /// SCALE encoded call
    pub method: String,
    pub nonce: String,
    pub spec_version: String,
    pub tip: String,
    pub transaction_version: String,
    #[serde(default)]
    pub signed_extensions: Vec<String>,
    pub version: u8,
    #[serde(default)]
    pub mode: Option<u8>,
}

impl SignedPayload {
    pub fn genesis_hash(&self) -> WatcherResult<B256> {
        self.genesis_hash.trim().parse::<B256>().map_err(|e| {
            WatcherError::InvalidPayload(format!("invalid genesis hash {}: {}", self.genesis_hash, e))
        })
    }

    pub fn nonce(&self) -> WatcherResult<u64> {
        let nonce = parse_quantity(&self.nonce)?;
        u64::try_from(nonce)
            .map_err(|_| WatcherError::InvalidPayload(format!("nonce {} out of range", nonce)))
    }

    pub fn tip(&self) -> WatcherResult<u128> {
        parse_quantity(&self.tip)
    }

    pub fn call_data(&self) -> WatcherResult<Vec<u8>> {
        hex_bytes(&self.method)
    }

    pub fn era_bytes(&self) -> WatcherResult<Vec<u8>> {
        let era = hex_bytes(&self.era)?;
        match era.as_slice() {
            [0x00] => Ok(era),
            [_, _] => Ok(era),
            _ => Err(WatcherError::InvalidPayload(format!(
                "era must be 1 (immortal) or 2 (mortal) bytes, got {}",
                era.len()
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::SignedPayload;

    pub const GENESIS: &str = "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3";
    pub const ALICE_HEX: &str = "0xd43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d";

    /// `System.remark("abc")` signed by Alice with the given nonce
    pub fn remark_payload(nonce: u64) -> SignedPayload {
        SignedPayload {
            address: ALICE_HEX.to_string(),
            block_hash: GENESIS.to_string(),
            block_number: "0x00000000".to_string(),
            era: "0x00".to_string(),
            genesis_hash: GENESIS.to_string(),
            method: "0x00000c616263".to_string(),
            nonce: format!("0x{:08x}", nonce),
            spec_version: "0x000f4240".to_string(),
            tip: "0x00000000000000000000000000000000".to_string(),
            transaction_version: "0x0000001a".to_string(),
            signed_extensions: vec![
                "CheckNonZeroSender".to_string(),
                "CheckSpecVersion".to_string(),
                "CheckTxVersion".to_string(),
                "CheckGenesis".to_string(),
                "CheckMortality".to_string(),
                "CheckNonce".to_string(),
                "CheckWeight".to_string(),
                "ChargeTransactionPayment".to_string(),
            ],
            version: 4,
            mode: None,
        }
    }

    pub fn signature(fill: u8) -> String {
        format!("0x{}", hex::encode([fill; 64]))
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;

    #[test]
    fn test_payload_accessors() {
        let payload = remark_payload(3);
        assert_eq!(payload.nonce().unwrap(), 3);
        assert_eq!(payload.tip().unwrap(), 0);
        assert_eq!(payload.genesis_hash().unwrap().to_string(), GENESIS);
        assert_eq!(payload.call_data().unwrap(), vec![0, 0, 0x0c, b'a', b'b', b'c']);
        assert_eq!(payload.era_bytes().unwrap(), vec![0]);
    }

    #[test]
    fn test_payload_deserializes_from_signer_json() {
        let json = serde_json::json!({
            "address": ALICE_HEX,
            "blockHash": GENESIS,
            "blockNumber": "0x00000010",
            "era": "0x4502",
            "genesisHash": GENESIS,
            "method": "0x0000",
            "nonce": "0x00000001",
            "specVersion": "0x000f4240",
            "tip": "0x00",
            "transactionVersion": "0x0000001a",
            "signedExtensions": ["CheckMortality", "CheckNonce"],
            "version": 4
        });
        let payload: super::SignedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.era_bytes().unwrap(), vec![0x45, 0x02]);
        assert_eq!(payload.mode, None);
    }

    #[test]
    fn test_rejects_malformed_era() {
        let mut payload = remark_payload(0);
        payload.era = "0x010203".to_string();
        assert!(payload.era_bytes().is_err());
    }
}
