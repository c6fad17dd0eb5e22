//! Block/event matching for a target extrinsic

use super::ChainConnector;
use crate::error::{WatcherError, WatcherResult};
use crate::events::{decode_events, DispatchOutcome, TypeRegistry};
use crate::tx::{blake2_256, hex_bytes, parse_quantity};

use alloy_primitives::B256;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Storage key of `System.Events`
pub const SYSTEM_EVENTS_KEY: &str =
    "0x26aa394eea5630e07c48ae0c9558cef780d41e5e16056765bc8461851072c9d7";

/// Result of looking for an extrinsic in one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockLookup {
    Outcome {
        outcome: DispatchOutcome,
        block_number: u64,
        tx_index: u32,
    },
    /// Not in this block; keep watching
    NotFound,
    /// The block or its events could not be fetched or decoded
    TransportError(String),
}

/// Resolve a block number to its hash
pub async fn block_hash_at(
    connector: &dyn ChainConnector,
    number: u64,
) -> WatcherResult<Option<B256>> {
    let result = connector.send("chain_getBlockHash", json!([number])).await?;
    match result {
        Value::Null => Ok(None),
        Value::String(hash) => hash
            .parse::<B256>()
            .map(Some)
            .map_err(|e| WatcherError::Decode(format!("invalid block hash {}: {}", hash, e))),
        other => Err(WatcherError::Decode(format!(
            "unexpected chain_getBlockHash result: {}",
            other
        ))),
    }
}

/// Look for `target` in the block at `block_hash` and its dispatch event
pub async fn find_in_block(
    connector: &dyn ChainConnector,
    registry: &TypeRegistry,
    block_hash: &B256,
    target: &B256,
) -> BlockLookup {
    match lookup(connector, registry, block_hash, target).await {
        Ok(Some((outcome, block_number, tx_index))) => BlockLookup::Outcome {
            outcome,
            block_number,
            tx_index,
        },
        Ok(None) => BlockLookup::NotFound,
        Err(e) => BlockLookup::TransportError(e.to_string()),
    }
}

async fn lookup(
    connector: &dyn ChainConnector,
    registry: &TypeRegistry,
    block_hash: &B256,
    target: &B256,
) -> WatcherResult<Option<(DispatchOutcome, u64, u32)>> {
    let signed_block = connector
        .send("chain_getBlock", json!([block_hash.to_string()]))
        .await?;
    let block = signed_block
        .get("block")
        .ok_or_else(|| WatcherError::Decode(format!("block {} not available", block_hash)))?;

    let block_number = block
        .pointer("/header/number")
        .and_then(Value::as_str)
        .ok_or_else(|| WatcherError::Decode("block header without number".to_string()))
        .and_then(parse_quantity)? as u64;

    let extrinsics = block
        .get("extrinsics")
        .and_then(Value::as_array)
        .ok_or_else(|| WatcherError::Decode("block without extrinsics".to_string()))?;

    let mut tx_index = None;
    for (index, extrinsic) in extrinsics.iter().enumerate() {
        let raw = extrinsic
            .as_str()
            .ok_or_else(|| WatcherError::Decode("extrinsic is not a hex string".to_string()))?;
        if blake2_256(&hex_bytes(raw)?) == *target {
            tx_index = Some(index as u32);
            break;
        }
    }

    let Some(tx_index) = tx_index else {
        debug!("{} not in block #{}", target, block_number);
        return Ok(None);
    };

    let storage = connector
        .send(
            "state_getStorage",
            json!([SYSTEM_EVENTS_KEY, block_hash.to_string()]),
        )
        .await?;
    let raw_events = match storage {
        Value::String(raw) => hex_bytes(&raw)?,
        _ => Vec::new(),
    };

    let decoded = if raw_events.is_empty() {
        Vec::new()
    } else {
        let decoded = decode_events(registry, &raw_events)?;
        debug!(
            "Decoded {} events in block #{} ({})",
            decoded.records.len(),
            block_number,
            decoded.source
        );
        if decoded.skipped > 0 {
            warn!(
                "Stepped over {} unknown events in block #{}",
                decoded.skipped, block_number
            );
        }
        decoded.records
    };

    let outcome = decoded
        .iter()
        .filter(|event| event.extrinsic_index() == Some(tx_index))
        .find_map(|event| event.dispatch_outcome());

    match outcome {
        Some(outcome) => Ok(Some((outcome, block_number, tx_index))),
        None => {
            warn!(
                "{} found at #{}-{} without a dispatch event",
                target, block_number, tx_index
            );
            Ok(None)
        }
    }
}
