//! Transaction identity: signed payloads, account decoding, canonical hashing
//! and per-slot write serialization

pub mod address;
pub mod hash;
pub mod nonce;
pub mod payload;

pub use hash::{blake2_256, compute_hash};
pub use nonce::SlotLocks;
pub use payload::SignedPayload;

use crate::error::{WatcherError, WatcherResult};

/// Decode a `0x` prefixed (or bare) hex string
pub fn hex_bytes(value: &str) -> WatcherResult<Vec<u8>> {
    let value = value.trim();
    let stripped = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    Ok(hex::decode(stripped)?)
}

/// Parse a hex (`0x..`) or decimal integer as used in signer payloads
pub fn parse_quantity(value: &str) -> WatcherResult<u128> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some("") => Ok(0),
        Some(digits) => u128::from_str_radix(digits, 16),
        None => value.parse::<u128>(),
    };
    parsed.map_err(|e| WatcherError::InvalidPayload(format!("invalid number '{}': {}", value, e)))
}
