//! Canonical extrinsic hash computation
//!
//! The hash of a signed extrinsic is the blake2b-256 digest of its full
//! SCALE encoding, so the signed payload is assembled into a v4 signed
//! extrinsic exactly as the chain will see it before hashing.

use super::address::decode_account;
use super::payload::SignedPayload;
use super::hex_bytes;
use crate::error::{WatcherError, WatcherResult};
use crate::events::TypeRegistry;

use alloy_primitives::B256;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use parity_scale_codec::{Compact, Encode};
use tracing::debug;

type Blake2b256 = Blake2b<U32>;

/// Signed bit | extrinsic format version 4
const SIGNED_V4: u8 = 0b1000_0100;
/// `MultiAddress::Id`
const MULTI_ADDRESS_ID: u8 = 0x00;
/// `MultiSignature::Sr25519`
const MULTI_SIGNATURE_SR25519: u8 = 0x01;

/// Extensions applied when the payload does not list them
const DEFAULT_EXTENSIONS: [&str; 3] = ["CheckMortality", "CheckNonce", "ChargeTransactionPayment"];

pub fn blake2_256(data: &[u8]) -> B256 {
    let digest = Blake2b256::digest(data);
    B256::from_slice(digest.as_slice())
}

/// Compute the hash the chain will assign to this signed payload
pub fn compute_hash(
    registry: &TypeRegistry,
    payload: &SignedPayload,
    signature: &str,
) -> WatcherResult<B256> {
    let extrinsic = assemble_extrinsic(registry, payload, signature)?;
    let hash = blake2_256(&extrinsic);
    debug!(
        "Computed extrinsic hash {} ({} bytes, registry {})",
        hash,
        extrinsic.len(),
        registry.spec_name
    );
    Ok(hash)
}

/// Build the length-prefixed SCALE encoding of the signed extrinsic
pub fn assemble_extrinsic(
    registry: &TypeRegistry,
    payload: &SignedPayload,
    signature: &str,
) -> WatcherResult<Vec<u8>> {
    if payload.version != 4 {
        return Err(WatcherError::InvalidPayload(format!(
            "unsupported extrinsic version {}",
            payload.version
        )));
    }

    let call = payload.call_data()?;
    let entry = registry.lookup_call(&call)?;
    debug!("Assembling {}.{} extrinsic", entry.section, entry.method);

    let signer = decode_account(&payload.address)?;
    let signature = encode_signature(signature)?;

    let mut body = Vec::with_capacity(1 + 33 + signature.len() + 16 + call.len());
    body.push(SIGNED_V4);
    body.push(MULTI_ADDRESS_ID);
    body.extend_from_slice(&signer);
    body.extend_from_slice(&signature);
    body.extend(encode_extra(payload)?);
    body.extend_from_slice(&call);

    Ok(body.encode())
}

fn encode_signature(signature: &str) -> WatcherResult<Vec<u8>> {
    let raw = hex_bytes(signature)?;
    match raw.len() {
        64 => {
            let mut typed = Vec::with_capacity(65);
            typed.push(MULTI_SIGNATURE_SR25519);
            typed.extend_from_slice(&raw);
            Ok(typed)
        }
        // ed25519 / sr25519 (64 bytes) or ecdsa (65 bytes) behind a type byte
        65 | 66 if raw[0] <= 2 => Ok(raw),
        len => Err(WatcherError::InvalidPayload(format!(
            "unsupported signature length {}",
            len
        ))),
    }
}

/// Extra data carried in the extrinsic, in signed extension order
fn encode_extra(payload: &SignedPayload) -> WatcherResult<Vec<u8>> {
    let listed: Vec<&str> = payload.signed_extensions.iter().map(String::as_str).collect();
    let extensions: &[&str] = if listed.is_empty() {
        &DEFAULT_EXTENSIONS
    } else {
        &listed
    };

    let mut extra = Vec::new();
    for extension in extensions {
        match *extension {
            "CheckMortality" | "CheckEra" => extra.extend(payload.era_bytes()?),
            "CheckNonce" => extra.extend(Compact(payload.nonce()?).encode()),
            "ChargeTransactionPayment" => extra.extend(Compact(payload.tip()?).encode()),
            "ChargeAssetTxPayment" => {
                extra.extend(Compact(payload.tip()?).encode());
                // asset_id: None
                extra.push(0x00);
            }
            "CheckMetadataHash" => extra.push(payload.mode.unwrap_or(0)),
            // only contribute to the signed payload, not the extrinsic
            _ => {}
        }
    }
    Ok(extra)
}
