//! Account id decoding for SS58 and hex encoded addresses

use crate::error::{WatcherError, WatcherResult};

use blake2::{Blake2b512, Digest};

const SS58_CHECKSUM_PREFIX: &[u8] = b"SS58PRE";
const CHECKSUM_LEN: usize = 2;

/// Decode an account into its 32-byte id.
///
/// Accepts a `0x` prefixed hex id or an SS58 address of any network prefix.
pub fn decode_account(account: &str) -> WatcherResult<[u8; 32]> {
    let account = account.trim();
    if let Some(stripped) = account.strip_prefix("0x").or_else(|| account.strip_prefix("0X")) {
        let bytes = hex::decode(stripped)?;
        return <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            WatcherError::InvalidPayload(format!(
                "account id must be 32 bytes, got {}",
                bytes.len()
            ))
        });
    }
    decode_ss58(account).map(|(_, id)| id)
}

/// Decode an SS58 address into `(network prefix, account id)`
pub fn decode_ss58(address: &str) -> WatcherResult<(u16, [u8; 32])> {
    let data = bs58::decode(address)
        .into_vec()
        .map_err(|e| invalid(address, &e.to_string()))?;

    let (prefix, prefix_len) = match data.first() {
        Some(&b) if b < 64 => (b as u16, 1),
        Some(&b) if b < 128 => {
            let second = *data.get(1).ok_or_else(|| invalid(address, "truncated prefix"))?;
            let lower = ((b << 2) | (second >> 6)) as u16;
            let upper = (second & 0b0011_1111) as u16;
            (lower | (upper << 8), 2)
        }
        Some(_) => return Err(invalid(address, "reserved prefix")),
        None => return Err(invalid(address, "empty")),
    };

    if data.len() != prefix_len + 32 + CHECKSUM_LEN {
        return Err(invalid(address, "unexpected length"));
    }

    let body_len = data.len() - CHECKSUM_LEN;
    let mut hasher = Blake2b512::new();
    hasher.update(SS58_CHECKSUM_PREFIX);
    hasher.update(&data[..body_len]);
    let digest = hasher.finalize();
    if digest[..CHECKSUM_LEN] != data[body_len..] {
        return Err(invalid(address, "bad checksum"));
    }

    let mut id = [0u8; 32];
    id.copy_from_slice(&data[prefix_len..body_len]);
    Ok((prefix, id))
}

fn invalid(address: &str, reason: &str) -> WatcherError {
    WatcherError::InvalidPayload(format!("invalid address {}: {}", address, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_ID: &str = "d43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d";

    #[test]
    fn test_decodes_generic_substrate_address() {
        let (prefix, id) = decode_ss58("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY").unwrap();
        assert_eq!(prefix, 42);
        assert_eq!(hex::encode(id), ALICE_ID);
    }

    #[test]
    fn test_decodes_polkadot_address() {
        let (prefix, id) = decode_ss58("15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5").unwrap();
        assert_eq!(prefix, 0);
        assert_eq!(hex::encode(id), ALICE_ID);
    }

    #[test]
    fn test_rejects_bad_checksum() {
        assert!(decode_ss58("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQZ").is_err());
    }

    #[test]
    fn test_rejects_non_base58() {
        assert!(decode_ss58("0OIl").is_err());
    }

    #[test]
    fn test_hex_account() {
        let id = decode_account(&format!("0x{}", ALICE_ID)).unwrap();
        assert_eq!(hex::encode(id), ALICE_ID);
        assert!(decode_account("0x1234").is_err());
    }
}
