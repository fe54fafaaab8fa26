use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;

/// NEO standard address version byte.
const ADDRESS_VERSION: u8 = 0x17;

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Script hashes are displayed byte-reversed with a `0x` prefix.
pub fn script_hash_hex(hash: &[u8]) -> String {
    let mut reversed = hash.to_vec();
    reversed.reverse();
    format!("0x{}", hex::encode(reversed))
}

pub fn script_hash_to_address(hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + hash.len());
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(hash);
    bs58::encode(payload).with_check().into_string()
}
