pub mod ed25519;
pub mod keypair;
pub mod signer;

pub use ed25519::{sign_hash_hex, verify_hash_hex};
pub use keypair::KeyPair;
pub use signer::{HttpFetch, InProcessSigner, RemoteSigner, Signer, SubprocessSigner};

use settld_core::{SettldError, ID_HASH_PREFIX_LEN};
use sha2::{Digest, Sha256};

/// SHA-256 over arbitrary bytes → 64-char lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 over arbitrary bytes → raw 32-byte digest.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `key_` + first 24 hex chars of SHA-256 over the PEM text. The only
/// identifier ever used to look up a key.
pub fn key_id_from_public_key_pem(pem: &str) -> String {
    format!("key_{}", &sha256_hex(pem.as_bytes())[..ID_HASH_PREFIX_LEN])
}

/// SHA-256 hex of the canonical encoding of any serializable artifact.
pub fn canonical_sha256_hex<T: serde::Serialize>(artifact: &T) -> Result<String, SettldError> {
    Ok(sha256_hex(&settld_canon::to_canonical_bytes(artifact)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn key_id_has_prefix_and_24_hex() {
        let id = key_id_from_public_key_pem("-----BEGIN PUBLIC KEY-----\n...");
        assert!(id.starts_with("key_"));
        assert_eq!(id.len(), 4 + 24);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
