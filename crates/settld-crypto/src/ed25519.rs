use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _};
use settld_core::SettldError;

use crate::keypair::{verifying_key_from_pem, KeyPair};

/// Sign a 64-char hex SHA-256 digest with the keypair's Ed25519 key.
///
/// The signature covers the raw 32-byte digest, not its hex encoding — this
/// is normative for every signature in the system.
pub fn sign_hash_hex(hash_hex: &str, keypair: &KeyPair) -> Result<String, SettldError> {
    let digest = decode_digest(hash_hex)?;
    let sig = keypair.signing_key().sign(&digest);
    Ok(B64.encode(sig.to_bytes()))
}

/// Verify a base64 Ed25519 signature over a 64-char hex digest against an
/// SPKI PEM public key. Malformed inputs verify as false.
pub fn verify_hash_hex(hash_hex: &str, signature_b64: &str, public_key_pem: &str) -> bool {
    let Ok(digest) = decode_digest(hash_hex) else {
        return false;
    };
    let Ok(sig_bytes) = B64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = verifying_key_from_pem(public_key_pem) else {
        return false;
    };
    key.verify_strict(&digest, &Signature::from_bytes(&sig_arr))
        .is_ok()
}

fn decode_digest(hash_hex: &str) -> Result<[u8; 32], SettldError> {
    let bytes = hex::decode(hash_hex).map_err(|e| SettldError::Crypto {
        reason: format!("digest hex: {e}"),
    })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| SettldError::Crypto {
        reason: format!("digest must be 32 bytes, got {}", bytes.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256_hex;

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = KeyPair::generate();
        let digest = sha256_hex(b"payload");
        let sig = sign_hash_hex(&digest, &kp).unwrap();
        assert!(verify_hash_hex(&digest, &sig, kp.public_key_pem()));
    }

    #[test]
    fn verify_fails_for_wrong_digest() {
        let kp = KeyPair::generate();
        let sig = sign_hash_hex(&sha256_hex(b"payload"), &kp).unwrap();
        assert!(!verify_hash_hex(&sha256_hex(b"other"), &sig, kp.public_key_pem()));
    }

    #[test]
    fn verify_fails_for_wrong_key() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let digest = sha256_hex(b"payload");
        let sig = sign_hash_hex(&digest, &kp).unwrap();
        assert!(!verify_hash_hex(&digest, &sig, other.public_key_pem()));
    }

    #[test]
    fn signature_is_over_raw_digest_not_hex() {
        // Signing the hex string instead of the raw bytes must not verify.
        use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
        use ed25519_dalek::Signer as _;
        let kp = KeyPair::generate();
        let digest_hex = sha256_hex(b"payload");
        let wrong = B64.encode(kp.signing_key().sign(digest_hex.as_bytes()).to_bytes());
        assert!(!verify_hash_hex(&digest_hex, &wrong, kp.public_key_pem()));
    }

    #[test]
    fn malformed_inputs_verify_false_not_panic() {
        let kp = KeyPair::generate();
        assert!(!verify_hash_hex("zz", "sig", kp.public_key_pem()));
        assert!(!verify_hash_hex(&sha256_hex(b"x"), "!!!", kp.public_key_pem()));
        assert!(!verify_hash_hex(&sha256_hex(b"x"), "QUJD", "not a pem"));
    }
}
