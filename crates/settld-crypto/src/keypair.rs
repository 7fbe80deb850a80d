use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use settld_core::SettldError;

use crate::key_id_from_public_key_pem;

/// A Settld keypair: Ed25519 signing key with the SPKI PEM of its public half
/// and the derived keyId.
///
/// The secret key material inside `SigningKey` is zeroized on drop by
/// ed25519-dalek; the PEM and keyId are public and safe to clone around.
pub struct KeyPair {
    signing: SigningKey,
    public_key_pem: String,
    key_id: String,
}

impl KeyPair {
    /// Generate a fresh Ed25519 keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Restore a keypair from a PKCS#8 PEM private key.
    pub fn from_private_key_pem(pem: &str) -> Result<Self, SettldError> {
        let signing = SigningKey::from_pkcs8_pem(pem).map_err(|e| SettldError::Crypto {
            reason: format!("private key PEM: {e}"),
        })?;
        Ok(Self::from_signing_key(signing))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public_key_pem = signing
            .verifying_key()
            .to_public_key_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
            .expect("ed25519 public key is always PEM-encodable");
        let key_id = key_id_from_public_key_pem(&public_key_pem);
        Self {
            signing,
            public_key_pem,
            key_id,
        }
    }

    /// SPKI PEM of the public key. This exact text is what keyId derivation
    /// and agent registration store; do not re-wrap it.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Export the private key as PKCS#8 PEM (for key files; never logged).
    pub fn private_key_pem(&self) -> Result<zeroize::Zeroizing<String>, SettldError> {
        self.signing
            .to_pkcs8_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
            .map_err(|e| SettldError::Crypto {
                reason: format!("private key export: {e}"),
            })
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ key_id: {} }}", self.key_id)
    }
}

/// Parse an SPKI PEM into a verifying key.
pub fn verifying_key_from_pem(pem: &str) -> Result<VerifyingKey, SettldError> {
    VerifyingKey::from_public_key_pem(pem).map_err(|e| SettldError::Crypto {
        reason: format!("public key PEM: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_round_trip_preserves_key_id() {
        let kp = KeyPair::generate();
        let pem = kp.private_key_pem().unwrap();
        let restored = KeyPair::from_private_key_pem(&pem).unwrap();
        assert_eq!(kp.key_id(), restored.key_id());
        assert_eq!(kp.public_key_pem(), restored.public_key_pem());
    }

    #[test]
    fn key_id_is_derived_from_public_pem() {
        let kp = KeyPair::generate();
        assert_eq!(
            kp.key_id(),
            crate::key_id_from_public_key_pem(kp.public_key_pem())
        );
    }
}
