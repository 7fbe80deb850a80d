//! Provider quote and provider response signature envelopes.
//!
//! The quote travels in `x-nooterra-provider-quote` as
//! `base64url(canonical(quote))` with its signature envelope in
//! `x-nooterra-provider-quote-signature`. The response signature covers
//! `sha256(canonical({responseHash, nonce, signedAt}))` and is fail-closed
//! when the gate policy marks it required.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use settld_core::{Cents, HashHex, IsoMillis, ProviderResponseAnchor, SettldError};
use settld_crypto::{sha256_hex, verify_hash_hex, KeyPair};

// ── Provider quote ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQuote {
    pub gate_id: String,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub amount_cents: Cents,
    pub currency: String,
    pub quoted_at: IsoMillis,
}

/// Signature envelope published alongside the quote.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSignature {
    pub key_id: String,
    pub signed_at: IsoMillis,
    /// base64 Ed25519 over sha256(canonical(quote)).
    pub signature: String,
}

impl ProviderQuote {
    pub fn quote_hash(&self) -> Result<HashHex, SettldError> {
        Ok(sha256_hex(&settld_canon::to_canonical_bytes(self)?))
    }

    /// Header value: `base64url(canonical(quote))`.
    pub fn to_header_value(&self) -> Result<String, SettldError> {
        Ok(B64URL.encode(settld_canon::to_canonical_bytes(self)?))
    }

    pub fn from_header_value(value: &str) -> Result<Self, SettldError> {
        let bytes = B64URL
            .decode(value)
            .map_err(|e| SettldError::Serialization(format!("quote header: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| SettldError::Serialization(e.to_string()))
    }

    pub fn sign(&self, keypair: &KeyPair, signed_at: IsoMillis) -> Result<QuoteSignature, SettldError> {
        let signature = settld_crypto::sign_hash_hex(&self.quote_hash()?, keypair)?;
        Ok(QuoteSignature {
            key_id: keypair.key_id().to_string(),
            signed_at,
            signature,
        })
    }

    pub fn verify(&self, sig: &QuoteSignature, provider_pem: &str) -> Result<(), SettldError> {
        let hash = self.quote_hash()?;
        if !verify_hash_hex(&hash, &sig.signature, provider_pem) {
            return Err(SettldError::ProviderSignatureInvalid);
        }
        Ok(())
    }
}

impl QuoteSignature {
    pub fn to_header_value(&self) -> Result<String, SettldError> {
        Ok(B64URL.encode(settld_canon::to_canonical_bytes(self)?))
    }

    pub fn from_header_value(value: &str) -> Result<Self, SettldError> {
        let bytes = B64URL
            .decode(value)
            .map_err(|e| SettldError::Serialization(format!("quote signature header: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| SettldError::Serialization(e.to_string()))
    }
}

// ── Provider response signature ───────────────────────────────────────────────

/// Digest the provider signs over its response:
/// `sha256(canonical({responseHash, nonce, signedAt}))`.
pub fn provider_response_payload_hash(
    response_sha256: &str,
    nonce: &str,
    signed_at: IsoMillis,
) -> Result<HashHex, SettldError> {
    let payload = serde_json::json!({
        "responseHash": response_sha256,
        "nonce": nonce,
        "signedAt": signed_at,
    });
    Ok(sha256_hex(&settld_canon::canonical_bytes(&payload)?))
}

/// Verify a provider's response signature anchor against the provider's
/// current public key.
pub fn verify_provider_response(
    anchor: &ProviderResponseAnchor,
    provider_pem: &str,
) -> Result<(), SettldError> {
    let payload_hash =
        provider_response_payload_hash(&anchor.response_sha256, &anchor.nonce, anchor.signed_at)?;
    if !verify_hash_hex(&payload_hash, &anchor.signature, provider_pem) {
        return Err(SettldError::ProviderSignatureInvalid);
    }
    Ok(())
}

/// Build a signed response anchor (provider side; used by tests and the
/// conformance fixtures).
pub fn sign_provider_response(
    response_sha256: &str,
    nonce: &str,
    signed_at: IsoMillis,
    keypair: &KeyPair,
) -> Result<ProviderResponseAnchor, SettldError> {
    let payload_hash = provider_response_payload_hash(response_sha256, nonce, signed_at)?;
    Ok(ProviderResponseAnchor {
        response_sha256: response_sha256.to_string(),
        nonce: nonce.to_string(),
        signed_at,
        provider_key_id: keypair.key_id().to_string(),
        signature: settld_crypto::sign_hash_hex(&payload_hash, keypair)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> IsoMillis {
        IsoMillis::parse(s).unwrap()
    }

    fn quote() -> ProviderQuote {
        ProviderQuote {
            gate_id: "gate_1".into(),
            provider_id: "prov_tools".into(),
            tool_id: Some("tool_search".into()),
            amount_cents: 1000,
            currency: "USD".into(),
            quoted_at: t("2026-08-01T00:00:00.000Z"),
        }
    }

    #[test]
    fn quote_header_round_trips() {
        let q = quote();
        let parsed = ProviderQuote::from_header_value(&q.to_header_value().unwrap()).unwrap();
        assert_eq!(parsed, q);
    }

    #[test]
    fn quote_signature_verifies() {
        let kp = KeyPair::generate();
        let q = quote();
        let sig = q.sign(&kp, t("2026-08-01T00:00:01.000Z")).unwrap();
        q.verify(&sig, kp.public_key_pem()).unwrap();
    }

    #[test]
    fn tampered_quote_fails_verification() {
        let kp = KeyPair::generate();
        let q = quote();
        let sig = q.sign(&kp, t("2026-08-01T00:00:01.000Z")).unwrap();
        let mut tampered = q.clone();
        tampered.amount_cents = 999_999;
        let err = tampered.verify(&sig, kp.public_key_pem()).unwrap_err();
        assert_eq!(err.code(), "TOOL_PROVIDER_SIGNATURE_INVALID");
    }

    #[test]
    fn response_anchor_round_trips() {
        let kp = KeyPair::generate();
        let response_sha = sha256_hex(b"response body");
        let anchor =
            sign_provider_response(&response_sha, "n-1", t("2026-08-01T00:00:02.000Z"), &kp)
                .unwrap();
        verify_provider_response(&anchor, kp.public_key_pem()).unwrap();
    }

    #[test]
    fn response_anchor_with_wrong_nonce_fails() {
        let kp = KeyPair::generate();
        let response_sha = sha256_hex(b"response body");
        let mut anchor =
            sign_provider_response(&response_sha, "n-1", t("2026-08-01T00:00:02.000Z"), &kp)
                .unwrap();
        anchor.nonce = "n-2".into();
        let err = verify_provider_response(&anchor, kp.public_key_pem()).unwrap_err();
        assert_eq!(err.code(), "TOOL_PROVIDER_SIGNATURE_INVALID");
    }
}
