//! NooterraPay token envelopes.
//!
//! A token authorizes exactly one paid call to exactly one provider for
//! exactly one amount. Wire form:
//!
//! ```text
//! base64url(canonical(claims)) "." base64url(signature)
//! ```
//!
//! where the signature is Ed25519 over `sha256(canonical(claims))` — the same
//! raw-digest rule as every other signature in the system.

use base64::engine::general_purpose::{STANDARD as B64STD, URL_SAFE_NO_PAD as B64URL};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use settld_core::{Cents, GateId, HashHex, IsoMillis, SettldError, NOOTERRA_PAY_ISSUER};
use settld_crypto::{sha256_hex, verify_hash_hex, KeyPair};

use crate::keyset::PayKeyset;

// ── Challenge token claims ────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PayTokenClaims {
    pub iss: String,
    /// Audience: the provider this token pays.
    pub aud: String,
    pub gate_id: GateId,
    /// Always null on the challenge token; the authorize step fills the
    /// binding into the gate, never back into the token.
    pub authorization_ref: Option<String>,
    pub amount_cents: Cents,
    pub currency: String,
    pub payee_provider_id: String,
    pub iat: IsoMillis,
    pub exp: IsoMillis,
}

impl PayTokenClaims {
    pub fn challenge(
        provider_id: &str,
        gate_id: &str,
        amount_cents: Cents,
        currency: &str,
        iat: IsoMillis,
        exp: IsoMillis,
    ) -> Self {
        Self {
            iss: NOOTERRA_PAY_ISSUER.to_string(),
            aud: provider_id.to_string(),
            gate_id: gate_id.to_string(),
            authorization_ref: None,
            amount_cents,
            currency: currency.to_string(),
            payee_provider_id: provider_id.to_string(),
            iat,
            exp,
        }
    }

    pub fn claims_hash(&self) -> Result<HashHex, SettldError> {
        Ok(sha256_hex(&settld_canon::to_canonical_bytes(self)?))
    }
}

// ── Mint / decode / verify ────────────────────────────────────────────────────

/// Mint a token from claims with the keyset's signing key.
pub fn mint<T: Serialize>(claims: &T, keypair: &KeyPair) -> Result<String, SettldError> {
    let canonical = settld_canon::to_canonical_bytes(claims)?;
    let digest = sha256_hex(&canonical);
    let signature = settld_crypto::sign_hash_hex(&digest, keypair)?;
    let sig_raw = B64STD.decode(&signature).map_err(|e| SettldError::Crypto {
        reason: format!("signature transcode: {e}"),
    })?;
    Ok(format!(
        "{}.{}",
        B64URL.encode(&canonical),
        B64URL.encode(sig_raw)
    ))
}

/// Split a token into its canonical claims text and raw signature.
fn split(token: &str) -> Result<(Vec<u8>, Vec<u8>), SettldError> {
    let mut parts = token.splitn(2, '.');
    let claims_b64 = parts.next().unwrap_or_default();
    let sig_b64 = parts.next().ok_or_else(|| SettldError::PaymentTokenInvalid {
        reason: "missing signature segment".to_string(),
    })?;
    let claims = B64URL
        .decode(claims_b64)
        .map_err(|_| SettldError::PaymentTokenInvalid {
            reason: "claims segment is not base64url".to_string(),
        })?;
    let sig = B64URL
        .decode(sig_b64)
        .map_err(|_| SettldError::PaymentTokenInvalid {
            reason: "signature segment is not base64url".to_string(),
        })?;
    Ok((claims, sig))
}

/// Decode without verification (for binding hashes and diagnostics).
pub fn decode(token: &str) -> Result<(PayTokenClaims, HashHex), SettldError> {
    let (claims_bytes, _) = split(token)?;
    let claims: PayTokenClaims =
        serde_json::from_slice(&claims_bytes).map_err(|e| SettldError::PaymentTokenInvalid {
            reason: format!("claims: {e}"),
        })?;
    Ok((claims, sha256_hex(&claims_bytes)))
}

/// Verify a challenge token against the published keyset and the gate it must
/// pay. Checks, in order: signature by the active key or a fallback key,
/// issuer, audience, gate binding, amount/currency, expiry. Fail-closed.
pub fn verify_challenge_token(
    token: &str,
    keyset: &PayKeyset,
    expected_provider_id: &str,
    expected_gate_id: &str,
    expected_amount_cents: Cents,
    expected_currency: &str,
    now: IsoMillis,
) -> Result<PayTokenClaims, SettldError> {
    let (claims_bytes, sig_raw) = split(token)?;
    let digest = sha256_hex(&claims_bytes);
    let sig_b64 = B64STD.encode(&sig_raw);

    let signed_by_keyset = keyset
        .all_keys()
        .any(|key| verify_hash_hex(&digest, &sig_b64, &key.public_key_pem));
    if !signed_by_keyset {
        return Err(SettldError::PaymentTokenInvalid {
            reason: "signature does not verify against the keyset".to_string(),
        });
    }

    let claims: PayTokenClaims =
        serde_json::from_slice(&claims_bytes).map_err(|e| SettldError::PaymentTokenInvalid {
            reason: format!("claims: {e}"),
        })?;

    if claims.iss != NOOTERRA_PAY_ISSUER {
        return Err(SettldError::PaymentTokenInvalid {
            reason: format!("issuer {}", claims.iss),
        });
    }
    if claims.aud != expected_provider_id || claims.payee_provider_id != expected_provider_id {
        return Err(SettldError::PaymentTokenInvalid {
            reason: "audience is not the payee provider".to_string(),
        });
    }
    if claims.gate_id != expected_gate_id {
        return Err(SettldError::PaymentTokenInvalid {
            reason: "token bound to a different gate".to_string(),
        });
    }
    if claims.amount_cents != expected_amount_cents || claims.currency != expected_currency {
        return Err(SettldError::PaymentTokenInvalid {
            reason: "amount or currency mismatch".to_string(),
        });
    }
    if now > claims.exp {
        return Err(SettldError::PaymentTokenExpired);
    }
    Ok(claims)
}

// ── Wallet-issuer decision token ──────────────────────────────────────────────

/// Decision token a wallet issuer attaches when its policy demands explicit
/// approval of an authorize. Audience-bound to one gate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionTokenClaims {
    pub iss: String,
    /// Audience: the gate this decision approves.
    pub aud: GateId,
    pub decision: String,
    pub iat: IsoMillis,
    pub exp: IsoMillis,
}

/// Verify a wallet-issuer decision token against the currently-trusted issuer
/// keys for the tenant.
pub fn verify_decision_token(
    token: &str,
    trusted_issuer_pems: &[String],
    gate_id: &str,
    now: IsoMillis,
) -> Result<DecisionTokenClaims, SettldError> {
    let (claims_bytes, sig_raw) = split(token).map_err(|_| {
        SettldError::WalletIssuerDecisionInvalid {
            reason: "malformed token".to_string(),
        }
    })?;
    let digest = sha256_hex(&claims_bytes);
    let sig_b64 = B64STD.encode(&sig_raw);
    if !trusted_issuer_pems
        .iter()
        .any(|pem| verify_hash_hex(&digest, &sig_b64, pem))
    {
        return Err(SettldError::WalletIssuerDecisionInvalid {
            reason: "signer is not a trusted wallet issuer key".to_string(),
        });
    }
    let claims: DecisionTokenClaims = serde_json::from_slice(&claims_bytes).map_err(|e| {
        SettldError::WalletIssuerDecisionInvalid {
            reason: format!("claims: {e}"),
        }
    })?;
    if claims.aud != gate_id {
        return Err(SettldError::WalletIssuerDecisionInvalid {
            reason: "audience is not this gate".to_string(),
        });
    }
    if claims.decision != "approve" {
        return Err(SettldError::WalletIssuerDecisionInvalid {
            reason: format!("decision {}", claims.decision),
        });
    }
    if now > claims.exp {
        return Err(SettldError::WalletIssuerDecisionInvalid {
            reason: "token expired".to_string(),
        });
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyset::{KeysetKey, PayKeyset};

    fn t(s: &str) -> IsoMillis {
        IsoMillis::parse(s).unwrap()
    }

    fn keyset_for(kp: &KeyPair) -> PayKeyset {
        PayKeyset {
            schema_version: settld_core::NOOTERRA_PAY_KEYSET_SCHEMA.to_string(),
            refreshed_at: t("2026-08-01T00:00:00.000Z"),
            active_key: KeysetKey {
                key_id: kp.key_id().to_string(),
                public_key_pem: kp.public_key_pem().to_string(),
            },
            fallback_keys: vec![],
            max_age_sec: 300,
        }
    }

    fn claims() -> PayTokenClaims {
        PayTokenClaims::challenge(
            "prov_tools",
            "gate_1",
            1000,
            "USD",
            t("2026-08-01T00:00:00.000Z"),
            t("2026-08-01T00:05:00.000Z"),
        )
    }

    #[test]
    fn mint_then_verify_round_trips() {
        let kp = KeyPair::generate();
        let token = mint(&claims(), &kp).unwrap();
        let verified = verify_challenge_token(
            &token,
            &keyset_for(&kp),
            "prov_tools",
            "gate_1",
            1000,
            "USD",
            t("2026-08-01T00:01:00.000Z"),
        )
        .unwrap();
        assert_eq!(verified.authorization_ref, None);
        assert_eq!(verified.iss, "nooterra");
    }

    #[test]
    fn expired_token_is_rejected() {
        let kp = KeyPair::generate();
        let token = mint(&claims(), &kp).unwrap();
        let err = verify_challenge_token(
            &token,
            &keyset_for(&kp),
            "prov_tools",
            "gate_1",
            1000,
            "USD",
            t("2026-08-01T01:00:00.000Z"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "X402_PAYMENT_TOKEN_EXPIRED");
    }

    #[test]
    fn wrong_gate_binding_is_rejected() {
        let kp = KeyPair::generate();
        let token = mint(&claims(), &kp).unwrap();
        let err = verify_challenge_token(
            &token,
            &keyset_for(&kp),
            "prov_tools",
            "gate_2",
            1000,
            "USD",
            t("2026-08-01T00:01:00.000Z"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "X402_PAYMENT_TOKEN_INVALID");
    }

    #[test]
    fn fallback_key_still_verifies() {
        let old = KeyPair::generate();
        let new = KeyPair::generate();
        let token = mint(&claims(), &old).unwrap();
        let mut keyset = keyset_for(&new);
        keyset.fallback_keys.push(KeysetKey {
            key_id: old.key_id().to_string(),
            public_key_pem: old.public_key_pem().to_string(),
        });
        verify_challenge_token(
            &token,
            &keyset,
            "prov_tools",
            "gate_1",
            1000,
            "USD",
            t("2026-08-01T00:01:00.000Z"),
        )
        .unwrap();
    }

    #[test]
    fn foreign_key_is_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let token = mint(&claims(), &kp).unwrap();
        let err = verify_challenge_token(
            &token,
            &keyset_for(&other),
            "prov_tools",
            "gate_1",
            1000,
            "USD",
            t("2026-08-01T00:01:00.000Z"),
        )
        .unwrap_err();
        assert_eq!(err.code(), "X402_PAYMENT_TOKEN_INVALID");
    }

    #[test]
    fn decision_token_is_audience_bound() {
        let issuer = KeyPair::generate();
        let claims = DecisionTokenClaims {
            iss: "wallet-issuer".into(),
            aud: "gate_1".into(),
            decision: "approve".into(),
            iat: t("2026-08-01T00:00:00.000Z"),
            exp: t("2026-08-01T00:05:00.000Z"),
        };
        let token = mint(&claims, &issuer).unwrap();
        let pems = vec![issuer.public_key_pem().to_string()];
        verify_decision_token(&token, &pems, "gate_1", t("2026-08-01T00:01:00.000Z")).unwrap();
        let err = verify_decision_token(&token, &pems, "gate_9", t("2026-08-01T00:01:00.000Z"))
            .unwrap_err();
        assert_eq!(err.code(), "X402_WALLET_ISSUER_DECISION_INVALID");
    }
}
