use settld_core::{HashHex, SettldError, Verdict, VerdictOutcome};
use settld_crypto::{canonical_sha256_hex, sign_hash_hex, verify_hash_hex, KeyPair};

/// Canonical hash of a verdict envelope. The envelope is hashed whole (it
/// carries no hash field of its own); the arbiter signs this digest.
pub fn verdict_hash(verdict: &Verdict) -> Result<HashHex, SettldError> {
    canonical_sha256_hex(verdict)
}

/// Sign a verdict with the arbiter's keypair. Returns `(hash, signature)`.
pub fn sign_verdict(
    verdict: &Verdict,
    arbiter: &KeyPair,
) -> Result<(HashHex, String), SettldError> {
    let hash = verdict_hash(verdict)?;
    let signature = sign_hash_hex(&hash, arbiter)?;
    Ok((hash, signature))
}

/// Verify a verdict signature against the arbiter's registered public key,
/// and enforce the binary-outcome rule when the case demands it.
///
/// The caller resolves `arbiter_pem` from the arbiter's registered keyId at
/// `verdict.issuedAt`; a signature that does not verify is
/// `DISPUTE_INVALID_SIGNER`.
pub fn verify_verdict_signature(
    verdict: &Verdict,
    signature: &str,
    arbiter_pem: &str,
    binary_required: bool,
) -> Result<HashHex, SettldError> {
    if binary_required && matches!(verdict.outcome, VerdictOutcome::Partial) {
        return Err(SettldError::VerdictNotBinary);
    }
    if verdict.release_rate_pct < 0 || verdict.release_rate_pct > 100 {
        return Err(SettldError::Serialization(format!(
            "releaseRatePct out of range: {}",
            verdict.release_rate_pct
        )));
    }
    let hash = verdict_hash(verdict)?;
    if !verify_hash_hex(&hash, signature, arbiter_pem) {
        return Err(SettldError::DisputeInvalidSigner);
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use settld_core::IsoMillis;

    fn verdict(outcome: VerdictOutcome, rate: i64) -> Verdict {
        Verdict {
            verdict_id: "vrd_1".into(),
            case_id: "case_1".into(),
            arbiter_agent_id: "agent_arbiter".into(),
            outcome,
            release_rate_pct: rate,
            rationale: "evidence matched the anchored response hash".into(),
            evidence_refs: vec!["http:response_sha256:abc".into()],
            issued_at: IsoMillis::parse("2026-08-02T10:00:00.000Z").unwrap(),
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let kp = KeyPair::generate();
        let v = verdict(VerdictOutcome::Accepted, 100);
        let (hash, sig) = sign_verdict(&v, &kp).unwrap();
        let verified = verify_verdict_signature(&v, &sig, kp.public_key_pem(), false).unwrap();
        assert_eq!(hash, verified);
    }

    #[test]
    fn foreign_signer_is_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let v = verdict(VerdictOutcome::Accepted, 100);
        let (_, sig) = sign_verdict(&v, &kp).unwrap();
        let err =
            verify_verdict_signature(&v, &sig, other.public_key_pem(), false).unwrap_err();
        assert_eq!(err.code(), "DISPUTE_INVALID_SIGNER");
    }

    #[test]
    fn partial_outcome_rejected_when_binary_required() {
        let kp = KeyPair::generate();
        let v = verdict(VerdictOutcome::Partial, 60);
        let (_, sig) = sign_verdict(&v, &kp).unwrap();
        let err = verify_verdict_signature(&v, &sig, kp.public_key_pem(), true).unwrap_err();
        assert_eq!(err.code(), "TOOL_CALL_VERDICT_NOT_BINARY");
    }

    #[test]
    fn tampered_rationale_breaks_the_signature() {
        let kp = KeyPair::generate();
        let v = verdict(VerdictOutcome::Rejected, 0);
        let (_, sig) = sign_verdict(&v, &kp).unwrap();
        let mut tampered = v.clone();
        tampered.rationale = "changed".into();
        let err =
            verify_verdict_signature(&tampered, &sig, kp.public_key_pem(), false).unwrap_err();
        assert_eq!(err.code(), "DISPUTE_INVALID_SIGNER");
    }
}
