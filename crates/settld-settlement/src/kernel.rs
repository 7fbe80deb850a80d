use serde_json::json;
use settld_core::{
    Bindings, Cents, DecisionMode, DecisionRef, DecisionStatus, HashHex, IsoMillis, PolicyRef,
    ReceiptStatus, SettldError, SettlementDecisionRecord, SettlementReceipt, VerificationStatus,
    VerifierRef, ID_HASH_PREFIX_LEN,
};
use settld_crypto::canonical_sha256_hex;

// ── Inputs ────────────────────────────────────────────────────────────────────

/// What the gate hands the kernel at its terminal event: policy, verifier
/// evidence, and the exact chain position the decision is based on.
#[derive(Clone, Debug)]
pub struct DecisionInputs {
    pub tenant_id: String,
    pub run_id: String,
    pub settlement_id: String,
    pub agreement_id: String,
    pub decision_status: DecisionStatus,
    pub decision_mode: DecisionMode,
    pub decision_reason: Option<String>,
    pub verification_status: VerificationStatus,
    pub policy_ref: PolicyRef,
    pub verifier_ref: VerifierRef,
    pub run_status: String,
    pub run_last_event_id: String,
    pub run_last_chain_hash: HashHex,
    pub resolution_event_id: String,
    pub bindings: Option<Bindings>,
    pub decided_at: IsoMillis,
}

#[derive(Clone, Debug)]
pub struct ReceiptInputs {
    pub status: ReceiptStatus,
    pub amount_cents: Cents,
    pub released_amount_cents: Cents,
    pub refunded_amount_cents: Cents,
    pub release_rate_pct: i64,
    pub currency: String,
    pub settled_at: IsoMillis,
    pub created_at: IsoMillis,
}

// ── Builders ──────────────────────────────────────────────────────────────────

/// Materialize the decision record. The id is hash-derived from
/// `{runId, resolutionEventId}` so kernel replays are byte-stable; the
/// `decisionHash` covers the record with its own hash field set to null.
pub fn build_decision_record(
    inputs: DecisionInputs,
) -> Result<SettlementDecisionRecord, SettldError> {
    let id_seed = json!({
        "resolutionEventId": inputs.resolution_event_id,
        "runId": inputs.run_id,
    });
    let decision_id = format!(
        "dec_{}",
        &canonical_sha256_hex(&id_seed)?[..ID_HASH_PREFIX_LEN]
    );

    let mut record = SettlementDecisionRecord {
        tenant_id: inputs.tenant_id,
        decision_id,
        run_id: inputs.run_id,
        settlement_id: inputs.settlement_id,
        agreement_id: inputs.agreement_id,
        decision_status: inputs.decision_status,
        decision_mode: inputs.decision_mode,
        decision_reason: inputs.decision_reason,
        verification_status: inputs.verification_status,
        policy_ref: inputs.policy_ref,
        verifier_ref: inputs.verifier_ref,
        run_status: inputs.run_status,
        run_last_event_id: inputs.run_last_event_id,
        run_last_chain_hash: inputs.run_last_chain_hash,
        resolution_event_id: inputs.resolution_event_id,
        bindings: inputs.bindings,
        decided_at: inputs.decided_at,
        decision_hash: None,
    };
    record.decision_hash = Some(canonical_sha256_hex(&record)?);
    Ok(record)
}

/// Materialize the receipt for a decision record. The receipt carries the
/// decision's hash in `decisionRef` and repeats `runStatus` and
/// `resolutionEventId` so the pair can be cross-checked without the record.
pub fn build_receipt(
    record: &SettlementDecisionRecord,
    inputs: ReceiptInputs,
) -> Result<SettlementReceipt, SettldError> {
    let decision_hash = record
        .decision_hash
        .clone()
        .ok_or(SettldError::DecisionHashMismatch)?;
    let id_seed = json!({
        "decisionId": record.decision_id,
        "settlementId": record.settlement_id,
    });
    let receipt_id = format!(
        "rcpt_{}",
        &canonical_sha256_hex(&id_seed)?[..ID_HASH_PREFIX_LEN]
    );

    let mut receipt = SettlementReceipt {
        tenant_id: record.tenant_id.clone(),
        receipt_id,
        decision_ref: DecisionRef {
            decision_id: record.decision_id.clone(),
            decision_hash,
        },
        status: inputs.status,
        amount_cents: inputs.amount_cents,
        released_amount_cents: inputs.released_amount_cents,
        refunded_amount_cents: inputs.refunded_amount_cents,
        release_rate_pct: inputs.release_rate_pct,
        currency: inputs.currency,
        run_status: record.run_status.clone(),
        resolution_event_id: record.resolution_event_id.clone(),
        settled_at: inputs.settled_at,
        created_at: inputs.created_at,
        bindings: record.bindings.clone(),
        receipt_hash: None,
    };
    receipt.receipt_hash = Some(canonical_sha256_hex(&receipt)?);
    Ok(receipt)
}

// ── Binding re-verification ───────────────────────────────────────────────────

/// Re-verify a `(record, receipt)` pair, as done on every read. Each check
/// has its own stable code; the first failure aborts.
pub fn verify_settlement_binding(
    record: &SettlementDecisionRecord,
    receipt: &SettlementReceipt,
) -> Result<(), SettldError> {
    // Hashes recompute byte-exactly.
    let stored_decision_hash = record
        .decision_hash
        .as_deref()
        .ok_or(SettldError::DecisionHashMismatch)?;
    let mut unhashed = record.clone();
    unhashed.decision_hash = None;
    if canonical_sha256_hex(&unhashed)? != stored_decision_hash {
        return Err(SettldError::DecisionHashMismatch);
    }

    let stored_receipt_hash = receipt
        .receipt_hash
        .as_deref()
        .ok_or(SettldError::ReceiptHashMismatch)?;
    let mut unhashed = receipt.clone();
    unhashed.receipt_hash = None;
    if canonical_sha256_hex(&unhashed)? != stored_receipt_hash {
        return Err(SettldError::ReceiptHashMismatch);
    }

    if receipt.decision_ref.decision_hash != stored_decision_hash
        || receipt.decision_ref.decision_id != record.decision_id
    {
        return Err(SettldError::ReceiptDecisionHashMismatch);
    }

    // Temporal ordering: decidedAt ≤ createdAt ≤ settledAt.
    if receipt.settled_at < record.decided_at {
        return Err(SettldError::ReceiptSettledBeforeDecision);
    }
    if receipt.created_at < record.decided_at {
        return Err(SettldError::ReceiptBeforeDecision);
    }
    if receipt.settled_at < receipt.created_at {
        return Err(SettldError::ReceiptSettledBeforeCreated);
    }

    if receipt.run_status != record.run_status {
        return Err(SettldError::ReceiptRunStatusMismatch);
    }
    if receipt.resolution_event_id != record.resolution_event_id {
        return Err(SettldError::ReceiptResolutionEventMismatch);
    }

    // Bindings agree field-by-field when both sides carry a block.
    if let (Some(a), Some(b)) = (&record.bindings, &receipt.bindings) {
        check_binding_field("authorizationRef", &a.authorization_ref, &b.authorization_ref)?;
        check_binding_field("paymentTokenHash", &a.payment_token_hash, &b.payment_token_hash)?;
        check_binding_field("requestSha256", &a.request_sha256, &b.request_sha256)?;
        check_binding_field("responseSha256", &a.response_sha256, &b.response_sha256)?;
        check_binding_field(
            "providerSignatureKeyId",
            &a.provider_signature_key_id,
            &b.provider_signature_key_id,
        )?;
    }

    Ok(())
}

fn check_binding_field(
    field: &str,
    record_side: &Option<String>,
    receipt_side: &Option<String>,
) -> Result<(), SettldError> {
    if record_side != receipt_side {
        return Err(SettldError::BindingsMismatch {
            field: field.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> IsoMillis {
        IsoMillis::parse(s).unwrap()
    }

    fn decision_inputs() -> DecisionInputs {
        DecisionInputs {
            tenant_id: "tn_test".into(),
            run_id: "run_1".into(),
            settlement_id: "stl_1".into(),
            agreement_id: "agr_1".into(),
            decision_status: DecisionStatus::AutoResolved,
            decision_mode: DecisionMode::Automatic,
            decision_reason: None,
            verification_status: VerificationStatus::Green,
            policy_ref: PolicyRef {
                policy_hash: "a".repeat(64),
                verification_method_hash: "b".repeat(64),
            },
            verifier_ref: VerifierRef {
                verifier_id: "verifier_http".into(),
                verifier_version: "1.2.0".into(),
                verifier_hash: "c".repeat(64),
                modality: "http".into(),
            },
            run_status: "completed".into(),
            run_last_event_id: "ev_abc".into(),
            run_last_chain_hash: "d".repeat(64),
            resolution_event_id: "ev_res".into(),
            bindings: Some(Bindings {
                authorization_ref: Some("grant_1".into()),
                payment_token_hash: Some("e".repeat(64)),
                request_sha256: Some("f".repeat(64)),
                response_sha256: Some("0".repeat(64)),
                provider_signature_key_id: Some("key_prov".into()),
            }),
            decided_at: t("2026-08-01T12:00:00.000Z"),
        }
    }

    fn receipt_inputs() -> ReceiptInputs {
        ReceiptInputs {
            status: ReceiptStatus::Released,
            amount_cents: 1000,
            released_amount_cents: 1000,
            refunded_amount_cents: 0,
            release_rate_pct: 100,
            currency: "USD".into(),
            settled_at: t("2026-08-01T12:00:01.000Z"),
            created_at: t("2026-08-01T12:00:00.500Z"),
        }
    }

    fn build_pair() -> (SettlementDecisionRecord, SettlementReceipt) {
        let record = build_decision_record(decision_inputs()).unwrap();
        let receipt = build_receipt(&record, receipt_inputs()).unwrap();
        (record, receipt)
    }

    #[test]
    fn built_pair_passes_binding_verification() {
        let (record, receipt) = build_pair();
        verify_settlement_binding(&record, &receipt).unwrap();
    }

    #[test]
    fn decision_id_is_deterministic() {
        let a = build_decision_record(decision_inputs()).unwrap();
        let b = build_decision_record(decision_inputs()).unwrap();
        assert_eq!(a.decision_id, b.decision_id);
        assert_eq!(a.decision_hash, b.decision_hash);
    }

    #[test]
    fn tampered_record_field_breaks_decision_hash() {
        let (mut record, receipt) = build_pair();
        record.run_status = "failed".into();
        let err = verify_settlement_binding(&record, &receipt).unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_DECISION_HASH_MISMATCH");
    }

    #[test]
    fn tampered_receipt_amount_breaks_receipt_hash() {
        let (record, mut receipt) = build_pair();
        receipt.released_amount_cents = 999_999;
        let err = verify_settlement_binding(&record, &receipt).unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_RECEIPT_HASH_MISMATCH");
    }

    #[test]
    fn receipt_pointing_at_wrong_decision_is_rejected() {
        let (_, receipt) = build_pair();
        let mut other_inputs = decision_inputs();
        other_inputs.run_id = "run_2".into();
        let other = build_decision_record(other_inputs).unwrap();
        let err = verify_settlement_binding(&other, &receipt).unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_RECEIPT_DECISION_HASH_MISMATCH");
    }

    #[test]
    fn settled_before_decision_is_rejected() {
        let record = build_decision_record(decision_inputs()).unwrap();
        let mut inputs = receipt_inputs();
        inputs.settled_at = t("2026-08-01T11:00:00.000Z");
        inputs.created_at = t("2026-08-01T11:00:00.000Z");
        let receipt = build_receipt(&record, inputs).unwrap();
        let err = verify_settlement_binding(&record, &receipt).unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_RECEIPT_SETTLED_BEFORE_DECISION");
    }

    #[test]
    fn created_before_decision_is_rejected() {
        let record = build_decision_record(decision_inputs()).unwrap();
        let mut inputs = receipt_inputs();
        inputs.created_at = t("2026-08-01T11:59:59.999Z");
        let receipt = build_receipt(&record, inputs).unwrap();
        let err = verify_settlement_binding(&record, &receipt).unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_RECEIPT_BEFORE_DECISION");
    }

    #[test]
    fn settled_before_created_is_rejected() {
        let record = build_decision_record(decision_inputs()).unwrap();
        let mut inputs = receipt_inputs();
        inputs.created_at = t("2026-08-01T12:00:05.000Z");
        inputs.settled_at = t("2026-08-01T12:00:04.000Z");
        let receipt = build_receipt(&record, inputs).unwrap();
        let err = verify_settlement_binding(&record, &receipt).unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_RECEIPT_SETTLED_BEFORE_CREATED");
    }

    #[test]
    fn bindings_must_agree_when_present_on_both() {
        let (record, mut receipt) = build_pair();
        let mut b = receipt.bindings.clone().unwrap();
        b.response_sha256 = Some("1".repeat(64));
        receipt.bindings = Some(b);
        // Re-seal the receipt so only the bindings check can fail.
        receipt.receipt_hash = None;
        receipt.receipt_hash = Some(canonical_sha256_hex(&receipt).unwrap());
        let err = verify_settlement_binding(&record, &receipt).unwrap_err();
        assert_eq!(err.code(), "SETTLEMENT_BINDINGS_MISMATCH");
    }
}
