use serde_json::json;
use settld_core::{
    ArbitrationCase, Bindings, CaseStatus, DecisionMode, DecisionStatus, Dispute, DisputeStatus,
    GateState, HoldStatus, ReceiptStatus, SettldError, Verdict, X402Gate, PCT_DENOMINATOR,
};
use settld_crypto::canonical_sha256_hex;
use settld_dispute::{dispute_window_closes_at, dispute_window_open, verify_verdict_signature};
use settld_settlement::{build_decision_record, build_receipt, DecisionInputs, ReceiptInputs};
use tracing::info;

use crate::db::SettlementBundle;
use crate::engine::StateEngine;

// ── Parameters ────────────────────────────────────────────────────────────────

/// Request/response hashes a dispute or arbitration mutation must present
/// when the gate anchors binding evidence.
#[derive(Clone, Debug, PartialEq)]
pub struct BindingEvidence {
    pub request_sha256: String,
    pub response_sha256: String,
}

#[derive(Clone, Debug)]
pub struct OpenDisputeParams {
    pub opened_by_agent_id: String,
    pub reason: String,
    pub evidence_refs: Vec<String>,
    pub binding_evidence: Option<BindingEvidence>,
}

#[derive(Clone, Debug)]
pub struct OpenArbitrationParams {
    pub arbiter_agent_id: String,
    pub opened_by_agent_id: String,
    pub evidence_refs: Vec<String>,
    pub binary_verdict_required: bool,
    pub binding_evidence: Option<BindingEvidence>,
}

fn random_hex(n: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

/// Compare submitted binding evidence against the gate's anchored hashes.
fn check_binding_evidence(
    gate: &X402Gate,
    submitted: &Option<BindingEvidence>,
    required_err: SettldError,
    mismatch_err: SettldError,
) -> Result<(), SettldError> {
    if !gate.policy.request_binding_required {
        return Ok(());
    }
    let evidence = submitted.as_ref().ok_or(required_err)?;
    let intent_hash = gate
        .execution_intent
        .as_ref()
        .map(|i| i.request_sha256.as_str());
    let response_hash = gate
        .provider_response
        .as_ref()
        .map(|p| p.response_sha256.as_str());
    if intent_hash != Some(evidence.request_sha256.as_str())
        || response_hash != Some(evidence.response_sha256.as_str())
    {
        return Err(mismatch_err);
    }
    Ok(())
}

// ── Dispute / arbitration operations ──────────────────────────────────────────

impl StateEngine {
    /// Open a dispute against a settled gate. Window-gated on
    /// `receipt.settledAt + disputeWindowDays`; flips the receipt to
    /// `disputed` (a new content-addressed revision) and freezes any
    /// holdback fund.
    pub fn open_dispute(
        &self,
        tenant: &str,
        gate_id: &str,
        params: OpenDisputeParams,
    ) -> Result<Dispute, SettldError> {
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        if gate.state != GateState::Settled {
            return Err(SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "dispute-open".to_string(),
            });
        }
        self.require_agent(tenant, &params.opened_by_agent_id)?;

        let mut bundles = self.db.settlements_for_run(tenant, &gate.run_id)?;
        let bundle = bundles
            .last_mut()
            .filter(|b| b.receipt.is_some())
            .ok_or_else(|| SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "dispute-open".to_string(),
            })?;
        let receipt = bundle.receipt.as_mut().expect("receipt checked above");

        let now = self.now();
        if !dispute_window_open(receipt.settled_at, gate.dispute_window_days, now) {
            return Err(SettldError::DisputeWindowClosed {
                closed_at: dispute_window_closes_at(receipt.settled_at, gate.dispute_window_days)
                    .to_string(),
            });
        }

        check_binding_evidence(
            &gate,
            &params.binding_evidence,
            SettldError::DisputeOpenBindingEvidenceRequired,
            SettldError::DisputeOpenBindingEvidenceMismatch,
        )?;

        // Flip the receipt into `disputed` as a fresh revision.
        receipt.status = ReceiptStatus::Disputed;
        receipt.receipt_hash = None;
        let reissued_hash = canonical_sha256_hex(&*receipt)?;
        receipt.receipt_hash = Some(reissued_hash);
        self.db
            .update_latest_settlement(tenant, &gate.run_id, bundle)?;

        if let Some(mut hold) = self.db.get_hold(tenant, gate_id)? {
            if hold.status == HoldStatus::Held {
                hold.status = HoldStatus::Frozen;
                self.db.put_hold(&hold)?;
            }
        }

        let dispute = Dispute {
            tenant_id: tenant.to_string(),
            dispute_id: format!("dsp_{}", random_hex(24)),
            gate_id: gate_id.to_string(),
            run_id: gate.run_id.clone(),
            receipt_id: bundle
                .receipt
                .as_ref()
                .map(|r| r.receipt_id.clone())
                .unwrap_or_default(),
            opened_by_agent_id: params.opened_by_agent_id,
            reason: params.reason,
            evidence_refs: params.evidence_refs,
            status: DisputeStatus::Open,
            opened_at: now,
            closed_at: None,
            open_event_id: None,
        };

        gate.state = GateState::Disputed;
        self.db.put_gate(&gate)?;

        let event = self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_DISPUTE_OPENED",
            json!({
                "gateId": gate_id,
                "disputeId": dispute.dispute_id,
                "openedBy": dispute.opened_by_agent_id,
                "reason": dispute.reason,
            }),
        )?;
        let mut dispute = dispute;
        dispute.open_event_id = Some(event.event_id);
        self.db.put_dispute(&dispute)?;
        info!(gate_id = %gate_id, dispute_id = %dispute.dispute_id, "opened dispute");
        Ok(dispute)
    }

    /// Escalate an open dispute to an arbitration case.
    pub fn open_arbitration(
        &self,
        tenant: &str,
        dispute_id: &str,
        params: OpenArbitrationParams,
    ) -> Result<ArbitrationCase, SettldError> {
        let mut dispute = self
            .db
            .get_dispute(tenant, dispute_id)?
            .ok_or_else(|| SettldError::DisputeNotFound {
                dispute_id: dispute_id.to_string(),
            })?;
        if dispute.status != DisputeStatus::Open {
            return Err(SettldError::CaseStateInvalid {
                case_id: dispute_id.to_string(),
                status: format!("{:?}", dispute.status),
                op: "arbitration-open".to_string(),
            });
        }

        let lock = self
            .locks
            .acquire(&format!("gate:{tenant}:{}", dispute.gate_id));
        let _guard = lock.lock().expect("gate lock");

        let mut gate = self
            .db
            .get_gate(tenant, &dispute.gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: dispute.gate_id.clone(),
            })?;
        self.require_agent(tenant, &params.arbiter_agent_id)?;

        check_binding_evidence(
            &gate,
            &params.binding_evidence,
            SettldError::ArbitrationOpenBindingEvidenceRequired,
            SettldError::ArbitrationOpenBindingEvidenceMismatch,
        )?;

        let case = ArbitrationCase {
            tenant_id: tenant.to_string(),
            case_id: format!("case_{}", random_hex(24)),
            run_id: dispute.run_id.clone(),
            dispute_id: dispute_id.to_string(),
            gate_id: dispute.gate_id.clone(),
            arbiter_agent_id: params.arbiter_agent_id,
            opened_by_agent_id: params.opened_by_agent_id,
            status: CaseStatus::UnderReview,
            verdict: None,
            verdict_hash: None,
            verdict_signature: None,
            evidence_refs: params.evidence_refs,
            binary_verdict_required: params.binary_verdict_required,
            appeal_ref: None,
            related: Vec::new(),
            opened_at: self.now(),
            closed_at: None,
        };
        self.db.put_case(&case)?;

        dispute.status = DisputeStatus::Escalated;
        self.db.put_dispute(&dispute)?;
        gate.state = GateState::Arbitrating;
        self.db.put_gate(&gate)?;
        self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_ARBITRATION_OPENED",
            json!({
                "gateId": gate.gate_id,
                "caseId": case.case_id,
                "arbiterAgentId": case.arbiter_agent_id,
            }),
        )?;
        info!(case_id = %case.case_id, dispute_id = %dispute_id, "opened arbitration");
        Ok(case)
    }

    /// Apply a signed arbiter verdict: dispose the frozen holdback per the
    /// verdict's release rate and materialize the settlement adjustment — a
    /// fresh decision record (`decisionReason = "arbitration_verdict"`) and a
    /// second receipt whose `bindings.authorizationRef` equals the original
    /// gate's.
    pub fn submit_verdict(
        &self,
        tenant: &str,
        case_id: &str,
        verdict: Verdict,
        signature: &str,
        binding_evidence: Option<BindingEvidence>,
    ) -> Result<SettlementBundle, SettldError> {
        let mut case = self
            .db
            .get_case(tenant, case_id)?
            .ok_or_else(|| SettldError::CaseNotFound {
                case_id: case_id.to_string(),
            })?;
        if case.status != CaseStatus::UnderReview {
            return Err(SettldError::CaseStateInvalid {
                case_id: case_id.to_string(),
                status: case.status.as_str().to_string(),
                op: "verdict".to_string(),
            });
        }
        if verdict.case_id != case_id || verdict.arbiter_agent_id != case.arbiter_agent_id {
            return Err(SettldError::DisputeInvalidSigner);
        }

        let lock = self.locks.acquire(&format!("gate:{tenant}:{}", case.gate_id));
        let _guard = lock.lock().expect("gate lock");

        let mut gate = self
            .db
            .get_gate(tenant, &case.gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: case.gate_id.clone(),
            })?;
        if gate.state != GateState::Arbitrating {
            return Err(SettldError::GateStateInvalid {
                gate_id: gate.gate_id.clone(),
                state: gate.state.as_str().to_string(),
                op: "verdict".to_string(),
            });
        }

        check_binding_evidence(
            &gate,
            &binding_evidence,
            SettldError::ArbitrationVerdictBindingEvidenceRequired,
            SettldError::ArbitrationVerdictBindingEvidenceMismatch,
        )?;

        // The verdict hash must be signed by a key matching the arbiter's
        // registered keyId at issuedAt.
        let arbiter = self.require_agent(tenant, &case.arbiter_agent_id)?;
        let verdict_hash = verify_verdict_signature(
            &verdict,
            signature,
            &arbiter.public_key_pem,
            case.binary_verdict_required,
        )?;

        let now = self.now();
        let original = self
            .db
            .settlements_for_run(tenant, &gate.run_id)?
            .into_iter()
            .next()
            .ok_or_else(|| SettldError::GateStateInvalid {
                gate_id: gate.gate_id.clone(),
                state: gate.state.as_str().to_string(),
                op: "verdict".to_string(),
            })?;

        // Dispose the holdback fund.
        let mut released_extra = 0;
        let mut refunded_extra = 0;
        if let Some(mut hold) = self.db.get_hold(tenant, &gate.gate_id)? {
            if matches!(hold.status, HoldStatus::Held | HoldStatus::Frozen) {
                released_extra = hold.amount_cents * verdict.release_rate_pct / PCT_DENOMINATOR;
                refunded_extra = hold.amount_cents - released_extra;
                if released_extra > 0 {
                    self.pay_out_holdback(&gate, &gate.payee_agent_id.clone(), released_extra)?;
                }
                if refunded_extra > 0 {
                    self.pay_out_holdback(&gate, &gate.payer_agent_id.clone(), refunded_extra)?;
                }
                hold.status = if released_extra >= refunded_extra {
                    HoldStatus::Released
                } else {
                    HoldStatus::Refunded
                };
                self.db.put_hold(&hold)?;
            }
        }

        let verdict_event = self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_ARBITRATION_VERDICT_APPLIED",
            json!({
                "gateId": gate.gate_id,
                "caseId": case_id,
                "verdictId": verdict.verdict_id,
                "outcome": verdict.outcome,
                "releaseRatePct": verdict.release_rate_pct,
                "verdictHash": verdict_hash,
            }),
        )?;

        // Settlement adjustment: fresh record + second receipt bound to the
        // original gate's authorization.
        let record = build_decision_record(DecisionInputs {
            tenant_id: tenant.to_string(),
            run_id: gate.run_id.clone(),
            settlement_id: format!("stl_{}", &verdict_event.chain_hash[..24]),
            agreement_id: gate.agreement_id.clone(),
            decision_status: DecisionStatus::ManualResolved,
            decision_mode: DecisionMode::Manual,
            decision_reason: Some("arbitration_verdict".to_string()),
            verification_status: original.record.verification_status,
            policy_ref: original.record.policy_ref.clone(),
            verifier_ref: original.record.verifier_ref.clone(),
            run_status: original.record.run_status.clone(),
            run_last_event_id: verdict_event.event_id.clone(),
            run_last_chain_hash: verdict_event.chain_hash.clone(),
            resolution_event_id: verdict_event.event_id.clone(),
            bindings: Some(Bindings {
                authorization_ref: gate.authority_grant_ref.clone(),
                ..original
                    .record
                    .bindings
                    .clone()
                    .unwrap_or_default()
            }),
            decided_at: now,
        })?;

        let released_total = gate.released_cents + released_extra;
        let refunded_total = gate.refunded_cents + refunded_extra;
        let status = if released_total == gate.amount_cents {
            ReceiptStatus::Released
        } else if released_total == 0 {
            ReceiptStatus::Refunded
        } else {
            ReceiptStatus::Partial
        };
        let receipt = build_receipt(
            &record,
            ReceiptInputs {
                status,
                amount_cents: gate.amount_cents,
                released_amount_cents: released_total,
                refunded_amount_cents: refunded_total,
                release_rate_pct: verdict.release_rate_pct,
                currency: gate.currency.clone(),
                settled_at: now,
                created_at: now,
            },
        )?;

        let bundle = SettlementBundle {
            record,
            receipt: Some(receipt),
        };
        self.db.push_settlement(tenant, &gate.run_id, &bundle)?;

        gate.released_cents = released_total;
        gate.refunded_cents = refunded_total;
        gate.heldback_cents = 0;
        gate.state = GateState::Settled;
        self.db.put_gate(&gate)?;

        let mut dispute = self
            .db
            .get_dispute(tenant, &case.dispute_id)?
            .ok_or_else(|| SettldError::DisputeNotFound {
                dispute_id: case.dispute_id.clone(),
            })?;
        dispute.status = DisputeStatus::Closed;
        dispute.closed_at = Some(now);
        self.db.put_dispute(&dispute)?;

        case.status = CaseStatus::Closed;
        case.verdict = Some(verdict);
        case.verdict_hash = Some(verdict_hash);
        case.verdict_signature = Some(signature.to_string());
        case.closed_at = Some(now);
        self.db.put_case(&case)?;

        info!(case_id = %case_id, gate_id = %gate.gate_id, "applied arbitration verdict");
        Ok(bundle)
    }

    /// Open an appeal on a closed case. The new case inherits the original's
    /// lineage in `related[]`; the appealed case stays terminal (marked
    /// `appealed`) and points at its appeal through `appealRef`.
    pub fn appeal_case(
        &self,
        tenant: &str,
        case_id: &str,
        new_arbiter_agent_id: &str,
        opened_by_agent_id: &str,
    ) -> Result<ArbitrationCase, SettldError> {
        let mut original = self
            .db
            .get_case(tenant, case_id)?
            .ok_or_else(|| SettldError::CaseNotFound {
                case_id: case_id.to_string(),
            })?;
        if original.status != CaseStatus::Closed {
            return Err(SettldError::CaseStateInvalid {
                case_id: case_id.to_string(),
                status: original.status.as_str().to_string(),
                op: "appeal".to_string(),
            });
        }
        self.require_agent(tenant, new_arbiter_agent_id)?;

        let mut related = original.related.clone();
        related.push(original.case_id.clone());

        let appeal = ArbitrationCase {
            tenant_id: tenant.to_string(),
            case_id: format!("case_{}", random_hex(24)),
            run_id: original.run_id.clone(),
            dispute_id: original.dispute_id.clone(),
            gate_id: original.gate_id.clone(),
            arbiter_agent_id: new_arbiter_agent_id.to_string(),
            opened_by_agent_id: opened_by_agent_id.to_string(),
            status: CaseStatus::UnderReview,
            verdict: None,
            verdict_hash: None,
            verdict_signature: None,
            evidence_refs: original.evidence_refs.clone(),
            binary_verdict_required: original.binary_verdict_required,
            appeal_ref: None,
            related,
            opened_at: self.now(),
            closed_at: None,
        };
        self.db.put_case(&appeal)?;

        original.appeal_ref = Some(appeal.case_id.clone());
        original.status = CaseStatus::Appealed;
        self.db.put_case(&original)?;

        // The gate re-enters arbitration for the appeal's duration.
        if let Some(mut gate) = self.db.get_gate(tenant, &original.gate_id)? {
            gate.state = GateState::Arbitrating;
            self.db.put_gate(&gate)?;
        }
        info!(case_id = %appeal.case_id, appealed = %case_id, "opened appeal");
        Ok(appeal)
    }

    // ── Holdback resolution (driven by the maintenance loop) ─────────────────

    /// Release a matured holdback to the payee. Returns false when there is
    /// nothing to do (no hold, frozen by a dispute, or window not elapsed).
    pub fn release_holdback(&self, tenant: &str, gate_id: &str) -> Result<bool, SettldError> {
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let Some(mut hold) = self.db.get_hold(tenant, gate_id)? else {
            return Ok(false);
        };
        if hold.status != HoldStatus::Held {
            return Ok(false);
        }
        if self.now() < hold.releasable_at() {
            return Ok(false);
        }

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        self.pay_out_holdback(&gate, &gate.payee_agent_id.clone(), hold.amount_cents)?;
        hold.status = HoldStatus::Released;
        self.db.put_hold(&hold)?;

        gate.released_cents += hold.amount_cents;
        gate.heldback_cents = 0;
        self.db.put_gate(&gate)?;
        self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_HOLDBACK_RELEASED",
            json!({ "gateId": gate_id, "amountCents": hold.amount_cents }),
        )?;
        info!(gate_id = %gate_id, amount_cents = hold.amount_cents, "released holdback");
        Ok(true)
    }

    /// Refund an open holdback to the payer (admin resolution path).
    pub fn refund_holdback(&self, tenant: &str, gate_id: &str) -> Result<bool, SettldError> {
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let Some(mut hold) = self.db.get_hold(tenant, gate_id)? else {
            return Ok(false);
        };
        if !matches!(hold.status, HoldStatus::Held | HoldStatus::Frozen) {
            return Ok(false);
        }

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        self.pay_out_holdback(&gate, &gate.payer_agent_id.clone(), hold.amount_cents)?;
        hold.status = HoldStatus::Refunded;
        self.db.put_hold(&hold)?;

        gate.refunded_cents += hold.amount_cents;
        gate.heldback_cents = 0;
        self.db.put_gate(&gate)?;
        self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_HOLDBACK_REFUNDED",
            json!({ "gateId": gate_id, "amountCents": hold.amount_cents }),
        )?;
        Ok(true)
    }

    // ── Month close / payout enqueue (maintenance tick targets) ──────────────

    /// Close an accounting period for a tenant: one chained event on the
    /// tenant ledger stream marking the period boundary.
    pub fn close_month(&self, tenant: &str, period: &str) -> Result<(), SettldError> {
        self.append_system_event(
            tenant,
            &format!("ledger:{tenant}"),
            "MONTH_CLOSED",
            json!({ "period": period }),
        )?;
        info!(tenant = %tenant, period = %period, "closed month");
        Ok(())
    }

    /// Record that a settled gate's payout has been queued to the money rail.
    pub fn enqueue_payout(&self, tenant: &str, gate_id: &str) -> Result<(), SettldError> {
        let gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_PAYOUT_ENQUEUED",
            json!({
                "gateId": gate_id,
                "payeeAgentId": gate.payee_agent_id,
                "amountCents": gate.released_cents,
            }),
        )?;
        Ok(())
    }
}
