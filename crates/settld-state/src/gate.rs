use serde::{Deserialize, Serialize};
use serde_json::json;
use settld_core::{
    ActorRef, ActorType, Bindings, Cents, DecisionMode, DecisionStatus, ExecutionIntent,
    FundingHold, GatePolicy, GateState, GrantCall, HoldStatus, IsoMillis,
    ProviderResponseAnchor, ProviderSignaturePolicy, ReceiptStatus, SettldError,
    SettlementDecisionRecord, SettlementReceipt, VerificationStatus, VerifierRef, X402Gate,
    BPS_DENOMINATOR, EVIDENCE_REQUEST_SHA256, EVIDENCE_RESPONSE_SHA256, HDR_PROVIDER_REPLAY,
    PAY_TOKEN_TTL_SECS, PCT_DENOMINATOR,
};
use settld_pay::{token, GatewayHeaders, PaymentRequiredChallenge, PayTokenClaims};
use settld_settlement::{build_decision_record, build_receipt, DecisionInputs, ReceiptInputs};
use tracing::{info, warn};

use crate::db::{OutboxKind, OutboxMessage, SettlementBundle};
use crate::engine::StateEngine;

// ── Parameters / results ──────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CreateGateParams {
    pub tenant_id: String,
    pub run_id: String,
    pub agreement_id: String,
    pub payer_agent_id: String,
    pub payee_agent_id: String,
    pub provider_id: String,
    pub tool_id: Option<String>,
    pub amount_cents: Cents,
    pub currency: String,
    pub authority_grant_ref: Option<String>,
    pub agent_passport: Option<String>,
    pub holdback_bps: i64,
    pub dispute_window_days: i64,
    pub policy: GatePolicy,
}

/// What the 402 challenge surface returns: the stored gate, the
/// `x-payment-required` header value, and the NooterraPay challenge token.
#[derive(Clone, Debug)]
pub struct ChallengeBundle {
    pub gate: X402Gate,
    pub payment_required: String,
    pub token: String,
}

#[derive(Clone, Debug, Default)]
pub struct AuthorizeParams {
    pub execution_intent: Option<ExecutionIntent>,
    pub wallet_issuer_token: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyParams {
    pub verification_status: VerificationStatus,
    pub run_status: String,
    pub policy_hash: String,
    pub verification_method_hash: String,
    pub verifier: VerifierRef,
    pub evidence_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_response: Option<ProviderResponseAnchor>,
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

/// Terminal result of a verify: the updated gate plus the kernel artifacts.
/// `receipt` is absent while a manual review is pending.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub gate: X402Gate,
    pub record: SettlementDecisionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SettlementReceipt>,
}

/// Result of a provider response submission.
pub enum ProviderSubmission {
    Anchored(Box<X402Gate>),
    /// Duplicate of an already-anchored response: the original receipt body
    /// verbatim plus the replay marker header.
    Replay {
        receipt: Box<SettlementReceipt>,
        headers: Vec<(String, String)>,
    },
}

fn evidence_value(refs: &[String], prefix: &str) -> Option<String> {
    refs.iter()
        .find_map(|r| r.strip_prefix(prefix))
        .map(str::to_string)
}

fn random_hex(n: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

// ── Gate operations ───────────────────────────────────────────────────────────

impl StateEngine {
    /// Open a gate and produce the 402 challenge: the header value and a
    /// NooterraPay token bound to exactly this gate, provider and amount.
    pub fn create_gate(&self, params: CreateGateParams) -> Result<ChallengeBundle, SettldError> {
        if params.amount_cents <= 0 {
            return Err(SettldError::GrantInvalid {
                reason: "gate amount must be positive".to_string(),
            });
        }
        if !(0..=BPS_DENOMINATOR).contains(&params.holdback_bps) {
            return Err(SettldError::GrantInvalid {
                reason: format!("holdbackBps out of range: {}", params.holdback_bps),
            });
        }
        if params.dispute_window_days < 0 {
            return Err(SettldError::GrantInvalid {
                reason: "disputeWindowDays must be non-negative".to_string(),
            });
        }
        self.require_agent(&params.tenant_id, &params.payer_agent_id)?;
        self.require_agent(&params.tenant_id, &params.payee_agent_id)?;

        let gate_id = format!("gate_{}", random_hex(24));
        let now = self.now();
        let exp = IsoMillis(now.0 + chrono::Duration::seconds(PAY_TOKEN_TTL_SECS));

        let claims = PayTokenClaims::challenge(
            &params.provider_id,
            &gate_id,
            params.amount_cents,
            &params.currency,
            now,
            exp,
        );
        let token_text = token::mint(&claims, &self.pay_keypair)?;
        let payment_token_hash = claims.claims_hash()?;

        let challenge = PaymentRequiredChallenge {
            amount_cents: params.amount_cents,
            currency: params.currency.clone(),
            provider_id: params.provider_id.clone(),
            tool_id: params.tool_id.clone(),
            nonce: random_hex(16),
        };

        let gate = X402Gate {
            tenant_id: params.tenant_id.clone(),
            gate_id: gate_id.clone(),
            run_id: params.run_id,
            agreement_id: params.agreement_id,
            payer_agent_id: params.payer_agent_id,
            payee_agent_id: params.payee_agent_id,
            amount_cents: params.amount_cents,
            currency: params.currency,
            tool_id: params.tool_id,
            provider_id: params.provider_id,
            authority_grant_ref: params.authority_grant_ref,
            agent_passport: params.agent_passport,
            payment_token_hash: Some(payment_token_hash),
            holdback_bps: params.holdback_bps,
            dispute_window_days: params.dispute_window_days,
            policy: params.policy,
            execution_intent: None,
            provider_response: None,
            state: GateState::Created,
            created_at: now,
            authorized_at: None,
            settled_at: None,
            locked_cents: 0,
            released_cents: 0,
            refunded_cents: 0,
            heldback_cents: 0,
        };

        let lock = self
            .locks
            .acquire(&format!("gate:{}:{}", gate.tenant_id, gate.gate_id));
        let _guard = lock.lock().expect("gate lock");
        self.db.put_gate(&gate)?;
        self.append_system_event(
            &gate.tenant_id,
            &gate.stream_id(),
            "X402_GATE_CREATED",
            json!({
                "gateId": gate.gate_id,
                "amountCents": gate.amount_cents,
                "currency": gate.currency,
                "payerAgentId": gate.payer_agent_id,
                "payeeAgentId": gate.payee_agent_id,
                "providerId": gate.provider_id,
            }),
        )?;
        info!(gate_id = %gate.gate_id, amount_cents = gate.amount_cents, "created gate");

        Ok(ChallengeBundle {
            payment_required: challenge.format(),
            token: token_text,
            gate,
        })
    }

    /// Authorize a gate: reserve the payer's funds into escrow under the
    /// gate's authority constraints. Preconditions are evaluated in the
    /// contract order; nothing is persisted unless all pass.
    pub fn authorize_gate(
        &self,
        tenant: &str,
        gate_id: &str,
        params: AuthorizeParams,
    ) -> Result<X402Gate, SettldError> {
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let scope = format!("gate-authorize:{gate_id}");
        let fingerprint = settld_crypto::sha256_hex(
            format!(
                "{:?}:{:?}",
                params.execution_intent, params.wallet_issuer_token
            )
            .as_bytes(),
        );
        if let Some(key) = params.idempotency_key.as_deref() {
            if let Some(stored) = self.replay_idempotent(tenant, &scope, key, &fingerprint)? {
                return Ok(stored);
            }
        }

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        if gate.state != GateState::Created {
            return Err(SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "authorize".to_string(),
            });
        }
        let now = self.now();

        // 1–2. Emergency controls.
        self.check_emergency_controls(
            tenant,
            &[
                gate.payer_agent_id.as_str(),
                gate.payee_agent_id.as_str(),
                gate.provider_id.as_str(),
            ],
        )?;

        // 3. Payer agent must be active.
        let payer = self.require_agent(tenant, &gate.payer_agent_id)?;
        if !payer.is_active() {
            return Err(SettldError::AgentNotActive {
                agent_id: gate.payer_agent_id.clone(),
            });
        }

        // 4. Authority grant.
        if let Some(grant_id) = gate.authority_grant_ref.as_deref() {
            let call = GrantCall {
                provider_id: gate.provider_id.clone(),
                tool_id: gate.tool_id.clone(),
                amount_cents: gate.amount_cents,
                currency: gate.currency.clone(),
                at: now,
                risk_classes: Vec::new(),
                side_effecting: false,
            };
            self.evaluate_grant(tenant, grant_id, &call)?;
        }

        // 5. Wallet-issuer decision token.
        if gate.policy.wallet_issuer_decision_required {
            let token_text = params
                .wallet_issuer_token
                .as_deref()
                .ok_or(SettldError::WalletIssuerDecisionRequired)?;
            token::verify_decision_token(
                token_text,
                &self.config.wallet_issuer_pems,
                gate_id,
                now,
            )?;
        }

        // 6. Wallet lock (staged; committed below).
        let payer_wallet = self.wallet_of(tenant, &gate.payer_agent_id)?;
        if payer_wallet.available_cents < gate.amount_cents {
            return Err(SettldError::InsufficientFunds {
                need_cents: gate.amount_cents,
                have_cents: payer_wallet.available_cents,
            });
        }

        // 7. Execution intent.
        if gate.policy.execution_intent_required {
            let intent = params
                .execution_intent
                .as_ref()
                .ok_or(SettldError::ExecutionIntentRequired)?;
            match params.idempotency_key.as_deref() {
                Some(key) if key == intent.idempotency_key => {}
                _ => return Err(SettldError::ExecutionIntentIdempotencyMismatch),
            }
            if let Some(existing) = &gate.execution_intent {
                if existing.request_sha256 != intent.request_sha256 {
                    return Err(SettldError::ExecutionIntentConflict);
                }
            }
        }

        // Commit.
        self.lock_gate_escrow(&gate)?;
        if let Some(grant_id) = gate.authority_grant_ref.clone() {
            self.record_grant_spend(tenant, &grant_id, gate.amount_cents)?;
        }
        gate.execution_intent = params.execution_intent.clone();
        gate.locked_cents = gate.amount_cents;
        gate.state = GateState::Authorized;
        gate.authorized_at = Some(now);
        self.db.put_gate(&gate)?;
        self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_GATE_AUTHORIZED",
            json!({
                "gateId": gate.gate_id,
                "lockedCents": gate.locked_cents,
                "authorityGrantRef": gate.authority_grant_ref,
            }),
        )?;

        if let Some(key) = params.idempotency_key.as_deref() {
            self.store_idempotent(tenant, &scope, key, &fingerprint, &gate)?;
        }
        info!(gate_id = %gate.gate_id, "authorized gate");
        Ok(gate)
    }

    /// Anchor a provider's signed response on the gate. A byte-identical
    /// duplicate after settlement replays the original receipt body with
    /// the `x-nooterra-provider-replay: duplicate` marker.
    pub fn submit_provider_response(
        &self,
        tenant: &str,
        gate_id: &str,
        anchor: ProviderResponseAnchor,
    ) -> Result<ProviderSubmission, SettldError> {
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;

        if let Some(existing) = &gate.provider_response {
            if *existing == anchor {
                let receipt = self
                    .db
                    .settlements_for_run(tenant, &gate.run_id)?
                    .into_iter()
                    .filter_map(|b| b.receipt)
                    .next_back()
                    .ok_or_else(|| SettldError::GateStateInvalid {
                        gate_id: gate_id.to_string(),
                        state: gate.state.as_str().to_string(),
                        op: "provider-replay".to_string(),
                    })?;
                return Ok(ProviderSubmission::Replay {
                    receipt: Box::new(receipt),
                    headers: vec![(HDR_PROVIDER_REPLAY.to_string(), "duplicate".to_string())],
                });
            }
            return Err(SettldError::IdempotencyConflict {
                key: anchor.nonce.clone(),
            });
        }

        if gate.state != GateState::Authorized {
            return Err(SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "provider-response".to_string(),
            });
        }

        let payee = self.require_agent(tenant, &gate.payee_agent_id)?;
        settld_pay::verify_provider_response(&anchor, &payee.public_key_pem)?;

        gate.provider_response = Some(anchor);
        self.db.put_gate(&gate)?;
        Ok(ProviderSubmission::Anchored(Box::new(gate)))
    }

    /// Verify an authorized gate and settle it. This is the hand-off point to
    /// the settlement kernel: the terminal event is appended, the decision
    /// record and receipt are materialized, and escrow is released, refunded
    /// or held back per policy.
    pub fn verify_gate(
        &self,
        tenant: &str,
        gate_id: &str,
        params: VerifyParams,
    ) -> Result<SettlementOutcome, SettldError> {
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let scope = format!("gate-verify:{gate_id}");
        let fingerprint = settld_crypto::canonical_sha256_hex(&params)?;
        if let Some(key) = params.idempotency_key.as_deref() {
            if let Some(stored) = self.replay_idempotent(tenant, &scope, key, &fingerprint)? {
                return Ok(stored);
            }
        }

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        if gate.state != GateState::Authorized {
            return Err(SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "verify".to_string(),
            });
        }

        // A revoked grant blocks every operation on a gate it authorized
        // until the gate reaches `verified` — including idempotent retries.
        if let Some(grant_id) = gate.authority_grant_ref.as_deref() {
            let grant =
                self.db
                    .get_grant(tenant, grant_id)?
                    .ok_or_else(|| SettldError::GrantNotFound {
                        grant_id: grant_id.to_string(),
                    })?;
            if grant.is_revoked() {
                warn!(gate_id = %gate_id, grant_id = %grant_id, "verify blocked by revoked grant");
                return Err(SettldError::GrantRevoked);
            }
        }

        // Provider response anchoring (may arrive inline with verify).
        if let Some(anchor) = &params.provider_response {
            let payee = self.require_agent(tenant, &gate.payee_agent_id)?;
            settld_pay::verify_provider_response(anchor, &payee.public_key_pem)?;
            if let Some(existing) = &gate.provider_response {
                if existing != anchor {
                    return Err(SettldError::RequestBindingEvidenceMismatch);
                }
            }
            gate.provider_response = Some(anchor.clone());
        }

        // Fail-closed provider signature requirement.
        if matches!(gate.policy.provider_signature, ProviderSignaturePolicy::Required)
            && gate.provider_response.is_none()
        {
            return Err(SettldError::ProviderSignatureInvalid);
        }

        // Request/response binding evidence.
        if gate.policy.request_binding_required {
            let intent = gate
                .execution_intent
                .as_ref()
                .ok_or(SettldError::RequestBindingRequired)?;
            let request_evidence = evidence_value(&params.evidence_refs, EVIDENCE_REQUEST_SHA256)
                .ok_or(SettldError::RequestBindingEvidenceRequired)?;
            let response_evidence = evidence_value(&params.evidence_refs, EVIDENCE_RESPONSE_SHA256)
                .ok_or(SettldError::RequestBindingEvidenceRequired)?;
            let anchor = gate
                .provider_response
                .as_ref()
                .ok_or(SettldError::RequestBindingEvidenceRequired)?;
            if request_evidence != intent.request_sha256
                || response_evidence != anchor.response_sha256
            {
                return Err(SettldError::RequestBindingEvidenceMismatch);
            }
        }

        let now = self.now();
        let amount = gate.amount_cents;
        let release_rate_pct = gate.policy.release_rate_for(params.verification_status);
        let released_total = amount * release_rate_pct / PCT_DENOMINATOR;
        let heldback = if gate.holdback_bps > 0 {
            (amount * gate.holdback_bps / BPS_DENOMINATOR).min(released_total)
        } else {
            0
        };
        let released_to_payee = released_total - heldback;
        let refunded = amount - released_total;

        let manual_review = !gate.policy.auto_release;

        // Terminal event on the gate stream: the resolution event every
        // settlement artifact points back to.
        let verified_event = self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_GATE_VERIFIED",
            json!({
                "gateId": gate.gate_id,
                "verificationStatus": params.verification_status,
                "runStatus": params.run_status,
                "releaseRatePct": release_rate_pct,
                "releasedAmountCents": released_total,
                "refundedAmountCents": refunded,
                "heldbackCents": heldback,
                "evidenceRefs": params.evidence_refs,
            }),
        )?;

        let bindings = Bindings {
            authorization_ref: gate.authority_grant_ref.clone(),
            payment_token_hash: gate.payment_token_hash.clone(),
            request_sha256: gate
                .execution_intent
                .as_ref()
                .map(|i| i.request_sha256.clone()),
            response_sha256: gate
                .provider_response
                .as_ref()
                .map(|p| p.response_sha256.clone()),
            provider_signature_key_id: gate
                .provider_response
                .as_ref()
                .map(|p| p.provider_key_id.clone()),
        };

        let record = build_decision_record(DecisionInputs {
            tenant_id: tenant.to_string(),
            run_id: gate.run_id.clone(),
            settlement_id: format!("stl_{}", &verified_event.chain_hash[..24]),
            agreement_id: gate.agreement_id.clone(),
            decision_status: if manual_review {
                DecisionStatus::ManualReviewRequired
            } else {
                DecisionStatus::AutoResolved
            },
            decision_mode: DecisionMode::Automatic,
            decision_reason: None,
            verification_status: params.verification_status,
            policy_ref: settld_core::PolicyRef {
                policy_hash: params.policy_hash.clone(),
                verification_method_hash: params.verification_method_hash.clone(),
            },
            verifier_ref: params.verifier.clone(),
            run_status: params.run_status.clone(),
            run_last_event_id: verified_event.event_id.clone(),
            run_last_chain_hash: verified_event.chain_hash.clone(),
            resolution_event_id: verified_event.event_id.clone(),
            bindings: Some(bindings),
            decided_at: now,
        })?;

        if manual_review {
            gate.state = GateState::Verified;
            self.db.put_gate(&gate)?;
            self.db.push_settlement(
                tenant,
                &gate.run_id,
                &SettlementBundle {
                    record: record.clone(),
                    receipt: None,
                },
            )?;
            let outcome = SettlementOutcome {
                gate,
                record,
                receipt: None,
            };
            if let Some(key) = params.idempotency_key.as_deref() {
                self.store_idempotent(tenant, &scope, key, &fingerprint, &outcome)?;
            }
            return Ok(outcome);
        }

        // Move the money.
        self.settle_gate_escrow(&gate, released_to_payee, refunded, heldback)?;

        let hold_outstanding = heldback > 0 && gate.dispute_window_days > 0;
        if heldback > 0 {
            let hold = FundingHold {
                tenant_id: tenant.to_string(),
                gate_id: gate.gate_id.clone(),
                agreement_hash: gate.agreement_id.clone(),
                receipt_id: String::new(),
                amount_cents: heldback,
                currency: gate.currency.clone(),
                challenge_window_ms: gate.dispute_window_days * 86_400_000,
                held_since: now,
                status: if hold_outstanding {
                    HoldStatus::Held
                } else {
                    HoldStatus::Released
                },
            };
            self.db.put_hold(&hold)?;
            if hold_outstanding {
                self.db.enqueue_outbox(&OutboxMessage {
                    tenant_id: tenant.to_string(),
                    kind: OutboxKind::HoldbackRelease,
                    message_id: format!("obx_{}", random_hex(16)),
                    scheduled_at: hold.releasable_at(),
                    idempotency_key: format!("holdback:{}", gate.gate_id),
                    payload: json!({ "gateId": gate.gate_id }),
                })?;
            } else {
                // A zero-day window releases the holdback immediately.
                self.pay_out_holdback(&gate, &gate.payee_agent_id.clone(), heldback)?;
            }
        }

        gate.released_cents = if hold_outstanding {
            released_to_payee
        } else {
            released_total
        };
        gate.refunded_cents = refunded;
        gate.heldback_cents = if hold_outstanding { heldback } else { 0 };
        gate.settled_at = Some(now);
        gate.state = if released_total == 0 && !hold_outstanding {
            GateState::Refunded
        } else {
            GateState::Settled
        };

        let receipt_status = if hold_outstanding {
            ReceiptStatus::Holdback
        } else if released_total == amount {
            ReceiptStatus::Released
        } else if released_total == 0 {
            ReceiptStatus::Refunded
        } else {
            ReceiptStatus::Partial
        };

        let receipt = build_receipt(
            &record,
            ReceiptInputs {
                status: receipt_status,
                amount_cents: amount,
                released_amount_cents: released_total,
                refunded_amount_cents: refunded,
                release_rate_pct,
                currency: gate.currency.clone(),
                settled_at: now,
                created_at: now,
            },
        )?;

        // Back-fill the hold's receipt binding now that the receipt exists.
        if heldback > 0 {
            if let Some(mut hold) = self.db.get_hold(tenant, &gate.gate_id)? {
                hold.receipt_id = receipt.receipt_id.clone();
                self.db.put_hold(&hold)?;
            }
        }

        // Receipt is content-addressed; any later amendment (dispute flip,
        // arbitration adjustment) recomputes the hash as a new revision.
        debug_assert!(receipt.receipt_hash.is_some());
        if !gate.escrow_conserved() {
            return Err(SettldError::EscrowOverRelease {
                locked_cents: gate.locked_cents,
                asked_cents: gate.released_cents + gate.refunded_cents + gate.heldback_cents,
            });
        }

        self.db.put_gate(&gate)?;
        self.db.push_settlement(
            tenant,
            &gate.run_id,
            &SettlementBundle {
                record: record.clone(),
                receipt: Some(receipt.clone()),
            },
        )?;

        info!(
            gate_id = %gate.gate_id,
            status = receipt_status.as_str(),
            released = released_total,
            refunded,
            heldback,
            "settled gate"
        );

        let outcome = SettlementOutcome {
            gate,
            record,
            receipt: Some(receipt),
        };
        if let Some(key) = params.idempotency_key.as_deref() {
            self.store_idempotent(tenant, &scope, key, &fingerprint, &outcome)?;
        }
        Ok(outcome)
    }

    /// Resolve a gate parked in manual review: an operator picks the release
    /// rate, escrow settles, and a `manual_resolved` decision + receipt pair
    /// is materialized.
    pub fn resolve_manual_review(
        &self,
        tenant: &str,
        gate_id: &str,
        release_rate_pct: i64,
        actor: &ActorRef,
    ) -> Result<SettlementOutcome, SettldError> {
        if actor.actor_type != ActorType::Operator {
            return Err(SettldError::OperatorSignerUnknown {
                key_id: actor.id.clone(),
            });
        }
        if !(0..=PCT_DENOMINATOR).contains(&release_rate_pct) {
            return Err(SettldError::GrantInvalid {
                reason: format!("releaseRatePct out of range: {release_rate_pct}"),
            });
        }
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        if gate.state != GateState::Verified {
            return Err(SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "manual-resolve".to_string(),
            });
        }

        let pending = self
            .db
            .settlements_for_run(tenant, &gate.run_id)?
            .into_iter()
            .next_back()
            .filter(|b| b.receipt.is_none())
            .ok_or_else(|| SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "manual-resolve".to_string(),
            })?;

        let now = self.now();
        let amount = gate.amount_cents;
        let released_total = amount * release_rate_pct / PCT_DENOMINATOR;
        let refunded = amount - released_total;
        self.settle_gate_escrow(&gate, released_total, refunded, 0)?;

        let resolved_event = self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_GATE_MANUALLY_RESOLVED",
            json!({
                "gateId": gate.gate_id,
                "resolvedBy": actor.id,
                "releaseRatePct": release_rate_pct,
                "releasedAmountCents": released_total,
                "refundedAmountCents": refunded,
            }),
        )?;

        let record = build_decision_record(DecisionInputs {
            tenant_id: tenant.to_string(),
            run_id: gate.run_id.clone(),
            settlement_id: format!("stl_{}", &resolved_event.chain_hash[..24]),
            agreement_id: gate.agreement_id.clone(),
            decision_status: DecisionStatus::ManualResolved,
            decision_mode: DecisionMode::Manual,
            decision_reason: Some("manual_review".to_string()),
            verification_status: pending.record.verification_status,
            policy_ref: pending.record.policy_ref.clone(),
            verifier_ref: pending.record.verifier_ref.clone(),
            run_status: pending.record.run_status.clone(),
            run_last_event_id: resolved_event.event_id.clone(),
            run_last_chain_hash: resolved_event.chain_hash.clone(),
            resolution_event_id: resolved_event.event_id.clone(),
            bindings: pending.record.bindings.clone(),
            decided_at: now,
        })?;

        let status = if released_total == amount {
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
                amount_cents: amount,
                released_amount_cents: released_total,
                refunded_amount_cents: refunded,
                release_rate_pct,
                currency: gate.currency.clone(),
                settled_at: now,
                created_at: now,
            },
        )?;
        self.db.push_settlement(
            tenant,
            &gate.run_id,
            &SettlementBundle {
                record: record.clone(),
                receipt: Some(receipt.clone()),
            },
        )?;

        gate.released_cents = released_total;
        gate.refunded_cents = refunded;
        gate.settled_at = Some(now);
        gate.state = if released_total == 0 {
            GateState::Refunded
        } else {
            GateState::Settled
        };
        self.db.put_gate(&gate)?;
        info!(gate_id = %gate_id, release_rate_pct, "manually resolved gate");

        Ok(SettlementOutcome {
            gate,
            record,
            receipt: Some(receipt),
        })
    }

    /// Admin cancel. Allowed only from `created`/`authorized`, and only by an
    /// operator actor; authorized escrow unwinds in full.
    pub fn cancel_gate(
        &self,
        tenant: &str,
        gate_id: &str,
        actor: &ActorRef,
    ) -> Result<X402Gate, SettldError> {
        if actor.actor_type != ActorType::Operator {
            return Err(SettldError::OperatorSignerUnknown {
                key_id: actor.id.clone(),
            });
        }
        let lock = self.locks.acquire(&format!("gate:{tenant}:{gate_id}"));
        let _guard = lock.lock().expect("gate lock");

        let mut gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        if gate.state.cancel_blocked() {
            return Err(SettldError::GateStateInvalid {
                gate_id: gate_id.to_string(),
                state: gate.state.as_str().to_string(),
                op: "cancel".to_string(),
            });
        }
        if gate.state == GateState::Authorized {
            self.unlock_gate_escrow(&gate)?;
            gate.locked_cents = 0;
        }
        gate.state = GateState::Canceled;
        self.db.put_gate(&gate)?;
        self.append_system_event(
            tenant,
            &gate.stream_id(),
            "X402_GATE_CANCELED",
            json!({ "gateId": gate.gate_id, "canceledBy": actor.id }),
        )?;
        info!(gate_id = %gate_id, "canceled gate");
        Ok(gate)
    }

    /// Gateway settlement headers for a gate's current state.
    pub fn gateway_headers(&self, tenant: &str, gate_id: &str) -> Result<GatewayHeaders, SettldError> {
        let gate = self
            .db
            .get_gate(tenant, gate_id)?
            .ok_or_else(|| SettldError::GateNotFound {
                gate_id: gate_id.to_string(),
            })?;
        let latest_receipt = self
            .db
            .settlements_for_run(tenant, &gate.run_id)?
            .into_iter()
            .filter_map(|b| b.receipt)
            .next_back();
        let settlement_status = latest_receipt
            .map(|r| r.status.as_str().to_string())
            .unwrap_or_else(|| gate.state.as_str().to_string());

        let hold = self.db.get_hold(tenant, gate_id)?;
        let (holdback_status, holdback_amount) = match hold {
            Some(h) => {
                let status = match h.status {
                    HoldStatus::Held | HoldStatus::Frozen => "held",
                    HoldStatus::Released | HoldStatus::Refunded => "released",
                };
                (Some(status.to_string()), Some(h.amount_cents))
            }
            None => (None, None),
        };

        Ok(GatewayHeaders {
            gate_id: gate.gate_id,
            settlement_status,
            released_amount_cents: gate.released_cents,
            refunded_amount_cents: gate.refunded_cents,
            holdback_status,
            holdback_amount_cents: holdback_amount,
        })
    }
}
