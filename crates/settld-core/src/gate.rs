use serde::{Deserialize, Serialize};

use crate::types::{
    AgentId, AgreementId, BasisPoints, Cents, GateId, GrantId, HashHex, IsoMillis, RunId, TenantId,
};

// ── Gate state ────────────────────────────────────────────────────────────────

/// Lifecycle of one paid call.
///
/// ```text
/// created → authorized → verified → { settled | refunded } →
///                                     disputed → arbitrating → { settled' | refunded' }
///                         any → canceled  (admin only, not from verified/disputed/arbitrating)
/// ```
///
/// `verified` is held only while a manual review is pending (autoRelease off);
/// auto-released gates pass through it within the same transition.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Created,
    Authorized,
    Verified,
    Disputed,
    Arbitrating,
    Settled,
    Refunded,
    Canceled,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GateState::Settled | GateState::Refunded | GateState::Canceled
        )
    }

    /// States from which an admin cancel is forbidden.
    pub fn cancel_blocked(&self) -> bool {
        matches!(
            self,
            GateState::Verified | GateState::Disputed | GateState::Arbitrating
        ) || self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Created => "created",
            GateState::Authorized => "authorized",
            GateState::Verified => "verified",
            GateState::Disputed => "disputed",
            GateState::Arbitrating => "arbitrating",
            GateState::Settled => "settled",
            GateState::Refunded => "refunded",
            GateState::Canceled => "canceled",
        }
    }
}

// ── Verification ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Green,
    Amber,
    Red,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Green => "green",
            VerificationStatus::Amber => "amber",
            VerificationStatus::Red => "red",
        }
    }
}

/// Whether the provider's response signature is demanded, tolerated, or
/// ignored by the gate policy. `Required` is fail-closed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSignaturePolicy {
    Required,
    #[default]
    Optional,
    Off,
}

/// Verification rules attached to a gate at creation.
///
/// `dispute_window_days` has no default anywhere in the system: the value is
/// explicitly provided per gate so it can never leak into a hash unnoticed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatePolicy {
    pub auto_release: bool,
    pub green_release_rate_pct: i64,
    pub amber_release_rate_pct: i64,
    pub red_release_rate_pct: i64,
    #[serde(default)]
    pub provider_signature: ProviderSignaturePolicy,
    #[serde(default)]
    pub request_binding_required: bool,
    #[serde(default)]
    pub execution_intent_required: bool,
    #[serde(default)]
    pub wallet_issuer_decision_required: bool,
}

impl GatePolicy {
    pub fn release_rate_for(&self, status: VerificationStatus) -> i64 {
        if !self.auto_release {
            return 0;
        }
        match status {
            VerificationStatus::Green => self.green_release_rate_pct,
            VerificationStatus::Amber => self.amber_release_rate_pct,
            VerificationStatus::Red => self.red_release_rate_pct,
        }
    }
}

// ── Execution intent ──────────────────────────────────────────────────────────

/// Request-binding evidence supplied at authorize time: the SHA-256 of the
/// HTTP request the payer plans to execute, keyed by the gate's idempotency
/// key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionIntent {
    pub idempotency_key: String,
    pub request_sha256: String,
}

// ── Provider response anchor ──────────────────────────────────────────────────

/// What the provider signed over its response; anchored on the gate when the
/// signed response is first observed and compared against verify-time
/// evidence.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponseAnchor {
    pub response_sha256: String,
    pub nonce: String,
    pub signed_at: IsoMillis,
    pub provider_key_id: String,
    /// base64 Ed25519 signature over sha256(canonical({responseHash, nonce, signedAt})).
    pub signature: String,
}

// ── X402Gate ──────────────────────────────────────────────────────────────────

/// Payment gate mediating one paid call from challenge to settlement.
///
/// Escrow accounting lives on the gate (`locked/released/refunded/heldback`)
/// so the conservation invariant can be checked on every transition:
/// released + refunded + heldback ≤ locked, with equality at terminal state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402Gate {
    pub tenant_id: TenantId,
    pub gate_id: GateId,
    pub run_id: RunId,
    pub agreement_id: AgreementId,
    pub payer_agent_id: AgentId,
    pub payee_agent_id: AgentId,
    pub amount_cents: Cents,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_grant_ref: Option<GrantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_passport: Option<String>,
    /// SHA-256 of the challenge token's canonical claims; carried into the
    /// settlement bindings block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_token_hash: Option<HashHex>,
    pub holdback_bps: BasisPoints,
    pub dispute_window_days: i64,
    pub policy: GatePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_intent: Option<ExecutionIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_response: Option<ProviderResponseAnchor>,
    pub state: GateState,
    pub created_at: IsoMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<IsoMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<IsoMillis>,

    // ── Escrow accounting ────────────────────────────────────────────────────
    pub locked_cents: Cents,
    pub released_cents: Cents,
    pub refunded_cents: Cents,
    pub heldback_cents: Cents,
}

impl X402Gate {
    /// Conservation check: funds leaving escrow never exceed funds locked.
    pub fn escrow_conserved(&self) -> bool {
        self.released_cents + self.refunded_cents + self.heldback_cents <= self.locked_cents
    }

    /// Stream carrying this gate's chained events.
    pub fn stream_id(&self) -> String {
        format!("x402:{}", self.gate_id)
    }
}
