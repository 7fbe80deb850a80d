use serde::{Deserialize, Serialize};

use crate::gate::VerificationStatus;
use crate::types::{AgreementId, Cents, EventId, HashHex, IsoMillis, RunId, TenantId};

// ── Decision record ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    AutoResolved,
    ManualReviewRequired,
    ManualResolved,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    Automatic,
    Manual,
}

/// Which policy text and verification method the decision was replayed from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    pub policy_hash: HashHex,
    pub verification_method_hash: HashHex,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifierRef {
    pub verifier_id: String,
    pub verifier_version: String,
    pub verifier_hash: HashHex,
    pub modality: String,
}

/// Cross-referenced authorization/binding evidence. When present on both the
/// decision record and its receipt, every field must agree.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bindings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_token_hash: Option<HashHex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_sha256: Option<HashHex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_sha256: Option<HashHex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_signature_key_id: Option<String>,
}

/// Policy-replayable settlement decision (v2).
///
/// `decision_hash` is SHA-256 of the canonical record with the field set to
/// null; `run_last_event_id`/`run_last_chain_hash` pin the exact event-log
/// prefix the decision was computed over.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementDecisionRecord {
    pub tenant_id: TenantId,
    pub decision_id: String,
    pub run_id: RunId,
    pub settlement_id: String,
    pub agreement_id: AgreementId,
    pub decision_status: DecisionStatus,
    pub decision_mode: DecisionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    pub verification_status: VerificationStatus,
    pub policy_ref: PolicyRef,
    pub verifier_ref: VerifierRef,
    pub run_status: String,
    pub run_last_event_id: EventId,
    pub run_last_chain_hash: HashHex,
    pub resolution_event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Bindings>,
    pub decided_at: IsoMillis,
    /// null while hashing; set to the computed digest afterwards.
    pub decision_hash: Option<HashHex>,
}

// ── Receipt ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Released,
    Refunded,
    Partial,
    Holdback,
    Disputed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Released => "released",
            ReceiptStatus::Refunded => "refunded",
            ReceiptStatus::Partial => "partial",
            ReceiptStatus::Holdback => "holdback",
            ReceiptStatus::Disputed => "disputed",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRef {
    pub decision_id: String,
    pub decision_hash: HashHex,
}

/// Payout record (v1). Never valid without the decision record it references.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub tenant_id: TenantId,
    pub receipt_id: String,
    pub decision_ref: DecisionRef,
    pub status: ReceiptStatus,
    pub amount_cents: Cents,
    pub released_amount_cents: Cents,
    pub refunded_amount_cents: Cents,
    pub release_rate_pct: i64,
    pub currency: String,
    pub run_status: String,
    pub resolution_event_id: EventId,
    pub settled_at: IsoMillis,
    pub created_at: IsoMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Bindings>,
    /// null while hashing; set to the computed digest afterwards.
    pub receipt_hash: Option<HashHex>,
}

// ── Agreement delegation ──────────────────────────────────────────────────────

/// Parent→child agreement link with a budget cap; the rows form the tree the
/// cascade-settlement and refund-unwind traversals walk.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgreementDelegation {
    pub tenant_id: TenantId,
    pub parent_agreement_hash: HashHex,
    pub child_agreement_hash: HashHex,
    pub budget_cap_cents: Cents,
    pub delegation_depth: u32,
    /// Root-first chain of ancestor agreement hashes (excludes the child).
    pub ancestor_chain: Vec<HashHex>,
}

// ── Funding hold ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HoldStatus {
    Held,
    Frozen,
    Released,
    Refunded,
}

impl HoldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Held => "held",
            HoldStatus::Frozen => "frozen",
            HoldStatus::Released => "released",
            HoldStatus::Refunded => "refunded",
        }
    }
}

/// Deferred-release state for holdback funds. The challenge window starts at
/// the receipt's `settledAt`; a dispute freezes the hold until arbitration
/// resolves it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingHold {
    pub tenant_id: TenantId,
    pub gate_id: String,
    pub agreement_hash: HashHex,
    pub receipt_id: String,
    pub amount_cents: Cents,
    pub currency: String,
    pub challenge_window_ms: i64,
    pub held_since: IsoMillis,
    pub status: HoldStatus,
}

impl FundingHold {
    /// When the challenge window closes and the hold may auto-release.
    pub fn releasable_at(&self) -> IsoMillis {
        IsoMillis(self.held_since.0 + chrono::Duration::milliseconds(self.challenge_window_ms))
    }
}
