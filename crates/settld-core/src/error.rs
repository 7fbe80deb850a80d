use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable wire form of every error: `{code, message, details?}`.
///
/// `code` comes from the registry below and never changes across versions;
/// `message` is short and human-readable; `details` is structured and safe for
/// telemetry (no secrets are ever serialized into it).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum SettldError {
    // ── Canonicalization ─────────────────────────────────────────────────────
    #[error("value cannot be canonically encoded: {reason}")]
    ValueNotRepresentable { reason: String },

    #[error("duplicate object key in canonical input: {key}")]
    DuplicateKey { key: String },

    // ── Chained event log ────────────────────────────────────────────────────
    #[error("chain precondition failed on {stream_id}: expected tip {expected}, found {actual}")]
    ChainPreconditionFailed {
        stream_id: String,
        expected: String,
        actual: String,
    },

    #[error("event by actor {actor} requires a signature")]
    EventSignatureRequired { actor: String },

    #[error("event signature invalid")]
    EventSignatureInvalid,

    #[error("idempotency key {key} was already used with a different body")]
    IdempotencyConflict { key: String },

    // ── Operator / signer trust ──────────────────────────────────────────────
    #[error("operator action signer unknown: {key_id}")]
    OperatorSignerUnknown { key_id: String },

    #[error("operator action signer revoked: {key_id}")]
    OperatorSignerRevoked { key_id: String },

    // ── Authority grants ─────────────────────────────────────────────────────
    #[error("authority grant not yet active")]
    GrantNotActive,

    #[error("authority grant expired")]
    GrantExpired,

    #[error("authority grant revoked")]
    GrantRevoked,

    #[error("authority grant scope mismatch on {field}")]
    GrantScopeMismatch { field: String },

    #[error("per-call limit exceeded: limit {limit_cents}, asked {asked_cents}")]
    GrantPerCallExceeded {
        limit_cents: i64,
        asked_cents: i64,
    },

    #[error("cumulative limit exceeded: limit {limit_cents}, spent {spent_cents}, asked {asked_cents}")]
    GrantCumulativeExceeded {
        limit_cents: i64,
        spent_cents: i64,
        asked_cents: i64,
    },

    #[error("grant currency mismatch: grant is {expected}, call is {got}")]
    GrantCurrencyMismatch { expected: String, got: String },

    #[error("authority grant not found: {grant_id}")]
    GrantNotFound { grant_id: String },

    #[error("authority grant rejected at issue time: {reason}")]
    GrantInvalid { reason: String },

    // ── Wallet ───────────────────────────────────────────────────────────────
    #[error("insufficient funds: need {need_cents} cents, have {have_cents}")]
    InsufficientFunds { need_cents: i64, have_cents: i64 },

    #[error("release exceeds escrow: locked {locked_cents}, asked {asked_cents}")]
    EscrowOverRelease {
        locked_cents: i64,
        asked_cents: i64,
    },

    // ── Gate ─────────────────────────────────────────────────────────────────
    #[error("gate policy requires request binding")]
    RequestBindingRequired,

    #[error("request/response binding evidence required")]
    RequestBindingEvidenceRequired,

    #[error("request/response binding evidence does not match the anchored hashes")]
    RequestBindingEvidenceMismatch,

    #[error("gate policy requires an execution intent")]
    ExecutionIntentRequired,

    #[error("execution intent idempotency key does not match the gate's")]
    ExecutionIntentIdempotencyMismatch,

    #[error("execution intent conflicts with previously bound evidence")]
    ExecutionIntentConflict,

    #[error("wallet issuer policy requires a decision token")]
    WalletIssuerDecisionRequired,

    #[error("wallet issuer decision token invalid: {reason}")]
    WalletIssuerDecisionInvalid { reason: String },

    #[error("agent not active: {agent_id}")]
    AgentNotActive { agent_id: String },

    #[error("provider signature invalid")]
    ProviderSignatureInvalid,

    #[error("gate not found: {gate_id}")]
    GateNotFound { gate_id: String },

    #[error("gate {gate_id} in state {state} does not accept {op}")]
    GateStateInvalid {
        gate_id: String,
        state: String,
        op: String,
    },

    #[error("payment token invalid: {reason}")]
    PaymentTokenInvalid { reason: String },

    #[error("payment token expired")]
    PaymentTokenExpired,

    #[error("keyset cache stale beyond maxAgeSec")]
    KeysetStale,

    // ── Settlement kernel ────────────────────────────────────────────────────
    #[error("decision hash does not recompute")]
    DecisionHashMismatch,

    #[error("receipt hash does not recompute")]
    ReceiptHashMismatch,

    #[error("receipt decisionRef hash does not match the decision record")]
    ReceiptDecisionHashMismatch,

    #[error("receipt createdAt precedes decision decidedAt")]
    ReceiptBeforeDecision,

    #[error("receipt settledAt precedes decision decidedAt")]
    ReceiptSettledBeforeDecision,

    #[error("receipt settledAt precedes receipt createdAt")]
    ReceiptSettledBeforeCreated,

    #[error("receipt runStatus does not match the decision record")]
    ReceiptRunStatusMismatch,

    #[error("receipt resolutionEventId does not match the decision record")]
    ReceiptResolutionEventMismatch,

    #[error("bindings disagree between decision and receipt on {field}")]
    BindingsMismatch { field: String },

    // ── Dispute / arbitration ────────────────────────────────────────────────
    #[error("dispute window closed at {closed_at}")]
    DisputeWindowClosed { closed_at: String },

    #[error("verdict signer does not match the arbiter's registered key")]
    DisputeInvalidSigner,

    #[error("verdict outcome must be binary for this case")]
    VerdictNotBinary,

    #[error("dispute open requires binding evidence")]
    DisputeOpenBindingEvidenceRequired,

    #[error("dispute open binding evidence does not match the gate's anchors")]
    DisputeOpenBindingEvidenceMismatch,

    #[error("arbitration open requires binding evidence")]
    ArbitrationOpenBindingEvidenceRequired,

    #[error("arbitration open binding evidence does not match the gate's anchors")]
    ArbitrationOpenBindingEvidenceMismatch,

    #[error("arbitration verdict requires binding evidence")]
    ArbitrationVerdictBindingEvidenceRequired,

    #[error("arbitration verdict binding evidence does not match the gate's anchors")]
    ArbitrationVerdictBindingEvidenceMismatch,

    #[error("dispute not found: {dispute_id}")]
    DisputeNotFound { dispute_id: String },

    #[error("arbitration case not found: {case_id}")]
    CaseNotFound { case_id: String },

    #[error("arbitration case {case_id} in status {status} does not accept {op}")]
    CaseStateInvalid {
        case_id: String,
        status: String,
        op: String,
    },

    // ── Funding holds ────────────────────────────────────────────────────────
    #[error("funding hold not found for gate {gate_id}")]
    HoldNotFound { gate_id: String },

    #[error("funding hold for gate {gate_id} is {status}, not open")]
    HoldStateInvalid { gate_id: String, status: String },

    // ── Emergency controls ───────────────────────────────────────────────────
    #[error("emergency kill switch active for tenant {tenant_id}")]
    KillSwitchActive { tenant_id: String },

    #[error("emergency pause active for scope {scope}")]
    PauseActive { scope: String },

    #[error("emergency quarantine active for scope {scope}")]
    QuarantineActive { scope: String },

    // ── Signer capability ────────────────────────────────────────────────────
    #[error("signer authentication missing")]
    SignerAuthMissing,

    #[error("signer returned a bad response: {reason}")]
    SignerBadResponse { reason: String },

    #[error("signer plugin failed to load: {reason}")]
    SignerPluginLoadFailed { reason: String },

    #[error("remote signer key mismatch: expected {expected}, got {got}")]
    RemoteSignerKeyMismatch { expected: String, got: String },

    // ── Trust roots (offline verification) ───────────────────────────────────
    #[error("governance policy signerKeyId not trusted: {key_id}")]
    TrustRootUntrusted { key_id: String },

    // ── Agents / tenancy ─────────────────────────────────────────────────────
    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("agent key material is immutable once set")]
    AgentKeyImmutable,

    #[error("entity belongs to a different tenant")]
    TenantMismatch,

    // ── Configuration ────────────────────────────────────────────────────────
    #[error("configuration invalid: {reason}")]
    Config { reason: String },

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {reason}")]
    Crypto { reason: String },
}

impl SettldError {
    /// The stable registry code for this error. Codes are part of the public
    /// contract and never change across versions.
    pub fn code(&self) -> &'static str {
        use SettldError::*;
        match self {
            ValueNotRepresentable { .. } => "CANONICAL_VALUE_NOT_REPRESENTABLE",
            DuplicateKey { .. } => "CANONICAL_DUPLICATE_KEY",

            ChainPreconditionFailed { .. } => "CHAIN_PRECONDITION_FAILED",
            EventSignatureRequired { .. } => "EVENT_SIGNATURE_REQUIRED",
            EventSignatureInvalid => "EVENT_SIGNATURE_INVALID",
            IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",

            OperatorSignerUnknown { .. } => "OPERATOR_ACTION_SIGNER_UNKNOWN",
            OperatorSignerRevoked { .. } => "OPERATOR_ACTION_SIGNER_REVOKED",

            GrantNotActive => "X402_AUTHORITY_GRANT_NOT_ACTIVE",
            GrantExpired => "X402_AUTHORITY_GRANT_EXPIRED",
            GrantRevoked => "X402_AUTHORITY_GRANT_REVOKED",
            GrantScopeMismatch { .. } => "X402_AUTHORITY_GRANT_SCOPE_MISMATCH",
            GrantPerCallExceeded { .. } => "X402_AUTHORITY_GRANT_PER_CALL_EXCEEDED",
            GrantCumulativeExceeded { .. } => "X402_AUTHORITY_GRANT_CUMULATIVE_EXCEEDED",
            GrantCurrencyMismatch { .. } => "X402_AUTHORITY_GRANT_CURRENCY_MISMATCH",
            GrantNotFound { .. } => "X402_AUTHORITY_GRANT_NOT_FOUND",
            GrantInvalid { .. } => "X402_AUTHORITY_GRANT_INVALID",

            InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            EscrowOverRelease { .. } => "ESCROW_OVER_RELEASE",

            RequestBindingRequired => "X402_REQUEST_BINDING_REQUIRED",
            RequestBindingEvidenceRequired => "X402_REQUEST_BINDING_EVIDENCE_REQUIRED",
            RequestBindingEvidenceMismatch => "X402_REQUEST_BINDING_EVIDENCE_MISMATCH",
            ExecutionIntentRequired => "X402_EXECUTION_INTENT_REQUIRED",
            ExecutionIntentIdempotencyMismatch => "X402_EXECUTION_INTENT_IDEMPOTENCY_MISMATCH",
            ExecutionIntentConflict => "X402_EXECUTION_INTENT_CONFLICT",
            WalletIssuerDecisionRequired => "X402_WALLET_ISSUER_DECISION_REQUIRED",
            WalletIssuerDecisionInvalid { .. } => "X402_WALLET_ISSUER_DECISION_INVALID",
            AgentNotActive { .. } => "X402_AGENT_NOT_ACTIVE",
            ProviderSignatureInvalid => "TOOL_PROVIDER_SIGNATURE_INVALID",
            GateNotFound { .. } => "X402_GATE_NOT_FOUND",
            GateStateInvalid { .. } => "X402_GATE_STATE_INVALID",
            PaymentTokenInvalid { .. } => "X402_PAYMENT_TOKEN_INVALID",
            PaymentTokenExpired => "X402_PAYMENT_TOKEN_EXPIRED",
            KeysetStale => "X402_KEYSET_STALE",

            DecisionHashMismatch => "SETTLEMENT_DECISION_HASH_MISMATCH",
            ReceiptHashMismatch => "SETTLEMENT_RECEIPT_HASH_MISMATCH",
            ReceiptDecisionHashMismatch => "SETTLEMENT_RECEIPT_DECISION_HASH_MISMATCH",
            ReceiptBeforeDecision => "SETTLEMENT_RECEIPT_BEFORE_DECISION",
            ReceiptSettledBeforeDecision => "SETTLEMENT_RECEIPT_SETTLED_BEFORE_DECISION",
            ReceiptSettledBeforeCreated => "SETTLEMENT_RECEIPT_SETTLED_BEFORE_CREATED",
            ReceiptRunStatusMismatch => "SETTLEMENT_RECEIPT_RUN_STATUS_MISMATCH",
            ReceiptResolutionEventMismatch => "SETTLEMENT_RECEIPT_RESOLUTION_EVENT_MISMATCH",
            BindingsMismatch { .. } => "SETTLEMENT_BINDINGS_MISMATCH",

            DisputeWindowClosed { .. } => "DISPUTE_WINDOW_CLOSED",
            DisputeInvalidSigner => "DISPUTE_INVALID_SIGNER",
            VerdictNotBinary => "TOOL_CALL_VERDICT_NOT_BINARY",
            DisputeOpenBindingEvidenceRequired => "X402_DISPUTE_OPEN_BINDING_EVIDENCE_REQUIRED",
            DisputeOpenBindingEvidenceMismatch => "X402_DISPUTE_OPEN_BINDING_EVIDENCE_MISMATCH",
            ArbitrationOpenBindingEvidenceRequired => {
                "X402_ARBITRATION_OPEN_BINDING_EVIDENCE_REQUIRED"
            }
            ArbitrationOpenBindingEvidenceMismatch => {
                "X402_ARBITRATION_OPEN_BINDING_EVIDENCE_MISMATCH"
            }
            ArbitrationVerdictBindingEvidenceRequired => {
                "X402_ARBITRATION_VERDICT_BINDING_EVIDENCE_REQUIRED"
            }
            ArbitrationVerdictBindingEvidenceMismatch => {
                "X402_ARBITRATION_VERDICT_BINDING_EVIDENCE_MISMATCH"
            }
            DisputeNotFound { .. } => "X402_DISPUTE_NOT_FOUND",
            CaseNotFound { .. } => "X402_ARBITRATION_CASE_NOT_FOUND",
            CaseStateInvalid { .. } => "X402_ARBITRATION_CASE_STATE_INVALID",

            HoldNotFound { .. } => "FUNDING_HOLD_NOT_FOUND",
            HoldStateInvalid { .. } => "FUNDING_HOLD_STATE_INVALID",

            KillSwitchActive { .. } => "EMERGENCY_KILL_SWITCH_ACTIVE",
            PauseActive { .. } => "EMERGENCY_PAUSE_ACTIVE",
            QuarantineActive { .. } => "EMERGENCY_QUARANTINE_ACTIVE",

            SignerAuthMissing => "SIGNER_AUTH_MISSING",
            SignerBadResponse { .. } => "SIGNER_BAD_RESPONSE",
            SignerPluginLoadFailed { .. } => "SIGNER_PLUGIN_LOAD_FAILED",
            RemoteSignerKeyMismatch { .. } => "REMOTE_SIGNER_KEY_MISMATCH",

            TrustRootUntrusted { .. } => "TRUST_ROOT_UNTRUSTED",

            AgentNotFound { .. } => "AGENT_NOT_FOUND",
            AgentKeyImmutable => "AGENT_KEY_IMMUTABLE",
            TenantMismatch => "TENANT_MISMATCH",

            Config { .. } => "CONFIG_INVALID",

            Serialization(_) => "SERIALIZATION_FAILURE",
            Storage(_) => "STORAGE_FAILURE",
            Crypto { .. } => "CRYPTO_FAILURE",
        }
    }

    /// Build the `{code, message, details}` wire form.
    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        use serde_json::json;
        use SettldError::*;
        match self {
            ChainPreconditionFailed {
                stream_id,
                expected,
                actual,
            } => Some(json!({
                "streamId": stream_id,
                "expectedPrevChainHash": expected,
                "actualPrevChainHash": actual,
            })),
            GrantPerCallExceeded {
                limit_cents,
                asked_cents,
            } => Some(json!({ "limitCents": limit_cents, "askedCents": asked_cents })),
            GrantCumulativeExceeded {
                limit_cents,
                spent_cents,
                asked_cents,
            } => Some(json!({
                "limitCents": limit_cents,
                "spentCents": spent_cents,
                "askedCents": asked_cents,
            })),
            InsufficientFunds {
                need_cents,
                have_cents,
            } => Some(json!({ "needCents": need_cents, "haveCents": have_cents })),
            GateStateInvalid {
                gate_id,
                state,
                op,
            } => Some(json!({ "gateId": gate_id, "state": state, "operation": op })),
            DisputeWindowClosed { closed_at } => Some(json!({ "closedAt": closed_at })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_for_contract_errors() {
        assert_eq!(
            SettldError::GrantRevoked.code(),
            "X402_AUTHORITY_GRANT_REVOKED"
        );
        assert_eq!(
            SettldError::RequestBindingEvidenceMismatch.code(),
            "X402_REQUEST_BINDING_EVIDENCE_MISMATCH"
        );
        assert_eq!(
            SettldError::ReceiptSettledBeforeCreated.code(),
            "SETTLEMENT_RECEIPT_SETTLED_BEFORE_CREATED"
        );
    }

    #[test]
    fn wire_form_carries_structured_details_without_secrets() {
        let e = SettldError::InsufficientFunds {
            need_cents: 1000,
            have_cents: 250,
        };
        let w = e.to_wire();
        assert_eq!(w.code, "INSUFFICIENT_FUNDS");
        let d = w.details.unwrap();
        assert_eq!(d["needCents"], 1000);
        assert_eq!(d["haveCents"], 250);
    }
}
