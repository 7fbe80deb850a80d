use serde::{Deserialize, Serialize};

use crate::types::{AgentId, CaseId, DisputeId, EventId, GateId, HashHex, IsoMillis, RunId, TenantId};

// ── Dispute ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Escalated,
    Closed,
}

/// A window-gated challenge to an already-settled receipt. Opening flips the
/// receipt from `released` to `disputed` and freezes any holdback fund.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispute {
    pub tenant_id: TenantId,
    pub dispute_id: DisputeId,
    pub gate_id: GateId,
    pub run_id: RunId,
    pub receipt_id: String,
    pub opened_by_agent_id: AgentId,
    pub reason: String,
    pub evidence_refs: Vec<String>,
    pub status: DisputeStatus,
    pub opened_at: IsoMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<IsoMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_event_id: Option<EventId>,
}

// ── Arbitration ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    UnderReview,
    VerdictIssued,
    Closed,
    Appealed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::UnderReview => "under_review",
            CaseStatus::VerdictIssued => "verdict_issued",
            CaseStatus::Closed => "closed",
            CaseStatus::Appealed => "appealed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerdictOutcome {
    Accepted,
    Rejected,
    Partial,
}

/// Canonical verdict envelope. Its hash (canonical, with no hash field — the
/// envelope is hashed whole) must be signed by a key matching the arbiter's
/// registered keyId at `issuedAt`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub verdict_id: String,
    pub case_id: CaseId,
    pub arbiter_agent_id: AgentId,
    pub outcome: VerdictOutcome,
    pub release_rate_pct: i64,
    pub rationale: String,
    pub evidence_refs: Vec<String>,
    pub issued_at: IsoMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrationCase {
    pub tenant_id: TenantId,
    pub case_id: CaseId,
    pub run_id: RunId,
    pub dispute_id: DisputeId,
    pub gate_id: GateId,
    pub arbiter_agent_id: AgentId,
    pub opened_by_agent_id: AgentId,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict_hash: Option<HashHex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict_signature: Option<String>,
    pub evidence_refs: Vec<String>,
    /// If this case policy demands a binary verdict, `partial` is rejected.
    #[serde(default)]
    pub binary_verdict_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appeal_ref: Option<CaseId>,
    /// Lineage copied from the appealed case when this case is an appeal.
    #[serde(default)]
    pub related: Vec<CaseId>,
    pub opened_at: IsoMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<IsoMillis>,
}
