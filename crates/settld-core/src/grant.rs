use serde::{Deserialize, Serialize};

use crate::types::{AgentId, Cents, GrantId, IsoMillis, TenantId};

// ── Scope / envelope ──────────────────────────────────────────────────────────

/// What the grantee may call under this grant. Empty vectors mean
/// "unrestricted" for that dimension.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantScope {
    #[serde(default)]
    pub allowed_provider_ids: Vec<String>,
    #[serde(default)]
    pub allowed_tool_ids: Vec<String>,
    #[serde(default)]
    pub allowed_risk_classes: Vec<String>,
    pub side_effecting_allowed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpendEnvelope {
    pub currency: String,
    pub max_per_call_cents: Cents,
    pub max_total_cents: Cents,
}

/// Position of this grant in a delegation chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChainBinding {
    pub depth: u32,
    pub max_delegation_depth: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantValidity {
    pub issued_at: IsoMillis,
    pub not_before: IsoMillis,
    pub expires_at: IsoMillis,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantRevocation {
    pub revoked_at: IsoMillis,
    pub revocation_reason_code: String,
}

// ── AuthorityGrant ────────────────────────────────────────────────────────────

/// A revocable, time-bounded, policy-scoped spend capability from a principal
/// to a grantee. Immutable except for `revocation` (one-way transition).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorityGrant {
    pub tenant_id: TenantId,
    pub grant_id: GrantId,
    /// The principal on whose behalf the grantee spends (agent or owner ref).
    pub principal_ref: String,
    pub grantee_agent_id: AgentId,
    pub scope: GrantScope,
    pub spend_envelope: SpendEnvelope,
    pub chain_binding: ChainBinding,
    pub validity: GrantValidity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation: Option<GrantRevocation>,
}

/// Runtime status, computed against a clock — never stored.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrantRuntimeStatus {
    NotActive,
    Valid,
    Expired,
    Revoked,
}

impl AuthorityGrant {
    pub fn runtime_status(&self, now: IsoMillis) -> GrantRuntimeStatus {
        if self.revocation.is_some() {
            return GrantRuntimeStatus::Revoked;
        }
        if now < self.validity.not_before {
            return GrantRuntimeStatus::NotActive;
        }
        if now > self.validity.expires_at {
            return GrantRuntimeStatus::Expired;
        }
        GrantRuntimeStatus::Valid
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }
}

// ── GrantCall ─────────────────────────────────────────────────────────────────

/// The call being evaluated against a grant at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCall {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub amount_cents: Cents,
    pub currency: String,
    pub at: IsoMillis,
    #[serde(default)]
    pub risk_classes: Vec<String>,
    pub side_effecting: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IsoMillis;

    fn t(s: &str) -> IsoMillis {
        IsoMillis::parse(s).unwrap()
    }

    fn grant(not_before: &str, expires_at: &str) -> AuthorityGrant {
        AuthorityGrant {
            tenant_id: "tn_test".into(),
            grant_id: "grant_1".into(),
            principal_ref: "agent_principal".into(),
            grantee_agent_id: "agent_grantee".into(),
            scope: GrantScope {
                side_effecting_allowed: true,
                ..GrantScope::default()
            },
            spend_envelope: SpendEnvelope {
                currency: "USD".into(),
                max_per_call_cents: 1_000,
                max_total_cents: 10_000,
            },
            chain_binding: ChainBinding {
                depth: 0,
                max_delegation_depth: 2,
            },
            validity: GrantValidity {
                issued_at: t("2026-01-01T00:00:00.000Z"),
                not_before: t(not_before),
                expires_at: t(expires_at),
            },
            revocation: None,
        }
    }

    #[test]
    fn runtime_status_follows_the_window() {
        let g = grant("2026-02-01T00:00:00.000Z", "2026-03-01T00:00:00.000Z");
        assert_eq!(
            g.runtime_status(t("2026-01-15T00:00:00.000Z")),
            GrantRuntimeStatus::NotActive
        );
        assert_eq!(
            g.runtime_status(t("2026-02-15T00:00:00.000Z")),
            GrantRuntimeStatus::Valid
        );
        assert_eq!(
            g.runtime_status(t("2026-04-01T00:00:00.000Z")),
            GrantRuntimeStatus::Expired
        );
    }

    #[test]
    fn revocation_dominates_the_window() {
        let mut g = grant("2026-02-01T00:00:00.000Z", "2026-03-01T00:00:00.000Z");
        g.revocation = Some(GrantRevocation {
            revoked_at: t("2026-02-10T00:00:00.000Z"),
            revocation_reason_code: "principal_request".into(),
        });
        assert_eq!(
            g.runtime_status(t("2026-02-15T00:00:00.000Z")),
            GrantRuntimeStatus::Revoked
        );
    }
}
