use settld_core::{
    AuthorityGrant, Cents, GrantCall, GrantRevocation, GrantRuntimeStatus, SettldError,
};
use tracing::info;

use crate::engine::StateEngine;

/// Pure runtime evaluation of a call against a grant and its cumulative
/// spend. Denial order: lifecycle, scope, currency, per-call, cumulative —
/// when several conditions fail at once, the earliest check's code wins.
pub fn evaluate_grant_call(
    grant: &AuthorityGrant,
    spent_cents: Cents,
    call: &GrantCall,
) -> Result<(), SettldError> {
    match grant.runtime_status(call.at) {
        GrantRuntimeStatus::NotActive => return Err(SettldError::GrantNotActive),
        GrantRuntimeStatus::Expired => return Err(SettldError::GrantExpired),
        GrantRuntimeStatus::Revoked => return Err(SettldError::GrantRevoked),
        GrantRuntimeStatus::Valid => {}
    }

    let scope = &grant.scope;
    if !scope.allowed_provider_ids.is_empty()
        && !scope.allowed_provider_ids.contains(&call.provider_id)
    {
        return Err(SettldError::GrantScopeMismatch {
            field: "providerId".to_string(),
        });
    }
    if !scope.allowed_tool_ids.is_empty() {
        match &call.tool_id {
            Some(tool) if scope.allowed_tool_ids.contains(tool) => {}
            _ => {
                return Err(SettldError::GrantScopeMismatch {
                    field: "toolId".to_string(),
                })
            }
        }
    }
    if !scope.allowed_risk_classes.is_empty()
        && !call
            .risk_classes
            .iter()
            .all(|rc| scope.allowed_risk_classes.contains(rc))
    {
        return Err(SettldError::GrantScopeMismatch {
            field: "riskClasses".to_string(),
        });
    }
    if call.side_effecting && !scope.side_effecting_allowed {
        return Err(SettldError::GrantScopeMismatch {
            field: "sideEffecting".to_string(),
        });
    }

    let envelope = &grant.spend_envelope;
    if call.currency != envelope.currency {
        return Err(SettldError::GrantCurrencyMismatch {
            expected: envelope.currency.clone(),
            got: call.currency.clone(),
        });
    }
    if call.amount_cents > envelope.max_per_call_cents {
        return Err(SettldError::GrantPerCallExceeded {
            limit_cents: envelope.max_per_call_cents,
            asked_cents: call.amount_cents,
        });
    }
    if spent_cents + call.amount_cents > envelope.max_total_cents {
        return Err(SettldError::GrantCumulativeExceeded {
            limit_cents: envelope.max_total_cents,
            spent_cents,
            asked_cents: call.amount_cents,
        });
    }
    Ok(())
}

impl StateEngine {
    /// Issue a grant. Validates the validity window, non-negative limits and
    /// delegation depth before storing; grants are immutable after issue
    /// except for the one-way revocation field.
    pub fn issue_grant(&self, grant: AuthorityGrant) -> Result<AuthorityGrant, SettldError> {
        if grant.validity.not_before >= grant.validity.expires_at {
            return Err(SettldError::GrantInvalid {
                reason: "notBefore must precede expiresAt".to_string(),
            });
        }
        if grant.spend_envelope.max_per_call_cents < 0 || grant.spend_envelope.max_total_cents < 0
        {
            return Err(SettldError::GrantInvalid {
                reason: "spend limits must be non-negative".to_string(),
            });
        }
        if grant.spend_envelope.max_per_call_cents > grant.spend_envelope.max_total_cents {
            return Err(SettldError::GrantInvalid {
                reason: "maxPerCallCents exceeds maxTotalCents".to_string(),
            });
        }
        if grant.chain_binding.depth > grant.chain_binding.max_delegation_depth {
            return Err(SettldError::GrantInvalid {
                reason: "delegation depth exceeds maxDelegationDepth".to_string(),
            });
        }
        if grant.revocation.is_some() {
            return Err(SettldError::GrantInvalid {
                reason: "cannot issue a pre-revoked grant".to_string(),
            });
        }
        self.require_agent(&grant.tenant_id, &grant.grantee_agent_id)?;

        let lock = self
            .locks
            .acquire(&format!("grant:{}:{}", grant.tenant_id, grant.grant_id));
        let _guard = lock.lock().expect("grant lock");
        if self.db.get_grant(&grant.tenant_id, &grant.grant_id)?.is_some() {
            return Err(SettldError::GrantInvalid {
                reason: format!("grant {} already exists", grant.grant_id),
            });
        }
        self.db.put_grant(&grant)?;
        info!(grant_id = %grant.grant_id, grantee = %grant.grantee_agent_id, "issued grant");
        Ok(grant)
    }

    /// One-way revocation. Re-revoking keeps the first revocation record.
    pub fn revoke_grant(
        &self,
        tenant: &str,
        grant_id: &str,
        reason_code: &str,
    ) -> Result<AuthorityGrant, SettldError> {
        let lock = self.locks.acquire(&format!("grant:{tenant}:{grant_id}"));
        let _guard = lock.lock().expect("grant lock");

        let mut grant =
            self.db
                .get_grant(tenant, grant_id)?
                .ok_or_else(|| SettldError::GrantNotFound {
                    grant_id: grant_id.to_string(),
                })?;
        if grant.revocation.is_none() {
            grant.revocation = Some(GrantRevocation {
                revoked_at: self.now(),
                revocation_reason_code: reason_code.to_string(),
            });
            self.db.put_grant(&grant)?;
            info!(grant_id = %grant_id, reason = %reason_code, "revoked grant");
        }
        Ok(grant)
    }

    /// Runtime evaluation of a call against a stored grant.
    pub fn evaluate_grant(
        &self,
        tenant: &str,
        grant_id: &str,
        call: &GrantCall,
    ) -> Result<(), SettldError> {
        let grant =
            self.db
                .get_grant(tenant, grant_id)?
                .ok_or_else(|| SettldError::GrantNotFound {
                    grant_id: grant_id.to_string(),
                })?;
        let spent = self.db.get_grant_spend(tenant, grant_id)?;
        evaluate_grant_call(&grant, spent, call)
    }

    /// Record spend against a grant's cumulative envelope (called when a
    /// gate the grant authorized locks funds).
    pub(crate) fn record_grant_spend(
        &self,
        tenant: &str,
        grant_id: &str,
        amount_cents: Cents,
    ) -> Result<(), SettldError> {
        let spent = self.db.get_grant_spend(tenant, grant_id)?;
        self.db.put_grant_spend(tenant, grant_id, spent + amount_cents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settld_core::{ChainBinding, GrantScope, GrantValidity, IsoMillis, SpendEnvelope};

    fn t(s: &str) -> IsoMillis {
        IsoMillis::parse(s).unwrap()
    }

    fn grant() -> AuthorityGrant {
        AuthorityGrant {
            tenant_id: "tn".into(),
            grant_id: "grant_1".into(),
            principal_ref: "agent_owner".into(),
            grantee_agent_id: "agent_spender".into(),
            scope: GrantScope {
                allowed_provider_ids: vec!["prov_tools".into()],
                allowed_tool_ids: vec![],
                allowed_risk_classes: vec!["low".into()],
                side_effecting_allowed: false,
            },
            spend_envelope: SpendEnvelope {
                currency: "USD".into(),
                max_per_call_cents: 1_000,
                max_total_cents: 2_500,
            },
            chain_binding: ChainBinding {
                depth: 0,
                max_delegation_depth: 1,
            },
            validity: GrantValidity {
                issued_at: t("2026-01-01T00:00:00.000Z"),
                not_before: t("2026-01-01T00:00:00.000Z"),
                expires_at: t("2027-01-01T00:00:00.000Z"),
            },
            revocation: None,
        }
    }

    fn call(amount: i64) -> GrantCall {
        GrantCall {
            provider_id: "prov_tools".into(),
            tool_id: None,
            amount_cents: amount,
            currency: "USD".into(),
            at: t("2026-06-01T00:00:00.000Z"),
            risk_classes: vec!["low".into()],
            side_effecting: false,
        }
    }

    #[test]
    fn valid_call_passes() {
        evaluate_grant_call(&grant(), 0, &call(500)).unwrap();
    }

    #[test]
    fn provider_outside_scope_is_denied() {
        let mut c = call(500);
        c.provider_id = "prov_other".into();
        let err = evaluate_grant_call(&grant(), 0, &c).unwrap_err();
        assert_eq!(err.code(), "X402_AUTHORITY_GRANT_SCOPE_MISMATCH");
    }

    #[test]
    fn side_effecting_call_needs_permission() {
        let mut c = call(500);
        c.side_effecting = true;
        let err = evaluate_grant_call(&grant(), 0, &c).unwrap_err();
        assert_eq!(err.code(), "X402_AUTHORITY_GRANT_SCOPE_MISMATCH");
    }

    #[test]
    fn per_call_limit_is_enforced() {
        let err = evaluate_grant_call(&grant(), 0, &call(1_500)).unwrap_err();
        assert_eq!(err.code(), "X402_AUTHORITY_GRANT_PER_CALL_EXCEEDED");
    }

    #[test]
    fn cumulative_limit_counts_prior_spend() {
        let err = evaluate_grant_call(&grant(), 2_000, &call(600)).unwrap_err();
        assert_eq!(err.code(), "X402_AUTHORITY_GRANT_CUMULATIVE_EXCEEDED");
    }

    #[test]
    fn currency_mismatch_is_denied() {
        let mut c = call(500);
        c.currency = "EUR".into();
        let err = evaluate_grant_call(&grant(), 0, &c).unwrap_err();
        assert_eq!(err.code(), "X402_AUTHORITY_GRANT_CURRENCY_MISMATCH");
    }

    #[test]
    fn expired_grant_is_denied() {
        let mut c = call(500);
        c.at = t("2028-01-01T00:00:00.000Z");
        let err = evaluate_grant_call(&grant(), 0, &c).unwrap_err();
        assert_eq!(err.code(), "X402_AUTHORITY_GRANT_EXPIRED");
    }

    #[test]
    fn revoked_grant_is_denied() {
        let mut g = grant();
        g.revocation = Some(GrantRevocation {
            revoked_at: t("2026-05-01T00:00:00.000Z"),
            revocation_reason_code: "principal_request".into(),
        });
        let err = evaluate_grant_call(&g, 0, &call(500)).unwrap_err();
        assert_eq!(err.code(), "X402_AUTHORITY_GRANT_REVOKED");
    }
}
