use serde::{Deserialize, Serialize};

use crate::types::{AgentId, IsoMillis, KeyId, TenantId};

// ── Ownership ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Service,
    Human,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub owner_type: OwnerType,
    pub owner_id: String,
}

// ── Agent ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Suspended,
    Revoked,
}

/// One passport status transition. History entries are append-only and
/// ordered by `at` (ascending).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub status: AgentStatus,
    pub at: IsoMillis,
}

/// A registered actor. `public_key_pem` and the derived `key_id` are immutable
/// once set; mutations go through signed passport operations only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub display_name: String,
    pub owner: OwnerRef,
    /// SPKI PEM of the agent's Ed25519 public key.
    pub public_key_pem: String,
    /// `key_` + first 24 hex of SHA-256 over the PEM.
    pub key_id: KeyId,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    /// Passport status transitions, oldest first. Event signatures are
    /// graded against the status in effect at the event's own timestamp,
    /// not the current one.
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
    pub registered_at: IsoMillis,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        matches!(self.status, AgentStatus::Active)
    }

    /// Status in effect at `at`: the latest transition not after `at`.
    /// `None` before registration. Rows persisted without a history fall
    /// back to the current status.
    pub fn status_at(&self, at: IsoMillis) -> Option<AgentStatus> {
        if at < self.registered_at {
            return None;
        }
        let last = self
            .status_history
            .iter()
            .take_while(|c| c.at <= at)
            .last()
            .map(|c| c.status);
        Some(last.unwrap_or(self.status))
    }

    pub fn is_active_at(&self, at: IsoMillis) -> bool {
        matches!(self.status_at(at), Some(AgentStatus::Active))
    }
}
