use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Money amount in integer cents. Signed so that intermediate arithmetic
/// (release minus holdback) cannot silently wrap; ledger invariants keep every
/// stored value ≥ 0.
pub type Cents = i64;

/// Holdback rate in basis points (1/100 of a percent, 10000 = 100%).
pub type BasisPoints = i64;

// ── Opaque identifiers ────────────────────────────────────────────────────────
//
// Every identifier in the system is an opaque prefixed string ("agent_…",
// "gate_…", "ev_…", "key_…"). They are hash-derived or random at the point of
// creation and never parsed, so plain aliases keep call sites readable.

pub type TenantId = String;
pub type AgentId = String;
pub type GateId = String;
pub type GrantId = String;
pub type StreamId = String;
pub type EventId = String;
pub type KeyId = String;
pub type RunId = String;
pub type AgreementId = String;
pub type DisputeId = String;
pub type CaseId = String;

/// 64-char lowercase hex SHA-256 digest.
pub type HashHex = String;

// ── IsoMillis ─────────────────────────────────────────────────────────────────

/// UTC timestamp serialized as ISO-8601 with exactly millisecond precision
/// (`2026-08-01T12:00:00.000Z`).
///
/// Artifact hashes cover the serialized string, so the format is part of the
/// wire contract: this newtype guarantees one byte representation per instant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsoMillis(pub DateTime<Utc>);

impl IsoMillis {
    pub fn as_rfc3339_millis(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(s: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)))
    }

    /// Truncate to millisecond precision so that parse(format(t)) == t.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let millis = dt.timestamp_millis();
        Self(DateTime::from_timestamp_millis(millis).unwrap_or(dt))
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl Serialize for IsoMillis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_rfc3339_millis())
    }
}

impl<'de> Deserialize<'de> for IsoMillis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        IsoMillis::parse(&s).map_err(de::Error::custom)
    }
}

impl fmt::Display for IsoMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_rfc3339_millis())
    }
}

impl fmt::Debug for IsoMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IsoMillis({})", self.as_rfc3339_millis())
    }
}

// ── ActorRef ──────────────────────────────────────────────────────────────────

/// Who performed an operation. Events appended by non-system actors must carry
/// a signature from a key the actor owned at the event timestamp.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    /// The kernel itself (state-machine transitions, maintenance ticks).
    System,
    /// A trusted server-side collaborator (gateway, outbox worker).
    Server,
    /// A registered agent; signature mandatory.
    Agent,
    /// A human operator acting through the admin surface; signature mandatory.
    Operator,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActorRef {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub id: String,
}

impl ActorRef {
    pub fn system() -> Self {
        Self {
            actor_type: ActorType::System,
            id: "system".to_string(),
        }
    }

    pub fn agent(agent_id: &str) -> Self {
        Self {
            actor_type: ActorType::Agent,
            id: agent_id.to_string(),
        }
    }

    /// True for actor types exempt from the event signature requirement.
    pub fn is_trusted(&self) -> bool {
        matches!(self.actor_type, ActorType::System | ActorType::Server)
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = match self.actor_type {
            ActorType::System => "system",
            ActorType::Server => "server",
            ActorType::Agent => "agent",
            ActorType::Operator => "operator",
        };
        write!(f, "{}:{}", t, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_millis_round_trips_at_millisecond_precision() {
        let t = IsoMillis::parse("2026-08-01T12:00:00.123Z").unwrap();
        assert_eq!(t.as_rfc3339_millis(), "2026-08-01T12:00:00.123Z");
        let again = IsoMillis::parse(&t.as_rfc3339_millis()).unwrap();
        assert_eq!(t, again);
    }

    #[test]
    fn iso_millis_truncates_sub_millisecond() {
        let dt = DateTime::parse_from_rfc3339("2026-08-01T12:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let t = IsoMillis::from_datetime(dt);
        assert_eq!(t.as_rfc3339_millis(), "2026-08-01T12:00:00.123Z");
    }

    #[test]
    fn actor_serde_uses_wire_field_names() {
        let a = ActorRef::agent("agent_abc");
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["type"], "agent");
        assert_eq!(v["id"], "agent_abc");
    }
}
