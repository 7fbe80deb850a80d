use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use settld_core::{
    ActorRef, Agent, AgentStatus, AgreementDelegation, HashHex, IsoMillis, OwnerRef, SettldError,
    StatusChange, NOOTERRA_PAY_KEYSET_SCHEMA,
};
use settld_chain::{seal_event, validate_actor_signature, ChainedEvent, EventDraft};
use settld_crypto::{canonical_sha256_hex, key_id_from_public_key_pem, KeyPair};
use settld_pay::{KeysetKey, PayKeyset};
use tracing::info;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{IdempotencyRecord, StateDb};

// ── Per-entity key locks ──────────────────────────────────────────────────────

/// Serializes all mutating operations on one entity key. Two operations on
/// the same key observe a total order; disjoint keys proceed in parallel.
/// Cross-wallet composites lock the sorted pair of agent ids as one key.
pub(crate) struct KeyLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("key lock registry");
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Lock key for a composite operation over two wallets: the sorted tuple of
/// the agent ids, so lock order is identical regardless of direction.
pub(crate) fn wallet_pair_key(tenant: &str, a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("wallet:{tenant}:{lo}:{hi}")
}

// ── StateEngine ───────────────────────────────────────────────────────────────

/// The state transition engine.
///
/// Validates and applies operations against the persistent store. Each public
/// operation is atomic: every check runs against staged copies and nothing is
/// persisted until all checks pass — the core fails closed.
pub struct StateEngine {
    pub db: Arc<StateDb>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    /// Key that mints NooterraPay challenge tokens and signs kernel artifacts.
    pub(crate) pay_keypair: Arc<KeyPair>,
    pub(crate) locks: KeyLocks,
}

impl StateEngine {
    pub fn new(
        db: Arc<StateDb>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        pay_keypair: Arc<KeyPair>,
    ) -> Self {
        Self {
            db,
            clock,
            config,
            pay_keypair,
            locks: KeyLocks::new(),
        }
    }

    pub fn now(&self) -> IsoMillis {
        self.clock.now()
    }

    /// The keyset document this kernel publishes at the well-known URL.
    pub fn published_keyset(&self) -> PayKeyset {
        PayKeyset {
            schema_version: NOOTERRA_PAY_KEYSET_SCHEMA.to_string(),
            refreshed_at: self.now(),
            active_key: KeysetKey {
                key_id: self.pay_keypair.key_id().to_string(),
                public_key_pem: self.pay_keypair.public_key_pem().to_string(),
            },
            fallback_keys: Vec::new(),
            max_age_sec: 300,
        }
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    /// Register an agent. `keyId` and `publicKeyPem` are immutable once set:
    /// re-registering with different key material is rejected.
    pub fn register_agent(
        &self,
        tenant: &str,
        agent_id: &str,
        display_name: &str,
        owner: OwnerRef,
        public_key_pem: &str,
        capabilities: Vec<String>,
    ) -> Result<Agent, SettldError> {
        let lock = self.locks.acquire(&format!("agent:{tenant}:{agent_id}"));
        let _guard = lock.lock().expect("agent lock");

        if let Some(existing) = self.db.get_agent(tenant, agent_id)? {
            if existing.public_key_pem != public_key_pem {
                return Err(SettldError::AgentKeyImmutable);
            }
            return Ok(existing);
        }

        let registered_at = self.now();
        let agent = Agent {
            tenant_id: tenant.to_string(),
            agent_id: agent_id.to_string(),
            display_name: display_name.to_string(),
            owner,
            public_key_pem: public_key_pem.to_string(),
            key_id: key_id_from_public_key_pem(public_key_pem),
            capabilities,
            status: AgentStatus::Active,
            status_history: vec![StatusChange {
                status: AgentStatus::Active,
                at: registered_at,
            }],
            registered_at,
        };
        self.db.put_agent(&agent)?;
        info!(agent_id = %agent.agent_id, key_id = %agent.key_id, "registered agent");
        Ok(agent)
    }

    /// Passport operation: flip an agent's status. Key material stays fixed.
    pub fn set_agent_status(
        &self,
        tenant: &str,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<Agent, SettldError> {
        let lock = self.locks.acquire(&format!("agent:{tenant}:{agent_id}"));
        let _guard = lock.lock().expect("agent lock");

        let mut agent = self
            .db
            .get_agent(tenant, agent_id)?
            .ok_or_else(|| SettldError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        agent.status = status;
        agent.status_history.push(StatusChange {
            status,
            at: self.now(),
        });
        self.db.put_agent(&agent)?;
        Ok(agent)
    }

    pub(crate) fn require_agent(&self, tenant: &str, agent_id: &str) -> Result<Agent, SettldError> {
        self.db
            .get_agent(tenant, agent_id)?
            .ok_or_else(|| SettldError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    /// Resolve a signer keyId for event validation: the key must belong to
    /// the claimed agent, and the agent must have been active at the
    /// event's own timestamp — not merely active now.
    fn resolve_signer_key(
        &self,
        tenant: &str,
        key_id: &str,
        agent_id: &str,
        at: IsoMillis,
    ) -> Option<String> {
        let agent = self.db.get_agent(tenant, agent_id).ok().flatten()?;
        (agent.key_id == key_id && agent.is_active_at(at)).then_some(agent.public_key_pem)
    }

    // ── Chained event log ────────────────────────────────────────────────────

    /// Append an event to a stream with precondition, signature and
    /// idempotency enforcement.
    pub fn append_event(
        &self,
        tenant: &str,
        stream_id: &str,
        draft: EventDraft,
        expected_prev_chain_hash: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<ChainedEvent, SettldError> {
        let lock = self.locks.acquire(&format!("stream:{tenant}:{stream_id}"));
        let _guard = lock.lock().expect("stream lock");

        let scope = format!("append:{stream_id}");
        let fingerprint = canonical_sha256_hex(&draft)?;
        if let Some(key) = idempotency_key {
            if let Some(stored) = self.replay_idempotent(tenant, &scope, key, &fingerprint)? {
                return Ok(stored);
            }
        }

        validate_actor_signature(stream_id, &draft, &|key_id, agent_id, at| {
            self.resolve_signer_key(tenant, key_id, agent_id, at)
        })?;

        let tip = self.db.stream_tip(tenant, stream_id)?;
        if let Some(expected) = expected_prev_chain_hash {
            if expected != tip {
                return Err(SettldError::ChainPreconditionFailed {
                    stream_id: stream_id.to_string(),
                    expected: expected.to_string(),
                    actual: tip,
                });
            }
        }

        let event = seal_event(stream_id, &tip, draft)?;
        self.db.append_event_row(tenant, &event)?;

        if let Some(key) = idempotency_key {
            self.store_idempotent(tenant, &scope, key, &fingerprint, &event)?;
        }
        info!(stream_id = %stream_id, event_id = %event.event_id, "appended event");
        Ok(event)
    }

    /// Internal append by the engine itself (system actor, tip as found).
    /// The caller must already hold the relevant entity lock.
    pub(crate) fn append_system_event(
        &self,
        tenant: &str,
        stream_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<ChainedEvent, SettldError> {
        let lock = self.locks.acquire(&format!("stream:{tenant}:{stream_id}"));
        let _guard = lock.lock().expect("stream lock");

        let tip = self.db.stream_tip(tenant, stream_id)?;
        let event = seal_event(
            stream_id,
            &tip,
            EventDraft {
                event_type: event_type.to_string(),
                actor: ActorRef::system(),
                at: self.now(),
                payload,
                signer_key_id: None,
                signature: None,
            },
        )?;
        self.db.append_event_row(tenant, &event)?;
        Ok(event)
    }

    pub fn tip_of(&self, tenant: &str, stream_id: &str) -> Result<String, SettldError> {
        self.db.stream_tip(tenant, stream_id)
    }

    // ── Idempotency plumbing ─────────────────────────────────────────────────

    /// Fetch a stored response for `(scope, key)`. A hit with a different
    /// request fingerprint is an `IDEMPOTENCY_CONFLICT`; a hit with the same
    /// fingerprint replays the stored response verbatim.
    pub(crate) fn replay_idempotent<T: DeserializeOwned>(
        &self,
        tenant: &str,
        scope: &str,
        key: &str,
        request_hash: &str,
    ) -> Result<Option<T>, SettldError> {
        match self.db.get_idempotency(tenant, scope, key)? {
            Some(record) if record.request_hash == request_hash => {
                let value = serde_json::from_slice(&record.response)
                    .map_err(|e| SettldError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Some(_) => Err(SettldError::IdempotencyConflict {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    pub(crate) fn store_idempotent<T: Serialize>(
        &self,
        tenant: &str,
        scope: &str,
        key: &str,
        request_hash: &str,
        response: &T,
    ) -> Result<(), SettldError> {
        let record = IdempotencyRecord {
            request_hash: request_hash.to_string(),
            response: serde_json::to_vec(response)
                .map_err(|e| SettldError::Serialization(e.to_string()))?,
        };
        self.db.put_idempotency(tenant, scope, key, &record)
    }

    // ── Agreement delegations ────────────────────────────────────────────────

    /// Record a parent→child agreement link for cascade traversals.
    pub fn record_delegation(
        &self,
        delegation: AgreementDelegation,
    ) -> Result<AgreementDelegation, SettldError> {
        if delegation.parent_agreement_hash == delegation.child_agreement_hash {
            return Err(SettldError::GrantInvalid {
                reason: "delegation cannot link an agreement to itself".to_string(),
            });
        }
        if delegation.budget_cap_cents < 0 {
            return Err(SettldError::GrantInvalid {
                reason: "delegation budget cap must be non-negative".to_string(),
            });
        }
        self.db.put_delegation(&delegation)?;
        Ok(delegation)
    }

    /// Bottom-up parent order for settling ancestors of a child agreement.
    pub fn cascade_order(
        &self,
        tenant: &str,
        child_agreement_hash: &str,
    ) -> Result<Vec<HashHex>, SettldError> {
        let rows = self.db.delegations(tenant)?;
        Ok(settld_settlement::cascade_settlement_check(
            &rows,
            child_agreement_hash,
        ))
    }

    /// Top-down child order for unwinding refunds below a parent agreement.
    pub fn refund_unwind_order(
        &self,
        tenant: &str,
        parent_agreement_hash: &str,
    ) -> Result<Vec<HashHex>, SettldError> {
        let rows = self.db.delegations(tenant)?;
        Ok(settld_settlement::refund_unwind_check(
            &rows,
            parent_agreement_hash,
        ))
    }

    // ── Emergency controls ───────────────────────────────────────────────────

    pub fn set_kill_switch(&self, tenant: &str, active: bool) -> Result<(), SettldError> {
        self.db.set_emergency(tenant, "kill", "*", active)
    }

    pub fn set_pause(&self, tenant: &str, scope: &str, active: bool) -> Result<(), SettldError> {
        self.db.set_emergency(tenant, "pause", scope, active)
    }

    pub fn set_quarantine(
        &self,
        tenant: &str,
        scope: &str,
        active: bool,
    ) -> Result<(), SettldError> {
        self.db.set_emergency(tenant, "quarantine", scope, active)
    }

    /// The ordered emergency gate run at the head of authorize/verify.
    pub(crate) fn check_emergency_controls(
        &self,
        tenant: &str,
        scopes: &[&str],
    ) -> Result<(), SettldError> {
        if self.db.emergency_active(tenant, "kill", "*")? {
            return Err(SettldError::KillSwitchActive {
                tenant_id: tenant.to_string(),
            });
        }
        for scope in std::iter::once(&"*").chain(scopes.iter()) {
            if self.db.emergency_active(tenant, "pause", scope)? {
                return Err(SettldError::PauseActive {
                    scope: scope.to_string(),
                });
            }
        }
        for scope in std::iter::once(&"*").chain(scopes.iter()) {
            if self.db.emergency_active(tenant, "quarantine", scope)? {
                return Err(SettldError::QuarantineActive {
                    scope: scope.to_string(),
                });
            }
        }
        Ok(())
    }
}
