use std::path::Path;

use serde::{Deserialize, Serialize};
use settld_core::{
    Agent, AgreementDelegation, ArbitrationCase, AuthorityGrant, Cents, Dispute, FundingHold,
    IsoMillis, SettldError, SettlementDecisionRecord, SettlementReceipt, Wallet, X402Gate,
};
use settld_chain::ChainedEvent;

/// Segment separator inside composite sled keys. Identifiers never contain
/// control characters, so the unit separator is unambiguous.
const SEP: u8 = 0x1f;

fn key2(a: &str, b: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(a.len() + b.len() + 1);
    k.extend_from_slice(a.as_bytes());
    k.push(SEP);
    k.extend_from_slice(b.as_bytes());
    k
}

fn key3(a: &str, b: &str, c: &str) -> Vec<u8> {
    let mut k = key2(a, b);
    k.push(SEP);
    k.extend_from_slice(c.as_bytes());
    k
}

fn prefix2(a: &str, b: &str) -> Vec<u8> {
    let mut k = key2(a, b);
    k.push(SEP);
    k
}

// ── Row types local to the store ──────────────────────────────────────────────

/// Stored response for an idempotent operation: the fingerprint of the
/// request that produced it plus the exact response bytes to replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub request_hash: String,
    pub response: Vec<u8>,
}

/// A decision record and (once settled) its receipt, stored together per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementBundle {
    pub record: SettlementDecisionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SettlementReceipt>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    HoldbackRelease,
    MonthClose,
    PayoutEnqueue,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxKind::HoldbackRelease => "holdback_release",
            OutboxKind::MonthClose => "month_close",
            OutboxKind::PayoutEnqueue => "payout_enqueue",
        }
    }

    pub const ALL: [OutboxKind; 3] = [
        OutboxKind::HoldbackRelease,
        OutboxKind::MonthClose,
        OutboxKind::PayoutEnqueue,
    ];
}

/// One deferred unit of maintenance work, keyed `(kind, scheduledAt)` and
/// idempotent on `idempotency_key` so at-least-once delivery is
/// observationally exactly-once.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    pub tenant_id: String,
    pub kind: OutboxKind,
    pub message_id: String,
    pub scheduled_at: IsoMillis,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
}

// ── StateDb ───────────────────────────────────────────────────────────────────

/// Persistent state database backed by sled (pure-Rust, no C dependencies).
///
/// Named trees (all keys tenant-prefixed; no cross-tenant path exists):
///   agents        — (tenant, agentId)            → json(Agent)
///   wallets       — (tenant, agentId)            → bincode(Wallet)
///   grants        — (tenant, grantId)            → json(AuthorityGrant)
///   grant_spend   — (tenant, grantId)            → i64 be bytes
///   gates         — (tenant, gateId)             → json(X402Gate)
///   stream_tips   — (tenant, streamId)           → chain hash utf8
///   stream_len    — (tenant, streamId)           → u64 be bytes
///   events        — (tenant, streamId, seq16x)   → json(ChainedEvent)
///   idempotency   — (tenant, scope, key)         → bincode(IdempotencyRecord)
///   settlements   — (tenant, runId, seq8x)       → json(SettlementBundle)
///   disputes      — (tenant, disputeId)          → json(Dispute)
///   dispute_gate  — (tenant, gateId)             → disputeId utf8
///   cases         — (tenant, caseId)             → json(ArbitrationCase)
///   holds         — (tenant, gateId)             → json(FundingHold)
///   delegations   — (tenant, childHash, parent)  → json(AgreementDelegation)
///   outbox        — (tenant, kind, schedMs16x + msgId) → json(OutboxMessage)
///   outbox_done   — (tenant, kind, idemKey)      → [] (membership set)
///   emergency     — (tenant, kind, scope)        → [] (membership set)
///   meta          — utf8 key                     → raw bytes
///
/// Artifact rows (agents, grants, gates, events, settlements, disputes,
/// cases, holds, delegations, outbox) are stored as their wire JSON; internal
/// ledger rows use bincode.
pub struct StateDb {
    _db: sled::Db,
    agents: sled::Tree,
    wallets: sled::Tree,
    grants: sled::Tree,
    grant_spend: sled::Tree,
    gates: sled::Tree,
    stream_tips: sled::Tree,
    stream_len: sled::Tree,
    events: sled::Tree,
    idempotency: sled::Tree,
    settlements: sled::Tree,
    disputes: sled::Tree,
    dispute_gate: sled::Tree,
    cases: sled::Tree,
    holds: sled::Tree,
    delegations: sled::Tree,
    outbox: sled::Tree,
    outbox_done: sled::Tree,
    emergency: sled::Tree,
    meta: sled::Tree,
}

fn storage_err(e: sled::Error) -> SettldError {
    SettldError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> SettldError {
    SettldError::Serialization(e.to_string())
}

fn bin_err(e: bincode::Error) -> SettldError {
    SettldError::Serialization(e.to_string())
}

impl StateDb {
    /// Open or create the state database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SettldError> {
        let db = sled::open(path).map_err(storage_err)?;
        let open = |name: &str| db.open_tree(name).map_err(storage_err);
        Ok(Self {
            agents: open("agents")?,
            wallets: open("wallets")?,
            grants: open("grants")?,
            grant_spend: open("grant_spend")?,
            gates: open("gates")?,
            stream_tips: open("stream_tips")?,
            stream_len: open("stream_len")?,
            events: open("events")?,
            idempotency: open("idempotency")?,
            settlements: open("settlements")?,
            disputes: open("disputes")?,
            dispute_gate: open("dispute_gate")?,
            cases: open("cases")?,
            holds: open("holds")?,
            delegations: open("delegations")?,
            outbox: open("outbox")?,
            outbox_done: open("outbox_done")?,
            emergency: open("emergency")?,
            meta: open("meta")?,
            _db: db,
        })
    }

    // ── Generic row helpers ──────────────────────────────────────────────────

    fn get_json<T: serde::de::DeserializeOwned>(
        tree: &sled::Tree,
        key: &[u8],
    ) -> Result<Option<T>, SettldError> {
        match tree.get(key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(json_err)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(
        tree: &sled::Tree,
        key: &[u8],
        value: &T,
    ) -> Result<(), SettldError> {
        let bytes = serde_json::to_vec(value).map_err(json_err)?;
        tree.insert(key, bytes).map_err(storage_err)?;
        Ok(())
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    pub fn get_agent(&self, tenant: &str, agent_id: &str) -> Result<Option<Agent>, SettldError> {
        Self::get_json(&self.agents, &key2(tenant, agent_id))
    }

    pub fn put_agent(&self, agent: &Agent) -> Result<(), SettldError> {
        Self::put_json(&self.agents, &key2(&agent.tenant_id, &agent.agent_id), agent)
    }

    // ── Wallets ──────────────────────────────────────────────────────────────

    pub fn get_wallet(&self, tenant: &str, agent_id: &str) -> Result<Option<Wallet>, SettldError> {
        match self
            .wallets
            .get(key2(tenant, agent_id))
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(bin_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_wallet(&self, wallet: &Wallet) -> Result<(), SettldError> {
        let bytes = bincode::serialize(wallet).map_err(bin_err)?;
        self.wallets
            .insert(key2(&wallet.tenant_id, &wallet.agent_id), bytes)
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Grants ───────────────────────────────────────────────────────────────

    pub fn get_grant(
        &self,
        tenant: &str,
        grant_id: &str,
    ) -> Result<Option<AuthorityGrant>, SettldError> {
        Self::get_json(&self.grants, &key2(tenant, grant_id))
    }

    pub fn put_grant(&self, grant: &AuthorityGrant) -> Result<(), SettldError> {
        Self::put_json(&self.grants, &key2(&grant.tenant_id, &grant.grant_id), grant)
    }

    pub fn get_grant_spend(&self, tenant: &str, grant_id: &str) -> Result<Cents, SettldError> {
        match self
            .grant_spend
            .get(key2(tenant, grant_id))
            .map_err(storage_err)?
        {
            Some(bytes) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes[..8]);
                Ok(i64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    pub fn put_grant_spend(
        &self,
        tenant: &str,
        grant_id: &str,
        spent: Cents,
    ) -> Result<(), SettldError> {
        self.grant_spend
            .insert(key2(tenant, grant_id), &spent.to_be_bytes())
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Gates ────────────────────────────────────────────────────────────────

    pub fn get_gate(&self, tenant: &str, gate_id: &str) -> Result<Option<X402Gate>, SettldError> {
        Self::get_json(&self.gates, &key2(tenant, gate_id))
    }

    pub fn put_gate(&self, gate: &X402Gate) -> Result<(), SettldError> {
        Self::put_json(&self.gates, &key2(&gate.tenant_id, &gate.gate_id), gate)
    }

    // ── Chained event streams ────────────────────────────────────────────────

    /// Current tip of a stream, or the zero hash for an empty stream.
    pub fn stream_tip(&self, tenant: &str, stream_id: &str) -> Result<String, SettldError> {
        match self
            .stream_tips
            .get(key2(tenant, stream_id))
            .map_err(storage_err)?
        {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| SettldError::Serialization(e.to_string())),
            None => Ok(settld_core::ZERO_HASH.to_string()),
        }
    }

    fn stream_len(&self, tenant: &str, stream_id: &str) -> Result<u64, SettldError> {
        match self
            .stream_len
            .get(key2(tenant, stream_id))
            .map_err(storage_err)?
        {
            Some(bytes) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes[..8]);
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Persist a sealed event at the stream tip. The caller (engine) holds
    /// the stream's key lock, so tip/len updates are not racy.
    pub fn append_event_row(&self, tenant: &str, event: &ChainedEvent) -> Result<(), SettldError> {
        let seq = self.stream_len(tenant, &event.stream_id)?;
        let seq_key = format!("{seq:016x}");
        Self::put_json(
            &self.events,
            &key3(tenant, &event.stream_id, &seq_key),
            event,
        )?;
        self.stream_tips
            .insert(
                key2(tenant, &event.stream_id),
                event.chain_hash.as_bytes(),
            )
            .map_err(storage_err)?;
        self.stream_len
            .insert(key2(tenant, &event.stream_id), &(seq + 1).to_be_bytes())
            .map_err(storage_err)?;
        Ok(())
    }

    /// All events of one stream, in append order.
    pub fn stream_events(
        &self,
        tenant: &str,
        stream_id: &str,
    ) -> Result<Vec<ChainedEvent>, SettldError> {
        let mut out = Vec::new();
        for item in self.events.scan_prefix(prefix2(tenant, stream_id)) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(serde_json::from_slice(&bytes).map_err(json_err)?);
        }
        Ok(out)
    }

    /// Every event of a tenant across all streams, in key order
    /// (lexicographic on `(streamId, seq)`).
    pub fn all_events(&self, tenant: &str) -> Result<Vec<ChainedEvent>, SettldError> {
        let mut prefix = tenant.as_bytes().to_vec();
        prefix.push(SEP);
        let mut out = Vec::new();
        for item in self.events.scan_prefix(prefix) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(serde_json::from_slice(&bytes).map_err(json_err)?);
        }
        Ok(out)
    }

    // ── Idempotency ──────────────────────────────────────────────────────────

    pub fn get_idempotency(
        &self,
        tenant: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, SettldError> {
        match self
            .idempotency
            .get(key3(tenant, scope, key))
            .map_err(storage_err)?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(bin_err)?)),
            None => Ok(None),
        }
    }

    pub fn put_idempotency(
        &self,
        tenant: &str,
        scope: &str,
        key: &str,
        record: &IdempotencyRecord,
    ) -> Result<(), SettldError> {
        let bytes = bincode::serialize(record).map_err(bin_err)?;
        self.idempotency
            .insert(key3(tenant, scope, key), bytes)
            .map_err(storage_err)?;
        Ok(())
    }

    // ── Settlements ──────────────────────────────────────────────────────────

    pub fn push_settlement(
        &self,
        tenant: &str,
        run_id: &str,
        bundle: &SettlementBundle,
    ) -> Result<(), SettldError> {
        let seq = self
            .settlements
            .scan_prefix(prefix2(tenant, run_id))
            .count();
        let seq_key = format!("{seq:08x}");
        Self::put_json(&self.settlements, &key3(tenant, run_id, &seq_key), bundle)
    }

    pub fn settlements_for_run(
        &self,
        tenant: &str,
        run_id: &str,
    ) -> Result<Vec<SettlementBundle>, SettldError> {
        let mut out = Vec::new();
        for item in self.settlements.scan_prefix(prefix2(tenant, run_id)) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(serde_json::from_slice(&bytes).map_err(json_err)?);
        }
        Ok(out)
    }

    /// Overwrite the most recent settlement bundle for a run (dispute flips
    /// the receipt status; the decision record is never touched).
    pub fn update_latest_settlement(
        &self,
        tenant: &str,
        run_id: &str,
        bundle: &SettlementBundle,
    ) -> Result<(), SettldError> {
        let count = self
            .settlements
            .scan_prefix(prefix2(tenant, run_id))
            .count();
        if count == 0 {
            return Err(SettldError::Storage(format!(
                "no settlement recorded for run {run_id}"
            )));
        }
        let seq_key = format!("{:08x}", count - 1);
        Self::put_json(&self.settlements, &key3(tenant, run_id, &seq_key), bundle)
    }

    // ── Disputes / arbitration ───────────────────────────────────────────────

    pub fn get_dispute(
        &self,
        tenant: &str,
        dispute_id: &str,
    ) -> Result<Option<Dispute>, SettldError> {
        Self::get_json(&self.disputes, &key2(tenant, dispute_id))
    }

    pub fn put_dispute(&self, dispute: &Dispute) -> Result<(), SettldError> {
        Self::put_json(
            &self.disputes,
            &key2(&dispute.tenant_id, &dispute.dispute_id),
            dispute,
        )?;
        self.dispute_gate
            .insert(
                key2(&dispute.tenant_id, &dispute.gate_id),
                dispute.dispute_id.as_bytes(),
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn dispute_for_gate(
        &self,
        tenant: &str,
        gate_id: &str,
    ) -> Result<Option<Dispute>, SettldError> {
        match self
            .dispute_gate
            .get(key2(tenant, gate_id))
            .map_err(storage_err)?
        {
            Some(bytes) => {
                let dispute_id = String::from_utf8(bytes.to_vec())
                    .map_err(|e| SettldError::Serialization(e.to_string()))?;
                self.get_dispute(tenant, &dispute_id)
            }
            None => Ok(None),
        }
    }

    pub fn get_case(
        &self,
        tenant: &str,
        case_id: &str,
    ) -> Result<Option<ArbitrationCase>, SettldError> {
        Self::get_json(&self.cases, &key2(tenant, case_id))
    }

    pub fn put_case(&self, case: &ArbitrationCase) -> Result<(), SettldError> {
        Self::put_json(&self.cases, &key2(&case.tenant_id, &case.case_id), case)
    }

    // ── Funding holds ────────────────────────────────────────────────────────

    pub fn get_hold(&self, tenant: &str, gate_id: &str) -> Result<Option<FundingHold>, SettldError> {
        Self::get_json(&self.holds, &key2(tenant, gate_id))
    }

    pub fn put_hold(&self, hold: &FundingHold) -> Result<(), SettldError> {
        Self::put_json(&self.holds, &key2(&hold.tenant_id, &hold.gate_id), hold)
    }

    // ── Agreement delegations ────────────────────────────────────────────────

    pub fn put_delegation(&self, d: &AgreementDelegation) -> Result<(), SettldError> {
        Self::put_json(
            &self.delegations,
            &key3(&d.tenant_id, &d.child_agreement_hash, &d.parent_agreement_hash),
            d,
        )
    }

    pub fn delegations(&self, tenant: &str) -> Result<Vec<AgreementDelegation>, SettldError> {
        let mut prefix = tenant.as_bytes().to_vec();
        prefix.push(SEP);
        let mut out = Vec::new();
        for item in self.delegations.scan_prefix(prefix) {
            let (_, bytes) = item.map_err(storage_err)?;
            out.push(serde_json::from_slice(&bytes).map_err(json_err)?);
        }
        Ok(out)
    }

    // ── Outbox ───────────────────────────────────────────────────────────────

    pub fn enqueue_outbox(&self, msg: &OutboxMessage) -> Result<(), SettldError> {
        let sched = format!(
            "{:016x}{}",
            msg.scheduled_at.timestamp_millis(),
            msg.message_id
        );
        Self::put_json(
            &self.outbox,
            &key3(&msg.tenant_id, msg.kind.as_str(), &sched),
            msg,
        )
    }

    /// Messages of one `(tenant, kind)` due at or before `now`, oldest first,
    /// bounded by `limit`.
    pub fn due_outbox(
        &self,
        tenant: &str,
        kind: OutboxKind,
        now: IsoMillis,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, SettldError> {
        let mut out = Vec::new();
        for item in self.outbox.scan_prefix(prefix2(tenant, kind.as_str())) {
            if out.len() >= limit {
                break;
            }
            let (_, bytes) = item.map_err(storage_err)?;
            let msg: OutboxMessage = serde_json::from_slice(&bytes).map_err(json_err)?;
            if msg.scheduled_at <= now {
                out.push(msg);
            } else {
                // Keys sort by scheduledAt; nothing later is due.
                break;
            }
        }
        Ok(out)
    }

    pub fn remove_outbox(&self, msg: &OutboxMessage) -> Result<(), SettldError> {
        let sched = format!(
            "{:016x}{}",
            msg.scheduled_at.timestamp_millis(),
            msg.message_id
        );
        self.outbox
            .remove(key3(&msg.tenant_id, msg.kind.as_str(), &sched))
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn outbox_is_done(&self, msg: &OutboxMessage) -> Result<bool, SettldError> {
        self.outbox_done
            .contains_key(key3(&msg.tenant_id, msg.kind.as_str(), &msg.idempotency_key))
            .map_err(storage_err)
    }

    /// Mark a message's idempotency key processed; returns false if it had
    /// already been processed (duplicate delivery).
    pub fn mark_outbox_done(&self, msg: &OutboxMessage) -> Result<bool, SettldError> {
        let key = key3(&msg.tenant_id, msg.kind.as_str(), &msg.idempotency_key);
        let previous = self
            .outbox_done
            .insert(key, b"".as_ref())
            .map_err(storage_err)?;
        Ok(previous.is_none())
    }

    // ── Emergency controls ───────────────────────────────────────────────────

    pub fn set_emergency(
        &self,
        tenant: &str,
        kind: &str,
        scope: &str,
        active: bool,
    ) -> Result<(), SettldError> {
        let key = key3(tenant, kind, scope);
        if active {
            self.emergency.insert(key, b"".as_ref()).map_err(storage_err)?;
        } else {
            self.emergency.remove(key).map_err(storage_err)?;
        }
        Ok(())
    }

    pub fn emergency_active(
        &self,
        tenant: &str,
        kind: &str,
        scope: &str,
    ) -> Result<bool, SettldError> {
        Ok(self
            .emergency
            .contains_key(key3(tenant, kind, scope))
            .map_err(storage_err)?)
    }

    // ── Meta ─────────────────────────────────────────────────────────────────

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), SettldError> {
        self.meta.insert(key.as_bytes(), value).map_err(storage_err)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, SettldError> {
        self.meta
            .get(key.as_bytes())
            .map(|v| v.map(|iv| iv.to_vec()))
            .map_err(storage_err)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), SettldError> {
        self._db.flush().map_err(storage_err)?;
        Ok(())
    }
}
