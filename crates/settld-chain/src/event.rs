use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_core::{
    ActorRef, EventId, HashHex, IsoMillis, KeyId, SettldError, StreamId, ID_HASH_PREFIX_LEN,
};
use settld_crypto::sha256_hex;

// ── ChainedEvent ──────────────────────────────────────────────────────────────

/// One append on a named stream (job, run, agreement, x402 gate).
///
/// `chain_hash = sha256_hex(prev_chain_hash || canonical(event core))` where
/// the core is the event minus `eventId`, `chainHash` and `signature`; the
/// first event on a stream uses [`settld_core::ZERO_HASH`] as its
/// `prevChainHash`. Once appended an event is never mutated or deleted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChainedEvent {
    /// `ev_` + first 24 hex of the chain hash.
    pub event_id: EventId,
    pub stream_id: StreamId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: ActorRef,
    pub at: IsoMillis,
    pub payload: Value,
    pub prev_chain_hash: HashHex,
    pub chain_hash: HashHex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_key_id: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ChainedEvent {
    /// The canonical core this event's chain hash covers.
    pub fn chain_core(&self) -> Result<Value, SettldError> {
        let mut v = serde_json::to_value(self)
            .map_err(|e| SettldError::Serialization(e.to_string()))?;
        let obj = v.as_object_mut().expect("event serializes to an object");
        obj.remove("eventId");
        obj.remove("chainHash");
        obj.remove("signature");
        Ok(v)
    }

    /// Recompute this event's chain hash from its own fields.
    pub fn recompute_chain_hash(&self) -> Result<HashHex, SettldError> {
        compute_chain_hash(&self.prev_chain_hash, &self.chain_core()?)
    }
}

/// Chain-hash over a prepared core value.
pub fn compute_chain_hash(prev_chain_hash: &str, core: &Value) -> Result<HashHex, SettldError> {
    let canonical = settld_canon::canonical_bytes(core)?;
    let mut input = Vec::with_capacity(prev_chain_hash.len() + canonical.len());
    input.extend_from_slice(prev_chain_hash.as_bytes());
    input.extend_from_slice(&canonical);
    Ok(sha256_hex(&input))
}

// ── EventDraft ────────────────────────────────────────────────────────────────

/// What a caller submits for appending; the log assigns `prevChainHash`,
/// `chainHash` and `eventId` when the append is sequenced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor: ActorRef,
    pub at: IsoMillis,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_key_id: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Digest a non-system actor signs before submitting a draft:
/// sha256(canonical({actor, at, payload, streamId, type})). The stream id is
/// part of the envelope so a signed event cannot be replayed onto another
/// stream.
pub fn signable_hash(stream_id: &str, draft: &EventDraft) -> Result<HashHex, SettldError> {
    let envelope = serde_json::json!({
        "actor": draft.actor,
        "at": draft.at,
        "payload": draft.payload,
        "streamId": stream_id,
        "type": draft.event_type,
    });
    let bytes = settld_canon::canonical_bytes(&envelope)?;
    Ok(sha256_hex(&bytes))
}

/// Seal a draft onto a stream at the given tip.
pub fn seal_event(
    stream_id: &str,
    prev_chain_hash: &str,
    draft: EventDraft,
) -> Result<ChainedEvent, SettldError> {
    let mut event = ChainedEvent {
        event_id: String::new(),
        stream_id: stream_id.to_string(),
        event_type: draft.event_type,
        actor: draft.actor,
        at: draft.at,
        payload: draft.payload,
        prev_chain_hash: prev_chain_hash.to_string(),
        chain_hash: String::new(),
        signer_key_id: draft.signer_key_id,
        signature: draft.signature,
    };
    let chain_hash = compute_chain_hash(prev_chain_hash, &event.chain_core()?)?;
    event.event_id = format!("ev_{}", &chain_hash[..ID_HASH_PREFIX_LEN]);
    event.chain_hash = chain_hash;
    Ok(event)
}
