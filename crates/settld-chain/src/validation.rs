use settld_core::{IsoMillis, SettldError, ZERO_HASH};
use settld_crypto::verify_hash_hex;

use crate::event::{signable_hash, ChainedEvent, EventDraft};

/// Resolves a signer keyId to the owning agent's public key PEM, provided the
/// key belongs to the draft's actor and is active at the given instant.
/// Returns `None` when no such key exists.
pub type KeyResolver<'a> = &'a dyn Fn(&str, &str, IsoMillis) -> Option<String>;

/// Enforce the actor-signature rule for an append.
///
/// `system`/`server` actors are exempt. Any other actor must carry a
/// signature by an agent-owned key active at `draft.at`; a missing signature
/// is `EVENT_SIGNATURE_REQUIRED`, an unresolvable key or failed verification
/// is `EVENT_SIGNATURE_INVALID`.
pub fn validate_actor_signature(
    stream_id: &str,
    draft: &EventDraft,
    resolve_key: KeyResolver<'_>,
) -> Result<(), SettldError> {
    if draft.actor.is_trusted() {
        return Ok(());
    }
    let (key_id, signature) = match (&draft.signer_key_id, &draft.signature) {
        (Some(k), Some(s)) => (k, s),
        _ => {
            return Err(SettldError::EventSignatureRequired {
                actor: draft.actor.to_string(),
            })
        }
    };
    let pem = resolve_key(key_id, &draft.actor.id, draft.at)
        .ok_or(SettldError::EventSignatureInvalid)?;
    let digest = signable_hash(stream_id, draft)?;
    if !verify_hash_hex(&digest, signature, &pem) {
        return Err(SettldError::EventSignatureInvalid);
    }
    Ok(())
}

/// Re-verify a full stream: linkage, hash recomputation, derived event ids.
/// Used by the audit exporter and the offline verifier.
pub fn verify_stream(events: &[ChainedEvent]) -> Result<(), SettldError> {
    let mut expected_prev = ZERO_HASH.to_string();
    for event in events {
        if event.prev_chain_hash != expected_prev {
            return Err(SettldError::ChainPreconditionFailed {
                stream_id: event.stream_id.clone(),
                expected: expected_prev,
                actual: event.prev_chain_hash.clone(),
            });
        }
        let recomputed = event.recompute_chain_hash()?;
        if recomputed != event.chain_hash {
            return Err(SettldError::ChainPreconditionFailed {
                stream_id: event.stream_id.clone(),
                expected: recomputed,
                actual: event.chain_hash.clone(),
            });
        }
        if event.event_id != format!("ev_{}", &event.chain_hash[..24]) {
            return Err(SettldError::ChainPreconditionFailed {
                stream_id: event.stream_id.clone(),
                expected: format!("ev_{}", &event.chain_hash[..24]),
                actual: event.event_id.clone(),
            });
        }
        expected_prev = event.chain_hash.clone();
    }
    Ok(())
}
