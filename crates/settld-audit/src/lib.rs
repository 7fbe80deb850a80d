//! settld-audit
//!
//! Deterministic audit export over an immutable view of rows produced by the
//! event log, the gate, the settlement kernel and the dispute overlay.
//!
//! Rows are canonical-encoded individually and chained:
//! `row[i].rowChainHash = sha256(row[i-1].rowChainHash || canonical(row[i]))`
//! with the row's own hash field null inside the hash input. The envelope
//! carries the head hash and its own content address; a signer wrapper
//! attests the export hash. Two runs over the same data are byte-identical:
//! nothing clock- or locale-dependent enters the output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_core::{HashHex, SettldError, StreamId, TenantId, ZERO_HASH};
use settld_crypto::{sha256_hex, Signer};

// ── Rows ──────────────────────────────────────────────────────────────────────

/// One exportable row. `chain_hash` is the row's position anchor in its
/// source stream and the last component of the export sort key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub tenant_id: TenantId,
    pub stream_id: StreamId,
    pub chain_hash: HashHex,
    pub row: Value,
    /// null while hashing; filled when the export chain is built.
    pub row_chain_hash: Option<HashHex>,
}

/// Export envelope. `export_hash` is SHA-256 of the canonical envelope with
/// the field set to null.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportEnvelope {
    pub schema_version: String,
    pub query: Value,
    pub row_count: u64,
    pub row_chain_head_hash: HashHex,
    pub export_hash: Option<HashHex>,
}

/// Signed wrapper: the envelope plus the signer's attestation over
/// `exportHash`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedExport {
    pub envelope: ExportEnvelope,
    pub rows: Vec<ExportRow>,
    pub signer_key_id: String,
    pub signature: String,
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Deterministic row order: lexicographic on `(tenantId, streamId, chainHash)`.
fn order_rows(rows: &mut [ExportRow]) {
    rows.sort_by(|a, b| {
        (&a.tenant_id, &a.stream_id, &a.chain_hash).cmp(&(
            &b.tenant_id,
            &b.stream_id,
            &b.chain_hash,
        ))
    });
}

fn row_chain_hash(prev: &str, row: &ExportRow) -> Result<HashHex, SettldError> {
    let mut unhashed = row.clone();
    unhashed.row_chain_hash = None;
    let canonical = settld_canon::to_canonical_bytes(&unhashed)?;
    let mut input = Vec::with_capacity(prev.len() + canonical.len());
    input.extend_from_slice(prev.as_bytes());
    input.extend_from_slice(&canonical);
    Ok(sha256_hex(&input))
}

/// Build a signed export from an unordered set of rows. Pure apart from the
/// signer call; the same `(rows, query)` always yields the same bytes.
pub fn build_export(
    mut rows: Vec<ExportRow>,
    query: Value,
    signer: &dyn Signer,
) -> Result<SignedExport, SettldError> {
    order_rows(&mut rows);

    let mut prev = ZERO_HASH.to_string();
    for row in &mut rows {
        let hash = row_chain_hash(&prev, row)?;
        row.row_chain_hash = Some(hash.clone());
        prev = hash;
    }

    let mut envelope = ExportEnvelope {
        schema_version: "SettldAuditExport.v1".to_string(),
        query,
        row_count: rows.len() as u64,
        row_chain_head_hash: prev,
        export_hash: None,
    };
    envelope.export_hash = Some(settld_crypto::canonical_sha256_hex(&envelope)?);

    let export_hash = envelope.export_hash.clone().expect("just set");
    let signature = signer.sign_hash_hex(&export_hash)?;
    Ok(SignedExport {
        envelope,
        rows,
        signer_key_id: signer.key_id()?,
        signature,
    })
}

/// Re-verify an export: row order, row chain, envelope hash. (Signature
/// verification needs the signer's public key and lives with the caller's
/// trust store.)
pub fn verify_export(export: &SignedExport) -> Result<(), SettldError> {
    let mut expected_order = export.rows.clone();
    order_rows(&mut expected_order);
    if expected_order != export.rows {
        return Err(SettldError::Serialization(
            "export rows are not in canonical order".to_string(),
        ));
    }

    let mut prev = ZERO_HASH.to_string();
    for row in &export.rows {
        let recomputed = row_chain_hash(&prev, row)?;
        if Some(&recomputed) != row.row_chain_hash.as_ref() {
            return Err(SettldError::Serialization(format!(
                "row chain hash mismatch at stream {} chain {}",
                row.stream_id, row.chain_hash
            )));
        }
        prev = recomputed;
    }
    if prev != export.envelope.row_chain_head_hash {
        return Err(SettldError::Serialization(
            "row chain head hash mismatch".to_string(),
        ));
    }

    let mut unhashed = export.envelope.clone();
    unhashed.export_hash = None;
    let recomputed = settld_crypto::canonical_sha256_hex(&unhashed)?;
    if Some(&recomputed) != export.envelope.export_hash.as_ref() {
        return Err(SettldError::Serialization("export hash mismatch".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use settld_crypto::{InProcessSigner, KeyPair};

    fn row(tenant: &str, stream: &str, chain: &str, n: i64) -> ExportRow {
        ExportRow {
            tenant_id: tenant.into(),
            stream_id: stream.into(),
            chain_hash: chain.into(),
            row: json!({ "n": n }),
            row_chain_hash: None,
        }
    }

    fn signer() -> InProcessSigner {
        InProcessSigner::new(KeyPair::generate())
    }

    #[test]
    fn export_is_byte_identical_across_runs() {
        let kp = KeyPair::generate();
        let rows = vec![
            row("tn", "s2", "bb", 2),
            row("tn", "s1", "aa", 1),
            row("tn", "s1", "cc", 3),
        ];
        let a = build_export(rows.clone(), json!({"q": "all"}), &InProcessSigner::new(
            KeyPair::from_private_key_pem(&kp.private_key_pem().unwrap()).unwrap(),
        ))
        .unwrap();
        let b = build_export(
            {
                let mut r = rows;
                r.reverse();
                r
            },
            json!({"q": "all"}),
            &InProcessSigner::new(
                KeyPair::from_private_key_pem(&kp.private_key_pem().unwrap()).unwrap(),
            ),
        )
        .unwrap();
        assert_eq!(a.envelope, b.envelope);
        assert_eq!(a.rows, b.rows);
    }

    #[test]
    fn rows_sort_by_tenant_stream_then_chain_hash() {
        let export = build_export(
            vec![
                row("tn", "s2", "aa", 1),
                row("tn", "s1", "zz", 2),
                row("tn", "s1", "aa", 3),
            ],
            json!({}),
            &signer(),
        )
        .unwrap();
        let order: Vec<&str> = export
            .rows
            .iter()
            .map(|r| r.chain_hash.as_str())
            .collect();
        assert_eq!(order, ["aa", "zz", "aa"]);
        assert_eq!(export.rows[0].stream_id, "s1");
        assert_eq!(export.rows[2].stream_id, "s2");
    }

    #[test]
    fn built_export_verifies() {
        let export = build_export(
            vec![row("tn", "s1", "aa", 1), row("tn", "s1", "bb", 2)],
            json!({"streams": ["s1"]}),
            &signer(),
        )
        .unwrap();
        verify_export(&export).unwrap();
    }

    #[test]
    fn tampered_row_breaks_the_chain() {
        let mut export = build_export(
            vec![row("tn", "s1", "aa", 1), row("tn", "s1", "bb", 2)],
            json!({}),
            &signer(),
        )
        .unwrap();
        export.rows[0].row = json!({ "n": 999 });
        assert!(verify_export(&export).is_err());
    }

    #[test]
    fn empty_export_heads_at_zero_hash() {
        let export = build_export(vec![], json!({}), &signer()).unwrap();
        assert_eq!(export.envelope.row_chain_head_hash, ZERO_HASH);
        verify_export(&export).unwrap();
    }
}
