//! Job-proof bundle loading and verification.
//!
//! A bundle directory contains: `trust.json` (governance roots + time
//! authorities + pricing signers, self-signed by a root), the event log
//! (`events.jsonl`, one chained event per line), the policy snapshot, the
//! settlement decision and receipt, the evidence pointer list, and a
//! `SHA256SUMS` over those files. Verification re-derives everything from
//! bytes: file digests, chain integrity, settlement bindings, policy hash,
//! trust-root signature. The JSON report is canonical, so two runs over the
//! same bundle are byte-identical regardless of locale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use settld_chain::{verify_stream, ChainedEvent};
use settld_core::{
    SettldError, SettlementDecisionRecord, SettlementReceipt, BUNDLE_DECISION_FILE,
    BUNDLE_EVENTS_FILE, BUNDLE_EVIDENCE_FILE, BUNDLE_POLICY_FILE, BUNDLE_RECEIPT_FILE,
    BUNDLE_SUMS_FILE, BUNDLE_TRUST_FILE,
};
use settld_crypto::{sha256_hex, verify_hash_hex};
use settld_settlement::verify_settlement_binding;

// ── Trust document ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrustKey {
    pub key_id: String,
    pub public_key_pem: String,
}

/// `trust.json`: the governance roots and auxiliary signer sets the bundle
/// was assembled under, attested by one of the roots.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustDocument {
    pub schema_version: String,
    pub governance_roots: Vec<TrustKey>,
    #[serde(default)]
    pub time_authorities: Vec<TrustKey>,
    #[serde(default)]
    pub pricing_signers: Vec<TrustKey>,
    pub signer_key_id: String,
    /// base64 Ed25519 over sha256(canonical(document with signature null)).
    pub signature: Option<String>,
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Byte-stable verification report. Carries no clocks, paths or locale-
/// dependent text.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub schema_version: String,
    pub status: CheckStatus,
    pub strict: bool,
    pub checks: Vec<Check>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.status != CheckStatus::Failed
    }

    /// Canonical JSON plus one trailing newline for the terminal. The
    /// newline is outside any hash input.
    pub fn to_canonical_json(&self) -> Result<String, SettldError> {
        let value = serde_json::to_value(self)
            .map_err(|e| SettldError::Serialization(e.to_string()))?;
        Ok(format!("{}\n", settld_canon::canonical_string(&value)?))
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

pub struct JobProofBundle {
    pub dir: PathBuf,
    pub trust: TrustDocument,
    pub events: Vec<ChainedEvent>,
    pub policy: serde_json::Value,
    pub record: SettlementDecisionRecord,
    pub receipt: SettlementReceipt,
    pub evidence: serde_json::Value,
    pub sums: BTreeMap<String, String>,
}

fn read_file(dir: &Path, name: &str) -> anyhow::Result<Vec<u8>> {
    let path = dir.join(name);
    std::fs::read(&path).map_err(|e| anyhow::anyhow!("{name}: {e}"))
}

fn parse_sums(text: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let mut sums = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (digest, name) = line
            .split_once("  ")
            .ok_or_else(|| anyhow::anyhow!("malformed SHA256SUMS line: {line}"))?;
        sums.insert(name.trim().to_string(), digest.to_string());
    }
    Ok(sums)
}

impl JobProofBundle {
    /// Load every file of the bundle. I/O or parse failures are input errors
    /// (CLI exit code 2), not verification failures.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let trust: TrustDocument = serde_json::from_slice(&read_file(dir, BUNDLE_TRUST_FILE)?)?;
        let events_text = String::from_utf8(read_file(dir, BUNDLE_EVENTS_FILE)?)?;
        let mut events = Vec::new();
        for line in events_text.lines() {
            let line = line.trim();
            if !line.is_empty() {
                events.push(serde_json::from_str(line)?);
            }
        }
        let policy = serde_json::from_slice(&read_file(dir, BUNDLE_POLICY_FILE)?)?;
        let record = serde_json::from_slice(&read_file(dir, BUNDLE_DECISION_FILE)?)?;
        let receipt = serde_json::from_slice(&read_file(dir, BUNDLE_RECEIPT_FILE)?)?;
        let evidence = serde_json::from_slice(&read_file(dir, BUNDLE_EVIDENCE_FILE)?)?;
        let sums = parse_sums(&String::from_utf8(read_file(dir, BUNDLE_SUMS_FILE)?)?)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            trust,
            events,
            policy,
            record,
            receipt,
            evidence,
            sums,
        })
    }

    /// Verify the bundle. `hash_concurrency` bounds parallel file hashing.
    pub async fn verify(&self, strict: bool, hash_concurrency: usize) -> VerifyReport {
        let mut checks = Vec::new();

        checks.push(self.check_sums(hash_concurrency.max(1)).await);
        checks.push(self.check_event_chains());
        checks.push(self.check_settlement_binding());
        checks.push(self.check_decision_anchoring());
        checks.push(self.check_policy_hash());
        checks.push(self.check_trust_roots());

        let status = if checks.iter().any(|c| c.status == CheckStatus::Failed)
            || (strict && checks.iter().any(|c| c.status == CheckStatus::Warning))
        {
            CheckStatus::Failed
        } else if checks.iter().any(|c| c.status == CheckStatus::Warning) {
            CheckStatus::Warning
        } else {
            CheckStatus::Ok
        };

        VerifyReport {
            schema_version: "SettldJobProofReport.v1".to_string(),
            status,
            strict,
            checks,
        }
    }

    // ── Individual checks ────────────────────────────────────────────────────

    async fn check_sums(&self, concurrency: usize) -> Check {
        let expected: Vec<(String, String)> = self
            .sums
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if expected.is_empty() {
            return Check {
                name: "sha256sums".into(),
                status: CheckStatus::Failed,
                detail: Some("SHA256SUMS is empty".into()),
            };
        }

        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut tasks = Vec::new();
        for (name, digest) in expected {
            let permit = Arc::clone(&semaphore);
            let path = self.dir.join(&name);
            tasks.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore");
                let actual = tokio::task::spawn_blocking(move || {
                    std::fs::read(&path).map(|bytes| sha256_hex(&bytes))
                })
                .await
                .expect("hash task");
                (name, digest, actual)
            }));
        }

        let mut mismatches = Vec::new();
        for task in tasks {
            let (name, digest, actual) = task.await.expect("hash task join");
            match actual {
                Ok(actual) if actual == digest => {}
                Ok(_) => mismatches.push(format!("{name}: digest mismatch")),
                Err(e) => mismatches.push(format!("{name}: {e}")),
            }
        }
        mismatches.sort();

        if mismatches.is_empty() {
            Check {
                name: "sha256sums".into(),
                status: CheckStatus::Ok,
                detail: None,
            }
        } else {
            Check {
                name: "sha256sums".into(),
                status: CheckStatus::Failed,
                detail: Some(mismatches.join("; ")),
            }
        }
    }

    fn check_event_chains(&self) -> Check {
        // Events arrive interleaved across streams; each stream must chain.
        let mut streams: BTreeMap<&str, Vec<ChainedEvent>> = BTreeMap::new();
        for event in &self.events {
            streams
                .entry(event.stream_id.as_str())
                .or_default()
                .push(event.clone());
        }
        for (stream_id, events) in &streams {
            if let Err(e) = verify_stream(events) {
                return Check {
                    name: "event-chain".into(),
                    status: CheckStatus::Failed,
                    detail: Some(format!("{stream_id}: {}", e.code())),
                };
            }
        }
        Check {
            name: "event-chain".into(),
            status: CheckStatus::Ok,
            detail: None,
        }
    }

    fn check_settlement_binding(&self) -> Check {
        match verify_settlement_binding(&self.record, &self.receipt) {
            Ok(()) => Check {
                name: "settlement-binding".into(),
                status: CheckStatus::Ok,
                detail: None,
            },
            Err(e) => Check {
                name: "settlement-binding".into(),
                status: CheckStatus::Failed,
                detail: Some(e.code().to_string()),
            },
        }
    }

    /// The decision must pin a chain position that exists in the event log.
    fn check_decision_anchoring(&self) -> Check {
        let anchored = self.events.iter().any(|e| {
            e.chain_hash == self.record.run_last_chain_hash
                && e.event_id == self.record.run_last_event_id
        });
        if anchored {
            Check {
                name: "decision-anchoring".into(),
                status: CheckStatus::Ok,
                detail: None,
            }
        } else {
            Check {
                name: "decision-anchoring".into(),
                status: CheckStatus::Failed,
                detail: Some("runLastChainHash not present in event log".into()),
            }
        }
    }

    fn check_policy_hash(&self) -> Check {
        let computed = settld_canon::canonical_bytes(&self.policy)
            .map(|bytes| sha256_hex(&bytes));
        match computed {
            Ok(hash) if hash == self.record.policy_ref.policy_hash => Check {
                name: "policy-hash".into(),
                status: CheckStatus::Ok,
                detail: None,
            },
            Ok(_) => Check {
                name: "policy-hash".into(),
                status: CheckStatus::Warning,
                detail: Some("policy snapshot hash differs from policyRef".into()),
            },
            Err(e) => Check {
                name: "policy-hash".into(),
                status: CheckStatus::Failed,
                detail: Some(e.code().to_string()),
            },
        }
    }

    /// The trust document must be signed by a key that is itself among the
    /// governance roots. Rotation keeps old and new roots in the list; once
    /// the old root is dropped, a bundle signed with it no longer verifies.
    fn check_trust_roots(&self) -> Check {
        let Some(signature) = self.trust.signature.as_deref() else {
            return Check {
                name: "trust-roots".into(),
                status: CheckStatus::Warning,
                detail: Some("trust document is unsigned".into()),
            };
        };
        let signer = self
            .trust
            .governance_roots
            .iter()
            .find(|k| k.key_id == self.trust.signer_key_id);
        let Some(signer) = signer else {
            return Check {
                name: "trust-roots".into(),
                status: CheckStatus::Warning,
                detail: Some(format!(
                    "governance policy signerKeyId not trusted: {}",
                    self.trust.signer_key_id
                )),
            };
        };

        let mut unsigned = self.trust.clone();
        unsigned.signature = None;
        let hash = match settld_crypto::canonical_sha256_hex(&unsigned) {
            Ok(h) => h,
            Err(e) => {
                return Check {
                    name: "trust-roots".into(),
                    status: CheckStatus::Failed,
                    detail: Some(e.code().to_string()),
                }
            }
        };
        if verify_hash_hex(&hash, signature, &signer.public_key_pem) {
            Check {
                name: "trust-roots".into(),
                status: CheckStatus::Ok,
                detail: None,
            }
        } else {
            Check {
                name: "trust-roots".into(),
                status: CheckStatus::Failed,
                detail: Some("trust document signature does not verify".into()),
            }
        }
    }
}
