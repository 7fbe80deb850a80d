//! Signer capability.
//!
//! Everything that attests an artifact hash goes through the [`Signer`] trait
//! so the kernel never cares where the key lives. Three backends:
//!
//! - [`InProcessSigner`] — a local [`KeyPair`]
//! - [`SubprocessSigner`] — a child process speaking line-delimited JSON
//!   (one object per line, flush on newline; the framing is normative)
//! - [`RemoteSigner`] — an HTTPS signing service reached through [`HttpFetch`]
//!
//! Bearer tokens and signer header values are secrets: they are never
//! serialized into errors, logs, or artifacts.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use settld_core::SettldError;

use crate::keypair::KeyPair;

// ── Trait ─────────────────────────────────────────────────────────────────────

pub trait Signer: Send + Sync {
    /// keyId of the key this signer attests with.
    fn key_id(&self) -> Result<String, SettldError>;

    /// base64 Ed25519 signature over the raw 32-byte digest behind `hash_hex`.
    fn sign_hash_hex(&self, hash_hex: &str) -> Result<String, SettldError>;
}

// ── HTTP capability ───────────────────────────────────────────────────────────

/// The single HTTP injection point shared by the remote signer, the JWKS
/// cache, and any other outbound call the kernel makes. Tests substitute a
/// canned implementation.
pub trait HttpFetch: Send + Sync {
    fn get_json(&self, url: &str) -> Result<serde_json::Value, SettldError>;

    fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, SettldError>;
}

/// Production implementation over a blocking reqwest client.
pub struct ReqwestFetch {
    client: reqwest::blocking::Client,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Default for ReqwestFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetch for ReqwestFetch {
    fn get_json(&self, url: &str) -> Result<serde_json::Value, SettldError> {
        self.client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| SettldError::SignerBadResponse {
                reason: e.without_url().to_string(),
            })
    }

    fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
    ) -> Result<serde_json::Value, SettldError> {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        req.send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            // without_url: reqwest error text may embed userinfo; the token
            // itself is only ever in the header and never echoed.
            .map_err(|e| SettldError::SignerBadResponse {
                reason: e.without_url().to_string(),
            })
    }
}

// ── In-process ────────────────────────────────────────────────────────────────

pub struct InProcessSigner {
    keypair: KeyPair,
}

impl InProcessSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    pub fn public_key_pem(&self) -> &str {
        self.keypair.public_key_pem()
    }
}

impl Signer for InProcessSigner {
    fn key_id(&self) -> Result<String, SettldError> {
        Ok(self.keypair.key_id().to_string())
    }

    fn sign_hash_hex(&self, hash_hex: &str) -> Result<String, SettldError> {
        crate::ed25519::sign_hash_hex(hash_hex, &self.keypair)
    }
}

// ── Subprocess (line-delimited JSON) ──────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase", tag = "op")]
enum SignerRequest<'a> {
    Describe,
    #[serde(rename_all = "camelCase")]
    Sign { hash_hex: &'a str },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignerResponse {
    #[serde(default)]
    key_id: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Child-process signer. Protocol: one JSON object per line on stdin, one per
/// line on stdout, flushed on every newline. The child owns the key; this
/// process never sees secret material.
pub struct SubprocessSigner {
    child: Mutex<SubprocessIo>,
    key_id: String,
}

struct SubprocessIo {
    child: Child,
    stdin: std::process::ChildStdin,
    stdout: BufReader<std::process::ChildStdout>,
}

impl SubprocessSigner {
    /// Spawn `program args…` and perform the describe handshake.
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, SettldError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SettldError::SignerPluginLoadFailed {
                reason: format!("{program}: {e}"),
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SettldError::SignerPluginLoadFailed {
                reason: "child stdin unavailable".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| SettldError::SignerPluginLoadFailed {
                reason: "child stdout unavailable".to_string(),
            })?;
        let mut io = SubprocessIo {
            child,
            stdin,
            stdout,
        };
        let resp = Self::round_trip(&mut io, &SignerRequest::Describe)?;
        let key_id = resp
            .key_id
            .ok_or_else(|| SettldError::SignerBadResponse {
                reason: "describe response missing keyId".to_string(),
            })?;
        Ok(Self {
            child: Mutex::new(io),
            key_id,
        })
    }

    fn round_trip(
        io: &mut SubprocessIo,
        req: &SignerRequest<'_>,
    ) -> Result<SignerResponse, SettldError> {
        let line =
            serde_json::to_string(req).map_err(|e| SettldError::Serialization(e.to_string()))?;
        io.stdin
            .write_all(line.as_bytes())
            .and_then(|_| io.stdin.write_all(b"\n"))
            .and_then(|_| io.stdin.flush())
            .map_err(|e| SettldError::SignerBadResponse {
                reason: format!("write: {e}"),
            })?;
        let mut resp_line = String::new();
        io.stdout
            .read_line(&mut resp_line)
            .map_err(|e| SettldError::SignerBadResponse {
                reason: format!("read: {e}"),
            })?;
        if resp_line.is_empty() {
            return Err(SettldError::SignerBadResponse {
                reason: "child closed stdout".to_string(),
            });
        }
        let resp: SignerResponse =
            serde_json::from_str(resp_line.trim_end()).map_err(|e| {
                SettldError::SignerBadResponse {
                    reason: format!("frame: {e}"),
                }
            })?;
        if let Some(err) = resp.error {
            return Err(SettldError::SignerBadResponse { reason: err });
        }
        Ok(resp)
    }
}

impl Signer for SubprocessSigner {
    fn key_id(&self) -> Result<String, SettldError> {
        Ok(self.key_id.clone())
    }

    fn sign_hash_hex(&self, hash_hex: &str) -> Result<String, SettldError> {
        let mut io = self
            .child
            .lock()
            .map_err(|_| SettldError::SignerBadResponse {
                reason: "signer mutex poisoned".to_string(),
            })?;
        let resp = Self::round_trip(&mut io, &SignerRequest::Sign { hash_hex })?;
        resp.signature
            .ok_or_else(|| SettldError::SignerBadResponse {
                reason: "sign response missing signature".to_string(),
            })
    }
}

impl Drop for SubprocessSigner {
    fn drop(&mut self) {
        if let Ok(mut io) = self.child.lock() {
            let _ = io.child.kill();
            let _ = io.child.wait();
        }
    }
}

// ── Remote (HTTPS) ────────────────────────────────────────────────────────────

/// Signing service reached over HTTPS. The expected keyId is pinned at
/// construction; a service answering with a different key fails closed.
pub struct RemoteSigner {
    http: Box<dyn HttpFetch>,
    url: String,
    bearer: Option<String>,
    expected_key_id: String,
}

impl RemoteSigner {
    pub fn new(
        http: Box<dyn HttpFetch>,
        url: String,
        bearer: Option<String>,
        expected_key_id: String,
    ) -> Self {
        Self {
            http,
            url,
            bearer,
            expected_key_id,
        }
    }
}

impl Signer for RemoteSigner {
    fn key_id(&self) -> Result<String, SettldError> {
        Ok(self.expected_key_id.clone())
    }

    fn sign_hash_hex(&self, hash_hex: &str) -> Result<String, SettldError> {
        let bearer = self
            .bearer
            .as_deref()
            .ok_or(SettldError::SignerAuthMissing)?;
        let body = serde_json::json!({ "hashHex": hash_hex });
        let resp = self.http.post_json(&self.url, &body, Some(bearer))?;
        let key_id = resp
            .get("keyId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SettldError::SignerBadResponse {
                reason: "response missing keyId".to_string(),
            })?;
        if key_id != self.expected_key_id {
            return Err(SettldError::RemoteSignerKeyMismatch {
                expected: self.expected_key_id.clone(),
                got: key_id.to_string(),
            });
        }
        resp.get("signature")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| SettldError::SignerBadResponse {
                reason: "response missing signature".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sha256_hex, verify_hash_hex};

    struct CannedFetch {
        key_id: String,
        signer: InProcessSigner,
    }

    impl HttpFetch for CannedFetch {
        fn get_json(&self, _url: &str) -> Result<serde_json::Value, SettldError> {
            unreachable!("remote signer only posts")
        }

        fn post_json(
            &self,
            _url: &str,
            body: &serde_json::Value,
            bearer: Option<&str>,
        ) -> Result<serde_json::Value, SettldError> {
            assert_eq!(bearer, Some("token-abc"));
            let hash_hex = body["hashHex"].as_str().unwrap();
            Ok(serde_json::json!({
                "keyId": self.key_id,
                "signature": self.signer.sign_hash_hex(hash_hex)?,
            }))
        }
    }

    #[test]
    fn in_process_signer_round_trips() {
        let kp = KeyPair::generate();
        let pem = kp.public_key_pem().to_string();
        let signer = InProcessSigner::new(kp);
        let digest = sha256_hex(b"artifact");
        let sig = signer.sign_hash_hex(&digest).unwrap();
        assert!(verify_hash_hex(&digest, &sig, &pem));
    }

    #[test]
    fn remote_signer_verifies_key_id() {
        let kp = KeyPair::generate();
        let key_id = kp.key_id().to_string();
        let fetch = CannedFetch {
            key_id: key_id.clone(),
            signer: InProcessSigner::new(kp),
        };
        let remote = RemoteSigner::new(
            Box::new(fetch),
            "https://signer.example/sign".into(),
            Some("token-abc".into()),
            key_id,
        );
        let digest = sha256_hex(b"artifact");
        remote.sign_hash_hex(&digest).unwrap();
    }

    #[test]
    fn remote_signer_rejects_key_mismatch() {
        let kp = KeyPair::generate();
        let fetch = CannedFetch {
            key_id: "key_somethingelse".into(),
            signer: InProcessSigner::new(kp),
        };
        let remote = RemoteSigner::new(
            Box::new(fetch),
            "https://signer.example/sign".into(),
            Some("token-abc".into()),
            "key_expected".into(),
        );
        let err = remote.sign_hash_hex(&sha256_hex(b"x")).unwrap_err();
        assert_eq!(err.code(), "REMOTE_SIGNER_KEY_MISMATCH");
    }

    #[test]
    fn remote_signer_without_auth_fails_closed() {
        let kp = KeyPair::generate();
        let key_id = kp.key_id().to_string();
        let fetch = CannedFetch {
            key_id: key_id.clone(),
            signer: InProcessSigner::new(kp),
        };
        let remote = RemoteSigner::new(
            Box::new(fetch),
            "https://signer.example/sign".into(),
            None,
            key_id,
        );
        let err = remote.sign_hash_hex(&sha256_hex(b"x")).unwrap_err();
        assert_eq!(err.code(), "SIGNER_AUTH_MISSING");
    }
}
