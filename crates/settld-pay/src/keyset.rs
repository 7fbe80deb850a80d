use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use settld_core::{IsoMillis, KeyId, SettldError, NOOTERRA_PAY_KEYSET_SCHEMA};
use settld_crypto::HttpFetch;
use tracing::warn;

// ── Keyset document ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeysetKey {
    pub key_id: KeyId,
    pub public_key_pem: String,
}

/// The NooterraPay keyset served under the well-known URL:
/// `{ schemaVersion: "NooterraPayKeyset.v1", refreshedAt, activeKey,
/// fallbackKeys, maxAgeSec }`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PayKeyset {
    pub schema_version: String,
    pub refreshed_at: IsoMillis,
    pub active_key: KeysetKey,
    #[serde(default)]
    pub fallback_keys: Vec<KeysetKey>,
    pub max_age_sec: i64,
}

impl PayKeyset {
    /// Active key first, then fallbacks, in published order.
    pub fn all_keys(&self) -> impl Iterator<Item = &KeysetKey> {
        std::iter::once(&self.active_key).chain(self.fallback_keys.iter())
    }

    pub fn find_pem(&self, key_id: &str) -> Option<&str> {
        self.all_keys()
            .find(|k| k.key_id == key_id)
            .map(|k| k.public_key_pem.as_str())
    }
}

// ── TTL cache ─────────────────────────────────────────────────────────────────

struct CachedKeyset {
    keyset: PayKeyset,
    fetched_at: IsoMillis,
}

/// Read-mostly keyset cache. Entries live for the keyset's own `maxAgeSec`;
/// a stale entry is never served — if the refresh fails past expiry the gate
/// fails closed with `X402_KEYSET_STALE`.
pub struct KeysetCache {
    http: Box<dyn HttpFetch>,
    url: String,
    cached: Mutex<Option<CachedKeyset>>,
}

impl KeysetCache {
    pub fn new(http: Box<dyn HttpFetch>, url: String) -> Self {
        Self {
            http,
            url,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self, now: IsoMillis) -> Result<PayKeyset, SettldError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| SettldError::Storage("keyset cache mutex poisoned".to_string()))?;

        if let Some(entry) = cached.as_ref() {
            let age_secs =
                (now.timestamp_millis() - entry.fetched_at.timestamp_millis()) / 1000;
            if age_secs <= entry.keyset.max_age_sec {
                return Ok(entry.keyset.clone());
            }
        }

        match self.fetch() {
            Ok(keyset) => {
                *cached = Some(CachedKeyset {
                    keyset: keyset.clone(),
                    fetched_at: now,
                });
                Ok(keyset)
            }
            Err(e) => {
                warn!(error = %e, "keyset refresh failed");
                // Stale entries must not be used after expiry.
                Err(SettldError::KeysetStale)
            }
        }
    }

    fn fetch(&self) -> Result<PayKeyset, SettldError> {
        let value = self.http.get_json(&self.url)?;
        let keyset: PayKeyset = serde_json::from_value(value)
            .map_err(|e| SettldError::Serialization(e.to_string()))?;
        if keyset.schema_version != NOOTERRA_PAY_KEYSET_SCHEMA {
            return Err(SettldError::Serialization(format!(
                "unexpected keyset schema {}",
                keyset.schema_version
            )));
        }
        Ok(keyset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settld_crypto::KeyPair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(s: &str) -> IsoMillis {
        IsoMillis::parse(s).unwrap()
    }

    struct FetchState {
        keyset: serde_json::Value,
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    struct CountingFetch(std::sync::Arc<FetchState>);

    impl HttpFetch for CountingFetch {
        fn get_json(&self, _url: &str) -> Result<serde_json::Value, SettldError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            if self.0.fail.load(Ordering::SeqCst) {
                return Err(SettldError::SignerBadResponse {
                    reason: "down".into(),
                });
            }
            Ok(self.0.keyset.clone())
        }

        fn post_json(
            &self,
            _url: &str,
            _body: &serde_json::Value,
            _bearer: Option<&str>,
        ) -> Result<serde_json::Value, SettldError> {
            unreachable!()
        }
    }

    fn keyset_json(kp: &KeyPair, max_age_sec: i64) -> serde_json::Value {
        serde_json::json!({
            "schemaVersion": "NooterraPayKeyset.v1",
            "refreshedAt": "2026-08-01T00:00:00.000Z",
            "activeKey": { "keyId": kp.key_id(), "publicKeyPem": kp.public_key_pem() },
            "fallbackKeys": [],
            "maxAgeSec": max_age_sec,
        })
    }

    #[test]
    fn cache_serves_within_ttl_without_refetch() {
        let kp = KeyPair::generate();
        let state = std::sync::Arc::new(FetchState {
            keyset: keyset_json(&kp, 300),
            calls: AtomicUsize::new(0),
            fail: Default::default(),
        });
        let cache = KeysetCache::new(
            Box::new(CountingFetch(state.clone())),
            "https://pay.example/keys".into(),
        );
        cache.get(t("2026-08-01T00:00:00.000Z")).unwrap();
        cache.get(t("2026-08-01T00:04:00.000Z")).unwrap();
        assert_eq!(state.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_cache_past_ttl_fails_closed_when_refresh_fails() {
        let kp = KeyPair::generate();
        let state = std::sync::Arc::new(FetchState {
            keyset: keyset_json(&kp, 60),
            calls: AtomicUsize::new(0),
            fail: Default::default(),
        });
        let cache = KeysetCache::new(
            Box::new(CountingFetch(state.clone())),
            "https://pay.example/keys".into(),
        );
        cache.get(t("2026-08-01T00:00:00.000Z")).unwrap();
        // Make the next refresh fail after expiry.
        state.fail.store(true, Ordering::SeqCst);
        let err = cache.get(t("2026-08-01T00:10:00.000Z")).unwrap_err();
        assert_eq!(err.code(), "X402_KEYSET_STALE");
    }

    #[test]
    fn find_pem_checks_active_then_fallbacks() {
        let active = KeyPair::generate();
        let fallback = KeyPair::generate();
        let keyset = PayKeyset {
            schema_version: NOOTERRA_PAY_KEYSET_SCHEMA.to_string(),
            refreshed_at: t("2026-08-01T00:00:00.000Z"),
            active_key: KeysetKey {
                key_id: active.key_id().to_string(),
                public_key_pem: active.public_key_pem().to_string(),
            },
            fallback_keys: vec![KeysetKey {
                key_id: fallback.key_id().to_string(),
                public_key_pem: fallback.public_key_pem().to_string(),
            }],
            max_age_sec: 300,
        };
        assert!(keyset.find_pem(active.key_id()).is_some());
        assert!(keyset.find_pem(fallback.key_id()).is_some());
        assert!(keyset.find_pem("key_missing").is_none());
    }
}
