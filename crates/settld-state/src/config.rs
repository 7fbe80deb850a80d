use settld_core::{SettldError, ENV_PREFIX, LEGACY_ENV_PREFIX};

/// Engine configuration.
///
/// Loaded from `SETTLD_`-prefixed environment variables. The legacy
/// `NOOTERRA_` prefix is rejected outright: a deployment still carrying it
/// gets a config error naming the variable instead of silently differing
/// from what its operators believe is configured.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Well-known URL serving the NooterraPay keyset.
    pub keyset_url: String,
    /// Trusted wallet-issuer public key PEMs (decision tokens).
    pub wallet_issuer_pems: Vec<String>,
    /// Maximum outbox messages drained per maintenance tick.
    pub outbox_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keyset_url: "https://pay.settld.dev/.well-known/nooterra-pay-keys".to_string(),
            wallet_issuer_pems: Vec::new(),
            outbox_batch_size: settld_core::OUTBOX_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    /// Build from the process environment. Fails closed when any legacy
    /// `NOOTERRA_`-prefixed variable is present.
    pub fn from_env() -> Result<Self, SettldError> {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    fn from_vars(vars: &[(String, String)]) -> Result<Self, SettldError> {
        if let Some((name, _)) = vars.iter().find(|(k, _)| k.starts_with(LEGACY_ENV_PREFIX)) {
            return Err(SettldError::Config {
                reason: format!(
                    "legacy variable {name} is no longer honoured; rename it to the {ENV_PREFIX} prefix"
                ),
            });
        }

        let mut config = Self::default();
        for (key, value) in vars {
            match key.as_str() {
                "SETTLD_KEYSET_URL" => config.keyset_url = value.clone(),
                "SETTLD_WALLET_ISSUER_PEMS" => {
                    // PEM blocks separated by a blank line.
                    config.wallet_issuer_pems = value
                        .split("\n\n")
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "SETTLD_OUTBOX_BATCH_SIZE" => {
                    config.outbox_batch_size = value.parse().map_err(|_| SettldError::Config {
                        reason: format!("SETTLD_OUTBOX_BATCH_SIZE not an integer: {value}"),
                    })?;
                }
                _ => {}
            }
        }
        Ok(config)
    }
}
