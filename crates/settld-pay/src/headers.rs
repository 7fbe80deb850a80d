//! Wire header codecs for the challenge and settlement surfaces.
//!
//! The challenge header is parsed field-by-field, never by regex or split-all:
//! unknown fields are ignored, missing required fields are errors, and the
//! formatter emits fields in one fixed order so the header is byte-stable.

use settld_core::{
    Cents, SettldError, HDR_GATE_ID, HDR_HOLDBACK_AMOUNT, HDR_HOLDBACK_STATUS,
    HDR_REFUNDED_AMOUNT, HDR_RELEASED_AMOUNT, HDR_SETTLEMENT_STATUS,
};

// ── x-payment-required ────────────────────────────────────────────────────────

/// Parsed form of
/// `x-payment-required: amountCents=<int>; currency=<3-letter>; providerId=<s>; toolId=<s>; nonce=<s>`.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentRequiredChallenge {
    pub amount_cents: Cents,
    pub currency: String,
    pub provider_id: String,
    pub tool_id: Option<String>,
    pub nonce: String,
}

impl PaymentRequiredChallenge {
    pub fn format(&self) -> String {
        let mut s = format!(
            "amountCents={}; currency={}; providerId={}",
            self.amount_cents, self.currency, self.provider_id
        );
        if let Some(tool_id) = &self.tool_id {
            s.push_str(&format!("; toolId={tool_id}"));
        }
        s.push_str(&format!("; nonce={}", self.nonce));
        s
    }

    pub fn parse(header: &str) -> Result<Self, SettldError> {
        let mut amount_cents = None;
        let mut currency = None;
        let mut provider_id = None;
        let mut tool_id = None;
        let mut nonce = None;

        for field in header.split(';') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let (key, value) = field.split_once('=').ok_or_else(|| {
                SettldError::Serialization(format!("challenge field without '=': {field}"))
            })?;
            match key {
                "amountCents" => {
                    let parsed: Cents = value.parse().map_err(|_| {
                        SettldError::Serialization(format!("amountCents not an integer: {value}"))
                    })?;
                    amount_cents = Some(parsed);
                }
                "currency" => {
                    if value.len() != 3 {
                        return Err(SettldError::Serialization(format!(
                            "currency must be 3 letters: {value}"
                        )));
                    }
                    currency = Some(value.to_string());
                }
                "providerId" => provider_id = Some(value.to_string()),
                "toolId" => tool_id = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                // Forward compatibility: unknown fields are ignored.
                _ => {}
            }
        }

        Ok(Self {
            amount_cents: amount_cents.ok_or_else(|| {
                SettldError::Serialization("challenge missing amountCents".to_string())
            })?,
            currency: currency.ok_or_else(|| {
                SettldError::Serialization("challenge missing currency".to_string())
            })?,
            provider_id: provider_id.ok_or_else(|| {
                SettldError::Serialization("challenge missing providerId".to_string())
            })?,
            tool_id,
            nonce: nonce
                .ok_or_else(|| SettldError::Serialization("challenge missing nonce".to_string()))?,
        })
    }
}

// ── Gateway settlement headers ────────────────────────────────────────────────

/// The settlement outcome a gateway reports back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayHeaders {
    pub gate_id: String,
    /// One of `released`, `refunded`, `partial`, `disputed`.
    pub settlement_status: String,
    pub released_amount_cents: Cents,
    pub refunded_amount_cents: Cents,
    /// `held` or `released`; only present when the gate carries a holdback.
    pub holdback_status: Option<String>,
    pub holdback_amount_cents: Option<Cents>,
}

impl GatewayHeaders {
    /// Render as `(name, value)` pairs in fixed emission order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            (HDR_GATE_ID.to_string(), self.gate_id.clone()),
            (
                HDR_SETTLEMENT_STATUS.to_string(),
                self.settlement_status.clone(),
            ),
            (
                HDR_RELEASED_AMOUNT.to_string(),
                self.released_amount_cents.to_string(),
            ),
            (
                HDR_REFUNDED_AMOUNT.to_string(),
                self.refunded_amount_cents.to_string(),
            ),
        ];
        if let Some(status) = &self.holdback_status {
            pairs.push((HDR_HOLDBACK_STATUS.to_string(), status.clone()));
        }
        if let Some(amount) = self.holdback_amount_cents {
            pairs.push((HDR_HOLDBACK_AMOUNT.to_string(), amount.to_string()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_round_trips() {
        let c = PaymentRequiredChallenge {
            amount_cents: 1000,
            currency: "USD".into(),
            provider_id: "prov_tools".into(),
            tool_id: Some("tool_search".into()),
            nonce: "n-123".into(),
        };
        let parsed = PaymentRequiredChallenge::parse(&c.format()).unwrap();
        assert_eq!(parsed, c);
    }

    #[test]
    fn challenge_parses_field_by_field_in_any_order() {
        let parsed = PaymentRequiredChallenge::parse(
            "nonce=n-1; providerId=prov_x; amountCents=250; currency=EUR",
        )
        .unwrap();
        assert_eq!(parsed.amount_cents, 250);
        assert_eq!(parsed.currency, "EUR");
        assert_eq!(parsed.tool_id, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let parsed = PaymentRequiredChallenge::parse(
            "amountCents=1; currency=USD; providerId=p; nonce=n; future=thing",
        )
        .unwrap();
        assert_eq!(parsed.amount_cents, 1);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        assert!(PaymentRequiredChallenge::parse("currency=USD; providerId=p; nonce=n").is_err());
        assert!(
            PaymentRequiredChallenge::parse("amountCents=x; currency=USD; providerId=p; nonce=n")
                .is_err()
        );
    }

    #[test]
    fn gateway_headers_omit_holdback_when_absent() {
        let h = GatewayHeaders {
            gate_id: "gate_1".into(),
            settlement_status: "released".into(),
            released_amount_cents: 1000,
            refunded_amount_cents: 0,
            holdback_status: None,
            holdback_amount_cents: None,
        };
        let pairs = h.to_pairs();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[1].1, "released");
        assert!(pairs.iter().all(|(k, _)| !k.contains("holdback")));
    }
}
