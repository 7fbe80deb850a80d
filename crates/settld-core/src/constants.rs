//! ─── Settld Protocol Constants ──────────────────────────────────────────────
//!
//! The settlement kernel for paid agent-to-agent tool calls.
//! All amounts are integer cents; all digests SHA-256 lowercase hex;
//! all signatures Ed25519 over the raw 32-byte digest.

// ── Hashing / chain ──────────────────────────────────────────────────────────

/// `prevChainHash` for the first event on a stream (64 ASCII zeros).
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Hex chars kept when deriving a prefixed id from a digest
/// (`ev_…`, `key_…`, `dec_…`, `rcpt_…`).
pub const ID_HASH_PREFIX_LEN: usize = 24;

// ── Money ────────────────────────────────────────────────────────────────────

/// Basis-point denominator: 10000 bps = 100%.
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Release-rate denominator: releaseRatePct is an integer percentage.
pub const PCT_DENOMINATOR: i64 = 100;

// ── NooterraPay ──────────────────────────────────────────────────────────────

/// `iss` claim on every NooterraPay challenge token.
pub const NOOTERRA_PAY_ISSUER: &str = "nooterra";

/// Schema tag on the published keyset document.
pub const NOOTERRA_PAY_KEYSET_SCHEMA: &str = "NooterraPayKeyset.v1";

/// Default challenge token lifetime (seconds) between `iat` and `exp`.
pub const PAY_TOKEN_TTL_SECS: i64 = 300;

// ── Configuration ────────────────────────────────────────────────────────────

/// Canonical environment-variable prefix. The legacy `NOOTERRA_` prefix is
/// rejected at startup rather than silently honoured.
pub const ENV_PREFIX: &str = "SETTLD_";

/// Legacy prefix that must fail closed when present.
pub const LEGACY_ENV_PREFIX: &str = "NOOTERRA_";

// ── Maintenance loop ─────────────────────────────────────────────────────────

/// Maximum outbox messages drained per tick.
pub const OUTBOX_BATCH_SIZE: usize = 64;

// ── Wire headers (provider challenge / response) ─────────────────────────────

pub const HDR_PAYMENT_REQUIRED: &str = "x-payment-required";
pub const HDR_PROVIDER_QUOTE: &str = "x-nooterra-provider-quote";
pub const HDR_PROVIDER_QUOTE_SIGNATURE: &str = "x-nooterra-provider-quote-signature";
pub const HDR_PROVIDER_KEY_ID: &str = "x-nooterra-provider-key-id";
pub const HDR_PROVIDER_SIGNED_AT: &str = "x-nooterra-provider-signed-at";
pub const HDR_PROVIDER_NONCE: &str = "x-nooterra-provider-nonce";
pub const HDR_PROVIDER_RESPONSE_SHA256: &str = "x-nooterra-provider-response-sha256";
pub const HDR_PROVIDER_SIGNATURE: &str = "x-nooterra-provider-signature";
pub const HDR_PROVIDER_REPLAY: &str = "x-nooterra-provider-replay";

// ── Wire headers (gateway settlement surface) ────────────────────────────────

pub const HDR_GATE_ID: &str = "x-settld-gate-id";
pub const HDR_SETTLEMENT_STATUS: &str = "x-settld-settlement-status";
pub const HDR_RELEASED_AMOUNT: &str = "x-settld-released-amount-cents";
pub const HDR_REFUNDED_AMOUNT: &str = "x-settld-refunded-amount-cents";
pub const HDR_HOLDBACK_STATUS: &str = "x-settld-holdback-status";
pub const HDR_HOLDBACK_AMOUNT: &str = "x-settld-holdback-amount-cents";

// ── Evidence ref prefixes ────────────────────────────────────────────────────

/// Request-binding evidence carried on verify: `http:request_sha256:<hex>`.
pub const EVIDENCE_REQUEST_SHA256: &str = "http:request_sha256:";
/// Response-binding evidence carried on verify: `http:response_sha256:<hex>`.
pub const EVIDENCE_RESPONSE_SHA256: &str = "http:response_sha256:";

// ── Job-proof bundle file names ──────────────────────────────────────────────

pub const BUNDLE_TRUST_FILE: &str = "trust.json";
pub const BUNDLE_EVENTS_FILE: &str = "events.jsonl";
pub const BUNDLE_POLICY_FILE: &str = "policy.json";
pub const BUNDLE_DECISION_FILE: &str = "decision.json";
pub const BUNDLE_RECEIPT_FILE: &str = "receipt.json";
pub const BUNDLE_EVIDENCE_FILE: &str = "evidence.json";
pub const BUNDLE_SUMS_FILE: &str = "SHA256SUMS";
