//! settld-pay
//!
//! The payment surface of the gate: NooterraPay challenge tokens, the
//! published keyset and its TTL cache, the `x-payment-required` challenge
//! header, provider quotes, and provider response signatures.

pub mod headers;
pub mod keyset;
pub mod quote;
pub mod token;

pub use headers::{GatewayHeaders, PaymentRequiredChallenge};
pub use keyset::{KeysetCache, KeysetKey, PayKeyset};
pub use quote::{
    provider_response_payload_hash, sign_provider_response, verify_provider_response,
    ProviderQuote, QuoteSignature,
};
pub use token::{DecisionTokenClaims, PayTokenClaims};
