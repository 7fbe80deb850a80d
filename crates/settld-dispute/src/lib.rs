//! settld-dispute
//!
//! Pure pieces of the dispute/arbitration overlay: the verdict envelope
//! (hash, sign, verify) and the dispute-window arithmetic. Application of
//! these onto gates and receipts lives in the state engine.

pub mod verdict;
pub mod window;

pub use verdict::{sign_verdict, verdict_hash, verify_verdict_signature};
pub use window::{dispute_window_closes_at, dispute_window_open};
