pub mod event;
pub mod validation;

pub use event::{seal_event, signable_hash, ChainedEvent, EventDraft};
pub use validation::{validate_actor_signature, verify_stream, KeyResolver};
