pub mod clock;
pub mod config;
pub mod db;
pub mod dispute;
pub mod engine;
pub mod gate;
pub mod grants;
pub mod wallet;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use db::{IdempotencyRecord, OutboxKind, OutboxMessage, SettlementBundle, StateDb};
pub use dispute::{BindingEvidence, OpenArbitrationParams, OpenDisputeParams};
pub use engine::StateEngine;
pub use gate::{
    AuthorizeParams, ChallengeBundle, CreateGateParams, ProviderSubmission, SettlementOutcome,
    VerifyParams,
};
pub use grants::evaluate_grant_call;
