pub mod agent;
pub mod constants;
pub mod dispute;
pub mod error;
pub mod gate;
pub mod grant;
pub mod settlement;
pub mod types;
pub mod wallet;

pub use agent::*;
pub use constants::*;
pub use dispute::{
    ArbitrationCase, CaseStatus, Dispute, DisputeStatus, Verdict, VerdictOutcome,
};
pub use error::{SettldError, WireError};
pub use gate::*;
pub use grant::*;
pub use settlement::{
    AgreementDelegation, Bindings, DecisionMode, DecisionRef, DecisionStatus, FundingHold,
    HoldStatus, PolicyRef, ReceiptStatus, SettlementDecisionRecord, SettlementReceipt,
    VerifierRef,
};
pub use types::*;
pub use wallet::Wallet;
