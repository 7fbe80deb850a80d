//! settld-settlement
//!
//! The settlement kernel: build the decision record and receipt for a run's
//! terminal event, re-verify their mutual and temporal bindings on read, and
//! walk agreement-delegation trees for cascade settlement and refund unwind.
//!
//! Everything here is pure: no storage, no clock, no I/O. The state engine
//! feeds it inputs and persists its outputs.

pub mod cascade;
pub mod kernel;

pub use cascade::{cascade_settlement_check, refund_unwind_check};
pub use kernel::{
    build_decision_record, build_receipt, verify_settlement_binding, DecisionInputs,
    ReceiptInputs,
};
