//! # Application Service
//!
//! Inbound side of the bridge: the HTTP endpoints the homeserver pushes to,
//! the transaction ledger that makes redelivery harmless, and the processor
//! that routes each event.

pub mod ledger;
pub mod processor;
pub mod webhook;

pub use ledger::TransactionLedger;
pub use processor::{
    EventHandler, EventOutcome, IgnoreReason, TransactionProcessor, TransactionReport,
};
pub use webhook::{router, AppServiceState};
