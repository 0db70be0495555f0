//! Multi-source, point-in-time reconciliation.

pub mod ledger;
pub mod pit;
pub mod priority;

pub use ledger::PitLedger;
pub use pit::{PitReconciler, Reconciliation};
pub use priority::{SourcePriority, SourcePriorityResolver};
