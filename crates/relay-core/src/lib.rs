//! Core engine for the RGB++ relay system.
//!
//! This module wires the relay together: the settlement state machine
//! consuming jobs from the durable queue, the missing-transaction
//! reconciler, the typed event bus, and the [`RelayEngine`] facade
//! external callers use to submit and inspect transaction requests.

/// Event bus for inter-component communication.
pub mod event_bus;
/// Missing-transaction reconciliation sweep.
pub mod reconciler;
/// Transaction settlement state machine.
pub mod settler;

mod engine;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Providers, RelayEngine, RelayError};
pub use event_bus::EventBus;
pub use reconciler::{Reconciler, ReconcilerOptions, TickResult};
pub use settler::{FeeCheck, SettleJob, Settler, SettlerConfig};
