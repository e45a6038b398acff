//! Event types for inter-component communication.
//!
//! The relay publishes typed events over a broadcast bus instead of
//! registering per-job callbacks, so observers subscribe once and the
//! settlement pipeline stays free of callback ordering concerns. Events
//! carry enough context to be logged or shipped as-is.

use serde::{Deserialize, Serialize};

use crate::job::JobState;
use crate::transaction::OutPoint;

/// Main event type encompassing all relay events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayEvent {
	/// Events from the durable job queue.
	Job(JobEvent),
	/// Events from the settlement state machine.
	Settlement(SettlementEvent),
	/// Events from the paymaster cell allocator.
	Paymaster(PaymasterEvent),
	/// Events from the missing-transaction reconciler.
	Reconcile(ReconcileEvent),
}

/// Queue lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
	/// A job entered the queue (first submission only; duplicate
	/// submissions of a live id are absorbed silently).
	Enqueued { id: String },
	/// A worker picked the job up.
	Started { id: String, attempt: u32 },
	/// The job finished; `return_value` is the CKB transaction hash.
	Completed { id: String, return_value: String },
	/// The job deferred itself while waiting on an external event.
	Deferred {
		id: String,
		reason: String,
		delay_secs: u64,
	},
	/// An attempt failed; the job will retry with backoff.
	AttemptFailed {
		id: String,
		attempt: u32,
		error: String,
	},
	/// The job exhausted its attempts or hit a fatal error.
	Failed { id: String, error: String },
	/// A failed job was re-armed (operator retry or reconciler).
	Retried { id: String, new_state: JobState },
}

/// Settlement state machine progress events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SettlementEvent {
	/// Cross-chain commitment verified against the Bitcoin transaction.
	Verified { id: String },
	/// RGB++ unlock witness appended to the CKB transaction.
	WitnessesAppended { id: String },
	/// A paymaster cell was spliced into the transaction.
	PaymasterAppended { id: String, out_point: OutPoint },
	/// The completed transaction was sent to the CKB node.
	Broadcast { id: String, tx_hash: String },
	/// The CKB transaction reached a committed state.
	Confirmed { id: String, tx_hash: String },
}

/// Paymaster pool events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaymasterEvent {
	Leased { out_point: OutPoint, job_id: String },
	Spent { out_point: OutPoint },
	Returned { out_point: OutPoint },
	Refilled { added: usize },
}

/// Reconciler sweep events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReconcileEvent {
	/// A sweep began over the given height range.
	Started { from: u64, to: u64 },
	/// A tick found a previous run still in flight and skipped itself.
	Skipped,
	/// A failed job's txid was found confirmed and the job re-armed.
	JobRequeued { id: String, height: u64 },
	/// The cursor advanced and was persisted.
	CursorAdvanced { height: u64 },
}
