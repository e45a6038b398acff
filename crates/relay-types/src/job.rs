//! Queue-level job types wrapping transaction requests.

use serde::{Deserialize, Serialize};

use crate::utils::now_secs;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
	/// Ready to be picked up by a worker.
	Waiting,
	/// Scheduled to wake at a later time.
	Delayed,
	/// Currently held by a worker under a processing lease.
	Active,
	/// Finished successfully; `return_value` holds the result.
	Completed,
	/// Exhausted its attempts; `last_error` holds the final error.
	Failed,
}

impl JobState {
	/// Terminal states accept no further processing.
	pub fn is_terminal(&self) -> bool {
		matches!(self, JobState::Completed | JobState::Failed)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			JobState::Waiting => "waiting",
			JobState::Delayed => "delayed",
			JobState::Active => "active",
			JobState::Completed => "completed",
			JobState::Failed => "failed",
		}
	}
}

/// A durable queue entry.
///
/// Generic over its payload so the queue stays reusable; the settlement
/// pipeline instantiates it with `TransactionRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<P> {
	/// Unique id; for settlement jobs this is the Bitcoin txid.
	pub id: String,
	pub state: JobState,
	pub payload: P,
	/// Failed attempts so far. Controlled deferrals do not count.
	pub attempts_made: u32,
	pub max_attempts: u32,
	/// Result recorded on completion (the CKB transaction hash).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub return_value: Option<String>,
	/// Last attempt error, preserved for inspection and retry.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
	/// Unix time at which a delayed job becomes ready again.
	pub wake_at: u64,
	/// Processing lease expiry for active jobs; 0 when unlocked.
	pub locked_until: u64,
	pub created_at: u64,
	pub updated_at: u64,
}

impl<P> Job<P> {
	/// Creates a fresh waiting job.
	pub fn new(id: impl Into<String>, payload: P, max_attempts: u32) -> Self {
		let now = now_secs();
		Self {
			id: id.into(),
			state: JobState::Waiting,
			payload,
			attempts_made: 0,
			max_attempts,
			return_value: None,
			last_error: None,
			wake_at: 0,
			locked_until: 0,
			created_at: now,
			updated_at: now,
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.state.is_terminal()
	}

	/// Seconds since the job was first enqueued.
	pub fn age_secs(&self, now: u64) -> u64 {
		now.saturating_sub(self.created_at)
	}
}

/// Per-state job counts for health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
	pub waiting: usize,
	pub delayed: usize,
	pub active: usize,
	pub completed: usize,
	pub failed: usize,
}

impl JobCounts {
	pub fn total(&self) -> usize {
		self.waiting + self.delayed + self.active + self.completed + self.failed
	}
}
