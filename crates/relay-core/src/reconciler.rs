//! Missing-transaction reconciliation sweep.
//!
//! Settlement jobs can fail terminally while their Bitcoin transaction is
//! merely late: provider hiccups, a long confirmation gap, an exhausted
//! backoff. The reconciler walks newly confirmed Bitcoin blocks and
//! re-arms every failed job whose txid turns up confirmed, using a
//! persisted cursor so restarts never rescan processed heights.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use relay_bitcoin::{BitcoinDataSource, BitcoinError};
use relay_queue::{JobQueue, QueueError};
use relay_storage::{StorageError, StorageService};
use relay_types::{truncate_id, JobState, ReconcileEvent, RelayEvent, StorageKey};

use crate::event_bus::EventBus;
use crate::settler::SettleJob;

/// Storage id of the persisted cursor.
const CURSOR_KEY: &str = "btc_cursor";

/// Errors that can occur during a reconciliation sweep.
#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("Bitcoin source error: {0}")]
	Bitcoin(#[from] BitcoinError),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Queue error: {0}")]
	Queue(#[from] QueueError),
}

/// Reconciler tuning parameters.
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
	/// Time between sweep ticks.
	pub interval: Duration,
	/// Blocks processed per batch before the cursor is persisted.
	pub batch_size: u64,
	/// Pause between batches, rate control against the Bitcoin provider.
	pub batch_delay: Duration,
}

/// What a tick did.
#[derive(Debug, PartialEq, Eq)]
pub enum TickResult {
	/// Another run was in flight; this tick did nothing.
	Skipped,
	/// The cursor already covers every safe height.
	UpToDate,
	/// A range was swept.
	Swept {
		from: u64,
		to: u64,
		requeued: usize,
	},
}

/// Clears the running flag when a sweep ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

/// The missing-transaction reconciler.
pub struct Reconciler {
	btc: Arc<dyn BitcoinDataSource>,
	queue: Arc<JobQueue<SettleJob>>,
	storage: Arc<StorageService>,
	options: ReconcilerOptions,
	running: AtomicBool,
	events: EventBus,
}

impl Reconciler {
	pub fn new(
		btc: Arc<dyn BitcoinDataSource>,
		queue: Arc<JobQueue<SettleJob>>,
		storage: Arc<StorageService>,
		options: ReconcilerOptions,
		events: EventBus,
	) -> Self {
		Self {
			btc,
			queue,
			storage,
			options,
			running: AtomicBool::new(false),
			events,
		}
	}

	/// Runs one sweep.
	///
	/// Re-entrancy guarded by an atomic flag: a tick that finds a sweep in
	/// flight skips itself, since the next scheduled tick will cover the
	/// same range anyway.
	pub async fn tick(&self) -> Result<TickResult, ReconcileError> {
		if self.running.swap(true, Ordering::SeqCst) {
			self.events
				.publish(RelayEvent::Reconcile(ReconcileEvent::Skipped));
			return Ok(TickResult::Skipped);
		}
		let _guard = RunningGuard(&self.running);
		self.sweep().await
	}

	async fn sweep(&self) -> Result<TickResult, ReconcileError> {
		let tip = self.btc.get_chain_tip().await?;
		// One-confirmation safety margin: never reconcile against a block
		// that could still be reorganized away trivially.
		let target = tip.saturating_sub(1);

		let cursor: u64 = match self
			.storage
			.retrieve(StorageKey::Reconciler.as_str(), CURSOR_KEY)
			.await
		{
			Ok(cursor) => cursor,
			Err(StorageError::NotFound) => {
				// First run: start at the current target instead of
				// scanning chain history that predates the relay.
				self.persist_cursor(target).await?;
				return Ok(TickResult::UpToDate);
			}
			Err(e) => return Err(e.into()),
		};

		if target <= cursor {
			return Ok(TickResult::UpToDate);
		}

		let from = cursor + 1;
		self.events
			.publish(RelayEvent::Reconcile(ReconcileEvent::Started {
				from,
				to: target,
			}));
		tracing::info!(from, to = target, "Reconciliation sweep started");

		let mut requeued = 0;
		let mut start = from;
		while start <= target {
			let end = (start + self.options.batch_size - 1).min(target);

			// Refresh per batch: jobs requeued by an earlier batch are no
			// longer failed and must not be retried twice.
			let failed: HashSet<String> = self
				.queue
				.list(JobState::Failed)
				.await
				.into_iter()
				.map(|job| job.id)
				.collect();

			if !failed.is_empty() {
				for height in start..=end {
					let block_hash = self.btc.get_block_hash(height).await?;
					for txid in self.btc.get_block_txids(&block_hash).await? {
						if !failed.contains(&txid) {
							continue;
						}
						match self.queue.retry(&txid, None).await {
							Ok(_) => {
								requeued += 1;
								tracing::info!(
									job_id = %truncate_id(&txid),
									height,
									"Requeued failed job found confirmed"
								);
								self.events.publish(RelayEvent::Reconcile(
									ReconcileEvent::JobRequeued { id: txid, height },
								));
							}
							Err(QueueError::InvalidState { .. }) => {
								// Lost a race with an operator retry.
							}
							Err(e) => return Err(e.into()),
						}
					}
				}
			}

			self.persist_cursor(end).await?;
			start = end + 1;
			if start <= target {
				tokio::time::sleep(self.options.batch_delay).await;
			}
		}

		Ok(TickResult::Swept {
			from,
			to: target,
			requeued,
		})
	}

	async fn persist_cursor(&self, height: u64) -> Result<(), ReconcileError> {
		self.storage
			.store(StorageKey::Reconciler.as_str(), CURSOR_KEY, &height)
			.await?;
		self.events
			.publish(RelayEvent::Reconcile(ReconcileEvent::CursorAdvanced {
				height,
			}));
		Ok(())
	}

	/// Runs ticks forever at the configured interval.
	///
	/// Spawned as a task by the engine and aborted at shutdown.
	pub async fn run(self: Arc<Self>) {
		let mut interval = tokio::time::interval(self.options.interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			interval.tick().await;
			match self.tick().await {
				Ok(TickResult::Swept { from, to, requeued }) => {
					tracing::info!(from, to, requeued, "Reconciliation sweep finished");
				}
				Ok(_) => {}
				Err(e) => {
					tracing::error!(error = %e, "Reconciliation sweep failed");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{fixture_request, FakeBtc};
	use relay_queue::QueueOptions;
	use relay_storage::implementations::memory::MemoryStorage;
	use relay_types::{now_secs, Job};

	const TXID: &str = "5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e5e";

	struct Fixture {
		btc: Arc<FakeBtc>,
		queue: Arc<JobQueue<SettleJob>>,
		storage: Arc<StorageService>,
		reconciler: Reconciler,
	}

	fn fixture(batch_size: u64) -> Fixture {
		let btc = Arc::new(FakeBtc::new());
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let queue = Arc::new(JobQueue::new(
			Arc::clone(&storage),
			QueueOptions::default(),
		));
		let reconciler = Reconciler::new(
			btc.clone(),
			Arc::clone(&queue),
			Arc::clone(&storage),
			ReconcilerOptions {
				interval: Duration::from_secs(60),
				batch_size,
				batch_delay: Duration::ZERO,
			},
			crate::event_bus::EventBus::default(),
		);
		Fixture {
			btc,
			queue,
			storage,
			reconciler,
		}
	}

	async fn set_cursor(storage: &StorageService, height: u64) {
		storage
			.store(StorageKey::Reconciler.as_str(), CURSOR_KEY, &height)
			.await
			.unwrap();
	}

	async fn get_cursor(storage: &StorageService) -> u64 {
		storage
			.retrieve(StorageKey::Reconciler.as_str(), CURSOR_KEY)
			.await
			.unwrap()
	}

	/// Plants a terminally failed job by persisting it and recovering the
	/// queue, the same path a restart takes.
	async fn plant_failed_job(fixture: &Fixture, txid: &str) {
		let mut job = Job::new(txid, SettleJob::new(fixture_request(txid, false)), 3);
		job.state = JobState::Failed;
		job.attempts_made = 3;
		job.last_error = Some("bitcoin transaction not found yet".into());
		job.updated_at = now_secs();
		fixture
			.storage
			.store(StorageKey::Jobs.as_str(), txid, &job)
			.await
			.unwrap();
		fixture.queue.recover().await.unwrap();
	}

	#[tokio::test]
	async fn sweep_requeues_confirmed_failed_job_once() {
		let f = fixture(10);
		let height = 120;
		plant_failed_job(&f, TXID).await;

		f.btc.tip.store(height + 1, Ordering::SeqCst);
		f.btc.add_block(height - 1, vec![]);
		f.btc.add_block(height, vec![TXID.to_string(), "unrelated".to_string()]);
		set_cursor(&f.storage, height - 2).await;

		let result = f.reconciler.tick().await.unwrap();
		assert_eq!(
			result,
			TickResult::Swept {
				from: height - 1,
				to: height,
				requeued: 1,
			}
		);
		assert_eq!(
			f.queue.get(TXID).await.unwrap().state,
			JobState::Waiting
		);
		assert_eq!(get_cursor(&f.storage).await, height);

		// A second tick over the same chain state finds nothing to do.
		assert_eq!(f.reconciler.tick().await.unwrap(), TickResult::UpToDate);
	}

	#[tokio::test]
	async fn first_run_initializes_cursor_without_scanning() {
		let f = fixture(10);
		f.btc.tip.store(500, Ordering::SeqCst);

		assert_eq!(f.reconciler.tick().await.unwrap(), TickResult::UpToDate);
		assert_eq!(get_cursor(&f.storage).await, 499);
		assert_eq!(f.btc.block_hash_calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn batches_advance_cursor_incrementally() {
		let f = fixture(2);
		f.btc.tip.store(11, Ordering::SeqCst);
		for height in 6..=10 {
			f.btc.add_block(height, vec![]);
		}
		set_cursor(&f.storage, 5).await;
		plant_failed_job(&f, TXID).await;

		let result = f.reconciler.tick().await.unwrap();
		assert_eq!(
			result,
			TickResult::Swept {
				from: 6,
				to: 10,
				requeued: 0,
			}
		);
		assert_eq!(get_cursor(&f.storage).await, 10);
	}

	#[tokio::test]
	async fn no_failed_jobs_skips_block_fetches() {
		let f = fixture(10);
		f.btc.tip.store(11, Ordering::SeqCst);
		set_cursor(&f.storage, 5).await;

		let result = f.reconciler.tick().await.unwrap();
		assert_eq!(
			result,
			TickResult::Swept {
				from: 6,
				to: 10,
				requeued: 0,
			}
		);
		// The cursor still advances, but no block data was pulled.
		assert_eq!(f.btc.block_hash_calls.load(Ordering::SeqCst), 0);
		assert_eq!(get_cursor(&f.storage).await, 10);
	}

	#[tokio::test]
	async fn concurrent_tick_is_skipped() {
		let f = fixture(10);
		f.btc.tip.store(100, Ordering::SeqCst);
		*f.btc.tip_delay.lock().unwrap() = Duration::from_millis(100);
		set_cursor(&f.storage, 99).await;

		let reconciler = Arc::new(f.reconciler);
		let slow = {
			let reconciler = Arc::clone(&reconciler);
			tokio::spawn(async move { reconciler.tick().await })
		};
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(reconciler.tick().await.unwrap(), TickResult::Skipped);
		assert_eq!(slow.await.unwrap().unwrap(), TickResult::UpToDate);
	}
}
