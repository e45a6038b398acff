//! Durable job queue for the RGB++ relay system.
//!
//! An at-least-once, persistent work queue with delayed jobs, exponential
//! backoff, and lock-with-timeout redelivery. Jobs are deduplicated by id
//! (for settlement work the id is the Bitcoin txid, which gives at most
//! one active job per Bitcoin transaction), every state transition is
//! written through to storage, and a restart recovers exactly where the
//! previous process stopped.
//!
//! Handlers report a typed outcome instead of throwing sentinel values:
//! `Completed` and `Deferred` are successes (a deferral leaves the attempt
//! counter untouched), while errors split into `Retryable` (backoff) and
//! `Fatal` (immediate terminal failure).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};

use relay_storage::{StorageError, StorageService};
use relay_types::{
	now_secs, truncate_id, Job, JobCounts, JobEvent, JobState, RelayEvent, StorageKey,
};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	/// No job with the given id exists.
	#[error("Job not found: {0}")]
	NotFound(String),
	/// The operation is not valid for the job's current state.
	#[error("Job {id} is {state:?}")]
	InvalidState { id: String, state: JobState },
}

/// Why a handler run did not finish a job.
///
/// Boxed so handlers can surface their own error types; the queue only
/// needs `Display` to record `last_error`.
type HandlerFailure = Box<dyn std::error::Error + Send + Sync>;

/// Handler error, split by retry policy.
#[derive(Debug, Error)]
pub enum HandlerError {
	/// The attempt failed but a later attempt may succeed. Counts against
	/// `max_attempts` and reschedules with exponential backoff.
	#[error("{0}")]
	Retryable(#[source] HandlerFailure),
	/// The job can never succeed (e.g. commitment mismatch). Fails the job
	/// immediately regardless of remaining attempts.
	#[error("{0}")]
	Fatal(#[source] HandlerFailure),
}

impl HandlerError {
	pub fn retryable(err: impl Into<HandlerFailure>) -> Self {
		HandlerError::Retryable(err.into())
	}

	pub fn fatal(err: impl Into<HandlerFailure>) -> Self {
		HandlerError::Fatal(err.into())
	}
}

/// Successful handler outcomes.
#[derive(Debug)]
pub enum JobOutcome {
	/// The job is done; the value is recorded on the job.
	Completed(String),
	/// The job is deliberately waiting on an external event (Bitcoin
	/// confirmation, SPV proof). Reschedules without consuming an attempt.
	Deferred { reason: String, delay: Duration },
}

/// Trait implemented by job processors.
#[async_trait]
pub trait JobHandler<P>: Send + Sync {
	async fn process(&self, job: &Job<P>) -> Result<JobOutcome, HandlerError>;
}

/// Queue tuning parameters.
#[derive(Debug, Clone)]
pub struct QueueOptions {
	/// Base delay for exponential backoff.
	pub base_delay: Duration,
	/// Failed attempts allowed before a job becomes terminally failed.
	pub max_attempts: u32,
	/// Processing lease; an active job whose lease expired is redelivered.
	pub lease_timeout: Duration,
	/// Dispatcher poll interval.
	pub poll_interval: Duration,
	/// Retention of terminal jobs in storage (None = keep forever).
	pub retention: Option<Duration>,
}

impl Default for QueueOptions {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(30),
			max_attempts: 6,
			lease_timeout: Duration::from_secs(300),
			poll_interval: Duration::from_millis(500),
			retention: None,
		}
	}
}

/// The n-th reschedule waits `base * 2^n`.
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
	let factor = 2u64.saturating_pow(attempts_made.min(32));
	Duration::from_secs(base.as_secs().saturating_mul(factor))
}

/// Durable job queue keyed by job id.
///
/// The in-memory map is authoritative while the process lives; every
/// mutation is written through to storage so [`JobQueue::recover`] can
/// rebuild it after a crash.
pub struct JobQueue<P> {
	storage: Arc<StorageService>,
	options: QueueOptions,
	jobs: RwLock<HashMap<String, Job<P>>>,
	worker_running: AtomicBool,
	stopped: AtomicBool,
	events: Option<broadcast::Sender<RelayEvent>>,
}

impl<P> JobQueue<P>
where
	P: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
	/// Creates a queue backed by the given storage.
	pub fn new(storage: Arc<StorageService>, options: QueueOptions) -> Self {
		Self {
			storage,
			options,
			jobs: RwLock::new(HashMap::new()),
			worker_running: AtomicBool::new(false),
			stopped: AtomicBool::new(false),
			events: None,
		}
	}

	/// Attaches an event channel; queue transitions are published to it.
	pub fn with_events(mut self, events: broadcast::Sender<RelayEvent>) -> Self {
		self.events = Some(events);
		self
	}

	fn emit(&self, event: JobEvent) {
		if let Some(tx) = &self.events {
			let _ = tx.send(RelayEvent::Job(event));
		}
	}

	async fn persist(&self, job: &Job<P>) -> Result<(), QueueError> {
		let ttl = if job.is_terminal() {
			self.options.retention
		} else {
			None
		};
		self.storage
			.store_with_ttl(StorageKey::Jobs.as_str(), &job.id, job, ttl)
			.await?;
		Ok(())
	}

	/// Loads persisted jobs after a restart.
	///
	/// Active jobs whose processing lease has expired are demoted to
	/// waiting so they are redelivered; a lease still in force is left
	/// alone in case another process holds it.
	pub async fn recover(&self) -> Result<usize, QueueError> {
		let persisted: Vec<(String, Job<P>)> =
			self.storage.retrieve_all(StorageKey::Jobs.as_str()).await?;
		let now = now_secs();
		let mut jobs = self.jobs.write().await;
		let mut recovered = 0;
		for (id, mut job) in persisted {
			if job.state == JobState::Active && job.locked_until <= now {
				job.state = JobState::Waiting;
				job.locked_until = 0;
				job.updated_at = now;
				self.storage
					.store(StorageKey::Jobs.as_str(), &id, &job)
					.await?;
				tracing::info!(job_id = %truncate_id(&id), "Recovered interrupted job");
			}
			jobs.insert(id, job);
			recovered += 1;
		}
		Ok(recovered)
	}

	/// Adds a job, deduplicating by id.
	///
	/// If a job with this id already exists and is not terminal, the
	/// existing job is returned unchanged. A terminal job is replaced by
	/// a fresh one (re-submission after completion or failure).
	pub async fn enqueue(&self, id: &str, payload: P) -> Result<Job<P>, QueueError> {
		let mut jobs = self.jobs.write().await;
		if let Some(existing) = jobs.get(id) {
			if !existing.is_terminal() {
				return Ok(existing.clone());
			}
		}
		let job = Job::new(id, payload, self.options.max_attempts);
		self.persist(&job).await?;
		jobs.insert(id.to_string(), job.clone());
		drop(jobs);
		tracing::info!(job_id = %truncate_id(id), "Enqueued job");
		self.emit(JobEvent::Enqueued { id: id.to_string() });
		Ok(job)
	}

	/// Fetches a job by id.
	pub async fn get(&self, id: &str) -> Option<Job<P>> {
		self.jobs.read().await.get(id).cloned()
	}

	/// Lists all jobs in the given state.
	pub async fn list(&self, state: JobState) -> Vec<Job<P>> {
		self.jobs
			.read()
			.await
			.values()
			.filter(|job| job.state == state)
			.cloned()
			.collect()
	}

	/// Per-state job counts for health checks.
	pub async fn counts(&self) -> JobCounts {
		let jobs = self.jobs.read().await;
		let mut counts = JobCounts::default();
		for job in jobs.values() {
			match job.state {
				JobState::Waiting => counts.waiting += 1,
				JobState::Delayed => counts.delayed += 1,
				JobState::Active => counts.active += 1,
				JobState::Completed => counts.completed += 1,
				JobState::Failed => counts.failed += 1,
			}
		}
		counts
	}

	/// Re-arms a failed job.
	///
	/// Resets the attempt counter (and optionally raises `max_attempts`)
	/// and returns the job to the waiting state.
	pub async fn retry(&self, id: &str, max_attempts: Option<u32>) -> Result<JobState, QueueError> {
		let mut jobs = self.jobs.write().await;
		let job = jobs
			.get_mut(id)
			.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
		if job.state != JobState::Failed {
			return Err(QueueError::InvalidState {
				id: id.to_string(),
				state: job.state,
			});
		}
		job.state = JobState::Waiting;
		job.attempts_made = 0;
		if let Some(max) = max_attempts {
			job.max_attempts = max;
		}
		job.wake_at = 0;
		job.locked_until = 0;
		job.updated_at = now_secs();
		let snapshot = job.clone();
		drop(jobs);
		self.persist(&snapshot).await?;
		self.emit(JobEvent::Retried {
			id: id.to_string(),
			new_state: JobState::Waiting,
		});
		Ok(JobState::Waiting)
	}

	/// Re-arms every failed job, returning `(id, new_state)` pairs.
	pub async fn retry_all_failed(
		&self,
		max_attempts: Option<u32>,
	) -> Result<Vec<(String, JobState)>, QueueError> {
		let failed: Vec<String> = self
			.list(JobState::Failed)
			.await
			.into_iter()
			.map(|job| job.id)
			.collect();
		let mut results = Vec::with_capacity(failed.len());
		for id in failed {
			let state = self.retry(&id, max_attempts).await?;
			results.push((id, state));
		}
		Ok(results)
	}

	/// Mutates a job's payload in place and persists it.
	///
	/// Used by the settlement repair path to flag a fee bump so the change
	/// survives redelivery.
	pub async fn update_payload<F>(&self, id: &str, update: F) -> Result<(), QueueError>
	where
		F: FnOnce(&mut P),
	{
		let mut jobs = self.jobs.write().await;
		let job = jobs
			.get_mut(id)
			.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
		update(&mut job.payload);
		job.updated_at = now_secs();
		let snapshot = job.clone();
		drop(jobs);
		self.persist(&snapshot).await
	}

	/// Whether the worker loop is currently running.
	pub fn is_worker_running(&self) -> bool {
		self.worker_running.load(Ordering::SeqCst)
	}

	/// Asks the worker loop to stop after in-flight jobs finish.
	pub fn shutdown(&self) {
		self.stopped.store(true, Ordering::SeqCst);
	}

	/// Claims the next due job, marking it active under a fresh lease.
	///
	/// Due means: waiting, delayed past its wake time, or active with an
	/// expired lease (the previous worker is presumed crashed). Marking
	/// active inside the same lock acquisition is what guarantees at most
	/// one in-flight attempt per id.
	async fn claim_next_due(&self) -> Result<Option<Job<P>>, QueueError> {
		let now = now_secs();
		let snapshot = {
			let mut jobs = self.jobs.write().await;
			let due = jobs.values_mut().find(|job| match job.state {
				JobState::Waiting => true,
				JobState::Delayed => job.wake_at <= now,
				JobState::Active => job.locked_until != 0 && job.locked_until <= now,
				_ => false,
			});
			match due {
				Some(job) => {
					job.state = JobState::Active;
					job.locked_until = now + self.options.lease_timeout.as_secs();
					job.updated_at = now;
					Some(job.clone())
				}
				None => None,
			}
		};
		if let Some(job) = &snapshot {
			self.persist(job).await?;
		}
		Ok(snapshot)
	}

	/// Applies a handler result to a claimed job.
	async fn settle_attempt(
		&self,
		id: &str,
		result: Result<JobOutcome, HandlerError>,
	) -> Result<(), QueueError> {
		let now = now_secs();
		let (snapshot, event) = {
			let mut jobs = self.jobs.write().await;
			let job = jobs
				.get_mut(id)
				.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
			job.locked_until = 0;
			job.updated_at = now;
			let event = match result {
				Ok(JobOutcome::Completed(value)) => {
					job.state = JobState::Completed;
					job.return_value = Some(value.clone());
					JobEvent::Completed {
						id: id.to_string(),
						return_value: value,
					}
				}
				Ok(JobOutcome::Deferred { reason, delay }) => {
					job.state = JobState::Delayed;
					job.wake_at = now + delay.as_secs();
					JobEvent::Deferred {
						id: id.to_string(),
						reason,
						delay_secs: delay.as_secs(),
					}
				}
				Err(HandlerError::Fatal(error)) => {
					job.state = JobState::Failed;
					job.last_error = Some(error.to_string());
					JobEvent::Failed {
						id: id.to_string(),
						error: error.to_string(),
					}
				}
				Err(HandlerError::Retryable(error)) => {
					job.attempts_made += 1;
					job.last_error = Some(error.to_string());
					if job.attempts_made < job.max_attempts {
						let delay = backoff_delay(self.options.base_delay, job.attempts_made);
						job.state = JobState::Delayed;
						job.wake_at = now + delay.as_secs();
						JobEvent::AttemptFailed {
							id: id.to_string(),
							attempt: job.attempts_made,
							error: error.to_string(),
						}
					} else {
						job.state = JobState::Failed;
						JobEvent::Failed {
							id: id.to_string(),
							error: error.to_string(),
						}
					}
				}
			};
			(job.clone(), event)
		};
		self.persist(&snapshot).await?;
		match &event {
			JobEvent::Completed { id, .. } => {
				tracing::info!(job_id = %truncate_id(id), "Job completed");
			}
			JobEvent::Deferred { id, reason, delay_secs } => {
				tracing::debug!(job_id = %truncate_id(id), reason = %reason, delay_secs = *delay_secs, "Job deferred");
			}
			JobEvent::AttemptFailed { id, attempt, error } => {
				tracing::warn!(job_id = %truncate_id(id), attempt = *attempt, error = %error, "Attempt failed");
			}
			JobEvent::Failed { id, error } => {
				tracing::error!(job_id = %truncate_id(id), error = %error, "Job failed permanently");
			}
			_ => {}
		}
		self.emit(event);
		Ok(())
	}

	/// Runs the worker loop until [`JobQueue::shutdown`] is called.
	///
	/// A single dispatcher claims due jobs and processes them on up to
	/// `concurrency` concurrent tasks. Long waits inside a handler must be
	/// expressed as `Deferred`, never as sleeps, so a slot is only held
	/// for the duration of actual work.
	pub async fn run_worker<H>(self: Arc<Self>, handler: Arc<H>, concurrency: usize)
	where
		H: JobHandler<P> + 'static,
	{
		self.worker_running.store(true, Ordering::SeqCst);
		let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
		tracing::info!(concurrency, "Queue worker started");

		while !self.stopped.load(Ordering::SeqCst) {
			let permit = match semaphore.clone().acquire_owned().await {
				Ok(permit) => permit,
				Err(_) => break,
			};
			let claimed = match self.claim_next_due().await {
				Ok(claimed) => claimed,
				Err(e) => {
					tracing::error!(error = %e, "Failed to claim job");
					drop(permit);
					tokio::time::sleep(self.options.poll_interval).await;
					continue;
				}
			};
			match claimed {
				Some(job) => {
					let queue = Arc::clone(&self);
					let handler = Arc::clone(&handler);
					tokio::spawn(async move {
						let _permit = permit;
						queue.emit(JobEvent::Started {
							id: job.id.clone(),
							attempt: job.attempts_made + 1,
						});
						let result = handler.process(&job).await;
						if let Err(e) = queue.settle_attempt(&job.id, result).await {
							tracing::error!(
								job_id = %truncate_id(&job.id),
								error = %e,
								"Failed to record job outcome"
							);
						}
					});
				}
				None => {
					drop(permit);
					tokio::time::sleep(self.options.poll_interval).await;
				}
			}
		}

		// Wait for in-flight jobs before reporting the worker stopped.
		let _ = semaphore.acquire_many(concurrency.max(1) as u32).await;
		self.worker_running.store(false, Ordering::SeqCst);
		tracing::info!("Queue worker stopped");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_storage::implementations::memory::MemoryStorage;
	use serde::Deserialize;

	#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
	struct Payload {
		value: u32,
	}

	fn test_options() -> QueueOptions {
		QueueOptions {
			base_delay: Duration::ZERO,
			max_attempts: 3,
			lease_timeout: Duration::from_secs(60),
			poll_interval: Duration::from_millis(10),
			retention: None,
		}
	}

	fn new_queue() -> Arc<JobQueue<Payload>> {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		Arc::new(JobQueue::new(storage, test_options()))
	}

	struct AlwaysFails;

	#[async_trait]
	impl JobHandler<Payload> for AlwaysFails {
		async fn process(&self, _job: &Job<Payload>) -> Result<JobOutcome, HandlerError> {
			Err(HandlerError::retryable(std::io::Error::other("boom")))
		}
	}

	struct Completes;

	#[async_trait]
	impl JobHandler<Payload> for Completes {
		async fn process(&self, job: &Job<Payload>) -> Result<JobOutcome, HandlerError> {
			Ok(JobOutcome::Completed(format!("done-{}", job.payload.value)))
		}
	}

	struct DefersForever;

	#[async_trait]
	impl JobHandler<Payload> for DefersForever {
		async fn process(&self, _job: &Job<Payload>) -> Result<JobOutcome, HandlerError> {
			Ok(JobOutcome::Deferred {
				reason: "waiting on confirmation".into(),
				delay: Duration::from_secs(600),
			})
		}
	}

	async fn wait_for<F, Fut>(mut check: F)
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = bool>,
	{
		for _ in 0..500 {
			if check().await {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("condition not reached in time");
	}

	#[tokio::test]
	async fn enqueue_is_idempotent_for_live_jobs() {
		let queue = new_queue();
		let first = queue.enqueue("tx1", Payload { value: 1 }).await.unwrap();
		let second = queue.enqueue("tx1", Payload { value: 2 }).await.unwrap();
		// The second submission is absorbed: same job, original payload.
		assert_eq!(second.payload, first.payload);
		assert_eq!(queue.counts().await.total(), 1);
	}

	#[tokio::test]
	async fn terminal_job_can_be_resubmitted() {
		let queue = new_queue();
		queue.enqueue("tx1", Payload { value: 1 }).await.unwrap();
		let worker = tokio::spawn(Arc::clone(&queue).run_worker(Arc::new(Completes), 2));
		wait_for(|| async {
			queue.get("tx1").await.unwrap().state == JobState::Completed
		})
		.await;
		let fresh = queue.enqueue("tx1", Payload { value: 9 }).await.unwrap();
		assert_eq!(fresh.payload.value, 9);
		queue.shutdown();
		worker.await.unwrap();
	}

	#[tokio::test]
	async fn retryable_errors_count_attempts_then_fail() {
		let queue = new_queue();
		queue.enqueue("tx1", Payload { value: 1 }).await.unwrap();
		let worker = tokio::spawn(Arc::clone(&queue).run_worker(Arc::new(AlwaysFails), 1));
		wait_for(|| async { queue.get("tx1").await.unwrap().state == JobState::Failed }).await;
		let job = queue.get("tx1").await.unwrap();
		assert_eq!(job.attempts_made, 3);
		assert_eq!(job.last_error.as_deref(), Some("boom"));
		queue.shutdown();
		worker.await.unwrap();
	}

	#[tokio::test]
	async fn deferral_does_not_consume_attempts() {
		let queue = new_queue();
		queue.enqueue("tx1", Payload { value: 1 }).await.unwrap();
		let worker = tokio::spawn(Arc::clone(&queue).run_worker(Arc::new(DefersForever), 1));
		wait_for(|| async { queue.get("tx1").await.unwrap().state == JobState::Delayed }).await;
		let job = queue.get("tx1").await.unwrap();
		assert_eq!(job.attempts_made, 0);
		assert!(job.wake_at > now_secs() + 500);
		queue.shutdown();
		worker.await.unwrap();
	}

	#[tokio::test]
	async fn backoff_doubles_per_attempt() {
		let base = Duration::from_secs(30);
		assert_eq!(backoff_delay(base, 1), Duration::from_secs(60));
		assert_eq!(backoff_delay(base, 2), Duration::from_secs(120));
		assert_eq!(backoff_delay(base, 3), Duration::from_secs(240));
		assert_eq!(backoff_delay(base, 6), Duration::from_secs(30 * 64));
	}

	#[tokio::test]
	async fn fatal_error_fails_immediately() {
		struct Fatal;
		#[async_trait]
		impl JobHandler<Payload> for Fatal {
			async fn process(&self, _job: &Job<Payload>) -> Result<JobOutcome, HandlerError> {
				Err(HandlerError::fatal(std::io::Error::other(
					"commitment mismatch",
				)))
			}
		}
		let queue = new_queue();
		queue.enqueue("tx1", Payload { value: 1 }).await.unwrap();
		let worker = tokio::spawn(Arc::clone(&queue).run_worker(Arc::new(Fatal), 1));
		wait_for(|| async { queue.get("tx1").await.unwrap().state == JobState::Failed }).await;
		let job = queue.get("tx1").await.unwrap();
		// No attempts burned on the way out; the error itself is terminal.
		assert_eq!(job.attempts_made, 0);
		assert_eq!(job.last_error.as_deref(), Some("commitment mismatch"));
		queue.shutdown();
		worker.await.unwrap();
	}

	#[tokio::test]
	async fn retry_rearms_failed_jobs() {
		let queue = new_queue();
		queue.enqueue("tx1", Payload { value: 1 }).await.unwrap();
		let worker = tokio::spawn(Arc::clone(&queue).run_worker(Arc::new(AlwaysFails), 1));
		wait_for(|| async { queue.get("tx1").await.unwrap().state == JobState::Failed }).await;
		queue.shutdown();
		worker.await.unwrap();

		let results = queue.retry_all_failed(Some(5)).await.unwrap();
		assert_eq!(results, vec![("tx1".to_string(), JobState::Waiting)]);
		let job = queue.get("tx1").await.unwrap();
		assert_eq!(job.attempts_made, 0);
		assert_eq!(job.max_attempts, 5);
	}

	#[tokio::test]
	async fn retry_rejects_non_failed_jobs() {
		let queue = new_queue();
		queue.enqueue("tx1", Payload { value: 1 }).await.unwrap();
		assert!(matches!(
			queue.retry("tx1", None).await,
			Err(QueueError::InvalidState { .. })
		));
		assert!(matches!(
			queue.retry("missing", None).await,
			Err(QueueError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn recovery_reloads_jobs_and_expires_leases() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		{
			let queue: JobQueue<Payload> =
				JobQueue::new(Arc::clone(&storage), test_options());
			queue.enqueue("tx1", Payload { value: 7 }).await.unwrap();
			// Simulate a crash mid-processing: active with an expired lease.
			let mut job = queue.get("tx1").await.unwrap();
			job.state = JobState::Active;
			job.locked_until = now_secs().saturating_sub(10);
			storage
				.store(StorageKey::Jobs.as_str(), "tx1", &job)
				.await
				.unwrap();
		}

		let restarted: JobQueue<Payload> = JobQueue::new(storage, test_options());
		assert_eq!(restarted.recover().await.unwrap(), 1);
		let job = restarted.get("tx1").await.unwrap();
		assert_eq!(job.state, JobState::Waiting);
		assert_eq!(job.payload.value, 7);
	}

	#[tokio::test]
	async fn worker_running_flag_tracks_lifecycle() {
		let queue = new_queue();
		assert!(!queue.is_worker_running());
		let worker = tokio::spawn(Arc::clone(&queue).run_worker(Arc::new(Completes), 1));
		wait_for(|| async { queue.is_worker_running() }).await;
		queue.shutdown();
		worker.await.unwrap();
		assert!(!queue.is_worker_running());
	}
}
