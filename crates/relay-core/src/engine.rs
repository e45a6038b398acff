//! Relay engine: construction, lifecycle, and the caller-facing API.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use relay_bitcoin::{BitcoinDataSource, SpvClient};
use relay_ckb::{CkbClient, SignerInterface};
use relay_config::{RelayConfig, StorageBackend};
use relay_paymaster::{PaymasterOptions, PaymasterService};
use relay_queue::{JobQueue, QueueError, QueueOptions};
use relay_storage::implementations::{
	file::{FileStorage, TtlConfig},
	memory::MemoryStorage,
};
use relay_storage::{StorageError, StorageService};
use relay_types::{
	Job, JobCounts, JobState, OutPoint, RequestError, Script, ScriptHashType, StorageKey,
	TransactionRequest,
};

use crate::event_bus::EventBus;
use crate::reconciler::{Reconciler, ReconcilerOptions};
use crate::settler::{FeeCheck, SettleJob, Settler, SettlerConfig};

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum RelayError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Invalid request: {0}")]
	Request(#[from] RequestError),
	#[error("Queue error: {0}")]
	Queue(#[from] QueueError),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("Recovery error: {0}")]
	Recovery(String),
}

/// External provider implementations injected into the engine.
///
/// The binary selects concrete implementations from configuration; tests
/// inject in-memory fakes. The pipeline itself depends only on the
/// capability traits.
pub struct Providers {
	pub btc: Arc<dyn BitcoinDataSource>,
	pub spv: Arc<dyn SpvClient>,
	pub ckb: Arc<dyn CkbClient>,
	pub signer: Arc<dyn SignerInterface>,
}

/// The relay engine: queue, settler, reconciler, and paymaster wired
/// together behind the caller API.
pub struct RelayEngine {
	config: RelayConfig,
	queue: Arc<JobQueue<SettleJob>>,
	settler: Arc<Settler>,
	reconciler: Option<Arc<Reconciler>>,
	paymaster: Option<Arc<PaymasterService>>,
	event_bus: EventBus,
}

fn build_storage(config: &RelayConfig) -> Arc<StorageService> {
	let backend: Box<dyn relay_storage::StorageInterface> = match config.storage.backend {
		StorageBackend::Memory => Box::new(MemoryStorage::new()),
		StorageBackend::File => {
			let ttl = TtlConfig::new().with_ttl(
				StorageKey::Jobs,
				Duration::from_secs(config.storage.job_retention_secs),
			);
			Box::new(FileStorage::new(config.storage.path.clone().into(), ttl))
		}
	};
	Arc::new(StorageService::new(backend))
}

impl RelayEngine {
	/// Builds the engine from configuration and provider implementations.
	pub fn new(config: RelayConfig, providers: Providers) -> Result<Self, RelayError> {
		config
			.validate()
			.map_err(|e| RelayError::Config(e.to_string()))?;

		let event_bus = EventBus::default();
		let storage = build_storage(&config);

		let queue_options = QueueOptions {
			base_delay: Duration::from_secs(config.queue.base_delay_secs),
			max_attempts: config.queue.max_attempts,
			lease_timeout: Duration::from_secs(config.queue.lease_timeout_secs),
			poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
			retention: Some(Duration::from_secs(config.storage.job_retention_secs)),
		};
		let queue = Arc::new(
			JobQueue::new(Arc::clone(&storage), queue_options).with_events(event_bus.sender()),
		);

		let paymaster = config.paymaster.as_ref().map(|section| {
			Arc::new(
				PaymasterService::new(
					Arc::clone(&providers.ckb),
					Arc::clone(&providers.signer),
					Arc::clone(&storage),
					PaymasterOptions {
						preset_count: section.preset_count,
						cell_capacity: section.cell_capacity_shannons,
						refill_threshold_percent: section.refill_threshold_percent,
						refill_fee: section.refill_fee_shannons,
						initial_parent: OutPoint {
							tx_hash: section.parent_tx_hash.clone(),
							index: section.parent_index,
						},
						lock: Script {
							code_hash: section.lock_code_hash.clone(),
							hash_type: ScriptHashType::Type,
							args: section.lock_args.clone(),
						},
						confirm_poll_interval: Duration::from_secs(
							config.ckb.confirm_poll_interval_secs,
						),
						confirm_poll_attempts: config.ckb.confirm_poll_attempts,
						lease_wait: Duration::from_secs(
							config.ckb.confirm_poll_interval_secs
								* config.ckb.confirm_poll_attempts as u64
								+ 10,
						),
					},
				)
				.with_events(event_bus.sender()),
			)
		});

		let settler_config = SettlerConfig {
			min_confirmations: config.bitcoin.min_confirmations,
			base_delay: Duration::from_secs(config.queue.base_delay_secs),
			max_attempts: config.queue.max_attempts,
			confirm_poll_interval: Duration::from_secs(config.ckb.confirm_poll_interval_secs),
			confirm_poll_attempts: config.ckb.confirm_poll_attempts,
			scripts: relay_ckb::rgbpp::RgbppScripts::new(
				config.ckb.rgbpp_lock_code_hash.clone(),
				config.ckb.btc_time_lock_code_hash.clone(),
			),
			fee_check: config.bitcoin.fee_check.as_ref().map(|check| FeeCheck {
				recipient_script_hex: check.recipient_script_hex.clone(),
				min_fee_sats: check.min_fee_sats,
			}),
			sponsor_fee: config
				.paymaster
				.as_ref()
				.map(|section| section.sponsor_fee_shannons)
				.unwrap_or(0),
		};
		let settler = Arc::new(Settler::new(
			Arc::clone(&providers.btc),
			providers.spv,
			Arc::clone(&providers.ckb),
			providers.signer,
			paymaster.clone(),
			Arc::clone(&queue),
			settler_config,
			event_bus.clone(),
		));

		let reconciler = config.reconciler.enabled.then(|| {
			Arc::new(Reconciler::new(
				providers.btc,
				Arc::clone(&queue),
				storage,
				ReconcilerOptions {
					interval: Duration::from_secs(config.reconciler.interval_secs),
					batch_size: config.reconciler.batch_size.max(1),
					batch_delay: Duration::from_secs(config.reconciler.batch_delay_secs),
				},
				event_bus.clone(),
			))
		});

		Ok(Self {
			config,
			queue,
			settler,
			reconciler,
			paymaster,
			event_bus,
		})
	}

	/// Restores durable state after a restart: persisted jobs (expired
	/// processing leases are redelivered) and the paymaster pool.
	pub async fn recover(&self) -> Result<(), RelayError> {
		let jobs = self.queue.recover().await?;
		tracing::info!(jobs, "Recovered queue state");
		if let Some(paymaster) = &self.paymaster {
			let cells = paymaster
				.recover()
				.await
				.map_err(|e| RelayError::Recovery(e.to_string()))?;
			tracing::info!(cells, "Recovered paymaster pool");
		}
		Ok(())
	}

	/// Runs the relay until interrupted.
	///
	/// Starts the queue worker and the reconciler ticker, then waits for
	/// ctrl-c; shutdown drains in-flight jobs before returning.
	pub async fn run(&self) -> Result<(), RelayError> {
		let worker = tokio::spawn(
			Arc::clone(&self.queue)
				.run_worker(Arc::clone(&self.settler), self.config.relay.worker_concurrency),
		);
		let reconciler = self
			.reconciler
			.as_ref()
			.map(|reconciler| tokio::spawn(Arc::clone(reconciler).run()));

		tokio::signal::ctrl_c()
			.await
			.map_err(|e| RelayError::Config(format!("signal handler: {}", e)))?;
		tracing::info!("Shutting down");

		self.queue.shutdown();
		if let Some(reconciler) = reconciler {
			reconciler.abort();
		}
		worker
			.await
			.map_err(|e| RelayError::Recovery(format!("worker task: {}", e)))?;
		Ok(())
	}

	/// Submits a transaction request. Idempotent by `btc_txid`: while a
	/// job for this txid is live, resubmission returns it unchanged.
	pub async fn enqueue_transaction(
		&self,
		request: TransactionRequest,
	) -> Result<Job<SettleJob>, RelayError> {
		request.validate()?;
		let id = request.btc_txid.clone();
		Ok(self.queue.enqueue(&id, SettleJob::new(request)).await?)
	}

	/// Fetches the job for a Bitcoin txid, if any.
	pub async fn get_transaction_request(&self, btc_txid: &str) -> Option<Job<SettleJob>> {
		self.queue.get(btc_txid).await
	}

	/// Re-arms every failed job, optionally raising its attempt budget.
	pub async fn retry_all_failed(
		&self,
		max_attempts: Option<u32>,
	) -> Result<Vec<(String, JobState)>, RelayError> {
		Ok(self.queue.retry_all_failed(max_attempts).await?)
	}

	/// Per-state job counts for health checks.
	pub async fn get_queue_counts(&self) -> JobCounts {
		self.queue.counts().await
	}

	/// Whether the worker loop is running.
	pub fn is_worker_running(&self) -> bool {
		self.queue.is_worker_running()
	}

	/// The event bus, for observers.
	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	/// The underlying queue, for advanced introspection.
	pub fn queue(&self) -> &Arc<JobQueue<SettleJob>> {
		&self.queue
	}
}
