//! Paymaster cell allocator for the RGB++ relay system.
//!
//! Maintains a pool of pre-funded CKB cells and hands them out one at a
//! time for fee sponsorship. The invariants the allocator enforces:
//!
//! - a cell leaves the available pool the moment it is leased, so no two
//!   settlements can ever hold the same cell;
//! - a leased cell always ends either spent (its sponsoring transaction
//!   confirmed) or returned; the [`CellLease`] guard returns it on drop,
//!   so no failure path after leasing can leak a cell;
//! - refills are single-flight: a low pool triggers one background refill
//!   and concurrent callers either continue with what is left or, when
//!   the pool is empty, block on that refill's completion.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, Notify};

use relay_ckb::{CkbClient, CkbClientError, SignerError, SignerInterface, TxStatus};
use relay_storage::{StorageError, StorageService};
use relay_types::{
	CellInput, CellOutput, CkbRawTransaction, OutPoint, PaymasterCell, PaymasterEvent,
	RelayEvent, Script, StorageKey,
};

/// Storage id for the current funding parent cell.
const PARENT_KEY: &str = "parent";
/// Storage id for the last persisted pool snapshot.
const POOL_KEY: &str = "pool";

/// Errors that can occur during allocator operations.
#[derive(Debug, Error)]
pub enum PaymasterError {
	/// The pool is empty and the refill did not produce cells. Propagates
	/// to the caller of `lease`; pool state stays consistent.
	#[error("Paymaster pool exhausted: {0}")]
	PoolExhausted(String),
	/// `spend`/`unspend` on a cell that is not currently leased.
	#[error("Cell not leased: {0}")]
	NotLeased(String),
	/// The refill funding transaction could not be built or confirmed.
	#[error("Refill failed: {0}")]
	RefillFailed(String),
	#[error("CKB client error: {0}")]
	Ckb(#[from] CkbClientError),
	#[error("Signer error: {0}")]
	Signer(#[from] SignerError),
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
}

/// Allocator tuning parameters.
#[derive(Debug, Clone)]
pub struct PaymasterOptions {
	/// Cells produced per refill.
	pub preset_count: usize,
	/// Capacity of each pool cell, in shannons.
	pub cell_capacity: u64,
	/// Pool fraction (percent) below which a background refill starts.
	pub refill_threshold_percent: u8,
	/// Fee budget of a refill funding transaction, in shannons.
	pub refill_fee: u64,
	/// Initial funding parent cell; later parents are refill change
	/// outputs tracked in storage.
	pub initial_parent: OutPoint,
	/// Lock script owning pool cells.
	pub lock: Script,
	/// Confirmation polling for refill transactions.
	pub confirm_poll_interval: Duration,
	pub confirm_poll_attempts: u32,
	/// How long an empty-pool `lease` waits on an in-flight refill.
	pub lease_wait: Duration,
}

struct PoolState {
	available: VecDeque<PaymasterCell>,
	/// Out-point -> job id of currently leased cells.
	leased: HashMap<OutPoint, String>,
}

/// The paymaster cell allocator.
pub struct PaymasterService {
	ckb: Arc<dyn CkbClient>,
	signer: Arc<dyn SignerInterface>,
	storage: Arc<StorageService>,
	options: PaymasterOptions,
	state: Mutex<PoolState>,
	refill_inflight: AtomicBool,
	/// Whether the most recent refill attempt failed; lets blocked leases
	/// surface `PoolExhausted` instead of spinning on a broken refill.
	refill_failed: AtomicBool,
	refill_done: Notify,
	events: Option<broadcast::Sender<RelayEvent>>,
}

impl PaymasterService {
	pub fn new(
		ckb: Arc<dyn CkbClient>,
		signer: Arc<dyn SignerInterface>,
		storage: Arc<StorageService>,
		options: PaymasterOptions,
	) -> Self {
		Self {
			ckb,
			signer,
			storage,
			options,
			state: Mutex::new(PoolState {
				available: VecDeque::new(),
				leased: HashMap::new(),
			}),
			refill_inflight: AtomicBool::new(false),
			refill_failed: AtomicBool::new(false),
			refill_done: Notify::new(),
			events: None,
		}
	}

	/// Attaches an event channel.
	pub fn with_events(mut self, events: broadcast::Sender<RelayEvent>) -> Self {
		self.events = Some(events);
		self
	}

	fn emit(&self, event: PaymasterEvent) {
		if let Some(tx) = &self.events {
			let _ = tx.send(RelayEvent::Paymaster(event));
		}
	}

	/// Number of cells currently available.
	pub fn available_count(&self) -> usize {
		self.state.lock().expect("pool lock poisoned").available.len()
	}

	/// The lock script owning pool cells.
	pub fn lock(&self) -> &Script {
		&self.options.lock
	}

	fn threshold_count(&self) -> usize {
		self.options.preset_count * self.options.refill_threshold_percent as usize / 100
	}

	/// Restores the pool from the last persisted snapshot.
	///
	/// Each snapshot cell is checked for liveness: cells spent by a
	/// confirmed sponsorship disappear, cells that were leased when the
	/// previous process died come back as available. Run before the
	/// worker starts.
	pub async fn recover(&self) -> Result<usize, PaymasterError> {
		let snapshot: Vec<PaymasterCell> = match self
			.storage
			.retrieve(StorageKey::Paymaster.as_str(), POOL_KEY)
			.await
		{
			Ok(cells) => cells,
			Err(StorageError::NotFound) => return Ok(0),
			Err(e) => return Err(e.into()),
		};

		let mut live = Vec::new();
		for cell in snapshot {
			if self.ckb.get_live_cell(&cell.out_point).await?.is_some() {
				live.push(cell);
			}
		}
		let recovered = live.len();
		{
			let mut state = self.state.lock().expect("pool lock poisoned");
			state.available = live.into();
			state.leased.clear();
		}
		tracing::info!(recovered, "Recovered paymaster pool");
		Ok(recovered)
	}

	async fn persist_pool(&self) -> Result<(), PaymasterError> {
		let snapshot: Vec<PaymasterCell> = {
			let state = self.state.lock().expect("pool lock poisoned");
			state
				.available
				.iter()
				.cloned()
				.chain(state.leased.keys().map(|out_point| PaymasterCell {
					out_point: out_point.clone(),
					capacity: self.options.cell_capacity,
				}))
				.collect()
		};
		self.storage
			.store(StorageKey::Paymaster.as_str(), POOL_KEY, &snapshot)
			.await?;
		Ok(())
	}

	/// Leases one cell for the given job.
	///
	/// The cell is removed from the available pool before this returns,
	/// independent of whether the lease later succeeds or fails. A pool
	/// below the refill threshold triggers a background refill without
	/// blocking; an empty pool blocks on the in-flight refill.
	pub async fn lease(
		self: &Arc<Self>,
		job_id: &str,
	) -> Result<CellLease, PaymasterError> {
		let deadline = tokio::time::Instant::now() + self.options.lease_wait;
		let mut refill_known_broken = false;
		loop {
			let (cell, below_threshold) = {
				let mut state = self.state.lock().expect("pool lock poisoned");
				let cell = state.available.pop_front();
				if let Some(cell) = &cell {
					state.leased.insert(cell.out_point.clone(), job_id.to_string());
				}
				let below = state.available.len() < self.threshold_count();
				(cell, below)
			};

			if let Some(cell) = cell {
				if below_threshold {
					self.trigger_refill();
				}
				tracing::debug!(out_point = %cell.out_point, job_id, "Leased paymaster cell");
				self.emit(PaymasterEvent::Leased {
					out_point: cell.out_point.clone(),
					job_id: job_id.to_string(),
				});
				return Ok(CellLease {
					service: Arc::clone(self),
					cell,
					settled: false,
				});
			}

			if refill_known_broken {
				return Err(PaymasterError::PoolExhausted(
					"refill produced no cells".into(),
				));
			}

			// Register for the wakeup before triggering, so a refill that
			// finishes immediately cannot be missed.
			let notified = self.refill_done.notified();
			self.trigger_refill();
			let now = tokio::time::Instant::now();
			if now >= deadline
				|| tokio::time::timeout(deadline - now, notified).await.is_err()
			{
				return Err(PaymasterError::PoolExhausted(
					"timed out waiting for refill".into(),
				));
			}
			refill_known_broken = self.refill_failed.load(Ordering::SeqCst)
				&& !self.refill_inflight.load(Ordering::SeqCst);
		}
	}

	/// Starts a background refill unless one is already in flight.
	fn trigger_refill(self: &Arc<Self>) {
		if self
			.refill_inflight
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}
		let service = Arc::clone(self);
		tokio::spawn(async move {
			match service.refill().await {
				Ok(added) => {
					service.refill_failed.store(false, Ordering::SeqCst);
					tracing::info!(added, "Paymaster pool refilled");
				}
				Err(e) => {
					service.refill_failed.store(true, Ordering::SeqCst);
					tracing::error!(error = %e, "Paymaster refill failed");
				}
			}
			service.refill_inflight.store(false, Ordering::SeqCst);
			// Wake blocked leases in both cases; a failed refill lets them
			// surface PoolExhausted instead of hanging.
			service.refill_done.notify_waiters();
		});
	}

	/// Builds, signs, broadcasts, and confirms a funding transaction that
	/// splits the parent cell into `preset_count` pool cells plus change.
	///
	/// Returns the number of cells added. The change output becomes the
	/// next parent and is persisted so refills survive restarts.
	pub async fn refill(&self) -> Result<usize, PaymasterError> {
		let parent: OutPoint = match self
			.storage
			.retrieve(StorageKey::Paymaster.as_str(), PARENT_KEY)
			.await
		{
			Ok(parent) => parent,
			Err(StorageError::NotFound) => self.options.initial_parent.clone(),
			Err(e) => return Err(e.into()),
		};

		let live = self
			.ckb
			.get_live_cell(&parent)
			.await?
			.ok_or_else(|| PaymasterError::RefillFailed(format!("parent cell {} is not live", parent)))?;

		let count = self.options.preset_count;
		let needed = (count as u64)
			.saturating_mul(self.options.cell_capacity)
			.saturating_add(self.options.refill_fee);
		if live.output.capacity <= needed {
			return Err(PaymasterError::RefillFailed(format!(
				"parent capacity {} cannot fund {} cells",
				live.output.capacity, count
			)));
		}
		let change = live.output.capacity - needed;

		let mut outputs = vec![
			CellOutput {
				capacity: self.options.cell_capacity,
				lock: self.options.lock.clone(),
				type_: None,
			};
			count
		];
		outputs.push(CellOutput {
			capacity: change,
			lock: self.options.lock.clone(),
			type_: None,
		});
		let funding_tx = CkbRawTransaction {
			version: 0,
			// The signer service completes lock cell deps.
			cell_deps: vec![],
			header_deps: vec![],
			inputs: vec![CellInput {
				previous_output: parent,
				since: "0x0".to_string(),
			}],
			outputs_data: vec!["0x".to_string(); count + 1],
			witnesses: vec!["0x".to_string()],
			outputs,
		};

		let signed = self.signer.sign_transaction(&funding_tx).await?;
		let tx_hash = self.ckb.send_transaction(&signed).await?;
		self.wait_committed(&tx_hash).await?;

		{
			let mut state = self.state.lock().expect("pool lock poisoned");
			for index in 0..count {
				state.available.push_back(PaymasterCell {
					out_point: OutPoint {
						tx_hash: tx_hash.clone(),
						index: index as u32,
					},
					capacity: self.options.cell_capacity,
				});
			}
		}
		self.storage
			.store(
				StorageKey::Paymaster.as_str(),
				PARENT_KEY,
				&OutPoint {
					tx_hash: tx_hash.clone(),
					index: count as u32,
				},
			)
			.await?;
		self.persist_pool().await?;
		self.emit(PaymasterEvent::Refilled { added: count });
		self.refill_done.notify_waiters();
		Ok(count)
	}

	async fn wait_committed(&self, tx_hash: &str) -> Result<(), PaymasterError> {
		for _ in 0..self.options.confirm_poll_attempts {
			match self.ckb.get_tx_status(tx_hash).await? {
				TxStatus::Committed => return Ok(()),
				TxStatus::Rejected(reason) => {
					return Err(PaymasterError::RefillFailed(format!(
						"funding transaction rejected: {}",
						reason
					)))
				}
				_ => tokio::time::sleep(self.options.confirm_poll_interval).await,
			}
		}
		Err(PaymasterError::RefillFailed(format!(
			"funding transaction {} not committed in time",
			tx_hash
		)))
	}

	/// Marks a leased cell as spent: its sponsoring transaction confirmed
	/// on-chain and the cell no longer exists.
	pub fn spend(&self, out_point: &OutPoint) -> Result<(), PaymasterError> {
		let mut state = self.state.lock().expect("pool lock poisoned");
		state
			.leased
			.remove(out_point)
			.ok_or_else(|| PaymasterError::NotLeased(out_point.to_string()))?;
		drop(state);
		tracing::debug!(out_point = %out_point, "Paymaster cell spent");
		self.emit(PaymasterEvent::Spent {
			out_point: out_point.clone(),
		});
		Ok(())
	}

	/// Returns a leased cell to the available pool.
	pub fn unspend(&self, out_point: &OutPoint) -> Result<(), PaymasterError> {
		let capacity = self.options.cell_capacity;
		let mut state = self.state.lock().expect("pool lock poisoned");
		state
			.leased
			.remove(out_point)
			.ok_or_else(|| PaymasterError::NotLeased(out_point.to_string()))?;
		state.available.push_back(PaymasterCell {
			out_point: out_point.clone(),
			capacity,
		});
		drop(state);
		tracing::debug!(out_point = %out_point, "Paymaster cell returned");
		self.emit(PaymasterEvent::Returned {
			out_point: out_point.clone(),
		});
		// A waiter blocked on an empty pool can take the returned cell.
		self.refill_done.notify_waiters();
		Ok(())
	}
}

/// Scoped lease of one paymaster cell.
///
/// Dropping the guard without calling [`CellLease::spend`] returns the
/// cell to the pool, which makes every failure path after a successful
/// lease leak-free by construction.
pub struct CellLease {
	service: Arc<PaymasterService>,
	cell: PaymasterCell,
	settled: bool,
}

impl std::fmt::Debug for CellLease {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CellLease")
			.field("cell", &self.cell)
			.field("settled", &self.settled)
			.finish_non_exhaustive()
	}
}

impl CellLease {
	pub fn cell(&self) -> &PaymasterCell {
		&self.cell
	}

	pub fn out_point(&self) -> &OutPoint {
		&self.cell.out_point
	}

	/// Finalizes the lease: the sponsoring transaction confirmed.
	pub fn spend(mut self) {
		self.settled = true;
		if let Err(e) = self.service.spend(&self.cell.out_point) {
			tracing::error!(out_point = %self.cell.out_point, error = %e, "Spend bookkeeping failed");
		}
	}

	/// Explicitly returns the cell (same as dropping, but visible).
	pub fn release(mut self) {
		self.settled = true;
		if let Err(e) = self.service.unspend(&self.cell.out_point) {
			tracing::error!(out_point = %self.cell.out_point, error = %e, "Return bookkeeping failed");
		}
	}
}

impl Drop for CellLease {
	fn drop(&mut self) {
		if !self.settled {
			if let Err(e) = self.service.unspend(&self.cell.out_point) {
				tracing::error!(out_point = %self.cell.out_point, error = %e, "Return bookkeeping failed");
			}
		}
	}
}
