//! Transaction settlement state machine.
//!
//! One job = one Bitcoin txid bound to a CKB virtual transaction. The
//! handler composes four operations: `verify` (cross-chain commitment),
//! `complete` (txid substitution + SPV unlock witness), `sponsor`
//! (optional paymaster cell), and `broadcast_and_confirm`. Each run ends
//! in one of three typed outcomes: completed with the CKB tx hash,
//! deferred while waiting on an external event, or an error that the
//! queue either retries with backoff or records as terminal.
//!
//! Every wait on the two chains is expressed as a deferral through the
//! queue rather than a sleep, with one exception: the short bounded
//! confirmation poll right after broadcast, which holds its worker slot
//! only for the post-broadcast window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_bitcoin::{
	op_return::extract_commitment, raw_tx::strip_witnesses, BitcoinDataSource, BitcoinError,
	BtcTransaction, SpvClient, SpvError,
};
use relay_ckb::{
	rgbpp::{
		append_spv_cell_dep, apply_fee_cell, build_unlock_witness, compute_commitment,
		set_unlock_witness, substitute_txid, RgbppError, RgbppScripts,
	},
	CkbClient, CkbClientError, SignerError, SignerInterface, TxStatus,
};
use relay_paymaster::{CellLease, PaymasterError, PaymasterService};
use relay_queue::{backoff_delay, HandlerError, JobHandler, JobOutcome, JobQueue, QueueError};
use relay_types::{
	decode_hex, decode_hex32, now_secs, truncate_id, Job, SettlementEvent, TransactionRequest,
};

use crate::event_bus::EventBus;

/// Queue payload of a settlement job.
///
/// Wraps the caller's request with the relay's own durable bookkeeping:
/// the fee-bump repair flag and the broadcast hash, both of which must
/// survive redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleJob {
	pub request: TransactionRequest,
	/// Set by the low-fee repair path; forces sponsorship on the next run.
	#[serde(default)]
	pub fee_bumped: bool,
	/// Recorded at broadcast so a redelivered job resumes at the
	/// confirmation poll instead of re-sponsoring and re-broadcasting.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub broadcast_tx_hash: Option<String>,
}

impl SettleJob {
	pub fn new(request: TransactionRequest) -> Self {
		Self {
			request,
			fee_bumped: false,
			broadcast_tx_hash: None,
		}
	}

	fn needs_paymaster(&self) -> bool {
		self.request.ckb_virtual_result.needs_paymaster_cell || self.fee_bumped
	}
}

/// Sponsorship fee verification parameters.
#[derive(Debug, Clone)]
pub struct FeeCheck {
	/// scriptPubKey the Bitcoin transaction must have paid, hex-encoded.
	pub recipient_script_hex: String,
	pub min_fee_sats: u64,
}

/// Settler tuning parameters.
#[derive(Debug, Clone)]
pub struct SettlerConfig {
	/// Bitcoin confirmations required before completion.
	pub min_confirmations: u64,
	/// Base deferral delay; also the queue's backoff base, from which the
	/// not-found tolerance window is derived.
	pub base_delay: Duration,
	pub max_attempts: u32,
	/// Post-broadcast confirmation poll.
	pub confirm_poll_interval: Duration,
	pub confirm_poll_attempts: u32,
	/// Lock code hashes that embed a Bitcoin txid.
	pub scripts: RgbppScripts,
	/// Optional sponsorship fee verification.
	pub fee_check: Option<FeeCheck>,
	/// Fee deducted from a sponsored paymaster cell, in shannons.
	pub sponsor_fee: u64,
}

impl SettlerConfig {
	/// How long a missing Bitcoin transaction is tolerated before the job
	/// fails terminally. Matches the queue's total backoff span so a
	/// transaction that never appears cannot retry forever.
	fn not_found_tolerance(&self) -> Duration {
		backoff_delay(self.base_delay, self.max_attempts)
	}
}

/// Errors raised inside the settlement pipeline.
///
/// Classification into fatal vs retryable happens once, at the
/// [`JobHandler`] boundary; lower operations just return the typed error.
#[derive(Debug, Error)]
pub enum SettleError {
	/// The request can never settle: missing OP_RETURN, commitment
	/// mismatch, underpaid sponsorship fee, or a transaction that never
	/// appeared within tolerance. Terminal.
	#[error("Invalid request: {0}")]
	Invalid(String),
	/// Sponsorship required but no paymaster is configured. Terminal.
	#[error("Transaction needs a paymaster cell but none is configured")]
	PaymasterUnavailable,
	#[error("Bitcoin source error: {0}")]
	Bitcoin(#[from] BitcoinError),
	#[error("SPV oracle error: {0}")]
	Spv(#[from] SpvError),
	#[error("CKB client error: {0}")]
	Ckb(#[from] CkbClientError),
	#[error("Signer error: {0}")]
	Signer(#[from] SignerError),
	#[error("Transaction build error: {0}")]
	Rgbpp(#[from] RgbppError),
	#[error("Paymaster error: {0}")]
	Paymaster(#[from] PaymasterError),
	#[error("Queue error: {0}")]
	Queue(#[from] QueueError),
	/// The CKB pool rejected the transaction after broadcast.
	#[error("CKB transaction rejected: {0}")]
	CkbRejected(String),
	/// The confirmation poll window elapsed; the transaction may still
	/// commit, so the broadcast hash stays recorded for the next run.
	#[error("CKB transaction {0} not confirmed within the poll window")]
	ConfirmTimeout(String),
}

/// Waits that defer the job instead of failing it.
#[derive(Debug)]
enum Wait {
	BtcUnconfirmed { have: u64, need: u64 },
	BtcNotFound,
	SpvProofNotReady,
	FeeBumped,
}

impl std::fmt::Display for Wait {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Wait::BtcUnconfirmed { have, need } => {
				write!(f, "bitcoin transaction unconfirmed ({}/{})", have, need)
			}
			Wait::BtcNotFound => write!(f, "bitcoin transaction not found yet"),
			Wait::SpvProofNotReady => write!(f, "spv proof not ready"),
			Wait::FeeBumped => write!(f, "fee bumped, retrying with paymaster"),
		}
	}
}

/// Internal settlement result, mapped onto [`JobOutcome`] at the handler
/// boundary.
enum Settled {
	Done(String),
	Wait(Wait),
}

/// The settlement state machine.
pub struct Settler {
	btc: Arc<dyn BitcoinDataSource>,
	spv: Arc<dyn SpvClient>,
	ckb: Arc<dyn CkbClient>,
	signer: Arc<dyn SignerInterface>,
	paymaster: Option<Arc<PaymasterService>>,
	queue: Arc<JobQueue<SettleJob>>,
	config: SettlerConfig,
	events: EventBus,
}

impl Settler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		btc: Arc<dyn BitcoinDataSource>,
		spv: Arc<dyn SpvClient>,
		ckb: Arc<dyn CkbClient>,
		signer: Arc<dyn SignerInterface>,
		paymaster: Option<Arc<PaymasterService>>,
		queue: Arc<JobQueue<SettleJob>>,
		config: SettlerConfig,
		events: EventBus,
	) -> Self {
		Self {
			btc,
			spv,
			ckb,
			signer,
			paymaster,
			queue,
			config,
			events,
		}
	}

	/// Verifies the cross-chain commitment binding.
	///
	/// The CKB-side commitment is recomputed over the placeholder form of
	/// the virtual transaction, so the check does not depend on which
	/// concrete txid gets substituted later. Both a missing OP_RETURN and
	/// any mismatch are invalid, not retryable.
	fn verify(
		&self,
		request: &TransactionRequest,
		btc_tx: &BtcTransaction,
	) -> Result<(), SettleError> {
		let Some(actual) = extract_commitment(btc_tx) else {
			return Err(SettleError::Invalid(
				"bitcoin transaction has no OP_RETURN commitment".into(),
			));
		};
		let declared = decode_hex32(&request.ckb_virtual_result.commitment)
			.map_err(|e| SettleError::Invalid(format!("declared commitment: {}", e)))?;
		let recomputed =
			compute_commitment(&request.ckb_virtual_result.ckb_raw_tx, &self.config.scripts)?;

		if recomputed != declared {
			return Err(SettleError::Invalid(
				"commitment does not match the virtual transaction".into(),
			));
		}
		if actual != declared {
			return Err(SettleError::Invalid(
				"commitment does not match the OP_RETURN payload".into(),
			));
		}
		Ok(())
	}

	/// Runs one settlement attempt for a job.
	async fn settle(&self, job: &Job<SettleJob>) -> Result<Settled, SettleError> {
		let request = &job.payload.request;
		let txid = &request.btc_txid;

		// Fetch the Bitcoin transaction; "not found" is tolerated while
		// the job is young enough that the transaction may still appear.
		let btc_tx = match self.btc.get_tx(txid).await {
			Ok(tx) => tx,
			Err(BitcoinError::TxNotFound(_)) => {
				let tolerance = self.config.not_found_tolerance();
				if job.age_secs(now_secs()) < tolerance.as_secs() {
					return Ok(Settled::Wait(Wait::BtcNotFound));
				}
				return Err(SettleError::Invalid(format!(
					"bitcoin transaction {} never appeared within {}s",
					txid,
					tolerance.as_secs()
				)));
			}
			Err(e) => return Err(e.into()),
		};

		self.verify(request, &btc_tx)?;

		let tip = self.btc.get_chain_tip().await?;
		let confirmations = btc_tx.confirmations(tip);
		if confirmations < self.config.min_confirmations {
			return Ok(Settled::Wait(Wait::BtcUnconfirmed {
				have: confirmations,
				need: self.config.min_confirmations,
			}));
		}
		self.events.publish(relay_types::RelayEvent::Settlement(
			SettlementEvent::Verified { id: job.id.clone() },
		));

		// A previous run already broadcast: resume at the confirmation
		// poll. The sponsorship cell of that run was settled then.
		if let Some(tx_hash) = &job.payload.broadcast_tx_hash {
			tracing::info!(
				job_id = %truncate_id(&job.id),
				tx_hash = %truncate_id(tx_hash),
				"Resuming at confirmation poll"
			);
			return self.await_confirmation(&job.id, tx_hash.clone(), None).await;
		}

		// Complete: substitute the real txid and append the unlock witness
		// derived from the SPV proof and the witness-stripped transaction.
		let txid_bytes = decode_hex32(txid)
			.map_err(|e| SettleError::Invalid(format!("btc_txid: {}", e)))?;
		let mut tx = substitute_txid(
			&request.ckb_virtual_result.ckb_raw_tx,
			&self.config.scripts,
			&txid_bytes,
		)?;

		let raw_hex = self.btc.get_raw_tx_hex(txid).await?;
		let raw = decode_hex(&raw_hex)
			.map_err(|e| SettleError::Bitcoin(BitcoinError::InvalidResponse(e.to_string())))?;
		let stripped = strip_witnesses(&raw)?;

		let proof = match self
			.spv
			.get_tx_proof(txid, self.config.min_confirmations)
			.await
		{
			Ok(proof) => proof,
			Err(SpvError::ProofNotReady(_)) => return Ok(Settled::Wait(Wait::SpvProofNotReady)),
			Err(e) => return Err(e.into()),
		};
		append_spv_cell_dep(&mut tx, proof.spv_client.clone());
		let witness = build_unlock_witness(&proof, &stripped)?;
		set_unlock_witness(&mut tx, witness);
		self.events.publish(relay_types::RelayEvent::Settlement(
			SettlementEvent::WitnessesAppended { id: job.id.clone() },
		));

		// Sponsor: lease a paymaster cell when the request (or the fee
		// bump repair) asks for one. From the lease onward every error
		// path returns the cell: the guard releases on drop.
		let lease = if job.payload.needs_paymaster() {
			let paymaster = self
				.paymaster
				.as_ref()
				.ok_or(SettleError::PaymasterUnavailable)?;
			if let Some(fee_check) = &self.config.fee_check {
				let paid = btc_tx.paid_to_script(&fee_check.recipient_script_hex);
				if paid < fee_check.min_fee_sats {
					return Err(SettleError::Invalid(format!(
						"sponsorship fee underpaid: {} < {} sats",
						paid, fee_check.min_fee_sats
					)));
				}
			}
			let lease = paymaster.lease(&job.id).await?;
			apply_fee_cell(
				&mut tx,
				lease.cell(),
				paymaster.lock().clone(),
				self.config.sponsor_fee,
			)?;
			self.events.publish(relay_types::RelayEvent::Settlement(
				SettlementEvent::PaymasterAppended {
					id: job.id.clone(),
					out_point: lease.out_point().clone(),
				},
			));
			Some(lease)
		} else {
			None
		};

		let signed = self.signer.sign_transaction(&tx).await?;

		// Broadcast. A low-fee pool rejection gets one deterministic
		// repair: flag the job for sponsorship and defer; the flag is
		// persisted so redelivery keeps the bumped fee.
		let tx_hash = match self.ckb.send_transaction(&signed).await {
			Ok(tx_hash) => tx_hash,
			Err(CkbClientError::PoolRejectedLowFee(message)) => {
				drop(lease);
				if !job.payload.needs_paymaster() {
					tracing::warn!(
						job_id = %truncate_id(&job.id),
						"Pool rejected for low fee, bumping via paymaster"
					);
					self.queue
						.update_payload(&job.id, |payload| payload.fee_bumped = true)
						.await?;
					return Ok(Settled::Wait(Wait::FeeBumped));
				}
				return Err(SettleError::CkbRejected(message));
			}
			Err(e) => return Err(e.into()),
		};
		self.queue
			.update_payload(&job.id, |payload| {
				payload.broadcast_tx_hash = Some(tx_hash.clone());
			})
			.await?;
		self.events.publish(relay_types::RelayEvent::Settlement(
			SettlementEvent::Broadcast {
				id: job.id.clone(),
				tx_hash: tx_hash.clone(),
			},
		));

		self.await_confirmation(&job.id, tx_hash, lease).await
	}

	/// Bounded fixed-interval poll for CKB confirmation.
	///
	/// On commit the sponsorship cell is spent; on rejection or poll
	/// exhaustion it is returned (via the guard) and the error re-raised.
	async fn await_confirmation(
		&self,
		job_id: &str,
		tx_hash: String,
		mut lease: Option<CellLease>,
	) -> Result<Settled, SettleError> {
		for attempt in 0..self.config.confirm_poll_attempts {
			match self.ckb.get_tx_status(&tx_hash).await? {
				TxStatus::Committed => {
					if let Some(lease) = lease.take() {
						lease.spend();
					}
					self.events.publish(relay_types::RelayEvent::Settlement(
						SettlementEvent::Confirmed {
							id: job_id.to_string(),
							tx_hash: tx_hash.clone(),
						},
					));
					return Ok(Settled::Done(tx_hash));
				}
				TxStatus::Rejected(reason) => {
					// The broadcast is void; clear the recorded hash so
					// the next attempt rebuilds and re-broadcasts.
					self.queue
						.update_payload(job_id, |payload| payload.broadcast_tx_hash = None)
						.await?;
					return Err(SettleError::CkbRejected(reason));
				}
				_ => {
					if attempt + 1 < self.config.confirm_poll_attempts {
						tokio::time::sleep(self.config.confirm_poll_interval).await;
					}
				}
			}
		}
		Err(SettleError::ConfirmTimeout(tx_hash))
	}
}

/// Splits settlement errors by retry policy.
fn classify(error: SettleError) -> HandlerError {
	match error {
		SettleError::Invalid(_) | SettleError::PaymasterUnavailable | SettleError::Rgbpp(_) => {
			HandlerError::fatal(error)
		}
		_ => HandlerError::retryable(error),
	}
}

#[async_trait]
impl JobHandler<SettleJob> for Settler {
	async fn process(&self, job: &Job<SettleJob>) -> Result<JobOutcome, HandlerError> {
		match self.settle(job).await {
			Ok(Settled::Done(tx_hash)) => Ok(JobOutcome::Completed(tx_hash)),
			Ok(Settled::Wait(wait)) => Ok(JobOutcome::Deferred {
				reason: wait.to_string(),
				delay: self.config.base_delay,
			}),
			Err(error) => Err(classify(error)),
		}
	}
}
