//! In-memory fakes and fixtures shared by the crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use relay_bitcoin::{
	BitcoinDataSource, BitcoinError, BtcTransaction, BtcTxOut, BtcTxStatus, SpvClient, SpvError,
	SpvProof,
};
use relay_ckb::{
	rgbpp::{compute_commitment, RgbppScripts},
	CkbClient, CkbClientError, LiveCell, SignerError, SignerInterface, TxStatus,
};
use relay_paymaster::{PaymasterOptions, PaymasterService};
use relay_queue::{JobQueue, QueueOptions};
use relay_storage::implementations::memory::MemoryStorage;
use relay_storage::StorageService;
use relay_types::{
	decode_hex32, encode_hex, CellInput, CellOutput, CkbRawTransaction, CkbVirtualResult,
	OutPoint, Script, ScriptHashType, TransactionRequest,
};

use crate::event_bus::EventBus;
use crate::settler::{SettleJob, Settler, SettlerConfig};

pub const RGBPP_HASH: &str =
	"0x1111111111111111111111111111111111111111111111111111111111111111";
pub const TIME_LOCK_HASH: &str =
	"0x2222222222222222222222222222222222222222222222222222222222222222";

pub fn scripts() -> RgbppScripts {
	RgbppScripts::new(RGBPP_HASH, TIME_LOCK_HASH)
}

/// Fake Bitcoin data source with settable chain state.
pub struct FakeBtc {
	pub txs: Mutex<HashMap<String, BtcTransaction>>,
	pub raw_hex: Mutex<HashMap<String, String>>,
	pub tip: AtomicU64,
	pub block_hashes: Mutex<HashMap<u64, String>>,
	pub block_txids: Mutex<HashMap<String, Vec<String>>>,
	pub block_hash_calls: AtomicU64,
	/// Artificial latency on `get_chain_tip`, for re-entrancy tests.
	pub tip_delay: Mutex<Duration>,
}

impl FakeBtc {
	pub fn new() -> Self {
		Self {
			txs: Mutex::new(HashMap::new()),
			raw_hex: Mutex::new(HashMap::new()),
			tip: AtomicU64::new(0),
			block_hashes: Mutex::new(HashMap::new()),
			block_txids: Mutex::new(HashMap::new()),
			block_hash_calls: AtomicU64::new(0),
			tip_delay: Mutex::new(Duration::ZERO),
		}
	}

	pub fn add_block(&self, height: u64, txids: Vec<String>) {
		let hash = format!("blockhash-{}", height);
		self.block_hashes.lock().unwrap().insert(height, hash.clone());
		self.block_txids.lock().unwrap().insert(hash, txids);
	}
}

#[async_trait]
impl BitcoinDataSource for FakeBtc {
	async fn get_tx(&self, txid: &str) -> Result<BtcTransaction, BitcoinError> {
		self.txs
			.lock()
			.unwrap()
			.get(txid)
			.cloned()
			.ok_or_else(|| BitcoinError::TxNotFound(txid.to_string()))
	}

	async fn get_raw_tx_hex(&self, txid: &str) -> Result<String, BitcoinError> {
		self.raw_hex
			.lock()
			.unwrap()
			.get(txid)
			.cloned()
			.ok_or_else(|| BitcoinError::TxNotFound(txid.to_string()))
	}

	async fn get_chain_tip(&self) -> Result<u64, BitcoinError> {
		let delay = *self.tip_delay.lock().unwrap();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		Ok(self.tip.load(Ordering::SeqCst))
	}

	async fn get_block_hash(&self, height: u64) -> Result<String, BitcoinError> {
		self.block_hash_calls.fetch_add(1, Ordering::SeqCst);
		self.block_hashes
			.lock()
			.unwrap()
			.get(&height)
			.cloned()
			.ok_or_else(|| BitcoinError::InvalidResponse(format!("no block at {}", height)))
	}

	async fn get_block_txids(&self, block_hash: &str) -> Result<Vec<String>, BitcoinError> {
		Ok(self
			.block_txids
			.lock()
			.unwrap()
			.get(block_hash)
			.cloned()
			.unwrap_or_default())
	}
}

/// Fake SPV oracle that can be toggled ready/unready.
pub struct FakeSpv {
	pub ready: AtomicBool,
	pub proof: SpvProof,
}

impl FakeSpv {
	pub fn new() -> Self {
		Self {
			ready: AtomicBool::new(true),
			proof: SpvProof {
				spv_client: OutPoint {
					tx_hash: format!("0x{}", "44".repeat(32)),
					index: 0,
				},
				proof: "0xaabbccdd".into(),
			},
		}
	}
}

#[async_trait]
impl SpvClient for FakeSpv {
	async fn get_tx_proof(&self, txid: &str, _confirmations: u64) -> Result<SpvProof, SpvError> {
		if !self.ready.load(Ordering::SeqCst) {
			return Err(SpvError::ProofNotReady(txid.to_string()));
		}
		Ok(self.proof.clone())
	}
}

/// Fake CKB node: records sent transactions, commits them instantly, and
/// maintains a live-cell set so paymaster refills work end to end.
pub struct FakeCkbNode {
	pub sent: Mutex<Vec<CkbRawTransaction>>,
	pub statuses: Mutex<HashMap<String, TxStatus>>,
	pub live: Mutex<HashMap<OutPoint, u64>>,
	/// Number of upcoming sends to reject with a low-fee pool error.
	pub reject_low_fee: AtomicU64,
	counter: AtomicU64,
}

impl FakeCkbNode {
	pub fn new() -> Self {
		Self {
			sent: Mutex::new(Vec::new()),
			statuses: Mutex::new(HashMap::new()),
			live: Mutex::new(HashMap::new()),
			reject_low_fee: AtomicU64::new(0),
			counter: AtomicU64::new(0),
		}
	}

	pub fn sent_count(&self) -> usize {
		self.sent.lock().unwrap().len()
	}
}

#[async_trait]
impl CkbClient for FakeCkbNode {
	async fn send_transaction(&self, tx: &CkbRawTransaction) -> Result<String, CkbClientError> {
		if self
			.reject_low_fee
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
		{
			return Err(CkbClientError::PoolRejectedLowFee(
				"PoolRejectedTransactionByMinFeeRate".into(),
			));
		}
		let n = self.counter.fetch_add(1, Ordering::SeqCst);
		let tx_hash = format!("0x{:064x}", n + 0x9000);
		{
			let mut live = self.live.lock().unwrap();
			for input in &tx.inputs {
				live.remove(&input.previous_output);
			}
			for (index, output) in tx.outputs.iter().enumerate() {
				live.insert(
					OutPoint {
						tx_hash: tx_hash.clone(),
						index: index as u32,
					},
					output.capacity,
				);
			}
		}
		self.sent.lock().unwrap().push(tx.clone());
		self.statuses
			.lock()
			.unwrap()
			.insert(tx_hash.clone(), TxStatus::Committed);
		Ok(tx_hash)
	}

	async fn get_tx_status(&self, tx_hash: &str) -> Result<TxStatus, CkbClientError> {
		Ok(self
			.statuses
			.lock()
			.unwrap()
			.get(tx_hash)
			.cloned()
			.unwrap_or(TxStatus::Unknown))
	}

	async fn get_live_cell(
		&self,
		out_point: &OutPoint,
	) -> Result<Option<LiveCell>, CkbClientError> {
		Ok(self.live.lock().unwrap().get(out_point).map(|capacity| LiveCell {
			output: CellOutput {
				capacity: *capacity,
				lock: pool_lock(),
				type_: None,
			},
		}))
	}
}

/// Fake signer; can be told to fail once a sponsorship input is present.
pub struct FakeSigner {
	pub fail_on_sponsor: AtomicBool,
}

impl FakeSigner {
	pub fn new() -> Self {
		Self {
			fail_on_sponsor: AtomicBool::new(false),
		}
	}
}

#[async_trait]
impl SignerInterface for FakeSigner {
	async fn sign_transaction(
		&self,
		tx: &CkbRawTransaction,
	) -> Result<CkbRawTransaction, SignerError> {
		if self.fail_on_sponsor.load(Ordering::SeqCst) && tx.inputs.len() > 1 {
			return Err(SignerError::Rejected("no key for sponsor input".into()));
		}
		Ok(tx.clone())
	}
}

pub fn pool_lock() -> Script {
	Script {
		code_hash: format!("0x{}", "aa".repeat(32)),
		hash_type: ScriptHashType::Type,
		args: "0x".into(),
	}
}

fn rgbpp_placeholder_lock() -> Script {
	let mut args = vec![0x01, 0x00, 0x00, 0x00];
	args.extend_from_slice(&[0u8; 32]);
	Script {
		code_hash: RGBPP_HASH.to_string(),
		hash_type: ScriptHashType::Type,
		args: encode_hex(&args),
	}
}

/// Builds a valid request whose commitment matches its virtual tx.
pub fn fixture_request(txid: &str, needs_paymaster: bool) -> TransactionRequest {
	let ckb_raw_tx = CkbRawTransaction {
		version: 0,
		cell_deps: vec![],
		header_deps: vec![],
		inputs: vec![CellInput {
			previous_output: OutPoint {
				tx_hash: format!("0x{}", "33".repeat(32)),
				index: 0,
			},
			since: "0x0".into(),
		}],
		outputs: vec![CellOutput {
			capacity: 14_200_000_000,
			lock: rgbpp_placeholder_lock(),
			type_: None,
		}],
		outputs_data: vec!["0x00".into()],
		witnesses: vec![],
	};
	let commitment = compute_commitment(&ckb_raw_tx, &scripts()).unwrap();
	TransactionRequest {
		btc_txid: txid.to_string(),
		ckb_virtual_result: CkbVirtualResult {
			ckb_raw_tx,
			commitment: hex::encode(commitment),
			needs_paymaster_cell: needs_paymaster,
			sum_inputs_capacity: "14200000000".into(),
		},
		context: None,
	}
}

/// Minimal legacy Bitcoin transaction bytes, hex-encoded.
pub fn legacy_raw_tx_hex() -> String {
	let mut tx = Vec::new();
	tx.extend_from_slice(&2u32.to_le_bytes());
	tx.push(1); // one input
	tx.extend_from_slice(&[0x11; 32]);
	tx.extend_from_slice(&0u32.to_le_bytes());
	tx.push(0);
	tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
	tx.push(1); // one output
	tx.extend_from_slice(&50_000u64.to_le_bytes());
	tx.push(1);
	tx.push(0x51);
	tx.extend_from_slice(&0u32.to_le_bytes());
	hex::encode(tx)
}

/// Installs a confirmed Bitcoin transaction carrying the request's
/// commitment and returns the matching request.
pub fn install_fixture(btc: &FakeBtc, txid: &str, needs_paymaster: bool) -> TransactionRequest {
	let request = fixture_request(txid, needs_paymaster);
	let commitment = decode_hex32(&request.ckb_virtual_result.commitment).unwrap();
	let tx = BtcTransaction {
		txid: txid.to_string(),
		outputs: vec![BtcTxOut {
			value_sats: 0,
			script_pubkey: format!("6a20{}", hex::encode(commitment)),
		}],
		status: BtcTxStatus {
			confirmed: true,
			block_height: Some(100),
			block_hash: Some("blockhash-100".into()),
		},
	};
	btc.txs.lock().unwrap().insert(txid.to_string(), tx);
	btc.raw_hex
		.lock()
		.unwrap()
		.insert(txid.to_string(), legacy_raw_tx_hex());
	btc.tip.store(100, Ordering::SeqCst);
	request
}

pub fn settler_config() -> SettlerConfig {
	SettlerConfig {
		min_confirmations: 1,
		base_delay: Duration::from_secs(30),
		max_attempts: 6,
		confirm_poll_interval: Duration::from_millis(1),
		confirm_poll_attempts: 5,
		scripts: scripts(),
		fee_check: None,
		sponsor_fee: 10,
	}
}

pub fn paymaster_parent() -> OutPoint {
	OutPoint {
		tx_hash: format!("0x{}", "01".repeat(32)),
		index: 0,
	}
}

/// Everything a settlement test needs, wired against the fakes.
pub struct Harness {
	pub btc: Arc<FakeBtc>,
	pub spv: Arc<FakeSpv>,
	pub ckb: Arc<FakeCkbNode>,
	pub signer: Arc<FakeSigner>,
	pub queue: Arc<JobQueue<SettleJob>>,
	pub paymaster: Arc<PaymasterService>,
	pub settler: Arc<Settler>,
}

pub fn harness(config: SettlerConfig) -> Harness {
	let btc = Arc::new(FakeBtc::new());
	let spv = Arc::new(FakeSpv::new());
	let ckb = Arc::new(FakeCkbNode::new());
	let signer = Arc::new(FakeSigner::new());
	// A funding parent so paymaster refills can run.
	ckb.live.lock().unwrap().insert(paymaster_parent(), 100_000);

	let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
	let queue = Arc::new(JobQueue::new(
		Arc::clone(&storage),
		QueueOptions {
			base_delay: Duration::ZERO,
			max_attempts: 3,
			lease_timeout: Duration::from_secs(60),
			poll_interval: Duration::from_millis(10),
			retention: None,
		},
	));
	let paymaster = Arc::new(PaymasterService::new(
		ckb.clone(),
		signer.clone(),
		storage,
		PaymasterOptions {
			preset_count: 4,
			cell_capacity: 1_000,
			refill_threshold_percent: 30,
			refill_fee: 100,
			initial_parent: paymaster_parent(),
			lock: pool_lock(),
			confirm_poll_interval: Duration::from_millis(1),
			confirm_poll_attempts: 5,
			lease_wait: Duration::from_secs(2),
		},
	));
	let settler = Arc::new(Settler::new(
		btc.clone(),
		spv.clone(),
		ckb.clone(),
		signer.clone(),
		Some(paymaster.clone()),
		Arc::clone(&queue),
		config,
		EventBus::default(),
	));
	Harness {
		btc,
		spv,
		ckb,
		signer,
		queue,
		paymaster,
		settler,
	}
}
