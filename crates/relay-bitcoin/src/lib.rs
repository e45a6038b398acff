//! Bitcoin data provider module for the RGB++ relay system.
//!
//! This module defines the capability the settlement pipeline needs from a
//! Bitcoin data source, with two concrete implementations selected at
//! construction time: an Esplora-style REST API and Bitcoin Core JSON-RPC.
//! It also carries the OP_RETURN commitment extraction, raw-transaction
//! witness stripping, and the SPV proof oracle client.

use async_trait::async_trait;
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod core_rpc;
	pub mod esplora;
}

/// OP_RETURN commitment extraction.
pub mod op_return;
/// Raw transaction parsing and witness stripping.
pub mod raw_tx;
/// SPV proof oracle client.
pub mod spv;

pub use spv::{HttpSpvClient, SpvClient, SpvError, SpvProof};

/// Errors that can occur when talking to a Bitcoin data source.
#[derive(Debug, Error)]
pub enum BitcoinError {
	/// The transaction is unknown to the source. Distinguishable from
	/// other failures because settlement treats it as "not yet" within a
	/// tolerance window and as fatal after.
	#[error("Transaction not found: {0}")]
	TxNotFound(String),
	/// Transport-level failure.
	#[error("HTTP error: {0}")]
	Http(String),
	/// The source returned a JSON-RPC error.
	#[error("RPC error {code}: {message}")]
	Rpc { code: i64, message: String },
	/// The source answered with something the relay cannot interpret.
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	/// Raw transaction bytes failed to parse.
	#[error("Malformed transaction: {0}")]
	MalformedTx(String),
}

/// An output of a Bitcoin transaction as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtcTxOut {
	/// Amount in satoshis.
	pub value_sats: u64,
	/// scriptPubKey, hex-encoded.
	pub script_pubkey: String,
}

/// Confirmation status of a Bitcoin transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BtcTxStatus {
	pub confirmed: bool,
	pub block_height: Option<u64>,
	pub block_hash: Option<String>,
}

/// A Bitcoin transaction in the reduced form settlement needs: outputs
/// (for the OP_RETURN commitment and fee checks) plus confirmation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtcTransaction {
	pub txid: String,
	pub outputs: Vec<BtcTxOut>,
	pub status: BtcTxStatus,
}

impl BtcTransaction {
	/// Confirmation count given the current chain tip.
	pub fn confirmations(&self, tip: u64) -> u64 {
		match (self.status.confirmed, self.status.block_height) {
			(true, Some(height)) if tip >= height => tip - height + 1,
			_ => 0,
		}
	}

	/// Total satoshis this transaction pays to the given scriptPubKey.
	pub fn paid_to_script(&self, script_pubkey_hex: &str) -> u64 {
		let wanted = script_pubkey_hex.trim_start_matches("0x").to_lowercase();
		self.outputs
			.iter()
			.filter(|out| out.script_pubkey.to_lowercase() == wanted)
			.map(|out| out.value_sats)
			.sum()
	}
}

/// Trait defining the capability the relay needs from a Bitcoin source.
///
/// The settlement pipeline and the reconciler depend only on this
/// interface; which backend serves it is a construction-time decision.
#[async_trait]
pub trait BitcoinDataSource: Send + Sync {
	/// Fetches a transaction by txid.
	///
	/// Must return [`BitcoinError::TxNotFound`] when the source does not
	/// know the transaction, so callers can distinguish "not yet" from
	/// infrastructure failures.
	async fn get_tx(&self, txid: &str) -> Result<BtcTransaction, BitcoinError>;

	/// Fetches the full serialized transaction, hex-encoded.
	async fn get_raw_tx_hex(&self, txid: &str) -> Result<String, BitcoinError>;

	/// Current chain tip height.
	async fn get_chain_tip(&self) -> Result<u64, BitcoinError>;

	/// Block hash at the given height.
	async fn get_block_hash(&self, height: u64) -> Result<String, BitcoinError>;

	/// All txids contained in the given block.
	async fn get_block_txids(&self, block_hash: &str) -> Result<Vec<String>, BitcoinError>;
}
