//! CKB client module for the RGB++ relay system.
//!
//! This module defines the capability the settlement pipeline needs from a
//! CKB node (broadcast, status polling, live-cell lookup), the remote
//! transaction signer seam, and the RGB++ virtual-transaction helpers:
//! placeholder txid handling, commitment recomputation, and unlock witness
//! construction.

use async_trait::async_trait;
use thiserror::Error;

use relay_types::{CellOutput, CkbRawTransaction, OutPoint};

/// Re-export implementations
pub mod implementations {
	pub mod rpc;
}

/// RGB++ virtual-transaction helpers.
pub mod rgbpp;
/// Remote transaction signer.
pub mod signer;

pub use signer::{HttpSigner, SignerError, SignerInterface};

/// Errors that can occur when talking to a CKB node.
#[derive(Debug, Error)]
pub enum CkbClientError {
	/// The transaction pool rejected the submission because its fee rate
	/// is below the node's minimum. Settlement handles this with a
	/// deterministic fee-bump repair instead of a blind retry.
	#[error("Pool rejected transaction, fee rate too low: {0}")]
	PoolRejectedLowFee(String),
	/// The transaction is already known to the pool. Safe to treat as a
	/// successful broadcast on redelivery.
	#[error("Transaction already in pool: {0}")]
	Duplicate(String),
	#[error("RPC error {code}: {message}")]
	Rpc { code: i64, message: String },
	#[error("HTTP error: {0}")]
	Http(String),
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
}

/// On-chain status of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
	Pending,
	Proposed,
	Committed,
	Rejected(String),
	Unknown,
}

/// A live cell as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveCell {
	pub output: CellOutput,
}

/// Trait defining the capability the relay needs from a CKB node.
#[async_trait]
pub trait CkbClient: Send + Sync {
	/// Submits a signed transaction, returning its hash.
	async fn send_transaction(&self, tx: &CkbRawTransaction) -> Result<String, CkbClientError>;

	/// Current status of a transaction by hash.
	async fn get_tx_status(&self, tx_hash: &str) -> Result<TxStatus, CkbClientError>;

	/// Looks up a cell; `None` when the cell is spent or unknown.
	async fn get_live_cell(&self, out_point: &OutPoint)
		-> Result<Option<LiveCell>, CkbClientError>;
}
