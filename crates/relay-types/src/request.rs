//! Transaction request types submitted by external callers.
//!
//! A [`TransactionRequest`] is the unit of work of the relay: a Bitcoin
//! txid paired with the CKB virtual transaction whose final form depends
//! on that Bitcoin transaction's confirmation data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transaction::CkbRawTransaction;
use crate::utils::{decode_hex, decode_hex32};

/// Errors produced when validating an incoming request.
#[derive(Debug, Error)]
pub enum RequestError {
	#[error("Invalid Bitcoin txid: {0}")]
	InvalidTxid(String),
	#[error("Invalid commitment: {0}")]
	InvalidCommitment(String),
	#[error("Malformed virtual transaction: {0}")]
	MalformedTransaction(String),
}

/// Caller identity attached to a request.
///
/// Used only for observability; never consulted by settlement logic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub audience: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subject: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token_id: Option<String>,
}

/// The not-yet-finalized CKB side of an isomorphic transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkbVirtualResult {
	pub ckb_raw_tx: CkbRawTransaction,
	/// 32-byte commitment binding the CKB transaction to the Bitcoin
	/// OP_RETURN output, hex-encoded.
	pub commitment: String,
	/// Whether settlement must sponsor the transaction with a paymaster cell.
	pub needs_paymaster_cell: bool,
	/// Total input capacity in shannons, as a decimal string.
	pub sum_inputs_capacity: String,
}

/// The unit of work: a Bitcoin txid bound to a CKB virtual transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
	/// 64-hex Bitcoin transaction id. Doubles as the queue job id, which
	/// enforces at most one active job per Bitcoin transaction.
	pub btc_txid: String,
	pub ckb_virtual_result: CkbVirtualResult,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context: Option<RequestContext>,
}

impl TransactionRequest {
	/// Checks the request is structurally sound before it enters the queue.
	///
	/// A malformed request is terminal by the error taxonomy, so rejecting
	/// it here keeps garbage out of the durable queue entirely.
	pub fn validate(&self) -> Result<(), RequestError> {
		decode_hex32(&self.btc_txid).map_err(|e| RequestError::InvalidTxid(e.to_string()))?;
		decode_hex32(&self.ckb_virtual_result.commitment)
			.map_err(|e| RequestError::InvalidCommitment(e.to_string()))?;

		let tx = &self.ckb_virtual_result.ckb_raw_tx;
		if tx.outputs.is_empty() {
			return Err(RequestError::MalformedTransaction(
				"transaction has no outputs".into(),
			));
		}
		if tx.outputs.len() != tx.outputs_data.len() {
			return Err(RequestError::MalformedTransaction(format!(
				"{} outputs but {} outputs_data entries",
				tx.outputs.len(),
				tx.outputs_data.len()
			)));
		}
		for output in &tx.outputs {
			decode_hex(&output.lock.args)
				.map_err(|e| RequestError::MalformedTransaction(e.to_string()))?;
		}
		self.ckb_virtual_result
			.sum_inputs_capacity
			.parse::<u64>()
			.map_err(|e| RequestError::MalformedTransaction(format!("sum_inputs_capacity: {}", e)))?;
		Ok(())
	}
}
