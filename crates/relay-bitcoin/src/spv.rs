//! SPV proof oracle client.
//!
//! The Bitcoin SPV service maintains light-client cells on CKB and serves
//! inclusion proofs against them. Settlement cannot finish a transaction
//! until the proof covering its Bitcoin transaction exists, so the client
//! distinguishes "not ready yet" from real failures.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use relay_types::OutPoint;

/// Errors from the SPV proof oracle.
#[derive(Debug, Error)]
pub enum SpvError {
	/// The service has not yet synced far enough to prove this
	/// transaction. Retryable by deferral, never counted as a failure.
	#[error("Proof not ready: {0}")]
	ProofNotReady(String),
	#[error("HTTP error: {0}")]
	Http(String),
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
}

/// An inclusion proof plus the SPV client cell it verifies against.
///
/// The cell out-point becomes a cell dep of the settled CKB transaction;
/// the proof bytes go into the unlock witness.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpvProof {
	pub spv_client: OutPoint,
	/// Proof bytes, hex-encoded.
	pub proof: String,
}

/// Trait defining the SPV oracle capability.
#[async_trait]
pub trait SpvClient: Send + Sync {
	/// Fetches the inclusion proof for a transaction at the given
	/// confirmation depth.
	async fn get_tx_proof(&self, txid: &str, confirmations: u64) -> Result<SpvProof, SpvError>;
}

/// HTTP implementation of the SPV oracle client.
pub struct HttpSpvClient {
	client: reqwest::Client,
	base_url: String,
}

impl HttpSpvClient {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.into().trim_end_matches('/').to_string(),
		}
	}
}

#[async_trait]
impl SpvClient for HttpSpvClient {
	async fn get_tx_proof(&self, txid: &str, confirmations: u64) -> Result<SpvProof, SpvError> {
		let url = format!(
			"{}/tx-proof?txid={}&confirmations={}",
			self.base_url, txid, confirmations
		);
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(|e| SpvError::Http(e.to_string()))?;
		// The service answers 404 until its client cell has reached the
		// requested depth for this transaction.
		if response.status() == StatusCode::NOT_FOUND {
			return Err(SpvError::ProofNotReady(txid.to_string()));
		}
		if !response.status().is_success() {
			return Err(SpvError::Http(format!(
				"spv service returned {}",
				response.status()
			)));
		}
		response
			.json()
			.await
			.map_err(|e| SpvError::InvalidResponse(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn proof_parses_from_json() {
		let raw = r#"{
			"spv_client": {"tx_hash": "0xabcd", "index": 2},
			"proof": "0x1122"
		}"#;
		let proof: SpvProof = serde_json::from_str(raw).unwrap();
		assert_eq!(proof.spv_client.index, 2);
		assert_eq!(proof.proof, "0x1122");
	}
}
