//! Remote transaction signer.
//!
//! The relay never holds CKB keys itself; completed transactions go to a
//! signer service that adds the lock witnesses it is responsible for and
//! returns the signed transaction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_types::CkbRawTransaction;

/// Errors that can occur during signing operations.
#[derive(Debug, Error)]
pub enum SignerError {
	/// The signer refused to sign (policy, unknown lock, bad structure).
	#[error("Signing rejected: {0}")]
	Rejected(String),
	#[error("HTTP error: {0}")]
	Http(String),
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
}

/// Trait defining the interface for transaction signers.
#[async_trait]
pub trait SignerInterface: Send + Sync {
	/// Signs a completed transaction, returning it with witnesses filled.
	async fn sign_transaction(
		&self,
		tx: &CkbRawTransaction,
	) -> Result<CkbRawTransaction, SignerError>;
}

#[derive(Serialize)]
struct SignRequest<'a> {
	tx: &'a CkbRawTransaction,
}

#[derive(Deserialize)]
struct SignResponse {
	tx: CkbRawTransaction,
}

/// HTTP implementation posting to a signer service.
pub struct HttpSigner {
	client: reqwest::Client,
	base_url: String,
}

impl HttpSigner {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.into().trim_end_matches('/').to_string(),
		}
	}
}

#[async_trait]
impl SignerInterface for HttpSigner {
	async fn sign_transaction(
		&self,
		tx: &CkbRawTransaction,
	) -> Result<CkbRawTransaction, SignerError> {
		let url = format!("{}/sign", self.base_url);
		let response = self
			.client
			.post(&url)
			.json(&SignRequest { tx })
			.send()
			.await
			.map_err(|e| SignerError::Http(e.to_string()))?;
		if response.status().is_client_error() {
			let body = response.text().await.unwrap_or_default();
			return Err(SignerError::Rejected(body));
		}
		if !response.status().is_success() {
			return Err(SignerError::Http(format!(
				"signer returned {}",
				response.status()
			)));
		}
		let signed: SignResponse = response
			.json()
			.await
			.map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
		Ok(signed.tx)
	}
}
