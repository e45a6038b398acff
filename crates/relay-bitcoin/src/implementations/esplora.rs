//! Esplora-style REST data source (mempool.space, blockstream.info).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::{BitcoinDataSource, BitcoinError, BtcTransaction, BtcTxOut, BtcTxStatus};

/// Transaction shape returned by Esplora's `/tx/:txid`.
#[derive(Debug, Deserialize)]
struct EsploraTx {
	txid: String,
	vout: Vec<EsploraVout>,
	status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
	scriptpubkey: String,
	value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
	confirmed: bool,
	block_height: Option<u64>,
	block_hash: Option<String>,
}

impl From<EsploraTx> for BtcTransaction {
	fn from(tx: EsploraTx) -> Self {
		BtcTransaction {
			txid: tx.txid,
			outputs: tx
				.vout
				.into_iter()
				.map(|out| BtcTxOut {
					value_sats: out.value,
					script_pubkey: out.scriptpubkey,
				})
				.collect(),
			status: BtcTxStatus {
				confirmed: tx.status.confirmed,
				block_height: tx.status.block_height,
				block_hash: tx.status.block_hash,
			},
		}
	}
}

/// Bitcoin data source backed by an Esplora REST API.
pub struct EsploraSource {
	client: reqwest::Client,
	base_url: String,
}

impl EsploraSource {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.into().trim_end_matches('/').to_string(),
		}
	}

	async fn get_checked(&self, path: &str, not_found: Option<&str>) -> Result<reqwest::Response, BitcoinError> {
		let url = format!("{}{}", self.base_url, path);
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(|e| BitcoinError::Http(e.to_string()))?;
		if response.status() == StatusCode::NOT_FOUND {
			if let Some(txid) = not_found {
				return Err(BitcoinError::TxNotFound(txid.to_string()));
			}
		}
		if !response.status().is_success() {
			return Err(BitcoinError::Http(format!(
				"{} returned {}",
				path,
				response.status()
			)));
		}
		Ok(response)
	}

	async fn get_text(&self, path: &str, not_found: Option<&str>) -> Result<String, BitcoinError> {
		self.get_checked(path, not_found)
			.await?
			.text()
			.await
			.map_err(|e| BitcoinError::Http(e.to_string()))
	}
}

#[async_trait]
impl BitcoinDataSource for EsploraSource {
	async fn get_tx(&self, txid: &str) -> Result<BtcTransaction, BitcoinError> {
		let tx: EsploraTx = self
			.get_checked(&format!("/tx/{}", txid), Some(txid))
			.await?
			.json()
			.await
			.map_err(|e| BitcoinError::InvalidResponse(e.to_string()))?;
		Ok(tx.into())
	}

	async fn get_raw_tx_hex(&self, txid: &str) -> Result<String, BitcoinError> {
		let hex = self
			.get_text(&format!("/tx/{}/hex", txid), Some(txid))
			.await?;
		Ok(hex.trim().to_string())
	}

	async fn get_chain_tip(&self) -> Result<u64, BitcoinError> {
		let text = self.get_text("/blocks/tip/height", None).await?;
		text.trim()
			.parse::<u64>()
			.map_err(|e| BitcoinError::InvalidResponse(format!("tip height: {}", e)))
	}

	async fn get_block_hash(&self, height: u64) -> Result<String, BitcoinError> {
		let text = self
			.get_text(&format!("/block-height/{}", height), None)
			.await?;
		Ok(text.trim().to_string())
	}

	async fn get_block_txids(&self, block_hash: &str) -> Result<Vec<String>, BitcoinError> {
		self.get_checked(&format!("/block/{}/txids", block_hash), None)
			.await?
			.json()
			.await
			.map_err(|e| BitcoinError::InvalidResponse(e.to_string()))
	}
}
