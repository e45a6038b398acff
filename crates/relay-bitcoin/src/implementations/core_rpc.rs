//! Bitcoin Core JSON-RPC data source.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{BitcoinDataSource, BitcoinError, BtcTransaction, BtcTxOut, BtcTxStatus};

/// Bitcoin Core error code for "No such mempool or blockchain transaction".
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
	result: Option<T>,
	error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
	code: i64,
	message: String,
}

/// Verbose `getrawtransaction` result, reduced to what the relay reads.
#[derive(Debug, Deserialize)]
struct VerboseTx {
	txid: String,
	vout: Vec<VerboseVout>,
	#[serde(default)]
	confirmations: Option<u64>,
	#[serde(default)]
	blockhash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseVout {
	/// Amount in BTC.
	value: f64,
	#[serde(rename = "scriptPubKey")]
	script_pub_key: VerboseScript,
}

#[derive(Debug, Deserialize)]
struct VerboseScript {
	hex: String,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
	height: u64,
}

#[derive(Debug, Deserialize)]
struct BlockTxids {
	tx: Vec<String>,
}

/// Bitcoin data source backed by a Bitcoin Core node.
pub struct CoreRpcSource {
	client: reqwest::Client,
	url: String,
	user: String,
	password: String,
}

impl CoreRpcSource {
	pub fn new(
		url: impl Into<String>,
		user: impl Into<String>,
		password: impl Into<String>,
	) -> Self {
		Self {
			client: reqwest::Client::new(),
			url: url.into(),
			user: user.into(),
			password: password.into(),
		}
	}

	async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: Value,
		txid_for_not_found: Option<&str>,
	) -> Result<T, BitcoinError> {
		let body = json!({
			"jsonrpc": "1.0",
			"id": "rgbpp-relay",
			"method": method,
			"params": params,
		});
		let response = self
			.client
			.post(&self.url)
			.basic_auth(&self.user, Some(&self.password))
			.json(&body)
			.send()
			.await
			.map_err(|e| BitcoinError::Http(e.to_string()))?;
		let rpc: RpcResponse<T> = response
			.json()
			.await
			.map_err(|e| BitcoinError::InvalidResponse(e.to_string()))?;
		if let Some(error) = rpc.error {
			if error.code == RPC_INVALID_ADDRESS_OR_KEY {
				if let Some(txid) = txid_for_not_found {
					return Err(BitcoinError::TxNotFound(txid.to_string()));
				}
			}
			return Err(BitcoinError::Rpc {
				code: error.code,
				message: error.message,
			});
		}
		rpc.result
			.ok_or_else(|| BitcoinError::InvalidResponse(format!("{}: empty result", method)))
	}

	fn btc_to_sats(value: f64) -> u64 {
		(value * 100_000_000.0).round() as u64
	}
}

#[async_trait]
impl BitcoinDataSource for CoreRpcSource {
	async fn get_tx(&self, txid: &str) -> Result<BtcTransaction, BitcoinError> {
		let tx: VerboseTx = self
			.call("getrawtransaction", json!([txid, true]), Some(txid))
			.await?;

		// Verbose results carry the block hash but not the height; resolve
		// it through the header so callers get a uniform status.
		let (confirmed, block_height) = match (&tx.blockhash, tx.confirmations.unwrap_or(0)) {
			(Some(hash), confirmations) if confirmations > 0 => {
				let header: BlockHeader = self
					.call("getblockheader", json!([hash]), None)
					.await?;
				(true, Some(header.height))
			}
			_ => (false, None),
		};

		Ok(BtcTransaction {
			txid: tx.txid,
			outputs: tx
				.vout
				.into_iter()
				.map(|out| BtcTxOut {
					value_sats: Self::btc_to_sats(out.value),
					script_pubkey: out.script_pub_key.hex,
				})
				.collect(),
			status: BtcTxStatus {
				confirmed,
				block_height,
				block_hash: tx.blockhash,
			},
		})
	}

	async fn get_raw_tx_hex(&self, txid: &str) -> Result<String, BitcoinError> {
		self.call("getrawtransaction", json!([txid, false]), Some(txid))
			.await
	}

	async fn get_chain_tip(&self) -> Result<u64, BitcoinError> {
		self.call("getblockcount", json!([]), None).await
	}

	async fn get_block_hash(&self, height: u64) -> Result<String, BitcoinError> {
		self.call("getblockhash", json!([height]), None).await
	}

	async fn get_block_txids(&self, block_hash: &str) -> Result<Vec<String>, BitcoinError> {
		let block: BlockTxids = self.call("getblock", json!([block_hash, 1]), None).await?;
		Ok(block.tx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn btc_amounts_convert_to_sats() {
		assert_eq!(CoreRpcSource::btc_to_sats(0.00007000), 7000);
		assert_eq!(CoreRpcSource::btc_to_sats(1.0), 100_000_000);
		assert_eq!(CoreRpcSource::btc_to_sats(0.0), 0);
	}

	#[test]
	fn verbose_tx_parses() {
		let raw = r#"{
			"txid": "abc",
			"vout": [{"value": 0.00007, "scriptPubKey": {"hex": "6a20ff"}}],
			"confirmations": 3,
			"blockhash": "00aa"
		}"#;
		let tx: VerboseTx = serde_json::from_str(raw).unwrap();
		assert_eq!(tx.confirmations, Some(3));
		assert_eq!(tx.vout[0].script_pub_key.hex, "6a20ff");
	}

	#[test]
	fn rpc_error_parses() {
		let raw = r#"{"result": null, "error": {"code": -5, "message": "No such transaction"}}"#;
		let response: RpcResponse<VerboseTx> = serde_json::from_str(raw).unwrap();
		assert_eq!(response.error.unwrap().code, -5);
	}
}
