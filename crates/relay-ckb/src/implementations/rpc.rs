//! CKB node JSON-RPC client.
//!
//! Translates between the relay's transaction model (decimal-string
//! capacities) and the node's JSON encoding (0x-prefixed hex numbers).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use relay_types::{
	CellOutput, CkbRawTransaction, DepType, OutPoint, Script, ScriptHashType,
};

use crate::{CkbClient, CkbClientError, LiveCell, TxStatus};

/// CKB node JSON-RPC implementation.
pub struct RpcCkbClient {
	client: reqwest::Client,
	url: String,
}

impl RpcCkbClient {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			url: url.into(),
		}
	}

	async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: Value,
	) -> Result<T, CkbClientError> {
		let body = json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": method,
			"params": params,
		});
		let response = self
			.client
			.post(&self.url)
			.json(&body)
			.send()
			.await
			.map_err(|e| CkbClientError::Http(e.to_string()))?;
		let reply: Value = response
			.json()
			.await
			.map_err(|e| CkbClientError::InvalidResponse(e.to_string()))?;
		if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
			let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
			let message = error
				.get("message")
				.and_then(Value::as_str)
				.unwrap_or("unknown error")
				.to_string();
			return Err(classify_rpc_error(code, message));
		}
		let result = reply
			.get("result")
			.cloned()
			.ok_or_else(|| CkbClientError::InvalidResponse(format!("{}: no result", method)))?;
		serde_json::from_value(result)
			.map_err(|e| CkbClientError::InvalidResponse(e.to_string()))
	}
}

/// Maps node pool errors onto the typed variants settlement reacts to.
fn classify_rpc_error(code: i64, message: String) -> CkbClientError {
	if message.contains("PoolRejectedTransactionByMinFeeRate")
		|| message.contains("min fee rate")
	{
		CkbClientError::PoolRejectedLowFee(message)
	} else if message.contains("PoolTransactionDuplicated") || message.contains("Duplicated") {
		CkbClientError::Duplicate(message)
	} else {
		CkbClientError::Rpc { code, message }
	}
}

fn hex_u64(value: u64) -> String {
	format!("0x{:x}", value)
}

fn script_to_json(script: &Script) -> Value {
	json!({
		"code_hash": script.code_hash,
		"hash_type": match script.hash_type {
			ScriptHashType::Data => "data",
			ScriptHashType::Type => "type",
			ScriptHashType::Data1 => "data1",
			ScriptHashType::Data2 => "data2",
		},
		"args": script.args,
	})
}

fn out_point_to_json(out_point: &OutPoint) -> Value {
	json!({
		"tx_hash": out_point.tx_hash,
		"index": hex_u64(out_point.index as u64),
	})
}

/// Converts the relay's transaction model into node JSON.
pub fn tx_to_node_json(tx: &CkbRawTransaction) -> Value {
	json!({
		"version": hex_u64(tx.version as u64),
		"cell_deps": tx.cell_deps.iter().map(|dep| json!({
			"out_point": out_point_to_json(&dep.out_point),
			"dep_type": match dep.dep_type {
				DepType::Code => "code",
				DepType::DepGroup => "dep_group",
			},
		})).collect::<Vec<_>>(),
		"header_deps": tx.header_deps,
		"inputs": tx.inputs.iter().map(|input| json!({
			"previous_output": out_point_to_json(&input.previous_output),
			"since": input.since,
		})).collect::<Vec<_>>(),
		"outputs": tx.outputs.iter().map(|output| json!({
			"capacity": hex_u64(output.capacity),
			"lock": script_to_json(&output.lock),
			"type": output.type_.as_ref().map(script_to_json),
		})).collect::<Vec<_>>(),
		"outputs_data": tx.outputs_data,
		"witnesses": tx.witnesses,
	})
}

fn parse_hex_u64(value: &Value, field: &str) -> Result<u64, CkbClientError> {
	let raw = value
		.as_str()
		.ok_or_else(|| CkbClientError::InvalidResponse(format!("{}: not a string", field)))?;
	u64::from_str_radix(raw.trim_start_matches("0x"), 16)
		.map_err(|e| CkbClientError::InvalidResponse(format!("{}: {}", field, e)))
}

fn script_from_json(value: &Value) -> Result<Script, CkbClientError> {
	let hash_type = match value.get("hash_type").and_then(Value::as_str) {
		Some("data") => ScriptHashType::Data,
		Some("type") => ScriptHashType::Type,
		Some("data1") => ScriptHashType::Data1,
		Some("data2") => ScriptHashType::Data2,
		other => {
			return Err(CkbClientError::InvalidResponse(format!(
				"unknown hash_type: {:?}",
				other
			)))
		}
	};
	Ok(Script {
		code_hash: value
			.get("code_hash")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string(),
		hash_type,
		args: value
			.get("args")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string(),
	})
}

#[async_trait]
impl CkbClient for RpcCkbClient {
	async fn send_transaction(&self, tx: &CkbRawTransaction) -> Result<String, CkbClientError> {
		self.call(
			"send_transaction",
			json!([tx_to_node_json(tx), "passthrough"]),
		)
		.await
	}

	async fn get_tx_status(&self, tx_hash: &str) -> Result<TxStatus, CkbClientError> {
		let reply: Value = self.call("get_transaction", json!([tx_hash])).await?;
		let status = reply
			.pointer("/tx_status/status")
			.and_then(Value::as_str)
			.unwrap_or("unknown");
		Ok(match status {
			"pending" => TxStatus::Pending,
			"proposed" => TxStatus::Proposed,
			"committed" => TxStatus::Committed,
			"rejected" => {
				let reason = reply
					.pointer("/tx_status/reason")
					.and_then(Value::as_str)
					.unwrap_or("unknown reason")
					.to_string();
				TxStatus::Rejected(reason)
			}
			_ => TxStatus::Unknown,
		})
	}

	async fn get_live_cell(
		&self,
		out_point: &OutPoint,
	) -> Result<Option<LiveCell>, CkbClientError> {
		let reply: Value = self
			.call(
				"get_live_cell",
				json!([{"out_point": out_point_to_json(out_point)}, false]),
			)
			.await?;
		if reply.get("status").and_then(Value::as_str) != Some("live") {
			return Ok(None);
		}
		let output = reply
			.pointer("/cell/output")
			.ok_or_else(|| CkbClientError::InvalidResponse("missing cell output".into()))?;
		let capacity = parse_hex_u64(
			output
				.get("capacity")
				.unwrap_or(&Value::Null),
			"capacity",
		)?;
		let lock = script_from_json(
			output
				.get("lock")
				.ok_or_else(|| CkbClientError::InvalidResponse("missing lock".into()))?,
		)?;
		let type_ = match output.get("type") {
			Some(value) if !value.is_null() => Some(script_from_json(value)?),
			_ => None,
		};
		Ok(Some(LiveCell {
			output: CellOutput {
				capacity,
				lock,
				type_,
			},
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_types::CellInput;

	#[test]
	fn tx_converts_to_node_json() {
		let tx = CkbRawTransaction {
			version: 0,
			cell_deps: vec![],
			header_deps: vec![],
			inputs: vec![CellInput {
				previous_output: OutPoint {
					tx_hash: format!("0x{}", "aa".repeat(32)),
					index: 16,
				},
				since: "0x0".into(),
			}],
			outputs: vec![CellOutput {
				capacity: 255,
				lock: Script {
					code_hash: format!("0x{}", "bb".repeat(32)),
					hash_type: ScriptHashType::Type,
					args: "0x".into(),
				},
				type_: None,
			}],
			outputs_data: vec!["0x".into()],
			witnesses: vec![],
		};
		let node = tx_to_node_json(&tx);
		assert_eq!(node["version"], "0x0");
		assert_eq!(node["outputs"][0]["capacity"], "0xff");
		assert_eq!(node["inputs"][0]["previous_output"]["index"], "0x10");
		assert!(node["outputs"][0]["type"].is_null());
	}

	#[test]
	fn low_fee_rejection_classified() {
		let err = classify_rpc_error(
			-1107,
			"PoolRejectedTransactionByMinFeeRate: fee rate 500 < 1000".into(),
		);
		assert!(matches!(err, CkbClientError::PoolRejectedLowFee(_)));
	}

	#[test]
	fn duplicate_classified() {
		let err = classify_rpc_error(-1106, "PoolTransactionDuplicated".into());
		assert!(matches!(err, CkbClientError::Duplicate(_)));
	}

	#[test]
	fn other_errors_pass_through() {
		let err = classify_rpc_error(-301, "TransactionFailedToResolve".into());
		assert!(matches!(err, CkbClientError::Rpc { code: -301, .. }));
	}
}
