//! CKB transaction structures.
//!
//! These mirror the JSON shape of a CKB transaction as exchanged with a
//! node, with two deviations required by the relay: capacities are
//! serialized as decimal strings (precision), and witnesses live directly
//! on the raw transaction so the settlement pipeline can splice in the
//! RGB++ unlock witness before broadcast.

use serde::{Deserialize, Serialize};

use crate::utils::{decode_hex, serde_shannons, HexError};

/// How a script's `code_hash` resolves to code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptHashType {
	Data,
	Type,
	Data1,
	Data2,
}

/// A CKB script: lock or type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
	/// 32-byte hash identifying the script code, hex-encoded.
	pub code_hash: String,
	pub hash_type: ScriptHashType,
	/// Script arguments, hex-encoded.
	pub args: String,
}

impl Script {
	/// Decodes the script arguments into raw bytes.
	pub fn args_bytes(&self) -> Result<Vec<u8>, HexError> {
		decode_hex(&self.args)
	}
}

/// Reference to a transaction output: the identity of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
	/// Transaction hash, hex-encoded.
	pub tx_hash: String,
	/// Output index within the transaction.
	pub index: u32,
}

impl std::fmt::Display for OutPoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.tx_hash, self.index)
	}
}

/// A consumed cell reference plus its `since` constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInput {
	pub previous_output: OutPoint,
	/// Absolute/relative timelock encoding, hex-encoded u64 ("0x0" = none).
	pub since: String,
}

/// How a cell dep is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepType {
	Code,
	DepGroup,
}

/// A dependency cell the transaction's scripts load code or data from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDep {
	pub out_point: OutPoint,
	pub dep_type: DepType,
}

/// A produced cell: capacity plus lock and optional type script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOutput {
	/// Capacity in shannons, serialized as a decimal string.
	#[serde(with = "serde_shannons")]
	pub capacity: u64,
	pub lock: Script,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub type_: Option<Script>,
}

/// A CKB transaction in its pre-hash ("raw") form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkbRawTransaction {
	pub version: u32,
	pub cell_deps: Vec<CellDep>,
	/// Header hashes the transaction depends on, hex-encoded.
	pub header_deps: Vec<String>,
	pub inputs: Vec<CellInput>,
	pub outputs: Vec<CellOutput>,
	/// Output data blobs, hex-encoded, one per output.
	pub outputs_data: Vec<String>,
	/// Witnesses, hex-encoded. The relay fills index 0 during completion.
	pub witnesses: Vec<String>,
}
