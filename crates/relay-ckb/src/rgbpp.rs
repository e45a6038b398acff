//! RGB++ virtual-transaction helpers.
//!
//! An RGB++ lock script binds a CKB cell to a Bitcoin UTXO by embedding
//! the Bitcoin txid in its args. While the Bitcoin transaction is unsigned
//! the txid is unknown, so the virtual transaction carries a 32-zero-byte
//! placeholder; settlement substitutes the real txid once Bitcoin
//! confirms. The commitment is always computed over the placeholder form,
//! which makes verification independent of the concrete txid.
//!
//! Lock args layout: implementation-defined prefix followed by the 32-byte
//! txid as the trailing field. Canonicalization and substitution only
//! touch those trailing 32 bytes.

use sha2::{Digest, Sha256};
use thiserror::Error;

use relay_bitcoin::SpvProof;
use relay_types::{
	decode_hex, encode_hex, CellDep, CellInput, CellOutput, CkbRawTransaction, DepType, OutPoint,
	PaymasterCell, Script, ScriptHashType,
};

/// The pre-confirmation txid placeholder inside lock args.
pub const PLACEHOLDER_TXID: [u8; 32] = [0u8; 32];

/// Domain tag prefixing the commitment preimage.
const COMMITMENT_TAG: &[u8] = b"RGB++";

/// Errors from virtual-transaction manipulation.
#[derive(Debug, Error)]
pub enum RgbppError {
	/// A txid-bearing lock's args are too short to hold a txid.
	#[error("Lock args too short for a txid: {0} bytes")]
	LockArgsTooShort(usize),
	#[error("Invalid hex in transaction field: {0}")]
	InvalidHex(String),
	/// The fee to deduct does not leave a viable output capacity.
	#[error("Fee {fee} exceeds cell capacity {capacity}")]
	FeeExceedsCapacity { fee: u64, capacity: u64 },
}

/// The script code hashes whose locks embed a Bitcoin txid.
#[derive(Debug, Clone)]
pub struct RgbppScripts {
	rgbpp_lock_code_hash: String,
	btc_time_lock_code_hash: String,
}

impl RgbppScripts {
	pub fn new(
		rgbpp_lock_code_hash: impl Into<String>,
		btc_time_lock_code_hash: impl Into<String>,
	) -> Self {
		Self {
			rgbpp_lock_code_hash: normalize_hash(&rgbpp_lock_code_hash.into()),
			btc_time_lock_code_hash: normalize_hash(&btc_time_lock_code_hash.into()),
		}
	}

	/// Whether this lock script embeds a Bitcoin txid in its args.
	pub fn bears_txid(&self, lock: &Script) -> bool {
		let code_hash = normalize_hash(&lock.code_hash);
		code_hash == self.rgbpp_lock_code_hash || code_hash == self.btc_time_lock_code_hash
	}
}

fn normalize_hash(hash: &str) -> String {
	hash.trim_start_matches("0x")
		.trim_start_matches("0X")
		.to_lowercase()
}

/// Rewrites the trailing 32 bytes of lock args with the given txid.
fn rewrite_txid(args: &str, txid: &[u8; 32]) -> Result<String, RgbppError> {
	let mut bytes = decode_hex(args).map_err(|e| RgbppError::InvalidHex(e.to_string()))?;
	let len = bytes.len();
	if len < 32 {
		return Err(RgbppError::LockArgsTooShort(len));
	}
	bytes[len - 32..].copy_from_slice(txid);
	Ok(encode_hex(&bytes))
}

/// Applies `rewrite` to every txid-bearing output lock of the transaction.
fn map_locks(
	tx: &CkbRawTransaction,
	scripts: &RgbppScripts,
	txid: &[u8; 32],
) -> Result<CkbRawTransaction, RgbppError> {
	let mut out = tx.clone();
	for output in &mut out.outputs {
		if scripts.bears_txid(&output.lock) {
			output.lock.args = rewrite_txid(&output.lock.args, txid)?;
		}
	}
	Ok(out)
}

/// Resets every txid-bearing lock back to its placeholder form.
///
/// Verification runs on the canonical form so it does not depend on which
/// concrete txid will ultimately be substituted.
pub fn canonicalize(
	tx: &CkbRawTransaction,
	scripts: &RgbppScripts,
) -> Result<CkbRawTransaction, RgbppError> {
	map_locks(tx, scripts, &PLACEHOLDER_TXID)
}

/// Substitutes the real Bitcoin txid into every txid-bearing lock.
pub fn substitute_txid(
	tx: &CkbRawTransaction,
	scripts: &RgbppScripts,
	txid: &[u8; 32],
) -> Result<CkbRawTransaction, RgbppError> {
	map_locks(tx, scripts, txid)
}

fn parse_hex_u64(value: &str) -> Result<u64, RgbppError> {
	let trimmed = value
		.trim_start_matches("0x")
		.trim_start_matches("0X");
	u64::from_str_radix(trimmed, 16)
		.map_err(|e| RgbppError::InvalidHex(format!("{}: {}", value, e)))
}

fn hash_script(hasher: &mut Sha256, script: &Script) -> Result<(), RgbppError> {
	let code_hash = decode_hex(&script.code_hash).map_err(|e| RgbppError::InvalidHex(e.to_string()))?;
	hasher.update(&code_hash);
	hasher.update([match script.hash_type {
		ScriptHashType::Data => 0u8,
		ScriptHashType::Type => 1,
		ScriptHashType::Data1 => 2,
		ScriptHashType::Data2 => 4,
	}]);
	let args = script
		.args_bytes()
		.map_err(|e| RgbppError::InvalidHex(e.to_string()))?;
	hasher.update((args.len() as u32).to_le_bytes());
	hasher.update(&args);
	Ok(())
}

/// Recomputes the RGB++ commitment of a virtual transaction.
///
/// Double SHA-256 over a canonical length-prefixed serialization of the
/// placeholder-form transaction: version, inputs, outputs, outputs_data.
/// Witnesses and cell deps are excluded; they are completed after the
/// commitment is already fixed on Bitcoin.
pub fn compute_commitment(
	tx: &CkbRawTransaction,
	scripts: &RgbppScripts,
) -> Result<[u8; 32], RgbppError> {
	let canonical = canonicalize(tx, scripts)?;
	let mut hasher = Sha256::new();
	hasher.update(COMMITMENT_TAG);
	hasher.update(canonical.version.to_le_bytes());

	hasher.update((canonical.inputs.len() as u32).to_le_bytes());
	for input in &canonical.inputs {
		let tx_hash = decode_hex(&input.previous_output.tx_hash)
			.map_err(|e| RgbppError::InvalidHex(e.to_string()))?;
		hasher.update(&tx_hash);
		hasher.update(input.previous_output.index.to_le_bytes());
		hasher.update(parse_hex_u64(&input.since)?.to_le_bytes());
	}

	hasher.update((canonical.outputs.len() as u32).to_le_bytes());
	for output in &canonical.outputs {
		hasher.update(output.capacity.to_le_bytes());
		hash_script(&mut hasher, &output.lock)?;
		match &output.type_ {
			Some(type_script) => {
				hasher.update([1u8]);
				hash_script(&mut hasher, type_script)?;
			}
			None => hasher.update([0u8]),
		}
	}

	hasher.update((canonical.outputs_data.len() as u32).to_le_bytes());
	for data in &canonical.outputs_data {
		let bytes = decode_hex(data).map_err(|e| RgbppError::InvalidHex(e.to_string()))?;
		hasher.update((bytes.len() as u32).to_le_bytes());
		hasher.update(&bytes);
	}

	let first = hasher.finalize();
	let second = Sha256::digest(first);
	Ok(second.into())
}

/// Builds the RGB++ unlock witness from an SPV proof and the
/// witness-stripped Bitcoin transaction.
///
/// Layout: `u32 LE proof length || proof || u32 LE tx length || tx`,
/// hex-encoded. Deterministic, so redelivery rebuilds the same witness.
pub fn build_unlock_witness(proof: &SpvProof, stripped_btc_tx: &[u8]) -> Result<String, RgbppError> {
	let proof_bytes = decode_hex(&proof.proof).map_err(|e| RgbppError::InvalidHex(e.to_string()))?;
	let mut witness =
		Vec::with_capacity(8 + proof_bytes.len() + stripped_btc_tx.len());
	witness.extend_from_slice(&(proof_bytes.len() as u32).to_le_bytes());
	witness.extend_from_slice(&proof_bytes);
	witness.extend_from_slice(&(stripped_btc_tx.len() as u32).to_le_bytes());
	witness.extend_from_slice(stripped_btc_tx);
	Ok(encode_hex(&witness))
}

/// Places the unlock witness at index 0, where the lock script reads it.
///
/// Caller-provided witnesses are preserved after it.
pub fn set_unlock_witness(tx: &mut CkbRawTransaction, witness: String) {
	if tx.witnesses.is_empty() {
		tx.witnesses.push(witness);
	} else {
		tx.witnesses[0] = witness;
	}
}

/// Adds the SPV client cell as a dependency of the transaction.
///
/// Skipped if the dep is already present (redelivery idempotence).
pub fn append_spv_cell_dep(tx: &mut CkbRawTransaction, spv_client: OutPoint) {
	let exists = tx
		.cell_deps
		.iter()
		.any(|dep| dep.out_point == spv_client);
	if !exists {
		tx.cell_deps.push(CellDep {
			out_point: spv_client,
			dep_type: DepType::Code,
		});
	}
}

/// Splices a paymaster cell into the transaction as an input/output pair.
///
/// The output returns the cell's capacity minus the sponsored fee to the
/// paymaster lock, so the pool's value is preserved across sponsorships.
pub fn apply_fee_cell(
	tx: &mut CkbRawTransaction,
	cell: &PaymasterCell,
	paymaster_lock: Script,
	fee: u64,
) -> Result<(), RgbppError> {
	if fee >= cell.capacity {
		return Err(RgbppError::FeeExceedsCapacity {
			fee,
			capacity: cell.capacity,
		});
	}
	tx.inputs.push(CellInput {
		previous_output: cell.out_point.clone(),
		since: "0x0".to_string(),
	});
	tx.outputs.push(CellOutput {
		capacity: cell.capacity - fee,
		lock: paymaster_lock,
		type_: None,
	});
	tx.outputs_data.push("0x".to_string());
	tx.witnesses.push("0x".to_string());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	const RGBPP_HASH: &str =
		"0x1111111111111111111111111111111111111111111111111111111111111111";
	const TIME_LOCK_HASH: &str =
		"0x2222222222222222222222222222222222222222222222222222222222222222";

	fn scripts() -> RgbppScripts {
		RgbppScripts::new(RGBPP_HASH, TIME_LOCK_HASH)
	}

	fn rgbpp_lock(txid: &[u8; 32]) -> Script {
		// 4-byte out-index prefix followed by the txid.
		let mut args = vec![0x01, 0x00, 0x00, 0x00];
		args.extend_from_slice(txid);
		Script {
			code_hash: RGBPP_HASH.to_string(),
			hash_type: ScriptHashType::Type,
			args: encode_hex(&args),
		}
	}

	fn sample_tx(txid: &[u8; 32]) -> CkbRawTransaction {
		CkbRawTransaction {
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
				lock: rgbpp_lock(txid),
				type_: None,
			}],
			outputs_data: vec!["0x00".into()],
			witnesses: vec![],
		}
	}

	#[test]
	fn commitment_is_txid_independent() {
		let placeholder = sample_tx(&PLACEHOLDER_TXID);
		let real_txid = [0xabu8; 32];
		let substituted = substitute_txid(&placeholder, &scripts(), &real_txid).unwrap();

		assert_ne!(placeholder, substituted);
		assert_eq!(
			compute_commitment(&placeholder, &scripts()).unwrap(),
			compute_commitment(&substituted, &scripts()).unwrap()
		);
	}

	#[test]
	fn commitment_changes_with_outputs() {
		let tx = sample_tx(&PLACEHOLDER_TXID);
		let mut altered = tx.clone();
		altered.outputs[0].capacity += 1;
		assert_ne!(
			compute_commitment(&tx, &scripts()).unwrap(),
			compute_commitment(&altered, &scripts()).unwrap()
		);
	}

	#[test]
	fn substitution_roundtrips_through_canonicalization() {
		let placeholder = sample_tx(&PLACEHOLDER_TXID);
		let substituted = substitute_txid(&placeholder, &scripts(), &[0x42u8; 32]).unwrap();
		assert_eq!(
			canonicalize(&substituted, &scripts()).unwrap(),
			placeholder
		);
	}

	#[test]
	fn non_rgbpp_locks_untouched() {
		let mut tx = sample_tx(&PLACEHOLDER_TXID);
		tx.outputs[0].lock.code_hash = format!("0x{}", "99".repeat(32));
		let substituted = substitute_txid(&tx, &scripts(), &[0x42u8; 32]).unwrap();
		assert_eq!(substituted, tx);
	}

	#[test]
	fn short_args_rejected() {
		let mut tx = sample_tx(&PLACEHOLDER_TXID);
		tx.outputs[0].lock.args = "0x0102".into();
		assert!(matches!(
			substitute_txid(&tx, &scripts(), &[0u8; 32]),
			Err(RgbppError::LockArgsTooShort(2))
		));
	}

	#[test]
	fn unlock_witness_layout() {
		let proof = SpvProof {
			spv_client: OutPoint {
				tx_hash: format!("0x{}", "44".repeat(32)),
				index: 0,
			},
			proof: "0xaabb".into(),
		};
		let witness = build_unlock_witness(&proof, &[0x01, 0x02, 0x03]).unwrap();
		let bytes = decode_hex(&witness).unwrap();
		assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
		assert_eq!(&bytes[4..6], &[0xaa, 0xbb]);
		assert_eq!(&bytes[6..10], &3u32.to_le_bytes());
		assert_eq!(&bytes[10..], &[1, 2, 3]);
	}

	#[test]
	fn fee_cell_splice_preserves_shape() {
		let mut tx = sample_tx(&PLACEHOLDER_TXID);
		let cell = PaymasterCell {
			out_point: OutPoint {
				tx_hash: format!("0x{}", "55".repeat(32)),
				index: 3,
			},
			capacity: 31_600_000_000,
		};
		let lock = Script {
			code_hash: format!("0x{}", "66".repeat(32)),
			hash_type: ScriptHashType::Type,
			args: "0x".into(),
		};
		apply_fee_cell(&mut tx, &cell, lock, 10_000).unwrap();
		assert_eq!(tx.inputs.len(), 2);
		assert_eq!(tx.outputs.len(), 2);
		assert_eq!(tx.outputs[1].capacity, 31_599_990_000);
		assert_eq!(tx.outputs.len(), tx.outputs_data.len());
	}

	#[test]
	fn fee_exceeding_capacity_rejected() {
		let mut tx = sample_tx(&PLACEHOLDER_TXID);
		let cell = PaymasterCell {
			out_point: OutPoint {
				tx_hash: format!("0x{}", "55".repeat(32)),
				index: 0,
			},
			capacity: 100,
		};
		let lock = tx.outputs[0].lock.clone();
		assert!(matches!(
			apply_fee_cell(&mut tx, &cell, lock, 100),
			Err(RgbppError::FeeExceedsCapacity { .. })
		));
	}

	#[test]
	fn spv_dep_appended_once() {
		let mut tx = sample_tx(&PLACEHOLDER_TXID);
		let dep = OutPoint {
			tx_hash: format!("0x{}", "77".repeat(32)),
			index: 1,
		};
		append_spv_cell_dep(&mut tx, dep.clone());
		append_spv_cell_dep(&mut tx, dep);
		assert_eq!(tx.cell_deps.len(), 1);
	}
}
