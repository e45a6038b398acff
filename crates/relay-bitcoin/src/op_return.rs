//! OP_RETURN commitment extraction.
//!
//! An RGB++ Bitcoin transaction carries its commitment as a single 32-byte
//! push in an OP_RETURN output. Only the first OP_RETURN output counts;
//! Bitcoin consensus permits at most one standard OP_RETURN anyway.

use relay_types::decode_hex;

use crate::BtcTransaction;

const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;

/// Parses the payload of an OP_RETURN script.
///
/// Accepts the two push encodings that fit a 32-byte commitment: a direct
/// push (length 1-75) and OP_PUSHDATA1. Returns `None` for anything else,
/// including trailing garbage after the push.
pub fn parse_op_return_payload(script: &[u8]) -> Option<&[u8]> {
	match script {
		[OP_RETURN, len, rest @ ..] if (0x01..=0x4b).contains(len) && rest.len() == *len as usize => {
			Some(rest)
		}
		[OP_RETURN, OP_PUSHDATA1, len, rest @ ..] if rest.len() == *len as usize => Some(rest),
		_ => None,
	}
}

/// Extracts the 32-byte commitment from a transaction's OP_RETURN output.
///
/// Returns `None` when no output is an OP_RETURN or the payload is not
/// exactly 32 bytes; per the error taxonomy that makes the request
/// invalid, not retryable.
pub fn extract_commitment(tx: &BtcTransaction) -> Option<[u8; 32]> {
	for output in &tx.outputs {
		let Ok(script) = decode_hex(&output.script_pubkey) else {
			continue;
		};
		if script.first() != Some(&OP_RETURN) {
			continue;
		}
		let payload = parse_op_return_payload(&script)?;
		if payload.len() != 32 {
			return None;
		}
		let mut commitment = [0u8; 32];
		commitment.copy_from_slice(payload);
		return Some(commitment);
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{BtcTxOut, BtcTxStatus};

	fn tx_with_scripts(scripts: Vec<&str>) -> BtcTransaction {
		BtcTransaction {
			txid: "ff".repeat(32),
			outputs: scripts
				.into_iter()
				.map(|script| BtcTxOut {
					value_sats: 0,
					script_pubkey: script.to_string(),
				})
				.collect(),
			status: BtcTxStatus::default(),
		}
	}

	#[test]
	fn direct_push_commitment_extracted() {
		let commitment = [0xabu8; 32];
		let script = format!("6a20{}", hex::encode(commitment));
		let tx = tx_with_scripts(vec!["76a914aa88ac", &script]);
		assert_eq!(extract_commitment(&tx), Some(commitment));
	}

	#[test]
	fn pushdata1_commitment_extracted() {
		let commitment = [0x11u8; 32];
		let script = format!("6a4c20{}", hex::encode(commitment));
		let tx = tx_with_scripts(vec![&script]);
		assert_eq!(extract_commitment(&tx), Some(commitment));
	}

	#[test]
	fn missing_op_return_yields_none() {
		let tx = tx_with_scripts(vec!["76a914aa88ac"]);
		assert_eq!(extract_commitment(&tx), None);
	}

	#[test]
	fn wrong_payload_length_yields_none() {
		// 16-byte push: a well-formed OP_RETURN, but not a commitment.
		let script = format!("6a10{}", hex::encode([0u8; 16]));
		let tx = tx_with_scripts(vec![&script]);
		assert_eq!(extract_commitment(&tx), None);
	}

	#[test]
	fn truncated_push_rejected() {
		// Declares 32 bytes, delivers 4.
		let tx = tx_with_scripts(vec!["6a20deadbeef"]);
		assert_eq!(extract_commitment(&tx), None);
	}
}
