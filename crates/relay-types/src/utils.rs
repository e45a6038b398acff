//! Utility functions for common type conversions.
//!
//! Hex encoding helpers shared by every relay crate, plus the wall-clock
//! helper used for job timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Errors that can occur when decoding hex-encoded fields.
#[derive(Debug, Error)]
pub enum HexError {
	/// The input contained non-hex characters or an odd number of digits.
	#[error("Invalid hex string: {0}")]
	Invalid(String),
	/// The decoded value had an unexpected length.
	#[error("Expected {expected} bytes, got {actual}")]
	Length { expected: usize, actual: usize },
}

/// Truncates an identifier for display purposes.
///
/// Shows only the first 8 characters followed by ".." for longer strings.
pub fn truncate_id(id: &str) -> String {
	if id.len() <= 8 {
		id.to_string()
	} else {
		format!("{}..", &id[..8])
	}
}

/// Ensures a hex string carries a `0x` prefix.
pub fn with_0x_prefix(s: &str) -> String {
	if s.starts_with("0x") || s.starts_with("0X") {
		s.to_string()
	} else {
		format!("0x{}", s)
	}
}

/// Strips a leading `0x` prefix if present.
pub fn without_0x_prefix(s: &str) -> &str {
	s.strip_prefix("0x")
		.or_else(|| s.strip_prefix("0X"))
		.unwrap_or(s)
}

/// Decodes a hex string (with or without `0x` prefix) into bytes.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, HexError> {
	hex::decode(without_0x_prefix(s)).map_err(|e| HexError::Invalid(e.to_string()))
}

/// Decodes a hex string into exactly 32 bytes.
///
/// Used for Bitcoin txids, CKB hashes, and commitments, all of which are
/// 32-byte values on the wire.
pub fn decode_hex32(s: &str) -> Result<[u8; 32], HexError> {
	let bytes = decode_hex(s)?;
	if bytes.len() != 32 {
		return Err(HexError::Length {
			expected: 32,
			actual: bytes.len(),
		});
	}
	let mut out = [0u8; 32];
	out.copy_from_slice(&bytes);
	Ok(out)
}

/// Encodes bytes as a `0x`-prefixed hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
	format!("0x{}", hex::encode(bytes))
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

/// Serde adapter serializing capacities as decimal strings.
///
/// Capacities are shannon amounts that can exceed 2^53, so they travel as
/// strings to avoid precision loss in JSON consumers.
pub mod serde_shannons {
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&value.to_string())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse::<u64>().map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hex_roundtrip() {
		let txid = "a".repeat(64);
		let bytes = decode_hex32(&txid).unwrap();
		assert_eq!(encode_hex(&bytes), format!("0x{}", txid));
	}

	#[test]
	fn hex32_rejects_wrong_length() {
		assert!(matches!(
			decode_hex32("0xdeadbeef"),
			Err(HexError::Length {
				expected: 32,
				actual: 4
			})
		));
	}

	#[test]
	fn prefix_handling() {
		assert_eq!(with_0x_prefix("ff"), "0xff");
		assert_eq!(with_0x_prefix("0xff"), "0xff");
		assert_eq!(without_0x_prefix("0xff"), "ff");
		assert_eq!(without_0x_prefix("ff"), "ff");
	}

	#[test]
	fn truncation() {
		assert_eq!(truncate_id("abcd"), "abcd");
		assert_eq!(truncate_id("abcdefghij"), "abcdefgh..");
	}
}
