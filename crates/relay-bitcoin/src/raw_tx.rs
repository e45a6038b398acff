//! Raw transaction parsing and witness stripping.
//!
//! The RGB++ unlock witness embeds the Bitcoin transaction in its legacy
//! (witness-stripped) serialization, because that is the form the lock
//! script hashes to recompute the txid. This module strips the segwit
//! marker, flag, and witness section from a full serialization without
//! otherwise re-encoding anything.

use crate::BitcoinError;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

/// Byte-slice reader tracking its position.
struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8], BitcoinError> {
		let end = self
			.pos
			.checked_add(n)
			.filter(|end| *end <= self.buf.len())
			.ok_or_else(|| BitcoinError::MalformedTx("unexpected end of input".into()))?;
		let slice = &self.buf[self.pos..end];
		self.pos = end;
		Ok(slice)
	}

	fn u8(&mut self) -> Result<u8, BitcoinError> {
		Ok(self.take(1)?[0])
	}

	/// Bitcoin variable-length integer.
	fn varint(&mut self) -> Result<u64, BitcoinError> {
		let first = self.u8()?;
		Ok(match first {
			0xfd => u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as u64,
			0xfe => u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as u64,
			0xff => u64::from_le_bytes(self.take(8)?.try_into().unwrap()),
			n => n as u64,
		})
	}

	/// Skips one input: outpoint, script, sequence.
	fn skip_input(&mut self) -> Result<(), BitcoinError> {
		self.take(36)?; // txid + vout
		let script_len = self.varint()? as usize;
		self.take(script_len)?;
		self.take(4)?; // sequence
		Ok(())
	}

	/// Skips one output: value, script.
	fn skip_output(&mut self) -> Result<(), BitcoinError> {
		self.take(8)?; // value
		let script_len = self.varint()? as usize;
		self.take(script_len)?;
		Ok(())
	}
}

/// Strips the witness data from a serialized Bitcoin transaction.
///
/// A legacy transaction is returned unchanged. For a segwit transaction
/// the result is `version || inputs || outputs || locktime`, the exact
/// bytes the txid commits to.
pub fn strip_witnesses(raw: &[u8]) -> Result<Vec<u8>, BitcoinError> {
	if raw.len() < 10 {
		return Err(BitcoinError::MalformedTx("transaction too short".into()));
	}
	let is_segwit = raw[4] == SEGWIT_MARKER && raw[5] == SEGWIT_FLAG;
	if !is_segwit {
		// Already the legacy form; validate nothing and pass through.
		return Ok(raw.to_vec());
	}

	let mut reader = Reader::new(raw);
	reader.take(4)?; // version
	reader.take(2)?; // marker + flag

	let body_start = reader.pos;
	let input_count = reader.varint()?;
	for _ in 0..input_count {
		reader.skip_input()?;
	}
	let output_count = reader.varint()?;
	for _ in 0..output_count {
		reader.skip_output()?;
	}
	let body_end = reader.pos;

	// Witness stacks, one per input.
	for _ in 0..input_count {
		let items = reader.varint()?;
		for _ in 0..items {
			let len = reader.varint()? as usize;
			reader.take(len)?;
		}
	}
	let locktime = reader.take(4)?;
	if reader.pos != raw.len() {
		return Err(BitcoinError::MalformedTx("trailing bytes".into()));
	}

	let mut stripped = Vec::with_capacity(4 + (body_end - body_start) + 4);
	stripped.extend_from_slice(&raw[0..4]);
	stripped.extend_from_slice(&raw[body_start..body_end]);
	stripped.extend_from_slice(locktime);
	Ok(stripped)
}
