//! Storage keys for persisted data collections.

use std::str::FromStr;

/// Namespaces for persisted relay data.
///
/// This enum provides type safety for storage operations by replacing
/// string literals with strongly typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Durable queue jobs, keyed by Bitcoin txid.
	Jobs,
	/// Reconciler state: the last fully processed Bitcoin block height.
	Reconciler,
	/// Paymaster allocator state: the current funding parent cell.
	Paymaster,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Jobs => "jobs",
			StorageKey::Reconciler => "reconciler",
			StorageKey::Paymaster => "paymaster",
		}
	}

	/// Returns an iterator over all StorageKey variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[Self::Jobs, Self::Reconciler, Self::Paymaster].into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"jobs" => Ok(Self::Jobs),
			"reconciler" => Ok(Self::Reconciler),
			"paymaster" => Ok(Self::Paymaster),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
