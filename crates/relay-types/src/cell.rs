//! Paymaster cell types.

use serde::{Deserialize, Serialize};

use crate::transaction::OutPoint;

/// A pre-funded CKB cell available to sponsor a transaction's fee and
/// capacity shortfall.
///
/// Lease bookkeeping (available / leased) is owned by the allocator; the
/// cell itself only carries its on-chain identity and value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymasterCell {
	pub out_point: OutPoint,
	/// Capacity in shannons.
	pub capacity: u64,
}
