//! Common types module for the RGB++ relay system.
//!
//! This module defines the core data types shared across the relay
//! components: transaction requests, CKB transaction structures, queue
//! jobs, paymaster cells, events, and storage keys. It provides a
//! centralized location for shared types to ensure consistency across
//! all relay crates.

/// Paymaster cell types.
pub mod cell;
/// Event types for inter-component communication.
pub mod events;
/// Queue-level job types wrapping transaction requests.
pub mod job;
/// Transaction request types submitted by external callers.
pub mod request;
/// Storage keys for persisted data collections.
pub mod storage;
/// CKB transaction structures.
pub mod transaction;
/// Utility functions for hex and time handling.
pub mod utils;

// Re-export all types for convenient access
pub use cell::*;
pub use events::*;
pub use job::*;
pub use request::*;
pub use storage::*;
pub use transaction::*;
pub use utils::{
	decode_hex, decode_hex32, encode_hex, now_secs, truncate_id, with_0x_prefix,
	without_0x_prefix, HexError,
};
