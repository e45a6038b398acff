//! Configuration module for the RGB++ relay system.
//!
//! This module provides structures and utilities for managing relay
//! configuration. It supports loading configuration from TOML files and
//! provides validation to ensure all required configuration values are
//! properly set before any component starts.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_types::decode_hex32;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
	/// Configuration specific to the relay instance.
	pub relay: RelaySection,
	/// Configuration for the storage backend.
	pub storage: StorageSection,
	/// Configuration for the durable job queue.
	#[serde(default)]
	pub queue: QueueSection,
	/// Configuration for the Bitcoin data source and SPV oracle.
	pub bitcoin: BitcoinSection,
	/// Configuration for the CKB client and RGB++ scripts.
	pub ckb: CkbSection,
	/// Configuration for the paymaster cell allocator.
	/// When absent, requests flagged `needs_paymaster_cell` fail.
	pub paymaster: Option<PaymasterSection>,
	/// Configuration for the missing-transaction reconciler.
	#[serde(default)]
	pub reconciler: ReconcilerSection,
}

/// Configuration specific to the relay instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySection {
	/// Unique identifier for this relay instance.
	pub id: String,
	/// Number of settlement jobs processed concurrently.
	#[serde(default = "default_worker_concurrency")]
	pub worker_concurrency: usize,
}

fn default_worker_concurrency() -> usize {
	10
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
	Memory,
	File,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSection {
	pub backend: StorageBackend,
	/// Base directory for the file backend.
	#[serde(default = "default_storage_path")]
	pub path: String,
	/// How long terminal jobs are retained, in seconds.
	#[serde(default = "default_job_retention_secs")]
	pub job_retention_secs: u64,
}

fn default_storage_path() -> String {
	"./data/storage".to_string()
}

/// Returns the default terminal-job retention: 7 days.
fn default_job_retention_secs() -> u64 {
	7 * 24 * 3600
}

/// Configuration for the durable job queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSection {
	/// Base delay for exponential backoff, in seconds.
	#[serde(default = "default_base_delay_secs")]
	pub base_delay_secs: u64,
	/// Maximum failed attempts before a job becomes terminally failed.
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	/// Processing lease duration; an active job whose lease expired is
	/// considered crashed and becomes eligible for redelivery.
	#[serde(default = "default_lease_timeout_secs")]
	pub lease_timeout_secs: u64,
	/// Dispatcher poll interval, in milliseconds.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
}

impl Default for QueueSection {
	fn default() -> Self {
		Self {
			base_delay_secs: default_base_delay_secs(),
			max_attempts: default_max_attempts(),
			lease_timeout_secs: default_lease_timeout_secs(),
			poll_interval_ms: default_poll_interval_ms(),
		}
	}
}

fn default_base_delay_secs() -> u64 {
	30
}

fn default_max_attempts() -> u32 {
	6
}

fn default_lease_timeout_secs() -> u64 {
	300
}

fn default_poll_interval_ms() -> u64 {
	500
}

/// Which Bitcoin data source implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BitcoinSourceKind {
	/// Esplora-style REST API (mempool.space, blockstream.info).
	Esplora,
	/// Bitcoin Core JSON-RPC.
	CoreRpc,
}

/// Configuration for the Bitcoin data source and SPV oracle.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BitcoinSection {
	pub source: BitcoinSourceKind,
	/// Base URL of the Bitcoin data source.
	pub url: String,
	/// RPC credentials for the `core_rpc` source.
	#[serde(default)]
	pub rpc_user: Option<String>,
	#[serde(default)]
	pub rpc_password: Option<String>,
	/// Confirmations required before a transaction counts as final.
	#[serde(default = "default_min_confirmations")]
	pub min_confirmations: u64,
	/// Base URL of the SPV proof service.
	pub spv_url: String,
	/// Optional verification that the Bitcoin transaction paid the
	/// sponsorship fee to this script before a paymaster cell is leased.
	#[serde(default)]
	pub fee_check: Option<FeeCheckSection>,
}

fn default_min_confirmations() -> u64 {
	1
}

/// Sponsorship fee verification parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeeCheckSection {
	/// scriptPubKey of the fee collection address, hex-encoded.
	pub recipient_script_hex: String,
	/// Minimum amount the transaction must pay to it, in satoshis.
	pub min_fee_sats: u64,
}

/// Configuration for the CKB client and RGB++ scripts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CkbSection {
	/// CKB node JSON-RPC endpoint.
	pub rpc_url: String,
	/// Remote transaction signer endpoint.
	pub signer_url: String,
	/// Fixed interval between confirmation polls, in seconds.
	#[serde(default = "default_confirm_poll_interval_secs")]
	pub confirm_poll_interval_secs: u64,
	/// Maximum confirmation polls after broadcast before giving up.
	#[serde(default = "default_confirm_poll_attempts")]
	pub confirm_poll_attempts: u32,
	/// Code hash of the RGB++ lock script, hex-encoded.
	pub rgbpp_lock_code_hash: String,
	/// Code hash of the BTC time lock script, hex-encoded.
	pub btc_time_lock_code_hash: String,
}

fn default_confirm_poll_interval_secs() -> u64 {
	3
}

fn default_confirm_poll_attempts() -> u32 {
	40
}

/// Configuration for the paymaster cell allocator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymasterSection {
	/// Number of cells a refill produces.
	#[serde(default = "default_preset_count")]
	pub preset_count: usize,
	/// Capacity of each pre-funded cell, in shannons.
	#[serde(default = "default_cell_capacity_shannons")]
	pub cell_capacity_shannons: u64,
	/// Pool fraction (percent) below which a background refill starts.
	#[serde(default = "default_refill_threshold_percent")]
	pub refill_threshold_percent: u8,
	/// Fee budget reserved by a refill funding transaction, in shannons.
	#[serde(default = "default_refill_fee_shannons")]
	pub refill_fee_shannons: u64,
	/// Fee deducted from a sponsored cell when it is appended, in shannons.
	#[serde(default = "default_sponsor_fee_shannons")]
	pub sponsor_fee_shannons: u64,
	/// The initial funding parent cell; subsequent parents are the change
	/// outputs of refill transactions and are tracked in storage.
	pub parent_tx_hash: String,
	pub parent_index: u32,
	/// Lock script of the paymaster cells, hex fields.
	pub lock_code_hash: String,
	pub lock_args: String,
}

fn default_preset_count() -> usize {
	50
}

/// 316 CKB: enough for a standard output plus fee headroom.
fn default_cell_capacity_shannons() -> u64 {
	31_600_000_000
}

fn default_refill_threshold_percent() -> u8 {
	30
}

fn default_refill_fee_shannons() -> u64 {
	100_000
}

fn default_sponsor_fee_shannons() -> u64 {
	10_000
}

/// Configuration for the missing-transaction reconciler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcilerSection {
	#[serde(default = "default_reconciler_enabled")]
	pub enabled: bool,
	/// Seconds between sweep ticks.
	#[serde(default = "default_reconciler_interval_secs")]
	pub interval_secs: u64,
	/// Blocks fetched per batch.
	#[serde(default = "default_reconciler_batch_size")]
	pub batch_size: u64,
	/// Pause between batches, rate control against the Bitcoin provider.
	#[serde(default = "default_reconciler_batch_delay_secs")]
	pub batch_delay_secs: u64,
}

impl Default for ReconcilerSection {
	fn default() -> Self {
		Self {
			enabled: default_reconciler_enabled(),
			interval_secs: default_reconciler_interval_secs(),
			batch_size: default_reconciler_batch_size(),
			batch_delay_secs: default_reconciler_batch_delay_secs(),
		}
	}
}

fn default_reconciler_enabled() -> bool {
	true
}

fn default_reconciler_interval_secs() -> u64 {
	60
}

fn default_reconciler_batch_size() -> u64 {
	10
}

fn default_reconciler_batch_delay_secs() -> u64 {
	1
}

impl RelayConfig {
	/// Loads and validates configuration from a TOML file.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let raw = std::fs::read_to_string(path)?;
		Self::from_toml_str(&raw)
	}

	/// Parses and validates configuration from a TOML string.
	pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
		let config: RelayConfig = toml::from_str(raw)?;
		config.validate()?;
		Ok(config)
	}

	/// Validates cross-field constraints the type system cannot express.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.relay.id.is_empty() {
			return Err(ConfigError::Validation("relay.id must not be empty".into()));
		}
		if self.relay.worker_concurrency == 0 {
			return Err(ConfigError::Validation(
				"relay.worker_concurrency must be at least 1".into(),
			));
		}
		if self.queue.max_attempts == 0 {
			return Err(ConfigError::Validation(
				"queue.max_attempts must be at least 1".into(),
			));
		}
		if self.bitcoin.source == BitcoinSourceKind::CoreRpc
			&& (self.bitcoin.rpc_user.is_none() || self.bitcoin.rpc_password.is_none())
		{
			return Err(ConfigError::Validation(
				"bitcoin.rpc_user and bitcoin.rpc_password are required for the core_rpc source"
					.into(),
			));
		}

		let mut hashes: HashMap<&str, &str> = HashMap::new();
		hashes.insert("ckb.rgbpp_lock_code_hash", &self.ckb.rgbpp_lock_code_hash);
		hashes.insert(
			"ckb.btc_time_lock_code_hash",
			&self.ckb.btc_time_lock_code_hash,
		);
		if let Some(paymaster) = &self.paymaster {
			hashes.insert("paymaster.parent_tx_hash", &paymaster.parent_tx_hash);
			hashes.insert("paymaster.lock_code_hash", &paymaster.lock_code_hash);
		}
		for (field, value) in hashes {
			decode_hex32(value).map_err(|e| {
				ConfigError::Validation(format!("{} is not a 32-byte hex hash: {}", field, e))
			})?;
		}

		if let Some(paymaster) = &self.paymaster {
			if paymaster.preset_count == 0 {
				return Err(ConfigError::Validation(
					"paymaster.preset_count must be at least 1".into(),
				));
			}
			if !(1..=99).contains(&paymaster.refill_threshold_percent) {
				return Err(ConfigError::Validation(
					"paymaster.refill_threshold_percent must be between 1 and 99".into(),
				));
			}
			if paymaster.sponsor_fee_shannons >= paymaster.cell_capacity_shannons {
				return Err(ConfigError::Validation(
					"paymaster.sponsor_fee_shannons must be below cell_capacity_shannons".into(),
				));
			}
		}
		Ok(())
	}
}
