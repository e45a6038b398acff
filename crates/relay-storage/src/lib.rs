//! Storage module for the RGB++ relay system.
//!
//! This module provides abstractions for persistent storage of relay data:
//! durable queue jobs, the reconciliation cursor, and allocator state. It
//! supports different backend implementations behind a common key-value
//! interface with optional time-to-live, used for job retention.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// A requested item does not exist (or has expired).
	#[error("Not found")]
	NotFound,
	/// Serialization or deserialization failed.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// The storage backend itself failed.
	#[error("Backend error: {0}")]
	Backend(String),
}

/// Trait defining the low-level interface for storage backends.
///
/// Keys are namespaced as `namespace:id`; backends must support listing
/// the ids of a namespace so the queue can recover after a restart.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores raw bytes with optional time-to-live.
	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	/// Deletes the value associated with the given key.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Checks if a key exists in storage.
	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Lists the ids stored under a namespace, excluding expired entries.
	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

	/// Removes expired entries from storage (optional operation).
	/// Returns the number of entries removed.
	/// Implementations that don't support expiration can return Ok(0).
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}
}

/// High-level storage service that provides typed operations.
///
/// Wraps a low-level backend and handles JSON serialization, key
/// namespacing, and typed bulk retrieval.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	fn key(namespace: &str, id: &str) -> String {
		format!("{}:{}", namespace, id)
	}

	/// Stores a serializable value with optional time-to-live.
	pub async fn store_with_ttl<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend
			.set_bytes(&Self::key(namespace, id), bytes, ttl)
			.await
	}

	/// Stores a serializable value without time-to-live.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		self.store_with_ttl(namespace, id, data, None).await
	}

	/// Retrieves and deserializes a value from storage.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&Self::key(namespace, id)).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Retrieves every value stored under a namespace.
	///
	/// Entries that fail to deserialize are skipped with a warning rather
	/// than aborting the whole scan; recovery must not be blocked by one
	/// corrupt record.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		let ids = self.backend.list_ids(namespace).await?;
		let mut out = Vec::with_capacity(ids.len());
		for id in ids {
			match self.retrieve::<T>(namespace, &id).await {
				Ok(value) => out.push((id, value)),
				Err(StorageError::NotFound) => {}
				Err(e) => {
					tracing::warn!(namespace, id = %id, error = %e, "Skipping unreadable entry");
				}
			}
		}
		Ok(out)
	}

	/// Removes a value from storage.
	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&Self::key(namespace, id)).await
	}

	/// Checks if a value exists in storage.
	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&Self::key(namespace, id)).await
	}

	/// Removes expired entries from storage.
	///
	/// Returns the number of entries that were removed.
	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}
}
