//! In-memory storage backend.
//!
//! Keeps everything in a process-local map. Useful for tests and for
//! development runs where durability across restarts is not needed; TTL
//! is honored so retention behaves the same as the file backend.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{StorageError, StorageInterface};

/// Stored value plus its expiry (0 = never expires).
struct Entry {
	expires_at: u64,
	data: Vec<u8>,
}

impl Entry {
	fn is_expired(&self, now: u64) -> bool {
		self.expires_at != 0 && now >= self.expires_at
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

/// In-memory storage implementation.
pub struct MemoryStorage {
	store: RwLock<HashMap<String, Entry>>,
}

impl MemoryStorage {
	/// Creates a new MemoryStorage instance.
	pub fn new() -> Self {
		Self {
			store: RwLock::new(HashMap::new()),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let store = self.store.read().await;
		match store.get(key) {
			Some(entry) if !entry.is_expired(unix_now()) => Ok(entry.data.clone()),
			_ => Err(StorageError::NotFound),
		}
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let expires_at = match ttl {
			Some(ttl) if !ttl.is_zero() => unix_now().saturating_add(ttl.as_secs()),
			_ => 0,
		};
		let mut store = self.store.write().await;
		store.insert(
			key.to_string(),
			Entry {
				expires_at,
				data: value,
			},
		);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		store.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let store = self.store.read().await;
		Ok(store
			.get(key)
			.is_some_and(|entry| !entry.is_expired(unix_now())))
	}

	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let prefix = format!("{}:", namespace);
		let now = unix_now();
		let store = self.store.read().await;
		Ok(store
			.iter()
			.filter(|(_, entry)| !entry.is_expired(now))
			.filter_map(|(key, _)| key.strip_prefix(&prefix))
			.map(str::to_string)
			.collect())
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let now = unix_now();
		let mut store = self.store.write().await;
		let before = store.len();
		store.retain(|_, entry| !entry.is_expired(now));
		Ok(before - store.len())
	}
}
