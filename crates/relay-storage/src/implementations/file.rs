//! File-based storage backend.
//!
//! Stores each entry as its own file under a base directory, with a small
//! binary header carrying the expiry so job retention survives restarts.
//! Writes go through a temp file and rename, so a crash mid-write never
//! leaves a torn entry behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use relay_types::StorageKey;
use tokio::fs;

use crate::{StorageError, StorageInterface};

/// Fixed-size file header for TTL support.
///
/// Binary layout (16 bytes total):
/// - [0-3]: Magic bytes "RLAY"
/// - [4-5]: Version (u16, little-endian)
/// - [6-7]: Reserved
/// - [8-15]: Expiration timestamp (u64, little-endian, Unix seconds, 0 = never)
#[derive(Debug, Clone, Copy)]
struct FileHeader {
	expires_at: u64,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"RLAY";
	const VERSION: u16 = 1;
	const SIZE: usize = 16;

	fn new(ttl: Duration) -> Self {
		let expires_at = if ttl.is_zero() {
			0
		} else {
			unix_now().saturating_add(ttl.as_secs())
		};
		Self { expires_at }
	}

	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&Self::VERSION.to_le_bytes());
		bytes[8..16].copy_from_slice(&self.expires_at.to_le_bytes());
		bytes
	}

	fn deserialize(bytes: &[u8]) -> Result<Self, StorageError> {
		if bytes.len() < Self::SIZE {
			return Err(StorageError::Backend("file too small for header".into()));
		}
		if &bytes[0..4] != Self::MAGIC {
			return Err(StorageError::Backend("bad magic bytes".into()));
		}
		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"unsupported file version: {}",
				version
			)));
		}
		let mut expires = [0u8; 8];
		expires.copy_from_slice(&bytes[8..16]);
		Ok(Self {
			expires_at: u64::from_le_bytes(expires),
		})
	}

	fn is_expired(&self) -> bool {
		self.expires_at != 0 && unix_now() >= self.expires_at
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

/// Per-namespace retention configuration.
///
/// A namespace without an explicit TTL keeps its entries forever. The
/// relay sets a TTL only on terminal jobs (the retention policy); live
/// jobs, the cursor, and allocator state are permanent.
#[derive(Debug, Clone, Default)]
pub struct TtlConfig {
	ttls: HashMap<StorageKey, Duration>,
}

impl TtlConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_ttl(mut self, key: StorageKey, ttl: Duration) -> Self {
		self.ttls.insert(key, ttl);
		self
	}

	fn get(&self, key: StorageKey) -> Duration {
		self.ttls.get(&key).copied().unwrap_or(Duration::ZERO)
	}
}

/// File-based storage implementation.
pub struct FileStorage {
	base_path: PathBuf,
	ttl_config: TtlConfig,
}

impl FileStorage {
	/// Creates a new FileStorage rooted at `base_path`.
	pub fn new(base_path: PathBuf, ttl_config: TtlConfig) -> Self {
		Self {
			base_path,
			ttl_config,
		}
	}

	/// Converts a storage key to a filesystem-safe file path.
	fn file_path(&self, key: &str) -> PathBuf {
		let safe_key = key.replace(['/', ':'], "_");
		self.base_path.join(format!("{}.bin", safe_key))
	}

	/// Default TTL for a key, derived from its namespace.
	fn ttl_for_key(&self, key: &str) -> Duration {
		let namespace = key.split(':').next().unwrap_or("");
		namespace
			.parse::<StorageKey>()
			.map(|sk| self.ttl_config.get(sk))
			.unwrap_or(Duration::ZERO)
	}

	async fn read_entry(&self, path: &PathBuf) -> Result<Option<Vec<u8>>, StorageError> {
		let data = match fs::read(path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};
		let header = FileHeader::deserialize(&data)?;
		if header.is_expired() {
			return Ok(None);
		}
		Ok(Some(data[FileHeader::SIZE..].to_vec()))
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let path = self.file_path(key);
		self.read_entry(&path).await?.ok_or(StorageError::NotFound)
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let path = self.file_path(key);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| StorageError::Backend(e.to_string()))?;
		}

		let ttl = ttl.unwrap_or_else(|| self.ttl_for_key(key));
		let header = FileHeader::new(ttl);

		let mut file_data = Vec::with_capacity(FileHeader::SIZE + value.len());
		file_data.extend_from_slice(&header.serialize());
		file_data.extend_from_slice(&value);

		// Write atomically by writing to temp file then renaming
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, file_data)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?;

		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		let path = self.file_path(key);
		match fs::remove_file(&path).await {
			Ok(_) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StorageError::Backend(e.to_string())),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let path = self.file_path(key);
		Ok(self.read_entry(&path).await?.is_some())
	}

	async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let prefix = format!("{}_", namespace);
		let mut ids = Vec::new();

		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let name = entry.file_name();
			let Some(name) = name.to_str() else { continue };
			let Some(stem) = name.strip_suffix(".bin") else {
				continue;
			};
			let Some(id) = stem.strip_prefix(&prefix) else {
				continue;
			};
			// Hide expired entries from listings without deleting them;
			// cleanup_expired owns removal.
			if self.read_entry(&entry.path()).await?.is_some() {
				ids.push(id.to_string());
			}
		}
		Ok(ids)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let mut removed = 0;
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(StorageError::Backend(e.to_string())),
		};

		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StorageError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension() != Some(std::ffi::OsStr::new("bin")) {
				continue;
			}
			match fs::read(&path).await {
				Ok(data) => {
					if let Ok(header) = FileHeader::deserialize(&data) {
						if header.is_expired() {
							if let Err(e) = fs::remove_file(&path).await {
								tracing::warn!("Failed to remove expired file {:?}: {}", path, e);
							} else {
								removed += 1;
							}
						}
					}
				}
				Err(e) => {
					tracing::debug!("Skipping file {:?}: could not be read: {}", path, e);
				}
			}
		}
		Ok(removed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn storage(dir: &tempfile::TempDir) -> FileStorage {
		FileStorage::new(dir.path().to_path_buf(), TtlConfig::new())
	}

	#[tokio::test]
	async fn test_roundtrip_and_delete() {
		let dir = tempfile::tempdir().unwrap();
		let storage = storage(&dir);

		storage
			.set_bytes("jobs:abc", b"payload".to_vec(), None)
			.await
			.unwrap();
		assert_eq!(storage.get_bytes("jobs:abc").await.unwrap(), b"payload");
		assert!(storage.exists("jobs:abc").await.unwrap());

		storage.delete("jobs:abc").await.unwrap();
		assert!(matches!(
			storage.get_bytes("jobs:abc").await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_list_ids_by_namespace() {
		let dir = tempfile::tempdir().unwrap();
		let storage = storage(&dir);

		storage.set_bytes("jobs:a", vec![1], None).await.unwrap();
		storage.set_bytes("jobs:b", vec![2], None).await.unwrap();
		storage
			.set_bytes("reconciler:cursor", vec![3], None)
			.await
			.unwrap();

		let mut ids = storage.list_ids("jobs").await.unwrap();
		ids.sort();
		assert_eq!(ids, vec!["a", "b"]);
	}

	#[tokio::test]
	async fn test_expired_file_removed_by_cleanup() {
		let dir = tempfile::tempdir().unwrap();
		let storage = storage(&dir);

		// Expires immediately (1s TTL with a forged past timestamp).
		let mut data = FileHeader { expires_at: 1 }.serialize().to_vec();
		data.extend_from_slice(b"stale");
		fs::write(dir.path().join("jobs_old.bin"), data).await.unwrap();

		assert!(!storage.exists("jobs:old").await.unwrap());
		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
		assert!(storage.list_ids("jobs").await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_ttl_applied_from_namespace_config() {
		let dir = tempfile::tempdir().unwrap();
		let ttl = TtlConfig::new().with_ttl(StorageKey::Jobs, Duration::from_secs(3600));
		let storage = FileStorage::new(dir.path().to_path_buf(), ttl);

		storage.set_bytes("jobs:a", vec![1], None).await.unwrap();
		let raw = fs::read(dir.path().join("jobs_a.bin")).await.unwrap();
		let header = FileHeader::deserialize(&raw).unwrap();
		assert!(header.expires_at > unix_now());
	}
}
