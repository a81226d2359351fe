//! Storage backends holding named cache partitions.
//!
//! A store is a flat namespace of partitions, each a map from
//! [`RequestKey`] to [`StoredResponse`]. Callers always address a partition by
//! name; no handle outlives a single call, so a partition deleted between two
//! calls simply reads as empty on the next one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::request::{RequestKey, StoredResponse};

/// Abstraction over partition storage.
///
/// Implementations must tolerate concurrent reads and concurrent writes to
/// different keys. Concurrent writes to the same key are last-writer-wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Names of every partition in the store, including other sites'.
    async fn names(&self) -> Result<Vec<String>>;

    /// Creates the partition if it does not exist.
    async fn open(&self, name: &str) -> Result<()>;

    /// Deletes a partition and all its entries. Returns false if absent.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Reads one entry. A missing partition reads as empty.
    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

    /// Writes one entry, creating the partition if needed and replacing any
    /// previous entry for the key.
    async fn put(&self, name: &str, key: &RequestKey, response: StoredResponse) -> Result<()>;

    /// Keys currently stored in a partition.
    async fn keys(&self, name: &str) -> Result<Vec<RequestKey>>;
}

type Partition = HashMap<RequestKey, StoredResponse>;

/// In-memory store with an optional byte quota over all partitions.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    partitions: RwLock<HashMap<String, Partition>>,
    quota_bytes: Option<u64>,
}

impl MemoryCacheStore {
    /// Creates an unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that rejects writes once bodies exceed `bytes` in total.
    #[must_use]
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            partitions: RwLock::default(),
            quota_bytes: Some(bytes),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn names(&self) -> Result<Vec<String>> {
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn open(&self, name: &str) -> Result<()> {
        self.partitions
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.partitions.write().await.remove(name).is_some())
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(name)
            .and_then(|p| p.get(key))
            .cloned())
    }

    async fn put(&self, name: &str, key: &RequestKey, response: StoredResponse) -> Result<()> {
        let mut partitions = self.partitions.write().await;

        if let Some(quota) = self.quota_bytes {
            let used: u64 = partitions
                .iter()
                .flat_map(|(n, p)| p.iter().map(move |(k, v)| (n, k, v)))
                .filter(|(n, k, _)| !(n.as_str() == name && *k == key))
                .map(|(_, _, v)| v.size())
                .sum();
            let available = quota.saturating_sub(used);
            if response.size() > available {
                return Err(Error::QuotaExceeded {
                    partition: name.to_string(),
                    needed: response.size(),
                    available,
                });
            }
        }

        partitions
            .entry(name.to_string())
            .or_default()
            .insert(key.clone(), response);
        Ok(())
    }

    async fn keys(&self, name: &str) -> Result<Vec<RequestKey>> {
        Ok(self
            .partitions
            .read()
            .await
            .get(name)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// On-disk entry format: one JSON document per cached response.
#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    method: String,
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    /// Base64-encoded body.
    body: String,
    fresh: bool,
    stored_at: DateTime<Utc>,
}

impl DiskEntry {
    fn encode(key: &RequestKey, response: &StoredResponse) -> Self {
        Self {
            method: key.method().to_string(),
            url: key.url().to_string(),
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: BASE64.encode(&response.body),
            fresh: response.fresh,
            stored_at: response.stored_at,
        }
    }

    fn key(&self) -> Result<RequestKey> {
        if self.method != "GET" {
            return Err(Error::Storage(format!(
                "unexpected method {} in stored entry",
                self.method
            )));
        }
        let url = Url::parse(&self.url).map_err(|e| Error::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(RequestKey::get(&url))
    }

    fn decode(self) -> Result<StoredResponse> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| Error::Storage(format!("bad stored status {}: {e}", self.status)))?;
        let body = BASE64
            .decode(self.body.as_bytes())
            .map_err(|e| Error::Storage(format!("bad stored body: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        Ok(StoredResponse {
            status,
            headers,
            body: Bytes::from(body),
            fresh: self.fresh,
            stored_at: self.stored_at,
        })
    }
}

/// Persistent store: one directory per partition, one JSON file per entry.
///
/// Entry files are named by the SHA-256 of the key and written atomically
/// (write to a temporary file, then rename), so a crash never leaves a
/// half-written entry behind.
#[derive(Debug, Clone)]
pub struct DiskCacheStore {
    root: PathBuf,
}

impl DiskCacheStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn entry_path(&self, name: &str, key: &RequestKey) -> PathBuf {
        let digest = Sha256::digest(key.to_string().as_bytes());
        self.partition_dir(name).join(format!("{digest:x}.json"))
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn names(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn open(&self, name: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.partition_dir(name)).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.partition_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
        let contents = match tokio::fs::read(self.entry_path(name, key)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: DiskEntry = serde_json::from_slice(&contents)?;
        entry.decode().map(Some)
    }

    async fn put(&self, name: &str, key: &RequestKey, response: StoredResponse) -> Result<()> {
        self.open(name).await?;

        let path = self.entry_path(name, key);
        // Unique temp name so concurrent writers of the same key never share one.
        let tmp_path = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let json = serde_json::to_vec(&DiskEntry::encode(key, &response))?;

        tokio::fs::write(&tmp_path, json).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn keys(&self, name: &str) -> Result<Vec<RequestKey>> {
        let mut read_dir = match tokio::fs::read_dir(self.partition_dir(name)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let contents = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<DiskEntry>(&contents) {
                Ok(entry) => keys.push(entry.key()?),
                Err(e) => log::warn!("Skipping unreadable cache entry {}: {e}", path.display()),
            }
        }
        Ok(keys)
    }
}
