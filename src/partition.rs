//! Versioned cache partitions and the registry that owns their names.
//!
//! Every component reaches partition storage through [`CachePartitionRegistry`].
//! Partition identity is typed ([`PartitionId`]); turning it into a store
//! name is a pure serialization step confined to this module.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Result;
use crate::request::{RequestKey, StoredResponse};
use crate::store::CacheStore;

/// What a partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionPurpose {
    /// Own-origin assets the site needs to render offline.
    Critical,
    /// Responses from trusted third-party origins (fonts, CDN).
    External,
    /// Own-origin data responses and the emergency record.
    Ephemeral,
}

impl PartitionPurpose {
    /// All purposes, in lookup order.
    pub const ALL: [Self; 3] = [Self::Critical, Self::External, Self::Ephemeral];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::External => "external",
            Self::Ephemeral => "ephemeral",
        }
    }
}

impl fmt::Display for PartitionPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionPurpose {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "external" => Ok(Self::External),
            "ephemeral" => Ok(Self::Ephemeral),
            _ => Err(()),
        }
    }
}

/// Typed partition identifier: a purpose at a deployment version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionId {
    /// What the partition holds.
    pub purpose: PartitionPurpose,
    /// Deployment version that owns it; may itself contain `-`.
    pub version: String,
}

impl PartitionId {
    #[must_use]
    pub fn new(purpose: PartitionPurpose, version: impl Into<String>) -> Self {
        Self {
            purpose,
            version: version.into(),
        }
    }

    /// Serializes to the store name `{prefix}-{version}-{purpose}`.
    #[must_use]
    pub fn name(&self, prefix: &str) -> String {
        format!("{prefix}-{}-{}", self.version, self.purpose)
    }

    /// Parses a store name produced by [`name`](Self::name) with the same
    /// prefix. Names of other sites, or with an unknown purpose, yield `None`.
    #[must_use]
    pub fn parse(prefix: &str, name: &str) -> Option<Self> {
        let (owner, rest) = name.split_once('-')?;
        if owner != prefix {
            return None;
        }
        let (version, purpose) = rest.rsplit_once('-')?;
        if version.is_empty() {
            return None;
        }
        Some(Self::new(purpose.parse().ok()?, version))
    }
}

/// Resolves partition identities to store names and mediates every read,
/// write and deletion.
///
/// The registry holds no partition handles: each call re-resolves the name in
/// the store, so a partition deleted by activation or `CLEAR_CACHE` can never
/// be written through a stale handle.
#[derive(Clone)]
pub struct CachePartitionRegistry {
    prefix: String,
    version: String,
    store: Arc<dyn CacheStore>,
}

impl fmt::Debug for CachePartitionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePartitionRegistry")
            .field("prefix", &self.prefix)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CachePartitionRegistry {
    #[must_use]
    pub fn new(
        prefix: impl Into<String>,
        version: impl Into<String>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
            store,
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The current partition for a purpose.
    #[must_use]
    pub fn current(&self, purpose: PartitionPurpose) -> PartitionId {
        PartitionId::new(purpose, self.version.clone())
    }

    #[must_use]
    pub fn name_of(&self, id: &PartitionId) -> String {
        id.name(&self.prefix)
    }

    #[must_use]
    pub fn parse_name(&self, name: &str) -> Option<PartitionId> {
        PartitionId::parse(&self.prefix, name)
    }

    fn current_name(&self, purpose: PartitionPurpose) -> String {
        self.name_of(&self.current(purpose))
    }

    /// Returns true if the store name belongs to this site. Prefixes are
    /// dash-free, so the owner is everything before the first `-`.
    fn owns(&self, name: &str) -> bool {
        name.split_once('-')
            .is_some_and(|(owner, _)| owner == self.prefix)
    }

    /// Creates the three current partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot create a partition.
    pub async fn open_current(&self) -> Result<()> {
        for purpose in PartitionPurpose::ALL {
            self.store.open(&self.current_name(purpose)).await?;
        }
        Ok(())
    }

    /// Reads an entry from the current partition for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get(
        &self,
        purpose: PartitionPurpose,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>> {
        self.store.get(&self.current_name(purpose), key).await
    }

    /// Looks a key up in the `preferred` partition first, then in the other
    /// current partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails.
    pub async fn lookup(
        &self,
        key: &RequestKey,
        preferred: PartitionPurpose,
    ) -> Result<Option<(PartitionPurpose, StoredResponse)>> {
        let order = std::iter::once(preferred)
            .chain(PartitionPurpose::ALL.into_iter().filter(|p| *p != preferred));
        for purpose in order {
            if let Some(stored) = self.get(purpose, key).await? {
                return Ok(Some((purpose, stored)));
            }
        }
        Ok(None)
    }

    /// Writes an entry into the current partition for `purpose`, replacing
    /// any previous entry for the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails (including quota errors).
    pub async fn put(
        &self,
        purpose: PartitionPurpose,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<()> {
        self.store
            .put(&self.current_name(purpose), key, response)
            .await
    }

    /// Returns true if the current partition for `purpose` holds `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn contains(&self, purpose: PartitionPurpose, key: &RequestKey) -> Result<bool> {
        Ok(self.get(purpose, key).await?.is_some())
    }

    /// Number of entries in the current partition for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list the partition.
    pub async fn entry_count(&self, purpose: PartitionPurpose) -> Result<usize> {
        Ok(self.store.keys(&self.current_name(purpose)).await?.len())
    }

    /// Names of every partition belonging to this site, any version.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot list partitions.
    pub async fn site_partitions(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self
            .store
            .names()
            .await?
            .into_iter()
            .filter(|n| self.owns(n))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Deletes every site partition that is not current. Partitions of other
    /// sites are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or deleting fails.
    pub async fn purge_stale(&self) -> Result<Vec<String>> {
        let current: Vec<_> = PartitionPurpose::ALL
            .into_iter()
            .map(|p| self.current_name(p))
            .collect();

        let mut deleted = Vec::new();
        for name in self.site_partitions().await? {
            if current.contains(&name) {
                continue;
            }
            if self.store.delete(&name).await? {
                log::info!("Deleted stale partition {name}");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Deletes every site partition, current ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or deleting fails.
    pub async fn clear_all(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.site_partitions().await? {
            if self.store.delete(&name).await? {
                deleted.push(name);
            }
        }
        log::info!("Cleared {} partition(s)", deleted.len());
        Ok(deleted)
    }
}
