//! Configuration types for the worker, its storage and its HTTP front.
//!
//! The build pipeline bakes a `config.toml` next to each deployment: the
//! version token, the critical asset manifest and the trusted third-party
//! origins all come from there.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::emergency::EmergencyRecord;
use crate::error::{Error, Result};

/// Configuration for one worker version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Shared prefix of every partition name belonging to this site.
    pub cache_prefix: String,
    /// Deployment version token embedded in partition names.
    pub version: String,
    /// The site's own origin, e.g. `https://example.com`.
    pub origin: String,
    /// Network timeout for intercepted fetches, in milliseconds.
    pub network_timeout_ms: u64,
    /// Paths (or absolute URLs) that must be available offline.
    pub critical_assets: Vec<String>,
    /// Third-party URLs fetched best-effort at install.
    pub external_resources: Vec<String>,
    /// Third-party origins whose responses may be cached.
    pub trusted_origins: Vec<String>,
    /// URL patterns that are never written to a partition.
    pub excluded_patterns: Vec<String>,
    /// URL patterns answered with the emergency record when offline.
    pub emergency_patterns: Vec<String>,
    /// Contact record served in degraded mode.
    pub emergency: EmergencyRecord,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "site".to_string(),
            version: "v1".to_string(),
            origin: "http://localhost:8080".to_string(),
            network_timeout_ms: 5_000,
            critical_assets: vec!["/".to_string()],
            external_resources: Vec::new(),
            trusted_origins: vec![
                "https://fonts.googleapis.com".to_string(),
                "https://fonts.gstatic.com".to_string(),
                "https://cdn.jsdelivr.net".to_string(),
            ],
            excluded_patterns: vec![
                r"(?i)google-analytics\.com".to_string(),
                r"(?i)googletagmanager\.com".to_string(),
                r"(?i)/(analytics|telemetry|collect)(/|$|\?)".to_string(),
            ],
            emergency_patterns: vec![r"(?i)/(emergency|contact)".to_string()],
            emergency: EmergencyRecord::default(),
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cache_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the network timeout. Sub-millisecond precision is dropped.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_critical_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_external_resources<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.external_resources = urls.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_trusted_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trusted_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_emergency(mut self, record: EmergencyRecord) -> Self {
        self.emergency = record;
        self
    }

    /// Network timeout for intercepted fetches.
    #[must_use]
    pub const fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Parses the site origin.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` if the origin is not an absolute http(s) URL.
    pub fn origin_url(&self) -> Result<Url> {
        let url = parse_url(&self.origin)?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::InvalidUrl {
                url: self.origin.clone(),
                reason: "origin must be an absolute http(s) URL".to_string(),
            });
        }
        Ok(url)
    }

    /// Resolves a manifest entry (site path or absolute URL) to an absolute URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` if the entry cannot be resolved.
    pub fn resolve(&self, entry: &str) -> Result<Url> {
        self.origin_url()?
            .join(entry)
            .map_err(|e| Error::InvalidUrl {
                url: entry.to_string(),
                reason: e.to_string(),
            })
    }

    /// Parses the trusted third-party origins.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUrl` for the first entry that does not parse.
    pub fn trusted_origin_urls(&self) -> Result<Vec<Url>> {
        self.trusted_origins.iter().map(|o| parse_url(o)).collect()
    }

    /// Checks that the configuration can drive a worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` or `Error::InvalidUrl` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.cache_prefix)?;
        validate_token("version", &self.version)?;
        if self.network_timeout_ms == 0 {
            return Err(Error::Config("network_timeout_ms must be positive".to_string()));
        }
        self.origin_url()?;
        for asset in self.critical_assets.iter().chain(&self.external_resources) {
            self.resolve(asset)?;
        }
        self.trusted_origin_urls()?;
        for pattern in self.excluded_patterns.iter().chain(&self.emergency_patterns) {
            Regex::new(pattern)
                .map_err(|e| Error::Config(format!("bad pattern {pattern:?}: {e}")))?;
        }
        Ok(())
    }
}

fn parse_url(input: &str) -> Result<Url> {
    Url::parse(input).map_err(|e| Error::InvalidUrl {
        url: input.to_string(),
        reason: e.to_string(),
    })
}

/// Partition names embed these tokens and the disk store uses them as
/// directory names, so they are restricted to a filename-safe alphabet.
fn validate_token(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{field} must be non-empty and use only [A-Za-z0-9._-], got {value:?}"
        )))
    }
}

/// The prefix ends at the first `-` of a partition name, so it may not
/// contain one; `site` must never claim the partitions of `site-blog`.
fn validate_prefix(value: &str) -> Result<()> {
    validate_token("cache_prefix", value)?;
    if value.contains('-') {
        return Err(Error::Config(format!(
            "cache_prefix may not contain '-', got {value:?}"
        )));
    }
    Ok(())
}

/// HTTP front configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9780,
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for persistent partitions. In-memory when unset.
    pub cache_dir: Option<PathBuf>,
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location under the platform config directory.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offline-worker")
            .join("config.toml")
    }

    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.worker.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but falls back to defaults when the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed or validated.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            let config = Self::default();
            config.worker.validate()?;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.cache_prefix, "site");
        assert_eq!(config.network_timeout(), Duration::from_secs(5));
        assert_eq!(config.critical_assets, vec!["/"]);
        config.validate().unwrap();
    }

    #[test]
    fn builder_pattern() {
        let config = WorkerConfig::new()
            .with_version("2024.06.1")
            .with_origin("https://example.com")
            .with_network_timeout(Duration::from_millis(250))
            .with_critical_assets(["/", "/app.css"])
            .with_trusted_origins(Vec::<String>::new());

        assert_eq!(config.version, "2024.06.1");
        assert_eq!(config.network_timeout_ms, 250);
        assert_eq!(config.critical_assets, vec!["/", "/app.css"]);
        assert!(config.trusted_origins.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn resolve_relative_and_absolute_entries() {
        let config = WorkerConfig::new().with_origin("https://example.com");
        assert_eq!(
            config.resolve("/app.css").unwrap().as_str(),
            "https://example.com/app.css"
        );
        assert_eq!(
            config.resolve("https://cdn.jsdelivr.net/x.js").unwrap().as_str(),
            "https://cdn.jsdelivr.net/x.js"
        );
    }

    #[test]
    fn rejects_unsafe_version_token() {
        let config = WorkerConfig::new().with_version("v1/../../etc");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = WorkerConfig::new().with_version("");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_prefix_with_dash() {
        let config = WorkerConfig::new().with_cache_prefix("site-blog");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        WorkerConfig::new().with_cache_prefix("site_blog").validate().unwrap();
    }

    #[test]
    fn rejects_relative_origin() {
        let config = WorkerConfig::new().with_origin("/just/a/path");
        assert!(matches!(config.validate(), Err(Error::InvalidUrl { .. })));
        let config = WorkerConfig::new().with_origin("ftp://example.com");
        assert!(matches!(config.validate(), Err(Error::InvalidUrl { .. })));
    }

    #[test]
    fn rejects_bad_pattern() {
        let mut config = WorkerConfig::new();
        config.excluded_patterns.push("(unclosed".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn load_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[worker]
version = "v7"
origin = "https://shop.example"
critical_assets = ["/", "/app.css"]

[worker.emergency]
business = "Acme Plumbing"
phone = "+1 555 0100"
email = "help@acme.example"
availability = "24/7"
response_time = "under 45 minutes"
services = ["Burst pipes"]

[server]
port = 8099
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.worker.version, "v7");
        assert_eq!(config.worker.cache_prefix, "site");
        assert_eq!(config.worker.emergency.business, "Acme Plumbing");
        assert_eq!(config.server.port, 8099);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.storage.cache_dir.is_none());
    }

    #[test]
    fn load_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[worker]\nnetwork_timeout_ms = 0\n").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.worker.version, "v1");
    }

    #[test]
    fn app_config_serializes_to_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.worker.version, config.worker.version);
        assert_eq!(back.server.port, config.server.port);
    }
}
