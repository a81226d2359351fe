//! Error types for the offline-worker library.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur while serving, caching or controlling the worker.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error from the network layer.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error from a storage backend or config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The configuration is syntactically valid but unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A URL could not be parsed or resolved against the site origin.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending input.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The network did not answer within the configured timeout.
    #[error("request to {url} timed out after {after:?}")]
    Timeout {
        /// Requested URL.
        url: String,
        /// Timeout that elapsed.
        after: Duration,
    },

    /// The network answered with a non-success status.
    #[error("request to {url} failed with status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status returned by the origin.
        status: StatusCode,
    },

    /// Generic network failure (connection refused, offline).
    #[error("network error: {0}")]
    Network(String),

    /// A partition write would exceed the storage quota.
    #[error("quota exceeded writing to {partition}: need {needed} bytes, {available} available")]
    QuotaExceeded {
        /// Partition name.
        partition: String,
        /// Bytes the write needs.
        needed: u64,
        /// Bytes left in the quota.
        available: u64,
    },

    /// A storage backend failed in a way not covered by `Io`.
    #[error("storage error: {0}")]
    Storage(String),

    /// A fetch or message arrived while no worker version is active.
    #[error("no active worker")]
    NoActiveWorker,

    /// A control message was malformed or could not be handled.
    #[error("control channel error: {0}")]
    Control(String),

    /// The worker version is being replaced and no longer writes to its
    /// partitions.
    #[error("worker {0} is retired")]
    Retired(String),
}

impl Error {
    /// Returns true for failures that mean "the network could not deliver":
    /// timeouts, bad statuses and transport errors.
    #[must_use]
    pub const fn is_network_failure(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout { .. } | Self::Status { .. } | Self::Network(_)
        )
    }
}

/// A specialized `Result` type for offline-worker operations.
pub type Result<T> = std::result::Result<T, Error>;
