//! Per-request routing policy.
//!
//! Decides, before anything is read or written, whether a request is the
//! worker's business at all and which partition it belongs to.

use regex::RegexSet;
use reqwest::{Method, Url};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::partition::PartitionPurpose;
use crate::request::{Destination, Request};

/// Why a request is passed straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Only GET participates in caching.
    Method,
    /// Neither the site origin nor a trusted third party.
    ForeignOrigin,
}

/// Serving strategy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward untouched; no partition is read or written.
    Bypass(BypassReason),
    /// Network with timeout, never cached (analytics and telemetry).
    NetworkOnly,
    /// Cache first, falling back to network and writing the result.
    CacheFirst {
        partition: PartitionPurpose,
        /// Refresh the entry in the background after a hit.
        revalidate: bool,
    },
}

/// Routing rules compiled from the worker configuration.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    origin: Url,
    trusted: Vec<Url>,
    excluded: RegexSet,
    emergency: RegexSet,
}

impl RoutePolicy {
    /// Compiles the policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin, a trusted origin or a pattern is invalid.
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let compile = |patterns: &[String]| {
            RegexSet::new(patterns).map_err(|e| Error::Config(format!("bad URL pattern: {e}")))
        };
        Ok(Self {
            origin: config.origin_url()?,
            trusted: config.trusted_origin_urls()?,
            excluded: compile(&config.excluded_patterns)?,
            emergency: compile(&config.emergency_patterns)?,
        })
    }

    /// The site's own origin.
    #[must_use]
    pub const fn origin(&self) -> &Url {
        &self.origin
    }

    #[must_use]
    pub fn is_own_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    #[must_use]
    pub fn is_trusted(&self, url: &Url) -> bool {
        let origin = url.origin();
        self.trusted.iter().any(|t| t.origin() == origin)
    }

    /// Analytics and telemetry endpoints that are never cached.
    #[must_use]
    pub fn is_excluded(&self, url: &Url) -> bool {
        self.excluded.is_match(url.as_str())
    }

    /// Emergency and contact endpoints. Only the path and query are matched,
    /// so a host name like `contact.example.com` does not count.
    #[must_use]
    pub fn is_emergency(&self, url: &Url) -> bool {
        let target = url
            .query()
            .map_or_else(|| url.path().to_string(), |q| format!("{}?{q}", url.path()));
        self.emergency.is_match(&target)
    }

    /// Picks the partition a cacheable request belongs to.
    ///
    /// Trusted third-party responses go to `External`. Own-origin data
    /// (destination `empty`, i.e. `fetch()`/XHR) and emergency endpoints go to
    /// `Ephemeral`. Every other own-origin request is `Critical`.
    #[must_use]
    pub fn classify(&self, request: &Request) -> PartitionPurpose {
        if !self.is_own_origin(&request.url) {
            PartitionPurpose::External
        } else if request.destination == Destination::Empty || self.is_emergency(&request.url) {
            PartitionPurpose::Ephemeral
        } else {
            PartitionPurpose::Critical
        }
    }

    /// Decides the serving strategy for a request.
    #[must_use]
    pub fn decide(&self, request: &Request) -> Route {
        if request.method != Method::GET {
            return Route::Bypass(BypassReason::Method);
        }
        if !self.is_own_origin(&request.url) && !self.is_trusted(&request.url) {
            return Route::Bypass(BypassReason::ForeignOrigin);
        }
        if self.is_excluded(&request.url) {
            return Route::NetworkOnly;
        }
        Route::CacheFirst {
            partition: self.classify(request),
            revalidate: request.is_navigation(),
        }
    }
}
