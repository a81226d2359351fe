//! offline-worker - An offline-first caching layer for a small business site.
//!
//! A worker version owns three versioned cache partitions (critical assets,
//! trusted third-party resources, and short-lived data), serves intercepted
//! requests cache-first, refreshes documents in the background, and degrades
//! to an offline page with the emergency phone number when both network and
//! cache fail. New versions install next to the active one and take over in
//! two phases.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_worker::{
//!     HttpNetwork, LifecycleController, MemoryCacheStore, Request, Worker, WorkerConfig,
//! };
//!
//! # async fn example() -> offline_worker::Result<()> {
//! let config = WorkerConfig::new()
//!     .with_origin("https://plumbing.example")
//!     .with_version("v3")
//!     .with_critical_assets(["/", "/styles.css"]);
//! let origin = config.origin_url()?;
//!
//! let network = Arc::new(HttpNetwork::new(offline_worker::network::build_http_client()?));
//! let worker = Worker::new(config, Arc::new(MemoryCacheStore::new()), network)?;
//!
//! let controller = LifecycleController::new();
//! controller.register(worker).await?;
//!
//! let page = origin.join("/services").expect("valid path");
//! let response = controller.fetch(Request::navigate(page)).await?;
//! println!("{} from {:?}", response.status, response.source);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod control;
pub mod degrade;
pub mod emergency;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod network;
pub mod partition;
pub mod request;
pub mod routing;
pub mod stats;
pub mod store;
pub mod worker;

#[cfg(feature = "server")]
pub mod api;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{AppConfig, ServerConfig, StorageConfig, WorkerConfig};
pub use control::{ControlMessage, ControlReply, ReplyPort, WireMessage};
pub use degrade::DegradationLayer;
pub use emergency::EmergencyRecord;
pub use error::{Error, Result};
pub use interceptor::Interceptor;
pub use lifecycle::{ClientId, ClientRegistry, LifecycleController, Registration, RegistrationState};
pub use network::{HttpNetwork, Network};
pub use partition::{CachePartitionRegistry, PartitionId, PartitionPurpose};
pub use request::{Destination, Request, RequestKey, Response, ResponseSource, StoredResponse};
pub use routing::{Route, RoutePolicy};
pub use stats::{StatsSnapshot, WorkerStats};
pub use store::{CacheStore, DiskCacheStore, MemoryCacheStore};
pub use worker::{Worker, WorkerEvent, WorkerState};
