//! Region-addressable persistent storage service.
//!
//! A service hosts providers; each provider manages a set of *targets*
//! (fixed-capacity pool files) in which clients allocate *regions*, write
//! bytes into them, persist ranges and read them back. Payloads travel inline
//! with the request below a per-handle eager limit and through an exposed
//! bulk buffer above it. Regions and whole targets can be migrated between
//! providers while the service is running.
//!
//! # Example
//!
//! ```rust,no_run
//! use silo::{Client, ClientConfig, ProviderConfig, Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::start(ServiceConfig::new("127.0.0.1:7400".parse()?)).await?;
//!     let provider = service.add_provider(1, ProviderConfig::default())?;
//!     let target = provider.create_target("/tmp/silo-demo.pool", 1 << 20)?;
//!
//!     let client = Client::new(ClientConfig::default()).await?;
//!     let handle = client.provider_handle(service.endpoint(), 1);
//!
//!     let region = handle.create(target, 32).await?;
//!     handle.write(target, &region, 0, b"hello, region").await?;
//!     handle.persist(target, &region, 0, 13).await?;
//!     assert_eq!(handle.read(target, &region, 0, 5).await?, b"hello");
//!
//!     service.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  Request / Response   ┌─────────────────────────────┐
//! │ProviderHandle│ ────────────────────► │ Service                     │
//! │  (client)    │                       │  ├─ Provider 1              │
//! │              │ ◄──── BulkPull/Push ─ │  │   ├─ TargetManager       │
//! │ bulk listener│                       │  │   │   └─ RegionStore ... │
//! └──────────────┘                       │  │   ├─ MigrationCoordinator│
//!                                        │  │   └─ TargetReceiver      │
//!                                        │  └─ Provider N              │
//!                                        └─────────────────────────────┘
//! ```
//!
//! # Durability
//!
//! Bytes written to a region are durable only once a `persist` covering
//! them has returned. `create_write_persist` is all or nothing: on failure
//! the new region is removed before the error is reported.

pub mod client;
pub mod config;
pub mod error;
pub mod ident;
pub mod metrics;
pub mod migration;
pub mod network;
pub mod provider;
pub mod service;
pub mod store;
pub mod testing;
pub mod transfer;
pub mod types;

pub use client::{Client, ProviderHandle};
pub use config::{ClientConfig, ProviderConfig, ServiceConfig, DEFAULT_EAGER_LIMIT};
pub use error::{Error, ErrorKind, Result};
pub use ident::{RegionId, TargetId};
pub use metrics::{Counter, LabeledCounter, MetricsSnapshot, ProviderMetrics};
pub use migration::{MigrationCoordinator, MigrationPeer, PeerConnector, TargetChunk, TargetReceiver};
pub use provider::{Provider, TargetManager};
pub use service::Service;
pub use store::{make_pool, RegionStore};
pub use transfer::{BulkAccess, BulkRef, ExposedBuffer, TransferPath};
pub use types::{Endpoint, ProviderId, RegionInfo, TargetInfo};
