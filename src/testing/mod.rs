//! Testing utilities for the storage service.
//!
//! [`FailpointRegistry`] injects failures into the region store so rollback
//! paths can be exercised from tests. The integration suites in this module
//! start real services on loopback ports and talk to them through
//! [`crate::client::ProviderHandle`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use silo::config::ProviderConfig;
//! use silo::testing::{FailpointAction, FailpointRegistry};
//! use std::sync::Arc;
//!
//! let failpoints = Arc::new(FailpointRegistry::new());
//! let config = ProviderConfig::default().with_failpoints(failpoints.clone());
//!
//! failpoints.enable("region_store::write", FailpointAction::OnceError);
//! // the next write on any target of this provider fails
//! ```

pub mod failpoint;

#[cfg(test)]
mod utils;

#[cfg(test)]
mod provider_integration_tests;


pub use failpoint::{FailpointAction, FailpointRegistry};
