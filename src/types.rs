//! Core types used throughout the storage service.

use crate::error::{NetworkError, Result};
use crate::ident::{RegionId, TargetId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Identifier distinguishing providers hosted by one service.
pub type ProviderId = u16;

/// Network address of a service or of a client's bulk listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Wrap a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Resolve a `host:port` string to an endpoint.
    ///
    /// The first resolved address wins.
    pub async fn lookup(address: &str) -> Result<Self> {
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }

        let mut addrs = tokio::net::lookup_host(address).await.map_err(|e| {
            NetworkError::ConnectionFailed {
                addr: address.to_string(),
                reason: e.to_string(),
            }
        })?;

        addrs.next().map(Self).ok_or_else(|| {
            NetworkError::InvalidAddress(format!("{address} resolved to no addresses")).into()
        })
    }

    /// The underlying socket address.
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for Endpoint {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|e| NetworkError::InvalidAddress(format!("{s}: {e}")).into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Description of one live region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Region id.
    pub id: RegionId,
    /// Allocated capacity in bytes.
    pub capacity: u64,
    /// Highest persisted byte; zero when size tracking is off.
    pub persisted_size: u64,
}

/// Description of one attached target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// Target id.
    pub id: TargetId,
    /// Backing pool file.
    pub path: PathBuf,
    /// Total data capacity in bytes.
    pub capacity: u64,
    /// Bytes not currently allocated to regions.
    pub free_bytes: u64,
    /// Number of live regions.
    pub region_count: usize,
}
