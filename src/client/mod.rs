//! Client side: bulk buffer exposure and provider handles.
//!
//! A [`Client`] runs a small listener that serves its exposed buffers to
//! providers on the bulk path, and keeps one [`ConnectionPool`] per remote
//! endpoint. The listener stops when the last clone of the client is dropped.

mod handle;

pub use handle::ProviderHandle;

use crate::config::ClientConfig;
use crate::error::{NetworkError, Result};
use crate::migration::{MigrationPeer, PeerConnector};
use crate::network::connection::ConnectionPool;
use crate::network::rpc::Message;
use crate::network::server::NetworkServer;
use crate::transfer::{BulkAccess, BulkHandler, BulkRegistry, ExposedBuffer};
use crate::types::{Endpoint, ProviderId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

struct ClientInner {
    config: ClientConfig,
    bulk: Arc<BulkRegistry>,
    bulk_endpoint: Endpoint,
    bulk_shutdown: mpsc::Sender<()>,
    pools: DashMap<Endpoint, Arc<ConnectionPool>>,
    next_request_id: AtomicU64,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.bulk_shutdown.try_send(());
        debug!(bulk_endpoint = %self.bulk_endpoint, "Client released");
    }
}

/// Entry point for talking to services.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("bulk_endpoint", &self.inner.bulk_endpoint)
            .field("exposed", &self.inner.bulk.len())
            .finish()
    }
}

impl Client {
    /// Create a client and start its bulk listener.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let bulk = Arc::new(BulkRegistry::new());
        let (server, bulk_shutdown) = NetworkServer::bind(
            config.bulk_bind_addr,
            Arc::new(BulkHandler::new(bulk.clone())),
            config.max_message_size,
        )
        .await?;
        let bulk_endpoint = server.endpoint();
        tokio::spawn(server.run());

        info!(bulk_endpoint = %bulk_endpoint, eager_limit = config.eager_limit, "Client started");

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                bulk,
                bulk_endpoint,
                bulk_shutdown,
                pools: DashMap::new(),
                next_request_id: AtomicU64::new(1),
            }),
        })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Endpoint serving this client's exposed buffers.
    pub fn bulk_endpoint(&self) -> Endpoint {
        self.inner.bulk_endpoint
    }

    /// Resolve a `host:port` address.
    pub async fn lookup(&self, address: &str) -> Result<Endpoint> {
        Endpoint::lookup(address).await
    }

    /// Expose `data` for remote access until the returned guard is dropped.
    pub fn expose(&self, data: Vec<u8>, access: BulkAccess) -> ExposedBuffer {
        self.inner.bulk.expose(self.inner.bulk_endpoint, data, access)
    }

    /// Number of buffers currently exposed.
    pub fn exposed_count(&self) -> usize {
        self.inner.bulk.len()
    }

    /// Bind a handle to one provider of a service.
    pub fn provider_handle(&self, endpoint: Endpoint, provider_id: ProviderId) -> ProviderHandle {
        ProviderHandle::new(self.clone(), endpoint, provider_id)
    }

    /// Ask a service to shut down. Fails with `Unsupported` unless the
    /// service allows remote shutdown.
    pub async fn shutdown_service(&self, endpoint: Endpoint) -> Result<()> {
        match self.connection(endpoint).call(&Message::Shutdown).await? {
            Message::ShutdownAck(Ok(())) => {
                info!(endpoint = %endpoint, "Service shutdown requested");
                Ok(())
            }
            Message::ShutdownAck(Err(e)) => Err(e.into()),
            other => Err(NetworkError::UnexpectedMessage(format!("{other:?}")).into()),
        }
    }

    /// Connection pool for `endpoint`, created on first use.
    pub(crate) fn connection(&self, endpoint: Endpoint) -> Arc<ConnectionPool> {
        self.inner
            .pools
            .entry(endpoint)
            .or_insert_with(|| {
                let config = &self.inner.config;
                Arc::new(ConnectionPool::new(
                    endpoint,
                    config.max_idle_connections,
                    config.connect_timeout,
                    config.rpc_timeout,
                    config.max_message_size,
                ))
            })
            .clone()
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl PeerConnector for Client {
    async fn connect(&self, endpoint: Endpoint, provider_id: ProviderId) -> Result<Arc<dyn MigrationPeer>> {
        Ok(Arc::new(self.provider_handle(endpoint, provider_id)))
    }
}
