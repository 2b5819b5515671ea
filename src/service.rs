//! A service hosts any number of providers behind one listener.
//!
//! Requests carry a provider id and are routed to the matching
//! [`Provider`]. The service also owns the [`Client`] its providers use for
//! bulk transfers and outbound migrations.

use crate::client::Client;
use crate::config::{ProviderConfig, ServiceConfig};
use crate::error::{Error, Result, WireError};
use crate::network::rpc::{Message, ProviderResponse};
use crate::network::server::{MessageHandler, NetworkServer};
use crate::provider::Provider;
use crate::types::{Endpoint, ProviderId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type ProviderMap = Arc<DashMap<ProviderId, Arc<Provider>>>;

/// Routes incoming requests to providers.
struct ServiceHandler {
    providers: ProviderMap,
    remote_shutdown: bool,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

#[async_trait]
impl MessageHandler for ServiceHandler {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::Request(req) => {
                let provider = self.providers.get(&req.provider_id).map(|p| p.clone());
                let result = match provider {
                    Some(provider) => provider.handle(req.op).await,
                    None => Err(Error::ProviderNotFound(req.provider_id)),
                };
                Some(Message::Response(ProviderResponse::from_result(req.request_id, &result)))
            }
            Message::Shutdown => {
                if !self.remote_shutdown {
                    let e = Error::Unsupported("remote shutdown is disabled".into());
                    return Some(Message::ShutdownAck(Err(WireError::from(&e))));
                }
                info!("Remote shutdown requested");
                if let Some(tx) = self.shutdown_tx.lock().as_ref() {
                    let _ = tx.try_send(());
                }
                Some(Message::ShutdownAck(Ok(())))
            }
            other => {
                warn!(message = ?other, "Unexpected message on service listener");
                let e = Error::Unsupported("service does not serve bulk buffers".into());
                Some(Message::BulkAck(Err(WireError::from(&e))))
            }
        }
    }
}

/// A running service.
pub struct Service {
    endpoint: Endpoint,
    config: ServiceConfig,
    providers: ProviderMap,
    client: Client,
    shutdown_tx: mpsc::Sender<()>,
    server_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Service {
    /// Bind the listener and start serving.
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        let client = Client::new(config.client.clone()).await?;
        let providers: ProviderMap = Arc::new(DashMap::new());

        let handler = Arc::new(ServiceHandler {
            providers: providers.clone(),
            remote_shutdown: config.remote_shutdown,
            shutdown_tx: Mutex::new(None),
        });
        let (server, shutdown_tx) =
            NetworkServer::bind(config.bind_addr, handler.clone(), config.max_message_size).await?;
        *handler.shutdown_tx.lock() = Some(shutdown_tx.clone());

        let endpoint = server.endpoint();
        let server_task = tokio::spawn(server.run());

        info!(endpoint = %endpoint, remote_shutdown = config.remote_shutdown, "Service started");

        Ok(Self {
            endpoint,
            config,
            providers,
            client,
            shutdown_tx,
            server_task: Mutex::new(Some(server_task)),
        })
    }

    /// Endpoint clients connect to.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The client used by this service's providers.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Register a new provider under `id`.
    pub fn add_provider(&self, id: ProviderId, config: ProviderConfig) -> Result<Arc<Provider>> {
        let provider = Arc::new(Provider::new(id, config, self.client.clone()));
        self.register(provider)
    }

    /// Register an already constructed provider.
    pub fn register(&self, provider: Arc<Provider>) -> Result<Arc<Provider>> {
        let id = provider.id();
        match self.providers.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::AlreadyExists(format!("provider {id}")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(provider.clone());
                info!(provider_id = id, endpoint = %self.endpoint, "Provider registered");
                Ok(provider)
            }
        }
    }

    /// Look up a provider.
    pub fn provider(&self, id: ProviderId) -> Result<Arc<Provider>> {
        self.providers
            .get(&id)
            .map(|p| p.clone())
            .ok_or(Error::ProviderNotFound(id))
    }

    /// Unregister a provider. Its targets stay attached to the returned value.
    pub fn remove_provider(&self, id: ProviderId) -> Result<Arc<Provider>> {
        self.providers
            .remove(&id)
            .map(|(_, p)| p)
            .ok_or(Error::ProviderNotFound(id))
    }

    /// Ids of registered providers, sorted.
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.providers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Stop accepting requests and detach every target.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.wait().await
    }

    /// Wait until the service stops, e.g. after a remote shutdown request,
    /// then detach every target.
    pub async fn wait(&self) -> Result<()> {
        let task = self.server_task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("server task failed: {e}")))??;
        }
        self.finalize()
    }

    fn finalize(&self) -> Result<()> {
        let mut failures = Vec::new();
        for entry in self.providers.iter() {
            match entry.value().detach_all_targets() {
                Ok(()) => {}
                Err(Error::DetachFailed(errors)) => failures.extend(errors),
                Err(e) => warn!(provider_id = *entry.key(), error = %e, "Detach failed"),
            }
        }
        info!(endpoint = %self.endpoint, "Service stopped");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::DetachFailed(failures))
        }
    }
}
