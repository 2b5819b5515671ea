use crate::client::{Client, ProviderHandle};
use crate::config::{ClientConfig, ProviderConfig, ServiceConfig};
use crate::ident::TargetId;
use crate::provider::Provider;
use crate::service::Service;
use crate::types::ProviderId;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A service on a loopback port with one provider and a scratch directory.
pub(crate) struct TestNode {
    pub service: Service,
    pub provider: Arc<Provider>,
    pub dir: TempDir,
}

impl TestNode {
    pub(crate) async fn start(provider_id: ProviderId) -> Self {
        Self::start_with(ServiceConfig::default(), provider_id, ProviderConfig::default()).await
    }

    pub(crate) async fn start_with(
        config: ServiceConfig,
        provider_id: ProviderId,
        provider_config: ProviderConfig,
    ) -> Self {
        init_tracing();
        let service = Service::start(config).await.unwrap();
        let provider = service.add_provider(provider_id, provider_config).unwrap();
        Self {
            service,
            provider,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Path for a pool file inside the scratch directory.
    pub(crate) fn pool_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Create and attach a target of `capacity` bytes.
    pub(crate) fn add_target(&self, name: &str, capacity: u64) -> TargetId {
        self.provider
            .create_target(self.pool_path(name), capacity)
            .unwrap()
    }

    /// Handle to this node's provider from `client`.
    pub(crate) fn handle(&self, client: &Client) -> ProviderHandle {
        client.provider_handle(self.service.endpoint(), self.provider.id())
    }
}

/// A client with the given eager limit.
pub(crate) async fn test_client(eager_limit: u64) -> Client {
    Client::new(ClientConfig::default().with_eager_limit(eager_limit))
        .await
        .unwrap()
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
