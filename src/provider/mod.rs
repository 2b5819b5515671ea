//! Server-side providers.
//!
//! A [`Provider`] owns a [`TargetManager`] and executes [`Operation`]s
//! addressed to it. Region work runs on the blocking thread pool; bulk
//! payloads are pulled from or pushed to the caller's exposed buffers before
//! or after the store is touched, so a slow transfer never holds a region lock.

mod targets;

pub use targets::TargetManager;

use crate::client::Client;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::ident::{RegionId, TargetId};
use crate::metrics::{MetricsSnapshot, ProviderMetrics};
use crate::migration::{MigrationCoordinator, PeerConnector, TargetReceiver};
use crate::network::rpc::{Operation, Payload, ReadSink, Reply};
use crate::transfer::{bulk, TransferPath};
use crate::types::{ProviderId, RegionInfo, TargetInfo};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Run blocking store work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

/// One provider: a set of targets and the operations on them.
pub struct Provider {
    id: ProviderId,
    config: ProviderConfig,
    targets: Arc<TargetManager>,
    receiver: Arc<TargetReceiver>,
    migration: MigrationCoordinator,
    client: Client,
    metrics: Arc<ProviderMetrics>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("targets", &self.targets)
            .field("receiver", &self.receiver)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Create a provider. `client` is used for bulk transfers and migrations.
    pub fn new(id: ProviderId, config: ProviderConfig, client: Client) -> Self {
        let connector: Arc<dyn PeerConnector> = Arc::new(client.clone());
        Self::with_connector(id, config, client, connector)
    }

    /// Create a provider whose migrations reach peers through `connector`.
    pub fn with_connector(
        id: ProviderId,
        config: ProviderConfig,
        client: Client,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let metrics = Arc::new(ProviderMetrics::new());
        let migration = MigrationCoordinator::new(connector, config.target_chunk_size, metrics.clone());
        Self {
            id,
            targets: Arc::new(TargetManager::new(config.clone())),
            receiver: Arc::new(
                TargetReceiver::new()
                    .with_pool_mode(config.pool_mode)
                    .with_idle_timeout(config.transfer_idle_timeout),
            ),
            migration,
            client,
            metrics,
            config,
        }
    }

    /// This provider's id.
    pub fn id(&self) -> ProviderId {
        self.id
    }

    /// This provider's configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The target manager.
    pub fn targets(&self) -> &Arc<TargetManager> {
        &self.targets
    }

    /// Current metric values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Format a pool at `path` and attach it.
    pub fn create_target(&self, path: impl AsRef<Path>, capacity: u64) -> Result<TargetId> {
        self.targets.create_target(path, capacity)
    }

    /// Attach an existing pool.
    pub fn attach_target(&self, path: impl AsRef<Path>) -> Result<TargetId> {
        self.targets.attach_target(path)
    }

    /// Detach a target without deleting its pool file.
    pub fn detach_target(&self, id: &TargetId) -> Result<()> {
        self.targets.detach_target(id).map(|_| ())
    }

    /// Detach every target.
    pub fn detach_all_targets(&self) -> Result<()> {
        self.targets.detach_all_targets()
    }

    /// Number of attached targets.
    pub fn count_targets(&self) -> usize {
        self.targets.count_targets()
    }

    /// Ids of attached targets.
    pub fn list_targets(&self) -> Vec<TargetId> {
        self.targets.list_targets()
    }

    /// Summary of one target.
    pub fn target_info(&self, id: &TargetId) -> Result<TargetInfo> {
        self.targets.target_info(id)
    }

    /// Live regions of a target.
    pub fn list_regions(&self, target: &TargetId) -> Result<Vec<RegionInfo>> {
        Ok(self.targets.get(target)?.list_regions())
    }

    /// Execute one operation and record it.
    pub async fn handle(&self, op: Operation) -> Result<Reply> {
        let name = op.name();
        let result = self.dispatch(op).await;
        self.metrics
            .record_operation(name, result.as_ref().err().map(Error::kind));
        if let Err(e) = &result {
            debug!(provider_id = self.id, op = name, error = %e, "Operation failed");
        }
        result
    }

    async fn dispatch(&self, op: Operation) -> Result<Reply> {
        match op {
            Operation::Probe { max_targets } => {
                let max = usize::try_from(max_targets).unwrap_or(usize::MAX);
                let ids = self.targets.list_targets().into_iter().take(max).collect();
                Ok(Reply::Targets(ids))
            }
            Operation::Create { target, capacity } => {
                let store = self.targets.get(&target)?;
                let id = blocking(move || store.create(capacity)).await?;
                Ok(Reply::Region(id))
            }
            Operation::Write {
                target,
                region,
                offset,
                payload,
            } => {
                let store = self.targets.get(&target)?;
                let data = self.fetch(payload).await?;
                blocking(move || store.write(&region, offset, &data)).await?;
                Ok(Reply::Done)
            }
            Operation::Persist {
                target,
                region,
                offset,
                size,
            } => {
                let store = self.targets.get(&target)?;
                blocking(move || store.persist(&region, offset, size)).await?;
                Ok(Reply::Done)
            }
            Operation::CreateWritePersist {
                target,
                capacity,
                payload,
            } => {
                let store = self.targets.get(&target)?;
                let data = self.fetch(payload).await?;
                let id = blocking(move || store.create_write_persist(capacity, &data)).await?;
                Ok(Reply::Region(id))
            }
            Operation::GetSize { target, region } => {
                let store = self.targets.get(&target)?;
                let size = blocking(move || store.get_size(&region)).await?;
                Ok(Reply::Size(size))
            }
            Operation::Read {
                target,
                region,
                offset,
                size,
                sink,
            } => {
                let store = self.targets.get(&target)?;
                let data = blocking(move || store.read(&region, offset, size)).await?;
                self.deliver(data, sink).await
            }
            Operation::Remove { target, region } => {
                let store = self.targets.get(&target)?;
                blocking(move || store.remove(&region)).await?;
                Ok(Reply::Done)
            }
            Operation::MigrateRegion {
                target,
                region,
                dest,
                dest_provider,
                dest_target,
                remove_source,
            } => {
                let store = self.targets.get(&target)?;
                let id = self
                    .migration
                    .migrate_region(store, region, dest, dest_provider, dest_target, remove_source)
                    .await?;
                Ok(Reply::Region(id))
            }
            Operation::MigrateTarget {
                target,
                dest,
                dest_provider,
                dest_root,
                remove_source,
            } => {
                let id = self
                    .migration
                    .migrate_target(&self.targets, target, dest, dest_provider, dest_root, remove_source)
                    .await?;
                Ok(Reply::Target(id))
            }
            Operation::TargetChunk(chunk) => {
                let receiver = self.receiver.clone();
                let targets = self.targets.clone();
                match blocking(move || receiver.receive(chunk, &targets)).await? {
                    Some(id) => Ok(Reply::Target(id)),
                    None => Ok(Reply::Done),
                }
            }
            Operation::AbortTargetTransfer { transfer_id } => {
                self.receiver.abort(transfer_id);
                Ok(Reply::Done)
            }
        }
    }

    /// Materialize a write payload.
    async fn fetch(&self, payload: Payload) -> Result<Vec<u8>> {
        match payload {
            Payload::Inline(data) => {
                self.metrics.record_transfer(TransferPath::Eager, data.len() as u64);
                Ok(data)
            }
            Payload::Bulk(bulk_ref) => {
                let pool = self.client.connection(bulk_ref.origin);
                let data = bulk::pull(&pool, &bulk_ref, self.config.bulk_chunk_size).await?;
                self.metrics.record_transfer(TransferPath::Bulk, data.len() as u64);
                debug!(provider_id = self.id, origin = %bulk_ref.origin, bytes = data.len(), path = %TransferPath::Bulk, "Payload pulled");
                Ok(data)
            }
        }
    }

    /// Return read bytes inline or push them to the caller's buffer.
    async fn deliver(&self, data: Vec<u8>, sink: ReadSink) -> Result<Reply> {
        match sink {
            ReadSink::Inline => {
                self.metrics.record_transfer(TransferPath::Eager, data.len() as u64);
                Ok(Reply::Data(data))
            }
            ReadSink::Bulk(bulk_ref) => {
                let pool = self.client.connection(bulk_ref.origin);
                bulk::push(&pool, &bulk_ref, &data, self.config.bulk_chunk_size).await?;
                self.metrics.record_transfer(TransferPath::Bulk, data.len() as u64);
                Ok(Reply::BytesRead(data.len() as u64))
            }
        }
    }
}

/// Region id of a reply, for callers that expect one.
pub(crate) fn expect_region(reply: Reply) -> Result<RegionId> {
    match reply {
        Reply::Region(id) => Ok(id),
        other => Err(other.unexpected("Region")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    async fn provider(config: ProviderConfig) -> Provider {
        let client = Client::new(ClientConfig::default()).await.unwrap();
        Provider::new(1, config, client)
    }

    #[tokio::test]
    async fn test_probe_truncates() {
        let dir = tempdir().unwrap();
        let provider = provider(ProviderConfig::default()).await;
        for i in 0..5 {
            provider
                .create_target(dir.path().join(format!("{i}")), 1024)
                .unwrap();
        }

        match provider.handle(Operation::Probe { max_targets: 3 }).await.unwrap() {
            Reply::Targets(ids) => assert_eq!(ids.len(), 3),
            other => panic!("unexpected reply {other:?}"),
        }
        match provider.handle(Operation::Probe { max_targets: 32 }).await.unwrap() {
            Reply::Targets(ids) => assert_eq!(ids.len(), 5),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inline_operations() {
        let dir = tempdir().unwrap();
        let provider = provider(ProviderConfig::default()).await;
        let target = provider.create_target(dir.path().join("t"), 1024).unwrap();

        let region = expect_region(
            provider
                .handle(Operation::Create {
                    target,
                    capacity: 32,
                })
                .await
                .unwrap(),
        )
        .unwrap();

        provider
            .handle(Operation::Write {
                target,
                region: region.clone(),
                offset: 0,
                payload: Payload::Inline(vec![5u8; 32]),
            })
            .await
            .unwrap();
        provider
            .handle(Operation::Persist {
                target,
                region: region.clone(),
                offset: 0,
                size: 32,
            })
            .await
            .unwrap();

        let reply = provider
            .handle(Operation::Read {
                target,
                region: region.clone(),
                offset: 4,
                size: 8,
                sink: ReadSink::Inline,
            })
            .await
            .unwrap();
        assert_eq!(reply, Reply::Data(vec![5u8; 8]));

        let snapshot = provider.metrics();
        assert_eq!(snapshot.operation_count("write"), 1);
        assert_eq!(snapshot.eager_bytes, 40);
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let provider = provider(ProviderConfig::default()).await;
        let err = provider
            .handle(Operation::Create {
                target: TargetId::generate(),
                capacity: 8,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(provider.metrics().total_failures(), 1);
    }

    #[tokio::test]
    async fn test_get_size_without_tracking() {
        let dir = tempdir().unwrap();
        let provider = provider(ProviderConfig::default().with_size_tracking(false)).await;
        let target = provider.create_target(dir.path().join("t"), 1024).unwrap();
        let region = expect_region(
            provider
                .handle(Operation::Create {
                    target,
                    capacity: 8,
                })
                .await
                .unwrap(),
        )
        .unwrap();

        let err = provider
            .handle(Operation::GetSize { target, region })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
