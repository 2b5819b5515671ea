//! Source-side migration driver.

use crate::error::{Error, ErrorKind, Result};
use crate::ident::{RegionId, TargetId};
use crate::metrics::ProviderMetrics;
use crate::migration::{MigrationPeer, PeerConnector, TargetChunk};
use crate::provider::{blocking, TargetManager};
use crate::store::format;
use crate::store::RegionStore;
use crate::types::{Endpoint, ProviderId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Moves regions and targets from this provider to others.
pub struct MigrationCoordinator {
    connector: Arc<dyn PeerConnector>,
    chunk_size: usize,
    metrics: Arc<ProviderMetrics>,
}

impl MigrationCoordinator {
    pub fn new(connector: Arc<dyn PeerConnector>, chunk_size: usize, metrics: Arc<ProviderMetrics>) -> Self {
        Self {
            connector,
            chunk_size: chunk_size.max(1),
            metrics,
        }
    }

    async fn peer(&self, dest: Endpoint, dest_provider: ProviderId) -> Result<Arc<dyn MigrationPeer>> {
        self.connector
            .connect(dest, dest_provider)
            .await
            .map_err(|e| Error::MigrationFailed(format!("cannot reach {dest}/{dest_provider}: {e}")))
    }

    /// Copy a region to `dest_target` on another provider, then optionally
    /// remove the source.
    ///
    /// The source is removed only after the destination copy is persisted. If
    /// the destination fails at any point the source is left intact and
    /// `MigrationFailed` is returned. If the source cannot be removed, the
    /// destination copy is removed again so only the source remains.
    pub async fn migrate_region(
        &self,
        source: Arc<RegionStore>,
        region: RegionId,
        dest: Endpoint,
        dest_provider: ProviderId,
        dest_target: TargetId,
        remove_source: bool,
    ) -> Result<RegionId> {
        let start = Instant::now();
        let export = {
            let store = source.clone();
            let region = region.clone();
            blocking(move || store.export(&region)).await?
        };
        let bytes = export.data.len();

        let copied = async {
            let peer = self.peer(dest, dest_provider).await?;
            let id = peer
                .create_write_persist(dest_target, export.capacity, export.data)
                .await
                .map_err(|e| Error::MigrationFailed(format!("destination write failed: {e}")))?;
            Ok::<_, Error>((peer, id))
        }
        .await;

        let (peer, dest_region) = match copied {
            Ok(copied) => copied,
            Err(e) => {
                self.metrics.migration_failures.inc();
                warn!(
                    target_id = %source.target_id(),
                    region = %region,
                    dest = %dest,
                    error = %e,
                    "Region migration failed, source kept"
                );
                return Err(e);
            }
        };

        if remove_source {
            let store = source.clone();
            let victim = region.clone();
            match blocking(move || store.remove(&victim)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(region = %region, "Source region vanished before removal");
                }
                Err(e) => {
                    self.metrics.migration_failures.inc();
                    return Err(self.undo_copy(peer.as_ref(), dest_target, &dest_region, &region, e).await);
                }
            }
        }

        self.metrics.region_migrations.inc();
        info!(
            target_id = %source.target_id(),
            region = %region,
            dest = %dest,
            dest_target = %dest_target,
            dest_region = %dest_region,
            bytes,
            remove_source,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Region migrated"
        );
        Ok(dest_region)
    }

    /// Remove the destination copy after the source could not be removed.
    async fn undo_copy(
        &self,
        peer: &dyn MigrationPeer,
        dest_target: TargetId,
        dest_region: &RegionId,
        region: &RegionId,
        cause: Error,
    ) -> Error {
        match peer.remove(dest_target, dest_region).await {
            Ok(()) => {
                warn!(
                    region = %region,
                    dest_region = %dest_region,
                    error = %cause,
                    "Source removal failed, destination copy removed"
                );
                Error::MigrationFailed(format!("source removal failed, copy undone: {cause}"))
            }
            Err(undo) => {
                warn!(
                    region = %region,
                    dest_target = %dest_target,
                    dest_region = %dest_region,
                    error = %cause,
                    undo_error = %undo,
                    "Source removal failed and destination copy could not be removed"
                );
                Error::MigrationFailed(format!(
                    "source removal failed ({cause}); copy {dest_region} on target {dest_target} \
                     could not be removed: {undo}"
                ))
            }
        }
    }

    /// Stream a whole target to `dest_root` on another provider, then
    /// optionally detach it here and delete its pool file.
    pub async fn migrate_target(
        &self,
        targets: &TargetManager,
        target: TargetId,
        dest: Endpoint,
        dest_provider: ProviderId,
        dest_root: PathBuf,
        remove_source: bool,
    ) -> Result<TargetId> {
        let start = Instant::now();
        let store = targets.get(&target)?;
        let file_name = store
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::Internal(format!("pool path {} has no file name", store.path().display())))?;

        let peer = match self.peer(dest, dest_provider).await {
            Ok(peer) => peer,
            Err(e) => {
                self.metrics.migration_failures.inc();
                return Err(e);
            }
        };
        let transfer_id = Uuid::new_v4();

        let streamed = self
            .stream_target(&store, peer.as_ref(), transfer_id, &file_name, &dest_root)
            .await;

        let total_len = match streamed {
            Ok(len) => len,
            Err(e) => {
                self.metrics.migration_failures.inc();
                if let Err(abort) = peer.abort_target_transfer(transfer_id).await {
                    debug!(transfer_id = %transfer_id, error = %abort, "Abort not delivered");
                }
                warn!(target_id = %target, dest = %dest, error = %e, "Target migration failed, source kept");
                return Err(match e {
                    Error::MigrationFailed(_) => e,
                    other => Error::MigrationFailed(other.to_string()),
                });
            }
        };

        if remove_source {
            let path = store.path().to_path_buf();
            drop(store);
            if let Err(e) = targets.detach_target(&target) {
                warn!(target_id = %target, error = %e, "Detach after migration reported an error");
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Could not delete migrated pool file");
            }
        }

        self.metrics.target_migrations.inc();
        info!(
            target_id = %target,
            dest = %dest,
            dest_root = %dest_root.display(),
            bytes = total_len,
            remove_source,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Target migrated"
        );
        Ok(target)
    }

    /// Send the pool as ordered chunks followed by a closing chunk carrying
    /// the length and checksum. Returns the streamed length.
    async fn stream_target(
        &self,
        store: &Arc<RegionStore>,
        peer: &dyn MigrationPeer,
        transfer_id: Uuid,
        file_name: &str,
        root: &Path,
    ) -> Result<u64> {
        {
            let store = store.clone();
            blocking(move || store.sync()).await?;
        }

        let total_len = store.pool_len();
        let mut digest = format::digest();
        let mut offset = 0u64;
        let mut sequence = 0u64;

        while offset < total_len {
            let len = (total_len - offset).min(self.chunk_size as u64) as usize;
            let data = {
                let store = store.clone();
                blocking(move || store.read_pool(offset, len)).await?
            };
            digest.update(&data);

            let chunk = TargetChunk {
                transfer_id,
                sequence,
                file_name: file_name.to_owned(),
                root: root.to_path_buf(),
                offset,
                data,
                is_final: false,
                total_len,
                checksum: 0,
            };
            peer.send_target_chunk(chunk).await?;

            offset += len as u64;
            sequence += 1;
        }

        let closing = TargetChunk {
            transfer_id,
            sequence,
            file_name: file_name.to_owned(),
            root: root.to_path_buf(),
            offset,
            data: Vec::new(),
            is_final: true,
            total_len,
            checksum: digest.finalize(),
        };

        match peer.send_target_chunk(closing).await? {
            Some(id) if id == store.target_id() => Ok(total_len),
            Some(id) => Err(Error::MigrationFailed(format!(
                "destination attached {id}, expected {}",
                store.target_id()
            ))),
            None => Err(Error::MigrationFailed("destination did not attach the target".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::migration::TargetReceiver;
    use crate::testing::failpoint::{FailpointAction, FailpointRegistry};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Peer backed by a local target manager.
    struct LocalPeer {
        targets: Arc<TargetManager>,
        receiver: Arc<TargetReceiver>,
        fail_writes: bool,
        fail_after_chunks: Option<u64>,
        chunks_seen: Mutex<u64>,
        aborted: Mutex<Vec<Uuid>>,
    }

    impl LocalPeer {
        fn new(targets: Arc<TargetManager>) -> Self {
            Self {
                targets,
                receiver: Arc::new(TargetReceiver::new()),
                fail_writes: false,
                fail_after_chunks: None,
                chunks_seen: Mutex::new(0),
                aborted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MigrationPeer for LocalPeer {
        async fn create_write_persist(&self, target: TargetId, capacity: u64, data: Vec<u8>) -> Result<RegionId> {
            if self.fail_writes {
                return Err(Error::OutOfSpace {
                    requested: capacity,
                    available: 0,
                });
            }
            self.targets.get(&target)?.create_write_persist(capacity, &data)
        }

        async fn send_target_chunk(&self, chunk: TargetChunk) -> Result<Option<TargetId>> {
            {
                let mut seen = self.chunks_seen.lock();
                *seen += 1;
                if self.fail_after_chunks.is_some_and(|n| *seen > n) {
                    return Err(Error::Io(std::io::Error::other("link dropped")));
                }
            }
            self.receiver.receive(chunk, &self.targets)
        }

        async fn remove(&self, target: TargetId, region: &RegionId) -> Result<()> {
            self.targets.get(&target)?.remove(region)
        }

        async fn abort_target_transfer(&self, transfer_id: Uuid) -> Result<()> {
            self.aborted.lock().push(transfer_id);
            self.receiver.abort(transfer_id);
            Ok(())
        }
    }

    struct FixedConnector(Arc<LocalPeer>);

    #[async_trait]
    impl PeerConnector for FixedConnector {
        async fn connect(&self, _endpoint: Endpoint, _provider_id: ProviderId) -> Result<Arc<dyn MigrationPeer>> {
            Ok(self.0.clone())
        }
    }

    fn dest() -> Endpoint {
        "127.0.0.1:9".parse().unwrap()
    }

    fn coordinator(peer: Arc<LocalPeer>, chunk_size: usize) -> MigrationCoordinator {
        MigrationCoordinator::new(
            Arc::new(FixedConnector(peer)),
            chunk_size,
            Arc::new(ProviderMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_migrate_region_moves_data() {
        let dir = tempdir().unwrap();
        let src = TargetManager::new(ProviderConfig::default());
        let src_id = src.create_target(dir.path().join("src"), 4096).unwrap();
        let dst = Arc::new(TargetManager::new(ProviderConfig::default()));
        let dst_id = dst.create_target(dir.path().join("dst"), 4096).unwrap();

        let store = src.get(&src_id).unwrap();
        let rid = store.create(64).unwrap();
        store.write(&rid, 0, b"migrating").unwrap();
        store.persist(&rid, 0, 9).unwrap();

        let coordinator = coordinator(Arc::new(LocalPeer::new(dst.clone())), 1024);
        let new_rid = coordinator
            .migrate_region(store.clone(), rid.clone(), dest(), 0, dst_id, true)
            .await
            .unwrap();

        assert_eq!(dst.get(&dst_id).unwrap().read(&new_rid, 0, 9).unwrap(), b"migrating");
        assert_eq!(store.read(&rid, 0, 1).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(coordinator.metrics.region_migrations.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_destination_keeps_source() {
        let dir = tempdir().unwrap();
        let src = TargetManager::new(ProviderConfig::default());
        let src_id = src.create_target(dir.path().join("src"), 4096).unwrap();
        let dst = Arc::new(TargetManager::new(ProviderConfig::default()));
        let dst_id = dst.create_target(dir.path().join("dst"), 4096).unwrap();

        let store = src.get(&src_id).unwrap();
        let rid = store.create_write_persist(32, b"precious").unwrap();

        let mut peer = LocalPeer::new(dst.clone());
        peer.fail_writes = true;
        let coordinator = coordinator(Arc::new(peer), 1024);

        let err = coordinator
            .migrate_region(store.clone(), rid.clone(), dest(), 0, dst_id, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
        assert_eq!(store.read(&rid, 0, 8).unwrap(), b"precious");
        assert_eq!(coordinator.metrics.migration_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_source_removal_undoes_copy() {
        let dir = tempdir().unwrap();
        let failpoints = Arc::new(FailpointRegistry::new());
        let src = TargetManager::new(ProviderConfig::default().with_failpoints(failpoints.clone()));
        let src_id = src.create_target(dir.path().join("src"), 4096).unwrap();
        let dst = Arc::new(TargetManager::new(ProviderConfig::default()));
        let dst_id = dst.create_target(dir.path().join("dst"), 4096).unwrap();

        let store = src.get(&src_id).unwrap();
        let rid = store.create_write_persist(32, b"only once").unwrap();
        failpoints.enable("region_store::remove", FailpointAction::Error);

        let coordinator = coordinator(Arc::new(LocalPeer::new(dst.clone())), 1024);
        let err = coordinator
            .migrate_region(store.clone(), rid.clone(), dest(), 0, dst_id, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);

        assert_eq!(store.read(&rid, 0, 9).unwrap(), b"only once");
        assert!(dst.get(&dst_id).unwrap().list_regions().is_empty());
        assert_eq!(coordinator.metrics.migration_failures.get(), 1);
        assert_eq!(coordinator.metrics.region_migrations.get(), 0);
    }

    #[tokio::test]
    async fn test_migrate_target() {
        let dir = tempdir().unwrap();
        let dest_root = dir.path().join("remote");
        let src = TargetManager::new(ProviderConfig::default());
        let src_path = dir.path().join("t.pool");
        let tid = src.create_target(&src_path, 8192).unwrap();
        let rid = src.get(&tid).unwrap().create_write_persist(100, b"whole target").unwrap();

        let dst = Arc::new(TargetManager::new(ProviderConfig::default()));
        // Small chunks so the pool travels in several pieces.
        let coordinator = coordinator(Arc::new(LocalPeer::new(dst.clone())), 1000);

        let moved = coordinator
            .migrate_target(&src, tid, dest(), 0, dest_root.clone(), true)
            .await
            .unwrap();
        assert_eq!(moved, tid);
        assert_eq!(src.count_targets(), 0);
        assert!(!src_path.exists());

        assert_eq!(dst.get(&tid).unwrap().read(&rid, 0, 12).unwrap(), b"whole target");
        assert!(dest_root.join("t.pool").exists());
        assert!(!dest_root.join("t.pool.partial").exists());
    }

    #[tokio::test]
    async fn test_interrupted_target_migration_keeps_source() {
        let dir = tempdir().unwrap();
        let dest_root = dir.path().join("remote");
        let src = TargetManager::new(ProviderConfig::default());
        let src_path = dir.path().join("t.pool");
        let tid = src.create_target(&src_path, 8192).unwrap();

        let dst = Arc::new(TargetManager::new(ProviderConfig::default()));
        let mut peer = LocalPeer::new(dst.clone());
        peer.fail_after_chunks = Some(2);
        let peer = Arc::new(peer);
        let coordinator = coordinator(peer.clone(), 1000);

        let err = coordinator
            .migrate_target(&src, tid, dest(), 0, dest_root.clone(), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);

        assert_eq!(src.list_targets(), vec![tid]);
        assert!(src_path.exists());
        assert_eq!(dst.count_targets(), 0);
        assert_eq!(peer.aborted.lock().len(), 1);
        assert!(!dest_root.join("t.pool.partial").exists());
    }
}
