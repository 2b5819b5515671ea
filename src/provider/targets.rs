//! The set of targets attached to one provider.

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::ident::TargetId;
use crate::store::{make_pool, open_pool, RegionStore};
use crate::types::TargetInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Creates, attaches and detaches the targets of a provider.
#[derive(Debug)]
pub struct TargetManager {
    targets: RwLock<HashMap<TargetId, Arc<RegionStore>>>,
    config: ProviderConfig,
}

impl TargetManager {
    /// Create an empty manager.
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Format a new pool at `path` and attach it.
    pub fn create_target(&self, path: impl AsRef<Path>, capacity: u64) -> Result<TargetId> {
        let path = path.as_ref();
        make_pool(path, capacity, self.config.pool_mode)?;
        match self.attach_target(path) {
            Ok(id) => Ok(id),
            Err(e) => {
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }

    /// Open an existing pool and make its target available.
    pub fn attach_target(&self, path: impl AsRef<Path>) -> Result<TargetId> {
        let pool = open_pool(path)?;
        let store = RegionStore::open(pool, self.config.size_tracking)?
            .with_failpoints(self.config.failpoints.clone());
        let id = store.target_id();

        let mut targets = self.targets.write();
        if targets.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("target {id} is already attached")));
        }

        info!(
            target_id = %id,
            path = %store.path().display(),
            capacity = store.capacity(),
            regions = store.region_count(),
            "Target attached"
        );
        targets.insert(id, Arc::new(store));
        Ok(id)
    }

    /// Detach a target, flushing it first. The pool file is kept.
    ///
    /// The target is detached even if the final flush fails.
    pub fn detach_target(&self, id: &TargetId) -> Result<Arc<RegionStore>> {
        let store = self
            .targets
            .write()
            .remove(id)
            .ok_or(Error::TargetNotFound(*id))?;

        store.sync()?;
        info!(target_id = %id, path = %store.path().display(), "Target detached");
        Ok(store)
    }

    /// Detach every target, reporting all flush failures together.
    pub fn detach_all_targets(&self) -> Result<()> {
        let drained: Vec<(TargetId, Arc<RegionStore>)> = self.targets.write().drain().collect();
        let count = drained.len();

        let failures: Vec<(TargetId, Error)> = drained
            .into_iter()
            .filter_map(|(id, store)| match store.sync() {
                Ok(()) => None,
                Err(e) => {
                    warn!(target_id = %id, error = %e, "Flush on detach failed");
                    Some((id, e))
                }
            })
            .collect();

        info!(count, failed = failures.len(), "All targets detached");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::DetachFailed(failures))
        }
    }

    /// Number of attached targets.
    pub fn count_targets(&self) -> usize {
        self.targets.read().len()
    }

    /// Ids of all attached targets, sorted.
    pub fn list_targets(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self.targets.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// The region store of an attached target.
    pub fn get(&self, id: &TargetId) -> Result<Arc<RegionStore>> {
        self.targets
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::TargetNotFound(*id))
    }

    /// Summary of an attached target.
    pub fn target_info(&self, id: &TargetId) -> Result<TargetInfo> {
        let store = self.get(id)?;
        Ok(TargetInfo {
            id: *id,
            path: store.path().to_path_buf(),
            capacity: store.capacity(),
            free_bytes: store.free_bytes(),
            region_count: store.region_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::failpoint::{FailpointAction, FailpointRegistry};
    use tempfile::tempdir;

    #[test]
    fn test_create_attach_detach() {
        let dir = tempdir().unwrap();
        let manager = TargetManager::new(ProviderConfig::default());
        let path = dir.path().join("a.pool");

        let id = manager.create_target(&path, 4096).unwrap();
        assert_eq!(manager.count_targets(), 1);
        assert_eq!(manager.list_targets(), vec![id]);

        let store = manager.get(&id).unwrap();
        let rid = store.create_write_persist(16, b"kept").unwrap();

        manager.detach_target(&id).unwrap();
        assert_eq!(manager.count_targets(), 0);
        assert_eq!(manager.get(&id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(path.exists());

        // Same id after reattach, regions intact.
        assert_eq!(manager.attach_target(&path).unwrap(), id);
        assert_eq!(manager.get(&id).unwrap().read(&rid, 0, 4).unwrap(), b"kept");
    }

    #[test]
    fn test_create_on_occupied_path() {
        let dir = tempdir().unwrap();
        let manager = TargetManager::new(ProviderConfig::default());
        let path = dir.path().join("a.pool");
        std::fs::write(&path, b"occupied").unwrap();

        let err = manager.create_target(&path, 4096).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"occupied");
    }

    #[test]
    fn test_attach_errors() {
        let dir = tempdir().unwrap();
        let manager = TargetManager::new(ProviderConfig::default());

        let err = manager.attach_target(dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let corrupt = dir.path().join("corrupt");
        std::fs::write(&corrupt, vec![0u8; 8192]).unwrap();
        let err = manager.attach_target(&corrupt).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);

        let path = dir.path().join("a.pool");
        manager.create_target(&path, 1024).unwrap();
        let err = manager.attach_target(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(manager.count_targets(), 1);
    }

    #[test]
    fn test_detach_unknown() {
        let manager = TargetManager::new(ProviderConfig::default());
        let err = manager.detach_target(&TargetId::generate()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_detach_all() {
        let dir = tempdir().unwrap();
        let manager = TargetManager::new(ProviderConfig::default());
        for i in 0..5 {
            manager
                .create_target(dir.path().join(format!("{i}.pool")), 1024)
                .unwrap();
        }
        assert_eq!(manager.count_targets(), 5);

        manager.detach_all_targets().unwrap();
        assert_eq!(manager.count_targets(), 0);
        assert!(manager.list_targets().is_empty());

        // Nothing left to detach is not an error.
        manager.detach_all_targets().unwrap();
    }

    #[test]
    fn test_detach_all_reports_every_failed_flush() {
        let dir = tempdir().unwrap();
        let failpoints = Arc::new(FailpointRegistry::new());
        let manager = TargetManager::new(ProviderConfig::default().with_failpoints(failpoints.clone()));
        let ids: Vec<TargetId> = (0..4)
            .map(|i| {
                manager
                    .create_target(dir.path().join(format!("{i}.pool")), 1024)
                    .unwrap()
            })
            .collect();

        let mut failing = vec![ids[1], ids[3]];
        failing.sort();
        for id in &failing {
            failpoints.enable(&format!("region_store::sync:{id}"), FailpointAction::Error);
        }

        let err = manager.detach_all_targets().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        match err {
            Error::DetachFailed(failures) => {
                let mut reported: Vec<TargetId> = failures.iter().map(|(id, _)| *id).collect();
                reported.sort();
                assert_eq!(reported, failing);
                assert!(failures.iter().all(|(_, e)| e.kind() == ErrorKind::IoFailure));
            }
            other => panic!("expected DetachFailed, got {other:?}"),
        }

        // Failed flushes still detach.
        assert_eq!(manager.count_targets(), 0);
        failpoints.disable_all();
        for i in 0..4 {
            manager.attach_target(dir.path().join(format!("{i}.pool"))).unwrap();
        }
        assert_eq!(manager.count_targets(), 4);
    }

    #[test]
    fn test_target_info() {
        let dir = tempdir().unwrap();
        let manager = TargetManager::new(ProviderConfig::default());
        let id = manager.create_target(dir.path().join("t"), 1024).unwrap();
        manager.get(&id).unwrap().create(16).unwrap();

        let info = manager.target_info(&id).unwrap();
        assert_eq!(info.capacity, 1024);
        assert_eq!(info.region_count, 1);
        assert_eq!(info.free_bytes, 1024 - 64);
    }
}
