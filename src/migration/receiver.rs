//! Destination side of a target migration.

use crate::error::{Error, FormatError, Result};
use crate::ident::TargetId;
use crate::migration::TargetChunk;
use crate::provider::TargetManager;
use crate::store::format;
use crate::config::DEFAULT_TRANSFER_IDLE_TIMEOUT;
use crate::store::DEFAULT_POOL_MODE;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Incoming {
    file: File,
    partial_path: PathBuf,
    final_path: PathBuf,
    next_sequence: u64,
    written: u64,
    digest: crc::Digest<'static, u32>,
    last_activity: Instant,
}

/// Reassembles pool files streamed by a migrating provider.
///
/// Chunks land in `<root>/<name>.partial`. When the closing chunk arrives
/// with a matching length and checksum the file is renamed into place and
/// attached. Any failure deletes the partial file.
///
/// A transfer that sees no chunk for longer than the idle timeout is
/// discarded the next time any chunk arrives, so a source that dies mid-stream
/// does not leave an open partial file behind.
pub struct TargetReceiver {
    incoming: DashMap<Uuid, Arc<Mutex<Incoming>>>,
    pool_mode: u32,
    idle_timeout: Duration,
}

impl fmt::Debug for TargetReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetReceiver")
            .field("in_flight", &self.incoming.len())
            .field("pool_mode", &format_args!("{:o}", self.pool_mode))
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl Default for TargetReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetReceiver {
    pub fn new() -> Self {
        Self {
            incoming: DashMap::new(),
            pool_mode: DEFAULT_POOL_MODE,
            idle_timeout: DEFAULT_TRANSFER_IDLE_TIMEOUT,
        }
    }

    /// Permission bits for received pool files.
    pub fn with_pool_mode(mut self, mode: u32) -> Self {
        self.pool_mode = mode;
        self
    }

    /// Discard transfers idle for longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Number of transfers in progress.
    pub fn in_flight(&self) -> usize {
        self.incoming.len()
    }

    /// Apply one chunk. Returns the attached target id after the closing chunk.
    pub fn receive(&self, chunk: TargetChunk, targets: &TargetManager) -> Result<Option<TargetId>> {
        let transfer_id = chunk.transfer_id;
        self.reap_idle(Some(transfer_id));
        let result = self.apply(chunk, targets);
        if let Err(e) = &result {
            warn!(transfer_id = %transfer_id, error = %e, "Incoming target rejected");
            self.abort(transfer_id);
        }
        result
    }

    /// Drop a transfer and delete its partial file.
    pub fn abort(&self, transfer_id: Uuid) -> bool {
        match self.incoming.remove(&transfer_id) {
            Some((_, incoming)) => {
                let path = incoming.lock().partial_path.clone();
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "Partial file already gone");
                }
                info!(transfer_id = %transfer_id, "Incoming target discarded");
                true
            }
            None => false,
        }
    }

    /// Abort every idle transfer other than `keep`. Returns how many went.
    pub fn reap_idle(&self, keep: Option<Uuid>) -> usize {
        // A transfer whose lock is held is applying a chunk right now.
        let stale: Vec<Uuid> = self
            .incoming
            .iter()
            .filter(|e| Some(*e.key()) != keep)
            .filter(|e| {
                e.value()
                    .try_lock()
                    .is_some_and(|incoming| incoming.last_activity.elapsed() > self.idle_timeout)
            })
            .map(|e| *e.key())
            .collect();

        for transfer_id in &stale {
            warn!(transfer_id = %transfer_id, idle_timeout = ?self.idle_timeout, "Idle incoming target expired");
            self.abort(*transfer_id);
        }
        stale.len()
    }

    fn begin(&self, chunk: &TargetChunk) -> Result<()> {
        let name = plain_file_name(&chunk.file_name)?;
        std::fs::create_dir_all(&chunk.root)?;

        let final_path = chunk.root.join(name);
        if final_path.exists() {
            return Err(Error::AlreadyExists(final_path.display().to_string()));
        }
        let partial_path = chunk.root.join(format!("{name}.partial"));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.pool_mode)
            .open(&partial_path)?;

        let incoming = Incoming {
            file,
            partial_path,
            final_path,
            next_sequence: 0,
            written: 0,
            digest: format::digest(),
            last_activity: Instant::now(),
        };

        match self.incoming.entry(chunk.transfer_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AlreadyExists(format!(
                "transfer {} already started",
                chunk.transfer_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(transfer_id = %chunk.transfer_id, path = %incoming.partial_path.display(), "Incoming target started");
                slot.insert(Arc::new(Mutex::new(incoming)));
                Ok(())
            }
        }
    }

    fn apply(&self, chunk: TargetChunk, targets: &TargetManager) -> Result<Option<TargetId>> {
        if chunk.sequence == 0 {
            self.begin(&chunk)?;
        }

        let entry = self
            .incoming
            .get(&chunk.transfer_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::MigrationFailed(format!("unknown transfer {}", chunk.transfer_id)))?;
        let mut incoming = entry.lock();

        if chunk.sequence != incoming.next_sequence || chunk.offset != incoming.written {
            return Err(Error::MigrationFailed(format!(
                "chunk {} at offset {} out of order, expected {} at {}",
                chunk.sequence, chunk.offset, incoming.next_sequence, incoming.written
            )));
        }

        if !chunk.data.is_empty() {
            incoming.file.write_all_at(&chunk.data, chunk.offset)?;
            incoming.digest.update(&chunk.data);
            incoming.written += chunk.data.len() as u64;
        }
        incoming.next_sequence += 1;
        incoming.last_activity = Instant::now();

        if !chunk.is_final {
            return Ok(None);
        }

        if incoming.written != chunk.total_len {
            return Err(FormatError::Truncated {
                expected: chunk.total_len,
                actual: incoming.written,
            }
            .into());
        }
        let checksum = std::mem::replace(&mut incoming.digest, format::digest()).finalize();
        if checksum != chunk.checksum {
            return Err(FormatError::ChecksumMismatch {
                offset: 0,
                expected: chunk.checksum,
                actual: checksum,
            }
            .into());
        }

        incoming.file.sync_all()?;
        std::fs::rename(&incoming.partial_path, &incoming.final_path)?;
        let final_path = incoming.final_path.clone();
        drop(incoming);
        self.incoming.remove(&chunk.transfer_id);

        match targets.attach_target(&final_path) {
            Ok(id) => {
                info!(
                    target_id = %id,
                    path = %final_path.display(),
                    bytes = chunk.total_len,
                    "Incoming target attached"
                );
                Ok(Some(id))
            }
            Err(e) => {
                let _ = std::fs::remove_file(&final_path);
                Err(e)
            }
        }
    }
}

/// Accept only a single normal path component.
fn plain_file_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(Error::MigrationFailed(format!("invalid pool file name {name:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn chunks_of(path: &Path, root: &Path, size: usize) -> Vec<TargetChunk> {
        let bytes = std::fs::read(path).unwrap();
        let transfer_id = Uuid::new_v4();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        let mut out: Vec<TargetChunk> = bytes
            .chunks(size)
            .enumerate()
            .map(|(i, data)| TargetChunk {
                transfer_id,
                sequence: i as u64,
                file_name: name.clone(),
                root: root.to_path_buf(),
                offset: (i * size) as u64,
                data: data.to_vec(),
                is_final: false,
                total_len: bytes.len() as u64,
                checksum: 0,
            })
            .collect();
        out.push(TargetChunk {
            transfer_id,
            sequence: out.len() as u64,
            file_name: name,
            root: root.to_path_buf(),
            offset: bytes.len() as u64,
            data: Vec::new(),
            is_final: true,
            total_len: bytes.len() as u64,
            checksum: format::checksum(&bytes),
        });
        out
    }

    fn source_pool(dir: &Path) -> (PathBuf, TargetId) {
        let manager = TargetManager::new(ProviderConfig::default());
        let path = dir.join("src.pool");
        let id = manager.create_target(&path, 4096).unwrap();
        manager.detach_all_targets().unwrap();
        (path, id)
    }

    #[test]
    fn test_receive_and_attach() {
        let dir = tempdir().unwrap();
        let (path, id) = source_pool(dir.path());
        let root = dir.path().join("dest");

        let receiver = TargetReceiver::new();
        let targets = TargetManager::new(ProviderConfig::default());
        let chunks = chunks_of(&path, &root, 1500);
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let result = receiver.receive(chunk, &targets).unwrap();
            if i == last {
                assert_eq!(result, Some(id));
            } else {
                assert_eq!(result, None);
            }
        }
        assert_eq!(receiver.in_flight(), 0);
        assert_eq!(targets.list_targets(), vec![id]);
        assert!(root.join("src.pool").exists());
    }

    #[test]
    fn test_checksum_mismatch_discards_partial() {
        let dir = tempdir().unwrap();
        let (path, _) = source_pool(dir.path());
        let root = dir.path().join("dest");

        let receiver = TargetReceiver::new();
        let targets = TargetManager::new(ProviderConfig::default());
        let mut chunks = chunks_of(&path, &root, 4096);
        chunks.last_mut().unwrap().checksum ^= 1;

        let last = chunks.pop().unwrap();
        for chunk in chunks {
            receiver.receive(chunk, &targets).unwrap();
        }
        let err = receiver.receive(last, &targets).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);

        assert_eq!(receiver.in_flight(), 0);
        assert_eq!(targets.count_targets(), 0);
        assert!(!root.join("src.pool.partial").exists());
        assert!(!root.join("src.pool").exists());
    }

    #[test]
    fn test_out_of_order_chunk() {
        let dir = tempdir().unwrap();
        let (path, _) = source_pool(dir.path());
        let root = dir.path().join("dest");

        let receiver = TargetReceiver::new();
        let targets = TargetManager::new(ProviderConfig::default());
        let mut chunks = chunks_of(&path, &root, 1024).into_iter();
        receiver.receive(chunks.next().unwrap(), &targets).unwrap();
        chunks.next();

        let err = receiver.receive(chunks.next().unwrap(), &targets).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
        assert!(!root.join("src.pool.partial").exists());
    }

    #[test]
    fn test_existing_destination_refused() {
        let dir = tempdir().unwrap();
        let (path, _) = source_pool(dir.path());

        let receiver = TargetReceiver::new();
        let targets = TargetManager::new(ProviderConfig::default());
        // Destination root is the source directory itself.
        let chunk = chunks_of(&path, dir.path(), 1 << 20).remove(0);
        let err = receiver.receive(chunk, &targets).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(path.exists());
    }

    #[test]
    fn test_file_name_validation() {
        assert!(plain_file_name("pool.dat").is_ok());
        assert!(plain_file_name("../escape").is_err());
        assert!(plain_file_name("a/b").is_err());
        assert!(plain_file_name("").is_err());
        assert!(plain_file_name("/abs").is_err());
    }

    #[test]
    fn test_idle_transfer_expires() {
        let dir = tempdir().unwrap();
        let (path, id) = source_pool(dir.path());
        let stalled_root = dir.path().join("stalled");
        let live_root = dir.path().join("live");

        let receiver = TargetReceiver::new().with_idle_timeout(Duration::from_millis(20));
        let targets = TargetManager::new(ProviderConfig::default());

        // The source of this transfer goes away after its first chunk.
        let first = chunks_of(&path, &stalled_root, 1024).remove(0);
        receiver.receive(first, &targets).unwrap();
        assert_eq!(receiver.in_flight(), 1);
        assert!(stalled_root.join("src.pool.partial").exists());

        std::thread::sleep(Duration::from_millis(60));
        for chunk in chunks_of(&path, &live_root, 1024) {
            receiver.receive(chunk, &targets).unwrap();
        }

        assert_eq!(receiver.in_flight(), 0);
        assert!(!stalled_root.join("src.pool.partial").exists());
        assert_eq!(targets.list_targets(), vec![id]);
        assert_eq!(receiver.reap_idle(None), 0);
    }

    #[test]
    fn test_abort_unknown_transfer() {
        let receiver = TargetReceiver::new();
        assert!(!receiver.abort(Uuid::new_v4()));
    }
}
