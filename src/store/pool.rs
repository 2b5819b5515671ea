//! Stateless helpers for creating and opening backing pool files.

use crate::error::{Error, FormatError, Result};
use crate::ident::TargetId;
use crate::store::format::{PoolHeader, POOL_HEADER_SIZE};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default permission bits for new pool files.
pub const DEFAULT_POOL_MODE: u32 = 0o664;

/// An open pool file and its parsed header.
#[derive(Debug)]
pub struct PoolFile {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) header: PoolHeader,
}

impl PoolFile {
    /// Path of the pool file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed pool header.
    pub fn header(&self) -> &PoolHeader {
        &self.header
    }
}

/// Create and format a new pool file of `capacity` data bytes.
///
/// Fails with `AlreadyExists` when `path` is occupied. The file is created
/// sparse and synced before returning.
pub fn make_pool(path: impl AsRef<Path>, capacity: u64, mode: u32) -> Result<TargetId> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.display().to_string()),
            _ => Error::Io(e),
        })?;

    let header = PoolHeader::new(TargetId::generate(), capacity);
    let formatted = file
        .set_len(header.file_len())
        .and_then(|_| file.write_all_at(&header.to_bytes(), 0))
        .and_then(|_| file.sync_all());

    if let Err(e) = formatted {
        // Don't leave a half-formatted pool behind.
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(Error::Io(e));
    }

    info!(
        path = %path.display(),
        capacity,
        target_id = %header.target_id,
        "Pool created"
    );

    Ok(header.target_id)
}

/// Open an existing pool file and validate its header.
///
/// Fails with `NotFound` when the file is absent and `InvalidFormat` when the
/// header is corrupt or the file is shorter than the header claims.
pub fn open_pool(path: impl AsRef<Path>) -> Result<PoolFile> {
    let path = path.as_ref();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::PoolNotFound(path.to_path_buf()),
            _ => Error::Io(e),
        })?;

    let len = file.metadata()?.len();
    if len < POOL_HEADER_SIZE as u64 {
        return Err(FormatError::Truncated {
            expected: POOL_HEADER_SIZE as u64,
            actual: len,
        }
        .into());
    }

    let mut buf = [0u8; POOL_HEADER_SIZE];
    file.read_exact_at(&mut buf, 0)?;
    let header = PoolHeader::from_bytes(&buf)?;

    if len < header.file_len() {
        return Err(FormatError::Truncated {
            expected: header.file_len(),
            actual: len,
        }
        .into());
    }

    debug!(path = %path.display(), target_id = %header.target_id, "Pool opened");

    Ok(PoolFile {
        file,
        path: path.to_path_buf(),
        header,
    })
}
