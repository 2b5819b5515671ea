//! Backing pool file format.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ POOL HEADER (64 bytes, offset 0)                │
//! │   MAGIC: [u8; 4] = "SILO"                       │
//! │   VERSION: u32                                  │
//! │   FLAGS: u32 (reserved)                         │
//! │   HEADER_CRC: u32 (over the 64 bytes, field=0)  │
//! │   TARGET_ID: [u8; 16]                           │
//! │   CAPACITY: u64 (size of the data area)         │
//! │   HIGH_WATER: u64 (end of the last extent)      │
//! │   CREATED: u64 (unix seconds)                   │
//! │   RESERVED: [u8; 8]                             │
//! ├─────────────────────────────────────────────────┤
//! │ padding up to DATA_OFFSET (4096)                │
//! ├─────────────────────────────────────────────────┤
//! │ DATA AREA (CAPACITY bytes)                      │
//! │ ┌─────────────────────────────────────────────┐ │
//! │ │ Extent 1:                                   │ │
//! │ │  EXTENT HEADER (48 bytes)                   │ │
//! │ │   MAGIC: [u8; 4] = "SRGN"                   │ │
//! │ │   STATE: u32 (1=live, 2=free)               │ │
//! │ │   SEQUENCE: u64                             │ │
//! │ │   EXTENT_LEN: u64 (header + body, aligned)  │ │
//! │ │   CAPACITY: u64 (usable region bytes)       │ │
//! │ │   PERSISTED_SIZE: u64                       │ │
//! │ │   CRC: u32 (over bytes 0..40)               │ │
//! │ │   RESERVED: [u8; 4]                         │ │
//! │ │  REGION BYTES                               │ │
//! │ ├─────────────────────────────────────────────┤ │
//! │ │ Extent 2: ...                               │ │
//! │ └─────────────────────────────────────────────┘ │
//! │ unused space after HIGH_WATER                   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Extents tile `[0, HIGH_WATER)` of the data
//! area without gaps, so the full region table is recovered by walking them.

use crate::error::FormatError;
use crate::ident::TargetId;
use crc::{Crc, CRC_32_ISCSI};
use std::time::{SystemTime, UNIX_EPOCH};

/// CRC-32 calculator (iSCSI polynomial)
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Magic number for pool files.
pub const POOL_MAGIC: [u8; 4] = *b"SILO";

/// Current pool format version.
pub const POOL_VERSION: u32 = 1;

/// Pool header size in bytes.
pub const POOL_HEADER_SIZE: usize = 64;

/// File offset where the data area begins.
pub const DATA_OFFSET: u64 = 4096;

/// Magic number for extent headers.
pub const EXTENT_MAGIC: [u8; 4] = *b"SRGN";

/// Extent header size in bytes.
pub const EXTENT_HEADER_SIZE: u64 = 48;

/// Extents start and end on this alignment.
pub const EXTENT_ALIGN: u64 = 8;

/// Compute the CRC-32 of a byte slice.
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Start a streaming CRC-32 digest.
pub fn digest() -> crc::Digest<'static, u32> {
    CRC32.digest()
}

/// Extent length needed for a region of `capacity` bytes, or `None` on overflow.
pub fn extent_len_for(capacity: u64) -> Option<u64> {
    let raw = capacity.checked_add(EXTENT_HEADER_SIZE)?;
    raw.checked_add(EXTENT_ALIGN - 1)
        .map(|v| v & !(EXTENT_ALIGN - 1))
}

/// Pool file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHeader {
    /// Format version.
    pub version: u32,

    /// Reserved flags.
    pub flags: u32,

    /// Id of the target stored in this pool.
    pub target_id: TargetId,

    /// Size of the data area in bytes.
    pub capacity: u64,

    /// End of the last extent, relative to the data area.
    pub high_water: u64,

    /// Unix timestamp when the pool was created.
    pub created: u64,
}

impl PoolHeader {
    /// Create a header for a fresh pool.
    pub fn new(target_id: TargetId, capacity: u64) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            version: POOL_VERSION,
            flags: 0,
            target_id,
            capacity,
            high_water: 0,
            created,
        }
    }

    /// Total file length implied by this header.
    pub fn file_len(&self) -> u64 {
        DATA_OFFSET.saturating_add(self.capacity)
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; POOL_HEADER_SIZE] {
        let mut buf = [0u8; POOL_HEADER_SIZE];

        buf[0..4].copy_from_slice(&POOL_MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        // CRC (12-15) filled in last
        buf[16..32].copy_from_slice(self.target_id.as_bytes());
        buf[32..40].copy_from_slice(&self.capacity.to_le_bytes());
        buf[40..48].copy_from_slice(&self.high_water.to_le_bytes());
        buf[48..56].copy_from_slice(&self.created.to_le_bytes());

        let crc = checksum(&buf);
        buf[12..16].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < POOL_HEADER_SIZE {
            return Err(FormatError::Corrupt("pool header too short".into()));
        }

        if buf[0..4] != POOL_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = read_u32(buf, 4);
        if version > POOL_VERSION || version == 0 {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let stored_crc = read_u32(buf, 12);
        let mut zeroed = [0u8; POOL_HEADER_SIZE];
        zeroed.copy_from_slice(&buf[..POOL_HEADER_SIZE]);
        zeroed[12..16].fill(0);
        let computed_crc = checksum(&zeroed);
        if stored_crc != computed_crc {
            return Err(FormatError::ChecksumMismatch {
                offset: 0,
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[16..32]);

        let header = Self {
            version,
            flags: read_u32(buf, 8),
            target_id: TargetId::from_bytes(id),
            capacity: read_u64(buf, 32),
            high_water: read_u64(buf, 40),
            created: read_u64(buf, 48),
        };

        if header.high_water > header.capacity {
            return Err(FormatError::Corrupt(format!(
                "high water {} beyond capacity {}",
                header.high_water, header.capacity
            )));
        }

        Ok(header)
    }
}

/// Whether an extent holds a live region or free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    Live,
    Free,
}

impl ExtentState {
    fn to_u32(self) -> u32 {
        match self {
            ExtentState::Live => 1,
            ExtentState::Free => 2,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ExtentState::Live),
            2 => Some(ExtentState::Free),
            _ => None,
        }
    }
}

/// Header at the start of every extent in the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHeader {
    pub state: ExtentState,
    pub sequence: u64,
    pub extent_len: u64,
    pub capacity: u64,
    pub persisted_size: u64,
}

impl ExtentHeader {
    /// Header for a live region.
    pub fn live(sequence: u64, extent_len: u64, capacity: u64) -> Self {
        Self {
            state: ExtentState::Live,
            sequence,
            extent_len,
            capacity,
            persisted_size: 0,
        }
    }

    /// Header for a free extent.
    ///
    /// The sequence is kept so attach can recover the highest one issued.
    pub fn free(sequence: u64, extent_len: u64) -> Self {
        Self {
            state: ExtentState::Free,
            sequence,
            extent_len,
            capacity: 0,
            persisted_size: 0,
        }
    }

    /// Serialize the extent header.
    pub fn to_bytes(&self) -> [u8; EXTENT_HEADER_SIZE as usize] {
        let mut buf = [0u8; EXTENT_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&EXTENT_MAGIC);
        buf[4..8].copy_from_slice(&self.state.to_u32().to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..24].copy_from_slice(&self.extent_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.capacity.to_le_bytes());
        buf[32..40].copy_from_slice(&self.persisted_size.to_le_bytes());
        let crc = checksum(&buf[0..40]);
        buf[40..44].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse an extent header read from data-area offset `at`.
    pub fn from_bytes(buf: &[u8], at: u64) -> Result<Self, FormatError> {
        if buf.len() < EXTENT_HEADER_SIZE as usize {
            return Err(FormatError::Corrupt(format!("extent header at {at} too short")));
        }
        if buf[0..4] != EXTENT_MAGIC {
            return Err(FormatError::Corrupt(format!("bad extent magic at {at}")));
        }

        let stored_crc = read_u32(buf, 40);
        let computed_crc = checksum(&buf[0..40]);
        if stored_crc != computed_crc {
            return Err(FormatError::ChecksumMismatch {
                offset: DATA_OFFSET + at,
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let state = ExtentState::from_u32(read_u32(buf, 4))
            .ok_or_else(|| FormatError::Corrupt(format!("bad extent state at {at}")))?;

        let header = Self {
            state,
            sequence: read_u64(buf, 8),
            extent_len: read_u64(buf, 16),
            capacity: read_u64(buf, 24),
            persisted_size: read_u64(buf, 32),
        };

        let fits = extent_len_for(header.capacity).is_some_and(|need| need <= header.extent_len);
        if header.extent_len < EXTENT_HEADER_SIZE
            || header.extent_len % EXTENT_ALIGN != 0
            || (header.state == ExtentState::Live && !fits)
            || header.persisted_size > header.capacity
        {
            return Err(FormatError::Corrupt(format!(
                "inconsistent extent at {at}: {header:?}"
            )));
        }

        Ok(header)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_header_roundtrip() {
        let mut header = PoolHeader::new(TargetId::generate(), 1 << 20);
        header.high_water = 4096;

        let bytes = header.to_bytes();
        let parsed = PoolHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.file_len(), DATA_OFFSET + (1 << 20));
    }

    #[test]
    fn test_pool_header_rejects_corruption() {
        let header = PoolHeader::new(TargetId::generate(), 1024);
        let mut bytes = header.to_bytes();
        bytes[0] = b'X';
        assert!(matches!(PoolHeader::from_bytes(&bytes), Err(FormatError::InvalidMagic)));

        let mut bytes = header.to_bytes();
        bytes[33] ^= 0xff;
        assert!(matches!(
            PoolHeader::from_bytes(&bytes),
            Err(FormatError::ChecksumMismatch { .. })
        ));

        let mut bytes = header.to_bytes();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            PoolHeader::from_bytes(&bytes),
            Err(FormatError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_extent_header_roundtrip() {
        let mut header = ExtentHeader::live(7, extent_len_for(100).unwrap(), 100);
        header.persisted_size = 64;
        let parsed = ExtentHeader::from_bytes(&header.to_bytes(), 0).unwrap();
        assert_eq!(parsed, header);

        let free = ExtentHeader::free(3, 256);
        assert_eq!(ExtentHeader::from_bytes(&free.to_bytes(), 512).unwrap(), free);
    }

    #[test]
    fn test_extent_header_detects_bit_flip() {
        let header = ExtentHeader::live(1, 64, 16);
        let mut bytes = header.to_bytes();
        bytes[20] ^= 1;
        assert!(ExtentHeader::from_bytes(&bytes, 0).is_err());
    }

    #[test]
    fn test_extent_len_alignment() {
        assert_eq!(extent_len_for(0), Some(EXTENT_HEADER_SIZE));
        assert_eq!(extent_len_for(1), Some(EXTENT_HEADER_SIZE + 8));
        assert_eq!(extent_len_for(32), Some(EXTENT_HEADER_SIZE + 32));
        assert_eq!(extent_len_for(u64::MAX), None);
    }
}
