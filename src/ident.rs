//! Opaque identifiers for targets and regions, and their textual encodings.
//!
//! - [`TargetId`] is a 128-bit UUID. Its text form is the hyphenated UUID.
//! - [`RegionId`] is an opaque byte string produced by a region store. Its
//!   bytes are not guaranteed to be printable, so its text form is base64.
//!
//! Region ids are target-relative: a `RegionId` only resolves together with
//! the `TargetId` of the target that created it.
//!
//! Decoding never guesses. Anything that is not a well-formed encoding fails
//! with [`Error::MalformedIdentifier`]. Encoding an absent id yields
//! [`NONE_SENTINEL`] so partially failed results can still be printed.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Text produced when encoding an absent identifier.
pub const NONE_SENTINEL: &str = "None";

/// Length in bytes of a region id issued by [`crate::store::RegionStore`].
pub const REGION_ID_LEN: usize = 16;

/// Identifier of one storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(Uuid);

impl TargetId {
    /// Generate a fresh random target id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a target id from its raw 16 bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw 16 bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Decode the canonical text form.
    pub fn decode(s: &str) -> Result<Self> {
        // Only the 36 character hyphenated form is accepted.
        if s.len() != 36 {
            return Err(Error::MalformedIdentifier(format!(
                "target id must be 36 characters, got {}",
                s.len()
            )));
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::MalformedIdentifier(format!("target id {s:?}: {e}")))
    }

    /// Encode an optional target id, yielding [`NONE_SENTINEL`] when absent.
    pub fn encode_opt(id: Option<&TargetId>) -> String {
        id.map_or_else(|| NONE_SENTINEL.to_string(), TargetId::to_string)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TargetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

/// Identifier of one region inside a target.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(Bytes);

impl RegionId {
    /// Wrap raw region id bytes.
    ///
    /// Callers never need this: region ids come from region stores. It exists
    /// for stores and for decoding ids received over the wire.
    pub(crate) fn from_raw(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the raw id.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the raw id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode as base64.
    pub fn encode(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Decode a base64 region id.
    pub fn decode(s: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(s)
            .map_err(|e| Error::MalformedIdentifier(format!("region id {s:?}: {e}")))?;
        if raw.len() != REGION_ID_LEN {
            return Err(Error::MalformedIdentifier(format!(
                "region id must decode to {REGION_ID_LEN} bytes, got {}",
                raw.len()
            )));
        }
        Ok(Self(Bytes::from(raw)))
    }

    /// Encode an optional region id, yielding [`NONE_SENTINEL`] when absent.
    pub fn encode_opt(id: Option<&RegionId>) -> String {
        id.map_or_else(|| NONE_SENTINEL.to_string(), RegionId::encode)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionId({})", self.encode())
    }
}

impl FromStr for RegionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}
