// Snapshot codec: capacity-tagged, order-preserving encoding of cache contents
//
// Layout:
//   magic    "IPLC"
//   version  u16 LE
//   length   u64 LE (payload bytes)
//   checksum 32-byte BLAKE3 of the payload
//   payload  bincode(SnapshotRecord)
use std::hash::Hash;
use std::io::{Read, Write};

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cache::{Pair, RecencyCache};
use crate::error::{CacheError, DecodeError, ValidationError};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"IPLC";
pub const SNAPSHOT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 8 + 32;

/// Everything a snapshot carries: the capacity and the entries, most
/// recently used first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord<K, V> {
    pub capacity: u64,
    pub entries: Vec<Pair<K, V>>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode a record into a framed snapshot buffer.
pub fn encode<K: Serialize, V: Serialize>(record: &SnapshotRecord<K, V>) -> Result<Vec<u8>, CacheError> {
    let payload = wire_options().serialize(record).map_err(CacheError::Encode)?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(blake3::hash(&payload).as_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode a framed snapshot. Broken bytes yield [`DecodeError`], a record
/// whose capacity is unusable yields [`ValidationError`].
pub fn decode<K: DeserializeOwned, V: DeserializeOwned>(bytes: &[u8]) -> Result<SnapshotRecord<K, V>, CacheError> {
    if bytes.len() < HEADER_LEN {
        // Check what is there before blaming length, so random text reads as
        // "not a snapshot" rather than "short snapshot".
        if bytes.len() >= SNAPSHOT_MAGIC.len() && bytes[..4] != SNAPSHOT_MAGIC {
            return Err(DecodeError::BadMagic.into());
        }
        return Err(DecodeError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        }
        .into());
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[..4] != SNAPSHOT_MAGIC {
        return Err(DecodeError::BadMagic.into());
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != SNAPSHOT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version).into());
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[6..14]);
    let declared = u64::from_le_bytes(len_bytes);
    if declared > payload.len() as u64 {
        return Err(DecodeError::Truncated {
            expected: HEADER_LEN.saturating_add(declared as usize),
            actual: bytes.len(),
        }
        .into());
    }
    if declared != payload.len() as u64 {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: payload.len(),
        }
        .into());
    }

    if blake3::hash(payload).as_bytes() != &header[14..HEADER_LEN] {
        return Err(DecodeError::ChecksumMismatch.into());
    }

    let record: SnapshotRecord<K, V> = wire_options()
        .deserialize(payload)
        .map_err(DecodeError::Malformed)?;

    if record.capacity <= 1 {
        return Err(ValidationError::CapacityTooSmall(record.capacity).into());
    }
    if usize::try_from(record.capacity).is_err() {
        return Err(ValidationError::CapacityOverflow(record.capacity).into());
    }

    Ok(record)
}

/// Anything the persistence controller can turn into snapshot bytes.
pub trait SnapshotSource: Send + Sync + 'static {
    fn encode_snapshot(&self) -> Result<Vec<u8>, CacheError>;
}

impl<K, V> SnapshotSource for RecencyCache<K, V>
where
    K: Hash + Eq + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn encode_snapshot(&self) -> Result<Vec<u8>, CacheError> {
        self.export_bytes()
    }
}

impl<K, V> RecencyCache<K, V>
where
    K: Hash + Eq + Clone + Serialize,
    V: Clone + Serialize,
{
    /// Encode the current contents. The lock is only held while copying.
    pub fn export_bytes(&self) -> Result<Vec<u8>, CacheError> {
        let (capacity, entries) = self.snapshot();
        encode(&SnapshotRecord {
            capacity: capacity as u64,
            entries,
        })
    }

    /// Write a snapshot to `writer`. Recency is not affected.
    pub fn export<W: Write>(&self, mut writer: W) -> Result<(), CacheError> {
        let bytes = self.export_bytes()?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }
}

impl<K, V> RecencyCache<K, V>
where
    K: Hash + Eq + DeserializeOwned,
    V: DeserializeOwned,
{
    /// Replace capacity and contents from snapshot bytes.
    ///
    /// Nothing changes unless the whole payload decodes and validates. A
    /// payload holding more entries than its capacity is cut back to the
    /// `capacity` most recent ones.
    pub fn import_bytes(&self, bytes: &[u8]) -> Result<(), CacheError> {
        let record: SnapshotRecord<K, V> = decode(bytes)?;
        let capacity = record.capacity as usize;
        let trimmed = self.replace(capacity, record.entries);
        if trimmed > 0 {
            debug!(capacity, trimmed, "snapshot held more entries than its capacity");
        }
        Ok(())
    }

    /// Read a whole snapshot from `reader` and import it.
    pub fn import<R: Read>(&self, mut reader: R) -> Result<(), CacheError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.import_bytes(&bytes)
    }
}
