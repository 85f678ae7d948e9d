//! Rollback snapshots of shared-object state.
//!
//! The state is serialized with BSON inside a `{ "state": ... }` envelope.
//! On the wire an image is framed as:
//!
//! ```text
//! [magic "OSVI"][version u64 LE][payload len u32 LE][crc32 u32 LE][payload]
//! ```

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::Version;
use crate::core::errors::SnapshotError;
use crate::OptsvaError;

const IMAGE_MAGIC: &[u8; 4] = b"OSVI";
const IMAGE_HEADER_SIZE: usize = 20;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    state: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    state: T,
}

/// Serialized object state plus the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImage {
    version: Version,
    bytes: Vec<u8>,
}

impl SnapshotImage {
    pub fn capture<T: Serialize>(state: &T, version: Version) -> Result<Self, OptsvaError> {
        let bytes = bson::to_vec(&EnvelopeRef { state })?;
        Ok(Self { version, bytes })
    }

    pub fn materialize<T: DeserializeOwned>(&self) -> Result<T, OptsvaError> {
        let envelope: Envelope<T> = bson::from_slice(&self.bytes)?;
        Ok(envelope.state)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encode(&self) -> Result<Vec<u8>, OptsvaError> {
        let len = u32::try_from(self.bytes.len())
            .map_err(|_| SnapshotError(format!("image of {} bytes is too large", self.bytes.len())))?;
        let mut buf = Vec::with_capacity(IMAGE_HEADER_SIZE + self.bytes.len());
        buf.extend_from_slice(IMAGE_MAGIC);
        buf.write_u64::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(len)?;
        buf.write_u32::<LittleEndian>(checksum(&self.bytes))?;
        buf.extend_from_slice(&self.bytes);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, OptsvaError> {
        if buf.len() < IMAGE_HEADER_SIZE {
            return Err(SnapshotError(format!("truncated image header ({} bytes)", buf.len())).into());
        }
        let mut cursor = Cursor::new(buf);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if &magic != IMAGE_MAGIC {
            return Err(SnapshotError("bad image magic".into()).into());
        }
        let version = cursor.read_u64::<LittleEndian>()?;
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        let expected_crc = cursor.read_u32::<LittleEndian>()?;

        let payload = &buf[IMAGE_HEADER_SIZE..];
        if payload.len() != len {
            return Err(SnapshotError(format!(
                "image payload length mismatch: header says {len}, got {}",
                payload.len()
            ))
            .into());
        }
        if checksum(payload) != expected_crc {
            return Err(SnapshotError("image checksum mismatch".into()).into());
        }
        Ok(Self {
            version,
            bytes: payload.to_vec(),
        })
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ledger {
        owner: String,
        entries: Vec<i64>,
    }

    fn ledger() -> Ledger {
        Ledger {
            owner: "alice".into(),
            entries: vec![10, -3, 7],
        }
    }

    #[test]
    fn image_restores_captured_state() {
        let image = SnapshotImage::capture(&ledger(), 4).unwrap();
        assert_eq!(image.version(), 4);
        let restored: Ledger = image.materialize().unwrap();
        assert_eq!(restored, ledger());
    }

    #[test]
    fn scalar_state_is_wrapped_in_a_document() {
        let image = SnapshotImage::capture(&42i64, 1).unwrap();
        assert_eq!(image.materialize::<i64>().unwrap(), 42);
    }

    #[test]
    fn wire_frame_survives_transport() {
        let image = SnapshotImage::capture(&ledger(), 9).unwrap();
        let decoded = SnapshotImage::decode(&image.encode().unwrap()).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let image = SnapshotImage::capture(&ledger(), 9).unwrap();
        let mut wire = image.encode().unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        let err = SnapshotImage::decode(&wire).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let image = SnapshotImage::capture(&ledger(), 9).unwrap();
        let wire = image.encode().unwrap();
        assert!(SnapshotImage::decode(&wire[..IMAGE_HEADER_SIZE - 1]).is_err());
        assert!(SnapshotImage::decode(&wire[..wire.len() - 2]).is_err());
    }
}
