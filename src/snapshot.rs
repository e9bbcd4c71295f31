//! Point-in-time snapshots of a register's values.
//!
//! A snapshot is a flat key to value mapping plus a format version and a
//! CRC32 over the canonical JSON encoding of the entries. It is written
//! either as pretty JSON (the default, human-readable) or as MessagePack.
//! Readers detect the encoding from the first byte, so either form loads
//! through the same call.

use crate::error::{RegisterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// On-disk encoding of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotFormat {
    Json,
    MessagePack,
}

impl Default for SnapshotFormat {
    fn default() -> Self {
        SnapshotFormat::Json
    }
}

/// Serialized form of a register's full key to value mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// CRC32 of `serde_json::to_vec(&entries)`.
    pub checksum: u32,
    pub entries: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Build a snapshot over `entries`, computing its checksum.
    pub fn new(entries: BTreeMap<String, Value>) -> Result<Self> {
        let checksum = checksum_of(&entries)?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            checksum,
            entries,
        })
    }

    /// Check version and checksum.
    pub fn verify(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(RegisterError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                self.version
            )));
        }

        let got = checksum_of(&self.entries)?;
        if got != self.checksum {
            return Err(RegisterError::ChecksumMismatch {
                expected: self.checksum,
                got,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode to `writer`.
    pub fn write_to<W: Write>(&self, mut writer: W, format: SnapshotFormat) -> Result<()> {
        match format {
            SnapshotFormat::Json => serde_json::to_writer_pretty(&mut writer, self)?,
            SnapshotFormat::MessagePack => rmp_serde::encode::write_named(&mut writer, self)?,
        }
        writer.flush()?;
        Ok(())
    }

    /// Decode from `reader` and verify.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Decode either encoding from raw bytes and verify.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let first = bytes.iter().copied().find(|b| !b.is_ascii_whitespace());
        let snapshot: Snapshot = match first {
            None => return Err(RegisterError::InvalidFormat("Empty snapshot".into())),
            Some(b'{') => serde_json::from_slice(bytes)
                .map_err(|e| RegisterError::Deserialization(e.to_string()))?,
            Some(_) => rmp_serde::from_slice(bytes)?,
        };
        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Write to `path`, replacing any existing file only once the new
    /// contents are fully on disk.
    pub fn save(&self, path: impl AsRef<Path>, format: SnapshotFormat) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = temp_path(path);

        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            self.write_to(&mut writer, format)?;
            writer
                .into_inner()
                .map_err(|e| RegisterError::Io(e.into_error()))?
                .sync_all()?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Read and verify the snapshot at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::read_from(file)
    }
}

fn checksum_of(entries: &BTreeMap<String, Value>) -> Result<u32> {
    let bytes = serde_json::to_vec(entries)?;
    Ok(crc32fast::hash(&bytes))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Snapshot {
        let mut entries = BTreeMap::new();
        entries.insert("count".to_string(), json!(42));
        entries.insert("name".to_string(), json!("switchboard"));
        entries.insert("nested".to_string(), json!({"a": [1, 2, 3], "b": null}));
        Snapshot::new(entries).unwrap()
    }

    #[test]
    fn test_json_is_textual() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf, SnapshotFormat::Json).unwrap();

        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\"count\": 42"));
        assert_eq!(Snapshot::from_bytes(text.as_bytes()).unwrap(), sample());
    }

    #[test]
    fn test_messagepack_detected_on_read() {
        let mut buf = Vec::new();
        sample().write_to(&mut buf, SnapshotFormat::MessagePack).unwrap();

        assert_ne!(buf[0], b'{');
        assert_eq!(Snapshot::read_from(buf.as_slice()).unwrap(), sample());
    }

    #[test]
    fn test_tampered_entries_fail_checksum() {
        let mut snapshot = sample();
        snapshot.entries.insert("count".to_string(), json!(43));

        let mut buf = Vec::new();
        snapshot.write_to(&mut buf, SnapshotFormat::Json).unwrap();

        let result = Snapshot::from_bytes(&buf);
        assert!(matches!(result, Err(RegisterError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut snapshot = sample();
        snapshot.version = 99;

        assert!(matches!(
            snapshot.verify(),
            Err(RegisterError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(
            Snapshot::from_bytes(b"  \n"),
            Err(RegisterError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("register.json");

        sample().save(&path, SnapshotFormat::Json).unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.entries["name"], json!("switchboard"));
    }
}
