//! Index file: the persisted (key, marker) population of a store.
//!
//! The file is a flat sequence of length-prefixed records (`u32` little
//! endian length, then a bincode payload) ending at end-of-stream. It is
//! rewritten in full on every flush.
//!
//! Older files hold exactly two records instead: a bulk map of key → marker
//! and the free-region list of the allocator. There is no version field, so
//! the format is recognised structurally: the first record either decodes
//! as a single pair or as a bulk map. The region list of a legacy file is
//! discarded; the allocator is rebuilt from the markers.

use std::collections::HashMap;
use std::fs::{self, File};
use std::hash::Hash;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::substitute::MarkerMeta;
use crate::transfer::allocator::{AllocatorError, Region};

/// Largest record accepted on read.
const MAX_RECORD_BYTES: u64 = 1 << 30;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Index record truncated")]
    Truncated,

    #[error("Index record of {0} bytes exceeds the record limit")]
    OversizedRecord(u64),

    #[error("Undecodable index record #{0}")]
    Undecodable(usize),

    #[error("Trailing data after legacy index")]
    TrailingData,

    #[error("Encoding index record failed: {0}")]
    Encode(String),

    #[error("Duplicate key in index file")]
    DuplicateKey,

    #[error("Region {region} extends past the data file ({data_len} bytes)")]
    RegionOutOfBounds { region: Region, data_len: u64 },

    #[error("Allocator rejected persisted region: {0}")]
    Allocator(#[from] AllocatorError),
}

#[derive(Serialize, Deserialize)]
struct IndexRecord<K> {
    key: K,
    marker: MarkerMeta,
}

/// Entries read from an index file.
#[derive(Debug)]
pub struct LoadedIndex<K> {
    pub entries: Vec<(K, MarkerMeta)>,

    /// The file used the legacy bulk format.
    pub legacy: bool,
}

/// Outcome of the startup consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Index present and not older than the data file.
    Usable,
    /// No index file.
    Missing,
    /// Data file missing or empty; the index was deleted.
    DeletedWithoutData,
    /// Data file newer than the index; the index was deleted.
    DeletedStale,
}

/// Handle on the index file of a store.
#[derive(Debug, Clone)]
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Replace the file with `entries`. Returns the bytes written.
    pub fn write<K: Serialize>(&self, entries: &[(K, MarkerMeta)]) -> Result<u64, PersistenceError> {
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;

        for (key, marker) in entries {
            let record = IndexRecord {
                key,
                marker: *marker,
            };
            written += write_frame(&mut writer, &record)?;
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(path = %self.path.display(), entries = entries.len(), bytes = written, "Wrote index file");
        Ok(written)
    }

    /// Write the legacy two-record layout.
    pub fn write_legacy<K: Serialize + Hash + Eq>(
        &self,
        entries: &HashMap<K, MarkerMeta>,
        free_regions: &[Region],
    ) -> Result<u64, PersistenceError> {
        let mut writer = BufWriter::new(File::create(&self.path)?);
        let written = write_frame(&mut writer, entries)? + write_frame(&mut writer, &free_regions)?;
        writer.flush()?;
        Ok(written)
    }

    /// Read every entry. Any failure other than a clean end-of-stream is an
    /// error.
    pub fn read<K>(&self) -> Result<LoadedIndex<K>, PersistenceError>
    where
        K: DeserializeOwned + Hash + Eq,
    {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let Some(first) = read_frame(&mut reader)? else {
            return Ok(LoadedIndex {
                entries: Vec::new(),
                legacy: false,
            });
        };

        if let Some(record) = decode_exact::<IndexRecord<K>>(&first) {
            let mut entries = vec![(record.key, record.marker)];
            while let Some(frame) = read_frame(&mut reader)? {
                let record = decode_exact::<IndexRecord<K>>(&frame)
                    .ok_or(PersistenceError::Undecodable(entries.len()))?;
                entries.push((record.key, record.marker));
            }
            return Ok(LoadedIndex {
                entries,
                legacy: false,
            });
        }

        let bulk = decode_exact::<HashMap<K, MarkerMeta>>(&first)
            .ok_or(PersistenceError::Undecodable(0))?;
        if let Some(frame) = read_frame(&mut reader)? {
            let free = decode_exact::<Vec<Region>>(&frame).ok_or(PersistenceError::Undecodable(1))?;
            debug!(free_regions = free.len(), "Discarding legacy free-region list");
        }
        if read_frame(&mut reader)?.is_some() {
            return Err(PersistenceError::TrailingData);
        }

        info!(path = %self.path.display(), entries = bulk.len(), "Converting legacy index file");
        Ok(LoadedIndex {
            entries: bulk.into_iter().collect(),
            legacy: true,
        })
    }

    /// Delete the file; a missing file is not an error.
    pub fn delete(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Deleted index file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Decide whether the index can be trusted next to `data_path`, deleting
    /// it when it cannot.
    pub fn check_consistency(
        &self,
        data_path: &Path,
        tolerance: Duration,
    ) -> Result<Consistency, PersistenceError> {
        let data = match fs::metadata(data_path) {
            Ok(meta) if meta.len() > 0 => meta,
            Ok(_) => return self.discard(Consistency::DeletedWithoutData),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return self.discard(Consistency::DeletedWithoutData)
            }
            Err(e) => return Err(e.into()),
        };

        let index = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Consistency::Missing),
            Err(e) => return Err(e.into()),
        };

        let stale = data
            .modified()?
            .duration_since(index.modified()?)
            .is_ok_and(|lag| lag > tolerance);
        if stale {
            warn!(path = %self.path.display(), "Index file older than data file, discarding");
            return self.discard(Consistency::DeletedStale);
        }
        Ok(Consistency::Usable)
    }

    fn discard(&self, outcome: Consistency) -> Result<Consistency, PersistenceError> {
        if !self.exists() {
            return Ok(Consistency::Missing);
        }
        self.delete()?;
        Ok(outcome)
    }
}

fn write_frame<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<u64, PersistenceError> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| PersistenceError::Encode(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| PersistenceError::OversizedRecord(payload.len() as u64))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(4 + payload.len() as u64)
}

/// Next record, or `None` at a clean end-of-stream.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, PersistenceError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(PersistenceError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_le_bytes(header) as u64;
    if len > MAX_RECORD_BYTES {
        return Err(PersistenceError::OversizedRecord(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => PersistenceError::Truncated,
        _ => PersistenceError::IoError(e),
    })?;
    Ok(Some(payload))
}

/// Decode `T` only if it spans the whole record.
fn decode_exact<T: DeserializeOwned>(payload: &[u8]) -> Option<T> {
    match bincode::serde::decode_from_slice::<T, _>(payload, bincode::config::standard()) {
        Ok((value, consumed)) if consumed == payload.len() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn meta(start: u64, hits: u64) -> MarkerMeta {
        MarkerMeta {
            region: Region::new(start, 10),
            hit_count: hits,
            last_accessed_at: 1_000 + start,
            expires_at: (hits % 2 == 0).then_some(99_000),
        }
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let file = IndexFile::new(tmp.path().join("x.index"));
        let entries = vec![
            ("a".to_string(), meta(0, 1)),
            ("b".to_string(), meta(10, 2)),
            ("c".to_string(), meta(20, 3)),
        ];

        file.write(&entries).unwrap();
        let loaded = file.read::<String>().unwrap();
        assert!(!loaded.legacy);
        assert_eq!(loaded.entries, entries);
    }

    #[test]
    fn test_empty_file_is_empty_index() {
        let tmp = TempDir::new().unwrap();
        let file = IndexFile::new(tmp.path().join("x.index"));
        file.write::<String>(&[]).unwrap();

        let loaded = file.read::<String>().unwrap();
        assert!(loaded.entries.is_empty());
    }

    #[test]
    fn test_truncated_record_is_error() {
        let tmp = TempDir::new().unwrap();
        let file = IndexFile::new(tmp.path().join("x.index"));
        file.write(&[("a".to_string(), meta(0, 1)), ("b".to_string(), meta(10, 1))])
            .unwrap();

        let len = fs::metadata(file.path()).unwrap().len();
        File::options()
            .write(true)
            .open(file.path())
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        assert!(matches!(
            file.read::<String>(),
            Err(PersistenceError::Truncated)
        ));
    }

    #[test]
    fn test_garbage_is_error() {
        let tmp = TempDir::new().unwrap();
        let file = IndexFile::new(tmp.path().join("x.index"));
        fs::write(file.path(), [3, 0, 0, 0, 0xff, 0xff, 0xff]).unwrap();

        assert!(file.read::<String>().is_err());
    }

    #[test]
    fn test_legacy_format_is_converted() {
        let tmp = TempDir::new().unwrap();
        let file = IndexFile::new(tmp.path().join("x.index"));
        let bulk: HashMap<String, MarkerMeta> = [
            ("a".to_string(), meta(0, 4)),
            ("b".to_string(), meta(30, 5)),
        ]
        .into_iter()
        .collect();
        file.write_legacy(&bulk, &[Region::new(10, 20)]).unwrap();

        let loaded = file.read::<String>().unwrap();
        assert!(loaded.legacy);
        let converted: HashMap<_, _> = loaded.entries.into_iter().collect();
        assert_eq!(converted, bulk);
    }

    #[test]
    fn test_consistency_without_data_deletes_index() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("x.data");
        let file = IndexFile::new(tmp.path().join("x.index"));
        file.write(&[("a".to_string(), meta(0, 1))]).unwrap();

        let outcome = file.check_consistency(&data, Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, Consistency::DeletedWithoutData);
        assert!(!file.exists());
    }

    #[test]
    fn test_consistency_detects_stale_index() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("x.data");
        fs::write(&data, [1u8; 32]).unwrap();
        let file = IndexFile::new(tmp.path().join("x.index"));
        file.write(&[("a".to_string(), meta(0, 1))]).unwrap();

        assert_eq!(
            file.check_consistency(&data, Duration::from_secs(1)).unwrap(),
            Consistency::Usable
        );

        let later = SystemTime::now() + Duration::from_secs(60);
        File::options()
            .write(true)
            .open(&data)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert_eq!(
            file.check_consistency(&data, Duration::from_secs(1)).unwrap(),
            Consistency::DeletedStale
        );
        assert!(!file.exists());
    }
}
