//! The orchestrator: write path, read path, recovery, rotation, and clear.
//! Grounded on `examples/DrEden33773-toydb/src/storage/bitcask.rs`'s
//! `BitCask`/`Log` split, generalized from a single log file to a
//! multi-file, rotating directory layout.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs4::FileExt;

use crate::codec::Codec;
use crate::error::Result;
use crate::index::{Index, IndexEntry};
use crate::rotation::RotationPolicy;

/// An open Bitcask directory: the active append-only file, the in-memory
/// index, and the policies governing rotation and on-disk format.
pub struct Engine {
    pub(crate) dir: PathBuf,
    pub(crate) codec: Codec,
    pub(crate) rotation: RotationPolicy,
    pub(crate) active_file_id: u32,
    pub(crate) active_file: File,
    pub(crate) active_file_size: u64,
    pub(crate) active_file_entries: u64,
    pub(crate) index: Index,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

pub(crate) fn data_file_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("data_{id}.db"))
}

fn parse_data_file_id(name: &str) -> Option<u32> {
    let stem = name.strip_prefix("data_")?.strip_suffix(".db")?;
    let id: u32 = stem.parse().ok()?;
    (id >= 1).then_some(id)
}

pub(crate) fn list_data_file_ids(dir: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_data_file_id(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Creates a brand new, empty active file: writes the format identifier and
/// returns a locked, append-mode handle positioned at the end (offset 1).
fn create_data_file(dir: &Path, id: u32, codec: Codec) -> Result<File> {
    let path = data_file_path(dir, id);
    {
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        file.write_all(&[codec.identifier()])?;
        file.flush()?;
    }
    let file = OpenOptions::new().read(true).append(true).open(&path)?;
    file.try_lock_exclusive()?;
    Ok(file)
}

fn open_active_file(dir: &Path, id: u32) -> Result<File> {
    let file = OpenOptions::new().read(true).append(true).open(data_file_path(dir, id))?;
    file.try_lock_exclusive()?;
    Ok(file)
}

/// Scans every data file from smallest to largest id, rebuilding the index
/// and counting how many records the active (highest-id) file holds.
fn recover(dir: &Path, ids: &[u32]) -> Result<(Index, u64)> {
    let mut index = Index::new();
    let max_id = *ids.iter().max().expect("recover called with at least one file id");
    let mut active_entries = 0u64;

    for &id in ids {
        let path = data_file_path(dir, id);
        let mut reader = BufReader::new(File::open(&path)?);

        let mut format_byte = [0u8; 1];
        if reader.read(&mut format_byte)? == 0 {
            continue; // empty file: no format identifier, no records
        }
        let codec = match Codec::from_identifier(format_byte[0]) {
            Some(codec) => codec,
            None => {
                log::warn!(
                    "data_{id}.db: unrecognized format identifier 0x{:02x}, skipping during recovery",
                    format_byte[0]
                );
                continue;
            }
        };

        let mut offset: u64 = 1;
        let mut entries_in_file = 0u64;
        loop {
            match codec.read_record(&mut reader) {
                Ok(Some(record)) => {
                    entries_in_file += 1;
                    if record.is_tombstone {
                        // A tombstone supersedes the current index entry only if
                        // it is at least as new. Monotonic scan order makes this
                        // correct even under simulated clock skew.
                        if let Some(existing) = index.get(&record.key) {
                            if record.timestamp >= existing.timestamp {
                                index.remove(&record.key);
                            }
                        }
                    } else {
                        let replace = match index.get(&record.key) {
                            None => true,
                            // Ties broken in favor of the later-scanned record:
                            // scan order is strictly increasing in (file_id, offset).
                            Some(existing) => record.timestamp >= existing.timestamp,
                        };
                        if replace {
                            index.insert(
                                record.key.clone(),
                                IndexEntry {
                                    file_id: id,
                                    value_size: record.value.len() as u32,
                                    value_pos: offset,
                                    timestamp: record.timestamp,
                                },
                            );
                        }
                    }
                    offset += record.record_size;
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!(
                        "data_{id}.db: decode error at offset {offset}: {err}; truncating scan of this file"
                    );
                    break;
                }
            }
        }
        if id == max_id {
            active_entries = entries_in_file;
        }
    }

    Ok((index, active_entries))
}

impl Engine {
    /// Opens `dir`, creating it and an initial `data_1.db` if empty, or
    /// recovering the index by scanning existing files otherwise.
    pub fn open(dir: impl AsRef<Path>, codec: Codec, rotation: RotationPolicy) -> Result<Engine> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let ids = list_data_file_ids(&dir)?;
        let (index, active_file_id, active_file_entries) = if ids.is_empty() {
            (Index::new(), 1, 0)
        } else {
            let active_file_id = *ids.iter().max().expect("non-empty");
            let (index, active_entries) = recover(&dir, &ids)?;
            (index, active_file_id, active_entries)
        };

        let active_file = if ids.is_empty() {
            create_data_file(&dir, active_file_id, codec)?
        } else {
            open_active_file(&dir, active_file_id)?
        };
        let active_file_size = active_file.metadata()?.len();

        Ok(Engine {
            dir,
            codec,
            rotation,
            active_file_id,
            active_file,
            active_file_size,
            active_file_entries,
            index,
        })
    }

    fn maybe_rotate(&mut self, last_write_time_ms: u64) -> Result<()> {
        if self.rotation.should_rotate(
            self.active_file_size,
            self.active_file_entries,
            last_write_time_ms,
        ) {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.active_file.flush()?;
        let new_id = self.active_file_id + 1;
        let new_file = create_data_file(&self.dir, new_id, self.codec)?;
        self.active_file = new_file; // drops (and closes) the sealed file's handle
        self.active_file_id = new_id;
        self.active_file_size = 1;
        self.active_file_entries = 0;
        Ok(())
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let timestamp = now_ms();
        self.maybe_rotate(timestamp)?;

        let record_pos = self.active_file_size;
        let bytes = self.codec.encode_record(key, value, timestamp);
        self.active_file.write_all(&bytes)?;
        self.active_file.flush()?;
        self.active_file_size += bytes.len() as u64;
        self.active_file_entries += 1;

        self.index.insert(
            key.to_vec(),
            IndexEntry {
                file_id: self.active_file_id,
                value_size: value.len() as u32,
                value_pos: record_pos,
                timestamp,
            },
        );
        Ok(())
    }

    /// Returns `false` without writing anything if `key` isn't in the index.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if !self.index.contains_key(key) {
            return Ok(false);
        }
        let timestamp = now_ms();
        let bytes = self.codec.encode_tombstone(key, timestamp);
        self.active_file.write_all(&bytes)?;
        self.active_file.flush()?;
        self.active_file.sync_all()?; // fsync on delete: tombstone durability is observable
        self.active_file_size += bytes.len() as u64;
        self.active_file_entries += 1;

        self.index.remove(key);
        Ok(true)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entry = match self.index.get(key) {
            Some(entry) => *entry,
            None => return Ok(None),
        };

        let path = data_file_path(&self.dir, entry.file_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                log::warn!("get: failed to open data_{}.db: {err}", entry.file_id);
                return Ok(None);
            }
        };
        let mut reader = BufReader::new(file);

        let mut format_byte = [0u8; 1];
        if let Err(err) = reader.read_exact(&mut format_byte) {
            log::warn!("get: failed to read format identifier of data_{}.db: {err}", entry.file_id);
            return Ok(None);
        }
        let codec = match Codec::from_identifier(format_byte[0]) {
            Some(codec) => codec,
            None => {
                log::warn!(
                    "get: data_{}.db has unrecognized format identifier 0x{:02x}",
                    entry.file_id,
                    format_byte[0]
                );
                return Ok(None);
            }
        };
        if let Err(err) = reader.seek(SeekFrom::Start(entry.value_pos)) {
            log::warn!("get: seek to {} in data_{}.db failed: {err}", entry.value_pos, entry.file_id);
            return Ok(None);
        }

        match codec.read_record(&mut reader) {
            Ok(Some(record)) if record.is_tombstone => {
                // Stale index entry pointing at a tombstone: self-heal.
                self.index.remove(key);
                Ok(None)
            }
            Ok(Some(record)) => Ok(Some(record.value)),
            Ok(None) => {
                log::warn!("get: index entry for key points past end of data_{}.db", entry.file_id);
                Ok(None)
            }
            Err(err) => {
                log::warn!(
                    "get: decode error in data_{}.db at offset {}: {err}",
                    entry.file_id,
                    entry.value_pos
                );
                Ok(None)
            }
        }
    }

    /// Writes every `(key, value)` pair under one sampled timestamp, flushing
    /// once at the end. Rotation is checked before each record, so a batch
    /// never straddles a rotation mid-record.
    pub fn batch_write<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let timestamp = now_ms();
        for (key, value) in entries {
            self.maybe_rotate(timestamp)?;

            let record_pos = self.active_file_size;
            let bytes = self.codec.encode_record(&key, &value, timestamp);
            self.active_file.write_all(&bytes)?;
            self.active_file_size += bytes.len() as u64;
            self.active_file_entries += 1;

            self.index.insert(
                key,
                IndexEntry {
                    file_id: self.active_file_id,
                    value_size: value.len() as u32,
                    value_pos: record_pos,
                    timestamp,
                },
            );
        }
        self.active_file.flush()?;
        Ok(())
    }

    /// The set of keys currently in the index. No consistency promise beyond
    /// the engine lock held by the caller if operations run concurrently.
    pub fn list_keys(&self) -> Vec<Vec<u8>> {
        self.index.keys().cloned().collect()
    }

    /// Unlinks every data file, clears the index, and starts over at `data_1.db`.
    pub fn clear(&mut self) -> Result<()> {
        let ids = list_data_file_ids(&self.dir)?;
        for id in ids {
            if let Err(err) = std::fs::remove_file(data_file_path(&self.dir, id)) {
                log::warn!("clear: failed to remove data_{id}.db: {err}");
            }
        }

        let new_file = create_data_file(&self.dir, 1, self.codec)?;
        self.active_file = new_file; // releases the previous file's lock
        self.active_file_id = 1;
        self.active_file_size = 1;
        self.active_file_entries = 0;
        self.index.clear();
        Ok(())
    }

    /// Flushes and fsyncs the active file. Callers running a
    /// [`crate::scheduler::CompactionScheduler`] against this engine are
    /// responsible for stopping it before (or after) closing.
    pub fn close(&mut self) -> Result<()> {
        self.active_file.flush()?;
        self.active_file.sync_all()?;
        Ok(())
    }

}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.active_file.flush() {
            log::error!("failed to flush active file on drop: {err}");
        }
    }
}
