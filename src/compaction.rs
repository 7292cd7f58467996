//! Compaction: rewrites live records into one new file, swaps the index,
//! and unlinks the old files. Grounded on `BitCask::compact`/`write_log` in
//! `examples/DrEden33773-toydb/src/storage/bitcask.rs`, generalized from a
//! single-log rewrite to a multi-file directory with per-source read-handle
//! caching.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::time::Instant;

use fs4::FileExt;

use crate::codec::Codec;
use crate::engine::{data_file_path, list_data_file_ids, Engine};
use crate::error::{Error, Result};
use crate::index::{Index, IndexEntry};

const MIB: u64 = 1024 * 1024;
/// Per-entry bookkeeping overhead (length prefixes etc.) assumed by the
/// live-size estimator.
const FIXED_OVERHEAD: u64 = 20;

/// A point-in-time view of on-disk vs. estimated-live bytes, used to decide
/// whether compaction is worthwhile and to report before/after sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionStats {
    pub total_files: u64,
    pub total_size: u64,
    pub live_keys: u64,
    pub estimated_live_size: u64,
    pub estimated_dead_ratio: f64,
}

/// The result of a `compact` call: either it was skipped (`performed: false`,
/// with a `reason`) or it ran to completion with the stats below.
#[derive(Debug, Clone)]
pub struct CompactionReport {
    pub performed: bool,
    pub reason: Option<String>,
    pub duration_seconds: f64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub files_removed: u64,
    pub removed_files: Vec<String>,
    pub initial_stats: CompactionStats,
    pub final_stats: CompactionStats,
    pub space_saved_bytes: u64,
    pub space_saved_ratio: f64,
}

/// Below 1 MiB total, or below 2 files and 10 MiB, compaction never runs
/// regardless of dead ratio.
fn passes_compaction_gate(total_files: u64, total_size: u64, dead_ratio: f64, threshold: f64) -> bool {
    if total_size < MIB || (total_files < 2 && total_size < 10 * MIB) {
        return false;
    }
    dead_ratio >= threshold
}

impl CompactionReport {
    fn skipped(reason: &str, stats: CompactionStats) -> CompactionReport {
        CompactionReport {
            performed: false,
            reason: Some(reason.to_string()),
            duration_seconds: 0.0,
            records_written: 0,
            bytes_written: 0,
            files_removed: 0,
            removed_files: Vec::new(),
            final_stats: stats.clone(),
            initial_stats: stats,
            space_saved_bytes: 0,
            space_saved_ratio: 0.0,
        }
    }
}

impl Engine {
    /// Sums on-disk file sizes and estimates live vs. dead bytes from the
    /// current index. Does not require exclusive access to any file.
    pub fn compaction_stats(&self) -> Result<CompactionStats> {
        let ids = list_data_file_ids(&self.dir)?;
        let mut total_size = 0u64;
        for id in &ids {
            total_size += data_file_path(&self.dir, *id).metadata()?.len();
        }

        let live_keys = self.index.len() as u64;
        let estimated_live_size: u64 = self
            .index
            .iter()
            .map(|(key, entry)| key.len() as u64 + entry.value_size as u64 + FIXED_OVERHEAD)
            .sum();
        let estimated_dead_ratio = if total_size == 0 {
            0.0
        } else {
            (total_size.saturating_sub(estimated_live_size) as f64 / total_size as f64).max(0.0)
        };

        Ok(CompactionStats {
            total_files: ids.len() as u64,
            total_size,
            live_keys,
            estimated_live_size,
            estimated_dead_ratio,
        })
    }

    /// `false` below 1 MiB total, or below 2 files and 10 MiB; otherwise
    /// compares the estimated dead ratio against `threshold_ratio`.
    pub fn should_compact(&self, threshold_ratio: f64) -> Result<bool> {
        let stats = self.compaction_stats()?;
        Ok(passes_compaction_gate(stats.total_files, stats.total_size, stats.estimated_dead_ratio, threshold_ratio))
    }

    /// Runs compaction unless skipped by the threshold gate. On any failure
    /// while building the replacement file, the partially-written file is
    /// unlinked and the live index is left untouched.
    pub fn compact(&mut self, threshold_ratio: f64, force: bool) -> Result<CompactionReport> {
        let initial_stats = self.compaction_stats()?;
        if !force && !self.should_compact(threshold_ratio)? {
            return Ok(CompactionReport::skipped("threshold_not_met", initial_stats));
        }

        let start = Instant::now();
        let source_ids = list_data_file_ids(&self.dir)?;
        let new_id = source_ids.iter().max().copied().unwrap_or(0) + 1;
        let new_path = data_file_path(&self.dir, new_id);

        let built = self.rewrite_live_records(&new_path, new_id);
        let (new_index, records_written, new_file_size) = match built {
            Ok(built) => built,
            Err(err) => {
                let _ = std::fs::remove_file(&new_path);
                return Err(Error::CompactionFailed(err.to_string()));
            }
        };

        let active_file = match OpenOptions::new()
            .read(true)
            .append(true)
            .open(&new_path)
            .map_err(Error::from)
            .and_then(|file| file.try_lock_exclusive().map(|()| file).map_err(Error::from))
        {
            Ok(file) => file,
            Err(err) => {
                let _ = std::fs::remove_file(&new_path);
                return Err(Error::CompactionFailed(err.to_string()));
            }
        };

        let mut removed_files = Vec::new();
        for id in &source_ids {
            let path = data_file_path(&self.dir, *id);
            match std::fs::remove_file(&path) {
                Ok(()) => removed_files.push(format!("data_{id}.db")),
                Err(err) => log::warn!("compact: failed to remove data_{id}.db: {err}"),
            }
        }

        self.active_file = active_file; // drops the sealed active file's lock
        self.active_file_id = new_id;
        self.active_file_size = new_file_size;
        self.active_file_entries = records_written;
        self.index = new_index;

        let final_stats = self.compaction_stats()?;
        let space_saved_bytes = initial_stats.total_size.saturating_sub(final_stats.total_size);
        let space_saved_ratio = if initial_stats.total_size > 0 {
            space_saved_bytes as f64 / initial_stats.total_size as f64
        } else {
            0.0
        };

        Ok(CompactionReport {
            performed: true,
            reason: None,
            duration_seconds: start.elapsed().as_secs_f64(),
            records_written,
            bytes_written: new_file_size,
            files_removed: removed_files.len() as u64,
            removed_files,
            initial_stats,
            final_stats,
            space_saved_bytes,
            space_saved_ratio,
        })
    }

    /// Streams every live record (by current index, key order) into a new
    /// file, keeping at most one open read handle per source file for the
    /// whole pass. Returns the replacement index and the new file's size.
    fn rewrite_live_records(
        &self,
        new_path: &std::path::Path,
        new_id: u32,
    ) -> Result<(Index, u64, u64)> {
        let mut new_file =
            OpenOptions::new().read(true).write(true).create(true).truncate(true).open(new_path)?;
        new_file.write_all(&[self.codec.identifier()])?;

        let mut new_index = Index::new();
        let mut readers: HashMap<u32, (Codec, BufReader<File>)> = HashMap::new();
        let mut offset: u64 = 1;
        let mut records_written = 0u64;

        let mut keys: Vec<&Vec<u8>> = self.index.keys().collect();
        keys.sort();

        for key in keys {
            let entry: IndexEntry = *self.index.get(key).expect("key came from this index");
            let (codec, reader) = match readers.entry(entry.file_id) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    let path = data_file_path(&self.dir, entry.file_id);
                    let mut reader = BufReader::new(File::open(&path)?);
                    let mut format_byte = [0u8; 1];
                    reader.read_exact(&mut format_byte)?;
                    let codec = Codec::from_identifier(format_byte[0])
                        .ok_or(Error::UnknownFormat(format_byte[0]))?;
                    vacant.insert((codec, reader))
                }
            };

            reader.seek(SeekFrom::Start(entry.value_pos))?;
            let decoded = match codec.read_record(reader)? {
                Some(decoded) => decoded,
                None => {
                    log::warn!("compact: index entry for key pointed past end of its source file, skipping");
                    continue;
                }
            };
            if decoded.is_tombstone || decoded.key != *key {
                log::warn!("compact: stale or mismatched record for key, skipping");
                continue;
            }

            let bytes = self.codec.encode_record(&decoded.key, &decoded.value, decoded.timestamp);
            new_file.write_all(&bytes)?;
            new_index.insert(
                key.clone(),
                IndexEntry {
                    file_id: new_id,
                    value_size: decoded.value.len() as u32,
                    value_pos: offset,
                    timestamp: decoded.timestamp,
                },
            );
            offset += bytes.len() as u64;
            records_written += 1;
        }

        new_file.flush()?;
        new_file.sync_all()?;
        Ok((new_index, records_written, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::RotationPolicy;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case(500_000, 1, 0.9, 0.0 => false; "below one mib total")]
    #[test_case(5 * MIB, 1, 0.9, 0.0 => false; "one file below ten mib")]
    #[test_case(5 * MIB, 2, 0.1, 0.5 => false; "two files below threshold")]
    #[test_case(5 * MIB, 2, 0.5, 0.5 => true; "two files at threshold")]
    #[test_case(20 * MIB, 1, 0.9, 0.0 => true; "one file above ten mib ignores file count")]
    fn should_compact_honors_gate(total_size: u64, total_files: u64, dead_ratio: f64, threshold: f64) -> bool {
        passes_compaction_gate(total_files, total_size, dead_ratio, threshold)
    }

    #[test]
    fn threshold_gate_on_small_database() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::open(dir.path(), Codec::Compact, RotationPolicy::None).unwrap();
        engine.put(b"a", b"1").unwrap();
        assert!(!engine.should_compact(0.0).unwrap());
        let report = engine.compact(0.1, false).unwrap();
        assert!(!report.performed);
        assert_eq!(report.reason.as_deref(), Some("threshold_not_met"));
    }

    #[test]
    fn force_compacts_even_under_threshold() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::open(dir.path(), Codec::Compact, RotationPolicy::None).unwrap();
        engine.put(b"a", b"1").unwrap();
        let report = engine.compact(0.1, true).unwrap();
        assert!(report.performed);
        assert_eq!(report.final_stats.total_files, 1);
    }

    #[test]
    fn compact_preserves_the_logical_map() {
        let dir = TempDir::new().unwrap();
        let mut engine =
            Engine::open(dir.path(), Codec::Compact, RotationPolicy::EntryCount { max_entries: 10 })
                .unwrap();
        for i in 0..100 {
            engine.put(format!("k{i}").as_bytes(), vec![b'x'; 200].as_slice()).unwrap();
        }
        for i in 0..50 {
            engine.put(format!("k{i}").as_bytes(), b"updated").unwrap();
        }
        for i in 0..20 {
            engine.delete(format!("k{i}").as_bytes()).unwrap();
        }

        let mut before = HashMap::new();
        for i in 0..100 {
            let key = format!("k{i}");
            before.insert(key.clone(), engine.get(key.as_bytes()).unwrap());
        }

        let report = engine.compact(0.0, true).unwrap();
        assert!(report.performed);
        assert_eq!(report.final_stats.total_files, 1);
        assert_eq!(report.files_removed, report.initial_stats.total_files);

        for i in 0..100 {
            let key = format!("k{i}");
            assert_eq!(engine.get(key.as_bytes()).unwrap(), before[&key]);
        }
        for i in 0..20 {
            assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), None);
        }
        for i in 20..50 {
            assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), Some(b"updated".to_vec()));
        }
        for i in 50..100 {
            assert_eq!(engine.get(format!("k{i}").as_bytes()).unwrap(), Some(vec![b'x'; 200]));
        }
    }

    #[test]
    fn compact_locality_caches_one_handle_per_source_file() {
        let dir = TempDir::new().unwrap();
        let mut engine = Engine::open(dir.path(), Codec::Compact, RotationPolicy::None).unwrap();
        for i in 0..20 {
            engine.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        // All 20 keys live in data_1.db: rewrite_live_records must open it once.
        let (new_index, records_written, size) =
            engine.rewrite_live_records(&dir.path().join("data_2.db"), 2).unwrap();
        assert_eq!(records_written, 20);
        assert_eq!(new_index.len(), 20);
        assert!(size > 1);
        std::fs::remove_file(dir.path().join("data_2.db")).unwrap();
    }
}
