//! Log-structured on-disk map with crash-safe replay.
//!
//! All mutations are appended to a single `data.log` file inside the store's
//! directory; an in-memory index maps each live key to the file offset of
//! its current value. The record format is binary:
//!
//! ```text
//! op: u8 (1 = put, 2 = del) | key_len: u32 LE | value_len: u32 LE
//! key bytes | value bytes | crc32c over everything above: u32 LE
//! ```
//!
//! # Recovery
//!
//! On open the log is scanned from the start to rebuild the index. A record
//! that cannot be read in full, claims more bytes than the file holds, or
//! fails its checksum at the very end of the file is a torn tail from a
//! crash mid-append: the file is truncated at the start of that record and
//! scanning stops. A checksum failure with further data behind it is damage
//! the store cannot repair and opens fail with [`MapError::Corrupt`].
//!
//! # fsync Strategy
//!
//! Every `put` and effective `del` is fsynced before returning, so an `Ok`
//! from `put` means the pair survives a restart. Directory entries are
//! fsynced when the store directory or log file is first created and after
//! compaction renames.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{KvMap, MapError, Result};

const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;

/// op + key_len + value_len.
const HEADER_LEN: usize = 9;
/// crc32c.
const TRAILER_LEN: usize = 4;

const LOG_FILE: &str = "data.log";
const COMPACT_FILE: &str = "data.log.compact";

/// Location of a live value inside the log file.
#[derive(Debug, Clone, Copy)]
struct ValueLocation {
    /// Byte offset of the value within the log file.
    offset: u64,
    /// Length of the value in bytes.
    len: u32,
    /// Total length of the put record that produced this value.
    record_len: u64,
}

/// Log-structured on-disk map.
///
/// One directory per store. Reads go through a dedicated handle behind a
/// mutex so `get` can run under the queue's shared lock.
pub struct DiskMap {
    dir: PathBuf,
    log_path: PathBuf,
    writer: File,
    reader: Mutex<File>,
    index: HashMap<Vec<u8>, ValueLocation>,
    /// End offset of the log; the next record is appended here.
    tail: u64,
    /// Total bytes of records still referenced by the index.
    live_bytes: u64,
    open: bool,
}

/// Result of scanning the log on open.
struct ScanOutcome {
    index: HashMap<Vec<u8>, ValueLocation>,
    live_bytes: u64,
    /// Offset just past the last valid record.
    valid_len: u64,
}

impl DiskMap {
    /// Opens the store at `dir`, creating the directory and log file when
    /// absent. Rebuilds the index by replaying the log, truncating a torn
    /// tail record, and compacts when dead records outweigh live ones.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let dir_existed = dir.exists();
        fs::create_dir_all(&dir)?;
        if !dir_existed && let Some(parent) = dir.parent() {
            fsync_dir(parent)?;
        }

        let log_path = dir.join(LOG_FILE);
        let log_existed = log_path.exists();

        let scan = if log_existed {
            let file_len = fs::metadata(&log_path)?.len();
            let scan = scan_log(&log_path, file_len)?;
            if scan.valid_len < file_len {
                warn!(
                    path = %log_path.display(),
                    valid = scan.valid_len,
                    total = file_len,
                    "truncating torn tail record"
                );
                let file = OpenOptions::new().write(true).open(&log_path)?;
                file.set_len(scan.valid_len)?;
                fsync_file(&file)?;
            }
            scan
        } else {
            ScanOutcome {
                index: HashMap::new(),
                live_bytes: 0,
                valid_len: 0,
            }
        };

        let mut writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writer.seek(SeekFrom::End(0))?;
        if !log_existed {
            fsync_dir(&dir)?;
        }

        let reader = File::open(&log_path)?;

        let mut map = DiskMap {
            dir,
            log_path,
            writer,
            reader: Mutex::new(reader),
            tail: scan.valid_len,
            live_bytes: scan.live_bytes,
            index: scan.index,
            open: true,
        };

        debug!(
            path = %map.log_path.display(),
            keys = map.index.len(),
            live_bytes = map.live_bytes,
            dead_bytes = map.dead_bytes(),
            "opened disk map"
        );

        if map.dead_bytes() > map.live_bytes && map.dead_bytes() > 0 {
            map.compact()?;
        }

        Ok(map)
    }

    /// Bytes occupied by overwritten and deleted records.
    pub fn dead_bytes(&self) -> u64 {
        self.tail - self.live_bytes
    }

    /// Rewrites the log to contain only live records.
    ///
    /// Live values are copied into a fresh file which is fsynced and then
    /// atomically renamed over the log; the directory entry is fsynced so
    /// the rename survives a power loss.
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_open()?;

        let before = self.tail;
        let compact_path = self.dir.join(COMPACT_FILE);
        let mut new_index = HashMap::with_capacity(self.index.len());
        let mut offset = 0u64;

        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&compact_path)?;

            for (key, loc) in &self.index {
                let value = self.read_value(loc)?;
                let record = encode_record(OP_PUT, key, &value);
                tmp.write_all(&record)?;
                new_index.insert(
                    key.clone(),
                    ValueLocation {
                        offset: offset + (HEADER_LEN + key.len()) as u64,
                        len: loc.len,
                        record_len: record.len() as u64,
                    },
                );
                offset += record.len() as u64;
            }

            fsync_file(&tmp)?;
        }

        fs::rename(&compact_path, &self.log_path)?;
        fsync_dir(&self.dir)?;

        let mut writer = OpenOptions::new().append(true).open(&self.log_path)?;
        writer.seek(SeekFrom::End(0))?;
        self.writer = writer;
        self.reader = Mutex::new(File::open(&self.log_path)?);
        self.index = new_index;
        self.tail = offset;
        self.live_bytes = offset;

        debug!(before, after = offset, "compacted disk map");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open { Ok(()) } else { Err(MapError::Closed) }
    }

    fn read_value(&self, loc: &ValueLocation) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock();
        reader.seek(SeekFrom::Start(loc.offset))?;
        let mut value = vec![0u8; loc.len as usize];
        reader.read_exact(&mut value)?;
        Ok(value)
    }

    fn append_record(&mut self, record: &[u8]) -> Result<()> {
        self.writer.write_all(record)?;
        fsync_file(&self.writer)?;
        Ok(())
    }
}

impl KvMap for DiskMap {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_open()?;

        let record = encode_record(OP_PUT, key, value);
        self.append_record(&record)?;

        let record_len = record.len() as u64;
        let location = ValueLocation {
            offset: self.tail + (HEADER_LEN + key.len()) as u64,
            len: value.len() as u32,
            record_len,
        };
        if let Some(old) = self.index.insert(key.to_vec(), location) {
            self.live_bytes -= old.record_len;
        }
        self.live_bytes += record_len;
        self.tail += record_len;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let loc = *self.index.get(key).ok_or(MapError::NotFound)?;
        self.read_value(&loc)
    }

    fn del(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;

        // Absent keys need no tombstone; the index mirrors the live log.
        let Some(old) = self.index.remove(key) else {
            return Ok(());
        };

        let record = encode_record(OP_DEL, key, &[]);
        match self.append_record(&record) {
            Ok(()) => {
                self.live_bytes -= old.record_len;
                self.tail += record.len() as u64;
                Ok(())
            }
            Err(e) => {
                // The tombstone may not be durable; keep the key visible so
                // the caller can retry the delete.
                self.index.insert(key.to_vec(), old);
                Err(e)
            }
        }
    }

    fn keys(&self, visit: &mut dyn FnMut(&[u8]) -> anyhow::Result<()>) -> Result<()> {
        self.ensure_open()?;
        for key in self.index.keys() {
            visit(key).map_err(MapError::Visitor)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        fsync_file(&self.writer)?;
        self.open = false;
        Ok(())
    }
}

/// Blocks until the file's bytes and metadata have reached disk.
fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Blocks until the directory's entries have reached disk.
///
/// Creating, renaming, or deleting a file mutates the parent directory,
/// and syncing the file itself leaves that mutation in the page cache. A
/// power loss at the wrong moment would then resurrect a deleted log or
/// lose a freshly created one, so every entry change here is followed by
/// a sync on the directory handle.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn encode_record(op: u8, key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + key.len() + value.len() + TRAILER_LEN);
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Scans the log, rebuilding the index of live values.
///
/// Stops at the first unreadable record. If that record extends to the end
/// of the file it is a torn tail and `valid_len` marks where to truncate;
/// if valid-looking data follows it, the store is corrupt.
fn scan_log(path: &Path, file_len: u64) -> Result<ScanOutcome> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut index: HashMap<Vec<u8>, ValueLocation> = HashMap::new();
    let mut live_bytes = 0u64;
    let mut pos = 0u64;

    loop {
        let remaining = file_len - pos;
        if remaining == 0 {
            break;
        }
        if remaining < (HEADER_LEN + TRAILER_LEN) as u64 {
            // Not even a full header: torn tail.
            break;
        }

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        let op = header[0];
        let key_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as u64;
        let value_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as u64;

        let body_len = key_len + value_len;
        if (op != OP_PUT && op != OP_DEL) || body_len + TRAILER_LEN as u64 > remaining - HEADER_LEN as u64
        {
            // Header is garbage or the record runs past EOF: torn tail.
            break;
        }

        let mut body = vec![0u8; body_len as usize];
        reader.read_exact(&mut body)?;
        let mut crc_bytes = [0u8; TRAILER_LEN];
        reader.read_exact(&mut crc_bytes)?;

        let mut check = crc32c::crc32c(&header);
        check = crc32c::crc32c_append(check, &body);
        if check != u32::from_le_bytes(crc_bytes) {
            let record_end = pos + (HEADER_LEN + TRAILER_LEN) as u64 + body_len;
            if record_end < file_len {
                return Err(MapError::Corrupt(format!(
                    "checksum mismatch at offset {pos} with {} bytes beyond it",
                    file_len - record_end
                )));
            }
            // Checksum failed on the final record: torn tail.
            break;
        }

        let record_len = (HEADER_LEN + TRAILER_LEN) as u64 + body_len;
        let key = &body[..key_len as usize];
        match op {
            OP_PUT => {
                let location = ValueLocation {
                    offset: pos + (HEADER_LEN as u64 + key_len),
                    len: value_len as u32,
                    record_len,
                };
                if let Some(old) = index.insert(key.to_vec(), location) {
                    live_bytes -= old.record_len;
                }
                live_bytes += record_len;
            }
            _ => {
                if let Some(old) = index.remove(key) {
                    live_bytes -= old.record_len;
                }
            }
        }

        pos += record_len;
    }

    Ok(ScanOutcome {
        index,
        live_bytes,
        valid_len: pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    // ─── Basic operations ───

    #[test]
    fn open_creates_directory_and_log() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("store");

        let _map = DiskMap::open(&store_dir).unwrap();
        assert!(store_dir.join("data.log").exists());
    }

    #[test]
    fn put_get_del_roundtrip() {
        let dir = tempdir().unwrap();
        let mut map = DiskMap::open(dir.path()).unwrap();

        map.put(b"0", b"hello").unwrap();
        assert_eq!(map.get(b"0").unwrap(), b"hello");

        map.del(b"0").unwrap();
        assert!(matches!(map.get(b"0"), Err(MapError::NotFound)));
    }

    #[test]
    fn put_overwrites_previous_value() {
        let dir = tempdir().unwrap();
        let mut map = DiskMap::open(dir.path()).unwrap();

        map.put(b"k", b"old").unwrap();
        map.put(b"k", b"new value").unwrap();
        assert_eq!(map.get(b"k").unwrap(), b"new value");
    }

    #[test]
    fn del_missing_key_is_ok() {
        let dir = tempdir().unwrap();
        let mut map = DiskMap::open(dir.path()).unwrap();
        map.del(b"missing").unwrap();
    }

    #[test]
    fn empty_values_roundtrip() {
        let dir = tempdir().unwrap();
        let mut map = DiskMap::open(dir.path()).unwrap();
        map.put(b"k", b"").unwrap();
        assert_eq!(map.get(b"k").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn operations_after_close_fail() {
        let dir = tempdir().unwrap();
        let mut map = DiskMap::open(dir.path()).unwrap();
        map.put(b"k", b"v").unwrap();
        map.close().unwrap();

        assert!(matches!(map.put(b"k", b"v"), Err(MapError::Closed)));
        assert!(matches!(map.get(b"k"), Err(MapError::Closed)));
        assert!(matches!(map.del(b"k"), Err(MapError::Closed)));
        // Closing again is harmless.
        map.close().unwrap();
    }

    // ─── Durability across reopen ───

    #[test]
    fn reopen_recovers_live_entries() {
        let dir = tempdir().unwrap();

        {
            let mut map = DiskMap::open(dir.path()).unwrap();
            map.put(b"0", b"first").unwrap();
            map.put(b"1", b"second").unwrap();
            map.put(b"2", b"third").unwrap();
            map.del(b"1").unwrap();
            map.close().unwrap();
        }

        let map = DiskMap::open(dir.path()).unwrap();
        assert_eq!(map.get(b"0").unwrap(), b"first");
        assert!(matches!(map.get(b"1"), Err(MapError::NotFound)));
        assert_eq!(map.get(b"2").unwrap(), b"third");
    }

    #[test]
    fn reopen_without_close_recovers_entries() {
        let dir = tempdir().unwrap();

        {
            let mut map = DiskMap::open(dir.path()).unwrap();
            map.put(b"k", b"survives").unwrap();
            // Dropped without close, as after a crash.
        }

        let map = DiskMap::open(dir.path()).unwrap();
        assert_eq!(map.get(b"k").unwrap(), b"survives");
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();

        {
            let mut map = DiskMap::open(dir.path()).unwrap();
            map.put(b"0", b"complete").unwrap();
            map.close().unwrap();
        }

        // Simulate a crash mid-append: a partial header at the tail.
        let log_path = dir.path().join("data.log");
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[OP_PUT, 3, 0]).unwrap();
        drop(file);

        let map = DiskMap::open(dir.path()).unwrap();
        assert_eq!(map.get(b"0").unwrap(), b"complete");

        let mut count = 0;
        map.keys(&mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn torn_record_body_is_truncated_on_open() {
        let dir = tempdir().unwrap();

        {
            let mut map = DiskMap::open(dir.path()).unwrap();
            map.put(b"0", b"complete").unwrap();
            map.close().unwrap();
        }

        // A full header whose claimed body runs past the end of the file.
        let log_path = dir.path().join("data.log");
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        let mut partial = Vec::new();
        partial.push(OP_PUT);
        partial.extend_from_slice(&1u32.to_le_bytes());
        partial.extend_from_slice(&1000u32.to_le_bytes());
        partial.extend_from_slice(b"konly a little data");
        file.write_all(&partial).unwrap();
        drop(file);

        let map = DiskMap::open(dir.path()).unwrap();
        assert_eq!(map.get(b"0").unwrap(), b"complete");
    }

    #[test]
    fn mid_file_corruption_is_an_error() {
        let dir = tempdir().unwrap();

        {
            let mut map = DiskMap::open(dir.path()).unwrap();
            map.put(b"0", b"aaaaaaaa").unwrap();
            map.put(b"1", b"bbbbbbbb").unwrap();
            map.close().unwrap();
        }

        // Flip a byte inside the first record's value.
        let log_path = dir.path().join("data.log");
        let mut data = fs::read(&log_path).unwrap();
        data[HEADER_LEN + 1] ^= 0xff;
        fs::write(&log_path, &data).unwrap();

        assert!(matches!(
            DiskMap::open(dir.path()),
            Err(MapError::Corrupt(_))
        ));
    }

    // ─── Compaction ───

    #[test]
    fn compaction_preserves_live_entries() {
        let dir = tempdir().unwrap();
        let mut map = DiskMap::open(dir.path()).unwrap();

        for i in 0..50 {
            map.put(b"churn", format!("value {i}").as_bytes()).unwrap();
        }
        map.put(b"stable", b"kept").unwrap();

        assert!(map.dead_bytes() > 0);
        map.compact().unwrap();
        assert_eq!(map.dead_bytes(), 0);

        assert_eq!(map.get(b"churn").unwrap(), b"value 49");
        assert_eq!(map.get(b"stable").unwrap(), b"kept");

        // Writes keep working against the rewritten log.
        map.put(b"after", b"compaction").unwrap();
        assert_eq!(map.get(b"after").unwrap(), b"compaction");
    }

    #[test]
    fn open_compacts_mostly_dead_log() {
        let dir = tempdir().unwrap();

        {
            let mut map = DiskMap::open(dir.path()).unwrap();
            for i in 0..100 {
                map.put(b"k", format!("revision {i}").as_bytes()).unwrap();
            }
            map.close().unwrap();
        }

        let before = fs::metadata(dir.path().join("data.log")).unwrap().len();
        let map = DiskMap::open(dir.path()).unwrap();
        let after = fs::metadata(dir.path().join("data.log")).unwrap().len();

        assert!(after < before);
        assert_eq!(map.dead_bytes(), 0);
        assert_eq!(map.get(b"k").unwrap(), b"revision 99");
    }

    // ─── Properties ───

    proptest! {
        /// Any interleaving of puts and dels matches a HashMap model, both
        /// live and after a reopen.
        #[test]
        fn behaves_like_a_hashmap(
            ops in prop::collection::vec(
                (prop::bool::ANY, 0u8..6, prop::collection::vec(any::<u8>(), 0..32)),
                1..40,
            )
        ) {
            let dir = tempdir().unwrap();
            let mut map = DiskMap::open(dir.path()).unwrap();
            let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();

            for (is_put, key_byte, value) in &ops {
                let key = vec![*key_byte];
                if *is_put {
                    map.put(&key, value).unwrap();
                    model.insert(key, value.clone());
                } else {
                    map.del(&key).unwrap();
                    model.remove(&key);
                }
            }

            for (key, value) in &model {
                prop_assert_eq!(&map.get(key).unwrap(), value);
            }

            drop(map);
            let reopened = DiskMap::open(dir.path()).unwrap();
            let mut live = 0;
            reopened.keys(&mut |_| { live += 1; Ok(()) }).unwrap();
            prop_assert_eq!(live, model.len());
            for (key, value) in &model {
                prop_assert_eq!(&reopened.get(key).unwrap(), value);
            }
        }
    }
}
