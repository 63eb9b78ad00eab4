//! Durable overlay state
//!
//! Append-only log. Layout:
//!
//! ```text
//! header:  "MFOL" | version u32
//! record:  body_len u32 | body | crc32(body) u32
//! body:    opcode u8 | path_len u32 | path | extra (per opcode)
//! ```
//!
//! All integers are little endian. Recovery replays records until the first
//! one that is short or fails its checksum, then truncates the log there.
//! A failed append is rolled back to the last complete record; if that is
//! impossible the store refuses further records.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MergeFsError, Result};
use crate::overlay::{AttrOverride, CopyUpRecord, Origin, OverlayEntry};
use crate::path::VPath;
use crate::source::FileType;

const MAGIC: &[u8; 4] = b"MFOL";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

const OP_COPY_UP: u8 = 1;
const OP_TOMBSTONE: u8 = 2;
const OP_CLEAR: u8 = 3;
const OP_SET_ATTR: u8 = 4;
const OP_RENAME: u8 = 5;

const ORIGIN_CREATED: u32 = u32::MAX;
const ATTR_MODE: u8 = 0x1;
const ATTR_MTIME: u8 = 0x2;

/// Compaction kicks in past this many records
const COMPACT_MIN_RECORDS: u64 = 64;

/// One log record
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    CopyUp { path: VPath, record: CopyUpRecord },
    Tombstone { path: VPath },
    Clear { path: VPath },
    SetAttr { path: VPath, attr: AttrOverride },
    /// `path` shows what the read-only layers hold at `original`
    Rename { path: VPath, original: VPath },
}

/// Replayed overlay state, keyed by lookup key
#[derive(Debug, Default, Clone)]
pub struct MetadataState {
    pub entries: HashMap<String, (VPath, OverlayEntry)>,
    pub attrs: HashMap<String, (VPath, AttrOverride)>,
    /// Renamed path -> (renamed path, original lower path)
    pub renames: HashMap<String, (VPath, VPath)>,
}

impl MetadataState {
    pub fn live_count(&self) -> usize {
        self.entries.len() + self.attrs.len() + self.renames.len()
    }

    fn apply(&mut self, record: LogRecord, case_sensitive: bool) {
        match record {
            LogRecord::CopyUp { path, record } => {
                let key = path.key(case_sensitive);
                self.attrs.remove(&key);
                self.entries.insert(key, (path, OverlayEntry::CopiedUp(record)));
            }
            LogRecord::Tombstone { path } => {
                let key = path.key(case_sensitive);
                self.attrs.remove(&key);
                self.renames.remove(&key);
                self.entries.insert(key, (path, OverlayEntry::Tombstone));
            }
            LogRecord::Clear { path } => {
                let key = path.key(case_sensitive);
                self.entries.remove(&key);
                self.attrs.remove(&key);
                self.renames.remove(&key);
            }
            LogRecord::Rename { path, original } => {
                let key = path.key(case_sensitive);
                if path == original {
                    self.renames.remove(&key);
                } else {
                    self.renames.insert(key, (path, original));
                }
            }
            LogRecord::SetAttr { path, attr } => {
                let key = path.key(case_sensitive);
                if attr.is_empty() {
                    self.attrs.remove(&key);
                } else {
                    self.attrs.insert(key, (path, attr));
                }
            }
        }
    }

    /// Records reproducing this state
    fn snapshot(&self) -> Vec<LogRecord> {
        let mut records = Vec::with_capacity(self.live_count());
        for (path, entry) in self.entries.values() {
            match entry {
                OverlayEntry::CopiedUp(record) => records.push(LogRecord::CopyUp {
                    path: path.clone(),
                    record: record.clone(),
                }),
                OverlayEntry::Tombstone => records.push(LogRecord::Tombstone { path: path.clone() }),
                OverlayEntry::Unmodified => {}
            }
        }
        for (path, attr) in self.attrs.values() {
            records.push(LogRecord::SetAttr {
                path: path.clone(),
                attr: *attr,
            });
        }
        for (path, original) in self.renames.values() {
            records.push(LogRecord::Rename {
                path: path.clone(),
                original: original.clone(),
            });
        }
        // Shallow paths first keeps the log readable
        records.sort_by_key(|r| r.path().depth());
        records
    }
}

impl LogRecord {
    pub fn path(&self) -> &VPath {
        match self {
            LogRecord::CopyUp { path, .. }
            | LogRecord::Tombstone { path }
            | LogRecord::Clear { path }
            | LogRecord::SetAttr { path, .. }
            | LogRecord::Rename { path, .. } => path,
        }
    }

    /// Encode as a framed record
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(64);
        let (opcode, path) = match self {
            LogRecord::CopyUp { path, .. } => (OP_COPY_UP, path),
            LogRecord::Tombstone { path } => (OP_TOMBSTONE, path),
            LogRecord::Clear { path } => (OP_CLEAR, path),
            LogRecord::SetAttr { path, .. } => (OP_SET_ATTR, path),
            LogRecord::Rename { path, .. } => (OP_RENAME, path),
        };
        body.put_u8(opcode);
        put_str(&mut body, path.as_str());

        match self {
            LogRecord::CopyUp { record, .. } => {
                put_str(&mut body, record.overlay_path.as_str());
                body.put_u8(match record.kind {
                    FileType::File => 0,
                    FileType::Directory => 1,
                });
                body.put_u32_le(match record.origin {
                    Origin::Layer(index) => index,
                    Origin::Created => ORIGIN_CREATED,
                });
                body.put_u64_le(record.size);
                put_time(&mut body, record.mtime);
                body.put_u32_le(record.checksum);
                body.put_u32_le(record.mode);
            }
            LogRecord::SetAttr { attr, .. } => {
                let mut flags = 0;
                if attr.mode.is_some() {
                    flags |= ATTR_MODE;
                }
                if attr.mtime.is_some() {
                    flags |= ATTR_MTIME;
                }
                body.put_u8(flags);
                body.put_u32_le(attr.mode.unwrap_or(0));
                put_time(&mut body, attr.mtime.unwrap_or(UNIX_EPOCH));
            }
            LogRecord::Rename { original, .. } => put_str(&mut body, original.as_str()),
            LogRecord::Tombstone { .. } | LogRecord::Clear { .. } => {}
        }

        let mut frame = BytesMut::with_capacity(body.len() + 8);
        frame.put_u32_le(body.len() as u32);
        frame.extend_from_slice(&body);
        frame.put_u32_le(crc32fast::hash(&body));
        frame
    }

    /// Decode a record body (without length prefix and checksum)
    fn decode(mut body: &[u8]) -> Option<LogRecord> {
        if body.remaining() < 1 {
            return None;
        }
        let opcode = body.get_u8();
        let path = VPath::parse(&get_str(&mut body)?).ok()?;

        let record = match opcode {
            OP_COPY_UP => {
                let overlay_path = VPath::parse(&get_str(&mut body)?).ok()?;
                if body.remaining() < 1 + 4 + 8 + 12 + 4 + 4 {
                    return None;
                }
                let kind = match body.get_u8() {
                    0 => FileType::File,
                    1 => FileType::Directory,
                    _ => return None,
                };
                let origin = match body.get_u32_le() {
                    ORIGIN_CREATED => Origin::Created,
                    index => Origin::Layer(index),
                };
                let size = body.get_u64_le();
                let mtime = get_time(&mut body)?;
                let checksum = body.get_u32_le();
                let mode = body.get_u32_le();
                LogRecord::CopyUp {
                    path,
                    record: CopyUpRecord {
                        overlay_path,
                        origin,
                        kind,
                        size,
                        mtime,
                        checksum,
                        mode,
                    },
                }
            }
            OP_TOMBSTONE => LogRecord::Tombstone { path },
            OP_CLEAR => LogRecord::Clear { path },
            OP_SET_ATTR => {
                if body.remaining() < 1 + 4 + 12 {
                    return None;
                }
                let flags = body.get_u8();
                let mode = body.get_u32_le();
                let mtime = get_time(&mut body)?;
                LogRecord::SetAttr {
                    path,
                    attr: AttrOverride {
                        mode: ((flags & ATTR_MODE) != 0).then_some(mode),
                        mtime: ((flags & ATTR_MTIME) != 0).then_some(mtime),
                    },
                }
            }
            OP_RENAME => {
                let original = VPath::parse(&get_str(&mut body)?).ok()?;
                LogRecord::Rename { path, original }
            }
            _ => return None,
        };
        // Trailing garbage inside a checksummed body means a format mismatch
        if body.has_remaining() {
            return None;
        }
        Some(record)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    let s = std::str::from_utf8(&buf[..len]).ok()?.to_string();
    buf.advance(len);
    Some(s)
}

fn put_time(buf: &mut BytesMut, t: SystemTime) {
    let (secs, nanos) = match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    };
    buf.put_i64_le(secs);
    buf.put_u32_le(nanos);
}

fn get_time(buf: &mut &[u8]) -> Option<SystemTime> {
    if buf.remaining() < 12 {
        return None;
    }
    let secs = buf.get_i64_le();
    let nanos = buf.get_u32_le();
    if nanos >= 1_000_000_000 {
        return None;
    }
    if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::new(secs as u64, nanos))
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))?
            .checked_add(Duration::from_nanos(nanos as u64))
    }
}

fn header() -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(MAGIC);
    h[4..].copy_from_slice(&VERSION.to_le_bytes());
    h
}

/// Outcome of scanning a log image
struct Replay {
    state: MetadataState,
    records: u64,
    /// Byte offset just past the last good record
    valid_end: usize,
    corrupt: bool,
}

fn replay(data: &[u8], case_sensitive: bool) -> Replay {
    let mut state = MetadataState::default();
    let mut records = 0;
    let mut offset = HEADER_LEN;
    let mut corrupt = false;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < 4 {
            break;
        }
        let body_len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let frame_len = 4 + body_len + 4;
        if rest.len() < frame_len {
            // Short trailing record from an interrupted append
            break;
        }
        let body = &rest[4..4 + body_len];
        let stored = u32::from_le_bytes([
            rest[4 + body_len],
            rest[5 + body_len],
            rest[6 + body_len],
            rest[7 + body_len],
        ]);
        let record = if crc32fast::hash(body) == stored {
            LogRecord::decode(body)
        } else {
            None
        };
        let Some(record) = record else {
            corrupt = true;
            break;
        };
        state.apply(record, case_sensitive);
        records += 1;
        offset += frame_len;
    }

    Replay {
        state,
        records,
        valid_end: offset,
        corrupt,
    }
}

struct LogFile {
    file: File,
    records: u64,
    /// End of the last complete record
    len: u64,
    /// A failed append could not be rolled back
    poisoned: bool,
}

impl LogFile {
    fn check_usable(&self, path: &Path) -> Result<()> {
        if self.poisoned {
            return Err(MergeFsError::MetadataCorrupt(format!(
                "{}: an earlier append could not be rolled back",
                path.display()
            )));
        }
        Ok(())
    }
}

/// Per-mount durable record of overlay state
pub struct MetadataStore {
    path: PathBuf,
    case_sensitive: bool,
    log: Mutex<LogFile>,
}

impl MetadataStore {
    /// Open or create the log at `path` and replay it
    pub fn open(path: impl AsRef<Path>, case_sensitive: bool) -> Result<(Self, MetadataState)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (state, records, len) = if data.len() < HEADER_LEN {
            if !data.is_empty() {
                warn!("Metadata log {} has a torn header, starting fresh", path.display());
            }
            let mut file = File::create(&path)?;
            file.write_all(&header())?;
            file.sync_all()?;
            sync_parent(&path)?;
            (MetadataState::default(), 0, HEADER_LEN as u64)
        } else {
            if &data[..4] != MAGIC {
                return Err(MergeFsError::MetadataCorrupt(format!(
                    "{}: not a mergefs metadata log",
                    path.display()
                )));
            }
            let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
            if version != VERSION {
                return Err(MergeFsError::MetadataCorrupt(format!(
                    "{}: unsupported log version {}",
                    path.display(),
                    version
                )));
            }

            let replayed = replay(&data, case_sensitive);
            if replayed.valid_end < data.len() {
                if replayed.corrupt {
                    let err = MergeFsError::MetadataCorrupt(format!(
                        "{}: unreadable record at offset {}",
                        path.display(),
                        replayed.valid_end
                    ));
                    warn!("{}; truncating", err);
                } else {
                    debug!(
                        "Discarding {} byte partial record at end of {}",
                        data.len() - replayed.valid_end,
                        path.display()
                    );
                }
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(replayed.valid_end as u64)?;
                file.sync_all()?;
            }
            (replayed.state, replayed.records, replayed.valid_end as u64)
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        let store = Self {
            path,
            case_sensitive,
            log: Mutex::new(LogFile {
                file,
                records,
                len,
                poisoned: false,
            }),
        };

        let live = state.live_count() as u64;
        if records >= COMPACT_MIN_RECORDS && records > live * 2 {
            store.compact(&state)?;
        }

        info!(
            "Opened metadata log {} ({} records, {} live)",
            store.path.display(),
            records,
            live
        );
        Ok((store, state))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Records currently in the log
    pub fn record_count(&self) -> u64 {
        self.log.lock().records
    }

    /// Append one record. Not durable until `flush`.
    ///
    /// Bytes past the last complete record are cut off first, so a torn
    /// frame never hides the records written after it.
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let frame = record.encode();
        let mut log = self.log.lock();
        log.check_usable(&self.path)?;

        let actual = log.file.metadata()?.len();
        if actual != log.len {
            warn!(
                "Metadata log {} is {} bytes, expected {}; cutting back",
                self.path.display(),
                actual,
                log.len
            );
            if let Err(e) = log.file.set_len(log.len) {
                log.poisoned = true;
                return Err(e.into());
            }
        }

        if let Err(e) = log.file.write_all(&frame) {
            warn!("Append to {} failed: {}", self.path.display(), e);
            if let Err(rollback) = log.file.set_len(log.len) {
                warn!(
                    "Could not roll back {}: {}; refusing further records",
                    self.path.display(),
                    rollback
                );
                log.poisoned = true;
            }
            return Err(e.into());
        }
        log.len += frame.len() as u64;
        log.records += 1;
        Ok(())
    }

    pub fn record_rename(&self, path: &VPath, original: &VPath) -> Result<()> {
        self.append(&LogRecord::Rename {
            path: path.clone(),
            original: original.clone(),
        })
    }

    pub fn record_copy_up(&self, path: &VPath, record: &CopyUpRecord) -> Result<()> {
        self.append(&LogRecord::CopyUp {
            path: path.clone(),
            record: record.clone(),
        })
    }

    pub fn record_tombstone(&self, path: &VPath) -> Result<()> {
        self.append(&LogRecord::Tombstone { path: path.clone() })
    }

    pub fn clear(&self, path: &VPath) -> Result<()> {
        self.append(&LogRecord::Clear { path: path.clone() })
    }

    pub fn record_attr(&self, path: &VPath, attr: AttrOverride) -> Result<()> {
        self.append(&LogRecord::SetAttr {
            path: path.clone(),
            attr,
        })
    }

    /// Make every appended record durable
    pub fn flush(&self) -> Result<()> {
        let log = self.log.lock();
        log.check_usable(&self.path)?;
        log.file.sync_data()?;
        Ok(())
    }

    /// Rewrite the log as a snapshot of `state`. Callers must not append
    /// concurrently with building `state`.
    pub fn compact(&self, state: &MetadataState) -> Result<()> {
        let records = state.snapshot();
        let mut tmp_name = OsString::from(self.path.as_os_str());
        tmp_name.push(".compact");
        let tmp_path = PathBuf::from(tmp_name);

        let mut log = self.log.lock();
        let before = log.records;
        let image_len;
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut image = BytesMut::with_capacity(HEADER_LEN + records.len() * 64);
            image.put_slice(&header());
            for record in &records {
                image.extend_from_slice(&record.encode());
            }
            tmp.write_all(&image)?;
            tmp.sync_all()?;
            image_len = image.len() as u64;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent(&self.path)?;

        log.file = OpenOptions::new().append(true).open(&self.path)?;
        log.records = records.len() as u64;
        log.len = image_len;
        log.poisoned = false;
        info!(
            "Compacted metadata log {}: {} -> {} records",
            self.path.display(),
            before,
            log.records
        );
        Ok(())
    }
}

fn sync_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vp(s: &str) -> VPath {
        VPath::parse(s).unwrap()
    }

    fn copy_up_record(path: &str) -> CopyUpRecord {
        CopyUpRecord {
            overlay_path: vp(path),
            origin: Origin::Layer(1),
            kind: FileType::File,
            size: 42,
            mtime: UNIX_EPOCH + Duration::new(1_700_000_000, 123),
            checksum: 0xdead_beef,
            mode: 0o640,
        }
    }

    #[test]
    fn test_fresh_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let (store, state) = MetadataStore::open(dir.path().join("m.log"), true).unwrap();
        assert_eq!(state.live_count(), 0);
        assert_eq!(store.record_count(), 0);
        assert_eq!(fs::read(dir.path().join("m.log")).unwrap(), header());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        {
            let (store, _) = MetadataStore::open(&log, true).unwrap();
            store.record_copy_up(&vp("/a"), &copy_up_record("/a")).unwrap();
            store.record_tombstone(&vp("/b")).unwrap();
            store
                .record_attr(
                    &vp("/c"),
                    AttrOverride {
                        mode: Some(0o600),
                        mtime: None,
                    },
                )
                .unwrap();
            store.record_tombstone(&vp("/gone")).unwrap();
            store.clear(&vp("/gone")).unwrap();
            store.flush().unwrap();
        }

        let (store, state) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(store.record_count(), 5);
        assert_eq!(
            state.entries.get("/a").map(|(_, e)| e.clone()),
            Some(OverlayEntry::CopiedUp(copy_up_record("/a")))
        );
        assert_eq!(
            state.entries.get("/b").map(|(_, e)| e.clone()),
            Some(OverlayEntry::Tombstone)
        );
        assert!(!state.entries.contains_key("/gone"));
        assert_eq!(state.attrs.get("/c").unwrap().1.mode, Some(0o600));
    }

    #[test]
    fn test_truncated_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        {
            let (store, _) = MetadataStore::open(&log, true).unwrap();
            store.record_copy_up(&vp("/a"), &copy_up_record("/a")).unwrap();
            store.record_tombstone(&vp("/b")).unwrap();
        }
        let full = fs::read(&log).unwrap();
        let (_, before) = MetadataStore::open(&log, true).unwrap();

        // Append half of another record, as if the process died mid-write
        let partial = LogRecord::Tombstone { path: vp("/c") }.encode();
        let mut torn = full.clone();
        torn.extend_from_slice(&partial[..partial.len() / 2]);
        fs::write(&log, &torn).unwrap();

        let (store, after) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(store.record_count(), 2);
        assert_eq!(after.entries, before.entries);
        assert_eq!(fs::read(&log).unwrap(), full);
    }

    #[test]
    fn test_checksum_mismatch_truncates() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        {
            let (store, _) = MetadataStore::open(&log, true).unwrap();
            store.record_tombstone(&vp("/keep")).unwrap();
            store.record_tombstone(&vp("/flipped")).unwrap();
        }
        let mut data = fs::read(&log).unwrap();
        let last = data.len() - 6;
        data[last] ^= 0xff;
        fs::write(&log, &data).unwrap();

        let (store, state) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(store.record_count(), 1);
        assert!(state.entries.contains_key("/keep"));
        assert!(!state.entries.contains_key("/flipped"));
    }

    #[test]
    fn test_foreign_file_rejected() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        fs::write(&log, b"definitely not a log").unwrap();
        assert!(matches!(
            MetadataStore::open(&log, true),
            Err(MergeFsError::MetadataCorrupt(_))
        ));
    }

    #[test]
    fn test_compaction_on_open() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        {
            let (store, _) = MetadataStore::open(&log, true).unwrap();
            for _ in 0..50 {
                store.record_tombstone(&vp("/churn")).unwrap();
                store.clear(&vp("/churn")).unwrap();
            }
            store.record_tombstone(&vp("/kept")).unwrap();
        }
        let (store, state) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(store.record_count(), 1);
        assert!(state.entries.contains_key("/kept"));

        // The compacted log replays to the same state
        drop(store);
        let (_, again) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(again.entries, state.entries);
    }

    #[test]
    fn test_case_folded_keys() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        {
            let (store, _) = MetadataStore::open(&log, false).unwrap();
            store.record_tombstone(&vp("/Docs/A.TXT")).unwrap();
        }
        let (_, state) = MetadataStore::open(&log, false).unwrap();
        let (display, _) = state.entries.get("/docs/a.txt").unwrap();
        assert_eq!(display.as_str(), "/Docs/A.TXT");
    }

    #[test]
    fn test_append_cuts_torn_tail_before_writing() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        let (store, _) = MetadataStore::open(&log, true).unwrap();
        store.record_tombstone(&vp("/before")).unwrap();

        // Half a frame lands after the last good record
        let partial = LogRecord::Tombstone { path: vp("/torn") }.encode();
        let mut raw = OpenOptions::new().append(true).open(&log).unwrap();
        raw.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(raw);

        store.record_tombstone(&vp("/after")).unwrap();
        store.flush().unwrap();
        drop(store);

        let (store, state) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(store.record_count(), 2);
        assert!(state.entries.contains_key("/before"));
        assert!(state.entries.contains_key("/after"));
        assert!(!state.entries.contains_key("/torn"));
    }

    #[test]
    fn test_failed_append_refuses_further_records() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        let (store, _) = MetadataStore::open(&log, true).unwrap();
        store.record_tombstone(&vp("/kept")).unwrap();

        // A handle that can neither write nor truncate
        store.log.lock().file = File::open(&log).unwrap();
        assert!(store.record_tombstone(&vp("/lost")).is_err());
        assert!(matches!(
            store.record_tombstone(&vp("/later")),
            Err(MergeFsError::MetadataCorrupt(_))
        ));
        assert!(matches!(store.flush(), Err(MergeFsError::MetadataCorrupt(_))));
        drop(store);

        let (_, state) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(state.entries.len(), 1);
        assert!(state.entries.contains_key("/kept"));
    }

    #[test]
    fn test_rename_records_replay() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("m.log");
        {
            let (store, _) = MetadataStore::open(&log, true).unwrap();
            store.record_rename(&vp("/new"), &vp("/old")).unwrap();
            store.record_rename(&vp("/moved"), &vp("/orig")).unwrap();
            store.record_tombstone(&vp("/moved")).unwrap();
            store.record_rename(&vp("/back"), &vp("/x")).unwrap();
            store.record_rename(&vp("/back"), &vp("/back")).unwrap();
            store.flush().unwrap();
        }
        let (_, state) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(state.renames.len(), 1);
        let (shown, original) = state.renames.get("/new").unwrap();
        assert_eq!(shown.as_str(), "/new");
        assert_eq!(original.as_str(), "/old");

        // Compaction carries the map over
        let (store, state) = MetadataStore::open(&log, true).unwrap();
        store.compact(&state).unwrap();
        drop(store);
        let (_, again) = MetadataStore::open(&log, true).unwrap();
        assert_eq!(again.renames, state.renames);
    }

    #[test]
    fn test_pre_epoch_time_roundtrip() {
        let mut buf = BytesMut::new();
        let t = UNIX_EPOCH - Duration::new(10, 250);
        put_time(&mut buf, t);
        let mut slice = &buf[..];
        assert_eq!(get_time(&mut slice), Some(t));
    }
}
