//! Persistent operational log backed by segmented files
//!
//! Entries are grouped into fixed-size segment files; each entry is framed
//! as `[logId:8][length:4][requestType:4][payload][length:8][magic:8]` in
//! big-endian, so a truncated or corrupted tail is detectable by a magic
//! mismatch. An info file records the active segment and the prune
//! watermark and is rewritten (write + fsync) before the active segment
//! rotates; it is the durable source of truth for where replay resumes.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, warn};

use tessera_api::log::{LogId, LogRequest, LogRequestRegistry, OperationLogEntry};

use super::{LogIdStatus, OperationLog, OplogError};

/// Bit pattern `0101...` marking the end of every well-formed entry
const MAGIC: u64 = 0x5555_5555_5555_5555;

/// Default number of entries per segment file
pub const DEFAULT_ENTRIES_PER_SEGMENT: u64 = 16 * 1024;

/// Fixed framing overhead around the payload, in bytes
const FRAME_OVERHEAD: u64 = 8 + 4 + 4 + 8 + 8;

const INFO_FILE: &str = "oplog.opl";
const INFO_VERSION: u32 = 0;

fn segment_file_name(segment: u32) -> String {
    format!("oplog_{}.opl", segment)
}

/// Durable pointers of the log: active segment, first retained segment and
/// prune watermark
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OplogInfo {
    current_segment: u32,
    first_segment: u32,
    keep_until: u64,
}

impl OplogInfo {
    fn read(path: &Path) -> Result<Self, OplogError> {
        let mut file = File::open(path)?;
        let version = file.read_u32::<BigEndian>()?;
        if version != INFO_VERSION {
            return Err(OplogError::CorruptInfo(format!(
                "unsupported version {}",
                version
            )));
        }
        Ok(Self {
            current_segment: file.read_u32::<BigEndian>()?,
            first_segment: file.read_u32::<BigEndian>()?,
            keep_until: file.read_u64::<BigEndian>()?,
        })
    }

    /// Rewrite the info file durably; must complete before any rotation
    /// becomes visible
    fn write(&self, path: &Path) -> Result<(), OplogError> {
        let mut file = File::create(path)?;
        file.write_u32::<BigEndian>(INFO_VERSION)?;
        file.write_u32::<BigEndian>(self.current_segment)?;
        file.write_u32::<BigEndian>(self.first_segment)?;
        file.write_u64::<BigEndian>(self.keep_until)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

struct LogInner {
    info: OplogInfo,
    writer: File,
    last_id: u64,
    leader: bool,
    term: u64,
}

/// Segmented on-disk operational log
///
/// Appends are serialized by a single lock (single-writer discipline);
/// readers take the same lock and therefore always observe a consistent
/// prefix.
pub struct PersistentOperationalLog {
    dir: PathBuf,
    registry: Arc<LogRequestRegistry>,
    entries_per_segment: u64,
    inner: Mutex<LogInner>,
}

impl PersistentOperationalLog {
    /// Open (or create) the log in `dir` with the default segment size
    pub fn open(
        dir: impl Into<PathBuf>,
        registry: Arc<LogRequestRegistry>,
    ) -> Result<Self, OplogError> {
        Self::open_with_segment_size(dir, registry, DEFAULT_ENTRIES_PER_SEGMENT)
    }

    /// Open (or create) the log with a configured segment size
    pub fn open_with_segment_size(
        dir: impl Into<PathBuf>,
        registry: Arc<LogRequestRegistry>,
        entries_per_segment: u64,
    ) -> Result<Self, OplogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let info_path = dir.join(INFO_FILE);
        let log_info = if info_path.exists() {
            OplogInfo::read(&info_path)?
        } else {
            let fresh = OplogInfo {
                current_segment: 0,
                first_segment: 0,
                keep_until: 0,
            };
            fresh.write(&info_path)?;
            fresh
        };

        let last_id = Self::read_last_id(&dir, &log_info, &registry, entries_per_segment)?;

        let segment_path = dir.join(segment_file_name(log_info.current_segment));
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)?;

        info!(
            dir = %dir.display(),
            segment = log_info.current_segment,
            last_id,
            "operational log opened"
        );

        Ok(Self {
            dir,
            registry,
            entries_per_segment,
            inner: Mutex::new(LogInner {
                info: log_info,
                writer,
                last_id,
                leader: false,
                term: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the local node currently believes it leads the group
    pub fn is_leader(&self) -> bool {
        self.lock().leader
    }

    /// Term last announced through `set_leader`
    pub fn term(&self) -> u64 {
        self.lock().term
    }

    /// Segment holding `id`; ids start at 1, segment `s` holds
    /// `[s * entries + 1, (s + 1) * entries]`
    fn segment_for(&self, id: u64) -> u32 {
        ((id - 1) / self.entries_per_segment) as u32
    }

    fn segment_path(&self, segment: u32) -> PathBuf {
        self.dir.join(segment_file_name(segment))
    }

    /// Recompute the last durable id from the tail of the active segment
    ///
    /// A missing or mismatching magic trailer means the tail was torn and
    /// triggers a full scan-and-rebuild of the segment.
    fn read_last_id(
        dir: &Path,
        log_info: &OplogInfo,
        registry: &LogRequestRegistry,
        entries_per_segment: u64,
    ) -> Result<u64, OplogError> {
        let path = dir.join(segment_file_name(log_info.current_segment));
        if !path.exists() {
            return Ok(log_info.current_segment as u64 * entries_per_segment);
        }
        let len = fs::metadata(&path)?.len();
        if len == 0 {
            return Ok(log_info.current_segment as u64 * entries_per_segment);
        }

        let tail = || -> std::io::Result<Option<u64>> {
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::End(-8))?;
            let magic = file.read_u64::<BigEndian>()?;
            if magic != MAGIC {
                return Ok(None);
            }
            file.seek(SeekFrom::End(-16))?;
            let length = file.read_u64::<BigEndian>()?;
            let entry_len = length + FRAME_OVERHEAD;
            if entry_len > len {
                return Ok(None);
            }
            file.seek(SeekFrom::End(-(entry_len as i64)))?;
            Ok(Some(file.read_u64::<BigEndian>()?))
        };

        match tail() {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Self::recover(dir, log_info, registry, entries_per_segment),
            Err(_) => Self::recover(dir, log_info, registry, entries_per_segment),
        }
    }

    /// Copy all well-formed leading entries of the active segment into a
    /// fresh file and discard the damaged tail; returns the last good id
    fn recover(
        dir: &Path,
        log_info: &OplogInfo,
        registry: &LogRequestRegistry,
        entries_per_segment: u64,
    ) -> Result<u64, OplogError> {
        let path = dir.join(segment_file_name(log_info.current_segment));
        let temp_path = path.with_extension("opl_temp");

        warn!(
            segment = log_info.current_segment,
            "damaged oplog tail detected, rebuilding segment"
        );

        let mut last_id = log_info.current_segment as u64 * entries_per_segment;
        {
            let mut reader = File::open(&path)?;
            let mut temp = File::create(&temp_path)?;
            while let Some(entry) = read_record(&mut reader, registry) {
                write_record(&mut temp, entry.log_id.0, &entry.request)?;
                last_id = entry.log_id.0;
            }
            temp.flush()?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;

        info!(last_id, "oplog segment rebuilt");
        Ok(last_id)
    }

    /// Switch the write stream to the segment holding `id`
    ///
    /// The info file is rewritten and fsynced before the new segment is
    /// opened, so a crash between the two steps replays from valid state.
    fn rotate_to(&self, inner: &mut LogInner, segment: u32) -> Result<(), OplogError> {
        inner.info.current_segment = segment;
        inner.info.write(&self.dir.join(INFO_FILE))?;
        inner.writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.segment_path(segment))?;
        debug!(segment, "oplog rotated to new segment");
        Ok(())
    }

    fn write_at(&self, inner: &mut LogInner, id: u64, request: &LogRequest) -> Result<(), OplogError> {
        let segment = self.segment_for(id);
        if segment != inner.info.current_segment {
            self.rotate_to(inner, segment)?;
        }
        write_record(&mut inner.writer, id, request)?;
        inner.writer.flush()?;
        inner.writer.sync_data()?;
        inner.last_id = id;
        Ok(())
    }

    /// First id still retained, or `last_id + 1` when nothing is retained
    fn oldest_retained_id(&self, inner: &LogInner) -> Result<u64, OplogError> {
        for segment in inner.info.first_segment..=inner.info.current_segment {
            let path = self.segment_path(segment);
            if !path.exists() {
                continue;
            }
            let mut reader = File::open(&path)?;
            if let Some(entry) = read_record(&mut reader, &self.registry) {
                return Ok(entry.log_id.0);
            }
        }
        Ok(inner.last_id + 1)
    }

    /// Rewrite `segment` keeping only entries with ids up to `until`
    fn truncate_segment(&self, segment: u32, until: u64) -> Result<(), OplogError> {
        let path = self.segment_path(segment);
        let temp_path = path.with_extension("opl_temp");
        {
            let mut reader = File::open(&path)?;
            let mut temp = File::create(&temp_path)?;
            while let Some(entry) = read_record(&mut reader, &self.registry) {
                if entry.log_id.0 > until {
                    break;
                }
                write_record(&mut temp, entry.log_id.0, &entry.request)?;
            }
            temp.flush()?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

impl OperationLog for PersistentOperationalLog {
    fn log(&self, request: LogRequest) -> Result<LogId, OplogError> {
        let mut inner = self.lock();
        if !inner.leader {
            debug!("allocating a log id on a node not marked leader");
        }
        let id = inner.last_id + 1;
        self.write_at(&mut inner, id, &request)?;
        Ok(LogId(id))
    }

    fn log_received(&self, log_id: LogId, request: LogRequest) -> Result<bool, OplogError> {
        let mut inner = self.lock();
        if log_id.0 <= inner.last_id {
            // already received, just a duplicate
            return Ok(true);
        }
        if log_id.0 > inner.last_id + 1 {
            return Ok(false);
        }
        self.write_at(&mut inner, log_id.0, &request)?;
        Ok(true)
    }

    fn last_persistent_log(&self) -> LogId {
        LogId(self.lock().last_id)
    }

    fn iterate(&self, from: LogId, to: LogId) -> Result<Vec<OperationLogEntry>, OplogError> {
        let inner = self.lock();
        let from = from.0.max(1);
        let to = to.0.min(inner.last_id);
        let mut entries = Vec::new();
        if from > to {
            return Ok(entries);
        }

        for segment in inner.info.first_segment..=inner.info.current_segment {
            let segment_first = segment as u64 * self.entries_per_segment + 1;
            let segment_last = (segment as u64 + 1) * self.entries_per_segment;
            if segment_last < from || segment_first > to {
                continue;
            }
            let path = self.segment_path(segment);
            if !path.exists() {
                continue;
            }
            let mut reader = File::open(&path)?;
            while let Some(entry) = read_record(&mut reader, &self.registry) {
                if entry.log_id.0 > to {
                    return Ok(entries);
                }
                if entry.log_id.0 >= from {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    fn remove_after(&self, log_id: LogId) -> Result<LogIdStatus, OplogError> {
        let mut inner = self.lock();
        if log_id.0 > inner.last_id {
            return Ok(LogIdStatus::Future);
        }
        if log_id.0 == inner.last_id {
            return Ok(LogIdStatus::Present);
        }

        let oldest = self.oldest_retained_id(&inner)?;
        if log_id.0 < oldest {
            // the requested tail starts before anything this node retains;
            // drop every segment and restart the sequence at the given id
            for segment in inner.info.first_segment..=inner.info.current_segment {
                let _ = fs::remove_file(self.segment_path(segment));
            }
            inner.last_id = log_id.0;
            let segment = self.segment_for(log_id.0 + 1);
            inner.info.first_segment = segment;
            self.rotate_to(&mut inner, segment)?;
            return Ok(LogIdStatus::TooOld);
        }

        let boundary = self.segment_for(log_id.0);
        for segment in (boundary + 1)..=inner.info.current_segment {
            let _ = fs::remove_file(self.segment_path(segment));
        }
        self.truncate_segment(boundary, log_id.0)?;
        inner.last_id = log_id.0;
        self.rotate_to(&mut inner, boundary)?;
        info!(until = log_id.0, "oplog truncated");
        Ok(LogIdStatus::Present)
    }

    fn cut_until(&self, log_id: LogId) -> Result<(), OplogError> {
        let mut inner = self.lock();
        inner.info.keep_until = log_id.0;

        // segments whose whole id range sits below the watermark
        let mut removable = Vec::new();
        for segment in inner.info.first_segment..inner.info.current_segment {
            if (segment as u64 + 1) * self.entries_per_segment <= log_id.0 {
                removable.push(self.segment_path(segment));
                inner.info.first_segment = segment + 1;
            }
        }
        inner.info.write(&self.dir.join(INFO_FILE))?;
        drop(inner);

        if !removable.is_empty() {
            std::thread::spawn(move || {
                for path in removable {
                    if let Err(e) = fs::remove_file(&path) {
                        debug!(path = %path.display(), "could not prune oplog segment: {}", e);
                    }
                }
            });
        }
        Ok(())
    }

    fn set_leader(&self, leader: bool, term: u64) {
        let mut inner = self.lock();
        inner.leader = leader;
        inner.term = term;
    }
}

/// Write one framed entry
fn write_record(writer: &mut impl Write, id: u64, request: &LogRequest) -> Result<(), OplogError> {
    let mut payload = Vec::with_capacity(64);
    request.encode_payload(&mut payload);
    let length = payload.len() as u32 + 4;

    writer.write_u64::<BigEndian>(id)?;
    writer.write_u32::<BigEndian>(length)?;
    writer.write_u32::<BigEndian>(request.request_type())?;
    writer.write_all(&payload)?;
    writer.write_u64::<BigEndian>(length as u64)?;
    writer.write_u64::<BigEndian>(MAGIC)?;
    Ok(())
}

/// Read one framed entry; `None` means clean end of file or a damaged tail
fn read_record(reader: &mut impl Read, registry: &LogRequestRegistry) -> Option<OperationLogEntry> {
    let id = reader.read_u64::<BigEndian>().ok()?;
    let length = reader.read_u32::<BigEndian>().ok()?;
    if length < 4 {
        return None;
    }
    let request_type = reader.read_u32::<BigEndian>().ok()?;
    let mut payload = vec![0u8; (length - 4) as usize];
    reader.read_exact(&mut payload).ok()?;
    let length_repeat = reader.read_u64::<BigEndian>().ok()?;
    let magic = reader.read_u64::<BigEndian>().ok()?;
    if length_repeat != length as u64 || magic != MAGIC {
        return None;
    }
    let request = registry.decode(request_type, &payload).ok()?;
    Some(OperationLogEntry::new(LogId(id), request))
}
