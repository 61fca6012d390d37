//! Log directory management.
//!
//! A [`LogStore`] owns one directory holding:
//!
//! ```text
//! boot.json                     boot parameters for the next restart
//! segment-<seq>.tslg            append-only command segments
//! snapshot-<replay_from>.json   manager-state snapshots
//! ```
//!
//! Appends go to the current segment. A checkpoint rotates to a fresh segment
//! (the only step that needs the manager's exclusive lock), syncs the retired
//! segment, saves a snapshot, and then discards everything the snapshot
//! covers.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use tspace_error::{Result, TspaceError};

use crate::segment::{SegmentWriter, read_segment};
use crate::snapshot::{
    LoadedSnapshot, discard_older_snapshots, load_latest_snapshot, save_snapshot,
};

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".tslg";
const BOOT_FILE: &str = "boot.json";

/// Current boot file format version.
pub const BOOT_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the log directory.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// How many appended operations may sit unsynced before a sync is forced.
    /// The value persisted for the next boot is double this: a checkpoint
    /// interrupted between rotation and snapshot save leaves two
    /// half-checkpoints of log with no intervening snapshot.
    pub max_unsynced_ops: u64,
    /// Sync the current segment on every append. Leave on for durability;
    /// tests of pure in-memory behavior may switch it off.
    pub sync_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_unsynced_ops: 1024,
            sync_on_append: true,
        }
    }
}

/// Boot parameters persisted for the next restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootParams {
    pub format_version: u32,
    /// Upper bound on trailing records beyond the last checkpoint.
    pub max_unsynced_ops: u64,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{seq:020}{SEGMENT_SUFFIX}"))
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?;
    let digits = rest.strip_suffix(SEGMENT_SUFFIX)?;
    digits.parse().ok()
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = parse_segment_name(name) {
            segments.push((seq, dirent.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

// ---------------------------------------------------------------------------
// FinishedSegment
// ---------------------------------------------------------------------------

/// A segment retired by rotation, not yet synced.
///
/// Rotation hands this back so the caller can perform the sync outside the
/// exclusive lock while live traffic proceeds against the new segment.
#[derive(Debug)]
pub struct FinishedSegment {
    writer: SegmentWriter,
}

impl FinishedSegment {
    /// Flush the retired segment to stable storage.
    pub fn sync(mut self) -> Result<u64> {
        self.writer.sync()?;
        Ok(self.writer.seq())
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.writer.seq()
    }

    /// The first segment sequence a snapshot taken after this rotation does
    /// NOT cover.
    #[must_use]
    pub fn first_uncovered(&self) -> u64 {
        self.writer.seq() + 1
    }
}

// ---------------------------------------------------------------------------
// LogStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Writer {
    current: SegmentWriter,
    unsynced: u64,
}

/// The durable substrate of the transaction log: segment files plus
/// snapshots in one directory.
#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    config: LogConfig,
    writer: Mutex<Writer>,
}

impl LogStore {
    /// Open (or create) a log directory and start a fresh current segment.
    ///
    /// Existing segments are left untouched for the caller to replay via
    /// [`Self::read_records_from`]; the new current segment always gets a
    /// sequence number above every survivor.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let max_existing = list_segments(&dir)?.last().map_or(0, |(seq, _)| *seq);
        let current = SegmentWriter::create(&segment_path(&dir, max_existing + 1), max_existing + 1)?;

        let boot = BootParams {
            format_version: BOOT_FORMAT_VERSION,
            // Doubled: tolerates a checkpoint interrupted mid-rotation.
            max_unsynced_ops: config.max_unsynced_ops.saturating_mul(2),
        };
        let boot_json = serde_json::to_vec_pretty(&boot).map_err(TspaceError::codec)?;
        fs::write(dir.join(BOOT_FILE), boot_json)?;

        info!(
            dir = %dir.display(),
            current_segment = max_existing + 1,
            "log store opened"
        );
        Ok(Self {
            dir,
            config,
            writer: Mutex::new(Writer {
                current,
                unsynced: 0,
            }),
        })
    }

    /// Read the boot parameters persisted by the previous run, if any.
    pub fn read_boot(dir: &Path) -> Result<Option<BootParams>> {
        let path = dir.join(BOOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let boot: BootParams = serde_json::from_slice(&bytes).map_err(TspaceError::codec)?;
        Ok(Some(boot))
    }

    /// Append one serialized command to the current segment.
    pub fn append(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.current.append(payload)?;
        writer.unsynced += 1;
        if self.config.sync_on_append || writer.unsynced >= self.config.max_unsynced_ops {
            writer.current.sync()?;
            writer.unsynced = 0;
        }
        Ok(())
    }

    /// Force-sync the current segment.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.current.sync()?;
        writer.unsynced = 0;
        Ok(())
    }

    /// Rotate to a fresh segment and hand back the retired one, unsynced.
    ///
    /// The caller must hold whatever exclusion it needs (the manager holds
    /// its checkpoint lock exclusively across this call, and only this call).
    pub fn rotate(&self) -> Result<FinishedSegment> {
        let mut writer = self.writer.lock();
        let next_seq = writer.current.seq() + 1;
        let fresh = SegmentWriter::create(&segment_path(&self.dir, next_seq), next_seq)?;
        let retired = std::mem::replace(&mut writer.current, fresh);
        writer.unsynced = 0;
        debug!(retired = retired.seq(), current = next_seq, "log rotated");
        Ok(FinishedSegment { writer: retired })
    }

    /// Records appended to the current segment since it was created.
    /// Test and introspection aid.
    #[must_use]
    pub fn current_segment_records(&self) -> u64 {
        self.writer.lock().current.record_count()
    }

    #[must_use]
    pub fn current_segment_seq(&self) -> u64 {
        self.writer.lock().current.seq()
    }

    /// Read, in order, every record of every on-disk segment with
    /// `seq >= replay_from`, excluding the current (empty, freshly created)
    /// segment.
    ///
    /// A torn tail is legal only at the end of the log: records in any later
    /// segment mean the tear sits in the middle of committed history and
    /// recovery must abort. Empty trailing segments (each restart creates
    /// one) do not count as "later records".
    pub fn read_records_from(&self, replay_from: u64) -> Result<Vec<Vec<u8>>> {
        let current_seq = self.current_segment_seq();
        let mut segments = list_segments(&self.dir)?;
        segments.retain(|(seq, _)| *seq >= replay_from && *seq != current_seq);

        let mut records = Vec::new();
        let mut torn: Option<u64> = None;
        for (seq, path) in segments {
            let contents = read_segment(&path)?;
            if let Some(torn_seq) = torn {
                if !contents.records.is_empty() {
                    return Err(TspaceError::RecoveryFailed {
                        detail: format!(
                            "segment {torn_seq} has a torn tail but segment {seq} holds later records"
                        ),
                    });
                }
            }
            if contents.truncated_tail {
                torn = Some(seq);
            }
            records.extend(contents.records);
        }
        Ok(records)
    }

    /// Persist a snapshot covering all segments with `seq < replay_from`.
    pub fn save_snapshot<T: Serialize>(&self, replay_from: u64, state: &T) -> Result<()> {
        save_snapshot(&self.dir, replay_from, state)
    }

    /// Load the newest decodable snapshot.
    pub fn load_snapshot<T: DeserializeOwned>(&self) -> Result<Option<LoadedSnapshot<T>>> {
        load_latest_snapshot(&self.dir)
    }

    /// Drop segments and snapshots superseded by a snapshot at `replay_from`.
    pub fn discard_covered(&self, replay_from: u64) -> Result<()> {
        let current_seq = self.current_segment_seq();
        for (seq, path) in list_segments(&self.dir)? {
            if seq < replay_from && seq != current_seq {
                fs::remove_file(&path)?;
                debug!(seq, "discarded covered segment");
            }
        }
        discard_older_snapshots(&self.dir, replay_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> LogStore {
        LogStore::open(dir, LogConfig::default()).expect("open")
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let store = open(tmp.path());
            store.append(b"one").expect("append");
            store.append(b"two").expect("append");
        }
        // Reopen: previous segment survives, new current is empty.
        let store = open(tmp.path());
        let records = store.read_records_from(0).expect("read");
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(store.current_segment_records(), 0);
    }

    #[test]
    fn test_rotate_and_discard() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open(tmp.path());
        store.append(b"before").expect("append");

        let finished = store.rotate().expect("rotate");
        let replay_from = finished.first_uncovered();
        finished.sync().expect("sync");
        store.append(b"after").expect("append");

        store
            .save_snapshot(replay_from, &serde_json::json!({"clock": 1}))
            .expect("snapshot");
        store.discard_covered(replay_from).expect("discard");

        // Only the post-rotation record survives.
        let records = store.read_records_from(0).expect("read");
        assert_eq!(records, vec![b"after".to_vec()]);
    }

    #[test]
    fn test_replay_from_skips_covered_segments() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = open(tmp.path());
        store.append(b"covered").expect("append");
        let finished = store.rotate().expect("rotate");
        let replay_from = finished.first_uncovered();
        finished.sync().expect("sync");
        store.append(b"live").expect("append");
        drop(store);

        let store = open(tmp.path());
        let records = store.read_records_from(replay_from).expect("read");
        assert_eq!(records, vec![b"live".to_vec()]);
    }

    fn tear_tail(path: &Path, bytes: u64) {
        let len = fs::metadata(path).expect("meta").len();
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .expect("open");
        file.set_len(len - bytes).expect("truncate");
    }

    #[test]
    fn test_torn_tail_stays_legal_across_empty_restarts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let store = open(tmp.path());
            store.append(b"keep").expect("append");
            store.append(b"torn").expect("append");
        }
        tear_tail(&segment_path(tmp.path(), 1), 3);

        // Each restart creates a fresh empty segment; the tear on segment 1
        // must remain a legal end-of-log no matter how many pile up.
        for _ in 0..3 {
            let store = open(tmp.path());
            let records = store.read_records_from(0).expect("read");
            assert_eq!(records, vec![b"keep".to_vec()]);
        }
    }

    #[test]
    fn test_torn_tail_before_later_records_fails_recovery() {
        let tmp = tempfile::tempdir().expect("tempdir");
        {
            let store = open(tmp.path());
            store.append(b"first").expect("append");
        }
        {
            let store = open(tmp.path());
            store.append(b"later").expect("append");
        }
        // Tear segment 1 while segment 2 holds committed records.
        tear_tail(&segment_path(tmp.path(), 1), 2);

        let store = open(tmp.path());
        let err = store.read_records_from(0).expect_err("must fail");
        assert!(matches!(err, TspaceError::RecoveryFailed { .. }));
    }

    #[test]
    fn test_boot_params_doubled() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = LogConfig {
            max_unsynced_ops: 500,
            sync_on_append: true,
        };
        let _store = LogStore::open(tmp.path(), config).expect("open");
        let boot = LogStore::read_boot(tmp.path())
            .expect("read boot")
            .expect("present");
        assert_eq!(boot.max_unsynced_ops, 1000);
        assert_eq!(boot.format_version, BOOT_FORMAT_VERSION);
    }

    #[test]
    fn test_segment_seqs_never_reused() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let first_seq = {
            let store = open(tmp.path());
            store.append(b"x").expect("append");
            store.current_segment_seq()
        };
        let store = open(tmp.path());
        assert!(store.current_segment_seq() > first_seq);
    }
}
