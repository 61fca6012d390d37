//! Snapshot persistence.
//!
//! A snapshot is a self-contained JSON image of the transaction manager's
//! state, written atomically (temp file + rename) so a crash mid-save leaves
//! the previous snapshot intact. Loading picks the newest file that decodes
//! cleanly: a corrupt newest snapshot is expected after a checkpoint that
//! died between rotation and save, and falls back with a warning rather than
//! failing the boot.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use tspace_error::{Result, TspaceError};

/// Current snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

#[derive(Debug, Serialize, serde::Deserialize)]
struct SnapshotFile<T> {
    format_version: u32,
    /// First log segment NOT covered by this snapshot; replay starts there.
    replay_from: u64,
    state: T,
}

/// A snapshot loaded from disk.
#[derive(Debug)]
pub struct LoadedSnapshot<T> {
    pub replay_from: u64,
    pub state: T,
}

fn snapshot_path(dir: &Path, replay_from: u64) -> PathBuf {
    dir.join(format!("{SNAPSHOT_PREFIX}{replay_from:020}{SNAPSHOT_SUFFIX}"))
}

fn parse_snapshot_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(SNAPSHOT_PREFIX)?;
    let digits = rest.strip_suffix(SNAPSHOT_SUFFIX)?;
    digits.parse().ok()
}

/// Write a snapshot covering all segments with `seq < replay_from`.
///
/// The file is staged under a temporary name and renamed into place, then the
/// directory is synced so the rename itself is durable.
pub fn save_snapshot<T: Serialize>(dir: &Path, replay_from: u64, state: &T) -> Result<()> {
    let body = SnapshotFile {
        format_version: SNAPSHOT_FORMAT_VERSION,
        replay_from,
        state,
    };
    let json = serde_json::to_vec_pretty(&body).map_err(TspaceError::codec)?;

    let final_path = snapshot_path(dir, replay_from);
    let tmp_path = final_path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&json)?;
        tmp.sync_data()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    File::open(dir)?.sync_all()?;

    info!(replay_from, path = %final_path.display(), "snapshot saved");
    Ok(())
}

/// Load the newest decodable snapshot in `dir`, if any.
///
/// Older snapshot files are left on disk; the caller discards them together
/// with superseded log segments once the checkpoint completes.
pub fn load_latest_snapshot<T: DeserializeOwned>(dir: &Path) -> Result<Option<LoadedSnapshot<T>>> {
    let mut candidates: Vec<(u64, PathBuf)> = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(replay_from) = parse_snapshot_name(name) {
            candidates.push((replay_from, dirent.path()));
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    for (replay_from, path) in candidates {
        let bytes = fs::read(&path)?;
        match serde_json::from_slice::<SnapshotFile<T>>(&bytes) {
            Ok(body) if body.format_version == SNAPSHOT_FORMAT_VERSION => {
                return Ok(Some(LoadedSnapshot {
                    replay_from: body.replay_from,
                    state: body.state,
                }));
            }
            Ok(body) => {
                return Err(TspaceError::SnapshotCorrupt {
                    path,
                    detail: format!("unsupported format version {}", body.format_version),
                });
            }
            Err(err) => {
                // A half-written newest snapshot is survivable: fall back to
                // the one before it and replay more log.
                warn!(
                    replay_from,
                    path = %path.display(),
                    error = %err,
                    "snapshot failed to decode, falling back to older snapshot"
                );
            }
        }
    }
    Ok(None)
}

/// Delete snapshot files older than `keep_replay_from`.
pub fn discard_older_snapshots(dir: &Path, keep_replay_from: u64) -> Result<()> {
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(replay_from) = parse_snapshot_name(name) {
            if replay_from < keep_replay_from {
                fs::remove_file(dirent.path())?;
            }
        }
    }
    Ok(())
}
