//! Local tree snapshots.
//!
//! A snapshot maps relative forward-slash paths to per-path records; two
//! snapshots diffed against each other yield the sync plan. The scan never
//! follows symlinks and records them as entries of their own, so a link to a
//! directory is one entry, not a subtree.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Kind-specific half of a path record. Serializes untagged so the on-disk
/// state stays a plain JSON bool (regular file: executable?) or string
/// (symlink target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathInfo {
    Regular(bool),
    Symlink(String),
}

impl PathInfo {
    /// The executable flag a WRITE op should carry for this entry.
    pub fn executable(&self) -> bool {
        matches!(self, PathInfo::Regular(true))
    }
}

/// One file-like entry of a tree: its kind-specific info and the larger of
/// ctime and mtime in integer nanoseconds, from a no-follow stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(PathInfo, i64)", into = "(PathInfo, i64)")]
pub struct PathRecord {
    pub info: PathInfo,
    pub mtime_ns: i64,
}

impl From<(PathInfo, i64)> for PathRecord {
    fn from((info, mtime_ns): (PathInfo, i64)) -> Self {
        Self { info, mtime_ns }
    }
}

impl From<PathRecord> for (PathInfo, i64) {
    fn from(rec: PathRecord) -> Self {
        (rec.info, rec.mtime_ns)
    }
}

impl PathRecord {
    pub fn regular(executable: bool, mtime_ns: i64) -> Self {
        Self {
            info: PathInfo::Regular(executable),
            mtime_ns,
        }
    }

    pub fn symlink(target: impl Into<String>, mtime_ns: i64) -> Self {
        Self {
            info: PathInfo::Symlink(target.into()),
            mtime_ns,
        }
    }
}

/// Relative path -> record. Sorted iteration keeps dry-run output and wire
/// traffic deterministic.
pub type Snapshot = BTreeMap<String, PathRecord>;

fn change_stamp_ns(md: &fs::Metadata) -> i64 {
    let mtime = md.mtime() * NANOS_PER_SEC + md.mtime_nsec();
    let ctime = md.ctime() * NANOS_PER_SEC + md.ctime_nsec();
    mtime.max(ctime)
}

/// Scan `root` depth-first into a snapshot. Regular files and symlinks are
/// recorded; directories are descended into but not recorded; anything else
/// (sockets, fifos, devices) is skipped. A state file sitting at the root is
/// excluded so a sync never ships its own bookkeeping.
pub fn scan(root: &Path, state_file: &str) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry =
            entry.wrap_err_with(|| format!("scanning directory tree at {}", root.display()))?;
        if entry.depth() == 0 {
            continue;
        }

        let md = entry
            .metadata()
            .wrap_err_with(|| format!("stat {}", entry.path().display()))?;
        let file_type = entry.file_type();
        let info = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .wrap_err_with(|| format!("reading symlink {}", entry.path().display()))?;
            PathInfo::Symlink(target.to_string_lossy().into_owned())
        } else if file_type.is_file() {
            PathInfo::Regular(md.mode() & 0o111 != 0)
        } else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir entry outside its root")
            .to_string_lossy()
            .into_owned();

        snapshot.insert(
            rel,
            PathRecord {
                info,
                mtime_ns: change_stamp_ns(&md),
            },
        );
    }

    // Only a root-level occurrence is the state file; a nested file with the
    // same basename is ordinary data.
    snapshot.remove(state_file);
    Ok(snapshot)
}
