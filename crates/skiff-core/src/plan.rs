//! Snapshot diffing.
//!
//! The diff is pure: given the previously synced snapshot and a fresh scan it
//! produces the minimal set of remote operations. The remote is overwritten
//! unconditionally; there is no conflict handling.

use std::collections::BTreeMap;

use crate::snapshot::{PathInfo, Snapshot};

/// How a path in `to_update` should be brought up to date. Deletions are
/// carried separately in [`Plan::to_delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction {
    /// (Re)create a symlink with this target.
    Symlink(String),
    /// Open the path for write. With `upload_body` the content is streamed;
    /// without it the open exists only to re-apply the executable bit.
    Write { upload_body: bool },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    pub to_delete: Vec<String>,
    pub to_update: BTreeMap<String, UpdateAction>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_update.is_empty()
    }
}

/// Diff two snapshots into a plan.
///
/// Rules, in order:
/// 1. in old only -> delete
/// 2. in new only -> upload (symlink or full write)
/// 3. both regular: newer stamp -> full write; else flipped executable bit
///    -> attribute-only write; else nothing
/// 4. records differ across kinds or targets -> symlink if the new side is
///    one, full write otherwise
pub fn diff(old: &Snapshot, new: &Snapshot) -> Plan {
    let to_delete = old
        .keys()
        .filter(|path| !new.contains_key(*path))
        .cloned()
        .collect();

    let mut to_update = BTreeMap::new();
    for (path, rec) in new {
        let action = match old.get(path) {
            None => Some(fresh_upload(&rec.info)),
            Some(prev) => match (&rec.info, &prev.info) {
                (PathInfo::Regular(exec), PathInfo::Regular(prev_exec)) => {
                    if rec.mtime_ns > prev.mtime_ns {
                        Some(UpdateAction::Write { upload_body: true })
                    } else if exec != prev_exec {
                        Some(UpdateAction::Write { upload_body: false })
                    } else {
                        None
                    }
                }
                _ if rec.info != prev.info => Some(fresh_upload(&rec.info)),
                _ => None,
            },
        };
        if let Some(action) = action {
            to_update.insert(path.clone(), action);
        }
    }

    Plan {
        to_delete,
        to_update,
    }
}

fn fresh_upload(info: &PathInfo) -> UpdateAction {
    match info {
        PathInfo::Symlink(target) => UpdateAction::Symlink(target.clone()),
        PathInfo::Regular(_) => UpdateAction::Write { upload_body: true },
    }
}
