//! Persisted sync state.
//!
//! One JSON document per synced tree, stored at its root: the argv used to
//! launch the remote helper, the remote working directory, and the snapshot
//! recorded after the last successful sync. The snapshot maps each relative
//! path to `[info, mtime_ns]` where `info` is a bool (regular file:
//! executable?) or a string (symlink target).

use std::fs;
use std::io;
use std::path::Path;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Default state file name, resolved at the root of the synced tree.
pub const DEFAULT_STATE_FILE: &str = ".s2rstate.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    /// Argument vector launching the remote helper, e.g.
    /// `["ssh", "host", "skiff", "server"]`. Opaque to the core.
    pub command: Vec<String>,
    /// Working directory on the remote side.
    pub remotecwd: Option<String>,
    /// Snapshot as of the last successful sync.
    pub data: Option<Snapshot>,
}

impl State {
    /// Load a state document. `Ok(None)` means the file does not exist;
    /// anything unreadable or unparsable is an error.
    pub fn load(path: &Path) -> Result<Option<State>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).wrap_err_with(|| format!("reading {}", path.display()));
            }
        };
        let state = serde_json::from_slice(&raw)
            .wrap_err_with(|| format!("parsing state file {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec(self).wrap_err("serializing state")?;
        fs::write(path, raw).wrap_err_with(|| format!("writing {}", path.display()))
    }
}
