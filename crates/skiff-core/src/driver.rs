//! Feeds a plan through a session.
//!
//! Ops are enqueued delete-first, then updates; whenever the session reports
//! a full queue the accumulated batch is flushed (run bulk, stream bodies,
//! close) and the op is retried once. A second refusal on an empty batch
//! means the op itself cannot fit a frame, which is a hard error.
//!
//! The run aborts on the first failed operation. Ops the server already
//! executed in that batch stay executed; the snapshot is only persisted by
//! the caller on full success, so the next sync reconciles.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::info;

use crate::errors::{RemoteAction, SyncError, SyncResult};
use crate::plan::{Plan, UpdateAction};
use crate::session::{CloseResult, Enqueue, OpResult, Session};
use crate::snapshot::Snapshot;

enum BatchOp {
    Delete,
    Symlink(String),
    Write { upload_body: bool, executable: bool },
}

pub struct SyncDriver<'a, R: Read, W: Write> {
    session: &'a mut Session<R, W>,
    local_root: &'a Path,
    /// Ops in the currently open bulk frame, in enqueue order.
    batch: Vec<(String, BatchOp)>,
    /// Remote fd -> path, for writes whose body must be streamed.
    uploads: BTreeMap<i32, String>,
}

impl<'a, R: Read, W: Write> SyncDriver<'a, R, W> {
    pub fn new(session: &'a mut Session<R, W>, local_root: &'a Path) -> Self {
        Self {
            session,
            local_root,
            batch: Vec::new(),
            uploads: BTreeMap::new(),
        }
    }

    /// Execute the whole plan. `new_snapshot` supplies the executable flag
    /// for every WRITE at enqueue time.
    pub fn run(mut self, plan: &Plan, new_snapshot: &Snapshot) -> SyncResult<()> {
        for path in &plan.to_delete {
            self.enqueue(path, BatchOp::Delete)?;
        }
        for (path, action) in &plan.to_update {
            let op = match action {
                UpdateAction::Symlink(target) => BatchOp::Symlink(target.clone()),
                UpdateAction::Write { upload_body } => BatchOp::Write {
                    upload_body: *upload_body,
                    executable: new_snapshot
                        .get(path)
                        .map(|rec| rec.info.executable())
                        .unwrap_or(false),
                },
            };
            self.enqueue(path, op)?;
        }
        if !self.batch.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    fn enqueue(&mut self, path: &str, op: BatchOp) -> SyncResult<()> {
        for attempt in 0..2 {
            let outcome = match &op {
                BatchOp::Delete => self.session.queue_delete(path)?,
                BatchOp::Symlink(target) => self.session.queue_symlink(path, target)?,
                BatchOp::Write { executable, .. } => {
                    self.session.queue_write(path, *executable)?
                }
            };
            match outcome {
                Enqueue::Queued => {
                    self.batch.push((path.to_string(), op));
                    return Ok(());
                }
                Enqueue::Full if attempt == 0 => self.flush()?,
                Enqueue::Full => break,
            }
        }
        Err(SyncError::Protocol(format!(
            "operation for '{path}' does not fit in an empty bulk frame"
        )))
    }

    /// Run the open bulk frame: check per-op results, stream bodies for the
    /// successful uploads, close the bulk and check the close results.
    fn flush(&mut self) -> SyncResult<()> {
        let batch = std::mem::take(&mut self.batch);
        let results = self.session.run_bulk()?;
        if results.len() != batch.len() {
            return Err(SyncError::Protocol(format!(
                "server answered {} results for {} ops",
                results.len(),
                batch.len()
            )));
        }

        self.uploads.clear();
        for ((path, op), result) in batch.iter().zip(&results) {
            self.check_result(path, op, result)?;
        }

        for (fd, path) in &self.uploads {
            info!("uploading '{path}'");
            let local = self.local_root.join(path);
            let mut body = File::open(&local).map_err(|source| SyncError::Local {
                path: path.clone(),
                source,
            })?;
            self.session.upload_body(*fd as u32, path, &mut body)?;
        }

        for CloseResult { fd, errno } in self.session.close_bulk()? {
            // Attribute-only opens are not tracked; their close outcome is
            // the server's business.
            let Some(path) = self.uploads.get(&fd) else {
                continue;
            };
            if errno != 0 {
                return Err(SyncError::Remote {
                    action: RemoteAction::Close,
                    path: path.clone(),
                    errno: errno as u16,
                });
            }
            info!("uploaded '{path}'");
        }
        self.uploads.clear();
        Ok(())
    }

    fn check_result(&mut self, path: &str, op: &BatchOp, result: &OpResult) -> SyncResult<()> {
        match (op, result) {
            (BatchOp::Delete, OpResult::Status { errno }) => {
                if *errno != 0 {
                    return Err(SyncError::Remote {
                        action: RemoteAction::Delete,
                        path: path.to_string(),
                        errno: *errno,
                    });
                }
                info!("deleted '{path}'");
            }
            (BatchOp::Symlink(target), OpResult::Status { errno }) => {
                if *errno != 0 {
                    return Err(SyncError::Remote {
                        action: RemoteAction::Symlink,
                        path: path.to_string(),
                        errno: *errno,
                    });
                }
                info!("created symlink '{path}' -> '{target}'");
            }
            (BatchOp::Write { upload_body, .. }, OpResult::Open { fd, errno }) => {
                if *fd < 0 {
                    return Err(SyncError::Remote {
                        action: RemoteAction::Open,
                        path: path.to_string(),
                        errno: *errno,
                    });
                }
                if *upload_body {
                    self.uploads.insert(*fd, path.to_string());
                } else {
                    info!("updated permissions for '{path}'");
                }
            }
            _ => {
                return Err(SyncError::Protocol(
                    "result kind does not match the enqueued op".into(),
                ));
            }
        }
        Ok(())
    }
}
