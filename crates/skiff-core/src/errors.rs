//! Session error taxonomy.
//!
//! Every failure a sync run can hit falls into one of a handful of variants:
//! - Protocol: the peer broke the wire contract. Fatal, tear down.
//! - Transport: the byte stream itself failed or ended early. Fatal.
//! - Version: the remote helper speaks an unsupported protocol revision.
//! - Remote: the remote reported an OS errno for a specific operation.
//! - Local: reading a local file body failed mid-upload.
//!
//! Recovery never happens at this level; the two create-parents-and-retry
//! cases live inside the executor.

use std::fmt;
use std::io;

use crate::frame::{BufferExhausted, BufferFull};

/// The remote operation a [`SyncError::Remote`] errno belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    Chdir,
    Delete,
    Symlink,
    Open,
    Close,
}

impl fmt::Display for RemoteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            RemoteAction::Chdir => "change directory to",
            RemoteAction::Delete => "delete",
            RemoteAction::Symlink => "create symlink",
            RemoteAction::Open => "open for write",
            RemoteAction::Close => "finish writing",
        };
        f.write_str(verb)
    }
}

#[derive(Debug)]
pub enum SyncError {
    /// The peer violated the wire protocol.
    Protocol(String),
    /// Transport read/write failed, or the stream ended inside a frame.
    Transport(io::Error),
    /// The server answered the version probe with an unsupported revision.
    Version(u32),
    /// The remote executed an operation and reported an OS error for it.
    Remote {
        action: RemoteAction,
        path: String,
        errno: u16,
    },
    /// Local I/O failed while reading a file body for upload.
    Local { path: String, source: io::Error },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            SyncError::Transport(err) => write!(f, "transport error: {err}"),
            SyncError::Version(ver) => write!(f, "unsupported server version {ver}"),
            SyncError::Remote {
                action,
                path,
                errno,
            } => {
                let os = io::Error::from_raw_os_error(i32::from(*errno));
                write!(f, "remote could not {action} '{path}': {os}")
            }
            SyncError::Local { path, source } => {
                write!(f, "reading local file '{path}' failed: {source}")
            }
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Transport(err) => Some(err),
            SyncError::Local { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::Transport(err)
    }
}

impl From<BufferExhausted> for SyncError {
    fn from(_: BufferExhausted) -> Self {
        SyncError::Protocol("message payload shorter than its contents claim".into())
    }
}

impl From<BufferFull> for SyncError {
    fn from(_: BufferFull) -> Self {
        SyncError::Protocol("reply does not fit in the reply buffer".into())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
