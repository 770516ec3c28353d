//! Wire protocol contract shared by the client session and the server
//! executor.
//!
//! Every frame is `kind:u8 | payload_len:u32 | payload`, little-endian, no
//! preamble. The kind and opcode values below are part of the protocol and
//! must not change. Unknown values decode to `None` and are treated as fatal
//! protocol errors at the dispatch site.

use crate::errors::{SyncError, SyncResult};
use crate::frame::{BufferFull, FrameBuffer};

/// Protocol revision spoken by both peers. Anything else is rejected during
/// negotiation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Top-level message kinds. Values 1..=10 flow client to server, 100..=104
/// server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Version = 1,
    ReqLimit = 2,
    Chdir = 3,
    BulkBegin = 4,
    BulkClose = 8,
    Chunk = 9,
    Exit = 10,
    VersionResp = 100,
    LimitResp = 101,
    GenResult = 102,
    BulkResults = 103,
    BulkCloseResults = 104,
}

impl MsgKind {
    pub fn from_byte(value: u8) -> Option<MsgKind> {
        match value {
            1 => Some(MsgKind::Version),
            2 => Some(MsgKind::ReqLimit),
            3 => Some(MsgKind::Chdir),
            4 => Some(MsgKind::BulkBegin),
            8 => Some(MsgKind::BulkClose),
            9 => Some(MsgKind::Chunk),
            10 => Some(MsgKind::Exit),
            100 => Some(MsgKind::VersionResp),
            101 => Some(MsgKind::LimitResp),
            102 => Some(MsgKind::GenResult),
            103 => Some(MsgKind::BulkResults),
            104 => Some(MsgKind::BulkCloseResults),
            _ => None,
        }
    }
}

/// Opcodes inside a BULKOP_BEGIN payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Write = 1,
    Symlink = 2,
    Delete = 10,
}

impl OpKind {
    pub fn from_byte(value: u8) -> Option<OpKind> {
        match value {
            1 => Some(OpKind::Write),
            2 => Some(OpKind::Symlink),
            10 => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// Append a length-prefixed UTF-8 string: `len:u16 | bytes`. A string longer
/// than a u16 can carry reports as `BufferFull`; the enqueue path turns a
/// repeat failure into a hard error.
pub fn append_string(buf: &mut FrameBuffer, s: &str) -> Result<(), BufferFull> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| BufferFull)?;
    buf.append_u16(len)?;
    buf.append_bytes(bytes)
}

/// Read a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut FrameBuffer) -> SyncResult<String> {
    let len = usize::from(buf.read_u16()?);
    let bytes = buf.read_bytes(len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| SyncError::Protocol("path string is not valid UTF-8".into()))
}
