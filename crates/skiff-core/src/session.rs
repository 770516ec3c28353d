//! Client side of the sync protocol.
//!
//! A session owns the transport pair and a single frame buffer. Apart from
//! CHUNK frames (fire-and-forget, no reply) the protocol is strictly
//! request/response, so the one buffer serves for both composing requests
//! and receiving replies.
//!
//! Bulk enqueueing is speculative: each op is appended to the open
//! BULKOP_BEGIN frame and rolled back if it crosses the payload budget, in
//! which case the caller flushes the batch and retries. WRITE ops are also
//! capped by the server-advertised number of concurrently open files.

use std::io::{Read, Write};

use log::debug;

use crate::errors::{RemoteAction, SyncError, SyncResult};
use crate::frame::{BufferFull, FrameBuffer};
use crate::stream;
use crate::wire::{self, MsgKind, OpKind, PROTOCOL_VERSION};

/// Local frame buffer capacity; also the ceiling on any negotiated payload
/// budget.
pub const CLIENT_BUFFER_CAPACITY: usize = 1 << 20;

/// Whether an op made it into the current bulk frame. `Full` is ordinary
/// back-pressure, not an error: flush and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    Full,
}

/// Per-op result of a bulk run, in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    /// DELETE or SYMLINK outcome.
    Status { errno: u16 },
    /// WRITE outcome. `fd` is -1 exactly when `errno` is nonzero.
    Open { fd: i32, errno: u16 },
}

/// One entry of the BULKOP_CLOSE reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseResult {
    pub fd: i32,
    pub errno: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Generic,
    OpenFd,
}

#[derive(Debug)]
pub struct Session<R: Read, W: Write> {
    input: R,
    output: W,
    buf: FrameBuffer,
    max_open_writes: u32,
    payload_budget: usize,
    bulk_open: bool,
    expected: Vec<ResultKind>,
    queued_writes: u32,
}

impl<R: Read, W: Write> Session<R, W> {
    /// Negotiate a session over the given transport: check the protocol
    /// version, fetch the server limits, and change into `remotecwd`.
    pub fn connect(input: R, output: W, remotecwd: &str) -> SyncResult<Self> {
        Self::connect_with_capacity(input, output, remotecwd, CLIENT_BUFFER_CAPACITY)
    }

    /// [`Session::connect`] with an explicit local buffer capacity. The
    /// effective payload budget is the smaller of this and the server's
    /// advertised maximum.
    pub fn connect_with_capacity(
        input: R,
        output: W,
        remotecwd: &str,
        capacity: usize,
    ) -> SyncResult<Self> {
        let mut session = Session {
            input,
            output,
            buf: FrameBuffer::new(capacity),
            max_open_writes: 0,
            payload_budget: capacity,
            bulk_open: false,
            expected: Vec::new(),
            queued_writes: 0,
        };
        session.negotiate(remotecwd)?;
        Ok(session)
    }

    fn negotiate(&mut self, remotecwd: &str) -> SyncResult<()> {
        self.begin(MsgKind::Version)?;
        self.exchange(MsgKind::VersionResp)?;
        let version = self.buf.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(SyncError::Version(version));
        }

        self.begin(MsgKind::ReqLimit)?;
        self.exchange(MsgKind::LimitResp)?;
        self.max_open_writes = self.buf.read_u32()?;
        let server_max_payload = self.buf.read_u32()? as usize;
        self.payload_budget = server_max_payload.min(self.buf.capacity());
        debug!(
            "negotiated limits: {} open writes, {} byte payloads",
            self.max_open_writes, self.payload_budget
        );

        self.begin(MsgKind::Chdir)?;
        self.buf
            .append_bytes(remotecwd.as_bytes())
            .map_err(|_| oversized("remote working directory"))?;
        self.exchange(MsgKind::GenResult)?;
        let errno = self.buf.read_u16()?;
        if errno != 0 {
            return Err(SyncError::Remote {
                action: RemoteAction::Chdir,
                path: remotecwd.to_string(),
                errno,
            });
        }
        Ok(())
    }

    /// The server-advertised cap on concurrently open write files.
    pub fn max_open_writes(&self) -> u32 {
        self.max_open_writes
    }

    /// Queue a DELETE. Opens a bulk frame if none is open.
    pub fn queue_delete(&mut self, path: &str) -> SyncResult<Enqueue> {
        self.ensure_bulk_open()?;
        let undo = self.buf.tell();
        let appended = self.encode_delete(path);
        self.commit(undo, appended, ResultKind::Generic)
    }

    /// Queue a SYMLINK creating `path` pointing at `target`.
    pub fn queue_symlink(&mut self, path: &str, target: &str) -> SyncResult<Enqueue> {
        self.ensure_bulk_open()?;
        let undo = self.buf.tell();
        let appended = self.encode_symlink(path, target);
        self.commit(undo, appended, ResultKind::Generic)
    }

    /// Queue a WRITE open. Refused without touching the buffer once the
    /// open-file budget is reached.
    pub fn queue_write(&mut self, path: &str, executable: bool) -> SyncResult<Enqueue> {
        self.ensure_bulk_open()?;
        if self.queued_writes >= self.max_open_writes {
            return Ok(Enqueue::Full);
        }
        let undo = self.buf.tell();
        let appended = self.encode_write(path, executable);
        let outcome = self.commit(undo, appended, ResultKind::OpenFd)?;
        if outcome == Enqueue::Queued {
            self.queued_writes += 1;
        }
        Ok(outcome)
    }

    fn encode_delete(&mut self, path: &str) -> Result<(), BufferFull> {
        self.buf.append_u8(OpKind::Delete as u8)?;
        wire::append_string(&mut self.buf, path)
    }

    fn encode_symlink(&mut self, path: &str, target: &str) -> Result<(), BufferFull> {
        self.buf.append_u8(OpKind::Symlink as u8)?;
        wire::append_string(&mut self.buf, path)?;
        wire::append_string(&mut self.buf, target)
    }

    fn encode_write(&mut self, path: &str, executable: bool) -> Result<(), BufferFull> {
        self.buf.append_u8(OpKind::Write as u8)?;
        self.buf.append_u8(u8::from(executable))?;
        wire::append_string(&mut self.buf, path)
    }

    /// Send the open bulk frame and parse the per-op results, in enqueue
    /// order. The kinds recorded at enqueue time decide how each result is
    /// read; the server is never asked.
    pub fn run_bulk(&mut self) -> SyncResult<Vec<OpResult>> {
        if !self.bulk_open {
            return Err(SyncError::Protocol("no bulk operation in progress".into()));
        }
        self.exchange(MsgKind::BulkResults)?;
        self.bulk_open = false;

        let expected = std::mem::take(&mut self.expected);
        let mut results = Vec::with_capacity(expected.len());
        for kind in &expected {
            results.push(match kind {
                ResultKind::Generic => OpResult::Status {
                    errno: self.buf.read_u16()?,
                },
                ResultKind::OpenFd => OpResult::Open {
                    fd: self.buf.read_i32()?,
                    errno: self.buf.read_u16()?,
                },
            });
        }
        Ok(results)
    }

    /// Stream a file body to a remote fd as CHUNK frames. Chunks carry no
    /// reply; a zero-length read ends the stream without a trailing frame.
    /// Returns the number of body bytes sent.
    pub fn upload_body(&mut self, fd: u32, path: &str, body: &mut impl Read) -> SyncResult<u64> {
        let mut total = 0u64;
        loop {
            self.begin(MsgKind::Chunk)?;
            self.buf
                .append_u32(fd)
                .map_err(|_| oversized("chunk header"))?;
            let n = read_body(body, self.buf.window_mut()).map_err(|source| SyncError::Local {
                path: path.to_string(),
                source,
            })?;
            if n == 0 {
                break;
            }
            self.buf.advance(n);
            self.send_frame()?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Close the bulk operation: every fd the server opened is closed and
    /// reported back as a `(fd, errno)` pair.
    pub fn close_bulk(&mut self) -> SyncResult<Vec<CloseResult>> {
        self.begin(MsgKind::BulkClose)?;
        self.exchange(MsgKind::BulkCloseResults)?;
        let mut results = Vec::new();
        while self.buf.remaining() > 0 {
            results.push(CloseResult {
                fd: self.buf.read_i32()?,
                errno: self.buf.read_i16()?,
            });
        }
        self.queued_writes = 0;
        Ok(results)
    }

    fn ensure_bulk_open(&mut self) -> SyncResult<()> {
        if !self.bulk_open {
            self.begin(MsgKind::BulkBegin)?;
            self.bulk_open = true;
            self.queued_writes = 0;
            self.expected.clear();
        }
        Ok(())
    }

    fn commit(
        &mut self,
        undo: usize,
        appended: Result<(), BufferFull>,
        kind: ResultKind,
    ) -> SyncResult<Enqueue> {
        match appended {
            Ok(()) => {
                self.expected.push(kind);
                Ok(Enqueue::Queued)
            }
            Err(BufferFull) => {
                self.buf.seek(undo);
                Ok(Enqueue::Full)
            }
        }
    }

    /// Rewind the buffer and open a fresh frame of the given kind.
    fn begin(&mut self, kind: MsgKind) -> SyncResult<()> {
        self.buf.seek(0);
        self.buf.set_limit(self.payload_budget);
        self.buf
            .begin_msg(kind as u8)
            .map_err(|_| oversized("frame header"))
    }

    fn send_frame(&mut self) -> SyncResult<()> {
        self.buf.end_msg();
        stream::write_full(&mut self.output, self.buf.filled())?;
        Ok(())
    }

    fn recv_frame(&mut self) -> SyncResult<MsgKind> {
        let mut head = [0u8; 5];
        stream::read_exact(&mut self.input, &mut head)?;
        let kind = MsgKind::from_byte(head[0]).ok_or_else(|| {
            SyncError::Protocol(format!("unknown response kind {}", head[0]))
        })?;
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if len > self.buf.capacity() {
            return Err(SyncError::Protocol(format!(
                "response payload of {len} bytes exceeds the local buffer"
            )));
        }
        self.buf.seek(0);
        self.buf.set_limit(len);
        stream::read_exact(&mut self.input, self.buf.window_mut())?;
        self.buf.seek(0);
        Ok(kind)
    }

    fn exchange(&mut self, expected: MsgKind) -> SyncResult<()> {
        self.send_frame()?;
        let kind = self.recv_frame()?;
        if kind != expected {
            return Err(SyncError::Protocol(format!(
                "unexpected response {kind:?}, expected {expected:?}"
            )));
        }
        Ok(())
    }
}

fn read_body(body: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match body.read(buf) {
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn oversized(what: &str) -> SyncError {
    SyncError::Protocol(format!("{what} does not fit in the negotiated payload budget"))
}
