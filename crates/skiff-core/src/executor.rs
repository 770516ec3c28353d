//! Server side of the sync protocol.
//!
//! The executor runs a single-threaded dispatch loop over its transport:
//! read one frame, handle it, answer (except for CHUNK, which never
//! replies). Relative paths in bulk ops resolve against the process working
//! directory, which the client sets up front via CHDIR.
//!
//! Files opened for WRITE stay open across the whole bulk operation and are
//! truncated lazily on the first CHUNK, so an open with no body leaves the
//! file created but untouched — that is how executable bits are re-applied
//! without re-uploading content.

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::{debug, warn};

use crate::errors::{SyncError, SyncResult};
use crate::frame::FrameBuffer;
use crate::stream;
use crate::wire::{self, MsgKind, OpKind, PROTOCOL_VERSION};

/// Receive buffer capacity; advertised to the client as the maximum payload.
pub const RECV_BUFFER_CAPACITY: usize = 1 << 20;

const REPLY_BUFFER_CAPACITY: usize = RECV_BUFFER_CAPACITY / 2;

/// Default cap on files held open for write within one bulk operation.
pub const MAX_OPEN_WRITES: u32 = 200;

/// Write state for one file opened inside the current bulk operation.
struct OpenWrite {
    file: File,
    truncated: bool,
    write_errno: u16,
}

pub struct Executor<R: Read, W: Write> {
    input: R,
    output: W,
    recv: FrameBuffer,
    reply: FrameBuffer,
    max_open_writes: u32,
    bulk_active: bool,
    open_files: BTreeMap<i32, OpenWrite>,
}

impl<R: Read, W: Write> Executor<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            recv: FrameBuffer::new(RECV_BUFFER_CAPACITY),
            reply: FrameBuffer::new(REPLY_BUFFER_CAPACITY),
            max_open_writes: MAX_OPEN_WRITES,
            bulk_active: false,
            open_files: BTreeMap::new(),
        }
    }

    /// Override the advertised open-write cap.
    pub fn with_max_open_writes(mut self, max: u32) -> Self {
        self.max_open_writes = max;
        self
    }

    /// Serve the transport until the client closes it (clean EOF before a
    /// frame) or sends EXIT. Protocol violations and transport failures
    /// abort with an error.
    pub fn run(&mut self) -> SyncResult<()> {
        loop {
            let mut kind_byte = [0u8; 1];
            if stream::read_full(&mut self.input, &mut kind_byte)? == 0 {
                break;
            }
            let kind = MsgKind::from_byte(kind_byte[0]).ok_or_else(|| {
                SyncError::Protocol(format!("unknown message kind {}", kind_byte[0]))
            })?;

            let mut len_bytes = [0u8; 4];
            stream::read_exact(&mut self.input, &mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > self.recv.capacity() {
                return Err(SyncError::Protocol(format!(
                    "frame payload of {len} bytes exceeds the receive buffer"
                )));
            }
            self.recv.seek(0);
            self.recv.set_limit(len);
            stream::read_exact(&mut self.input, self.recv.window_mut())?;
            self.recv.seek(0);

            debug!("frame {kind:?}, {len} byte payload");
            match kind {
                MsgKind::Exit => break,
                MsgKind::Version => self.handle_version()?,
                MsgKind::ReqLimit => self.handle_req_limit()?,
                MsgKind::Chdir => self.handle_chdir()?,
                MsgKind::BulkBegin => self.handle_bulk_begin()?,
                MsgKind::BulkClose => self.handle_bulk_close()?,
                MsgKind::Chunk => self.handle_chunk()?,
                other => {
                    return Err(SyncError::Protocol(format!(
                        "message kind {other:?} is not valid from a client"
                    )));
                }
            }
        }
        Ok(())
    }

    fn begin_reply(&mut self, kind: MsgKind) -> SyncResult<()> {
        self.reply.set_limit(self.reply.capacity());
        self.reply.seek(0);
        self.reply.begin_msg(kind as u8)?;
        Ok(())
    }

    fn send_reply(&mut self) -> SyncResult<()> {
        self.reply.end_msg();
        stream::write_full(&mut self.output, self.reply.filled())?;
        Ok(())
    }

    fn handle_version(&mut self) -> SyncResult<()> {
        self.begin_reply(MsgKind::VersionResp)?;
        self.reply.append_u32(PROTOCOL_VERSION)?;
        self.send_reply()
    }

    fn handle_req_limit(&mut self) -> SyncResult<()> {
        self.begin_reply(MsgKind::LimitResp)?;
        self.reply.append_u32(self.max_open_writes)?;
        self.reply.append_u32(self.recv.capacity() as u32)?;
        self.send_reply()
    }

    fn handle_chdir(&mut self) -> SyncResult<()> {
        let path = String::from_utf8(self.recv.read_remaining().to_vec())
            .map_err(|_| SyncError::Protocol("chdir path is not valid UTF-8".into()))?;
        let errno = match chdir_creating(&path) {
            Ok(()) => 0,
            Err(err) => errno_of(&err),
        };
        self.begin_reply(MsgKind::GenResult)?;
        self.reply.append_u16(errno)?;
        self.send_reply()
    }

    fn handle_bulk_begin(&mut self) -> SyncResult<()> {
        if self.bulk_active {
            return Err(SyncError::Protocol(
                "BULKOP_BEGIN while a bulk operation is already active".into(),
            ));
        }
        self.bulk_active = true;
        self.open_files.clear();

        self.begin_reply(MsgKind::BulkResults)?;
        while self.recv.remaining() > 0 {
            let op = self.recv.read_u8()?;
            match OpKind::from_byte(op)
                .ok_or_else(|| SyncError::Protocol(format!("unknown bulk opcode {op}")))?
            {
                OpKind::Write => self.op_write()?,
                OpKind::Symlink => self.op_symlink()?,
                OpKind::Delete => self.op_delete()?,
            }
        }
        self.send_reply()
    }

    /// WRITE: open for append, creating the file (and, on a second attempt,
    /// its parent directories). The fd answer goes out before the executable
    /// bit is applied; a chmod failure is logged, not reported.
    fn op_write(&mut self) -> SyncResult<()> {
        let executable = self.recv.read_u8()? != 0;
        let path = wire::read_string(&mut self.recv)?;

        // The open is attempted even when the client overruns the advertised
        // cap; the OS reports EMFILE on its own.
        let opened = with_created_parents(&path, || {
            OpenOptions::new().append(true).create(true).open(&path)
        });
        match opened {
            Ok(file) => {
                let fd = file.as_raw_fd();
                self.reply.append_i32(fd)?;
                self.reply.append_u16(0)?;
                if let Err(err) = apply_executable_bit(&file, executable) {
                    warn!("setting mode on '{path}': {err}");
                }
                self.open_files.insert(
                    fd,
                    OpenWrite {
                        file,
                        truncated: false,
                        write_errno: 0,
                    },
                );
            }
            Err(err) => {
                self.reply.append_i32(-1)?;
                self.reply.append_u16(errno_of(&err))?;
            }
        }
        Ok(())
    }

    fn op_symlink(&mut self) -> SyncResult<()> {
        let path = wire::read_string(&mut self.recv)?;
        let target = wire::read_string(&mut self.recv)?;
        let errno = match with_created_parents(&path, || symlink(&target, &path)) {
            Ok(()) => 0,
            Err(err) => errno_of(&err),
        };
        self.reply.append_u16(errno)?;
        Ok(())
    }

    /// DELETE: a path that is already gone counts as success.
    fn op_delete(&mut self) -> SyncResult<()> {
        let path = wire::read_string(&mut self.recv)?;
        let errno = match fs::remove_file(&path) {
            Ok(()) => 0,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => errno_of(&err),
        };
        self.reply.append_u16(errno)?;
        Ok(())
    }

    /// CHUNK: append body bytes to an open fd. The first chunk truncates the
    /// file; once a write fails, later chunks for that fd are discarded and
    /// the errno is reported at BULKOP_CLOSE. Chunks never get a reply.
    fn handle_chunk(&mut self) -> SyncResult<()> {
        if !self.bulk_active {
            return Err(SyncError::Protocol(
                "CHUNK outside a bulk operation".into(),
            ));
        }
        let fd = self.recv.read_u32()? as i32;
        let entry = self
            .open_files
            .get_mut(&fd)
            .ok_or_else(|| SyncError::Protocol(format!("CHUNK for unknown fd {fd}")))?;

        if !entry.truncated {
            entry.truncated = true;
            if let Err(err) = truncate_for_body(&mut entry.file) {
                entry.write_errno = errno_of(&err);
            }
        }
        if entry.write_errno != 0 {
            return Ok(());
        }
        if let Err(err) = entry.file.write_all(self.recv.read_remaining()) {
            entry.write_errno = errno_of(&err);
        }
        Ok(())
    }

    fn handle_bulk_close(&mut self) -> SyncResult<()> {
        self.begin_reply(MsgKind::BulkCloseResults)?;
        for (fd, entry) in std::mem::take(&mut self.open_files) {
            self.reply.append_i32(fd)?;
            self.reply.append_i16(entry.write_errno as i16)?;
            drop(entry.file);
        }
        self.bulk_active = false;
        self.send_reply()
    }
}

fn chdir_creating(path: &str) -> io::Result<()> {
    match env::set_current_dir(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path)?;
            env::set_current_dir(path)
        }
        other => other,
    }
}

/// Run `attempt`; if it fails with not-found, create the parent directory
/// tree and retry once.
fn with_created_parents<T>(path: &str, attempt: impl Fn() -> io::Result<T>) -> io::Result<T> {
    match attempt() {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            match Path::new(path).parent() {
                Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)?,
                _ => return Err(err),
            }
            attempt()
        }
        other => other,
    }
}

/// Reconcile the three execute bits with the requested flag: OR in 0o111
/// when any is missing and the flag is set, mask all off when any is set and
/// the flag is clear.
fn apply_executable_bit(file: &File, executable: bool) -> io::Result<()> {
    let mode = file.metadata()?.permissions().mode() & 0o777;
    let new_mode = if executable {
        (mode & 0o111 != 0o111).then_some(mode | 0o111)
    } else {
        (mode & 0o111 != 0).then_some(mode & !0o111)
    };
    if let Some(mode) = new_mode {
        file.set_permissions(Permissions::from_mode(mode))?;
    }
    Ok(())
}

fn truncate_for_body(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(())
}

fn errno_of(err: &io::Error) -> u16 {
    err.raw_os_error().unwrap_or(libc::EIO) as u16
}
