//! Bounded frame buffer shared by both protocol peers.
//!
//! A `FrameBuffer` is a fixed-capacity byte region with a movable cursor and
//! a soft limit. Appenders fail with [`BufferFull`] without mutating anything
//! visible, which lets callers attempt a speculative sequence of appends and
//! roll the cursor back on failure. That rollback is the only back-pressure
//! signal the client uses to decide when a bulk request is full.

use std::fmt;

/// An append would have crossed the buffer limit. Recoverable: the cursor is
/// unchanged and the caller may flush and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

impl fmt::Display for BufferFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer limit reached")
    }
}

impl std::error::Error for BufferFull {}

/// A read ran past the buffer limit. The frame on the wire was shorter than
/// its contents claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferExhausted;

impl fmt::Display for BufferExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer exhausted before the end of the value")
    }
}

impl std::error::Error for BufferExhausted {}

#[derive(Debug)]
pub struct FrameBuffer {
    data: Box<[u8]>,
    pos: usize,
    limit: usize,
    payload_start: Option<usize>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            limit: capacity,
            payload_start: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Set the soft limit, clamped to capacity. The cursor is pulled back if
    /// it now sits past the limit.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(self.data.len());
        self.pos = self.pos.min(self.limit);
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Move the cursor to an absolute position, clamped to the limit.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.limit);
    }

    /// Move the cursor forward, clamped to the limit.
    pub fn advance(&mut self, n: usize) {
        self.seek(self.pos.saturating_add(n));
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Bytes written so far, `[0, cursor)`.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    /// The writable region between the cursor and the limit. Used to read
    /// straight from a transport or a local file into the buffer.
    pub fn window_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..self.limit]
    }

    pub fn append_bytes(&mut self, v: &[u8]) -> Result<(), BufferFull> {
        if self.remaining() < v.len() {
            return Err(BufferFull);
        }
        self.data[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
        Ok(())
    }

    pub fn append_u8(&mut self, v: u8) -> Result<(), BufferFull> {
        self.append_bytes(&[v])
    }

    pub fn append_u16(&mut self, v: u16) -> Result<(), BufferFull> {
        self.append_bytes(&v.to_le_bytes())
    }

    pub fn append_u32(&mut self, v: u32) -> Result<(), BufferFull> {
        self.append_bytes(&v.to_le_bytes())
    }

    pub fn append_i16(&mut self, v: i16) -> Result<(), BufferFull> {
        self.append_bytes(&v.to_le_bytes())
    }

    pub fn append_i32(&mut self, v: i32) -> Result<(), BufferFull> {
        self.append_bytes(&v.to_le_bytes())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], BufferExhausted> {
        if self.remaining() < n {
            return Err(BufferExhausted);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..start + n])
    }

    pub fn read_u8(&mut self) -> Result<u8, BufferExhausted> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BufferExhausted> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferExhausted> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i16(&mut self) -> Result<i16, BufferExhausted> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, BufferExhausted> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Everything between the cursor and the limit; advances to the limit.
    pub fn read_remaining(&mut self) -> &[u8] {
        let start = self.pos;
        self.pos = self.limit;
        &self.data[start..self.limit]
    }

    /// Start a framed message: write the kind byte, reserve four bytes for
    /// the payload length, and remember where the payload begins.
    pub fn begin_msg(&mut self, kind: u8) -> Result<(), BufferFull> {
        let start = self.pos;
        self.append_u8(kind)?;
        if self.remaining() < 4 {
            self.pos = start;
            return Err(BufferFull);
        }
        self.pos += 4;
        self.payload_start = Some(self.pos);
        Ok(())
    }

    /// Back-patch the payload length of the message opened by `begin_msg`.
    /// The cursor stays at the end of the message.
    pub fn end_msg(&mut self) {
        let start = self
            .payload_start
            .take()
            .expect("end_msg without a begin_msg");
        let len = (self.pos - start) as u32;
        self.data[start - 4..start].copy_from_slice(&len.to_le_bytes());
    }
}
