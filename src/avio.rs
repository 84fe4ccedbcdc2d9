//! Buffered custom I/O contexts and the streams built on them.
//!
//! [`IoContext`] follows the library's AVIO conventions: it owns a fixed-size
//! buffer and talks to its data source only through three C function pointers
//! and an `opaque` argument. [`CustomIo`] binds one context to a
//! [`CallbackRegistration`] so that those function pointers end up in managed
//! callbacks on the runtime thread.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::ptr::NonNull;

use crate::callback::{self, ReadPacketFn, SeekFn, WritePacketFn};
use crate::channel::{CallbackRegistration, Capabilities, Dispatch};
use crate::config::IoConfig;
use crate::error::{AvError, BridgeError, Result};
use crate::handle::{NativePtr, NativeResource, ResourceHandle};
use crate::lease::Lease;
use crate::refbuf::alloc_bytes;

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;
/// Asks the seek callback for the stream size instead of moving.
pub const AVSEEK_SIZE: i32 = 0x10000;
/// Hint that a seek should happen even if it is expensive. Never reaches the
/// seek callback.
pub const AVSEEK_FORCE: i32 = 0x20000;

type IoOutcome<T> = std::result::Result<T, AvError>;

fn clamp_len(len: usize) -> c_int {
  len.min(c_int::MAX as usize) as c_int
}

pub struct IoContext {
  opaque: *mut c_void,
  read_packet: Option<ReadPacketFn>,
  write_packet: Option<WritePacketFn>,
  seek: Option<SeekFn>,
  buffer: Box<[u8]>,
  /// Unread bytes are `buffer[read_pos..read_end]`.
  read_pos: usize,
  read_end: usize,
  /// Pending output is `buffer[..write_len]`.
  write_len: usize,
  /// Position of the underlying stream: just past the read buffer, or where
  /// the pending output will land.
  pos: i64,
  write_flag: bool,
  eof_reached: bool,
  error: Option<AvError>,
}

impl IoContext {
  /// Allocates a context with its own buffer of `config.buffer_size` bytes.
  ///
  /// # Safety
  ///
  /// `opaque` must stay valid for the functions below for the context's whole
  /// life.
  pub unsafe fn alloc(
    config: &IoConfig,
    opaque: *mut c_void,
    read_packet: Option<ReadPacketFn>,
    write_packet: Option<WritePacketFn>,
    seek: Option<SeekFn>,
  ) -> Result<ResourceHandle<IoContext>> {
    if config.buffer_size == 0 {
      return Err(BridgeError::invalid("buffer size must be positive"));
    }
    let buffer = alloc_bytes(config.buffer_size).ok_or(BridgeError::OutOfMemory("io buffer"))?;
    let ctx = Box::new(IoContext {
      opaque,
      read_packet,
      write_packet,
      seek,
      buffer,
      read_pos: 0,
      read_end: 0,
      write_len: 0,
      pos: 0,
      write_flag: config.write_flag,
      eof_reached: false,
      error: None,
    });
    Ok(ResourceHandle::from_owned(Box::into_raw(ctx)))
  }

  pub fn buffer_size(&self) -> usize {
    self.buffer.len()
  }

  pub fn is_writable(&self) -> bool {
    self.write_flag
  }

  pub fn eof_reached(&self) -> bool {
    self.eof_reached
  }

  /// Sticky error from the last failed transfer, cleared by a successful seek.
  pub fn error(&self) -> Option<AvError> {
    self.error
  }

  /// Current logical position.
  pub fn tell(&self) -> i64 {
    self.pos - (self.read_end - self.read_pos) as i64 + self.write_len as i64
  }

  fn drop_read_buffer(&mut self) -> IoOutcome<()> {
    let unread = self.read_end - self.read_pos;
    if unread > 0 {
      // The source is ahead of the caller; move it back before writing.
      let target = self.tell();
      let seek = self.seek.ok_or(AvError::NOT_SUPPORTED)?;
      // SAFETY: alloc's contract on `opaque`.
      let ret = unsafe { seek(self.opaque, target, SEEK_SET) };
      if ret < 0 {
        return Err(AvError::from_code(ret));
      }
      self.pos = ret;
    }
    self.read_pos = 0;
    self.read_end = 0;
    Ok(())
  }

  fn record(&mut self, err: AvError) -> AvError {
    self.error = Some(err);
    self.eof_reached = true;
    err
  }

  /// Reads into `out` until it is full, the source reports end of file, or an
  /// error occurs. Returns the number of bytes read; a read that got nothing
  /// reports [`AvError::EOF`] or the error instead.
  pub fn read(&mut self, out: &mut [u8]) -> IoOutcome<usize> {
    if out.is_empty() {
      return Ok(0);
    }
    let read_packet = self.read_packet.ok_or(AvError::NOT_SUPPORTED)?;
    self.flush()?;

    let mut filled = 0;
    while filled < out.len() {
      let unread = self.read_end - self.read_pos;
      if unread > 0 {
        let n = unread.min(out.len() - filled);
        out[filled..filled + n].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + n]);
        self.read_pos += n;
        filled += n;
        continue;
      }
      if self.eof_reached {
        break;
      }

      let wanted = out.len() - filled;
      let direct = wanted >= self.buffer.len();
      let (dst, cap) = if direct {
        (out[filled..].as_mut_ptr(), clamp_len(wanted))
      } else {
        (self.buffer.as_mut_ptr(), clamp_len(self.buffer.len()))
      };
      // SAFETY: `dst` is writable for `cap` bytes; alloc's contract on `opaque`.
      let ret = unsafe { read_packet(self.opaque, dst, cap) };
      if ret == 0 || ret == AvError::EOF.code() {
        self.eof_reached = true;
        break;
      }
      if ret < 0 {
        self.record(AvError::from_code(i64::from(ret)));
        break;
      }
      let n = (ret as usize).min(cap as usize);
      self.pos += n as i64;
      if direct {
        filled += n;
        // The buffer no longer ends at `pos`.
        self.read_pos = 0;
        self.read_end = 0;
      } else {
        self.read_pos = 0;
        self.read_end = n;
      }
    }

    if filled > 0 {
      return Ok(filled);
    }
    Err(self.error.unwrap_or(AvError::EOF))
  }

  /// Buffers `data`, handing full buffers to the write callback.
  pub fn write(&mut self, data: &[u8]) -> IoOutcome<usize> {
    if self.write_packet.is_none() {
      return Err(AvError::NOT_SUPPORTED);
    }
    if !self.write_flag {
      return Err(AvError::INVALID);
    }
    self.drop_read_buffer()?;

    let mut rest = data;
    while !rest.is_empty() {
      let n = (self.buffer.len() - self.write_len).min(rest.len());
      self.buffer[self.write_len..self.write_len + n].copy_from_slice(&rest[..n]);
      self.write_len += n;
      rest = &rest[n..];
      if self.write_len == self.buffer.len() {
        self.flush()?;
      }
    }
    Ok(data.len())
  }

  /// Hands pending output to the write callback. A non-negative return counts
  /// as the whole buffer written.
  pub fn flush(&mut self) -> IoOutcome<()> {
    if self.write_len == 0 {
      return Ok(());
    }
    let len = std::mem::take(&mut self.write_len);
    let write_packet = self.write_packet.ok_or(AvError::NOT_SUPPORTED)?;
    // SAFETY: the first `len` bytes of the buffer are initialized; alloc's
    // contract on `opaque`.
    let ret = unsafe { write_packet(self.opaque, self.buffer.as_ptr(), clamp_len(len)) };
    if ret < 0 {
      return Err(self.record(AvError::from_code(i64::from(ret))));
    }
    self.pos += len as i64;
    Ok(())
  }

  /// Moves to a new position and returns it.
  ///
  /// `SEEK_CUR` and `SEEK_END` are resolved to an absolute offset first, so the
  /// seek callback only ever sees `SEEK_SET` (or the size query). Targets
  /// inside the read buffer are served without calling out.
  pub fn seek(&mut self, offset: i64, whence: i32) -> IoOutcome<i64> {
    let whence = whence & !AVSEEK_FORCE;
    let target = match whence {
      SEEK_SET => offset,
      SEEK_CUR => self.tell() + offset,
      SEEK_END => self.size()? + offset,
      AVSEEK_SIZE => return self.size(),
      _ => return Err(AvError::INVALID),
    };
    if target < 0 {
      return Err(AvError::INVALID);
    }

    if self.write_len == 0 {
      let buffer_start = self.pos - self.read_end as i64;
      if target >= buffer_start && target <= self.pos {
        self.read_pos = (target - buffer_start) as usize;
        self.eof_reached = false;
        return Ok(target);
      }
    }

    let seek = self.seek.ok_or(AvError::NOT_SUPPORTED)?;
    self.flush()?;
    // SAFETY: alloc's contract on `opaque`.
    let ret = unsafe { seek(self.opaque, target, SEEK_SET) };
    if ret < 0 {
      return Err(AvError::from_code(ret));
    }
    self.pos = ret;
    self.read_pos = 0;
    self.read_end = 0;
    self.eof_reached = false;
    self.error = None;
    Ok(ret)
  }

  /// Total stream size. Pending output is flushed first so it is counted.
  ///
  /// Uses the size query and falls back to probing the end when the callback
  /// does not answer it.
  pub fn size(&mut self) -> IoOutcome<i64> {
    let seek = self.seek.ok_or(AvError::NOT_SUPPORTED)?;
    self.flush()?;
    // SAFETY: alloc's contract on `opaque`.
    let size = unsafe { seek(self.opaque, 0, AVSEEK_SIZE) };
    if size >= 0 {
      return Ok(size);
    }

    let end = unsafe { seek(self.opaque, -1, SEEK_END) };
    if end < 0 {
      return Err(AvError::from_code(end));
    }
    let restored = unsafe { seek(self.opaque, self.pos, SEEK_SET) };
    if restored < 0 {
      log::warn!("could not restore position {} after probing stream size", self.pos);
      return Err(self.record(AvError::from_code(restored)));
    }
    Ok(end + 1)
  }
}

impl Drop for IoContext {
  fn drop(&mut self) {
    if self.write_len > 0 {
      log::warn!("discarding {} unflushed byte(s)", self.write_len);
    }
  }
}

// SAFETY: IoContexts are only created by `IoContext::alloc`, which boxes them.
unsafe impl NativeResource for IoContext {
  const NAME: &'static str = "io context";

  unsafe fn release(ptr: NonNull<Self>) {
    drop(Box::from_raw(ptr.as_ptr()));
  }
}

impl fmt::Debug for IoContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("IoContext")
      .field("buffer_size", &self.buffer.len())
      .field("pos", &self.tell())
      .field("write_flag", &self.write_flag)
      .field("eof_reached", &self.eof_reached)
      .field("error", &self.error)
      .finish()
  }
}

struct OpenIo {
  handle: ResourceHandle<IoContext>,
  lease: Lease<IoContext>,
  registration: CallbackRegistration,
}

/// A custom I/O context wired to managed callbacks.
///
/// Lives on the runtime thread. Workers reach the context through
/// [`CustomIo::lease`].
pub struct CustomIo {
  open: Option<OpenIo>,
  capabilities: Capabilities,
}

impl CustomIo {
  pub fn open(config: &IoConfig, dispatch: impl Dispatch) -> Result<Self> {
    let registration = CallbackRegistration::new(dispatch);
    let capabilities = registration.capabilities();
    let channel = registration.channel();
    let (read, write, seek) = callback::trampolines(capabilities);
    // SAFETY: the registration keeps the channel behind `opaque` alive until
    // after the context is freed (see CloseTicket's drop).
    let handle = unsafe { IoContext::alloc(config, channel.as_opaque(), read, write, seek)? };
    let native = handle
      .native()
      .ok_or_else(|| BridgeError::Invariant("io context allocated as null".into()))?;
    log::debug!("opened custom io {native:?} with {capabilities:?}");
    Ok(Self {
      open: Some(OpenIo {
        handle,
        lease: Lease::new(native),
        registration,
      }),
      capabilities,
    })
  }

  pub fn is_closed(&self) -> bool {
    self.open.is_none()
  }

  pub fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  pub fn lease(&self) -> Result<Lease<IoContext>> {
    self
      .open
      .as_ref()
      .map(|open| open.lease.clone())
      .ok_or(BridgeError::Released(IoContext::NAME))
  }

  /// Detaches the context for an asynchronous close. The stream reports closed
  /// from here on; the ticket finishes the job when dropped.
  pub fn begin_close(&mut self) -> Option<CloseTicket> {
    let OpenIo {
      mut handle,
      lease,
      registration,
    } = self.open.take()?;
    let ctx = handle.native();
    handle.release();
    Some(CloseTicket {
      registration,
      lease,
      ctx,
    })
  }

  /// Closes synchronously: deactivates the callbacks, waits for in-flight
  /// native use to drain and frees the context.
  pub fn close(&mut self) {
    drop(self.begin_close());
  }
}

impl Drop for CustomIo {
  fn drop(&mut self) {
    if !self.is_closed() {
      log::debug!("closing custom io that was never closed explicitly");
      self.close();
    }
  }
}

impl fmt::Debug for CustomIo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CustomIo")
      .field("capabilities", &self.capabilities)
      .field("closed", &self.is_closed())
      .finish()
  }
}

/// Everything an in-progress close still owns.
///
/// While the ticket lives the callbacks stay registered, so a final flush on a
/// worker can still reach them. Dropping it closes the registration, seals the
/// lease and frees the context, in that order.
pub struct CloseTicket {
  registration: CallbackRegistration,
  lease: Lease<IoContext>,
  ctx: Option<NativePtr<IoContext>>,
}

impl CloseTicket {
  pub fn lease(&self) -> &Lease<IoContext> {
    &self.lease
  }
}

impl Drop for CloseTicket {
  fn drop(&mut self) {
    self.registration.close();
    self.lease.seal();
    if let Some(ctx) = self.ctx.take() {
      log::debug!("releasing {} at {:?}", IoContext::NAME, ctx);
      // SAFETY: released from its handle in begin_close; sealed above, so no
      // worker can still be using it.
      unsafe { IoContext::release(ctx.as_non_null()) };
    }
  }
}

impl fmt::Debug for CloseTicket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CloseTicket").field("ctx", &self.ctx).finish()
  }
}
