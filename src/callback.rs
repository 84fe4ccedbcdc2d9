//! Managed-callback values and the C entry points the native library calls.
//!
//! The trampolines below are what gets installed as the custom I/O functions
//! of an [`crate::IoContext`]. They run on whichever worker thread the native
//! call is executing on and block it until the runtime thread has answered.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::mem::ManuallyDrop;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::slice;

use crate::channel::{CallbackChannel, Capabilities, IoReply, IoRequest, IoResult};
use crate::error::{panic_message, AvError};

/// C signature of the read callback.
pub type ReadPacketFn = unsafe extern "C" fn(*mut c_void, *mut u8, c_int) -> c_int;
/// C signature of the write callback.
pub type WritePacketFn = unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int;
/// C signature of the seek callback.
pub type SeekFn = unsafe extern "C" fn(*mut c_void, i64, c_int) -> i64;

/// What a managed callback handed back, before it is interpreted per operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackValue {
  Bytes(Vec<u8>),
  /// No value (`undefined`/`null`).
  Absent,
  Number(f64),
  BigInt(i64),
  /// Anything the bridge has no interpretation for.
  Other,
}

/// A managed callback raised instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFault(String);

impl CallbackFault {
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }

  pub fn message(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CallbackFault {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::error::Error for CallbackFault {}

pub type CallbackOutcome = Result<CallbackValue, CallbackFault>;

/// Custom I/O callbacks living on the runtime thread.
///
/// Only the operations reported by [`IoCallbacks::capabilities`] are ever
/// called; requests for the others are answered with
/// [`AvError::NOT_SUPPORTED`] on the worker thread without crossing over.
pub trait IoCallbacks: Send + 'static {
  fn capabilities(&self) -> Capabilities;

  fn read(&mut self, _len: usize) -> CallbackOutcome {
    Err(CallbackFault::new("read callback not registered"))
  }

  fn write(&mut self, _data: &[u8]) -> CallbackOutcome {
    Err(CallbackFault::new("write callback not registered"))
  }

  fn seek(&mut self, _offset: i64, _whence: i32) -> CallbackOutcome {
    Err(CallbackFault::new("seek callback not registered"))
  }
}

pub(crate) fn call(callbacks: &mut dyn IoCallbacks, request: &IoRequest) -> CallbackOutcome {
  match request {
    IoRequest::Read { len } => callbacks.read(*len),
    IoRequest::Write { data } => callbacks.write(data),
    IoRequest::Seek { offset, whence } => callbacks.seek(*offset, *whence),
  }
}

fn error_from_number(n: f64) -> AvError {
  if n.is_finite() && n < 0.0 {
    AvError::from_code(n as i64)
  } else {
    AvError::IO
  }
}

fn count_from_number(n: f64, len: usize) -> IoResult {
  if n.is_finite() && n >= 0.0 {
    Ok(IoReply::Value((n as i64).min(len as i64)))
  } else {
    Err(error_from_number(n))
  }
}

/// Interprets a callback's return value for the request it answered.
pub(crate) fn translate(request: &IoRequest, value: CallbackValue) -> IoResult {
  match request {
    IoRequest::Read { len } => match value {
      CallbackValue::Bytes(bytes) if bytes.is_empty() => Err(AvError::EOF),
      CallbackValue::Bytes(mut bytes) => {
        bytes.truncate(*len);
        Ok(IoReply::Data(bytes))
      }
      CallbackValue::Absent => Err(AvError::EOF),
      CallbackValue::Number(n) => Err(error_from_number(n)),
      CallbackValue::BigInt(n) => Err(AvError::from_code(n)),
      CallbackValue::Other => Err(AvError::IO),
    },
    IoRequest::Write { data } => match value {
      CallbackValue::Number(n) => count_from_number(n, data.len()),
      CallbackValue::BigInt(n) if n >= 0 => Ok(IoReply::Value(n.min(data.len() as i64))),
      CallbackValue::BigInt(n) => Err(AvError::from_code(n)),
      _ => Ok(IoReply::Value(data.len() as i64)),
    },
    IoRequest::Seek { .. } => match value {
      CallbackValue::BigInt(n) if n >= 0 => Ok(IoReply::Value(n)),
      CallbackValue::BigInt(n) => Err(AvError::from_code(n)),
      CallbackValue::Number(n) => Err(error_from_number(n)),
      _ => Err(AvError::IO),
    },
  }
}

/// Runs `f` against the channel behind `opaque` without touching its count.
///
/// # Safety
///
/// `opaque` must come from [`CallbackChannel::as_opaque`] on a channel that is
/// still alive.
unsafe fn with_channel<R>(opaque: *mut c_void, f: impl FnOnce(&CallbackChannel) -> R) -> R {
  let channel = ManuallyDrop::new(CallbackChannel::from_opaque(opaque));
  f(&channel)
}

fn guarded<R>(fallback: R, f: impl FnOnce() -> R) -> R {
  catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
    log::error!(
      "panic in custom I/O trampoline: {}",
      panic_message(payload.as_ref())
    );
    fallback
  })
}

/// Read trampoline: fills `buf` from the runtime thread's read callback.
///
/// # Safety
///
/// `opaque` must be a live channel (see [`CallbackChannel::as_opaque`]) and
/// `buf` must be writable for `buf_size` bytes.
pub unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
  if opaque.is_null() || buf.is_null() || buf_size < 0 {
    return AvError::INVALID.code();
  }
  guarded(AvError::IO.code(), || {
    with_channel(opaque, |channel| {
      let out = slice::from_raw_parts_mut(buf, buf_size as usize);
      match channel.read(out) {
        Ok(n) => n as c_int,
        Err(err) => err.code(),
      }
    })
  })
}

/// Write trampoline: hands `buf` to the runtime thread's write callback.
///
/// # Safety
///
/// `opaque` must be a live channel and `buf` readable for `buf_size` bytes.
pub unsafe extern "C" fn write_packet(
  opaque: *mut c_void,
  buf: *const u8,
  buf_size: c_int,
) -> c_int {
  if opaque.is_null() || buf_size < 0 || (buf.is_null() && buf_size > 0) {
    return AvError::INVALID.code();
  }
  guarded(AvError::IO.code(), || {
    with_channel(opaque, |channel| {
      let data = if buf_size == 0 {
        &[][..]
      } else {
        slice::from_raw_parts(buf, buf_size as usize)
      };
      match channel.write(data) {
        Ok(n) => n as c_int,
        Err(err) => err.code(),
      }
    })
  })
}

/// Seek trampoline. `whence` is passed through, including the size-query flag.
///
/// # Safety
///
/// `opaque` must be a live channel.
pub unsafe extern "C" fn seek(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
  if opaque.is_null() {
    return i64::from(AvError::INVALID.code());
  }
  guarded(i64::from(AvError::IO.code()), || {
    with_channel(opaque, |channel| match channel.seek(offset, whence) {
      Ok(pos) => pos,
      Err(err) => i64::from(err.code()),
    })
  })
}

/// The trampolines matching a set of capabilities, in the order the native
/// allocator takes them.
pub fn trampolines(
  caps: Capabilities,
) -> (
  Option<ReadPacketFn>,
  Option<WritePacketFn>,
  Option<SeekFn>,
) {
  (
    caps.read.then_some(read_packet as ReadPacketFn),
    caps.write.then_some(write_packet as WritePacketFn),
    caps.seek.then_some(seek as SeekFn),
  )
}
