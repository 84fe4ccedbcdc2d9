//! Error types for the bridge.
//!
//! [`AvError`] is an ordinary native outcome in the library's negative-errno
//! convention and travels through the normal result path. [`BridgeError`] is
//! reserved for conditions that are surfaced as a rejected task or a thrown
//! exception.

use std::any::Any;
use std::fmt;
use std::io;
use thiserror::Error;

const fn fferrtag(a: u8, b: u8, c: u8, d: u8) -> i32 {
  -((a as i32) | ((b as i32) << 8) | ((c as i32) << 16) | ((d as i32) << 24))
}

/// A negative result code as produced and consumed by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AvError(i32);

impl AvError {
  /// End of stream (`AVERROR_EOF`).
  pub const EOF: AvError = AvError(fferrtag(b'E', b'O', b'F', b' '));
  /// Generic I/O failure, also used for faults raised by managed callbacks.
  pub const IO: AvError = AvError(-libc::EIO);
  /// The callback registration has been torn down.
  pub const CLOSED: AvError = AvError(-libc::EPERM);
  /// The requested callback was never registered.
  pub const NOT_SUPPORTED: AvError = AvError(-libc::ENOSYS);
  pub const WOULD_BLOCK: AvError = AvError(-libc::EAGAIN);
  /// A second invocation was enqueued while one was still pending.
  pub const BUSY: AvError = AvError(-libc::EBUSY);
  /// An invocation was attempted from the runtime thread itself.
  pub const DEADLOCK: AvError = AvError(-libc::EDEADLK);
  pub const INVALID: AvError = AvError(-libc::EINVAL);
  pub const NO_MEMORY: AvError = AvError(-libc::ENOMEM);

  /// `AVERROR(errno)`.
  pub const fn from_errno(errno: i32) -> Self {
    AvError(-errno)
  }

  /// Interprets a raw return value as an error code. Values that are not
  /// representable as a negative `c_int` collapse to [`AvError::IO`].
  pub fn from_code(code: i64) -> Self {
    if code < 0 && code >= i64::from(i32::MIN) {
      AvError(code as i32)
    } else {
      Self::IO
    }
  }

  pub const fn code(self) -> i32 {
    self.0
  }

  pub fn is_eof(self) -> bool {
    self == Self::EOF
  }

  /// The errno this code was built from, if it is not a tag code.
  pub fn errno(self) -> Option<i32> {
    if self.is_eof() {
      None
    } else {
      Some(-self.0)
    }
  }
}

impl fmt::Display for AvError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.errno() {
      None => write!(f, "End of file"),
      Some(errno) => write!(f, "{} ({})", io::Error::from_raw_os_error(errno), self.0),
    }
  }
}

impl std::error::Error for AvError {}

/// Conditions that reject a task instead of resolving it with a code.
#[derive(Debug, Error)]
pub enum BridgeError {
  #[error("allocation failed: {0}")]
  OutOfMemory(&'static str),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("internal invariant violated: {0}")]
  Invariant(String),

  /// The resource was closed or its native memory already freed.
  #[error("{0} has been released")]
  Released(&'static str),

  /// The runtime thread no longer accepts work, so a completion cannot be delivered.
  #[error("runtime thread is no longer accepting work")]
  RuntimeClosed,

  #[error("worker thread panicked: {0}")]
  Worker(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
  /// Stable `ERR_*` code for the host runtime.
  pub fn code(&self) -> &'static str {
    match self {
      Self::OutOfMemory(_) => "ERR_OUT_OF_MEMORY",
      Self::InvalidArgument(_) => "ERR_INVALID_ARG",
      Self::Invariant(_) | Self::Worker(_) => "ERR_INTERNAL",
      Self::Released(_) => "ERR_RELEASED",
      Self::RuntimeClosed => "ERR_RUNTIME_CLOSED",
    }
  }

  pub(crate) fn invalid(msg: impl Into<String>) -> Self {
    Self::InvalidArgument(msg.into())
  }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
