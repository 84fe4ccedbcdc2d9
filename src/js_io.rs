//! Delivery of custom I/O calls to JavaScript functions.
//!
//! Each registered function is held as a thread-safe function. A worker hands
//! its [`PendingCall`] to the matching one; the JS function runs on the JS
//! thread and its return value (or exception) settles the call there.
//! Closing happens on the JS thread too, so once the functions are aborted no
//! queued delivery can reach JavaScript.

use std::thread::{self, ThreadId};

use napi::bindgen_prelude::*;
use napi::threadsafe_function::{ThreadsafeFunction, ThreadsafeFunctionCallMode};
use napi::JsValue;
use parking_lot::Mutex;

use crate::callback::{CallbackFault, CallbackOutcome, CallbackValue};
use crate::channel::{Capabilities, Dispatch, IoRequest, PendingCall};
use crate::error::BridgeError;

/// `(size: number) => Buffer | undefined | number`
pub type ReadCallback = ThreadsafeFunction<u32, Unknown<'static>, u32, Status, false, true>;
/// `(data: Buffer) => number | undefined`
pub type WriteCallback = ThreadsafeFunction<Buffer, Unknown<'static>, Buffer, Status, false, true>;
/// `(offset: number, whence: number) => bigint | number`
pub type SeekCallback =
  ThreadsafeFunction<FnArgs<(i64, i32)>, Unknown<'static>, FnArgs<(i64, i32)>, Status, false, true>;

fn to_callback_value(value: &Unknown<'_>) -> Result<CallbackValue> {
  Ok(match value.get_type()? {
    ValueType::Undefined | ValueType::Null => CallbackValue::Absent,
    ValueType::Number => CallbackValue::Number(unsafe { value.cast::<f64>() }?),
    ValueType::BigInt => {
      let big = unsafe { value.cast::<BigInt>() }?;
      match big.get_i64() {
        (n, true) => CallbackValue::BigInt(n),
        _ => CallbackValue::Other,
      }
    }
    ValueType::Object if value.is_buffer()? => {
      CallbackValue::Bytes(unsafe { value.cast::<Buffer>() }?.to_vec())
    }
    _ => CallbackValue::Other,
  })
}

fn outcome(ret: Result<Unknown<'static>>) -> CallbackOutcome {
  let value = ret.map_err(|err| CallbackFault::new(err.reason.clone()))?;
  to_callback_value(&value).map_err(|err| CallbackFault::new(err.reason.clone()))
}

fn answer(call: PendingCall) -> impl FnOnce(Result<Unknown<'static>>, Env) -> Result<()> + Send + 'static {
  move |ret, _env| {
    call.resolve(outcome(ret));
    Ok(())
  }
}

fn checked(status: Status) -> crate::error::Result<()> {
  match status {
    Status::Ok => Ok(()),
    Status::Closing => Err(BridgeError::RuntimeClosed),
    other => Err(BridgeError::Invariant(format!(
      "thread-safe function call failed: {other}"
    ))),
  }
}

pub struct JsDispatch {
  read: Mutex<Option<ReadCallback>>,
  write: Mutex<Option<WriteCallback>>,
  seek: Mutex<Option<SeekCallback>>,
  capabilities: Capabilities,
  js_thread: ThreadId,
}

impl JsDispatch {
  /// Must be called on the JS thread.
  pub fn new(
    read: Option<ReadCallback>,
    write: Option<WriteCallback>,
    seek: Option<SeekCallback>,
  ) -> Self {
    let capabilities = Capabilities {
      read: read.is_some(),
      write: write.is_some(),
      seek: seek.is_some(),
    };
    Self {
      read: Mutex::new(read),
      write: Mutex::new(write),
      seek: Mutex::new(seek),
      capabilities,
      js_thread: thread::current().id(),
    }
  }
}

impl Dispatch for JsDispatch {
  fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  fn on_runtime_thread(&self) -> bool {
    thread::current().id() == self.js_thread
  }

  fn dispatch(&self, call: PendingCall) -> crate::error::Result<()> {
    let released = || BridgeError::Released("callback");
    match call.request().clone() {
      IoRequest::Read { len } => {
        let read = self.read.lock();
        let f = read.as_ref().ok_or_else(released)?;
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        checked(f.call_with_return_value(len, ThreadsafeFunctionCallMode::Blocking, answer(call)))
      }
      IoRequest::Write { data } => {
        let write = self.write.lock();
        let f = write.as_ref().ok_or_else(released)?;
        checked(f.call_with_return_value(
          Buffer::from(data),
          ThreadsafeFunctionCallMode::Blocking,
          answer(call),
        ))
      }
      IoRequest::Seek { offset, whence } => {
        let seek = self.seek.lock();
        let f = seek.as_ref().ok_or_else(released)?;
        checked(f.call_with_return_value(
          FnArgs::from((offset, whence)),
          ThreadsafeFunctionCallMode::Blocking,
          answer(call),
        ))
      }
    }
  }

  fn shutdown(&self) {
    let read = self.read.lock().take();
    let write = self.write.lock().take();
    let seek = self.seek.lock().take();
    let aborted = [
      read.map(ThreadsafeFunction::abort),
      write.map(ThreadsafeFunction::abort),
      seek.map(ThreadsafeFunction::abort),
    ];
    for err in aborted.into_iter().flatten().filter_map(|r| r.err()) {
      log::warn!("failed to release JS callback: {err}");
    }
  }
}
