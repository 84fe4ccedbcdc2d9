//! Fixtures shared by the unit tests.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::avio::{AVSEEK_SIZE, SEEK_CUR, SEEK_END, SEEK_SET};
use crate::callback::{CallbackOutcome, CallbackValue, IoCallbacks};
use crate::channel::Capabilities;
use crate::error::AvError;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::handle::NativeResource;

/// A native allocation that counts its releases.
pub struct Probe {
  pub value: i32,
  released: Arc<AtomicUsize>,
}

impl Probe {
  pub fn alloc() -> (*mut Probe, Arc<AtomicUsize>) {
    let released = Arc::new(AtomicUsize::new(0));
    let probe = Box::new(Probe {
      value: 0,
      released: released.clone(),
    });
    (Box::into_raw(probe), released)
  }
}

unsafe impl NativeResource for Probe {
  const NAME: &'static str = "probe";

  unsafe fn release(ptr: NonNull<Self>) {
    let probe = Box::from_raw(ptr.as_ptr());
    probe.released.fetch_add(1, Ordering::SeqCst);
  }
}

/// Runs an [`EventLoop`] on its own thread.
pub fn spawn_loop() -> (LoopHandle, JoinHandle<()>) {
  let event_loop = EventLoop::new();
  let handle = event_loop.handle();
  let join = thread::Builder::new()
    .name("test-event-loop".into())
    .spawn(move || event_loop.run())
    .unwrap();
  (handle, join)
}

pub fn wait_until(mut done: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !done() {
    assert!(Instant::now() < deadline, "condition not reached in time");
    thread::sleep(Duration::from_millis(1));
  }
}

/// Read/write/seek callbacks over a growable in-memory file.
pub struct MemoryCallbacks {
  data: Arc<Mutex<Vec<u8>>>,
  cursor: usize,
}

impl MemoryCallbacks {
  pub fn new(data: Vec<u8>) -> Self {
    Self {
      data: Arc::new(Mutex::new(data)),
      cursor: 0,
    }
  }

  pub fn contents(&self) -> Arc<Mutex<Vec<u8>>> {
    self.data.clone()
  }
}

impl IoCallbacks for MemoryCallbacks {
  fn capabilities(&self) -> Capabilities {
    Capabilities {
      read: true,
      write: true,
      seek: true,
    }
  }

  fn read(&mut self, len: usize) -> CallbackOutcome {
    let data = self.data.lock();
    let start = self.cursor.min(data.len());
    let end = (start + len).min(data.len());
    self.cursor = end;
    Ok(CallbackValue::Bytes(data[start..end].to_vec()))
  }

  fn write(&mut self, bytes: &[u8]) -> CallbackOutcome {
    let mut data = self.data.lock();
    let end = self.cursor + bytes.len();
    if data.len() < end {
      data.resize(end, 0);
    }
    data[self.cursor..end].copy_from_slice(bytes);
    self.cursor = end;
    Ok(CallbackValue::Number(bytes.len() as f64))
  }

  fn seek(&mut self, offset: i64, whence: i32) -> CallbackOutcome {
    let len = self.data.lock().len() as i64;
    if whence & AVSEEK_SIZE != 0 {
      return Ok(CallbackValue::BigInt(len));
    }
    let target = match whence {
      SEEK_SET => offset,
      SEEK_CUR => self.cursor as i64 + offset,
      SEEK_END => len + offset,
      _ => -1,
    };
    if target < 0 {
      return Ok(CallbackValue::BigInt(i64::from(AvError::INVALID.code())));
    }
    self.cursor = target as usize;
    Ok(CallbackValue::BigInt(target))
  }
}

/// Read-only callbacks answering from a closure.
pub struct ScriptedCallbacks<F> {
  read: F,
}

impl<F> ScriptedCallbacks<F>
where
  F: FnMut(usize) -> CallbackOutcome + Send + 'static,
{
  pub fn read_only(read: F) -> Self {
    Self { read }
  }
}

impl<F> IoCallbacks for ScriptedCallbacks<F>
where
  F: FnMut(usize) -> CallbackOutcome + Send + 'static,
{
  fn capabilities(&self) -> Capabilities {
    Capabilities {
      read: true,
      ..Capabilities::default()
    }
  }

  fn read(&mut self, len: usize) -> CallbackOutcome {
    (self.read)(len)
  }
}
