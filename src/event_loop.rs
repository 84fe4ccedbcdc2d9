//! A minimal single-threaded runtime: one thread drains a job queue.
//!
//! This is the pure-Rust stand-in for a host event loop. It is what the core is
//! embedded in when no JavaScript engine is around, and what the tests drive.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, Thread};

use crossbeam_queue::SegQueue;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::callback::{self, CallbackFault, IoCallbacks};
use crate::channel::{Capabilities, Dispatch, PendingCall};
use crate::error::{panic_message, BridgeError, Result};
use crate::executor::{Job, Scheduler};

struct Inner {
  queue: SegQueue<Job>,
  open: RwLock<bool>,
  thread: OnceCell<Thread>,
}

impl Inner {
  fn wake(&self) {
    if let Some(thread) = self.thread.get() {
      thread.unpark();
    }
  }

  fn drain(&self) -> usize {
    let mut ran = 0;
    while let Some(job) = self.queue.pop() {
      if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        log::error!("event loop job panicked: {}", panic_message(payload.as_ref()));
      }
      ran += 1;
    }
    ran
  }
}

pub struct EventLoop {
  inner: Arc<Inner>,
}

impl EventLoop {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        queue: SegQueue::new(),
        open: RwLock::new(true),
        thread: OnceCell::new(),
      }),
    }
  }

  pub fn handle(&self) -> LoopHandle {
    LoopHandle {
      inner: self.inner.clone(),
    }
  }

  /// Makes the calling thread the loop thread and runs jobs until
  /// [`LoopHandle::stop`]. Jobs posted before the stop still run.
  pub fn run(self) {
    if self.inner.thread.set(thread::current()).is_err() {
      log::error!("event loop is already bound to a thread");
      return;
    }
    log::debug!("event loop running on {:?}", thread::current().id());
    loop {
      self.inner.drain();
      if !*self.inner.open.read() {
        break;
      }
      thread::park();
    }
    self.inner.drain();
    log::debug!("event loop stopped");
  }

  /// Runs whatever is queued right now on the calling thread.
  pub fn run_pending(&self) -> usize {
    self.inner.drain()
  }
}

impl Default for EventLoop {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for EventLoop {
  fn drop(&mut self) {
    *self.inner.open.write() = false;
    let mut dropped = 0;
    while let Some(job) = self.inner.queue.pop() {
      drop(job);
      dropped += 1;
    }
    if dropped > 0 {
      log::warn!("event loop dropped {dropped} job(s) that never ran");
    }
  }
}

#[derive(Clone)]
pub struct LoopHandle {
  inner: Arc<Inner>,
}

impl LoopHandle {
  /// Queues `job` for the loop thread. Fails once the loop has stopped; the job
  /// is dropped unrun.
  pub fn post(&self, job: Job) -> Result<()> {
    {
      let open = self.inner.open.read();
      if !*open {
        return Err(BridgeError::RuntimeClosed);
      }
      self.inner.queue.push(job);
    }
    self.inner.wake();
    Ok(())
  }

  pub fn stop(&self) {
    *self.inner.open.write() = false;
    self.inner.wake();
  }

  pub fn is_running(&self) -> bool {
    *self.inner.open.read()
  }

  pub fn is_loop_thread(&self) -> bool {
    self
      .inner
      .thread
      .get()
      .is_some_and(|t| t.id() == thread::current().id())
  }
}

impl Scheduler for LoopHandle {
  fn schedule(&self, job: Job) -> Result<()> {
    self.post(job)
  }
}

struct Hosted<C> {
  callbacks: Option<C>,
  shut: bool,
}

/// Delivers pending calls to [`IoCallbacks`] living on an [`EventLoop`].
pub struct LoopDispatch<C> {
  handle: LoopHandle,
  capabilities: Capabilities,
  hosted: Arc<Mutex<Hosted<C>>>,
}

impl<C: IoCallbacks> LoopDispatch<C> {
  pub fn new(handle: LoopHandle, callbacks: C) -> Self {
    Self {
      handle,
      capabilities: callbacks.capabilities(),
      hosted: Arc::new(Mutex::new(Hosted {
        callbacks: Some(callbacks),
        shut: false,
      })),
    }
  }
}

// The callbacks are taken out of the lock while they run so a callback may
// close its own registration (which ends in `shutdown`) without deadlocking.
fn run_hosted<C: IoCallbacks>(hosted: &Mutex<Hosted<C>>, call: PendingCall) {
  let taken = hosted.lock().callbacks.take();
  let Some(mut callbacks) = taken else {
    call.run(|_| Err(CallbackFault::new("callbacks already released")));
    return;
  };
  call.run(|request| callback::call(&mut callbacks, request));

  let mut slot = hosted.lock();
  if !slot.shut {
    slot.callbacks = Some(callbacks);
    return;
  }
  drop(slot);
  log::debug!("releasing callbacks after their final call");
  drop(callbacks);
}

impl<C: IoCallbacks> Dispatch for LoopDispatch<C> {
  fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  fn on_runtime_thread(&self) -> bool {
    self.handle.is_loop_thread()
  }

  fn dispatch(&self, call: PendingCall) -> Result<()> {
    let hosted = self.hosted.clone();
    self.handle.post(Box::new(move || run_hosted(&hosted, call)))
  }

  fn shutdown(&self) {
    let released = {
      let mut slot = self.hosted.lock();
      slot.shut = true;
      slot.callbacks.take()
    };
    drop(released);
  }
}
