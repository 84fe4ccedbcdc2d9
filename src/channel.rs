//! Blocking invocation of runtime-thread callbacks from worker threads.
//!
//! A worker thread that needs data only the runtime thread can supply parks a
//! request in the channel's single slot, hands a [`PendingCall`] to the
//! runtime thread through a [`Dispatch`] implementation, and blocks until the
//! call is settled. The slot moves through
//! `Idle -> Queued -> Running -> Done -> Idle`; teardown may short-circuit
//! `Queued -> Done` with [`AvError::CLOSED`]. Every transition happens under
//! one lock, so the "still active?" check and the start of the callback can
//! never interleave with teardown.

use std::ffi::c_void;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::callback::{self, CallbackFault, CallbackOutcome};
use crate::error::{panic_message, AvError, BridgeError};

/// Which custom I/O callbacks are registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
  pub read: bool,
  pub write: bool,
  pub seek: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoRequest {
  Read { len: usize },
  Write { data: Vec<u8> },
  Seek { offset: i64, whence: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoReply {
  Data(Vec<u8>),
  Value(i64),
}

pub type IoResult = Result<IoReply, AvError>;

/// Delivers pending calls to the runtime thread.
pub trait Dispatch: Send + Sync + 'static {
  fn capabilities(&self) -> Capabilities;

  /// Whether the calling thread is the runtime thread.
  fn on_runtime_thread(&self) -> bool;

  /// Queues `call` for the runtime thread. On error the call is dropped and
  /// the waiting worker sees [`AvError::IO`].
  fn dispatch(&self, call: PendingCall) -> Result<(), BridgeError>;

  /// Releases the managed callback handles. Called once, after deactivation.
  fn shutdown(&self) {}
}

enum Slot {
  Idle,
  Queued(u64),
  Running { id: u64, thread: ThreadId },
  Done { id: u64, result: IoResult },
}

struct State {
  active: bool,
  slot: Slot,
  next_id: u64,
}

struct Shared {
  state: Mutex<State>,
  signal: Condvar,
  capabilities: Capabilities,
  dispatch: Box<dyn Dispatch>,
}

impl Shared {
  /// Stores the result if `id` is still the call in flight.
  fn settle(&self, id: u64, result: IoResult) -> bool {
    let mut state = self.state.lock();
    let pending = match state.slot {
      Slot::Queued(current) => current == id,
      Slot::Running { id: current, .. } => current == id,
      _ => false,
    };
    if pending {
      state.slot = Slot::Done { id, result };
      self.signal.notify_all();
    }
    pending
  }

  fn wait(&self, id: u64) -> IoResult {
    let mut state = self.state.lock();
    loop {
      if matches!(state.slot, Slot::Done { id: done, .. } if done == id) {
        if let Slot::Done { result, .. } = std::mem::replace(&mut state.slot, Slot::Idle) {
          self.signal.notify_all();
          return result;
        }
      }
      self.signal.wait(&mut state);
    }
  }

  fn close(&self) {
    let mut state = self.state.lock();
    if !state.active {
      return;
    }
    state.active = false;
    if let Slot::Queued(id) = state.slot {
      state.slot = Slot::Done {
        id,
        result: Err(AvError::CLOSED),
      };
    }
    self.signal.notify_all();

    let me = thread::current().id();
    loop {
      match state.slot {
        Slot::Idle => break,
        Slot::Running { thread, .. } if thread == me => {
          log::debug!("registration closed from inside its own callback");
          break;
        }
        _ => self.signal.wait(&mut state),
      }
    }
    drop(state);
    self.dispatch.shutdown();
  }
}

/// Worker-side end of a callback registration. Cheap to clone.
#[derive(Clone)]
pub struct CallbackChannel {
  shared: Arc<Shared>,
}

impl CallbackChannel {
  pub fn capabilities(&self) -> Capabilities {
    self.shared.capabilities
  }

  pub fn is_active(&self) -> bool {
    self.shared.state.lock().active
  }

  /// Whether a call is between enqueue and consumption.
  pub fn in_flight(&self) -> bool {
    !matches!(self.shared.state.lock().slot, Slot::Idle)
  }

  /// Pointer suitable as the native library's `opaque` argument. Valid for as
  /// long as any clone of this channel is alive.
  pub fn as_opaque(&self) -> *mut c_void {
    Arc::as_ptr(&self.shared) as *mut c_void
  }

  /// Rebuilds a channel from [`Self::as_opaque`], taking over one count.
  ///
  /// # Safety
  ///
  /// `opaque` must come from `as_opaque` on a live channel, and the returned
  /// value must not be dropped unless a count was added for it.
  pub(crate) unsafe fn from_opaque(opaque: *mut c_void) -> Self {
    Self {
      shared: Arc::from_raw(opaque as *const Shared),
    }
  }

  /// Runs one request on the runtime thread and blocks until it is answered.
  pub fn invoke(&self, request: IoRequest) -> IoResult {
    if self.shared.dispatch.on_runtime_thread() {
      log::error!("custom I/O invoked from the runtime thread; refusing to block it");
      return Err(AvError::DEADLOCK);
    }

    let id = {
      let mut state = self.shared.state.lock();
      if !state.active {
        return Err(AvError::CLOSED);
      }
      if !matches!(state.slot, Slot::Idle) {
        log::error!("custom I/O invoked while another call is still pending");
        return Err(AvError::BUSY);
      }
      let id = state.next_id;
      state.next_id += 1;
      state.slot = Slot::Queued(id);
      id
    };

    let call = PendingCall {
      shared: self.shared.clone(),
      id,
      request,
      settled: false,
    };
    if let Err(err) = self.shared.dispatch.dispatch(call) {
      log::warn!("custom I/O call could not reach the runtime thread: {err}");
      self.shared.settle(id, Err(AvError::IO));
    }
    self.shared.wait(id)
  }

  /// Reads up to `buf.len()` bytes. `Ok(0)` only for an empty `buf`.
  pub fn read(&self, buf: &mut [u8]) -> Result<usize, AvError> {
    if !self.shared.capabilities.read {
      return Err(AvError::NOT_SUPPORTED);
    }
    if buf.is_empty() {
      return Ok(0);
    }
    match self.invoke(IoRequest::Read { len: buf.len() })? {
      IoReply::Data(bytes) => {
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
      }
      IoReply::Value(_) => Err(AvError::IO),
    }
  }

  pub fn write(&self, data: &[u8]) -> Result<usize, AvError> {
    if !self.shared.capabilities.write {
      return Err(AvError::NOT_SUPPORTED);
    }
    match self.invoke(IoRequest::Write {
      data: data.to_vec(),
    })? {
      IoReply::Value(n) => Ok(n as usize),
      IoReply::Data(_) => Err(AvError::IO),
    }
  }

  pub fn seek(&self, offset: i64, whence: i32) -> Result<i64, AvError> {
    if !self.shared.capabilities.seek {
      return Err(AvError::NOT_SUPPORTED);
    }
    match self.invoke(IoRequest::Seek { offset, whence })? {
      IoReply::Value(pos) => Ok(pos),
      IoReply::Data(_) => Err(AvError::IO),
    }
  }
}

impl fmt::Debug for CallbackChannel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CallbackChannel")
      .field("capabilities", &self.shared.capabilities)
      .field("active", &self.is_active())
      .finish()
  }
}

/// The runtime-thread half of one in-flight invocation.
///
/// Settled exactly once: by [`PendingCall::run`], [`PendingCall::resolve`], or,
/// if it is dropped unanswered, with [`AvError::IO`].
pub struct PendingCall {
  shared: Arc<Shared>,
  id: u64,
  request: IoRequest,
  settled: bool,
}

impl PendingCall {
  pub fn request(&self) -> &IoRequest {
    &self.request
  }

  /// Whether the registration is still active and this call not yet settled.
  pub fn is_live(&self) -> bool {
    let state = self.shared.state.lock();
    state.active && matches!(state.slot, Slot::Queued(id) if id == self.id)
  }

  /// Runs `callback` on the current thread unless the registration was torn
  /// down first, then settles the call with its translated outcome. Panics
  /// raised by `callback` are settled as [`AvError::IO`].
  pub fn run<F>(mut self, callback: F)
  where
    F: FnOnce(&IoRequest) -> CallbackOutcome,
  {
    {
      let mut state = self.shared.state.lock();
      if !matches!(state.slot, Slot::Queued(id) if id == self.id) {
        self.settled = true;
        return;
      }
      if !state.active {
        state.slot = Slot::Done {
          id: self.id,
          result: Err(AvError::CLOSED),
        };
        self.shared.signal.notify_all();
        self.settled = true;
        return;
      }
      state.slot = Slot::Running {
        id: self.id,
        thread: thread::current().id(),
      };
    }

    let request = &self.request;
    let outcome = catch_unwind(AssertUnwindSafe(|| callback(request))).unwrap_or_else(|payload| {
      Err(CallbackFault::new(panic_message(payload.as_ref())))
    });
    self.resolve_outcome(outcome);
  }

  /// Settles the call with an outcome produced elsewhere on the runtime
  /// thread. Has no effect if teardown already settled it.
  pub fn resolve(mut self, outcome: CallbackOutcome) {
    self.resolve_outcome(outcome);
  }

  fn resolve_outcome(&mut self, outcome: CallbackOutcome) {
    let result = match outcome {
      Ok(value) => callback::translate(&self.request, value),
      Err(fault) => {
        log::warn!("custom I/O callback failed: {fault}");
        Err(AvError::IO)
      }
    };
    self.settled = true;
    self.shared.settle(self.id, result);
  }
}

impl Drop for PendingCall {
  fn drop(&mut self) {
    if !self.settled && self.shared.settle(self.id, Err(AvError::IO)) {
      log::warn!("custom I/O call dropped before the runtime thread answered it");
    }
  }
}

impl fmt::Debug for PendingCall {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PendingCall")
      .field("id", &self.id)
      .field("request", &self.request)
      .finish()
  }
}

/// Runtime-side owner of a set of custom I/O callbacks.
///
/// Closing (or dropping) flips the registration inactive first, fails a call
/// that is queued but not started, waits until no worker is inside the slot,
/// and only then releases the managed callback handles.
pub struct CallbackRegistration {
  channel: CallbackChannel,
}

impl CallbackRegistration {
  pub fn new(dispatch: impl Dispatch) -> Self {
    let capabilities = dispatch.capabilities();
    Self {
      channel: CallbackChannel {
        shared: Arc::new(Shared {
          state: Mutex::new(State {
            active: true,
            slot: Slot::Idle,
            next_id: 0,
          }),
          signal: Condvar::new(),
          capabilities,
          dispatch: Box::new(dispatch),
        }),
      },
    }
  }

  pub fn channel(&self) -> CallbackChannel {
    self.channel.clone()
  }

  pub fn capabilities(&self) -> Capabilities {
    self.channel.capabilities()
  }

  pub fn is_active(&self) -> bool {
    self.channel.is_active()
  }

  /// Idempotent.
  pub fn close(&mut self) {
    self.channel.shared.close();
  }
}

impl Drop for CallbackRegistration {
  fn drop(&mut self) {
    self.close();
  }
}

impl fmt::Debug for CallbackRegistration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("CallbackRegistration")
      .field(&self.channel)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::callback::CallbackValue;
  use crate::event_loop::{EventLoop, LoopDispatch};
  use crate::testing::{spawn_loop, wait_until, MemoryCallbacks, ScriptedCallbacks};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  /// Holds calls without ever answering them.
  struct Parked {
    calls: Mutex<Vec<PendingCall>>,
    runtime: AtomicBool,
    refuse: bool,
  }

  impl Parked {
    fn new() -> Self {
      Self {
        calls: Mutex::new(Vec::new()),
        runtime: AtomicBool::new(false),
        refuse: false,
      }
    }
  }

  impl Dispatch for Arc<Parked> {
    fn capabilities(&self) -> Capabilities {
      Capabilities {
        read: true,
        write: true,
        seek: false,
      }
    }

    fn on_runtime_thread(&self) -> bool {
      self.runtime.load(Ordering::SeqCst)
    }

    fn dispatch(&self, call: PendingCall) -> Result<(), BridgeError> {
      if self.refuse {
        return Err(BridgeError::RuntimeClosed);
      }
      self.calls.lock().push(call);
      Ok(())
    }

    fn shutdown(&self) {
      self.calls.lock().clear();
    }
  }

  #[test]
  fn test_read_and_write_cross_to_the_loop_thread() {
    let (handle, join) = spawn_loop();
    let registration = CallbackRegistration::new(LoopDispatch::new(
      handle.clone(),
      MemoryCallbacks::new(b"hello world".to_vec()),
    ));
    let channel = registration.channel();

    let worker = std::thread::spawn(move || {
      let mut buf = [0u8; 5];
      let n = channel.read(&mut buf).unwrap();
      assert_eq!(&buf[..n], b"hello");
      assert_eq!(channel.write(b"!!").unwrap(), 2);
      assert_eq!(channel.seek(0, 0).unwrap(), 0);
      let mut all = [0u8; 64];
      let n = channel.read(&mut all).unwrap();
      assert_eq!(&all[..n], b"hello!!orld");
    });
    worker.join().unwrap();

    drop(registration);
    handle.stop();
    join.join().unwrap();
  }

  #[test]
  fn test_unregistered_capability_is_not_supported() {
    let (handle, join) = spawn_loop();
    let callbacks = ScriptedCallbacks::read_only(|_| Ok(CallbackValue::Bytes(vec![1])));
    let registration = CallbackRegistration::new(LoopDispatch::new(handle.clone(), callbacks));
    let channel = registration.channel();

    let worker = std::thread::spawn(move || {
      assert_eq!(channel.seek(0, 0), Err(AvError::NOT_SUPPORTED));
      assert_eq!(channel.write(b"x"), Err(AvError::NOT_SUPPORTED));
      let mut buf = [0u8; 1];
      assert_eq!(channel.read(&mut buf), Ok(1));
    });
    worker.join().unwrap();

    drop(registration);
    handle.stop();
    join.join().unwrap();
  }

  #[test]
  fn test_close_while_blocked_resolves_closed_without_invoking() {
    let event_loop = EventLoop::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let callbacks = ScriptedCallbacks::read_only(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(CallbackValue::Bytes(vec![0; 4]))
    });
    let mut registration =
      CallbackRegistration::new(LoopDispatch::new(event_loop.handle(), callbacks));
    let channel = registration.channel();

    // The loop is not being driven, so the call stays queued.
    let probe = channel.clone();
    let worker = std::thread::spawn(move || {
      let mut buf = [0u8; 4];
      channel.read(&mut buf)
    });
    wait_until(|| probe.in_flight());

    registration.close();
    assert_eq!(worker.join().unwrap(), Err(AvError::CLOSED));
    assert!(!probe.in_flight());

    // The queued job now runs and must not reach the callback.
    event_loop.run_pending();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_invoke_after_close_fails_fast() {
    let parked = Arc::new(Parked::new());
    let mut registration = CallbackRegistration::new(parked.clone());
    let channel = registration.channel();
    registration.close();
    registration.close();

    assert!(!channel.is_active());
    let mut buf = [0u8; 1];
    assert_eq!(channel.read(&mut buf), Err(AvError::CLOSED));
    assert!(parked.calls.lock().is_empty());
  }

  #[test]
  fn test_second_enqueue_is_busy() {
    let parked = Arc::new(Parked::new());
    let mut registration = CallbackRegistration::new(parked.clone());
    let channel = registration.channel();

    let first = channel.clone();
    let worker = std::thread::spawn(move || first.write(b"abc"));
    wait_until(|| parked.calls.lock().len() == 1);

    assert_eq!(channel.write(b"def"), Err(AvError::BUSY));

    registration.close();
    assert_eq!(worker.join().unwrap(), Err(AvError::CLOSED));
  }

  #[test]
  fn test_invoke_from_runtime_thread_is_refused() {
    let parked = Arc::new(Parked::new());
    parked.runtime.store(true, Ordering::SeqCst);
    let registration = CallbackRegistration::new(parked.clone());
    let mut buf = [0u8; 1];
    assert_eq!(registration.channel().read(&mut buf), Err(AvError::DEADLOCK));
    assert!(parked.calls.lock().is_empty());
  }

  #[test]
  fn test_refused_dispatch_is_io_error() {
    let parked = Arc::new(Parked {
      refuse: true,
      ..Parked::new()
    });
    let registration = CallbackRegistration::new(parked);
    let mut buf = [0u8; 1];
    assert_eq!(registration.channel().read(&mut buf), Err(AvError::IO));
    assert!(!registration.channel().in_flight());
  }

  #[test]
  fn test_dropped_call_settles_with_io_error() {
    let parked = Arc::new(Parked::new());
    let registration = CallbackRegistration::new(parked.clone());
    let channel = registration.channel();

    let worker = std::thread::spawn(move || channel.write(b"abc"));
    wait_until(|| parked.calls.lock().len() == 1);
    parked.calls.lock().clear();

    assert_eq!(worker.join().unwrap(), Err(AvError::IO));
    assert!(registration.is_active());
  }

  #[test]
  fn test_resolve_translates_value() {
    let parked = Arc::new(Parked::new());
    let registration = CallbackRegistration::new(parked.clone());
    let channel = registration.channel();

    let worker = std::thread::spawn(move || channel.write(b"abcdef"));
    wait_until(|| parked.calls.lock().len() == 1);
    let call = parked.calls.lock().pop().unwrap();
    assert!(call.is_live());
    assert_eq!(
      call.request(),
      &IoRequest::Write {
        data: b"abcdef".to_vec()
      }
    );
    call.resolve(Ok(CallbackValue::Number(4.0)));

    assert_eq!(worker.join().unwrap(), Ok(4));
  }

  #[test]
  fn test_faulting_callback_yields_io_error_and_stays_usable() {
    let (handle, join) = spawn_loop();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let callbacks = ScriptedCallbacks::read_only(move |_| {
      match counter.fetch_add(1, Ordering::SeqCst) {
        0 => Err(CallbackFault::new("TypeError: boom")),
        1 => panic!("callback panicked"),
        _ => Ok(CallbackValue::Bytes(vec![9])),
      }
    });
    let registration = CallbackRegistration::new(LoopDispatch::new(handle.clone(), callbacks));
    let channel = registration.channel();

    let worker = std::thread::spawn(move || {
      let mut buf = [0u8; 1];
      let first = channel.read(&mut buf);
      let second = channel.read(&mut buf);
      let third = channel.read(&mut buf);
      (first, second, third, buf[0])
    });
    let (first, second, third, byte) = worker.join().unwrap();
    assert_eq!(first, Err(AvError::IO));
    assert_eq!(second, Err(AvError::IO));
    assert_eq!(third, Ok(1));
    assert_eq!(byte, 9);

    drop(registration);
    handle.stop();
    join.join().unwrap();
  }

  #[test]
  fn test_close_from_inside_callback_does_not_deadlock() {
    let (handle, join) = spawn_loop();
    let slot: Arc<Mutex<Option<CallbackRegistration>>> = Arc::new(Mutex::new(None));
    let inner = slot.clone();
    let callbacks = ScriptedCallbacks::read_only(move |_| {
      if let Some(mut registration) = inner.lock().take() {
        registration.close();
      }
      Ok(CallbackValue::Bytes(vec![1, 2]))
    });
    let registration = CallbackRegistration::new(LoopDispatch::new(handle.clone(), callbacks));
    let channel = registration.channel();
    *slot.lock() = Some(registration);

    let worker = std::thread::spawn(move || {
      let mut buf = [0u8; 2];
      let first = channel.read(&mut buf);
      let second = channel.read(&mut buf);
      (first, second)
    });
    let (first, second) = worker.join().unwrap();
    // The call that was already running completes; later ones see the close.
    assert_eq!(first, Ok(2));
    assert_eq!(second, Err(AvError::CLOSED));

    handle.stop();
    join.join().unwrap();
  }
}
