//! Running native work on worker threads and finishing it on the runtime thread.
//!
//! A task's [`AsyncTask::execute`] runs on a tokio blocking-pool thread, where
//! it may call into the native library (and, through custom I/O, back into the
//! runtime thread). [`AsyncTask::on_complete`] is then posted back to the
//! runtime thread through a [`Scheduler`], and its value is delivered through
//! the [`TaskHandle`] returned by [`TaskExecutor::submit`].

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

use crate::config::ExecutorConfig;
use crate::error::{panic_message, BridgeError, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Posts jobs to the runtime thread.
pub trait Scheduler: Send + Sync + 'static {
  fn schedule(&self, job: Job) -> Result<()>;
}

/// Work split between a worker thread and the runtime thread.
pub trait AsyncTask: Send + 'static {
  /// Produced on the worker thread.
  type Output: Send + 'static;
  /// Produced on the runtime thread and handed to the waiter.
  type Value: Send + 'static;

  fn execute(&mut self) -> Result<Self::Output>;

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Created,
  Scheduled,
  Executing,
  Completed { ok: bool },
}

impl TaskState {
  fn to_u8(self) -> u8 {
    match self {
      TaskState::Created => 0,
      TaskState::Scheduled => 1,
      TaskState::Executing => 2,
      TaskState::Completed { ok: true } => 3,
      TaskState::Completed { ok: false } => 4,
    }
  }

  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => TaskState::Created,
      1 => TaskState::Scheduled,
      2 => TaskState::Executing,
      3 => TaskState::Completed { ok: true },
      _ => TaskState::Completed { ok: false },
    }
  }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
  fn new() -> Self {
    Self(AtomicU8::new(TaskState::Created.to_u8()))
  }

  fn get(&self) -> TaskState {
    TaskState::from_u8(self.0.load(Ordering::Acquire))
  }

  fn set(&self, state: TaskState) {
    self.0.store(state.to_u8(), Ordering::Release);
  }
}

/// The runtime-thread half of a finished `execute`.
struct Completion<T: AsyncTask> {
  task: Option<T>,
  outcome: Option<Result<T::Output>>,
  tx: Option<oneshot::Sender<Result<T::Value>>>,
  state: Arc<StateCell>,
}

impl<T: AsyncTask> Completion<T> {
  fn finish(mut self) {
    let (Some(task), Some(outcome), Some(tx)) = (self.task.take(), self.outcome.take(), self.tx.take())
    else {
      return;
    };
    let value = catch_unwind(AssertUnwindSafe(move || task.on_complete(outcome)))
      .unwrap_or_else(|payload| Err(BridgeError::Worker(panic_message(payload.as_ref()))));
    self.state.set(TaskState::Completed { ok: value.is_ok() });
    let _ = tx.send(value);
  }
}

impl<T: AsyncTask> Drop for Completion<T> {
  fn drop(&mut self) {
    if let Some(tx) = self.tx.take() {
      log::warn!("task completion dropped before reaching the runtime thread");
      self.state.set(TaskState::Completed { ok: false });
      let _ = tx.send(Err(BridgeError::RuntimeClosed));
    }
  }
}

pub struct TaskExecutor<S: Scheduler> {
  runtime: Option<Runtime>,
  handle: Handle,
  scheduler: Arc<S>,
}

impl<S: Scheduler> TaskExecutor<S> {
  /// Builds a dedicated worker runtime.
  pub fn new(config: &ExecutorConfig, scheduler: S) -> Result<Self> {
    let runtime = Builder::new_multi_thread()
      .worker_threads(config.worker_threads)
      .max_blocking_threads(config.max_blocking_threads)
      .thread_keep_alive(config.keep_alive)
      .thread_name(config.thread_name.clone())
      .enable_all()
      .build()
      .map_err(|e| BridgeError::Worker(format!("failed to start worker runtime: {e}")))?;
    let handle = runtime.handle().clone();
    Ok(Self {
      runtime: Some(runtime),
      handle,
      scheduler: Arc::new(scheduler),
    })
  }

  /// [`TaskExecutor::new`] with [`ExecutorConfig::from_env`].
  pub fn from_env(scheduler: S) -> Result<Self> {
    Self::new(&ExecutorConfig::from_env(), scheduler)
  }

  /// Shares an existing runtime's blocking pool.
  pub fn with_handle(handle: Handle, scheduler: S) -> Self {
    Self {
      runtime: None,
      handle,
      scheduler: Arc::new(scheduler),
    }
  }

  pub fn submit<T: AsyncTask>(&self, task: T) -> TaskHandle<T::Value> {
    let (tx, rx) = oneshot::channel();
    let state = Arc::new(StateCell::new());
    let scheduler = self.scheduler.clone();
    let worker_state = state.clone();

    state.set(TaskState::Scheduled);
    self.handle.spawn_blocking(move || {
      worker_state.set(TaskState::Executing);
      let mut task = task;
      let outcome = catch_unwind(AssertUnwindSafe(|| task.execute()))
        .unwrap_or_else(|payload| Err(BridgeError::Worker(panic_message(payload.as_ref()))));
      let completion = Completion {
        task: Some(task),
        outcome: Some(outcome),
        tx: Some(tx),
        state: worker_state,
      };
      if let Err(err) = scheduler.schedule(Box::new(move || completion.finish())) {
        log::warn!("could not post task completion: {err}");
      }
    });

    TaskHandle { rx, state }
  }
}

impl<S: Scheduler> Drop for TaskExecutor<S> {
  fn drop(&mut self) {
    if let Some(runtime) = self.runtime.take() {
      log::debug!("shutting down worker runtime");
      runtime.shutdown_background();
    }
  }
}

/// Resolves to the task's value once `on_complete` has run.
pub struct TaskHandle<V> {
  rx: oneshot::Receiver<Result<V>>,
  state: Arc<StateCell>,
}

impl<V> TaskHandle<V> {
  pub fn state(&self) -> TaskState {
    self.state.get()
  }

  /// Blocks the calling thread. Must not be called from the runtime thread
  /// the completion is posted to, nor from inside an async context.
  pub fn wait(self) -> Result<V> {
    self.rx.blocking_recv().unwrap_or(Err(BridgeError::RuntimeClosed))
  }
}

impl<V> Future for TaskHandle<V> {
  type Output = Result<V>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.rx)
      .poll(cx)
      .map(|received| received.unwrap_or(Err(BridgeError::RuntimeClosed)))
  }
}
