//! The stream operations, each as an [`AsyncTask`].
//!
//! Native outcomes (byte counts, positions, end of file, error codes) are
//! values: they resolve. Only bridge failures reject, for example a task that
//! reaches a stream which was closed after it was queued.

use crate::avio::{CloseTicket, IoContext};
use crate::error::{AvError, BridgeError, Result};
use crate::executor::AsyncTask;
use crate::handle::NativeResource;
use crate::lease::Lease;
use crate::refbuf::{alloc_bytes, BufferRef};
use crate::shared::SharedRef;

pub type IoOutcome<T> = std::result::Result<T, AvError>;

/// Default chunk size for [`CopyTask`].
pub const DEFAULT_COPY_CHUNK: usize = 64 * 1024;

fn leased<R>(lease: &Lease<IoContext>, f: impl FnOnce(&mut IoContext) -> R) -> Result<R> {
  lease.with(f).ok_or(BridgeError::Released(IoContext::NAME))
}

pub struct ReadTask {
  lease: Lease<IoContext>,
  size: usize,
}

impl ReadTask {
  pub fn new(lease: Lease<IoContext>, size: usize) -> Self {
    Self { lease, size }
  }
}

impl AsyncTask for ReadTask {
  type Output = IoOutcome<Vec<u8>>;
  type Value = IoOutcome<Vec<u8>>;

  fn execute(&mut self) -> Result<Self::Output> {
    let mut buf = alloc_bytes(self.size)
      .ok_or(BridgeError::OutOfMemory("read buffer"))?
      .into_vec();
    let read = leased(&self.lease, |ctx| ctx.read(&mut buf))?;
    Ok(read.map(|n| {
      buf.truncate(n);
      buf
    }))
  }

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    outcome
  }
}

pub struct WriteTask {
  lease: Lease<IoContext>,
  data: Vec<u8>,
}

impl WriteTask {
  pub fn new(lease: Lease<IoContext>, data: Vec<u8>) -> Self {
    Self { lease, data }
  }
}

impl AsyncTask for WriteTask {
  type Output = IoOutcome<usize>;
  type Value = IoOutcome<usize>;

  fn execute(&mut self) -> Result<Self::Output> {
    let data = &self.data;
    leased(&self.lease, |ctx| ctx.write(data))
  }

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    outcome
  }
}

/// Writes the contents of a shared buffer. The task holds its own reference,
/// so the buffer outlives the write even if every other holder lets go.
pub struct WriteSharedTask {
  lease: Lease<IoContext>,
  buffer: SharedRef<BufferRef>,
}

impl WriteSharedTask {
  pub fn new(lease: Lease<IoContext>, buffer: SharedRef<BufferRef>) -> Self {
    Self { lease, buffer }
  }
}

impl AsyncTask for WriteSharedTask {
  type Output = IoOutcome<usize>;
  type Value = IoOutcome<usize>;

  fn execute(&mut self) -> Result<Self::Output> {
    let data = self.buffer.as_slice();
    leased(&self.lease, |ctx| ctx.write(data))
  }

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    outcome
  }
}

pub struct SeekTask {
  lease: Lease<IoContext>,
  offset: i64,
  whence: i32,
}

impl SeekTask {
  pub fn new(lease: Lease<IoContext>, offset: i64, whence: i32) -> Self {
    Self {
      lease,
      offset,
      whence,
    }
  }
}

impl AsyncTask for SeekTask {
  type Output = IoOutcome<i64>;
  type Value = IoOutcome<i64>;

  fn execute(&mut self) -> Result<Self::Output> {
    let (offset, whence) = (self.offset, self.whence);
    leased(&self.lease, |ctx| ctx.seek(offset, whence))
  }

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    outcome
  }
}

pub struct SizeTask {
  lease: Lease<IoContext>,
}

impl SizeTask {
  pub fn new(lease: Lease<IoContext>) -> Self {
    Self { lease }
  }
}

impl AsyncTask for SizeTask {
  type Output = IoOutcome<i64>;
  type Value = IoOutcome<i64>;

  fn execute(&mut self) -> Result<Self::Output> {
    leased(&self.lease, IoContext::size)
  }

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    outcome
  }
}

pub struct FlushTask {
  lease: Lease<IoContext>,
}

impl FlushTask {
  pub fn new(lease: Lease<IoContext>) -> Self {
    Self { lease }
  }
}

impl AsyncTask for FlushTask {
  type Output = IoOutcome<()>;
  type Value = IoOutcome<()>;

  fn execute(&mut self) -> Result<Self::Output> {
    leased(&self.lease, IoContext::flush)
  }

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    outcome
  }
}

/// Pumps one stream into another until the source ends, then flushes the
/// destination. One long native call that makes many callbacks on both
/// streams. Resolves to the number of bytes copied.
pub struct CopyTask {
  src: Lease<IoContext>,
  dst: Lease<IoContext>,
  chunk_size: usize,
}

impl CopyTask {
  pub fn new(src: Lease<IoContext>, dst: Lease<IoContext>, chunk_size: usize) -> Result<Self> {
    if chunk_size == 0 {
      return Err(BridgeError::invalid("chunk size must be positive"));
    }
    if src.same(&dst) {
      return Err(BridgeError::invalid("cannot copy a stream into itself"));
    }
    Ok(Self {
      src,
      dst,
      chunk_size,
    })
  }
}

fn pump(src: &mut IoContext, dst: &mut IoContext, chunk: &mut [u8]) -> IoOutcome<i64> {
  let mut total = 0i64;
  loop {
    let n = match src.read(chunk) {
      Ok(n) => n,
      Err(err) if err.is_eof() => break,
      Err(err) => return Err(err),
    };
    dst.write(&chunk[..n])?;
    total += n as i64;
  }
  dst.flush()?;
  Ok(total)
}

impl AsyncTask for CopyTask {
  type Output = IoOutcome<i64>;
  type Value = IoOutcome<i64>;

  fn execute(&mut self) -> Result<Self::Output> {
    let mut chunk = alloc_bytes(self.chunk_size).ok_or(BridgeError::OutOfMemory("copy buffer"))?;
    self
      .src
      .with_pair(&self.dst, |src, dst| pump(src, dst, &mut chunk))?
      .ok_or(BridgeError::Released(IoContext::NAME))
  }

  fn on_complete(self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    outcome
  }
}

/// Flushes pending output and retires the stream. Without a ticket (the stream
/// was already closed) it does nothing and resolves successfully.
pub struct CloseTask {
  ticket: Option<CloseTicket>,
}

impl CloseTask {
  pub fn new(ticket: Option<CloseTicket>) -> Self {
    Self { ticket }
  }
}

impl AsyncTask for CloseTask {
  type Output = IoOutcome<()>;
  type Value = IoOutcome<()>;

  fn execute(&mut self) -> Result<Self::Output> {
    let Some(ticket) = &self.ticket else {
      return Ok(Ok(()));
    };
    let flushed = ticket.lease().with(IoContext::flush).unwrap_or(Ok(()));
    ticket.lease().seal();
    Ok(flushed)
  }

  // Dropping the ticket here, on the runtime thread, unregisters the callbacks
  // and frees the context.
  fn on_complete(mut self, outcome: Result<Self::Output>) -> Result<Self::Value> {
    drop(self.ticket.take());
    outcome
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::avio::{CustomIo, SEEK_SET};
  use crate::callback::{CallbackFault, CallbackValue};
  use crate::config::IoConfig;
  use crate::event_loop::{LoopDispatch, LoopHandle};
  use crate::executor::TaskExecutor;
  use crate::testing::{spawn_loop, MemoryCallbacks, ScriptedCallbacks};
  use tokio::runtime::Handle;

  fn writable() -> IoConfig {
    IoConfig {
      write_flag: true,
      ..IoConfig::default()
    }
  }

  fn memory_stream(loop_handle: &LoopHandle, data: Vec<u8>) -> CustomIo {
    CustomIo::open(
      &writable(),
      LoopDispatch::new(loop_handle.clone(), MemoryCallbacks::new(data)),
    )
    .unwrap()
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_write_then_read_back_round_trip() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());

    for n in [0usize, 1, 4096, 1_000_000] {
      let io = memory_stream(&loop_handle, Vec::new());
      let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();

      let written = executor
        .submit(WriteTask::new(io.lease().unwrap(), payload.clone()))
        .await
        .unwrap();
      assert_eq!(written, Ok(n));
      assert_eq!(executor.submit(FlushTask::new(io.lease().unwrap())).await.unwrap(), Ok(()));
      assert_eq!(
        executor.submit(SizeTask::new(io.lease().unwrap())).await.unwrap(),
        Ok(n as i64)
      );
      assert_eq!(
        executor
          .submit(SeekTask::new(io.lease().unwrap(), 0, SEEK_SET))
          .await
          .unwrap(),
        Ok(0)
      );

      let read = executor
        .submit(ReadTask::new(io.lease().unwrap(), n))
        .await
        .unwrap();
      if n == 0 {
        assert_eq!(read, Ok(Vec::new()));
      } else {
        assert_eq!(read.unwrap(), payload);
      }
    }

    loop_handle.stop();
    join.join().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_read_past_end_resolves_eof() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());
    let io = memory_stream(&loop_handle, b"xyz".to_vec());

    let first = executor.submit(ReadTask::new(io.lease().unwrap(), 16)).await.unwrap();
    assert_eq!(first, Ok(b"xyz".to_vec()));
    let second = executor.submit(ReadTask::new(io.lease().unwrap(), 16)).await.unwrap();
    assert_eq!(second, Err(AvError::EOF));

    drop(io);
    loop_handle.stop();
    join.join().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_back_to_back_tasks_on_independent_streams() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());
    let streams: Vec<_> = (0..8u8)
      .map(|i| memory_stream(&loop_handle, vec![i; 100]))
      .collect();

    let pending: Vec<_> = streams
      .iter()
      .map(|io| executor.submit(ReadTask::new(io.lease().unwrap(), 100)))
      .collect();
    for (i, task) in pending.into_iter().enumerate() {
      assert_eq!(task.await.unwrap(), Ok(vec![i as u8; 100]));
    }

    drop(streams);
    loop_handle.stop();
    join.join().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_seek_on_read_only_stream_is_not_supported() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());
    let io = CustomIo::open(
      &IoConfig::default(),
      LoopDispatch::new(
        loop_handle.clone(),
        ScriptedCallbacks::read_only(|_| Ok(CallbackValue::Bytes(vec![0; 8]))),
      ),
    )
    .unwrap();

    let sought = executor
      .submit(SeekTask::new(io.lease().unwrap(), 100, SEEK_SET))
      .await
      .unwrap();
    assert_eq!(sought, Err(AvError::NOT_SUPPORTED));
    let size = executor.submit(SizeTask::new(io.lease().unwrap())).await.unwrap();
    assert_eq!(size, Err(AvError::NOT_SUPPORTED));
    let wrote = executor
      .submit(WriteTask::new(io.lease().unwrap(), vec![1]))
      .await
      .unwrap();
    assert_eq!(wrote, Err(AvError::NOT_SUPPORTED));

    drop(io);
    loop_handle.stop();
    join.join().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_throwing_read_callback_leaves_stream_faulted() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());
    let io = CustomIo::open(
      &IoConfig::default(),
      LoopDispatch::new(
        loop_handle.clone(),
        ScriptedCallbacks::read_only(|_| Err(CallbackFault::new("Error: disk on fire"))),
      ),
    )
    .unwrap();

    let first = executor.submit(ReadTask::new(io.lease().unwrap(), 64)).await.unwrap();
    assert_eq!(first, Err(AvError::IO));
    // The error sticks until a successful seek, like any failed transfer.
    let second = executor.submit(ReadTask::new(io.lease().unwrap(), 64)).await.unwrap();
    assert_eq!(second, Err(AvError::IO));
    assert!(!io.is_closed());

    drop(io);
    loop_handle.stop();
    join.join().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_write_shared_keeps_buffer_alive() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());
    let io = memory_stream(&loop_handle, Vec::new());

    let shared = SharedRef::<BufferRef>::from_slice(b"shared bytes").unwrap();
    let task = WriteSharedTask::new(io.lease().unwrap(), shared.try_clone().unwrap());
    assert_eq!(shared.ref_count(), 2);
    drop(shared);
    assert_eq!(executor.submit(task).await.unwrap(), Ok(12));

    assert_eq!(executor.submit(SizeTask::new(io.lease().unwrap())).await.unwrap(), Ok(12));

    drop(io);
    loop_handle.stop();
    join.join().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_copy_between_streams() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    let src = memory_stream(&loop_handle, payload.clone());
    let dst = memory_stream(&loop_handle, Vec::new());

    let copy = CopyTask::new(src.lease().unwrap(), dst.lease().unwrap(), 1000).unwrap();
    assert_eq!(executor.submit(copy).await.unwrap(), Ok(10_000));

    executor
      .submit(SeekTask::new(dst.lease().unwrap(), 0, SEEK_SET))
      .await
      .unwrap()
      .unwrap();
    let back = executor
      .submit(ReadTask::new(dst.lease().unwrap(), 20_000))
      .await
      .unwrap();
    assert_eq!(back.unwrap(), payload);

    assert!(matches!(
      CopyTask::new(src.lease().unwrap(), src.lease().unwrap(), 1000),
      Err(BridgeError::InvalidArgument(_))
    ));
    assert!(matches!(
      CopyTask::new(src.lease().unwrap(), dst.lease().unwrap(), 0),
      Err(BridgeError::InvalidArgument(_))
    ));

    drop((src, dst));
    loop_handle.stop();
    join.join().unwrap();
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_close_flushes_and_later_tasks_are_released() {
    let (loop_handle, join) = spawn_loop();
    let executor = TaskExecutor::with_handle(Handle::current(), loop_handle.clone());
    let callbacks = MemoryCallbacks::new(Vec::new());
    let contents = callbacks.contents();
    let mut io = CustomIo::open(&writable(), LoopDispatch::new(loop_handle.clone(), callbacks)).unwrap();
    let stale = io.lease().unwrap();

    let wrote = executor
      .submit(WriteTask::new(io.lease().unwrap(), b"pending".to_vec()))
      .await
      .unwrap();
    assert_eq!(wrote, Ok(7));
    assert!(contents.lock().is_empty());

    let closed = executor.submit(CloseTask::new(io.begin_close())).await.unwrap();
    assert_eq!(closed, Ok(()));
    assert_eq!(&*contents.lock(), b"pending");
    assert!(io.is_closed());

    let again = executor.submit(CloseTask::new(io.begin_close())).await.unwrap();
    assert_eq!(again, Ok(()));

    let err = executor.submit(ReadTask::new(stale, 4)).await.unwrap_err();
    assert!(matches!(err, BridgeError::Released(_)));
    assert!(matches!(io.lease(), Err(BridgeError::Released(_))));

    loop_handle.stop();
    join.join().unwrap();
  }
}
