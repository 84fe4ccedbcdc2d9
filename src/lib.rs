#![deny(clippy::all)]

pub mod avio;
pub mod callback;
pub mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod handle;
mod js_io;
pub mod lease;
mod node_task;
pub mod refbuf;
mod shared_buffer;
pub mod shared;
pub mod tasks;
#[cfg(test)]
mod testing;

pub use crate::avio::{CustomIo, IoContext};
pub use crate::error::{AvError, BridgeError};
pub use crate::executor::{Scheduler, TaskExecutor, TaskHandle, TaskState};
pub use crate::handle::{NativePtr, ResourceHandle};
pub use crate::lease::Lease;
pub use crate::shared::SharedRef;

use crate::config::IoConfig;
use crate::js_io::{JsDispatch, ReadCallback, SeekCallback, WriteCallback};
use crate::node_task::{to_napi_error, NodeTask};
use crate::shared_buffer::SharedBuffer;
use crate::tasks::{
  CloseTask, CopyTask, FlushTask, ReadTask, SeekTask, SizeTask, WriteSharedTask, WriteTask,
  DEFAULT_COPY_CHUNK,
};
use napi::bindgen_prelude::*;
use napi_derive::napi;

#[napi]
pub const SEEK_SET: i32 = avio::SEEK_SET;
#[napi]
pub const SEEK_CUR: i32 = avio::SEEK_CUR;
#[napi]
pub const SEEK_END: i32 = avio::SEEK_END;
#[napi]
pub const AVSEEK_SIZE: i32 = avio::AVSEEK_SIZE;
#[napi]
pub const AVSEEK_FORCE: i32 = avio::AVSEEK_FORCE;
#[napi]
pub const AVERROR_EOF: i32 = AvError::EOF.code();

/// Read results report their length as an `i32`.
fn read_len(size: u32) -> usize {
  size.min(i32::MAX as u32) as usize
}

#[napi(object)]
pub struct StreamOptions {
  /// Size of the internal I/O buffer in bytes. Defaults to 4096.
  pub buffer_size: Option<u32>,
  /// Whether the stream accepts writes. Defaults to whether a write callback
  /// was given.
  pub writable: Option<bool>,
}

#[napi(object)]
pub struct StreamCapabilities {
  pub read: bool,
  pub write: bool,
  pub seek: bool,
}

/// A buffered stream whose data lives behind JavaScript callbacks.
///
/// Every operation runs on a worker thread; the callbacks are called back on
/// the JS thread while the worker waits.
#[napi]
pub struct IoStream {
  io: CustomIo,
}

impl IoStream {
  fn lease(&self) -> Result<Lease<IoContext>> {
    self.io.lease().map_err(to_napi_error)
  }
}

#[napi]
impl IoStream {
  #[napi(constructor)]
  pub fn new(
    read: Option<ReadCallback>,
    write: Option<WriteCallback>,
    seek: Option<SeekCallback>,
    options: Option<StreamOptions>,
  ) -> Result<Self> {
    if read.is_none() && write.is_none() {
      return Err(to_napi_error(BridgeError::invalid(
        "a stream needs a read or a write callback",
      )));
    }
    let mut config = IoConfig {
      write_flag: write.is_some(),
      ..IoConfig::default()
    };
    if let Some(options) = options {
      if let Some(size) = options.buffer_size {
        config.buffer_size = size as usize;
      }
      if let Some(writable) = options.writable {
        config.write_flag = writable;
      }
    }
    let io = CustomIo::open(&config, JsDispatch::new(read, write, seek)).map_err(to_napi_error)?;
    Ok(IoStream { io })
  }

  #[napi(getter)]
  pub fn closed(&self) -> bool {
    self.io.is_closed()
  }

  #[napi(getter)]
  pub fn capabilities(&self) -> StreamCapabilities {
    let caps = self.io.capabilities();
    StreamCapabilities {
      read: caps.read,
      write: caps.write,
      seek: caps.seek,
    }
  }

  #[napi]
  pub fn read(&self, size: u32) -> Result<AsyncTask<NodeTask<ReadTask>>> {
    let task = ReadTask::new(self.lease()?, read_len(size));
    Ok(AsyncTask::new(NodeTask::new(task)))
  }

  #[napi]
  pub fn write(&self, data: Buffer) -> Result<AsyncTask<NodeTask<WriteTask>>> {
    let task = WriteTask::new(self.lease()?, data.to_vec());
    Ok(AsyncTask::new(NodeTask::new(task)))
  }

  #[napi]
  pub fn write_shared(&self, buffer: &SharedBuffer) -> Result<AsyncTask<NodeTask<WriteSharedTask>>> {
    let shared = buffer.shared().try_clone().map_err(to_napi_error)?;
    let task = WriteSharedTask::new(self.lease()?, shared);
    Ok(AsyncTask::new(NodeTask::new(task)))
  }

  #[napi]
  pub fn seek(&self, offset: i64, whence: i32) -> Result<AsyncTask<NodeTask<SeekTask>>> {
    let task = SeekTask::new(self.lease()?, offset, whence);
    Ok(AsyncTask::new(NodeTask::new(task)))
  }

  #[napi]
  pub fn size(&self) -> Result<AsyncTask<NodeTask<SizeTask>>> {
    Ok(AsyncTask::new(NodeTask::new(SizeTask::new(self.lease()?))))
  }

  #[napi]
  pub fn flush(&self) -> Result<AsyncTask<NodeTask<FlushTask>>> {
    Ok(AsyncTask::new(NodeTask::new(FlushTask::new(self.lease()?))))
  }

  /// Copies everything left in this stream into `dest`.
  #[napi]
  pub fn copy_to(
    &self,
    dest: &IoStream,
    chunk_size: Option<u32>,
  ) -> Result<AsyncTask<NodeTask<CopyTask>>> {
    let chunk = chunk_size.map_or(DEFAULT_COPY_CHUNK, |n| n as usize);
    let task = CopyTask::new(self.lease()?, dest.lease()?, chunk).map_err(to_napi_error)?;
    Ok(AsyncTask::new(NodeTask::new(task)))
  }

  /// Flushes and releases the stream. Calling it again resolves 0.
  #[napi]
  pub fn close(&mut self) -> AsyncTask<NodeTask<CloseTask>> {
    AsyncTask::new(NodeTask::new(CloseTask::new(self.io.begin_close())))
  }
}

/// Installs the `env_logger` backend. `RUST_LOG` wins over `filter`, which
/// defaults to `warn`. Returns false if a logger was already installed.
#[napi]
pub fn init_logging(filter: Option<String>) -> bool {
  let env = env_logger::Env::default().default_filter_or(filter.unwrap_or_else(|| "warn".to_string()));
  env_logger::Builder::from_env(env).try_init().is_ok()
}

#[napi]
pub fn version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}
