use std::panic::{catch_unwind, AssertUnwindSafe};

use napi::bindgen_prelude::*;
use napi_derive::napi;

use crate::error::{panic_message, BridgeError};
use crate::executor;
use crate::tasks::IoOutcome;

pub(crate) fn to_napi_error(err: BridgeError) -> Error {
  Error::new(Status::GenericFailure, format!("[{}] {}", err.code(), err))
}

/// Outcome of `IoStream.read`: `code` is the byte count, or a negative error
/// code (`AVERROR_EOF` at end of stream) with no data.
#[napi(object)]
pub struct ReadResult {
  pub code: i32,
  pub data: Option<Buffer>,
}

/// Conversion of a task's value into what the Promise resolves with.
pub trait IntoJs {
  type Js: ToNapiValue + TypeName;

  fn into_js(self) -> Self::Js;
}

impl IntoJs for IoOutcome<Vec<u8>> {
  type Js = ReadResult;

  fn into_js(self) -> ReadResult {
    match self {
      Ok(bytes) => ReadResult {
        code: i32::try_from(bytes.len()).unwrap_or(i32::MAX),
        data: Some(bytes.into()),
      },
      Err(err) => ReadResult {
        code: err.code(),
        data: None,
      },
    }
  }
}

impl IntoJs for IoOutcome<usize> {
  type Js = i64;

  fn into_js(self) -> i64 {
    self.map_or_else(|err| i64::from(err.code()), |n| n as i64)
  }
}

impl IntoJs for IoOutcome<i64> {
  type Js = BigInt;

  fn into_js(self) -> BigInt {
    BigInt::from(self.unwrap_or_else(|err| i64::from(err.code())))
  }
}

impl IntoJs for IoOutcome<()> {
  type Js = i32;

  fn into_js(self) -> i32 {
    self.err().map_or(0, |err| err.code())
  }
}

/// Runs a core task on the libuv worker pool and settles a Promise with it.
pub struct NodeTask<T> {
  task: Option<T>,
}

impl<T> NodeTask<T> {
  pub fn new(task: T) -> Self {
    Self { task: Some(task) }
  }
}

impl<T> Task for NodeTask<T>
where
  T: executor::AsyncTask,
  T::Value: IntoJs,
{
  type Output = crate::error::Result<T::Output>;
  type JsValue = <T::Value as IntoJs>::Js;

  fn compute(&mut self) -> Result<Self::Output> {
    let Some(task) = self.task.as_mut() else {
      return Ok(Err(BridgeError::Invariant("task computed twice".into())));
    };
    Ok(
      catch_unwind(AssertUnwindSafe(|| task.execute()))
        .unwrap_or_else(|payload| Err(BridgeError::Worker(panic_message(payload.as_ref())))),
    )
  }

  fn resolve(&mut self, _env: Env, output: Self::Output) -> Result<Self::JsValue> {
    let task = self
      .task
      .take()
      .ok_or_else(|| to_napi_error(BridgeError::Invariant("task resolved twice".into())))?;
    task
      .on_complete(output)
      .map(IntoJs::into_js)
      .map_err(to_napi_error)
  }
}
