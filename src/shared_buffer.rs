use napi::bindgen_prelude::*;
use napi_derive::napi;

use crate::node_task::to_napi_error;
use crate::refbuf::BufferRef;
use crate::shared::SharedRef;

/// A reference-counted native buffer. Every instance holds one reference.
#[napi]
pub struct SharedBuffer {
  inner: SharedRef<BufferRef>,
}

impl SharedBuffer {
  pub(crate) fn shared(&self) -> &SharedRef<BufferRef> {
    &self.inner
  }
}

#[napi]
impl SharedBuffer {
  #[napi(constructor)]
  pub fn new(size: u32) -> Result<Self> {
    let inner = SharedRef::<BufferRef>::alloc(size as usize).map_err(to_napi_error)?;
    Ok(SharedBuffer { inner })
  }

  /// Copies `data` into a new native buffer.
  #[napi(factory, js_name = "from")]
  pub fn from_buffer(data: Buffer) -> Result<Self> {
    let inner = SharedRef::<BufferRef>::from_slice(&data).map_err(to_napi_error)?;
    Ok(SharedBuffer { inner })
  }

  /// Another wrapper over the same memory, holding its own reference.
  #[napi(js_name = "ref")]
  pub fn add_ref(&self) -> Result<SharedBuffer> {
    let inner = self.inner.try_clone().map_err(to_napi_error)?;
    Ok(SharedBuffer { inner })
  }

  #[napi(getter)]
  pub fn ref_count(&self) -> u32 {
    self.inner.ref_count() as u32
  }

  #[napi(getter)]
  pub fn size(&self) -> u32 {
    self.inner.len() as u32
  }

  #[napi]
  pub fn to_buffer(&self) -> Buffer {
    self.inner.as_slice().to_vec().into()
  }
}
