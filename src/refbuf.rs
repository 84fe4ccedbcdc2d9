//! Reference-counted native buffers.
//!
//! Follows the library's buffer-reference model: every [`BufferRef`] is its
//! own small allocation pointing at shared storage, `buffer_ref` produces a new
//! reference, and `buffer_unref` frees the reference and drops the storage once
//! the last one is gone. Hardware device and frame contexts travel in buffers
//! of this shape, which is why the bridge never assumes exclusive ownership of
//! them.

use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::error::{BridgeError, Result};
use crate::shared::{RefCounted, SharedRef};

type FreeFn = Box<dyn FnOnce() + Send>;

struct Storage {
  data: NonNull<u8>,
  len: usize,
  refs: AtomicUsize,
  on_free: Option<FreeFn>,
}

/// One reference to a shared native buffer.
#[repr(C)]
pub struct BufferRef {
  storage: NonNull<Storage>,
  pub data: *mut u8,
  pub size: usize,
}

pub(crate) fn alloc_bytes(size: usize) -> Option<Box<[u8]>> {
  let mut bytes = Vec::new();
  bytes.try_reserve_exact(size).ok()?;
  bytes.resize(size, 0);
  Some(bytes.into_boxed_slice())
}

fn new_ref(storage: NonNull<Storage>) -> *mut BufferRef {
  // SAFETY: storage is live while any reference exists.
  let (data, size) = unsafe { (storage.as_ref().data.as_ptr(), storage.as_ref().len) };
  Box::into_raw(Box::new(BufferRef {
    storage,
    data,
    size,
  }))
}

/// Wraps `bytes` in a new buffer with a reference count of one. `on_free`
/// runs when the storage is finally released.
pub fn buffer_create(bytes: Box<[u8]>, on_free: Option<FreeFn>) -> *mut BufferRef {
  let len = bytes.len();
  let data = Box::into_raw(bytes) as *mut u8;
  let storage = Box::new(Storage {
    // SAFETY: Box::into_raw never returns null, even for empty slices.
    data: unsafe { NonNull::new_unchecked(data) },
    len,
    refs: AtomicUsize::new(1),
    on_free,
  });
  // SAFETY: as above.
  new_ref(unsafe { NonNull::new_unchecked(Box::into_raw(storage)) })
}

/// Allocates a zeroed buffer. Returns null when the allocation fails.
pub fn buffer_alloc(size: usize) -> *mut BufferRef {
  match alloc_bytes(size) {
    Some(bytes) => buffer_create(bytes, None),
    None => ptr::null_mut(),
  }
}

/// Creates a new reference to the same storage.
///
/// # Safety
///
/// `buf` must be a live reference.
pub unsafe fn buffer_ref(buf: *const BufferRef) -> *mut BufferRef {
  let storage = (*buf).storage;
  storage.as_ref().refs.fetch_add(1, Ordering::Relaxed);
  new_ref(storage)
}

/// Frees the reference and sets `*buf` to null. The storage goes with the last
/// reference.
///
/// # Safety
///
/// `*buf` must be null or a live reference that is not used afterwards.
pub unsafe fn buffer_unref(buf: &mut *mut BufferRef) {
  let Some(reference) = NonNull::new(std::mem::replace(buf, ptr::null_mut())) else {
    return;
  };
  let reference = Box::from_raw(reference.as_ptr());
  let storage = reference.storage;
  if storage.as_ref().refs.fetch_sub(1, Ordering::Release) != 1 {
    return;
  }
  fence(Ordering::Acquire);
  let storage = Box::from_raw(storage.as_ptr());
  drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
    storage.data.as_ptr(),
    storage.len,
  )));
  if let Some(on_free) = storage.on_free {
    on_free();
  }
}

/// Start of the buffer's bytes.
///
/// # Safety
///
/// `buf` must be a live reference.
pub unsafe fn buffer_data(buf: *const BufferRef) -> *mut u8 {
  (*buf).data
}

/// # Safety
///
/// `buf` must be a live reference.
pub unsafe fn buffer_ref_count(buf: *const BufferRef) -> usize {
  (*buf).storage.as_ref().refs.load(Ordering::Acquire)
}

// SAFETY: buffer_ref/buffer_unref adjust the shared count atomically and each
// BufferRef is a separate allocation owned by exactly one wrapper.
unsafe impl RefCounted for BufferRef {
  const NAME: &'static str = "buffer";

  unsafe fn new_ref(ptr: NonNull<Self>) -> Option<NonNull<Self>> {
    NonNull::new(buffer_ref(ptr.as_ptr()))
  }

  unsafe fn unref(ptr: NonNull<Self>) {
    let mut raw = ptr.as_ptr();
    buffer_unref(&mut raw);
  }
}

impl SharedRef<BufferRef> {
  /// A fresh zeroed buffer held only by this wrapper.
  pub fn alloc(size: usize) -> Result<Self> {
    // SAFETY: buffer_alloc returns a new reference the caller owns.
    unsafe { Self::adopt(buffer_alloc(size)) }.ok_or(BridgeError::OutOfMemory("buffer"))
  }

  pub fn from_slice(bytes: &[u8]) -> Result<Self> {
    let mut shared = Self::alloc(bytes.len())?;
    if let Some(dst) = shared.as_mut_slice() {
      dst.copy_from_slice(bytes);
    }
    Ok(shared)
  }

  pub fn len(&self) -> usize {
    self.size
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn ref_count(&self) -> usize {
    // SAFETY: the wrapper keeps its reference live.
    unsafe { buffer_ref_count(self.unwrap()) }
  }

  /// Contents of the buffer.
  ///
  /// Writers are only ever handed out through [`Self::as_mut_slice`] while the
  /// count is one, so no other reference can be mutating the storage.
  pub fn as_slice(&self) -> &[u8] {
    // SAFETY: data/size describe the live storage.
    unsafe { std::slice::from_raw_parts(buffer_data(self.unwrap()), self.size) }
  }

  /// Mutable contents, available only while this is the sole reference.
  pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
    if self.ref_count() != 1 {
      return None;
    }
    let buf: &BufferRef = self;
    // SAFETY: sole reference, and `&mut self` excludes other users of it.
    Some(unsafe { std::slice::from_raw_parts_mut(buf.data, buf.size) })
  }
}
