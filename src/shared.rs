//! Shared ownership of resources the native library reference-counts itself.
//!
//! Unlike [`crate::ResourceHandle`], any number of [`SharedRef`]s may point at
//! the same native buffer. Each wrapper holds exactly one native reference:
//! wrapping takes a new one, dropping gives it back, and the library frees the
//! memory when the count reaches zero.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::error::{BridgeError, Result};

/// A native type with an intrinsic reference count.
///
/// # Safety
///
/// `new_ref` and `unref` must be callable from any thread and must adjust the
/// count atomically. A pointer returned by `new_ref` must be released with
/// exactly one `unref`.
pub unsafe trait RefCounted {
  const NAME: &'static str;

  /// Takes a new reference. `None` means the library could not allocate one.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live reference.
  unsafe fn new_ref(ptr: NonNull<Self>) -> Option<NonNull<Self>>;

  /// Gives one reference back.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live reference that is not used afterwards.
  unsafe fn unref(ptr: NonNull<Self>);
}

pub struct SharedRef<T: RefCounted> {
  ptr: NonNull<T>,
}

// SAFETY: the only state touched through a SharedRef from several threads is
// the native count, which RefCounted requires to be atomic.
unsafe impl<T: RefCounted> Send for SharedRef<T> {}
unsafe impl<T: RefCounted> Sync for SharedRef<T> {}

impl<T: RefCounted> SharedRef<T> {
  /// Wraps an existing reference by taking a new one. The caller keeps `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live reference.
  pub unsafe fn wrap(ptr: *const T) -> Result<Self> {
    let ptr = NonNull::new(ptr as *mut T)
      .ok_or_else(|| BridgeError::invalid(format!("cannot wrap a null {}", T::NAME)))?;
    let ptr = T::new_ref(ptr).ok_or(BridgeError::OutOfMemory(T::NAME))?;
    Ok(Self { ptr })
  }

  /// Takes over a reference the library just produced, without counting it
  /// again. Null yields `None`.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a reference nobody else will unref.
  pub unsafe fn adopt(ptr: *mut T) -> Option<Self> {
    NonNull::new(ptr).map(|ptr| Self { ptr })
  }

  /// The underlying reference, still owned by this wrapper. Hand it to another
  /// owner that takes its own reference (for example through [`Self::wrap`]).
  pub fn unwrap(&self) -> *mut T {
    self.ptr.as_ptr()
  }

  /// Gives up this wrapper's reference without decrementing it.
  pub fn into_raw(self) -> *mut T {
    ManuallyDrop::new(self).ptr.as_ptr()
  }

  /// Another wrapper over the same buffer, holding its own reference.
  pub fn try_clone(&self) -> Result<Self> {
    // SAFETY: our reference is live.
    unsafe { Self::wrap(self.ptr.as_ptr()) }
  }
}

impl<T: RefCounted> Deref for SharedRef<T> {
  type Target = T;

  fn deref(&self) -> &T {
    // SAFETY: the reference stays live until drop.
    unsafe { self.ptr.as_ref() }
  }
}

impl<T: RefCounted> Drop for SharedRef<T> {
  fn drop(&mut self) {
    // SAFETY: each wrapper owns exactly one reference.
    unsafe { T::unref(self.ptr) }
  }
}

impl<T: RefCounted> fmt::Debug for SharedRef<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedRef")
      .field("kind", &T::NAME)
      .field("ptr", &self.ptr)
      .finish()
  }
}
