//! Move-only ownership of one native pointer.
//!
//! A [`ResourceHandle`] either owns its pointer, in which case the type's
//! releaser runs exactly once when the pointer is replaced or the handle is
//! dropped, or borrows it, in which case the releaser never runs. Handles are
//! `!Send`: they live on the runtime thread. Only the opaque [`NativePtr`]
//! crosses to worker threads.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// A native struct with a type-specific release function.
///
/// # Safety
///
/// `release` must free exactly the allocation `ptr` points at, and must accept
/// any pointer that was handed to [`ResourceHandle::from_owned`] for this type.
pub unsafe trait NativeResource {
  /// Name used in logs and in [`crate::BridgeError::Released`].
  const NAME: &'static str;

  /// # Safety
  ///
  /// `ptr` must be a live allocation of this type that nobody else frees.
  unsafe fn release(ptr: NonNull<Self>);
}

pub struct ResourceHandle<T: NativeResource> {
  ptr: Option<NonNull<T>>,
  owned: bool,
  _runtime_thread_only: PhantomData<*mut T>,
}

impl<T: NativeResource> ResourceHandle<T> {
  /// An owning handle that holds nothing yet.
  pub fn empty() -> Self {
    Self {
      ptr: None,
      owned: true,
      _runtime_thread_only: PhantomData,
    }
  }

  /// Takes ownership of `ptr`. A null pointer yields an empty handle.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation that no other handle owns.
  pub unsafe fn from_owned(ptr: *mut T) -> Self {
    Self {
      ptr: NonNull::new(ptr),
      owned: true,
      _runtime_thread_only: PhantomData,
    }
  }

  /// Wraps `ptr` without ever releasing it.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or stay valid for as long as this handle is used.
  pub unsafe fn wrap_borrowed(ptr: *mut T) -> Self {
    Self {
      ptr: NonNull::new(ptr),
      owned: false,
      _runtime_thread_only: PhantomData,
    }
  }

  pub fn get(&self) -> *mut T {
    self.ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  pub fn is_null(&self) -> bool {
    self.ptr.is_none()
  }

  pub fn is_owned(&self) -> bool {
    self.owned
  }

  /// The pointer in a form that may be moved to a worker thread.
  pub fn native(&self) -> Option<NativePtr<T>> {
    self.ptr.map(NativePtr)
  }

  /// Releases the current pointer (if owned) and stores `ptr` in its place.
  ///
  /// A borrowed handle stays borrowed: the new pointer is not released either.
  ///
  /// # Safety
  ///
  /// Same contract as [`ResourceHandle::from_owned`] (or
  /// [`ResourceHandle::wrap_borrowed`] for borrowed handles) for `ptr`.
  pub unsafe fn reset(&mut self, ptr: *mut T) {
    let next = NonNull::new(ptr);
    if next == self.ptr {
      return;
    }
    let previous = std::mem::replace(&mut self.ptr, next);
    if let (true, Some(previous)) = (self.owned, previous) {
      log::debug!("releasing {} at {:p}", T::NAME, previous);
      T::release(previous);
    }
  }

  /// Releases the current pointer if owned and leaves the handle empty.
  pub fn clear(&mut self) {
    // SAFETY: storing null never creates a new ownership claim.
    unsafe { self.reset(ptr::null_mut()) }
  }

  /// Hands the pointer out without releasing it. The handle is left empty.
  pub fn release(&mut self) -> *mut T {
    self.ptr.take().map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  pub fn get_ref(&self) -> Option<&T> {
    // SAFETY: a stored pointer is live for as long as the handle holds it.
    self.ptr.map(|p| unsafe { &*p.as_ptr() })
  }

  pub fn get_mut(&mut self) -> Option<&mut T> {
    // SAFETY: as above, and `&mut self` excludes other handle-level access.
    self.ptr.map(|p| unsafe { &mut *p.as_ptr() })
  }
}

impl<T: NativeResource> Drop for ResourceHandle<T> {
  fn drop(&mut self) {
    self.clear();
  }
}

impl<T: NativeResource> fmt::Debug for ResourceHandle<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResourceHandle")
      .field("kind", &T::NAME)
      .field("ptr", &self.get())
      .field("owned", &self.owned)
      .finish()
  }
}

/// A raw native pointer that may cross to a worker thread.
///
/// Carries no ownership. Whoever dereferences it must guarantee the owning
/// handle is not reset concurrently; [`crate::Lease`] is the usual way.
pub struct NativePtr<T>(NonNull<T>);

// SAFETY: NativePtr is an address only; access discipline is enforced by the
// owner (single pending native call per resource).
unsafe impl<T> Send for NativePtr<T> {}

impl<T> Clone for NativePtr<T> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for NativePtr<T> {}

impl<T> NativePtr<T> {
  pub fn as_ptr(self) -> *mut T {
    self.0.as_ptr()
  }

  pub(crate) fn as_non_null(self) -> NonNull<T> {
    self.0
  }

  /// # Safety
  ///
  /// The pointee must be live and not aliased mutably for `'a`.
  pub unsafe fn as_mut<'a>(self) -> &'a mut T {
    &mut *self.0.as_ptr()
  }
}

impl<T> fmt::Debug for NativePtr<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "NativePtr({:p})", self.0)
  }
}
