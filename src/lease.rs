use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{BridgeError, Result};
use crate::handle::NativePtr;

/// Worker-side access to one native pointer.
///
/// The runtime thread keeps the owning [`crate::ResourceHandle`]; workers get a
/// `Lease`. Access runs under the lease's lock, so at most one native call is
/// in flight per resource, and [`Lease::seal`] waits for that call to return
/// before the owner frees the pointer. A sealed lease never hands it out again.
pub struct Lease<T> {
  inner: Arc<Mutex<Option<NativePtr<T>>>>,
}

impl<T> Clone for Lease<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> Lease<T> {
  pub fn new(ptr: NativePtr<T>) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Some(ptr))),
    }
  }

  /// Runs `f` with exclusive access, or returns `None` once sealed.
  pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    let guard = self.inner.lock();
    let ptr = (*guard)?;
    // SAFETY: the pointer stays live until seal, which needs this lock.
    Some(f(unsafe { ptr.as_mut() }))
  }

  /// Runs `f` with exclusive access to two distinct resources. Locks are taken
  /// in address order so two opposite pairings cannot deadlock.
  pub fn with_pair<R>(
    &self,
    other: &Lease<T>,
    f: impl FnOnce(&mut T, &mut T) -> R,
  ) -> Result<Option<R>> {
    if self.same(other) {
      return Err(BridgeError::invalid("a stream cannot be paired with itself"));
    }
    let mine = Arc::as_ptr(&self.inner) as usize;
    let theirs = Arc::as_ptr(&other.inner) as usize;
    let (first, second) = if mine < theirs {
      (self.inner.lock(), other.inner.lock())
    } else {
      let second = other.inner.lock();
      (self.inner.lock(), second)
    };
    match (*first, *second) {
      // SAFETY: both pointers are live while their locks are held and they
      // belong to different resources.
      (Some(a), Some(b)) => Ok(Some(f(unsafe { a.as_mut() }, unsafe { b.as_mut() }))),
      _ => Ok(None),
    }
  }

  /// Revokes access, waiting for an in-flight user first. Returns whether this
  /// call did the sealing.
  pub fn seal(&self) -> bool {
    self.inner.lock().take().is_some()
  }

  pub fn is_sealed(&self) -> bool {
    self.inner.lock().is_none()
  }

  pub fn same(&self, other: &Lease<T>) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl<T> fmt::Debug for Lease<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.inner.try_lock() {
      Some(guard) => f.debug_tuple("Lease").field(&*guard).finish(),
      None => f.write_str("Lease(<in use>)"),
    }
  }
}
