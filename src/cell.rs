//! Shared objects the audio thread mutates.
//!
//! Plugin instances and transport ports are created on the main thread and
//! referenced from a published snapshot, but only the audio thread ever
//! touches their buffers while that snapshot is live. [`RtCell`] encodes that
//! rule: the main thread gets `&mut` only while it holds the sole reference,
//! the audio thread gets `&mut` through a crate-private unsafe accessor.

use std::cell::UnsafeCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Interior-mutable cell written by exactly one thread at a time.
pub struct RtCell<T: ?Sized>(UnsafeCell<T>);

// SAFETY: every `&self -> &mut T` path is `rt_mut`, which is only called by the
// audio thread while processing a block. The main thread never reads through a
// published snapshot's cells, so there is never more than one accessor.
unsafe impl<T: ?Sized + Send> Sync for RtCell<T> {}

impl<T> RtCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

impl<T: ?Sized> RtCell<T> {
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }

    /// # Safety
    ///
    /// Audio thread only, and no other reference into this cell may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn rt_mut(&self) -> &mut T {
        &mut *self.0.get()
    }
}

/// Reference-counted [`RtCell`], compared and hashed by identity.
///
/// Two snapshots that name the same instance compare equal even if the
/// instance's internal state changed in between.
pub struct Shared<T: ?Sized>(Arc<RtCell<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RtCell::new(value)))
    }
}

impl<T: ?Sized> Shared<T> {
    pub(crate) fn from_arc(inner: Arc<RtCell<T>>) -> Self {
        Self(inner)
    }

    pub(crate) fn into_arc(self) -> Arc<RtCell<T>> {
        self.0
    }

    /// Mutable access while no snapshot (or anything else) shares this object.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        Arc::get_mut(&mut self.0).map(RtCell::get_mut)
    }

    /// Read the object from outside the audio callback.
    ///
    /// # Safety
    ///
    /// The audio thread must not be processing a block that references this
    /// object for as long as the returned borrow lives.
    pub unsafe fn get(&self) -> &T {
        &*self.0 .0.get()
    }

    /// # Safety
    ///
    /// See [`RtCell::rt_mut`].
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn rt_mut(&self) -> &mut T {
        self.0.rt_mut()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: ?Sized> Eq for Shared<T> {}

impl<T: ?Sized> Hash for Shared<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&self.addr()).finish()
    }
}
