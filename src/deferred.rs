//! Deferred destruction.
//!
//! The main thread never frees something the audio thread might still be
//! looking at. Instead it publishes the replacement first, then wraps the
//! retired value in a [`DeferredFn`] and sends it through the audio thread.
//! The audio thread holds the token for one full block and sends it back
//! untouched; the main pump finally runs it.
//!
//! ```
//! use stagerack::DeferredFn;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let freed = Arc::new(AtomicBool::new(false));
//! let flag = freed.clone();
//! let token = DeferredFn::new(move || flag.store(true, Ordering::SeqCst));
//!
//! assert!(!freed.load(Ordering::SeqCst));
//! token.invoke();
//! assert!(freed.load(Ordering::SeqCst));
//! ```

use std::collections::VecDeque;
use std::fmt;

use crate::error::{Error, Result};

type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// A move-only closure that runs exactly once.
///
/// Running it is the only way to consume it: dropping an uninvoked token
/// runs the closure too, so whatever it owns can never leak.
pub struct DeferredFn(Box<Pending>);

/// Heap cell behind a [`DeferredFn`].
///
/// Boxed separately so a token is a thin pointer that fits in one packet word.
pub(crate) struct Pending {
    f: Option<Thunk>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl DeferredFn {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(Pending {
            f: Some(Box::new(f)),
        }))
    }

    /// Defer dropping `value` until the token runs.
    pub fn drop_later<T: Send + 'static>(value: T) -> Self {
        Self::new(move || drop(value))
    }

    /// Run the closure now.
    pub fn invoke(mut self) {
        if let Some(f) = self.0.f.take() {
            f();
        }
    }

    pub(crate) fn into_raw(self) -> *mut Pending {
        Box::into_raw(self.0)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`DeferredFn::into_raw`] and must not be used
    /// again afterwards.
    pub(crate) unsafe fn from_raw(ptr: *mut Pending) -> Self {
        Self(Box::from_raw(ptr))
    }

    pub(crate) fn as_ptr(&self) -> *const Pending {
        &*self.0
    }
}

impl fmt::Debug for DeferredFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeferredFn").field(&self.as_ptr()).finish()
    }
}

/// Fixed-capacity holding area for tokens on the audio thread.
///
/// Storage is reserved up front; pushing past the capacity is an error and
/// never reallocates.
pub(crate) struct DeferredQueue {
    tokens: VecDeque<DeferredFn>,
    capacity: usize,
}

impl DeferredQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Hold `token` until the end of the block.
    ///
    /// On overflow the token is leaked rather than run here: its closure
    /// belongs to the main thread and the caller is about to abort anyway.
    pub(crate) fn push(&mut self, token: DeferredFn) -> Result<()> {
        if self.tokens.len() >= self.capacity {
            std::mem::forget(token);
            return Err(Error::DeferredOverflow {
                capacity: self.capacity,
            });
        }
        self.tokens.push_back(token);
        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<DeferredFn> {
        self.tokens.pop_front()
    }

    /// Put back a token that could not be sent; it keeps its place in line.
    pub(crate) fn push_front(&mut self, token: DeferredFn) {
        self.tokens.push_front(token);
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.len()
    }
}
