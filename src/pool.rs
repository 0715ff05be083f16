//! Reuse pools for messages and commands.
//!
//! A [`Pool`] is a bounded free list. [`Pool::acquire`] hands out a
//! [`Pooled`] guard that owns the value exclusively; dropping the guard resets
//! the value and puts it back. Since the guard is the only way to reach a
//! pooled value, nothing can read it after it has been released.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

/// Values that can be cleared for reuse without giving up their allocations.
pub trait Recycle {
    /// Clear contents, keep capacity.
    fn recycle(&mut self);
}

/// Bounded free list of reusable values.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T: Recycle + Default> Pool<T> {
    /// Create an empty pool keeping at most `max_idle` released values.
    pub const fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take a value from the pool, or allocate a fresh one when it is empty.
    ///
    /// The value is reset before it is handed out.
    pub fn acquire(&'static self) -> Pooled<T> {
        let recycled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut value = recycled.unwrap_or_default();
        value.recycle();
        Pooled {
            value: Some(value),
            pool: self,
        }
    }

    /// Number of idle values currently held.
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, mut value: T) {
        value.recycle();
        let mut free = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(value);
        }
    }
}

/// Exclusive handle to a pooled value. Returns the value to its pool on drop.
pub struct Pooled<T: Recycle + Default + 'static> {
    value: Option<T>,
    pool: &'static Pool<T>,
}

impl<T: Recycle + Default + 'static> Pooled<T> {
    /// Detach the value from the pool; it will be dropped normally instead of
    /// being recycled.
    pub fn into_inner(mut self) -> T {
        self.value
            .take()
            .unwrap_or_default()
    }
}

impl<T: Recycle + Default + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            // only `into_inner` and `drop` empty the slot, both consume the guard
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T: Recycle + Default + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T: Recycle + Default + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self
            .value
            .take()
        {
            self.pool
                .release(value);
        }
    }
}

impl<T: Recycle + Default + fmt::Debug + 'static> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
