//! The Counted-Pointer used for `head`, `tail` and every `next` link.
//!
//! A Counted-Pointer bundles a Ptr to a Node together with the external
//! Reference-Count for that Node, both of which are updated as one single
//! atomic unit. This is achieved by packing both into a single `u128`, with
//! the Count stored in the upper 64 bits and the Ptr in the lower 64 bits.

use core::{fmt::Debug, marker::PhantomData};

use crate::sync::atomic::Ordering;

use super::node::Node;

#[cfg(not(loom))]
use portable_atomic::AtomicU128;

#[cfg(loom)]
use crate::sync::Mutex;

/// A Ptr to a Node together with the external Count of References that were
/// obtained through this specific Ptr
pub(crate) struct CountedPtr<T> {
    pub external_count: u64,
    pub ptr: *mut Node<T>,
}

impl<T> CountedPtr<T> {
    pub fn new(ptr: *mut Node<T>, external_count: u64) -> Self {
        Self {
            external_count,
            ptr,
        }
    }

    /// The value of a `next` link, that has not been linked to anything yet
    pub fn null() -> Self {
        Self::new(core::ptr::null_mut(), 0)
    }
}

impl<T> Clone for CountedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for CountedPtr<T> {}

impl<T> PartialEq for CountedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.external_count == other.external_count && self.ptr == other.ptr
    }
}
impl<T> Eq for CountedPtr<T> {}

impl<T> Debug for CountedPtr<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CountedPtr")
            .field("external_count", &self.external_count)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl<T> From<u128> for CountedPtr<T> {
    fn from(raw: u128) -> Self {
        Self {
            external_count: (raw >> 64) as u64,
            ptr: (raw as u64) as usize as *mut Node<T>,
        }
    }
}
impl<T> From<CountedPtr<T>> for u128 {
    fn from(counted: CountedPtr<T>) -> Self {
        ((counted.external_count as u128) << 64) | (counted.ptr as usize as u128)
    }
}

/// An atomic Cell holding a [`CountedPtr`]
pub(crate) struct AtomicCountedPtr<T> {
    #[cfg(not(loom))]
    raw: AtomicU128,
    #[cfg(loom)]
    raw: Mutex<u128>,
    _marker: PhantomData<*mut Node<T>>,
}

#[cfg(not(loom))]
impl<T> AtomicCountedPtr<T> {
    pub fn new(initial: CountedPtr<T>) -> Self {
        Self {
            raw: AtomicU128::new(initial.into()),
            _marker: PhantomData,
        }
    }

    /// Whether or not the underlying 128-bit Cell is backed by native
    /// double-word atomic instructions, which on x86_64 is detected at runtime
    pub fn is_lock_free() -> bool {
        AtomicU128::is_lock_free()
    }

    pub fn load(&self, order: Ordering) -> CountedPtr<T> {
        self.raw.load(order).into()
    }

    pub fn compare_exchange(
        &self,
        current: CountedPtr<T>,
        new: CountedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<T>, CountedPtr<T>> {
        self.raw
            .compare_exchange(current.into(), new.into(), success, failure)
            .map(CountedPtr::from)
            .map_err(CountedPtr::from)
    }

    pub fn compare_exchange_weak(
        &self,
        current: CountedPtr<T>,
        new: CountedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<T>, CountedPtr<T>> {
        self.raw
            .compare_exchange_weak(current.into(), new.into(), success, failure)
            .map(CountedPtr::from)
            .map_err(CountedPtr::from)
    }
}

// The double-word Cell is modelled as a Mutex for loom, so that every
// operation on it is still one indivisible step, while loom can explore the
// interleavings between them.
#[cfg(loom)]
impl<T> AtomicCountedPtr<T> {
    pub fn new(initial: CountedPtr<T>) -> Self {
        Self {
            raw: Mutex::new(initial.into()),
            _marker: PhantomData,
        }
    }

    pub fn is_lock_free() -> bool {
        false
    }

    fn with_raw<R>(&self, func: impl FnOnce(&mut u128) -> R) -> R {
        let mut guard = self
            .raw
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        func(&mut guard)
    }

    pub fn load(&self, _order: Ordering) -> CountedPtr<T> {
        self.with_raw(|raw| CountedPtr::from(*raw))
    }

    pub fn compare_exchange(
        &self,
        current: CountedPtr<T>,
        new: CountedPtr<T>,
        _success: Ordering,
        _failure: Ordering,
    ) -> Result<CountedPtr<T>, CountedPtr<T>> {
        let current: u128 = current.into();
        self.with_raw(|raw| {
            let previous = *raw;
            if previous == current {
                *raw = new.into();
                Ok(CountedPtr::from(previous))
            } else {
                Err(CountedPtr::from(previous))
            }
        })
    }

    pub fn compare_exchange_weak(
        &self,
        current: CountedPtr<T>,
        new: CountedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<T>, CountedPtr<T>> {
        self.compare_exchange(current, new, success, failure)
    }
}

impl<T> AtomicCountedPtr<T> {
    /// Registers the calling Thread as an additional external Reference to
    /// the Node currently stored in this Cell.
    ///
    /// `old` is the value the Caller last observed, it is refreshed with
    /// every failed attempt and holds the incremented value once this
    /// returns, which is exactly the value that is now stored in the Cell.
    pub fn increase_external_count(&self, old: &mut CountedPtr<T>) {
        loop {
            let mut new = *old;
            new.external_count += 1;

            match self.compare_exchange(*old, new, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => {
                    *old = new;
                    return;
                }
                Err(current) => {
                    *old = current;
                }
            };
        }
    }
}
