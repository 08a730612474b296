use crate::sync::atomic;

use super::counted::{AtomicCountedPtr, CountedPtr};

/// The Weight of a single external Counter in the combined Node-Count.
///
/// The internal Count lives in the lower Bits and may become negative for a
/// while. Its magnitude is bounded by the Number of Threads that currently
/// hold a Reference to the Node, because a Reference is only ever released on
/// the Node itself once the Counted-Pointer it was taken from has moved on
/// (an empty `pop` hands its Increment back to `head` instead). As long as
/// that stays below this Weight, the combined Count is only zero if both
/// parts are zero.
const EXTERNAL_COUNTER: i64 = 1 << 32;

/// Every Node is referenced by two Counted-Pointers during its lifetime, the
/// `tail` and the `next` link of its predecessor, which later becomes `head`
const INITIAL_EXTERNAL_COUNTERS: i64 = 2;

pub(crate) struct Node<T> {
    /// The boxed Payload of this Node, null for the Sentinel and after it was
    /// taken out by a consumer
    pub data: atomic::AtomicPtr<T>,
    /// `internal_count + external_counters * EXTERNAL_COUNTER`
    count: atomic::AtomicI64,
    pub next: AtomicCountedPtr<T>,
}

impl<T> Node<T> {
    /// Allocates a new empty Node, which is ready to become the next Sentinel
    pub fn alloc() -> *mut Self {
        let node = Box::new(Self {
            data: atomic::AtomicPtr::new(core::ptr::null_mut()),
            count: atomic::AtomicI64::new(INITIAL_EXTERNAL_COUNTERS * EXTERNAL_COUNTER),
            next: AtomicCountedPtr::new(CountedPtr::null()),
        });
        Box::into_raw(node)
    }

    /// Frees the given Node, including its Payload if there is still one
    ///
    /// # Safety
    /// The Ptr must have been created by [`Node::alloc`] and no other Thread
    /// may still be able to access the Node.
    pub unsafe fn dealloc(ptr: *mut Self) {
        drop(Box::from_raw(ptr));
    }

    /// Drops a Reference that was obtained through
    /// [`AtomicCountedPtr::increase_external_count`] but whose Counted-Pointer
    /// was swung away by someone else
    ///
    /// # Safety
    /// The Caller must hold such a Reference and must not access the Node
    /// after this returns.
    pub unsafe fn release_ref(ptr: *mut Self) {
        let previous = (*ptr).count.fetch_sub(1, atomic::Ordering::AcqRel);
        if previous - 1 == 0 {
            Self::reclaim(ptr);
        }
    }

    /// Retires the given Counted-Pointer, which the calling Thread just
    /// swung away from its Node.
    ///
    /// The Counted-Pointer accounts for one baseline Reference and the
    /// Reference of the calling Thread, every other Thread that increased the
    /// external Count will eventually call [`Node::release_ref`], so the
    /// remaining `external_count - 2` is moved to the internal Count while
    /// the external Counter itself is dropped.
    ///
    /// # Safety
    /// The Caller must be the Thread that removed the Counted-Pointer from the
    /// Structure and must not access the Node after this returns.
    pub unsafe fn free_external_counter(counted: CountedPtr<T>) {
        let ptr = counted.ptr;
        let count_increase = counted.external_count as i64 - 2;
        let delta = count_increase - EXTERNAL_COUNTER;

        let previous = (*ptr).count.fetch_add(delta, atomic::Ordering::AcqRel);
        if previous + delta == 0 {
            Self::reclaim(ptr);
        }
    }

    #[cfg(all(test, not(loom)))]
    pub fn combined_count(&self) -> i64 {
        self.count.load(atomic::Ordering::SeqCst)
    }

    unsafe fn reclaim(ptr: *mut Self) {
        tracing::trace!(node = ?ptr, "reclaiming node");
        Self::dealloc(ptr);
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        let data = self
            .data
            .swap(core::ptr::null_mut(), atomic::Ordering::Relaxed);
        if !data.is_null() {
            drop(unsafe { Box::from_raw(data) });
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct Tracked(Arc<atomic::AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, atomic::Ordering::SeqCst);
        }
    }

    fn tracked_node(drops: &Arc<atomic::AtomicUsize>) -> *mut Node<Tracked> {
        let node = Node::alloc();
        let data = Box::into_raw(Box::new(Tracked(drops.clone())));
        unsafe { &*node }
            .data
            .store(data, atomic::Ordering::SeqCst);
        node
    }

    #[test]
    fn dealloc_drops_payload() {
        let drops = Arc::new(atomic::AtomicUsize::new(0));
        let node = tracked_node(&drops);

        unsafe { Node::dealloc(node) };
        assert_eq!(1, drops.load(atomic::Ordering::SeqCst));
    }

    #[test]
    fn freed_after_both_counters() {
        let drops = Arc::new(atomic::AtomicUsize::new(0));
        let node = tracked_node(&drops);

        // Only the baseline and the retiring Thread were registered
        unsafe { Node::free_external_counter(CountedPtr::new(node, 2)) };
        assert_eq!(0, drops.load(atomic::Ordering::SeqCst));

        unsafe { Node::free_external_counter(CountedPtr::new(node, 2)) };
        assert_eq!(1, drops.load(atomic::Ordering::SeqCst));
    }

    #[test]
    fn release_before_free_external() {
        let drops = Arc::new(atomic::AtomicUsize::new(0));
        let node = tracked_node(&drops);

        // A third Thread loaded the Ptr and gives up before the Ptr is retired,
        // leaving the internal Count negative for a while
        unsafe { Node::release_ref(node) };
        unsafe { Node::free_external_counter(CountedPtr::new(node, 2)) };
        assert_eq!(0, drops.load(atomic::Ordering::SeqCst));

        unsafe { Node::free_external_counter(CountedPtr::new(node, 3)) };
        assert_eq!(1, drops.load(atomic::Ordering::SeqCst));
    }

    #[test]
    fn release_after_free_external() {
        let drops = Arc::new(atomic::AtomicUsize::new(0));
        let node = tracked_node(&drops);

        unsafe { Node::free_external_counter(CountedPtr::new(node, 2)) };
        unsafe { Node::free_external_counter(CountedPtr::new(node, 4)) };
        assert_eq!(0, drops.load(atomic::Ordering::SeqCst));

        unsafe { Node::release_ref(node) };
        assert_eq!(0, drops.load(atomic::Ordering::SeqCst));

        unsafe { Node::release_ref(node) };
        assert_eq!(1, drops.load(atomic::Ordering::SeqCst));
    }
}
