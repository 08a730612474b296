//! The unbounded Lock-Free Queue
//!
//! # Memory-Reclamation
//! Nodes can't simply be freed once a Thread unlinks them, because other
//! Threads may still have loaded a Ptr to them from `head`, `tail` or a `next`
//! link just before. Instead every Node carries a split Reference-Count:
//! * The external Count lives next to the Ptr in every Counted-Pointer and is
//!   incremented by every Thread that loads the Ptr to access the Node
//! * The internal Count lives in the Node and is decremented whenever a Thread
//!   is done with a Node that it accessed
//!
//! Once a Counted-Pointer is swung away from a Node, its external Count is
//! folded into the internal Count and the Node is freed as soon as no
//! Counted-Pointer refers to it anymore and all Threads released it.

use core::{fmt::Debug, marker::PhantomData};

use crate::sync::atomic;

mod counted;
mod node;

use counted::{AtomicCountedPtr, CountedPtr};
use node::Node;

/// An unbounded Multi-Producer-Multi-Consumer Queue, which never blocks.
///
/// The Queue is not `Clone`, to share it between Threads wrap it in an
/// [`Arc`](std::sync::Arc).
///
/// # Example
/// ```rust
/// # use splitref::Queue;
/// let queue = Queue::new();
///
/// queue.push(13);
/// queue.push(14);
///
/// assert_eq!(Some(13), queue.pop());
/// assert_eq!(Some(14), queue.pop());
/// assert_eq!(None, queue.pop());
/// ```
pub struct Queue<T> {
    head: AtomicCountedPtr<T>,
    tail: AtomicCountedPtr<T>,
    _marker: PhantomData<T>,
}

// Safety:
// All the shared State is only ever accessed through atomic Operations and a
// Payload is only ever handed out to the single Thread that swapped it out of
// its Node, so sharing the Queue is fine as long as the Payloads themselves
// can be sent to other Threads.
unsafe impl<T> Sync for Queue<T> where T: Send {}
unsafe impl<T> Send for Queue<T> where T: Send {}

impl<T> Debug for Queue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Queue<{}>", core::any::type_name::<T>())
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Creates a new empty Queue, which only contains the initial Sentinel
    pub fn new() -> Self {
        let sentinel = CountedPtr::new(Node::alloc(), 1);

        Self {
            head: AtomicCountedPtr::new(sentinel),
            tail: AtomicCountedPtr::new(sentinel),
            _marker: PhantomData,
        }
    }

    /// Whether or not the Counted-Pointers are backed by native double-word
    /// atomic Instructions (`cmpxchg16b` on x86_64, detected at runtime).
    /// This only returns false on Targets without any 128-bit CAS, where the
    /// Queue is not Lock-Free.
    ///
    /// # Example
    /// ```rust
    /// # use splitref::Queue;
    /// if !Queue::<u64>::is_lock_free() {
    ///     println!("Running with the fallback for the Counted-Pointers");
    /// }
    /// ```
    pub fn is_lock_free() -> bool {
        AtomicCountedPtr::<T>::is_lock_free()
    }

    /// Checks if the Queue currently appears to be empty.
    ///
    /// # Note
    /// With other Threads operating on the Queue at the same time, this is
    /// only a Snapshot and may already be outdated once it returns.
    ///
    /// # Example
    /// ```rust
    /// # use splitref::Queue;
    /// let queue = Queue::new();
    /// assert!(queue.is_empty());
    ///
    /// queue.push(13);
    /// assert!(!queue.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(atomic::Ordering::SeqCst);
        let tail = self.tail.load(atomic::Ordering::SeqCst);
        head.ptr == tail.ptr
    }

    /// Appends the given Data to the End of the Queue
    ///
    /// # Example
    /// ```rust
    /// # use splitref::Queue;
    /// let queue = Queue::new();
    ///
    /// queue.push(13);
    /// assert_eq!(Some(13), queue.pop());
    /// ```
    pub fn push(&self, data: T) {
        let new_data = Box::into_raw(Box::new(data));
        let mut new_next = CountedPtr::new(Node::alloc(), 1);

        let mut old_tail = self.tail.load(atomic::Ordering::SeqCst);
        loop {
            self.tail.increase_external_count(&mut old_tail);
            // Safety:
            // We registered ourselves as an external Reference, so the Node
            // stays alive until we release it again in `set_new_tail`
            let tail_node = unsafe { &*old_tail.ptr };

            // Claim the Sentinel by storing our Data in it
            if tail_node
                .data
                .compare_exchange(
                    core::ptr::null_mut(),
                    new_data,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::SeqCst,
                )
                .is_ok()
            {
                let linked = match tail_node.next.compare_exchange(
                    CountedPtr::null(),
                    new_next,
                    atomic::Ordering::SeqCst,
                    atomic::Ordering::SeqCst,
                ) {
                    Ok(_) => new_next,
                    Err(current) => {
                        // Another Thread already linked a new Sentinel for us
                        unsafe { Node::dealloc(new_next.ptr) };
                        current
                    }
                };

                self.set_new_tail(&mut old_tail, linked);
                return;
            }

            // Some other push claimed this Sentinel, help it by linking the
            // next Node so that it can't stall us
            let linked = match tail_node.next.compare_exchange(
                CountedPtr::null(),
                new_next,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let linked = new_next;
                    new_next = CountedPtr::new(Node::alloc(), 1);
                    linked
                }
                Err(current) => current,
            };
            self.set_new_tail(&mut old_tail, linked);
        }
    }

    /// Swings `tail` from the Node in `old_tail` to `new_tail` and releases
    /// the Reference to the old Tail-Node obtained by the Caller
    fn set_new_tail(&self, old_tail: &mut CountedPtr<T>, new_tail: CountedPtr<T>) {
        let current_tail_ptr = old_tail.ptr;

        loop {
            match self.tail.compare_exchange_weak(
                *old_tail,
                new_tail,
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    *old_tail = current;
                    if current.ptr != current_tail_ptr {
                        break;
                    }
                }
            };
        }

        // Safety:
        // If the Ptr still matches, we are the ones who swung the Tail away
        // from the Node, otherwise someone else did and we only hold a plain
        // Reference to it
        if old_tail.ptr == current_tail_ptr {
            unsafe { Node::free_external_counter(*old_tail) };
        } else {
            unsafe { Node::release_ref(current_tail_ptr) };
        }
    }

    /// Attempts to remove the first Element of the Queue, returns `None` if
    /// no Element was linked into the Queue at the Time of the Attempt
    ///
    /// # Example
    /// ```rust
    /// # use splitref::Queue;
    /// let queue = Queue::new();
    /// assert_eq!(None, queue.pop());
    ///
    /// queue.push(13);
    /// assert_eq!(Some(13), queue.pop());
    /// assert_eq!(None, queue.pop());
    /// ```
    pub fn pop(&self) -> Option<T> {
        let mut old_head = self.head.load(atomic::Ordering::Relaxed);
        self.head.increase_external_count(&mut old_head);

        loop {
            let ptr = old_head.ptr;

            if ptr == self.tail.load(atomic::Ordering::SeqCst).ptr {
                self.release_head(old_head);
                return None;
            }

            // Safety:
            // We hold an external Reference to the Node, obtained above
            let head_node = unsafe { &*ptr };
            let next = head_node.next.load(atomic::Ordering::SeqCst);
            debug_assert!(!next.ptr.is_null(), "Head behind the Tail must be linked");

            match self.head.compare_exchange(
                old_head,
                next,
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let data = head_node
                        .data
                        .swap(core::ptr::null_mut(), atomic::Ordering::SeqCst);
                    unsafe { Node::free_external_counter(old_head) };

                    debug_assert!(!data.is_null(), "Unlinked a Node without any Data");
                    if data.is_null() {
                        tracing::error!("unlinked a node without data, retrying");

                        old_head = self.head.load(atomic::Ordering::Relaxed);
                        self.head.increase_external_count(&mut old_head);
                        continue;
                    }

                    // Safety:
                    // The Swap above is the only Place a Payload can be taken
                    // out of its Node, so we are the sole Owner of it now
                    let boxed = unsafe { Box::from_raw(data) };
                    return Some(*boxed);
                }
                // Only the Count changed, our Increment is still part of it
                Err(current) if current.ptr == ptr => {
                    old_head = current;
                }
                Err(current) => {
                    unsafe { Node::release_ref(ptr) };
                    old_head = current;
                    self.head.increase_external_count(&mut old_head);
                }
            };
        }
    }

    /// Gives back the external Reference to the Head-Node, that was obtained
    /// by an unsuccessful `pop`.
    ///
    /// As long as `head` still points to the Node, the Increment is simply
    /// undone on `head` itself. Otherwise it already got folded into the Node
    /// by whoever moved `head` and has to be released on the Node instead.
    fn release_head(&self, observed: CountedPtr<T>) {
        let ptr = observed.ptr;

        let mut current = observed;
        loop {
            let mut released = current;
            released.external_count -= 1;

            match self.head.compare_exchange(
                current,
                released,
                atomic::Ordering::Release,
                atomic::Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) if actual.ptr == ptr => {
                    current = actual;
                }
                Err(_) => {
                    unsafe { Node::release_ref(ptr) };
                    return;
                }
            };
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut remaining = 0usize;

        let mut current = self.head.load(atomic::Ordering::SeqCst).ptr;
        while !current.is_null() {
            let node = unsafe { &*current };
            let next = node.next.load(atomic::Ordering::SeqCst).ptr;

            if !node.data.load(atomic::Ordering::SeqCst).is_null() {
                remaining += 1;
            }

            // Safety:
            // We have exclusive access to the Queue, so no other Thread can
            // hold a Reference to any of the Nodes
            unsafe { Node::dealloc(current) };
            current = next;
        }

        if remaining > 0 {
            tracing::debug!(remaining, "dropping queue with unconsumed elements");
        }
    }
}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn concurrent_push() {
        loom::model(|| {
            let queue = Arc::new(Queue::new());

            let q1 = queue.clone();
            let q2 = queue.clone();

            let handle1 = thread::spawn(move || q1.push(1));
            let handle2 = thread::spawn(move || q2.push(2));

            handle1.join().unwrap();
            handle2.join().unwrap();

            let mut values = vec![queue.pop().unwrap(), queue.pop().unwrap()];
            values.sort_unstable();
            assert_eq!(vec![1, 2], values);
            assert_eq!(None, queue.pop());
        });
    }

    #[test]
    fn push_concurrent_pop() {
        loom::model(|| {
            let queue = Arc::new(Queue::new());

            let producer = {
                let queue = queue.clone();
                thread::spawn(move || {
                    queue.push(1);
                    queue.push(2);
                })
            };

            let first = queue.pop();
            producer.join().unwrap();

            let mut popped: Vec<_> = first.into_iter().collect();
            while let Some(value) = queue.pop() {
                popped.push(value);
            }
            assert_eq!(vec![1, 2], popped);
        });
    }

    #[test]
    fn concurrent_pop() {
        loom::model(|| {
            let queue = Arc::new(Queue::new());
            queue.push(1);

            let q1 = queue.clone();
            let q2 = queue.clone();

            let handle1 = thread::spawn(move || q1.pop());
            let handle2 = thread::spawn(move || q2.pop());

            let first = handle1.join().unwrap();
            let second = handle2.join().unwrap();

            // Exactly one of the two pops gets the Element
            assert_eq!(Some(1), first.or(second));
            assert!(first.is_none() || second.is_none());
            assert_eq!(None, queue.pop());
        });
    }
}
