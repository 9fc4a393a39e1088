//! Lock-free single-producer/single-consumer ring buffer.
//!
//! This is the seam between the disk-reading feeder thread and the real-time
//! device callback, so the consumer side must never block, allocate, or
//! panic. Correctness rests on the index protocol alone:
//!
//! - `head` is the next slot to read, `tail` the next slot to write, both in
//!   `[0, capacity)`. The buffer is **empty** when `head == tail` and **full**
//!   when `(tail + 1) % capacity == head`; one slot is sacrificed so the two
//!   states stay distinguishable.
//! - Only the producer advances `tail`, only the consumer advances `head`.
//!   Index stores use `Release` and the opposite side loads with `Acquire`,
//!   so a consumer that observes a new `tail` also observes the value written
//!   to that slot, and a producer that observes a new `head` knows the slot
//!   is free to reuse.
//!
//! Slots are `MaybeUninit` so unused capacity is never default-constructed;
//! a slot holds a live value exactly when its index lies in the wrapping
//! range `[head, tail)`. `pop` moves the value out (the slot becomes vacant),
//! and whichever handle drops last drains the remaining live range.
//!
//! The producer/consumer handle split enforces the single-writer /
//! single-reader discipline at compile time: each handle can be moved to its
//! thread, but two producers (or consumers) cannot exist.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cache-line aligned wrapper so the two indices never share a line.
#[repr(align(64))]
struct CacheAligned<T>(T);

struct Inner<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    /// Next slot to read. Advanced only by the consumer.
    head: CacheAligned<AtomicUsize>,
    /// Next slot to write. Advanced only by the producer.
    tail: CacheAligned<AtomicUsize>,
}

// Access to the slots is mediated by the handle split: the producer writes
// only vacant slots, the consumer reads only live ones, and the index
// protocol orders those accesses.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    #[inline]
    fn next_index(&self, i: usize) -> usize {
        let next = i + 1;
        if next == self.capacity { 0 } else { next }
    }

    #[inline]
    fn len_from(&self, head: usize, tail: usize) -> usize {
        (tail + self.capacity - head) % self.capacity
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Both handles are gone, so the indices are stable and the live
        // range [head, tail) can be drained without synchronization. Each
        // element is dropped exactly once; a panicking element drop is
        // contained here because this may already run during unwinding.
        let mut head = *self.head.0.get_mut();
        let tail = *self.tail.0.get_mut();
        while head != tail {
            let slot = self.slots[head].get();
            let result = catch_unwind(AssertUnwindSafe(|| unsafe {
                (*slot).assume_init_drop();
            }));
            if result.is_err() {
                tracing::error!("element drop panicked during ring buffer teardown");
            }
            head = self.next_index(head);
        }
    }
}

/// Writer half of the ring. `Send` but unique, so exactly one thread pushes.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// Reader half of the ring. `Send` but unique, so exactly one thread pops.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Read-only occupancy view, cloneable and shareable.
///
/// `len()` is advisory the instant it returns; it is meant for backpressure
/// heuristics and status sampling, never for correctness decisions.
pub struct Monitor<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Monitor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Create a ring with `capacity` slots (usable capacity `capacity - 1`).
///
/// # Panics
///
/// Panics if `capacity < 2`; a smaller ring cannot hold a single element
/// under the one-slot-sacrifice scheme.
pub fn with_capacity<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity >= 2, "ring buffer requires at least 2 slots");
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(Inner {
        slots,
        capacity,
        head: CacheAligned(AtomicUsize::new(0)),
        tail: CacheAligned(AtomicUsize::new(0)),
    });
    (
        Producer {
            inner: inner.clone(),
        },
        Consumer { inner },
    )
}

impl<T> Producer<T> {
    /// Push a value, or hand it back if the ring is full.
    ///
    /// Never blocks. Must only be called from the producer thread, which the
    /// `&mut self` receiver on a unique handle guarantees.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let tail = self.inner.tail.0.load(Ordering::Relaxed);
        let next = self.inner.next_index(tail);
        if next == self.inner.head.0.load(Ordering::Acquire) {
            return Err(value);
        }
        // The slot is outside [head, tail), hence vacant: either never used
        // or its occupant was moved out by a pop the Acquire above observed.
        unsafe {
            (*self.inner.slots[tail].get()).write(value);
        }
        self.inner.tail.0.store(next, Ordering::Release);
        Ok(())
    }

    /// Live element count; see [`Monitor::len`] for the staleness caveat.
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.0.load(Ordering::Relaxed);
        let head = self.inner.head.0.load(Ordering::Acquire);
        self.inner.len_from(head, tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Usable capacity (one slot is sacrificed).
    pub fn capacity(&self) -> usize {
        self.inner.capacity - 1
    }

    /// A cloneable occupancy view onto the same ring.
    pub fn monitor(&self) -> Monitor<T> {
        Monitor {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Consumer<T> {
    /// Pop the oldest value, or `None` if the ring is empty.
    ///
    /// Real-time safe: never blocks, allocates, or panics. Must only be
    /// called from the consumer thread, which the `&mut self` receiver on a
    /// unique handle guarantees.
    pub fn pop(&mut self) -> Option<T> {
        let head = self.inner.head.0.load(Ordering::Relaxed);
        if head == self.inner.tail.0.load(Ordering::Acquire) {
            return None;
        }
        // head lies in [head, tail), hence live; reading it out vacates the
        // slot before the Release below lets the producer reuse it.
        let value = unsafe { (*self.inner.slots[head].get()).assume_init_read() };
        self.inner
            .head
            .0
            .store(self.inner.next_index(head), Ordering::Release);
        Some(value)
    }

    /// Live element count; see [`Monitor::len`] for the staleness caveat.
    pub fn len(&self) -> usize {
        let head = self.inner.head.0.load(Ordering::Relaxed);
        let tail = self.inner.tail.0.load(Ordering::Acquire);
        self.inner.len_from(head, tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable capacity (one slot is sacrificed).
    pub fn capacity(&self) -> usize {
        self.inner.capacity - 1
    }

    /// A cloneable occupancy view onto the same ring.
    pub fn monitor(&self) -> Monitor<T> {
        Monitor {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Monitor<T> {
    /// Best-effort live element count.
    ///
    /// May be stale the instant it is read when the producer or consumer is
    /// active concurrently.
    pub fn len(&self) -> usize {
        let head = self.inner.head.0.load(Ordering::Acquire);
        let tail = self.inner.tail.0.load(Ordering::Acquire);
        self.inner.len_from(head, tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity - 1
    }
}
