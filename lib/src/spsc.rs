//! Bounded single-producer/single-consumer channel.
//!
//! Used to hand owned values from an interrupt-driven producer to one
//! consumer task without a lock and without the producer ever waiting: a push
//! into a full channel returns the value to the caller instead of spinning.
//!
//! # Memory ordering
//!
//! `head` is written only by the producer and `tail` only by the consumer.
//! The producer writes the slot, then publishes it with a `Release` store of
//! `head`; the consumer `Acquire`-loads `head` before reading the slot, and
//! symmetrically for `tail` when a slot is handed back. Both indices are free
//! running counters; the slot is `index & mask`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Keeps the producer- and consumer-owned counters on separate cache lines.
#[repr(C, align(64))]
struct CachePadded<T> {
    value: T,
}

struct Shared<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Set when either half is dropped.
    closed: AtomicBool,
}

// SAFETY: each slot is accessed by exactly one side at a time, ownership of
// a slot moves between sides only through the Release/Acquire index stores.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let head = *self.head.value.get_mut();
        let mut tail = *self.tail.value.get_mut();
        while tail != head {
            let slot = &mut self.slots[tail & self.mask];
            // SAFETY: slots in [tail, head) were written by the producer and
            // not yet taken by the consumer.
            unsafe { slot.get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

/// Sending half. Exactly one exists per channel.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

/// Receiving half. Exactly one exists per channel.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

/// Create a channel holding up to `capacity` values.
///
/// `capacity` is rounded up to a power of two (minimum 1).
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.max(1).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<alloc::vec::Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        head: CachePadded {
            value: AtomicUsize::new(0),
        },
        tail: CachePadded {
            value: AtomicUsize::new(0),
        },
        mask: capacity - 1,
        slots,
        closed: AtomicBool::new(false),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

impl<T> Producer<T> {
    /// Enqueue `value`, or hand it back if the channel is full.
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        let shared = &*self.shared;
        let head = shared.head.value.load(Ordering::Relaxed);
        let tail = shared.tail.value.load(Ordering::Acquire);
        if head.wrapping_sub(tail) > shared.mask {
            return Err(value);
        }
        let slot = &shared.slots[head & shared.mask];
        // SAFETY: the slot at `head` is outside [tail, head), so the consumer
        // does not touch it until the store below publishes it.
        unsafe { (*slot.get()).write(value) };
        shared
            .head
            .value
            .store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }

    /// Values currently queued.
    pub fn len(&self) -> usize {
        let head = self.shared.head.value.load(Ordering::Relaxed);
        let tail = self.shared.tail.value.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl<T> Consumer<T> {
    /// Take the oldest value, if any.
    pub fn pop(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let tail = shared.tail.value.load(Ordering::Relaxed);
        let head = shared.head.value.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let slot = &shared.slots[tail & shared.mask];
        // SAFETY: the Acquire load of `head` makes the producer's write of
        // this slot visible, and the producer will not reuse it until the
        // store below.
        let value = unsafe { (*slot.get()).assume_init_read() };
        shared
            .tail
            .value
            .store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        let tail = self.shared.tail.value.load(Ordering::Relaxed);
        let head = self.shared.head.value.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer has gone away.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}
