//! Bounded lock-free single-producer/single-consumer queue (C1).
//!
//! Fixed power-of-two capacity, wait-free enqueue/dequeue on the fast path,
//! cacheline-separated head/tail indices to avoid false sharing between the
//! producer and consumer. On full, `push` blocks with a bounded spin then
//! yields rather than dropping — admissions-equals-outcomes depends on this.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

const SPIN_ITERS: u32 = 64;

struct Slot<T> {
    value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Sync for Slot<T> {}

struct Inner<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    /// Set whenever an item is enqueued while the queue was empty; cleared
    /// by the consumer after it has drained down to empty. Lets a worker
    /// sleep and be woken with a single store instead of polling.
    has_items: CachePadded<AtomicBool>,
}

/// Producer half. `clone`-free: exactly one instance must exist per queue.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// Consumer half. Exactly one instance must exist per queue.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

/// Creates a bounded SPSC queue. `capacity` is rounded up to the next
/// power of two (minimum 2).
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.max(2).next_power_of_two();
    let buffer = (0..capacity)
        .map(|_| Slot {
            value: UnsafeCell::new(None),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let inner = Arc::new(Inner {
        buffer,
        mask: capacity - 1,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        has_items: CachePadded::new(AtomicBool::new(false)),
    });

    (
        Producer {
            inner: inner.clone(),
        },
        Consumer { inner },
    )
}

impl<T> Producer<T> {
    /// Attempts to enqueue `value` without blocking. Returns `Err(value)`
    /// if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.inner.buffer.len() {
            return Err(value);
        }

        let idx = tail & self.inner.mask;
        unsafe {
            *self.inner.buffer[idx].value.get() = Some(value);
        }
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        self.inner.has_items.store(true, Ordering::Release);
        Ok(())
    }

    /// Enqueues `value`, applying backpressure (bounded spin then yield)
    /// while the queue is full. Never drops.
    pub fn push(&self, mut value: T) {
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                    for _ in 0..SPIN_ITERS {
                        std::hint::spin_loop();
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn capacity(&self) -> usize {
        self.inner.buffer.len()
    }
}

impl<T> Consumer<T> {
    /// Dequeues one item if present, without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let idx = head & self.inner.mask;
        let value = unsafe { (*self.inner.buffer[idx].value.get()).take() };
        self.inner.head.store(head.wrapping_add(1), Ordering::Release);

        if head.wrapping_add(1) == tail {
            self.inner.has_items.store(false, Ordering::Release);
        }

        value
    }

    /// Drains up to `max` items into `out`, returning the count drained.
    /// Used by the worker's admission step (K bounded by remaining
    /// capacity and an admission batch size).
    pub fn drain_into(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut drained = 0;
        while drained < max {
            match self.try_pop() {
                Some(v) => {
                    out.push(v);
                    drained += 1;
                }
                None => break,
            }
        }
        drained
    }

    pub fn has_items(&self) -> bool {
        self.inner.has_items.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order() {
        let (p, c) = channel::<u32>(4);
        p.push(1);
        p.push(2);
        p.push(3);
        assert_eq!(c.try_pop(), Some(1));
        assert_eq!(c.try_pop(), Some(2));
        assert_eq!(c.try_pop(), Some(3));
        assert_eq!(c.try_pop(), None);
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let (p, _c) = channel::<u32>(3);
        assert_eq!(p.capacity(), 4);
    }

    #[test]
    fn try_push_fails_when_full() {
        let (p, _c) = channel::<u32>(2);
        assert!(p.try_push(1).is_ok());
        assert!(p.try_push(2).is_ok());
        assert!(p.try_push(3).is_err());
    }

    #[test]
    fn has_items_tracks_emptiness() {
        let (p, c) = channel::<u32>(4);
        assert!(!c.has_items());
        p.push(1);
        assert!(c.has_items());
        c.try_pop();
        assert!(!c.has_items());
    }

    #[test]
    fn drain_into_respects_max() {
        let (p, c) = channel::<u32>(8);
        for i in 0..5 {
            p.push(i);
        }
        let mut out = Vec::new();
        let drained = c.drain_into(&mut out, 3);
        assert_eq!(drained, 3);
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn cross_thread_handoff() {
        let (p, c) = channel::<u32>(16);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u32 {
                p.push(i);
            }
        });

        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            if let Some(v) = c.try_pop() {
                received.push(v);
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..10_000).collect::<Vec<_>>());
    }
}
