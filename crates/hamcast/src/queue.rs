// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free multi-producer / single-consumer work queue.
//!
//! Any number of threads hand items to exactly one consumer (an I/O
//! thread) without the consumer ever blocking them.
//!
//! # Algorithm
//!
//! ```text
//! producers --CAS--> public stack (LIFO)   c -> b -> a -> null
//!                          |
//!                 swap(null) by the reader, reversed
//!                          v
//! reader-private cache (FIFO)              a -> b -> c -> null
//! ```
//!
//! Producers prepend boxed nodes to an atomic stack. The reader serves
//! from a private FIFO list; only when that list runs dry does it claim
//! the whole public stack with one atomic swap and reverse it. The hot
//! path (cache non-empty) touches no shared state at all.
//!
//! A producer whose push turns the stack from empty into non-empty takes
//! the lock and signals the condvar, so a reader blocked in
//! [`QueueReader::pop`] wakes. [`QueueWriter::push_unsignalled`] skips
//! that step for callers that wake the reader through a side channel
//! (the channel's wakeup pipe).
//!
//! The type system enforces the single-reader rule: [`QueueReader`] is
//! not `Clone` and its methods take `&mut self`.

use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn boxed(value: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }))
    }
}

struct Shared<T> {
    /// Most recently pushed node first
    stack: AtomicPtr<Node<T>>,
    lock: Mutex<()>,
    cv: Condvar,
    _owns: PhantomData<Box<Node<T>>>,
}

// SAFETY: nodes are moved between threads, never shared by reference.
// Every node is owned by exactly one side at a time: by the pushing
// producer until its CAS succeeds, then by the stack, then by the reader
// after its swap.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Link the chain `head ..= tail` in front of the public stack.
    /// Returns `true` if the stack was empty before.
    ///
    /// # Safety
    /// `head` must reach `tail` through `next` links and the chain must
    /// be exclusively owned by the caller.
    unsafe fn link(&self, head: *mut Node<T>, tail: *mut Node<T>) -> bool {
        let mut current = self.stack.load(Ordering::Acquire);
        loop {
            (*tail).next = current;
            match self
                .stack
                .compare_exchange_weak(current, head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current.is_null(),
                Err(actual) => current = actual,
            }
        }
    }

    fn signal(&self) {
        let _guard = self.lock.lock();
        self.cv.notify_one();
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let mut p = *self.stack.get_mut();
        while !p.is_null() {
            // SAFETY: the last Arc is gone, nobody else can reach the stack.
            let node = unsafe { Box::from_raw(p) };
            p = node.next;
        }
    }
}

/// Create a queue, returning its producer and consumer halves.
pub fn single_reader_queue<T: Send>() -> (QueueWriter<T>, QueueReader<T>) {
    let shared = Arc::new(Shared {
        stack: AtomicPtr::new(ptr::null_mut()),
        lock: Mutex::new(()),
        cv: Condvar::new(),
        _owns: PhantomData,
    });
    (
        QueueWriter {
            shared: Arc::clone(&shared),
        },
        QueueReader {
            shared,
            cache: ptr::null_mut(),
        },
    )
}

// ============================================================================
// Producer side
// ============================================================================

/// Producer handle; clone freely across threads.
pub struct QueueWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> QueueWriter<T> {
    /// Enqueue one item, waking a blocked reader if the queue was empty.
    pub fn push(&self, value: T) {
        let node = Node::boxed(value);
        // SAFETY: a fresh node is a chain of length one we own.
        if unsafe { self.shared.link(node, node) } {
            self.shared.signal();
        }
    }

    /// Enqueue one item without signalling the condvar.
    pub fn push_unsignalled(&self, value: T) {
        let node = Node::boxed(value);
        // SAFETY: as in `push`.
        unsafe {
            self.shared.link(node, node);
        }
    }

    /// Enqueue several items with a single CAS. They are dequeued in
    /// iteration order, without items of other producers in between.
    ///
    /// Returns the number of items pushed.
    pub fn push_batch<I: IntoIterator<Item = T>>(&self, items: I) -> usize {
        let mut head: *mut Node<T> = ptr::null_mut();
        let mut tail: *mut Node<T> = ptr::null_mut();
        let mut count = 0;
        for value in items {
            let node = Node::boxed(value);
            if tail.is_null() {
                tail = node;
            } else {
                // SAFETY: `node` is fresh and exclusively ours.
                unsafe { (*node).next = head };
            }
            head = node;
            count += 1;
        }
        if count > 0 {
            // SAFETY: head reaches tail through the links built above.
            if unsafe { self.shared.link(head, tail) } {
                self.shared.signal();
            }
        }
        count
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// The one consumer of a queue.
pub struct QueueReader<T> {
    shared: Arc<Shared<T>>,
    /// Private FIFO list, oldest item first
    cache: *mut Node<T>,
}

// SAFETY: the cache is owned exclusively by this reader.
unsafe impl<T: Send> Send for QueueReader<T> {}

impl<T: Send> QueueReader<T> {
    /// Claim the public stack and reverse it into the cache.
    /// Only called with an empty cache.
    fn take_public_tail(&mut self) -> bool {
        debug_assert!(self.cache.is_null());
        let mut p = self.shared.stack.swap(ptr::null_mut(), Ordering::Acquire);
        if p.is_null() {
            return false;
        }
        while !p.is_null() {
            // SAFETY: the swap transferred ownership of the whole chain.
            unsafe {
                let next = (*p).next;
                (*p).next = self.cache;
                self.cache = p;
                p = next;
            }
        }
        true
    }

    fn ensure_cache(&mut self) -> bool {
        !self.cache.is_null() || self.take_public_tail()
    }

    /// Dequeue without waiting.
    pub fn try_pop(&mut self) -> Option<T> {
        if !self.ensure_cache() {
            return None;
        }
        // SAFETY: cache nodes are owned by the reader.
        let node = unsafe { Box::from_raw(self.cache) };
        self.cache = node.next;
        Some(node.value)
    }

    /// Dequeue, blocking until an item is available.
    pub fn pop(&mut self) -> T {
        loop {
            if let Some(v) = self.try_pop() {
                return v;
            }
            let mut guard = self.shared.lock.lock();
            while self.shared.stack.load(Ordering::Acquire).is_null() {
                self.shared.cv.wait(&mut guard);
            }
        }
    }

    /// Dequeue, waiting at most `timeout`.
    pub fn try_pop_for(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = self.try_pop() {
                return Some(v);
            }
            let mut guard = self.shared.lock.lock();
            while self.shared.stack.load(Ordering::Acquire).is_null() {
                if self.shared.cv.wait_until(&mut guard, deadline).timed_out() {
                    drop(guard);
                    return self.try_pop();
                }
            }
        }
    }

    /// Peek at the oldest item without removing it.
    pub fn front(&mut self) -> Option<&T> {
        if !self.ensure_cache() {
            return None;
        }
        // SAFETY: cache nodes are owned by the reader; the borrow is tied
        // to `&mut self`, so the node cannot be popped meanwhile.
        unsafe { self.cache.as_ref().map(|n| &n.value) }
    }

    /// Check whether nothing is queued, claiming pending pushes.
    pub fn is_empty(&mut self) -> bool {
        !self.ensure_cache()
    }

    /// Obtain another producer handle for this queue.
    pub fn writer(&self) -> QueueWriter<T> {
        QueueWriter {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for QueueReader<T> {
    fn drop(&mut self) {
        let mut p = self.cache;
        while !p.is_null() {
            // SAFETY: cache nodes are owned by the reader.
            let node = unsafe { Box::from_raw(p) };
            p = node.next;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
