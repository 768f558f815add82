// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte-budget semaphores for send/receive flow control.
//!
//! A storage semaphore counts bytes instead of units. Two flavours exist:
//!
//! - [`StorageSemaphore`]: `acquire` blocks until the budget allows it.
//!   Used by application threads feeding a socket's out-buffer.
//! - [`NonblockingStorageSemaphore`]: `try_acquire` fails instead of
//!   blocking. Used on I/O threads, which must never stall.
//!
//! # Blocking algorithm
//!
//! Both flavours reserve bytes with a compare-and-swap loop that only
//! commits when enough budget is left, so the counter never goes
//! negative. A blocked acquirer registers itself in a waiter count and
//! parks on a condvar; `release` only takes the lock when that count is
//! non-zero, so the uncontended path is lock-free on both sides.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Blocking byte-budget semaphore.
#[derive(Debug)]
pub struct StorageSemaphore {
    available: AtomicI64,
    max: i64,
    /// Acquirers currently parked (or about to park) on `cv`
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}

impl StorageSemaphore {
    /// Create a semaphore with `max` bytes of budget.
    pub fn new(max: usize) -> Self {
        Self {
            available: AtomicI64::new(max as i64),
            max: max as i64,
            waiters: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Reserve `n` bytes, blocking until the budget allows it.
    ///
    /// `n` must not exceed [`maximum`](Self::maximum), or the call can
    /// never return.
    pub fn acquire(&self, n: usize) {
        debug_assert!(n as i64 <= self.max, "acquire larger than budget");
        if try_reserve(&self.available, n) {
            return;
        }
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        while !try_reserve(&self.available, n) {
            self.cv.wait(&mut guard);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Like [`acquire`](Self::acquire) with an upper bound on the wait.
    ///
    /// Returns `false` if the budget did not become available in time.
    pub fn acquire_timeout(&self, n: usize, timeout: Duration) -> bool {
        if try_reserve(&self.available, n) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut granted = try_reserve(&self.available, n);
        while !granted {
            let timed_out = self.cv.wait_until(&mut guard, deadline).timed_out();
            granted = try_reserve(&self.available, n);
            if timed_out {
                break;
            }
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        granted
    }

    /// Reserve without ever waiting; fails if the budget is short.
    pub fn try_acquire(&self, n: usize) -> bool {
        try_reserve(&self.available, n)
    }

    /// Return `n` bytes and wake blocked acquirers.
    pub fn release(&self, n: usize) {
        self.available.fetch_add(n as i64, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cv.notify_all();
        }
    }

    /// Bytes currently free.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire).max(0) as usize
    }

    pub fn maximum(&self) -> usize {
        self.max as usize
    }

    /// Bytes currently reserved.
    pub fn acquired(&self) -> usize {
        (self.max - self.available.load(Ordering::Acquire)).max(0) as usize
    }
}

/// Byte-budget semaphore that never blocks.
#[derive(Debug)]
pub struct NonblockingStorageSemaphore {
    available: AtomicI64,
    max: i64,
}

impl NonblockingStorageSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            available: AtomicI64::new(max as i64),
            max: max as i64,
        }
    }

    /// Reserve `n` bytes if they are available right now.
    pub fn try_acquire(&self, n: usize) -> bool {
        try_reserve(&self.available, n)
    }

    pub fn release(&self, n: usize) {
        self.available.fetch_add(n as i64, Ordering::AcqRel);
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire).max(0) as usize
    }

    pub fn maximum(&self) -> usize {
        self.max as usize
    }

    pub fn acquired(&self) -> usize {
        (self.max - self.available.load(Ordering::Acquire)).max(0) as usize
    }
}

fn try_reserve(available: &AtomicI64, n: usize) -> bool {
    let n = n as i64;
    let mut current = available.load(Ordering::SeqCst);
    loop {
        if current < n {
            return false;
        }
        match available.compare_exchange_weak(
            current,
            current - n,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}
