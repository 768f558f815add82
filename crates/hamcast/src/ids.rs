// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic id generation for sequence numbers, request ids, socket ids
//! and stream ids.
//!
//! Every generator is owned by exactly one I/O thread, so a plain counter
//! is enough; no atomics are involved.

/// Integer types usable as generated ids.
pub trait IdValue: Copy {
    const ZERO: Self;
    fn successor(self) -> Self;
}

macro_rules! impl_id_value {
    ($($t:ty),*) => {
        $(
            impl IdValue for $t {
                const ZERO: Self = 0;
                #[inline]
                fn successor(self) -> Self {
                    self.wrapping_add(1)
                }
            }
        )*
    };
}

impl_id_value!(u16, u32, u64);

/// Counter handing out `0, 1, 2, ...`, wrapping at the type's maximum.
#[derive(Debug, Clone)]
pub struct IdGenerator<T> {
    next: T,
}

impl<T: IdValue> IdGenerator<T> {
    pub fn new() -> Self {
        Self { next: T::ZERO }
    }

    /// Start at an arbitrary value.
    pub fn starting_at(first: T) -> Self {
        Self { next: first }
    }

    /// Hand out the next id.
    #[inline]
    pub fn next_id(&mut self) -> T {
        let id = self.next;
        self.next = id.successor();
        id
    }

    /// The id the next call to [`next_id`](Self::next_id) returns.
    #[inline]
    pub fn peek(&self) -> T {
        self.next
    }
}

impl<T: IdValue> Default for IdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}
