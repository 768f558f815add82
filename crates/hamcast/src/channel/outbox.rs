// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outgoing byte buffer of a channel.
//!
//! Handlers encode messages into the outbox; the event loop flushes it
//! to the nonblocking transport and keeps the remainder when the socket
//! buffer is full.
//!
//! The limit is soft: [`Outbox::write`] always accepts the message, and
//! the event loop stops producing output while [`Outbox::is_full`].

use std::io::{self, Write};

use crate::config::DEFAULT_MAX_WRITE_BUFFER_SIZE;
use crate::message::Message;

#[derive(Debug)]
pub struct Outbox {
    buf: Vec<u8>,
    /// Bytes of `buf` already written
    offset: usize,
    /// Pending bytes at which producers must pause
    limit: usize,
    messages_queued: u64,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_WRITE_BUFFER_SIZE)
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            offset: 0,
            limit: limit.max(1),
            messages_queued: 0,
        }
    }

    /// Queue a message for transmission.
    pub fn write(&mut self, msg: &Message) {
        // Reclaim the flushed prefix before growing past the limit.
        if self.offset > 0 && self.offset >= self.limit {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }
        msg.encode_into(&mut self.buf);
        self.messages_queued += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.buf.len()
    }

    /// At or above the write limit.
    pub fn is_full(&self) -> bool {
        self.pending_bytes() >= self.limit
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes waiting for the transport.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Total messages ever queued.
    pub fn messages_queued(&self) -> u64 {
        self.messages_queued
    }

    /// Write as much as the transport accepts.
    ///
    /// Returns `Ok(true)` once everything is flushed, `Ok(false)` if the
    /// transport would block.
    pub fn flush_to<W: Write + ?Sized>(&mut self, w: &mut W) -> io::Result<bool> {
        while self.offset < self.buf.len() {
            match w.write(&self.buf[self.offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ))
                }
                Ok(n) => self.offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.buf.clear();
        self.offset = 0;
        Ok(true)
    }

    /// Take the unsent bytes out of the outbox.
    pub fn take_pending(&mut self) -> Vec<u8> {
        let out = self.buf.split_off(self.offset);
        self.buf.clear();
        self.offset = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer accepting at most `budget` bytes before blocking.
    struct Throttled {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_flush_resumes() {
        let mut outbox = Outbox::new();
        outbox.write(&Message::cumulative_ack(1, 2, 3));
        outbox.write(&Message::retransmit(1, 2, 4));
        assert_eq!(outbox.pending_bytes(), 32);

        let mut w = Throttled {
            data: Vec::new(),
            budget: 20,
        };
        assert!(!outbox.flush_to(&mut w).unwrap());
        assert_eq!(outbox.pending_bytes(), 12);

        w.budget = 100;
        assert!(outbox.flush_to(&mut w).unwrap());
        assert!(outbox.is_empty());
        assert_eq!(w.data.len(), 32);
        assert_eq!(outbox.messages_queued(), 2);
    }

    #[test]
    fn test_full_until_flushed_below_limit() {
        let mut outbox = Outbox::with_limit(40);
        for seq in 0..3 {
            outbox.write(&Message::retransmit(1, 2, seq));
        }
        assert!(!outbox.is_full());
        outbox.write(&Message::retransmit(1, 2, 3));
        assert!(outbox.is_full());

        // a stalled reader keeps it full
        let mut w = Throttled {
            data: Vec::new(),
            budget: 0,
        };
        assert!(!outbox.flush_to(&mut w).unwrap());
        assert!(outbox.is_full());

        w.budget = 48;
        assert!(!outbox.flush_to(&mut w).unwrap());
        assert!(!outbox.is_full());
        assert_eq!(outbox.pending_bytes(), 16);

        // compaction keeps the unsent tail intact
        outbox.write(&Message::retransmit(1, 2, 4));
        w.budget = 1024;
        assert!(outbox.flush_to(&mut w).unwrap());
        assert_eq!(w.data.len(), 80);
        assert_eq!(Outbox::new().limit(), DEFAULT_MAX_WRITE_BUFFER_SIZE);
    }
}
