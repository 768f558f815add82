// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-socket send state owned by the client I/O thread.
//!
//! # Sliding window
//!
//! ```text
//!   acked        in flight (pending)       buffered, not sent yet
//! ---------|------------------------------|------------------------>
//!          ^ removed on cumulative ACK    ^ last_sent
//! ```
//!
//! Every packet stays in `buffer` until a cumulative ACK covers it, so
//! retransmission never needs the application to hand data in again.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::channel::SyncCall;
use super::ReceiveCallback;
use crate::channel::Outbox;
use crate::config::MIN_BUFFER_CHUNK;
use crate::ids::IdGenerator;
use crate::message::Message;
use crate::protocol::{MulticastPacket, SequenceNumber, SocketId, StreamId};
use crate::queue::QueueWriter;
use crate::semaphore::{NonblockingStorageSemaphore, StorageSemaphore};

/// Lifecycle of a client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninitialized,
    /// Creation acknowledged by the middleware
    Open,
    /// Delete requested while unacknowledged sends remain
    AboutToClose,
    /// Delete request transmitted
    Closed,
}

/// Where received packets of a socket go.
pub(crate) enum Delivery {
    Unbound,
    /// Blocking receive: packets are queued for the socket's reader.
    Inbox {
        queue: QueueWriter<MulticastPacket>,
        budget: Arc<NonblockingStorageSemaphore>,
    },
    /// Callback invoked on the I/O thread with borrowed payload bytes.
    Callback(ReceiveCallback),
}

pub(crate) struct SocketSendState {
    state: SocketState,
    pending_sends: usize,
    last_sent: SequenceNumber,
    seq_nrs: IdGenerator<SequenceNumber>,
    /// Unacknowledged packets by sequence number
    buffer: BTreeMap<SequenceNumber, Message>,
    delayed_close: Option<SyncCall>,
    out_budget: Option<Arc<StorageSemaphore>>,
    pub(crate) delivery: Delivery,
}

impl Default for SocketSendState {
    fn default() -> Self {
        Self {
            state: SocketState::Uninitialized,
            pending_sends: 0,
            last_sent: 0,
            seq_nrs: IdGenerator::new(),
            buffer: BTreeMap::new(),
            delayed_close: None,
            out_budget: None,
            delivery: Delivery::Unbound,
        }
    }
}

/// Budget charged for a packet of `size` bytes.
pub(crate) fn charge(size: usize) -> usize {
    size.max(MIN_BUFFER_CHUNK)
}

impl SocketSendState {
    pub(crate) fn opened() -> Self {
        Self {
            state: SocketState::Open,
            ..Default::default()
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn pending_sends(&self) -> usize {
        self.pending_sends
    }

    pub fn last_sent(&self) -> SequenceNumber {
        self.last_sent
    }

    /// Sequence numbers still held for retransmission.
    pub fn buffered(&self) -> Vec<SequenceNumber> {
        self.buffer.keys().copied().collect()
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub(crate) fn set_out_budget(&mut self, budget: Arc<StorageSemaphore>) {
        self.out_budget = Some(budget);
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = SocketState::Closed;
    }

    /// Park the delete request until the buffer drains.
    pub(crate) fn defer_close(&mut self, call: SyncCall) {
        self.state = SocketState::AboutToClose;
        self.delayed_close = Some(call);
    }

    /// Hand back the parked delete request once nothing is pending.
    pub(crate) fn take_ready_close(&mut self) -> Option<SyncCall> {
        if self.state == SocketState::AboutToClose && !self.has_pending_sends() {
            self.delayed_close.take()
        } else {
            None
        }
    }

    /// Assign the next sequence number, transmit if the window allows,
    /// and buffer the packet either way. Returns the sequence number.
    pub(crate) fn admit(
        &mut self,
        stream: StreamId,
        socket: SocketId,
        payload: Vec<u8>,
        window: usize,
        out: &mut Outbox,
    ) -> SequenceNumber {
        let seq = self.seq_nrs.next_id();
        let msg = Message::async_send(stream, socket, seq, payload);

        let extends_run = seq == 0 || seq == self.last_sent.wrapping_add(1);
        if extends_run && self.pending_sends < window {
            log::trace!("socket {}: send seq_nr {}", socket, seq);
            out.write(&msg);
            self.pending_sends += 1;
            self.last_sent = seq;
        } else {
            log::trace!("socket {}: seq_nr {} buffered (window full)", socket, seq);
        }
        self.buffer.insert(seq, msg);
        seq
    }

    /// Drop every packet up to and including `seq`, credit the out-budget
    /// and refill the window. Returns the number of packets removed.
    pub(crate) fn acknowledge(
        &mut self,
        seq: SequenceNumber,
        window: usize,
        out: &mut Outbox,
    ) -> usize {
        let retained = match seq.checked_add(1) {
            Some(next) => self.buffer.split_off(&next),
            None => BTreeMap::new(),
        };
        let removed = std::mem::replace(&mut self.buffer, retained);

        let released: usize = removed.values().map(|m| charge(m.content_size())).sum();
        self.pending_sends = self.pending_sends.saturating_sub(removed.len());
        if let Some(budget) = &self.out_budget {
            if released > 0 {
                budget.release(released);
            }
        }

        while self.pending_sends < window {
            let next = self.last_sent.wrapping_add(1);
            match self.buffer.get(&next) {
                Some(msg) => {
                    out.write(msg);
                    self.pending_sends += 1;
                    self.last_sent = next;
                }
                None => break,
            }
        }
        removed.len()
    }

    /// Write every buffered packet in `[from, last_sent]` again.
    /// Counters and buffer contents stay untouched.
    pub(crate) fn retransmit(&self, from: SequenceNumber, out: &mut Outbox) -> usize {
        if from > self.last_sent {
            return 0;
        }
        let mut count = 0;
        for msg in self.buffer.range(from..=self.last_sent).map(|(_, m)| m) {
            out.write(msg);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageCodec;

    fn sent_seqs(out: &mut Outbox) -> Vec<SequenceNumber> {
        let mut codec = MessageCodec::default();
        codec.feed(&out.take_pending());
        let mut seqs = Vec::new();
        while let Some(msg) = codec.decode_buffered().unwrap() {
            seqs.push(msg.field3());
        }
        seqs
    }

    #[test]
    fn test_admission_within_window() {
        let mut s = SocketSendState::opened();
        let mut out = Outbox::new();
        for i in 0..3u8 {
            s.admit(0, 7, vec![i; 10], 256, &mut out);
        }
        assert_eq!(sent_seqs(&mut out), vec![0, 1, 2]);
        assert_eq!(s.pending_sends(), 3);
        assert_eq!(s.last_sent(), 2);
        assert_eq!(s.buffered(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let budget = Arc::new(StorageSemaphore::new(charge(1) * 4));
        budget.acquire(charge(1) * 3);
        let mut s = SocketSendState::opened();
        s.set_out_budget(Arc::clone(&budget));
        let mut out = Outbox::new();
        for _ in 0..3 {
            s.admit(0, 1, vec![0], 256, &mut out);
        }

        assert_eq!(s.acknowledge(1, 256, &mut out), 2);
        assert_eq!(budget.available(), charge(1) * 3);
        assert_eq!(s.acknowledge(1, 256, &mut out), 0);
        assert_eq!(s.acknowledge(0, 256, &mut out), 0);
        assert_eq!(budget.available(), charge(1) * 3);
        assert_eq!(s.pending_sends(), 1);
        assert_eq!(s.buffered(), vec![2]);
    }

    #[test]
    fn test_ack_of_max_sequence_clears_everything() {
        let mut s = SocketSendState::opened();
        let mut out = Outbox::new();
        s.admit(0, 1, vec![0], 256, &mut out);
        assert_eq!(s.acknowledge(SequenceNumber::MAX, 256, &mut out), 1);
        assert!(!s.has_pending_sends());
    }

    #[test]
    fn test_retransmit_is_pure() {
        let mut s = SocketSendState::opened();
        let mut out = Outbox::new();
        for _ in 0..6 {
            s.admit(0, 1, vec![1, 2, 3], 4, &mut out);
        }
        assert_eq!(sent_seqs(&mut out), vec![0, 1, 2, 3]);

        assert_eq!(s.retransmit(1, &mut out), 3);
        assert_eq!(sent_seqs(&mut out), vec![1, 2, 3]);
        assert_eq!(s.last_sent(), 3);
        assert_eq!(s.pending_sends(), 4);
        assert_eq!(s.buffered(), vec![0, 1, 2, 3, 4, 5]);

        assert_eq!(s.retransmit(4, &mut out), 0);
    }

    #[test]
    fn test_delayed_close_waits_for_drain() {
        let mut s = SocketSendState::opened();
        let mut out = Outbox::new();
        s.admit(0, 1, vec![0], 256, &mut out);
        s.admit(0, 1, vec![0], 256, &mut out);

        let (tx, _rx) = crossbeam::channel::bounded(1);
        s.defer_close(SyncCall::new(
            crate::protocol::FunctionId::DeleteSocket,
            crate::wire::to_bytes(&1u32),
            tx,
        ));
        assert_eq!(s.state(), SocketState::AboutToClose);

        s.acknowledge(0, 256, &mut out);
        assert!(s.take_ready_close().is_none());
        s.acknowledge(1, 256, &mut out);
        assert!(s.take_ready_close().is_some());
        assert!(s.take_ready_close().is_none());
    }
}
