// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Middleware-side counterpart of one client socket.
//!
//! The proxy accepts the client's packets strictly in sequence order,
//! reserves send budget for each accepted packet and hands it to every
//! bound interface. Acknowledgements are cumulative and batched:
//!
//! - every `MAX_ACK_BLOCK_SIZE` completed packets,
//! - as soon as half of the send budget is held,
//! - or on the session's periodic timeout, whatever is outstanding.
//!
//! Packets out of sequence are dropped without a trace on the wire. They
//! only occur after a `retransmit` request, and the client resends its
//! whole run from the requested sequence number anyway.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use super::session::SessionItem;
use super::tech::{SendJob, SocketLink, TechInterface};
use crate::channel::{ChannelHandle, Outbox};
use crate::config::{DEFAULT_MAX_BUFFER_SIZE, MAX_ACK_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::message::{Message, MessageView};
use crate::protocol::{InterfaceId, SequenceNumber, SocketId, StreamId};
use crate::semaphore::NonblockingStorageSemaphore;
use crate::uri::Uri;

pub struct SocketProxy {
    id: SocketId,
    streams: BTreeMap<StreamId, Uri>,
    stream_ids: IdGenerator<StreamId>,
    ttl: u8,
    interfaces: Vec<Arc<TechInterface>>,
    joined: BTreeSet<Uri>,
    send_budget: NonblockingStorageSemaphore,
    link: Arc<SocketLink>,
    next_expected: SequenceNumber,
    /// Accepted packets in sequence order; `true` once finished. Only
    /// the finished prefix counts as completed, so an ACK never covers a
    /// packet that is still being sent.
    in_flight: VecDeque<(StreamId, SequenceNumber, bool)>,
    /// Completed packets not yet acknowledged
    unacked: u32,
    /// Stream and sequence number of the newest completed packet
    highest_done: Option<(StreamId, SequenceNumber)>,
}

impl std::fmt::Debug for SocketProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketProxy")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SocketProxy {
    /// Create the proxy for socket `id`, bound to `default_iface`.
    pub fn new(
        id: SocketId,
        session: ChannelHandle<SessionItem>,
        default_iface: Option<Arc<TechInterface>>,
    ) -> Result<Self> {
        let iface = default_iface
            .ok_or_else(|| Error::requirement("no technology interface available"))?;
        Ok(Self {
            id,
            streams: BTreeMap::new(),
            stream_ids: IdGenerator::new(),
            ttl: 1,
            interfaces: vec![iface],
            joined: BTreeSet::new(),
            send_budget: NonblockingStorageSemaphore::new(DEFAULT_MAX_BUFFER_SIZE),
            link: Arc::new(SocketLink {
                session,
                socket: id,
                receive_budget: Arc::new(NonblockingStorageSemaphore::new(
                    DEFAULT_MAX_BUFFER_SIZE,
                )),
            }),
            next_expected: 0,
            in_flight: VecDeque::new(),
            unacked: 0,
            highest_done: None,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    pub fn next_expected(&self) -> SequenceNumber {
        self.next_expected
    }

    pub fn joined(&self) -> impl Iterator<Item = &Uri> {
        self.joined.iter()
    }

    pub fn interface_ids(&self) -> Vec<InterfaceId> {
        self.interfaces.iter().map(|i| i.id()).collect()
    }

    /// Register a destination group and return its stream id.
    pub fn add_stream(&mut self, group: Uri) -> Result<StreamId> {
        if group.is_empty() {
            return Err(Error::requirement("empty group"));
        }
        if let Some((&stream, _)) = self.streams.iter().find(|(_, g)| **g == group) {
            return Ok(stream);
        }
        let stream = self.stream_ids.next_id();
        self.streams.insert(stream, group);
        Ok(stream)
    }

    // ------------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------------

    /// Accept or drop one `async_send` of this socket.
    pub fn handle_async_send(&mut self, msg: Message, out: &mut Outbox) {
        let MessageView::AsyncSend(send) = msg.view() else {
            return;
        };
        let (stream, seq, size) = (send.stream_id(), send.seq(), send.payload().len());

        if seq != self.next_expected {
            log::debug!(
                "socket {}: seq_nr {} dropped, expected {}",
                self.id,
                seq,
                self.next_expected
            );
            return;
        }
        let Some(group) = self.streams.get(&stream).cloned() else {
            log::warn!("socket {}: packet on unknown stream {} discarded", self.id, stream);
            self.next_expected = seq.wrapping_add(1);
            self.in_flight.push_back((stream, seq, true));
            self.complete_finished(out);
            return;
        };
        if !self.send_budget.try_acquire(size) {
            log::debug!("socket {}: send budget exhausted, seq_nr {} requested again", self.id, seq);
            out.write(&Message::retransmit(stream, self.id, seq));
            return;
        }

        self.next_expected = seq.wrapping_add(1);
        self.in_flight.push_back((stream, seq, false));
        log::trace!("socket {}: seq_nr {} to {} ({} bytes)", self.id, seq, group, size);
        let job = Arc::new(SendJob::new(msg, group, self.ttl, self.link.session.clone()));
        for iface in &self.interfaces {
            iface.add_job(Arc::clone(&job));
        }
    }

    /// Every interface finished with `msg`.
    pub fn send_done(&mut self, msg: &Message, out: &mut Outbox) {
        let MessageView::AsyncSend(send) = msg.view() else {
            return;
        };
        let seq = send.seq();
        match self.in_flight.iter_mut().find(|(_, s, done)| *s == seq && !*done) {
            Some(entry) => entry.2 = true,
            None => {
                log::debug!("socket {}: completion for unknown seq_nr {}", self.id, seq);
                return;
            }
        }
        self.complete_finished(out);
        self.send_budget.release(send.payload().len());
    }

    /// Count the finished prefix of `in_flight` as completed.
    fn complete_finished(&mut self, out: &mut Outbox) {
        while let Some(&(stream, seq, true)) = self.in_flight.front() {
            self.in_flight.pop_front();
            self.complete(stream, seq, out);
        }
    }

    fn complete(&mut self, stream: StreamId, seq: SequenceNumber, out: &mut Outbox) {
        self.unacked += 1;
        self.highest_done = Some((stream, seq));
        let pressure = self.send_budget.acquired() * 2 >= self.send_budget.maximum();
        if self.unacked >= MAX_ACK_BLOCK_SIZE || pressure {
            self.acknowledge(out);
        }
    }

    /// Acknowledge everything completed so far, if anything is pending.
    pub fn force_acks(&mut self, out: &mut Outbox) {
        if self.unacked > 0 {
            self.acknowledge(out);
        }
    }

    fn acknowledge(&mut self, out: &mut Outbox) {
        if let Some((stream, seq)) = self.highest_done {
            log::trace!("socket {}: cumulative ack {}", self.id, seq);
            out.write(&Message::cumulative_ack(stream, self.id, seq));
        }
        self.unacked = 0;
    }

    /// Packet of `size` bytes handed to the client; frees receive budget.
    ///
    /// Deliveries queued behind a full outbox keep holding theirs; once
    /// the budget is spent, interfaces drop packets for this socket.
    pub fn delivered(&self, size: usize) {
        self.link.receive_budget.release(size);
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    fn require_interfaces(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(Error::requirement(format!(
                "socket {} has no interface",
                self.id
            )));
        }
        Ok(())
    }

    pub fn join(&mut self, group: &Uri) -> Result<()> {
        self.require_interfaces()?;
        if group.is_empty() {
            return Err(Error::requirement("empty group"));
        }
        self.joined.insert(group.clone());
        for iface in &self.interfaces {
            iface.join(group, &self.link)?;
        }
        Ok(())
    }

    pub fn leave(&mut self, group: &Uri) -> Result<()> {
        self.require_interfaces()?;
        if group.is_empty() {
            return Err(Error::requirement("empty group"));
        }
        self.joined.remove(group);
        for iface in &self.interfaces {
            iface.leave(group, &self.link)?;
        }
        Ok(())
    }

    /// Leave every joined group on every interface.
    pub fn leave_all(&mut self) {
        for iface in &self.interfaces {
            if let Err(e) = iface.leave_all(&self.link) {
                log::warn!("socket {}: leave_all on interface {}: {}", self.id, iface.id(), e);
            }
        }
        self.joined.clear();
    }

    /// Replace the interface set. Joined groups are left on dropped
    /// interfaces and joined on new ones.
    pub fn set_interfaces(&mut self, wanted: Vec<Arc<TechInterface>>) -> Result<()> {
        let (kept, removed): (Vec<_>, Vec<_>) = self
            .interfaces
            .drain(..)
            .partition(|have| wanted.iter().any(|w| w.id() == have.id()));
        self.interfaces = kept;

        for iface in removed {
            iface.leave_all(&self.link)?;
        }
        for iface in wanted {
            if self.interfaces.iter().any(|have| have.id() == iface.id()) {
                continue;
            }
            for group in &self.joined {
                iface.join(group, &self.link)?;
            }
            self.interfaces.push(iface);
        }
        Ok(())
    }

    pub fn interfaces(&self) -> &[Arc<TechInterface>] {
        &self.interfaces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::registry::InterfaceRegistry;
    use crate::middleware::testing::SessionSink;
    use crate::middleware::loopback::LoopbackModule;
    use crate::message::MessageCodec;
    use crate::message::MessageType;
    use std::time::Duration;

    fn registry(n: usize) -> InterfaceRegistry {
        let registry = InterfaceRegistry::new();
        for i in 0..n {
            registry
                .add(Arc::new(LoopbackModule::new()), format!("lo{}", i), "127.0.0.1")
                .unwrap();
        }
        registry
    }

    fn written(out: &mut Outbox) -> Vec<Message> {
        let mut codec = MessageCodec::default();
        codec.feed(&out.take_pending());
        let mut msgs = Vec::new();
        while let Some(msg) = codec.decode_buffered().unwrap() {
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn test_requires_an_interface() {
        let sink = SessionSink::start();
        let err = SocketProxy::new(1, sink.handle(), None).unwrap_err();
        assert!(matches!(err, Error::RequirementFailed(_)));
    }

    #[test]
    fn test_out_of_order_packet_dropped() {
        let registry = registry(1);
        let sink = SessionSink::start();
        let mut proxy = SocketProxy::new(1, sink.handle(), registry.default_interface()).unwrap();
        let stream = proxy.add_stream(Uri::from("ip://g")).unwrap();
        let mut out = Outbox::new();

        for seq in 0..3 {
            proxy.handle_async_send(Message::async_send(stream, 1, seq, vec![0; 4]), &mut out);
        }
        assert_eq!(proxy.next_expected(), 3);

        proxy.handle_async_send(Message::async_send(stream, 1, 5, vec![0; 4]), &mut out);
        proxy.handle_async_send(Message::async_send(stream, 1, 1, vec![0; 4]), &mut out);
        assert_eq!(proxy.next_expected(), 3);
        assert!(out.is_empty());

        // Exactly three completions come back, none for the dropped ones.
        for _ in 0..3 {
            assert!(matches!(
                sink.next(Duration::from_secs(2)),
                Some(SessionItem::SendDone(_))
            ));
        }
        assert!(sink.next(Duration::from_millis(100)).is_none());
        registry.shutdown_all();
    }

    #[test]
    fn test_ack_batching_and_forced_ack() {
        let registry = registry(1);
        let sink = SessionSink::start();
        let mut proxy = SocketProxy::new(4, sink.handle(), registry.default_interface()).unwrap();
        let stream = proxy.add_stream(Uri::from("ip://g")).unwrap();
        let mut out = Outbox::new();

        let total = MAX_ACK_BLOCK_SIZE + 3;
        for seq in 0..total {
            let msg = Message::async_send(stream, 4, seq, vec![1; 8]);
            proxy.handle_async_send(msg.clone(), &mut out);
            proxy.send_done(&msg, &mut out);
        }
        let acks = written(&mut out);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].msg_type(), MessageType::CumulativeAck);
        assert_eq!(acks[0].field3(), MAX_ACK_BLOCK_SIZE - 1);

        proxy.force_acks(&mut out);
        let acks = written(&mut out);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].field3(), total - 1);

        proxy.force_acks(&mut out);
        assert!(out.is_empty());
        registry.shutdown_all();
    }

    #[test]
    fn test_ack_never_covers_packet_still_sending() {
        let registry = registry(1);
        let sink = SessionSink::start();
        let mut proxy = SocketProxy::new(5, sink.handle(), registry.default_interface()).unwrap();
        let stream = proxy.add_stream(Uri::from("ip://g")).unwrap();
        let mut out = Outbox::new();

        // seq 0 is still with the interface; seq 1 names no stream.
        let first = Message::async_send(stream, 5, 0, vec![1; 8]);
        proxy.handle_async_send(first.clone(), &mut out);
        proxy.handle_async_send(Message::async_send(stream + 7, 5, 1, vec![2; 8]), &mut out);
        assert_eq!(proxy.next_expected(), 2);

        proxy.force_acks(&mut out);
        assert!(out.is_empty());

        proxy.send_done(&first, &mut out);
        proxy.force_acks(&mut out);
        let acks = written(&mut out);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].field3(), 1);

        // A late duplicate completion does not move the ACK back.
        proxy.send_done(&first, &mut out);
        proxy.force_acks(&mut out);
        assert!(out.is_empty());
        registry.shutdown_all();
    }

    #[test]
    fn test_budget_exhaustion_requests_retransmit() {
        let registry = registry(1);
        let sink = SessionSink::start();
        let mut proxy = SocketProxy::new(2, sink.handle(), registry.default_interface()).unwrap();
        let stream = proxy.add_stream(Uri::from("ip://g")).unwrap();
        let mut out = Outbox::new();

        assert!(proxy.send_budget.try_acquire(DEFAULT_MAX_BUFFER_SIZE - 2));
        proxy.handle_async_send(Message::async_send(stream, 2, 0, vec![0; 16]), &mut out);

        let msgs = written(&mut out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type(), MessageType::Retransmit);
        assert_eq!(msgs[0].field3(), 0);
        assert_eq!(proxy.next_expected(), 0);
        registry.shutdown_all();
    }

    #[test]
    fn test_set_interfaces_moves_memberships() {
        let registry = registry(2);
        let sink = SessionSink::start();
        let mut proxy = SocketProxy::new(3, sink.handle(), registry.default_interface()).unwrap();
        let group = Uri::from("ip://239.0.0.1:5000");
        proxy.join(&group).unwrap();
        assert_eq!(registry.get(1).unwrap().local_groups(), vec![(group.clone(), 1)]);

        proxy.set_interfaces(vec![registry.get(2).unwrap()]).unwrap();
        assert_eq!(proxy.interface_ids(), vec![2]);
        assert!(registry.get(1).unwrap().local_groups().is_empty());
        assert_eq!(registry.get(2).unwrap().local_groups(), vec![(group.clone(), 1)]);

        proxy.leave_all();
        assert!(registry.get(2).unwrap().local_groups().is_empty());
        assert_eq!(proxy.joined().count(), 0);
        registry.shutdown_all();
    }

    #[test]
    fn test_streams_are_reused_per_group() {
        let registry = registry(1);
        let sink = SessionSink::start();
        let mut proxy = SocketProxy::new(1, sink.handle(), registry.default_interface()).unwrap();
        let a = proxy.add_stream(Uri::from("ip://a")).unwrap();
        let b = proxy.add_stream(Uri::from("ip://b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(proxy.add_stream(Uri::from("ip://a")).unwrap(), a);
        assert!(proxy.add_stream(Uri::default()).is_err());
        registry.shutdown_all();
    }
}
