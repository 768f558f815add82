// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel: one transport, one I/O thread, one work queue.
//!
//! # Architecture
//!
//! ```text
//! application threads                      I/O thread
//! +----------------------+                 +-------------------------------+
//! | ChannelHandle::push  |--item--> queue  |          mio::Poll            |
//! |                      |--1 byte-> pipe -|-> PIPE_TOKEN: backlog += n    |
//! +----------------------+                 |   TRANSPORT_TOKEN: ipc_read() |
//!                                          |   backlog: poll_messages()    |
//!                                          |   timeout: on_timeout()       |
//!                                          +---------------+---------------+
//!                                                          | Outbox
//!                                                          v
//!                                                      transport
//! ```
//!
//! Producers push a work item onto the [single-reader queue](crate::queue)
//! *without* signalling its condvar and then write one byte per item into
//! a private pipe. The I/O thread wakes on the pipe, counts the bytes and
//! pops exactly that many items. Only the I/O thread reads the transport,
//! writes to it, or touches the [`ChannelHandler`]'s state.
//!
//! Pushes made by the I/O thread itself (from inside a hook, or when a
//! hook drops a value that pushes on drop) skip the pipe and bump a
//! counter instead, so a full pipe can never block its only reader.
//!
//! While the [`Outbox`] is over its limit the loop neither pops items nor
//! reads the transport. Announced items stay queued until the peer
//! drains enough output.

pub mod outbox;
pub mod transport;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};

use crate::config::{MAX_CONTENT_SIZE, MAX_EVENTS, MAX_NOTIFY_BATCH};
use crate::error::{Error, Result};
use crate::message::{Message, MessageCodec};
use crate::queue::{single_reader_queue, QueueReader, QueueWriter};

pub use outbox::Outbox;
pub use transport::{tcp_transport, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Token for the transport stream
const TRANSPORT_TOKEN: Token = Token(0);

/// Token for the wakeup pipe
const PIPE_TOKEN: Token = Token(1);

/// How long a clean shutdown keeps flushing queued output
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

// ============================================================================
// Handler hooks
// ============================================================================

/// Behaviour plugged into a [`Channel`]. All hooks run on the I/O thread.
///
/// Returning an error from any hook terminates the event loop.
pub trait ChannelHandler: Send + 'static {
    /// Work item type pushed by other threads.
    type Item: Send + 'static;

    /// Process one work item popped from the queue.
    fn handle_item(&mut self, item: Self::Item, out: &mut Outbox) -> Result<()>;

    /// Process one message decoded from the transport.
    fn handle_message(&mut self, msg: Message, out: &mut Outbox) -> Result<()>;

    /// Called when a poll returns without events.
    fn on_timeout(&mut self, _out: &mut Outbox) -> Result<()> {
        Ok(())
    }

    /// Called once after the loop ended and the transport was closed.
    /// `reason` is `None` for a requested shutdown.
    fn on_exit(&mut self, _reason: Option<&Error>) {}
}

// ============================================================================
// Producer handle
// ============================================================================

struct HandleState {
    pipe: pipe::Sender,
    /// Cleared when the loop should stop or has stopped
    running: AtomicBool,
    /// Thread running the event loop
    io_thread: OnceLock<ThreadId>,
    /// Items pushed by the I/O thread itself
    local_wakeups: AtomicUsize,
}

/// Cross-thread entry point of a channel; clone freely.
pub struct ChannelHandle<I> {
    queue: QueueWriter<I>,
    state: Arc<HandleState>,
}

impl<I> Clone for ChannelHandle<I> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<I: Send + 'static> ChannelHandle<I> {
    /// Hand one work item to the I/O thread.
    pub fn push(&self, item: I) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ChannelClosed);
        }
        self.queue.push_unsignalled(item);
        self.announce(1)
    }

    /// Hand several work items to the I/O thread with a single CAS.
    pub fn push_batch<It: IntoIterator<Item = I>>(&self, items: It) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ChannelClosed);
        }
        let count = self.queue.push_batch(items);
        self.announce(count)
    }

    fn announce(&self, mut count: usize) -> Result<()> {
        if self.state.io_thread.get() == Some(&thread::current().id()) {
            self.state.local_wakeups.fetch_add(count, Ordering::AcqRel);
            return Ok(());
        }
        while count > 0 {
            let chunk = count.min(MAX_NOTIFY_BATCH);
            self.notify_message(chunk)?;
            count -= chunk;
        }
        Ok(())
    }

    /// Write `count` wakeup bytes, one per queued item.
    pub fn notify_message(&self, count: usize) -> Result<()> {
        debug_assert!(count <= MAX_NOTIFY_BATCH);
        let dummy = [0u8; MAX_NOTIFY_BATCH];
        (&self.state.pipe)
            .write_all(&dummy[..count.min(MAX_NOTIFY_BATCH)])
            .map_err(|e| {
                log::debug!("wakeup pipe write failed: {}", e);
                Error::ChannelClosed
            })
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Ask the I/O thread to stop after handling what is already queued.
    pub fn shutdown(&self) {
        if self.state.running.swap(false, Ordering::AcqRel) {
            // Wake the loop; the extra byte pops nothing.
            let _ = (&self.state.pipe).write_all(&[0u8]);
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// A transport driven by a dedicated I/O thread.
pub struct Channel<T: Transport, H: ChannelHandler> {
    poll: Poll,
    transport: T,
    pipe_rx: pipe::Receiver,
    queue: QueueReader<H::Item>,
    state: Arc<HandleState>,
    codec: MessageCodec,
    outbox: Outbox,
    handler: H,
    poll_timeout: Option<Duration>,
    /// Transport is registered for WRITABLE too
    write_interest: bool,
    /// Items announced but not popped yet
    backlog: usize,
    /// Transport may hold unread bytes
    read_pending: bool,
}

impl<T: Transport, H: ChannelHandler> Channel<T, H> {
    /// Create a channel around `transport`.
    ///
    /// `build` receives a handle to the new channel, so the handler can
    /// give other threads a way to reach it.
    pub fn new<F>(
        mut transport: T,
        poll_timeout: Option<Duration>,
        build: F,
    ) -> io::Result<(Self, ChannelHandle<H::Item>)>
    where
        F: FnOnce(ChannelHandle<H::Item>) -> H,
    {
        let poll = Poll::new()?;
        let (pipe_tx, mut pipe_rx) = pipe::new()?;
        // Producers block instead of dropping wakeups if the pipe fills up.
        pipe_tx.set_nonblocking(false)?;

        poll.registry()
            .register(&mut transport, TRANSPORT_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut pipe_rx, PIPE_TOKEN, Interest::READABLE)?;

        let (queue_tx, queue_rx) = single_reader_queue();
        let state = Arc::new(HandleState {
            pipe: pipe_tx,
            running: AtomicBool::new(true),
            io_thread: OnceLock::new(),
            local_wakeups: AtomicUsize::new(0),
        });
        let handle = ChannelHandle {
            queue: queue_tx,
            state: Arc::clone(&state),
        };
        let handler = build(handle.clone());

        Ok((
            Self {
                poll,
                transport,
                pipe_rx,
                queue: queue_rx,
                state,
                codec: MessageCodec::new(MAX_CONTENT_SIZE),
                outbox: Outbox::new(),
                handler,
                poll_timeout,
                write_interest: false,
                backlog: 0,
                read_pending: false,
            },
            handle,
        ))
    }

    /// Replace the default limit on buffered output.
    pub fn with_write_limit(mut self, bytes: usize) -> Self {
        self.outbox = Outbox::with_limit(bytes);
        self
    }

    /// Run the event loop on a new named thread.
    pub fn spawn(self, name: &str) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
    }

    /// Run the event loop on the calling thread until the transport
    /// fails, the handler errors out, or a shutdown is requested.
    pub fn run(mut self) {
        let _ = self.state.io_thread.set(thread::current().id());
        log::debug!("channel started on {}", self.transport.describe());
        let reason = self.run_loop().err();

        if reason.is_none() {
            self.flush_before_close();
        }
        self.state.running.store(false, Ordering::Release);
        let _ = self.transport.shutdown();

        match &reason {
            Some(e) => log::debug!("channel on {} terminated: {}", self.transport.describe(), e),
            None => log::debug!("channel on {} shut down", self.transport.describe()),
        }
        self.handler.on_exit(reason.as_ref());
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.state.running.load(Ordering::Acquire) {
            let busy = self.has_ready_work();
            let timeout = if busy {
                Some(Duration::ZERO)
            } else {
                self.poll_timeout
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            if events.is_empty() && !busy {
                self.handler.on_timeout(&mut self.outbox)?;
            }

            for event in events.iter() {
                match event.token() {
                    PIPE_TOKEN => self.backlog += self.drain_pipe()?,
                    TRANSPORT_TOKEN => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.read_pending = true;
                        }
                    }
                    _ => {}
                }
            }

            self.pump()?;
            self.flush()?;
        }
        Ok(())
    }

    /// Queued items or unread input that the outbox has room for.
    fn has_ready_work(&self) -> bool {
        let announced = self.backlog > 0 || self.state.local_wakeups.load(Ordering::Acquire) > 0;
        (announced || self.read_pending) && !self.outbox.is_full()
    }

    /// Process input and queued items until both are exhausted or the
    /// outbox fills up.
    fn pump(&mut self) -> Result<()> {
        self.backlog += self.state.local_wakeups.swap(0, Ordering::AcqRel);
        if self.read_pending {
            self.ipc_read()?;
        }
        self.poll_messages()
    }

    /// Read all pending wakeup bytes; each one announces a queued item.
    fn drain_pipe(&mut self) -> Result<usize> {
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            match self.pipe_rx.read(&mut buf) {
                Ok(0) => return Err(Error::ChannelClosed),
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pop and process announced items while the outbox has room.
    fn poll_messages(&mut self) -> Result<()> {
        while self.backlog > 0 && !self.outbox.is_full() {
            match self.queue.try_pop() {
                Some(item) => {
                    self.backlog -= 1;
                    self.handler.handle_item(item, &mut self.outbox)?;
                }
                None => {
                    // shutdown wakeups announce nothing
                    self.backlog = 0;
                }
            }
        }
        if self.backlog > 0 {
            log::trace!("outbox full, {} queued items wait", self.backlog);
        }
        Ok(())
    }

    /// Decode and dispatch complete messages until the transport would
    /// block or the outbox is full.
    fn ipc_read(&mut self) -> Result<()> {
        while !self.outbox.is_full() {
            match self.codec.decode(&mut self.transport)? {
                Some(msg) => {
                    log::trace!("received {:?}", msg);
                    self.handler.handle_message(msg, &mut self.outbox)?;
                }
                None => {
                    self.read_pending = false;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Push the outbox to the transport; track WRITABLE interest while
    /// bytes remain.
    fn flush(&mut self) -> Result<()> {
        if self.outbox.is_empty() && !self.write_interest {
            return Ok(());
        }
        let drained = self.outbox.flush_to(&mut self.transport)?;
        if drained == self.write_interest {
            let interest = if drained {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            self.poll
                .registry()
                .reregister(&mut self.transport, TRANSPORT_TOKEN, interest)?;
            self.write_interest = !drained;
        }
        Ok(())
    }

    /// Handle already queued items and give pending output a bounded
    /// chance to leave before the transport is closed.
    fn flush_before_close(&mut self) {
        self.backlog += self.drain_pipe().unwrap_or(0);
        self.backlog += self.state.local_wakeups.swap(0, Ordering::AcqRel);
        let deadline = Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;
        loop {
            if let Err(e) = self.poll_messages() {
                log::debug!("dropping queued work on shutdown: {}", e);
                self.backlog = 0;
            }
            let drained = match self.outbox.flush_to(&mut self.transport) {
                Ok(drained) => drained,
                Err(_) => break,
            };
            if drained && self.backlog == 0 {
                break;
            }
            if Instant::now() >= deadline {
                log::debug!(
                    "shutdown flush timed out, {} bytes and {} items dropped",
                    self.outbox.pending_bytes(),
                    self.backlog
                );
                break;
            }
            if !drained {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FunctionId;
    use crossbeam::channel::{unbounded, Sender};
    use std::os::unix::net::UnixStream as StdUnixStream;

    /// Echoes items as sync requests and records decoded messages.
    struct Recorder {
        seen: Sender<Message>,
        exits: Sender<Option<String>>,
        timeouts: usize,
    }

    impl ChannelHandler for Recorder {
        type Item = u32;

        fn handle_item(&mut self, item: u32, out: &mut Outbox) -> Result<()> {
            out.write(&Message::sync_request(FunctionId::Join, item, Vec::new()));
            Ok(())
        }

        fn handle_message(&mut self, msg: Message, _out: &mut Outbox) -> Result<()> {
            let _ = self.seen.send(msg);
            Ok(())
        }

        fn on_timeout(&mut self, _out: &mut Outbox) -> Result<()> {
            self.timeouts += 1;
            Ok(())
        }

        fn on_exit(&mut self, reason: Option<&Error>) {
            let _ = self.exits.send(reason.map(|e| e.to_string()));
        }
    }

    fn pair() -> (mio::net::UnixStream, StdUnixStream) {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (mio::net::UnixStream::from_std(a), b)
    }

    #[test]
    fn test_items_become_wire_messages_in_order() {
        let (local, mut remote) = pair();
        let (seen_tx, _seen_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        let (channel, handle) = Channel::new(local, None, |_| Recorder {
            seen: seen_tx,
            exits: exit_tx,
            timeouts: 0,
        })
        .unwrap();
        let join = channel.spawn("test-channel").unwrap();

        for i in 0..10 {
            handle.push(i).unwrap();
        }
        handle.push_batch(10..50).unwrap();

        let mut codec = MessageCodec::default();
        for expected in 0..50 {
            let msg = loop {
                if let Some(m) = codec.decode_buffered().unwrap() {
                    break m;
                }
                let mut buf = [0u8; 4096];
                let n = remote.read(&mut buf).unwrap();
                codec.feed(&buf[..n]);
            };
            assert_eq!(msg.field2(), expected);
        }

        handle.shutdown();
        join.join().unwrap();
        assert_eq!(exit_rx.recv().unwrap(), None);
        assert!(matches!(handle.push(1), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_incoming_messages_dispatched() {
        let (local, mut remote) = pair();
        let (seen_tx, seen_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        let (channel, _handle) = Channel::new(local, None, |_| Recorder {
            seen: seen_tx,
            exits: exit_tx,
            timeouts: 0,
        })
        .unwrap();
        let join = channel.spawn("test-channel").unwrap();

        let mut buf = Vec::new();
        Message::cumulative_ack(1, 2, 3).encode_into(&mut buf);
        Message::retransmit(1, 2, 4).encode_into(&mut buf);
        remote.write_all(&buf).unwrap();

        let first = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, Message::cumulative_ack(1, 2, 3));
        assert_eq!(second, Message::retransmit(1, 2, 4));

        // hang-up terminates the loop with an error
        drop(remote);
        join.join().unwrap();
        assert!(exit_rx.recv().unwrap().is_some());
    }

    #[test]
    fn test_garbage_is_fatal() {
        let (local, mut remote) = pair();
        let (seen_tx, _seen_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        let (channel, _handle) = Channel::new(local, None, |_| Recorder {
            seen: seen_tx,
            exits: exit_tx,
            timeouts: 0,
        })
        .unwrap();
        let join = channel.spawn("test-channel").unwrap();

        remote.write_all(&[0xFF; 16]).unwrap();
        join.join().unwrap();
        let reason = exit_rx.recv().unwrap().unwrap();
        assert!(reason.contains("unknown message type"), "{}", reason);
    }

    #[test]
    fn test_timeout_hook_fires() {
        struct Ticker {
            ticks: Sender<()>,
        }
        impl ChannelHandler for Ticker {
            type Item = ();
            fn handle_item(&mut self, _: (), _: &mut Outbox) -> Result<()> {
                Ok(())
            }
            fn handle_message(&mut self, _: Message, _: &mut Outbox) -> Result<()> {
                Ok(())
            }
            fn on_timeout(&mut self, _: &mut Outbox) -> Result<()> {
                let _ = self.ticks.send(());
                Ok(())
            }
        }

        let (local, _remote) = pair();
        let (tick_tx, tick_rx) = unbounded();
        let (channel, handle) =
            Channel::new(local, Some(Duration::from_millis(1)), |_| Ticker { ticks: tick_tx })
                .unwrap();
        let join = channel.spawn("test-ticker").unwrap();
        for _ in 0..3 {
            tick_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_stalled_reader_bounds_buffered_output() {
        const ITEMS: usize = 1000;
        const PAYLOAD: usize = 16 * 1024;
        const LIMIT: usize = 64 * 1024;

        struct Bulky {
            handled: Arc<AtomicUsize>,
        }
        impl ChannelHandler for Bulky {
            type Item = u32;
            fn handle_item(&mut self, item: u32, out: &mut Outbox) -> Result<()> {
                out.write(&Message::sync_request(FunctionId::Join, item, vec![7; PAYLOAD]));
                self.handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn handle_message(&mut self, _: Message, _: &mut Outbox) -> Result<()> {
                Ok(())
            }
        }

        let (local, mut remote) = pair();
        let handled = Arc::new(AtomicUsize::new(0));
        let (channel, handle) = Channel::new(local, None, |_| Bulky {
            handled: Arc::clone(&handled),
        })
        .unwrap();
        let join = channel.with_write_limit(LIMIT).spawn("test-bulky").unwrap();

        handle.push_batch(0..ITEMS as u32).unwrap();
        thread::sleep(Duration::from_millis(300));
        // socket buffer plus the outbox limit, far below the full batch
        let stalled = handled.load(Ordering::SeqCst);
        assert!(stalled < ITEMS, "{} items handled with no reader", stalled);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(handled.load(Ordering::SeqCst), stalled);

        let mut codec = MessageCodec::default();
        let mut buf = vec![0u8; 64 * 1024];
        for expected in 0..ITEMS as u32 {
            let msg = loop {
                if let Some(m) = codec.decode_buffered().unwrap() {
                    break m;
                }
                let n = remote.read(&mut buf).unwrap();
                codec.feed(&buf[..n]);
            };
            assert_eq!(msg.field2(), expected);
            assert_eq!(msg.content().len(), PAYLOAD);
        }
        assert_eq!(handled.load(Ordering::SeqCst), ITEMS);

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_io_thread_pushes_to_itself_without_blocking() {
        // more items than the wakeup pipe has room for
        const FANOUT: u32 = 200_000;

        enum Work {
            Fan,
            Leaf,
        }
        struct Fanout {
            own: ChannelHandle<Work>,
            leaves: u32,
            done: Sender<u32>,
        }
        impl ChannelHandler for Fanout {
            type Item = Work;
            fn handle_item(&mut self, item: Work, _: &mut Outbox) -> Result<()> {
                match item {
                    Work::Fan => {
                        for _ in 0..FANOUT {
                            self.own.push(Work::Leaf)?;
                        }
                    }
                    Work::Leaf => {
                        self.leaves += 1;
                        if self.leaves == FANOUT {
                            let _ = self.done.send(self.leaves);
                        }
                    }
                }
                Ok(())
            }
            fn handle_message(&mut self, _: Message, _: &mut Outbox) -> Result<()> {
                Ok(())
            }
        }

        let (local, _remote) = pair();
        let (done_tx, done_rx) = unbounded();
        let (channel, handle) = Channel::new(local, None, |own| Fanout {
            own,
            leaves: 0,
            done: done_tx,
        })
        .unwrap();
        let join = channel.spawn("test-fanout").unwrap();

        handle.push(Work::Fan).unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(10)).unwrap(), FANOUT);

        handle.shutdown();
        join.join().unwrap();
    }
}
