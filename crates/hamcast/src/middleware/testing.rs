// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test double for a session: a live channel whose queue items are
//! forwarded to the test thread.

use std::os::unix::net::UnixStream;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use super::session::SessionItem;
use crate::channel::{Channel, ChannelHandle, ChannelHandler, Outbox};
use crate::error::Result;
use crate::message::Message;

struct Forward(Sender<SessionItem>);

impl ChannelHandler for Forward {
    type Item = SessionItem;

    fn handle_item(&mut self, item: SessionItem, _out: &mut Outbox) -> Result<()> {
        let _ = self.0.send(item);
        Ok(())
    }

    fn handle_message(&mut self, _msg: Message, _out: &mut Outbox) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct SessionSink {
    handle: ChannelHandle<SessionItem>,
    items: Receiver<SessionItem>,
    io: Option<JoinHandle<()>>,
    _peer: UnixStream,
}

impl SessionSink {
    pub(crate) fn start() -> Self {
        let (local, peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let (tx, items) = unbounded();
        let (channel, handle) =
            Channel::new(mio::net::UnixStream::from_std(local), None, |_| Forward(tx)).unwrap();
        let io = channel.spawn("session-sink").unwrap();
        Self {
            handle,
            items,
            io: Some(io),
            _peer: peer,
        }
    }

    pub(crate) fn handle(&self) -> ChannelHandle<SessionItem> {
        self.handle.clone()
    }

    pub(crate) fn next(&self, timeout: Duration) -> Option<SessionItem> {
        self.items.recv_timeout(timeout).ok()
    }
}

impl Drop for SessionSink {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(io) = self.io.take() {
            let _ = io.join();
        }
    }
}
