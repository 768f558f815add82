// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application handle of one multicast socket.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::channel::ClientCommand;
use super::state::charge;
use super::Client;
use crate::config::DEFAULT_MAX_BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::protocol::{FunctionId, InterfaceId, MulticastPacket, SocketId, StreamId};
use crate::queue::{single_reader_queue, QueueReader};
use crate::semaphore::{NonblockingStorageSemaphore, StorageSemaphore};
use crate::uri::Uri;

/// Poll slice of a blocking receive, to notice a dead connection.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A multicast socket living in the middleware, driven through the
/// client's I/O thread.
///
/// Dropping the socket closes it.
pub struct MulticastSocket {
    client: Client,
    id: SocketId,
    /// Send stream per destination group, created on first use
    streams: Mutex<HashMap<Uri, StreamId>>,
    out_budget: Arc<StorageSemaphore>,
    in_budget: Arc<NonblockingStorageSemaphore>,
    inbox: Mutex<QueueReader<MulticastPacket>>,
    closed: AtomicBool,
}

impl MulticastSocket {
    /// Wire a socket the middleware just created into the I/O thread.
    pub(crate) fn bind(client: Client, id: SocketId, receive_budget: usize) -> Result<Self> {
        let (inbox_tx, inbox_rx) = single_reader_queue();
        let out_budget = Arc::new(StorageSemaphore::new(DEFAULT_MAX_BUFFER_SIZE));
        let in_budget = Arc::new(NonblockingStorageSemaphore::new(receive_budget));

        client.push(ClientCommand::BindSocket {
            socket: id,
            out_budget: Arc::clone(&out_budget),
            inbox: inbox_tx,
            in_budget: Arc::clone(&in_budget),
        })?;

        Ok(Self {
            client,
            id,
            streams: Mutex::new(HashMap::new()),
            out_budget,
            in_budget,
            inbox: Mutex::new(inbox_rx),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument(format!("socket {} is closed", self.id)));
        }
        Ok(())
    }

    fn require_group(group: &Uri) -> Result<()> {
        if group.is_empty() {
            return Err(Error::InvalidArgument("empty group".into()));
        }
        Ok(())
    }

    /// Stream id for `group`, asking the middleware on first use.
    fn stream_for(&self, group: &Uri) -> Result<StreamId> {
        let mut streams = self.streams.lock();
        if let Some(&stream) = streams.get(group) {
            return Ok(stream);
        }
        let stream: StreamId = self
            .client
            .call_typed(FunctionId::CreateSendStream, &(self.id, group.clone()))?;
        log::debug!("socket {}: stream {} for {}", self.id, stream, group);
        streams.insert(group.clone(), stream);
        Ok(stream)
    }

    // ------------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------------

    /// Send `data` to `group`.
    ///
    /// Blocks while the socket's out-buffer is full; returns once the
    /// packet is queued, not when it is delivered.
    pub fn send(&self, group: &Uri, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        Self::require_group(group)?;
        let max = self.client.max_msg_size() as usize;
        if data.len() > max {
            return Err(Error::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let stream = self.stream_for(group)?;
        let cost = charge(data.len());
        self.out_budget.acquire(cost);
        let cmd = ClientCommand::Send {
            socket: self.id,
            stream,
            payload: data.to_vec(),
        };
        if let Err(e) = self.client.push(cmd) {
            self.out_budget.release(cost);
            return Err(e);
        }
        Ok(())
    }

    fn take(&self, packet: MulticastPacket) -> MulticastPacket {
        self.in_budget.release(packet.size());
        packet
    }

    /// Wait for the next packet.
    ///
    /// Fails with [`Error::ChannelClosed`] once the connection is gone
    /// and no packet is left.
    pub fn receive(&self) -> Result<MulticastPacket> {
        let mut inbox = self.inbox.lock();
        loop {
            if let Some(packet) = inbox.try_pop_for(RECEIVE_POLL_INTERVAL) {
                return Ok(self.take(packet));
            }
            if !self.client.is_connected() {
                return Err(Error::ChannelClosed);
            }
        }
    }

    /// Next packet if one is queued.
    pub fn try_receive(&self) -> Option<MulticastPacket> {
        let packet = self.inbox.lock().try_pop()?;
        Some(self.take(packet))
    }

    /// Wait at most `timeout` for the next packet.
    pub fn try_receive_for(&self, timeout: Duration) -> Option<MulticastPacket> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock();
        let packet = inbox.try_pop_for(deadline.saturating_duration_since(Instant::now()))?;
        Some(self.take(packet))
    }

    /// Deliver packets to `callback` on the I/O thread instead of the
    /// receive queue. Packets already queued stay receivable.
    pub fn set_receive_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&Uri, &[u8]) + Send + 'static,
    {
        self.ensure_open()?;
        self.client.push(ClientCommand::SetReceiveCallback {
            socket: self.id,
            callback: Box::new(callback),
        })
    }

    // ------------------------------------------------------------------------
    // Membership and options
    // ------------------------------------------------------------------------

    pub fn join(&self, group: &Uri) -> Result<()> {
        self.ensure_open()?;
        Self::require_group(group)?;
        self.client
            .call_typed(FunctionId::Join, &(self.id, group.clone()))
    }

    pub fn leave(&self, group: &Uri) -> Result<()> {
        self.ensure_open()?;
        Self::require_group(group)?;
        self.client
            .call_typed(FunctionId::Leave, &(self.id, group.clone()))
    }

    pub fn set_ttl(&self, ttl: u8) -> Result<()> {
        self.ensure_open()?;
        self.client.call_typed(FunctionId::SetTtl, &(self.id, ttl))
    }

    /// Interfaces this socket sends on and receives from.
    pub fn interfaces(&self) -> Result<Vec<InterfaceId>> {
        self.ensure_open()?;
        self.client
            .call_typed(FunctionId::GetSockInterfaces, &self.id)
    }

    pub fn add_interface(&self, iface: InterfaceId) -> Result<()> {
        self.ensure_open()?;
        self.client
            .call_typed(FunctionId::AddSockInterface, &(self.id, iface))
    }

    pub fn del_interface(&self, iface: InterfaceId) -> Result<()> {
        self.ensure_open()?;
        self.client
            .call_typed(FunctionId::DelSockInterface, &(self.id, iface))
    }

    /// Replace the interface set; joined groups move along.
    pub fn set_interfaces(&self, ifaces: &[InterfaceId]) -> Result<()> {
        self.ensure_open()?;
        self.client
            .call_typed(FunctionId::SetSockInterfaces, &(self.id, ifaces.to_vec()))
    }

    /// Delete the socket in the middleware.
    ///
    /// Waits until every packet sent so far has been acknowledged.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.call_typed(FunctionId::DeleteSocket, &self.id)
    }
}

impl Drop for MulticastSocket {
    fn drop(&mut self) {
        if self.client.is_connected() {
            if let Err(e) = self.close() {
                log::debug!("closing socket {} failed: {}", self.id, e);
            }
        }
    }
}

impl fmt::Debug for MulticastSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastSocket")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("out_buffered", &self.out_budget.acquired())
            .field("in_buffered", &self.in_budget.acquired())
            .finish()
    }
}
