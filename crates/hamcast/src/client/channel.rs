// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client side of the IPC link: sliding-window sender and RPC client.
//!
//! [`ClientChannel`] is the [`ChannelHandler`] of the client's I/O
//! thread. Application threads never touch it directly; they push
//! [`ClientCommand`]s and, for synchronous calls, wait on a one-shot
//! reply channel.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::Sender;

use super::config::ExitPolicy;
use super::state::{Delivery, SocketSendState};
use super::{EventCallback, ReceiveCallback};
use crate::channel::{ChannelHandler, Outbox};
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::message::{Message, MessageView, StreamControlView, SyncResponseView};
use crate::protocol::{
    ExceptionId, FunctionId, MulticastPacket, RequestId, SocketId, StreamId,
};
use crate::queue::QueueWriter;
use crate::semaphore::{NonblockingStorageSemaphore, StorageSemaphore};
use crate::wire::{from_bytes, WireReader};

// ============================================================================
// Work items
// ============================================================================

/// A synchronous call waiting for its `sync_response`.
pub(crate) struct SyncCall {
    pub fid: FunctionId,
    pub args: Vec<u8>,
    pub reply: Sender<Message>,
}

impl SyncCall {
    pub(crate) fn new(fid: FunctionId, args: Vec<u8>, reply: Sender<Message>) -> Self {
        Self { fid, args, reply }
    }

    /// Socket id leading the argument list (socket-scoped calls).
    fn socket_arg(&self) -> Option<SocketId> {
        WireReader::new(&self.args).read_u32().ok()
    }
}

/// Work handed from application threads to the client I/O thread.
pub(crate) enum ClientCommand {
    /// Payload for one group of a socket
    Send {
        socket: SocketId,
        stream: StreamId,
        payload: Vec<u8>,
    },
    /// Synchronous RPC
    Call(SyncCall),
    /// Packet injected locally, dispatched as if the middleware sent it
    Inject {
        socket: SocketId,
        packet: MulticastPacket,
    },
    /// Blocking-receive plumbing of a freshly created socket
    BindSocket {
        socket: SocketId,
        out_budget: Arc<StorageSemaphore>,
        inbox: QueueWriter<MulticastPacket>,
        in_budget: Arc<NonblockingStorageSemaphore>,
    },
    /// Switch a socket to callback delivery
    SetReceiveCallback {
        socket: SocketId,
        callback: ReceiveCallback,
    },
    /// Add a membership event listener
    RegisterEventCallback(EventCallback),
}

// ============================================================================
// Handler
// ============================================================================

pub(crate) struct ClientChannel {
    sockets: HashMap<SocketId, SocketSendState>,
    requests: HashMap<RequestId, SyncCall>,
    request_ids: IdGenerator<RequestId>,
    event_callbacks: Vec<EventCallback>,
    window: usize,
    exit_policy: ExitPolicy,
}

impl ClientChannel {
    pub(crate) fn new(window: usize, exit_policy: ExitPolicy) -> Self {
        Self {
            sockets: HashMap::new(),
            requests: HashMap::new(),
            request_ids: IdGenerator::new(),
            event_callbacks: Vec::new(),
            window,
            exit_policy,
        }
    }

    #[cfg(test)]
    pub(crate) fn socket(&self, sid: SocketId) -> Option<&SocketSendState> {
        self.sockets.get(&sid)
    }

    /// Write a sync request and remember it until its response arrives.
    fn transmit_call(&mut self, call: SyncCall, out: &mut Outbox) {
        let rid = self.request_ids.next_id();
        log::trace!("sync request {:?}, request id = {}", call.fid, rid);
        out.write(&Message::sync_request(call.fid, rid, call.args.clone()));

        if call.fid == FunctionId::DeleteSocket {
            if let Some(state) = call.socket_arg().and_then(|sid| self.sockets.get_mut(&sid)) {
                state.mark_closed();
            }
        }
        self.requests.insert(rid, call);
    }

    fn handle_call(&mut self, call: SyncCall, out: &mut Outbox) {
        if call.fid == FunctionId::DeleteSocket {
            if let Some(sid) = call.socket_arg() {
                if let Some(state) = self.sockets.get_mut(&sid) {
                    if state.has_pending_sends() {
                        log::debug!("socket {}: close delayed, sends still pending", sid);
                        state.defer_close(call);
                        return;
                    }
                }
            }
        }
        self.transmit_call(call, out);
    }

    /// Update local socket bookkeeping from a successful response.
    fn wiretap(&mut self, call: &SyncCall, resp: &SyncResponseView<'_>) -> Result<()> {
        if resp.exception_id()? != ExceptionId::None {
            return Ok(());
        }
        match call.fid {
            FunctionId::CreateSocket => {
                let sid: SocketId = from_bytes(resp.content())?;
                if self.sockets.insert(sid, SocketSendState::opened()).is_some() {
                    return Err(Error::Protocol(format!("socket id {} assigned twice", sid)));
                }
                log::debug!("socket {} created", sid);
            }
            FunctionId::CreateSendStream => {
                let sid = call.socket_arg().unwrap_or_default();
                if !self.sockets.contains_key(&sid) {
                    log::warn!("stream created for unknown socket {}", sid);
                }
            }
            FunctionId::DeleteSocket => {
                if let Some(sid) = call.socket_arg() {
                    self.sockets.remove(&sid);
                    log::debug!("socket {} deleted", sid);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_sync_response(&mut self, msg: &Message, resp: SyncResponseView<'_>) -> Result<()> {
        let Some(call) = self.requests.remove(&resp.request_id()) else {
            log::error!("request {} not found", resp.request_id());
            return Ok(());
        };
        self.wiretap(&call, &resp)?;
        // The caller may have given up waiting.
        let _ = call.reply.send(msg.clone());
        Ok(())
    }

    fn on_cumulative_ack(&mut self, ack: StreamControlView<'_>, out: &mut Outbox) {
        let sid = ack.socket_id();
        let Some(state) = self.sockets.get_mut(&sid) else {
            log::error!("ACK on an unknown socket {}", sid);
            return;
        };
        let removed = state.acknowledge(ack.seq(), self.window, out);
        log::trace!("socket {}: ACK {} removed {} packets", sid, ack.seq(), removed);

        if let Some(call) = state.take_ready_close() {
            log::debug!("socket {}: buffer drained, sending delayed close", sid);
            self.transmit_call(call, out);
        }
    }

    fn on_retransmit(&mut self, req: StreamControlView<'_>, out: &mut Outbox) {
        match self.sockets.get(&req.socket_id()) {
            Some(state) => {
                let n = state.retransmit(req.seq(), out);
                log::debug!(
                    "socket {}: retransmitted {} packets from seq_nr {}",
                    req.socket_id(),
                    n,
                    req.seq()
                );
            }
            None => log::debug!("retransmit for unknown socket {}", req.socket_id()),
        }
    }

    fn deliver(&mut self, sid: SocketId, packet: MulticastPacket) {
        let Some(state) = self.sockets.get_mut(&sid) else {
            log::error!("socket {} not found", sid);
            return;
        };
        match &mut state.delivery {
            Delivery::Inbox { queue, budget } => {
                if budget.try_acquire(packet.size()) {
                    queue.push(packet);
                } else {
                    log::warn!("socket {}: receive buffer full, packet dropped", sid);
                }
            }
            Delivery::Callback(cb) => cb(&packet.from, &packet.data),
            Delivery::Unbound => {
                log::error!("packet for socket {} with neither binding nor callback", sid)
            }
        }
    }

    fn on_async_recv(&mut self, msg: &Message) -> Result<()> {
        let MessageView::AsyncRecv(view) = msg.view() else {
            return Ok(());
        };
        let sid = view.socket_id();
        let Some(state) = self.sockets.get_mut(&sid) else {
            log::error!("socket {} not found", sid);
            return Ok(());
        };
        let (from, payload) = view.parts()?;
        // Callbacks see the payload in place; no copy is made.
        if let Delivery::Callback(cb) = &mut state.delivery {
            cb(&from, payload);
            return Ok(());
        }
        self.deliver(sid, MulticastPacket::new(from, payload.to_vec()));
        Ok(())
    }
}

impl ChannelHandler for ClientChannel {
    type Item = ClientCommand;

    fn handle_item(&mut self, item: ClientCommand, out: &mut Outbox) -> Result<()> {
        match item {
            ClientCommand::Send {
                socket,
                stream,
                payload,
            } => match self.sockets.get_mut(&socket) {
                Some(state) => {
                    state.admit(stream, socket, payload, self.window, out);
                }
                None => log::error!("socket {} not found", socket),
            },
            ClientCommand::Call(call) => self.handle_call(call, out),
            ClientCommand::Inject { socket, packet } => self.deliver(socket, packet),
            ClientCommand::BindSocket {
                socket,
                out_budget,
                inbox,
                in_budget,
            } => match self.sockets.get_mut(&socket) {
                Some(state) => {
                    state.set_out_budget(out_budget);
                    if !matches!(state.delivery, Delivery::Callback(_)) {
                        state.delivery = Delivery::Inbox {
                            queue: inbox,
                            budget: in_budget,
                        };
                    }
                }
                None => log::error!("binding for unknown socket {}", socket),
            },
            ClientCommand::SetReceiveCallback { socket, callback } => {
                match self.sockets.get_mut(&socket) {
                    Some(state) => state.delivery = Delivery::Callback(callback),
                    None => log::error!("callback for unknown socket {}", socket),
                }
            }
            ClientCommand::RegisterEventCallback(cb) => self.event_callbacks.push(cb),
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: Message, out: &mut Outbox) -> Result<()> {
        match msg.view() {
            MessageView::SyncResponse(resp) => self.on_sync_response(&msg, resp),
            MessageView::AsyncRecv(_) => self.on_async_recv(&msg),
            MessageView::CumulativeAck(ack) => {
                self.on_cumulative_ack(ack, out);
                Ok(())
            }
            MessageView::Retransmit(req) => {
                self.on_retransmit(req, out);
                Ok(())
            }
            MessageView::AsyncEvent(ev) => {
                let event = ev.event()?;
                log::debug!("membership event {:?} on {}", event.event_type, event.group);
                for cb in &mut self.event_callbacks {
                    cb(&event);
                }
                Ok(())
            }
            MessageView::SyncRequest(_) | MessageView::AsyncSend(_) => Err(Error::Protocol(
                format!("unexpected {:?} from middleware", msg.msg_type()),
            )),
        }
    }

    fn on_exit(&mut self, reason: Option<&Error>) {
        // Dropping the outstanding calls wakes their callers with ChannelClosed.
        self.requests.clear();
        let Some(reason) = reason.map(|e| e.to_string()) else {
            log::debug!("client channel shut down");
            return;
        };
        match &self.exit_policy {
            ExitPolicy::Abort => {
                log::error!("connection to middleware lost: {}", reason);
                std::process::abort();
            }
            ExitPolicy::Callback(hook) => {
                log::warn!("connection to middleware lost: {}", reason);
                hook(&reason);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
