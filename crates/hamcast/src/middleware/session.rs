// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One connected client, served on its own channel thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::proxy::SocketProxy;
use super::registry::InterfaceRegistry;
use crate::channel::{ChannelHandle, ChannelHandler, Outbox};
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::message::{Message, MessageView};
use crate::protocol::{ExceptionId, FunctionId, InterfaceId, MembershipEvent, SocketId};
use crate::uri::Uri;
use crate::wire::{from_bytes, to_bytes};

/// Work handed to a session's I/O thread by interface threads.
pub enum SessionItem {
    /// A packet for one of the session's sockets
    Deliver {
        socket: SocketId,
        source: Uri,
        data: Vec<u8>,
    },
    /// Every interface finished sending this `async_send`
    SendDone(Message),
    Event(MembershipEvent),
}

/// Channel handler of one client connection.
pub struct Session {
    id: u64,
    registry: Arc<InterfaceRegistry>,
    sockets: BTreeMap<SocketId, SocketProxy>,
    socket_ids: IdGenerator<SocketId>,
    handle: ChannelHandle<SessionItem>,
}

/// Text sent back with a failed call.
fn error_text(err: &Error) -> String {
    match err {
        Error::RequirementFailed(msg) | Error::InternalInterfaceError(msg) => msg.clone(),
        other => other.to_string(),
    }
}

impl Session {
    pub fn new(id: u64, registry: Arc<InterfaceRegistry>, handle: ChannelHandle<SessionItem>) -> Self {
        Self {
            id,
            registry,
            sockets: BTreeMap::new(),
            socket_ids: IdGenerator::new(),
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn socket(&mut self, sid: SocketId) -> Result<&mut SocketProxy> {
        self.sockets.get_mut(&sid).ok_or(Error::NoSuchSocket(sid))
    }

    fn dispatch(&mut self, fid: FunctionId, args: &[u8]) -> Result<Vec<u8>> {
        log::trace!("session {}: {:?}", self.id, fid);
        match fid {
            FunctionId::CreateSocket => {
                from_bytes::<()>(args)?;
                let sid = self.socket_ids.next_id();
                let proxy =
                    SocketProxy::new(sid, self.handle.clone(), self.registry.default_interface())?;
                self.sockets.insert(sid, proxy);
                log::debug!("session {}: socket {} created", self.id, sid);
                Ok(to_bytes(&sid))
            }
            FunctionId::DeleteSocket => {
                let sid: SocketId = from_bytes(args)?;
                let mut proxy = self.sockets.remove(&sid).ok_or(Error::NoSuchSocket(sid))?;
                proxy.leave_all();
                log::debug!("session {}: socket {} deleted", self.id, sid);
                Ok(to_bytes(&()))
            }
            FunctionId::CreateSendStream => {
                let (sid, group): (SocketId, Uri) = from_bytes(args)?;
                let stream = self.socket(sid)?.add_stream(group)?;
                Ok(to_bytes(&stream))
            }
            FunctionId::Join => {
                let (sid, group): (SocketId, Uri) = from_bytes(args)?;
                self.socket(sid)?.join(&group)?;
                Ok(to_bytes(&()))
            }
            FunctionId::Leave => {
                let (sid, group): (SocketId, Uri) = from_bytes(args)?;
                self.socket(sid)?.leave(&group)?;
                Ok(to_bytes(&()))
            }
            FunctionId::SetTtl => {
                let (sid, ttl): (SocketId, u8) = from_bytes(args)?;
                self.socket(sid)?.set_ttl(ttl);
                Ok(to_bytes(&()))
            }
            FunctionId::GetSockInterfaces => {
                let sid: SocketId = from_bytes(args)?;
                let ids = self.socket(sid)?.interface_ids();
                if ids.is_empty() {
                    return Err(Error::requirement(format!("socket {} has no interface", sid)));
                }
                Ok(to_bytes(&ids))
            }
            FunctionId::AddSockInterface => {
                let (sid, iid): (SocketId, InterfaceId) = from_bytes(args)?;
                let iface = self.registry.get(iid)?;
                let proxy = self.socket(sid)?;
                let mut wanted = proxy.interfaces().to_vec();
                if !wanted.iter().any(|i| i.id() == iid) {
                    wanted.push(iface);
                }
                proxy.set_interfaces(wanted)?;
                Ok(to_bytes(&()))
            }
            FunctionId::DelSockInterface => {
                let (sid, iid): (SocketId, InterfaceId) = from_bytes(args)?;
                let proxy = self.socket(sid)?;
                let wanted: Vec<_> = proxy
                    .interfaces()
                    .iter()
                    .filter(|i| i.id() != iid)
                    .cloned()
                    .collect();
                if wanted.len() == proxy.interfaces().len() {
                    return Err(Error::NoSuchInterface(iid));
                }
                proxy.set_interfaces(wanted)?;
                Ok(to_bytes(&()))
            }
            FunctionId::SetSockInterfaces => {
                let (sid, iids): (SocketId, Vec<InterfaceId>) = from_bytes(args)?;
                let wanted = iids
                    .into_iter()
                    .map(|iid| self.registry.get(iid))
                    .collect::<Result<Vec<_>>>()?;
                self.socket(sid)?.set_interfaces(wanted)?;
                Ok(to_bytes(&()))
            }
            FunctionId::GetInterfaces => {
                from_bytes::<()>(args)?;
                Ok(to_bytes(&self.registry.properties()))
            }
            FunctionId::GroupSet => {
                let iid: InterfaceId = from_bytes(args)?;
                Ok(to_bytes(&self.registry.get(iid)?.group_set()?))
            }
            FunctionId::NeighborSet => {
                let iid: InterfaceId = from_bytes(args)?;
                Ok(to_bytes(&self.registry.get(iid)?.neighbor_set()?))
            }
            FunctionId::ChildrenSet => {
                let (iid, group): (InterfaceId, Uri) = from_bytes(args)?;
                Ok(to_bytes(&self.registry.get(iid)?.children_set(&group)?))
            }
            FunctionId::ParentSet => {
                let (iid, group): (InterfaceId, Uri) = from_bytes(args)?;
                Ok(to_bytes(&self.registry.get(iid)?.parent_set(&group)?))
            }
            FunctionId::DesignatedHost => {
                let (iid, group): (InterfaceId, Uri) = from_bytes(args)?;
                Ok(to_bytes(&self.registry.get(iid)?.designated_host(&group)?))
            }
            FunctionId::EnableEvents => {
                from_bytes::<()>(args)?;
                self.registry.events().subscribe(self.id, self.handle.clone());
                Ok(to_bytes(&()))
            }
            FunctionId::DisableEvents => {
                from_bytes::<()>(args)?;
                self.registry.events().unsubscribe(self.id);
                Ok(to_bytes(&()))
            }
            FunctionId::GetAtomicMsgSize => {
                let iid: InterfaceId = from_bytes(args)?;
                Ok(to_bytes(&self.registry.get(iid)?.atomic_msg_size()))
            }
        }
    }
}

impl ChannelHandler for Session {
    type Item = SessionItem;

    fn handle_item(&mut self, item: SessionItem, out: &mut Outbox) -> Result<()> {
        match item {
            SessionItem::Deliver {
                socket,
                source,
                data,
            } => match self.sockets.get(&socket) {
                Some(proxy) => {
                    out.write(&Message::async_recv(socket, &source, &data));
                    proxy.delivered(data.len());
                }
                None => log::debug!("session {}: delivery for closed socket {}", self.id, socket),
            },
            SessionItem::SendDone(msg) => {
                if let Some(proxy) = self.sockets.get_mut(&msg.field2()) {
                    proxy.send_done(&msg, out);
                }
            }
            SessionItem::Event(event) => out.write(&Message::async_event(&event)),
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: Message, out: &mut Outbox) -> Result<()> {
        match msg.view() {
            MessageView::SyncRequest(req) => {
                let rid = req.request_id();
                let result = req
                    .function_id()
                    .map_err(|e| Error::requirement(e.to_string()))
                    .and_then(|fid| self.dispatch(fid, req.args()));
                let reply = match result {
                    Ok(content) => Message::sync_response(ExceptionId::None, rid, content),
                    Err(e) => {
                        log::debug!("session {}: request {} failed: {}", self.id, rid, e);
                        Message::sync_response(e.exception_id(), rid, to_bytes(&error_text(&e)))
                    }
                };
                out.write(&reply);
            }
            MessageView::AsyncSend(send) => match self.sockets.get_mut(&send.socket_id()) {
                Some(proxy) => proxy.handle_async_send(msg.clone(), out),
                None => log::debug!(
                    "session {}: packet for unknown socket {}",
                    self.id,
                    send.socket_id()
                ),
            },
            _ => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?} from client",
                    msg.msg_type()
                )))
            }
        }
        Ok(())
    }

    fn on_timeout(&mut self, out: &mut Outbox) -> Result<()> {
        for proxy in self.sockets.values_mut() {
            proxy.force_acks(out);
        }
        Ok(())
    }

    fn on_exit(&mut self, reason: Option<&Error>) {
        match reason {
            Some(e) => log::info!("session {} closed: {}", self.id, e),
            None => log::info!("session {} closed", self.id),
        }
        self.registry.events().unsubscribe(self.id);
        for proxy in self.sockets.values_mut() {
            proxy.leave_all();
        }
        self.sockets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageCodec, MessageType};
    use crate::middleware::loopback::LoopbackModule;
    use crate::middleware::testing::SessionSink;
    use crate::protocol::InterfaceProperty;
    use crate::wire::Wire;

    struct Fixture {
        registry: Arc<InterfaceRegistry>,
        session: Session,
        out: Outbox,
        next_rid: u32,
        _sink: SessionSink,
    }

    impl Fixture {
        fn new(interfaces: usize) -> Self {
            let registry = Arc::new(InterfaceRegistry::new());
            for i in 0..interfaces {
                registry
                    .add(Arc::new(LoopbackModule::new()), format!("lo{}", i), "127.0.0.1")
                    .unwrap();
            }
            let sink = SessionSink::start();
            let session = Session::new(registry.next_session_id(), Arc::clone(&registry), sink.handle());
            Self {
                registry,
                session,
                out: Outbox::new(),
                next_rid: 0,
                _sink: sink,
            }
        }

        fn written(&mut self) -> Vec<Message> {
            let mut codec = MessageCodec::default();
            codec.feed(&self.out.take_pending());
            let mut msgs = Vec::new();
            while let Some(msg) = codec.decode_buffered().unwrap() {
                msgs.push(msg);
            }
            msgs
        }

        fn call_raw(&mut self, fid: FunctionId, args: Vec<u8>) -> Message {
            let rid = self.next_rid;
            self.next_rid += 1;
            self.session
                .handle_message(Message::sync_request(fid, rid, args), &mut self.out)
                .unwrap();
            let mut msgs = self.written();
            assert_eq!(msgs.len(), 1);
            let reply = msgs.remove(0);
            assert_eq!(reply.msg_type(), MessageType::SyncResponse);
            assert_eq!(reply.field2(), rid);
            reply
        }

        fn call<A: Wire, R: Wire>(&mut self, fid: FunctionId, args: &A) -> R {
            let reply = self.call_raw(fid, to_bytes(args));
            assert_eq!(reply.field1(), ExceptionId::None as u16, "{:?} failed", fid);
            from_bytes(reply.content()).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.registry.shutdown_all();
        }
    }

    #[test]
    fn test_socket_lifecycle() {
        let mut fx = Fixture::new(1);
        let a: SocketId = fx.call(FunctionId::CreateSocket, &());
        let b: SocketId = fx.call(FunctionId::CreateSocket, &());
        assert_ne!(a, b);

        let ifaces: Vec<InterfaceId> = fx.call(FunctionId::GetSockInterfaces, &a);
        assert_eq!(ifaces, vec![1]);

        let () = fx.call(FunctionId::DeleteSocket, &a);
        let reply = fx.call_raw(FunctionId::DeleteSocket, to_bytes(&a));
        assert_eq!(reply.field1(), ExceptionId::RequirementFailed as u16);
        let text: String = from_bytes(reply.content()).unwrap();
        assert_eq!(text, format!("No such socket (socket id = {})", a));
    }

    #[test]
    fn test_create_socket_without_interfaces_fails() {
        let mut fx = Fixture::new(0);
        let reply = fx.call_raw(FunctionId::CreateSocket, to_bytes(&()));
        assert_eq!(reply.field1(), ExceptionId::RequirementFailed as u16);
    }

    #[test]
    fn test_interface_queries() {
        let mut fx = Fixture::new(2);
        let props: Vec<InterfaceProperty> = fx.call(FunctionId::GetInterfaces, &());
        assert_eq!(props.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2]);

        let size: u32 = fx.call(FunctionId::GetAtomicMsgSize, &2u32);
        assert_eq!(size, crate::config::DEFAULT_MAX_MSG_SIZE);
        let host: bool = fx.call(FunctionId::DesignatedHost, &(1u32, Uri::from("ip://g")));
        assert!(!host);
        let neighbors: Vec<Uri> = fx.call(FunctionId::NeighborSet, &1u32);
        assert!(neighbors.is_empty());

        let reply = fx.call_raw(FunctionId::GroupSet, to_bytes(&9u32));
        assert_eq!(reply.field1(), ExceptionId::RequirementFailed as u16);
    }

    #[test]
    fn test_socket_interface_editing() {
        let mut fx = Fixture::new(2);
        let sid: SocketId = fx.call(FunctionId::CreateSocket, &());

        let () = fx.call(FunctionId::AddSockInterface, &(sid, 2u32));
        let ifaces: Vec<InterfaceId> = fx.call(FunctionId::GetSockInterfaces, &sid);
        assert_eq!(ifaces, vec![1, 2]);

        let () = fx.call(FunctionId::DelSockInterface, &(sid, 1u32));
        let ifaces: Vec<InterfaceId> = fx.call(FunctionId::GetSockInterfaces, &sid);
        assert_eq!(ifaces, vec![2]);

        let () = fx.call(FunctionId::SetSockInterfaces, &(sid, Vec::<InterfaceId>::new()));
        let reply = fx.call_raw(FunctionId::GetSockInterfaces, to_bytes(&sid));
        assert_eq!(reply.field1(), ExceptionId::RequirementFailed as u16);
        let reply = fx.call_raw(FunctionId::Join, to_bytes(&(sid, Uri::from("ip://g"))));
        assert_eq!(reply.field1(), ExceptionId::RequirementFailed as u16);
    }

    #[test]
    fn test_unknown_function_is_reported() {
        let mut fx = Fixture::new(1);
        fx.session
            .handle_message(
                Message::new(MessageType::SyncRequest, 0x7777, 42, 0, Vec::new()),
                &mut fx.out,
            )
            .unwrap();
        let reply = fx.written().remove(0);
        assert_eq!(reply.field2(), 42);
        assert_eq!(reply.field1(), ExceptionId::RequirementFailed as u16);
    }

    #[test]
    fn test_delivery_becomes_async_recv() {
        let mut fx = Fixture::new(1);
        let sid: SocketId = fx.call(FunctionId::CreateSocket, &());
        fx.session
            .handle_item(
                SessionItem::Deliver {
                    socket: sid,
                    source: Uri::from("ip://g"),
                    data: b"abc".to_vec(),
                },
                &mut fx.out,
            )
            .unwrap();
        let msg = fx.written().remove(0);
        let MessageView::AsyncRecv(recv) = msg.view() else {
            panic!("expected async_recv");
        };
        assert_eq!(recv.socket_id(), sid);
        let (source, payload) = recv.parts().unwrap();
        assert_eq!(source, Uri::from("ip://g"));
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_client_may_not_send_acks() {
        let mut fx = Fixture::new(1);
        let err = fx
            .session
            .handle_message(Message::cumulative_ack(0, 0, 0), &mut fx.out)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_exit_releases_memberships() {
        let mut fx = Fixture::new(1);
        let sid: SocketId = fx.call(FunctionId::CreateSocket, &());
        let () = fx.call(FunctionId::Join, &(sid, Uri::from("ip://g")));
        let () = fx.call(FunctionId::EnableEvents, &());
        assert!(fx.registry.events().is_subscribed(fx.session.id()));
        assert_eq!(fx.registry.get(1).unwrap().local_groups().len(), 1);

        fx.session.on_exit(None);
        assert!(fx.registry.get(1).unwrap().local_groups().is_empty());
        assert!(!fx.registry.events().is_subscribed(fx.session.id()));
    }
}
