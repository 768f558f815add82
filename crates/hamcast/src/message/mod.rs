// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IPC wire messages.
//!
//! Every message on the client/middleware link has the same shape:
//!
//! ```text
//! +------------+-------------+-------------+-------------+------------------+---------+
//! | type (u16) | field1 (u16)| field2 (u32)| field3 (u32)| content_size(u32)| content |
//! +------------+-------------+-------------+-------------+------------------+---------+
//! ```
//!
//! The meaning of `field1..field3` depends on the type; the typed views
//! returned by [`Message::view`] project them without copying.
//!
//! | type | field1 | field2 | field3 | content |
//! |------|--------|--------|--------|---------|
//! | sync_request | function id | request id | - | arguments |
//! | sync_response | exception id | request id | - | result / error text |
//! | async_event | event type | interface id | - | group |
//! | async_send | stream id | socket id | sequence nr | payload |
//! | async_recv | - | socket id | - | source + payload |
//! | cumulative_ack | stream id | socket id | acked seq nr | - |
//! | retransmit | stream id | socket id | first seq nr | - |

pub mod codec;

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{
    ExceptionId, FunctionId, InterfaceId, MembershipEvent, MembershipEventType, RequestId,
    SequenceNumber, SocketId, StreamId,
};
use crate::uri::Uri;
use crate::wire::{Wire, WireReader, WireWriter};

pub use codec::MessageCodec;

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Discriminant of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    SyncRequest = 0,
    SyncResponse = 1,
    AsyncEvent = 2,
    AsyncSend = 3,
    AsyncRecv = 4,
    CumulativeAck = 5,
    Retransmit = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => Self::SyncRequest,
            1 => Self::SyncResponse,
            2 => Self::AsyncEvent,
            3 => Self::AsyncSend,
            4 => Self::AsyncRecv,
            5 => Self::CumulativeAck,
            6 => Self::Retransmit,
            other => return Err(Error::Protocol(format!("unknown message type {}", other))),
        })
    }
}

struct Inner {
    msg_type: MessageType,
    field1: u16,
    field2: u32,
    field3: u32,
    content: Box<[u8]>,
}

/// An immutable, shared wire message.
///
/// Cloning is cheap (one atomic increment); the content buffer is freed
/// with the last clone.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Inner>,
}

impl Message {
    /// Build a message owning `content`.
    pub fn new(
        msg_type: MessageType,
        field1: u16,
        field2: u32,
        field3: u32,
        content: Vec<u8>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                msg_type,
                field1,
                field2,
                field3,
                content: content.into_boxed_slice(),
            }),
        }
    }

    /// Build a message from a declared size and an optional buffer.
    ///
    /// A buffer must be present exactly when `content_size > 0`, and its
    /// length must match.
    pub fn from_parts(
        msg_type: MessageType,
        field1: u16,
        field2: u32,
        field3: u32,
        content_size: u32,
        content: Option<Vec<u8>>,
    ) -> Result<Self> {
        match content {
            None if content_size == 0 => Ok(Self::new(msg_type, field1, field2, field3, Vec::new())),
            Some(buf) if content_size > 0 && buf.len() == content_size as usize => {
                Ok(Self::new(msg_type, field1, field2, field3, buf))
            }
            Some(buf) => Err(Error::InvalidArgument(format!(
                "content of {} bytes does not match content_size {}",
                buf.len(),
                content_size
            ))),
            None => Err(Error::InvalidArgument(format!(
                "content_size {} without content",
                content_size
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Typed constructors
    // ------------------------------------------------------------------------

    pub fn sync_request(fid: FunctionId, request_id: RequestId, args: Vec<u8>) -> Self {
        Self::new(MessageType::SyncRequest, fid as u16, request_id, 0, args)
    }

    pub fn sync_response(exception: ExceptionId, request_id: RequestId, content: Vec<u8>) -> Self {
        Self::new(MessageType::SyncResponse, exception as u16, request_id, 0, content)
    }

    pub fn async_send(
        stream: StreamId,
        socket: SocketId,
        seq: SequenceNumber,
        payload: Vec<u8>,
    ) -> Self {
        Self::new(MessageType::AsyncSend, stream, socket, seq, payload)
    }

    /// Packet delivery: content is the source URI followed by the
    /// length-prefixed payload.
    pub fn async_recv(socket: SocketId, source: &Uri, payload: &[u8]) -> Self {
        let mut w = WireWriter::with_capacity(8 + source.as_str().len() + payload.len());
        source.encode(&mut w);
        w.write_bytes(payload);
        Self::new(MessageType::AsyncRecv, 0, socket, 0, w.into_inner())
    }

    pub fn cumulative_ack(stream: StreamId, socket: SocketId, seq: SequenceNumber) -> Self {
        Self::new(MessageType::CumulativeAck, stream, socket, seq, Vec::new())
    }

    pub fn retransmit(stream: StreamId, socket: SocketId, seq: SequenceNumber) -> Self {
        Self::new(MessageType::Retransmit, stream, socket, seq, Vec::new())
    }

    pub fn async_event(event: &MembershipEvent) -> Self {
        let mut w = WireWriter::new();
        event.group.encode(&mut w);
        Self::new(
            MessageType::AsyncEvent,
            event.event_type as u16,
            event.iface_id,
            0,
            w.into_inner(),
        )
    }

    // ------------------------------------------------------------------------
    // Raw accessors
    // ------------------------------------------------------------------------

    pub fn msg_type(&self) -> MessageType {
        self.inner.msg_type
    }

    pub fn field1(&self) -> u16 {
        self.inner.field1
    }

    pub fn field2(&self) -> u32 {
        self.inner.field2
    }

    pub fn field3(&self) -> u32 {
        self.inner.field3
    }

    pub fn content(&self) -> &[u8] {
        &self.inner.content
    }

    pub fn content_size(&self) -> usize {
        self.inner.content.len()
    }

    /// Number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.content_size()
    }

    /// Append the wire encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&(self.inner.msg_type as u16).to_ne_bytes());
        buf.extend_from_slice(&self.inner.field1.to_ne_bytes());
        buf.extend_from_slice(&self.inner.field2.to_ne_bytes());
        buf.extend_from_slice(&self.inner.field3.to_ne_bytes());
        buf.extend_from_slice(&(self.content_size() as u32).to_ne_bytes());
        buf.extend_from_slice(&self.inner.content);
    }

    /// Typed projection of this message.
    pub fn view(&self) -> MessageView<'_> {
        match self.inner.msg_type {
            MessageType::SyncRequest => MessageView::SyncRequest(SyncRequestView(self)),
            MessageType::SyncResponse => MessageView::SyncResponse(SyncResponseView(self)),
            MessageType::AsyncEvent => MessageView::AsyncEvent(AsyncEventView(self)),
            MessageType::AsyncSend => MessageView::AsyncSend(AsyncSendView(self)),
            MessageType::AsyncRecv => MessageView::AsyncRecv(AsyncRecvView(self)),
            MessageType::CumulativeAck => MessageView::CumulativeAck(StreamControlView(self)),
            MessageType::Retransmit => MessageView::Retransmit(StreamControlView(self)),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.msg_type == other.inner.msg_type
                && self.inner.field1 == other.inner.field1
                && self.inner.field2 == other.inner.field2
                && self.inner.field3 == other.inner.field3
                && self.inner.content == other.inner.content)
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.inner.msg_type)
            .field("field1", &self.inner.field1)
            .field("field2", &self.inner.field2)
            .field("field3", &self.inner.field3)
            .field("content_size", &self.inner.content.len())
            .finish()
    }
}

// ============================================================================
// Views
// ============================================================================

/// A message seen through the accessor set of its type.
#[derive(Debug, Clone, Copy)]
pub enum MessageView<'a> {
    SyncRequest(SyncRequestView<'a>),
    SyncResponse(SyncResponseView<'a>),
    AsyncEvent(AsyncEventView<'a>),
    AsyncSend(AsyncSendView<'a>),
    AsyncRecv(AsyncRecvView<'a>),
    CumulativeAck(StreamControlView<'a>),
    Retransmit(StreamControlView<'a>),
}

#[derive(Debug, Clone, Copy)]
pub struct SyncRequestView<'a>(&'a Message);

impl<'a> SyncRequestView<'a> {
    pub fn function_id(&self) -> Result<FunctionId> {
        FunctionId::try_from(self.0.field1())
    }

    pub fn request_id(&self) -> RequestId {
        self.0.field2()
    }

    pub fn args(&self) -> &'a [u8] {
        self.0.content()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncResponseView<'a>(&'a Message);

impl<'a> SyncResponseView<'a> {
    pub fn exception_id(&self) -> Result<ExceptionId> {
        ExceptionId::try_from(self.0.field1())
    }

    pub fn request_id(&self) -> RequestId {
        self.0.field2()
    }

    pub fn content(&self) -> &'a [u8] {
        self.0.content()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AsyncEventView<'a>(&'a Message);

impl<'a> AsyncEventView<'a> {
    pub fn event_type(&self) -> Result<MembershipEventType> {
        MembershipEventType::try_from(self.0.field1())
    }

    pub fn iface_id(&self) -> InterfaceId {
        self.0.field2()
    }

    /// Decode the full event, rejecting unknown types and empty groups.
    pub fn event(&self) -> Result<MembershipEvent> {
        let event_type = self.event_type()?;
        let group: Uri = crate::wire::from_bytes(self.0.content())?;
        if group.is_empty() {
            return Err(Error::Protocol("membership event without group".into()));
        }
        Ok(MembershipEvent::new(group, self.iface_id(), event_type))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AsyncSendView<'a>(&'a Message);

impl<'a> AsyncSendView<'a> {
    pub fn stream_id(&self) -> StreamId {
        self.0.field1()
    }

    pub fn socket_id(&self) -> SocketId {
        self.0.field2()
    }

    pub fn seq(&self) -> SequenceNumber {
        self.0.field3()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.0.content()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AsyncRecvView<'a>(&'a Message);

impl<'a> AsyncRecvView<'a> {
    pub fn socket_id(&self) -> SocketId {
        self.0.field2()
    }

    /// Split the content into source URI and a borrowed payload.
    pub fn parts(&self) -> Result<(Uri, &'a [u8])> {
        let mut r = WireReader::new(self.0.content());
        let source = Uri::decode(&mut r)?;
        let payload = r.read_bytes()?;
        Ok((source, payload))
    }
}

/// View shared by `cumulative_ack` and `retransmit`.
#[derive(Debug, Clone, Copy)]
pub struct StreamControlView<'a>(&'a Message);

impl StreamControlView<'_> {
    pub fn stream_id(&self) -> StreamId {
        self.0.field1()
    }

    pub fn socket_id(&self) -> SocketId {
        self.0.field2()
    }

    /// Highest acknowledged sequence number (ACK) or first one to resend.
    pub fn seq(&self) -> SequenceNumber {
        self.0.field3()
    }
}
