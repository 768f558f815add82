// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IPC protocol vocabulary: id spaces, RPC catalogue, shared records.

pub mod handshake;

use crate::error::{Error, Result};
use crate::uri::Uri;
use crate::wire::{Wire, WireReader, WireWriter};

pub use handshake::{client_handshake, server_handshake, HandshakeReply, HandshakeRequest};

/// Identifies one client socket within a session.
pub type SocketId = u32;

/// Identifies one destination group of a socket.
pub type StreamId = u16;

/// Per-socket packet sequence number.
pub type SequenceNumber = u32;

/// Correlates a `sync_request` with its `sync_response`.
pub type RequestId = u32;

/// Identifies one technology interface of the middleware.
pub type InterfaceId = u32;

// ============================================================================
// RPC catalogue
// ============================================================================

/// Synchronous operations a client may invoke on the middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FunctionId {
    /// `() -> SocketId`
    CreateSocket = 0x0001,
    /// `(SocketId) -> ()`
    DeleteSocket = 0x0002,
    /// `(SocketId, Uri) -> StreamId`
    CreateSendStream = 0x0003,
    /// `(SocketId, Uri) -> ()`
    Join = 0x0004,
    /// `(SocketId, Uri) -> ()`
    Leave = 0x0005,
    /// `(SocketId, u8) -> ()`
    SetTtl = 0x0006,
    /// `(SocketId) -> Vec<InterfaceId>`
    GetSockInterfaces = 0x0007,
    /// `(SocketId, InterfaceId) -> ()`
    AddSockInterface = 0x0008,
    /// `(SocketId, InterfaceId) -> ()`
    DelSockInterface = 0x0009,
    /// `(SocketId, Vec<InterfaceId>) -> ()`
    SetSockInterfaces = 0x000A,
    /// `() -> Vec<InterfaceProperty>`
    GetInterfaces = 0x0100,
    /// `(InterfaceId) -> Vec<(Uri, u32)>`
    GroupSet = 0x0101,
    /// `(InterfaceId) -> Vec<Uri>`
    NeighborSet = 0x0102,
    /// `(InterfaceId, Uri) -> Vec<Uri>`
    ChildrenSet = 0x0103,
    /// `(InterfaceId, Uri) -> Vec<Uri>`
    ParentSet = 0x0104,
    /// `(InterfaceId, Uri) -> bool`
    DesignatedHost = 0x0105,
    /// `() -> ()`
    EnableEvents = 0x0200,
    /// `() -> ()`
    DisableEvents = 0x0201,
    /// `(InterfaceId) -> u32`
    GetAtomicMsgSize = 0x0202,
}

impl FunctionId {
    pub const ALL: [FunctionId; 19] = [
        Self::CreateSocket,
        Self::DeleteSocket,
        Self::CreateSendStream,
        Self::Join,
        Self::Leave,
        Self::SetTtl,
        Self::GetSockInterfaces,
        Self::AddSockInterface,
        Self::DelSockInterface,
        Self::SetSockInterfaces,
        Self::GetInterfaces,
        Self::GroupSet,
        Self::NeighborSet,
        Self::ChildrenSet,
        Self::ParentSet,
        Self::DesignatedHost,
        Self::EnableEvents,
        Self::DisableEvents,
        Self::GetAtomicMsgSize,
    ];
}

impl TryFrom<u16> for FunctionId {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| *f as u16 == raw)
            .ok_or_else(|| Error::Protocol(format!("unknown function id {:#06x}", raw)))
    }
}

/// Outcome class carried in field1 of a `sync_response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ExceptionId {
    None = 0,
    RequirementFailed = 1,
    InternalInterfaceError = 2,
}

impl TryFrom<u16> for ExceptionId {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::RequirementFailed),
            2 => Ok(Self::InternalInterfaceError),
            other => Err(Error::Protocol(format!("unknown exception id {}", other))),
        }
    }
}

// ============================================================================
// Membership events
// ============================================================================

/// Kind of a membership change reported by a technology interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MembershipEventType {
    /// A host joined the group
    Join = 1,
    /// A host left the group
    Leave = 2,
    /// A new source started sending to the group
    NewSource = 3,
}

impl TryFrom<u16> for MembershipEventType {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            1 => Ok(Self::Join),
            2 => Ok(Self::Leave),
            3 => Ok(Self::NewSource),
            other => Err(Error::Protocol(format!("invalid membership event type {}", other))),
        }
    }
}

/// A membership change on one group of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    pub group: Uri,
    pub iface_id: InterfaceId,
    pub event_type: MembershipEventType,
}

impl MembershipEvent {
    pub fn new(group: Uri, iface_id: InterfaceId, event_type: MembershipEventType) -> Self {
        Self {
            group,
            iface_id,
            event_type,
        }
    }
}

// ============================================================================
// Shared records
// ============================================================================

/// Description of one technology interface, as listed by `get_interfaces`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceProperty {
    pub id: InterfaceId,
    pub name: String,
    pub address: String,
    pub technology: String,
}

impl Wire for InterfaceProperty {
    fn encode(&self, w: &mut WireWriter) {
        w.write_u32(self.id);
        w.write_str(&self.name);
        w.write_str(&self.address);
        w.write_str(&self.technology);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.read_u32()?,
            name: r.read_string()?,
            address: r.read_string()?,
            technology: r.read_string()?,
        })
    }
}

/// A received multicast datagram together with the group it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastPacket {
    pub from: Uri,
    pub data: Vec<u8>,
}

impl MulticastPacket {
    pub fn new(from: Uri, data: Vec<u8>) -> Self {
        Self { from, data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Wire for MulticastPacket {
    fn encode(&self, w: &mut WireWriter) {
        self.from.encode(w);
        w.write_bytes(&self.data);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let from = Uri::decode(r)?;
        let data = r.read_bytes()?.to_vec();
        Ok(Self { from, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{from_bytes, to_bytes};

    #[test]
    fn test_function_id_values() {
        assert_eq!(FunctionId::CreateSocket as u16, 0x1);
        assert_eq!(FunctionId::SetSockInterfaces as u16, 0xA);
        assert_eq!(FunctionId::GetInterfaces as u16, 0x100);
        assert_eq!(FunctionId::DesignatedHost as u16, 0x105);
        assert_eq!(FunctionId::GetAtomicMsgSize as u16, 0x202);
        for fid in FunctionId::ALL {
            assert_eq!(FunctionId::try_from(fid as u16).unwrap(), fid);
        }
        assert!(FunctionId::try_from(0x0B).is_err());
    }

    #[test]
    fn test_event_type_validation() {
        assert_eq!(MembershipEventType::try_from(3).unwrap(), MembershipEventType::NewSource);
        assert!(MembershipEventType::try_from(0).is_err());
        assert!(MembershipEventType::try_from(4).is_err());
    }

    #[test]
    fn test_interface_property_layout() {
        let prop = InterfaceProperty {
            id: 1,
            name: "lo".into(),
            address: "127.0.0.1".into(),
            technology: "loopback".into(),
        };
        let bytes = to_bytes(&prop);
        assert_eq!(bytes.len(), 4 + (4 + 2) + (4 + 9) + (4 + 8));
        assert_eq!(from_bytes::<InterfaceProperty>(&bytes).unwrap(), prop);
    }

    #[test]
    fn test_multicast_packet_layout() {
        let packet = MulticastPacket::new(Uri::from("ip://g"), b"xyz".to_vec());
        let bytes = to_bytes(&packet);
        assert_eq!(&bytes[10..14], &3u32.to_ne_bytes());
        assert_eq!(&bytes[14..], b"xyz");
    }
}
