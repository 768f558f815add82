// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HAMcast - host-group multicast middleware
//!
//! Applications join, leave and send to multicast groups through a small
//! client stub. Every operation travels over one local connection to a
//! middleware process, which fans traffic out across pluggable network
//! technologies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hamcast::{Client, ClientConfig, Result, Uri};
//!
//! fn main() -> Result<()> {
//!     // Endpoint comes from the middleware's discovery file
//!     let client = Client::connect(ClientConfig::default())?;
//!
//!     let socket = client.create_socket()?;
//!     let group = Uri::from("ip://239.0.0.1:1234");
//!     socket.join(&group)?;
//!     socket.send(&group, b"hello")?;
//!
//!     let packet = socket.receive()?;
//!     println!("{} bytes from {}", packet.size(), packet.from);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------+                 +-----------------------------+
//! |  application threads   |                 |        middleware           |
//! |  Client / Socket API   |                 |  Session (one per client)   |
//! +-----------+------------+                 |   SocketProxy per socket    |
//!             | single-reader queue          +--------------+--------------+
//! +-----------v------------+   IPC channel   |  TechInterface workers      |
//! |  client I/O thread     |<===============>|  TechnologyModule impls     |
//! |  sliding window, RPC   |  16-byte header |  (loopback built in)        |
//! +------------------------+                 +-----------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Connection to a middleware, factory for sockets |
//! | [`MulticastSocket`] | Join, leave, send and receive on groups |
//! | [`Middleware`] | In-process middleware: listener, sessions, interfaces |
//! | [`TechnologyModule`] | Trait implemented by network technologies |
//! | [`Message`] | Immutable wire message shared by reference count |

/// Client stub: connection, sockets and the client I/O thread.
pub mod client;
/// Protocol constants and tunables.
pub mod config;
/// Event loop multiplexing a transport with a wakeup pipe.
pub mod channel;
/// Discovery file in the meeting-point directory.
pub mod discovery;
pub mod error;
pub mod ids;
/// Wire messages, typed views and the incremental codec.
pub mod message;
/// Middleware: sessions, socket proxies and technology interfaces.
pub mod middleware;
/// RPC catalogue, shared records and the handshake.
pub mod protocol;
/// Lock-free single-reader work queue.
pub mod queue;
/// Byte-budget semaphores for flow control.
pub mod semaphore;
pub mod uri;
/// Host-order serialization of call arguments and results.
pub mod wire;

pub use client::{Client, ClientConfig, ExitPolicy, MulticastSocket, SocketState};
pub use error::{Error, Result};
pub use message::{Message, MessageType, MessageView};
pub use middleware::{
    InterfaceRegistry, LoopbackModule, Middleware, MiddlewareConfig, ModuleContext,
    TechnologyModule,
};
pub use protocol::{
    FunctionId, InterfaceId, InterfaceProperty, MembershipEvent, MembershipEventType,
    MulticastPacket, SocketId,
};
pub use uri::Uri;
