// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client stub: the application-facing half of HAMcast.
//!
//! A [`Client`] owns one connection to the middleware and the I/O thread
//! driving it. Every operation is either a synchronous RPC (the caller
//! blocks on a one-shot reply) or an asynchronous packet handed to the
//! I/O thread's sliding-window sender.
//!
//! ```rust,no_run
//! use hamcast::{Client, ClientConfig, Uri};
//!
//! # fn main() -> hamcast::Result<()> {
//! let client = Client::connect(ClientConfig::default())?;
//! let socket = client.create_socket()?;
//! let group = Uri::from("ip://239.1.2.3:1234");
//! socket.join(&group)?;
//! socket.send(&group, b"hello")?;
//! let packet = socket.receive()?;
//! println!("{} bytes from {}", packet.size(), packet.from);
//! # Ok(())
//! # }
//! ```

pub mod config;

pub(crate) mod channel;
pub(crate) mod state;

mod socket;

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::bounded;
use parking_lot::Mutex;

use crate::channel::{tcp_transport, Channel, ChannelHandle, Transport};
use crate::discovery::DiscoveryFile;
use crate::error::{Error, Result};
use crate::message::MessageView;
use crate::protocol::{
    client_handshake, ExceptionId, FunctionId, InterfaceId, InterfaceProperty, MembershipEvent,
};
use crate::uri::Uri;
use crate::wire::{from_bytes, to_bytes, Wire};

use self::channel::{ClientChannel, ClientCommand, SyncCall};

pub use config::{ClientConfig, ExitPolicy};
pub use socket::MulticastSocket;
pub use state::SocketState;

/// Callback for packets of one socket, run on the I/O thread. The payload
/// slice is only valid during the call.
pub type ReceiveCallback = Box<dyn FnMut(&Uri, &[u8]) + Send>;

/// Callback for membership events, run on the I/O thread.
pub type EventCallback = Box<dyn FnMut(&MembershipEvent) + Send>;

struct ClientInner {
    handle: ChannelHandle<ClientCommand>,
    max_msg_size: u32,
    receive_budget: usize,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// Connection to a middleware; cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to the middleware and start the I/O thread.
    ///
    /// Without an explicit endpoint the port is taken from the discovery
    /// file in the configured meeting point.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let endpoint = match config.endpoint {
            Some(addr) => addr,
            None => {
                let record = DiscoveryFile::read(&config.meeting_point)?;
                SocketAddr::from(([127, 0, 0, 1], record.port))
            }
        };
        log::debug!("connecting to middleware at {}", endpoint);

        let mut stream = TcpStream::connect_timeout(&endpoint, config.connect_timeout)
            .map_err(Error::from_io_deadline)?;
        stream.set_read_timeout(Some(config.connect_timeout))?;
        let max_msg_size = client_handshake(&mut stream)?;
        stream.set_read_timeout(None)?;

        Self::start(tcp_transport(stream)?, max_msg_size, &config)
    }

    fn start<T: Transport>(transport: T, max_msg_size: u32, config: &ClientConfig) -> Result<Self> {
        let (channel, handle) = Channel::new(transport, None, |_| {
            ClientChannel::new(config.send_window, config.exit_policy.clone())
        })?;
        let io_thread = channel.spawn("hamcast-client-io")?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                handle,
                max_msg_size,
                receive_budget: config.receive_budget,
                io_thread: Mutex::new(Some(io_thread)),
            }),
        })
    }

    /// Largest payload a single `send` accepts.
    pub fn max_msg_size(&self) -> u32 {
        self.inner.max_msg_size
    }

    /// Check whether the I/O thread is still running.
    pub fn is_connected(&self) -> bool {
        self.inner.handle.is_running()
    }

    /// Stop the I/O thread and wait for it.
    pub fn shutdown(&self) {
        self.inner.handle.shutdown();
        if let Some(join) = self.inner.io_thread.lock().take() {
            let _ = join.join();
        }
    }

    pub(crate) fn push(&self, cmd: ClientCommand) -> Result<()> {
        self.inner.handle.push(cmd)
    }

    /// Issue a synchronous call and wait for the raw result bytes.
    pub(crate) fn call(&self, fid: FunctionId, args: Vec<u8>) -> Result<Vec<u8>> {
        let (tx, rx) = bounded(1);
        self.push(ClientCommand::Call(SyncCall::new(fid, args, tx)))?;
        let msg = rx.recv().map_err(|_| Error::ChannelClosed)?;

        let MessageView::SyncResponse(resp) = msg.view() else {
            return Err(Error::Protocol(format!("{:?} answered with {:?}", fid, msg.msg_type())));
        };
        match resp.exception_id()? {
            ExceptionId::None => Ok(resp.content().to_vec()),
            id => {
                let text = from_bytes::<String>(resp.content())
                    .unwrap_or_else(|_| String::from_utf8_lossy(resp.content()).into_owned());
                Err(Error::from_exception(id, text).unwrap_or(Error::ChannelClosed))
            }
        }
    }

    pub(crate) fn call_typed<A: Wire, R: Wire>(&self, fid: FunctionId, args: &A) -> Result<R> {
        from_bytes(&self.call(fid, to_bytes(args))?)
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Create a socket bound to the middleware's default interface.
    pub fn create_socket(&self) -> Result<MulticastSocket> {
        let sid: u32 = self.call_typed(FunctionId::CreateSocket, &())?;
        MulticastSocket::bind(self.clone(), sid, self.inner.receive_budget)
    }

    /// All technology interfaces of the middleware.
    pub fn get_interfaces(&self) -> Result<Vec<InterfaceProperty>> {
        self.call_typed(FunctionId::GetInterfaces, &())
    }

    /// Groups known on `iface` with their member counts.
    pub fn group_set(&self, iface: InterfaceId) -> Result<Vec<(Uri, u32)>> {
        self.call_typed(FunctionId::GroupSet, &iface)
    }

    pub fn neighbor_set(&self, iface: InterfaceId) -> Result<Vec<Uri>> {
        self.call_typed(FunctionId::NeighborSet, &iface)
    }

    pub fn children_set(&self, iface: InterfaceId, group: &Uri) -> Result<Vec<Uri>> {
        self.call_typed(FunctionId::ChildrenSet, &(iface, group.clone()))
    }

    pub fn parent_set(&self, iface: InterfaceId, group: &Uri) -> Result<Vec<Uri>> {
        self.call_typed(FunctionId::ParentSet, &(iface, group.clone()))
    }

    /// Check whether this host serves `group` on `iface`.
    pub fn designated_host(&self, iface: InterfaceId, group: &Uri) -> Result<bool> {
        self.call_typed(FunctionId::DesignatedHost, &(iface, group.clone()))
    }

    /// Largest payload `iface` sends without fragmentation.
    pub fn atomic_msg_size(&self, iface: InterfaceId) -> Result<u32> {
        self.call_typed(FunctionId::GetAtomicMsgSize, &iface)
    }

    /// Subscribe this client to membership events.
    pub fn enable_events(&self) -> Result<()> {
        self.call_typed(FunctionId::EnableEvents, &())
    }

    pub fn disable_events(&self) -> Result<()> {
        self.call_typed(FunctionId::DisableEvents, &())
    }

    /// Add a membership event listener. Listeners run in registration
    /// order on the I/O thread and must not block.
    pub fn register_event_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&MembershipEvent) + Send + 'static,
    {
        self.push(ClientCommand::RegisterEventCallback(Box::new(callback)))
    }
}
