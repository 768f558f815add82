// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Middleware side: accepts client connections and serves each one on a
//! session channel.
//!
//! # Architecture
//!
//! ```text
//!                 +-------------------+
//!  clients ------>| acceptor (mio)    |-- handshake --> session thread 1..N
//!                 +-------------------+                  |  SocketProxy per socket
//!                                                        v
//!                               InterfaceRegistry: TechInterface 1..M (worker each)
//! ```
//!
//! Each session owns its socket proxies and talks to the shared
//! technology interfaces; interfaces reach back into sessions only
//! through channel handles.

pub mod config;
pub mod loopback;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod tech;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::channel::{tcp_transport, Channel, ChannelHandle};
use crate::config::{FORCE_ACK_INTERVAL, MAX_EVENTS};
use crate::discovery::DiscoveryFile;
use crate::error::{Error, Result};
use crate::protocol::server_handshake;

pub use config::MiddlewareConfig;
pub use loopback::LoopbackModule;
pub use registry::{EventHub, InterfaceRegistry};
pub use session::{Session, SessionItem};
pub use tech::{ModuleContext, TechInterface, TechnologyModule};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Bound on the handshake exchange of a fresh connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type SessionTable = Arc<Mutex<HashMap<u64, ChannelHandle<SessionItem>>>>;

/// State shared by the acceptor and the session threads.
struct Shared {
    registry: Arc<InterfaceRegistry>,
    running: AtomicBool,
    sessions: SessionTable,
    session_threads: Mutex<Vec<JoinHandle<()>>>,
    max_msg_size: u32,
    max_write_buffer_size: usize,
}

/// A running middleware instance.
pub struct Middleware {
    local_addr: SocketAddr,
    meeting_point: PathBuf,
    shared: Arc<Shared>,
    waker: Waker,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Middleware {
    /// Start the configured interfaces, listen, and publish the
    /// discovery file.
    pub fn bind(config: MiddlewareConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let registry = Arc::new(InterfaceRegistry::new());
        for name in &config.loopback_interfaces {
            let module = LoopbackModule::new().with_atomic_msg_size(config.max_msg_size);
            registry.add(Arc::new(module), name.as_str(), config.bind.to_string())?;
        }
        Self::bind_with_registry(config, registry)
    }

    /// Like [`bind`](Self::bind), with interfaces the caller set up.
    /// `loopback_interfaces` of `config` is ignored.
    pub fn bind_with_registry(config: MiddlewareConfig, registry: Arc<InterfaceRegistry>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.listen_addr())?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let local_addr = listener.local_addr()?;

        let path = DiscoveryFile::for_current_process(local_addr.port()).write(&config.meeting_point)?;
        log::info!("middleware listening on {} ({})", local_addr, path.display());

        let shared = Arc::new(Shared {
            registry,
            running: AtomicBool::new(true),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            session_threads: Mutex::new(Vec::new()),
            max_msg_size: config.max_msg_size,
            max_write_buffer_size: config.max_write_buffer_size,
        });

        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("hamcast-accept".to_string())
                .spawn(move || accept_loop(poll, listener, shared))?
        };

        Ok(Self {
            local_addr,
            meeting_point: config.meeting_point,
            shared,
            waker,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<InterfaceRegistry> {
        &self.shared.registry
    }

    /// Number of clients currently connected.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    /// Stop accepting, end every session, stop the interfaces and remove
    /// the discovery file. Idempotent.
    pub fn shutdown(&self) {
        let Some(acceptor) = self.acceptor.lock().take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            log::error!("failed to wake acceptor: {}", e);
        }
        if acceptor.join().is_err() {
            log::error!("acceptor thread panicked");
        }

        for handle in self.shared.sessions.lock().values() {
            handle.shutdown();
        }
        let threads = std::mem::take(&mut *self.shared.session_threads.lock());
        for t in threads {
            let _ = t.join();
        }

        self.shared.registry.shutdown_all();
        if let Err(e) = DiscoveryFile::remove(&self.meeting_point) {
            log::warn!("could not remove discovery file: {}", e);
        }
        log::info!("middleware on {} stopped", self.local_addr);
    }
}

impl Drop for Middleware {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(mut poll: Poll, listener: TcpListener, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(MAX_EVENTS);
    while shared.running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::error!("acceptor poll failed: {}", e);
                break;
            }
            continue;
        }
        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_pending(&listener, &shared);
            }
        }
    }
    log::debug!("acceptor stopped");
}

fn accept_pending(listener: &TcpListener, shared: &Arc<Shared>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("connection from {}", peer);
                let stream = TcpStream::from(OwnedFd::from(stream));
                let id = shared.registry.next_session_id();
                let worker = Arc::clone(shared);
                let spawned = thread::Builder::new()
                    .name(format!("hamcast-session-{}", id))
                    .spawn(move || serve(id, stream, peer, worker));
                match spawned {
                    Ok(t) => {
                        let mut threads = shared.session_threads.lock();
                        threads.retain(|t| !t.is_finished());
                        threads.push(t);
                    }
                    Err(e) => log::error!("could not spawn session for {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("accept failed: {}", e);
                return;
            }
        }
    }
}

/// Handshake with one client, then run its session until it ends.
fn serve(id: u64, stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let (channel, handle) = match open_session(id, stream, &shared) {
        Ok(opened) => opened,
        Err(e) => {
            log::warn!("client {} not admitted: {}", peer, e);
            return;
        }
    };

    {
        let mut sessions = shared.sessions.lock();
        sessions.insert(id, handle.clone());
        if !shared.running.load(Ordering::SeqCst) {
            handle.shutdown();
        }
    }
    log::info!("session {} opened for {}", id, peer);
    channel.run();
    shared.sessions.lock().remove(&id);
}

type SessionChannel = Channel<mio::net::TcpStream, Session>;

fn open_session(
    id: u64,
    mut stream: TcpStream,
    shared: &Shared,
) -> Result<(SessionChannel, ChannelHandle<SessionItem>)> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    server_handshake(&mut stream, shared.max_msg_size)?;
    stream.set_read_timeout(None)?;

    let registry = Arc::clone(&shared.registry);
    let (channel, handle) = Channel::new(tcp_transport(stream)?, Some(FORCE_ACK_INTERVAL), |handle| {
        Session::new(id, registry, handle)
    })?;
    let channel = channel.with_write_limit(shared.max_write_buffer_size);
    Ok((channel, handle))
}
