// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte-stream transports a channel can drive.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::event::Source;

/// A nonblocking duplex byte stream registrable with `mio`.
pub trait Transport: Read + Write + Source + Send + 'static {
    /// Close both directions; the peer observes end of stream.
    fn shutdown(&self) -> io::Result<()>;

    /// Human-readable peer description for logs.
    fn describe(&self) -> String;
}

impl Transport for mio::net::TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }

    fn describe(&self) -> String {
        self.peer_addr()
            .map(|a| format!("tcp {}", a))
            .unwrap_or_else(|_| "tcp <unconnected>".to_string())
    }
}

impl Transport for mio::net::UnixStream {
    fn shutdown(&self) -> io::Result<()> {
        mio::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn describe(&self) -> String {
        "unix socket".to_string()
    }
}

/// Turn a connected blocking std stream into a channel transport.
pub fn tcp_transport(stream: std::net::TcpStream) -> io::Result<mio::net::TcpStream> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(mio::net::TcpStream::from_std(stream))
}
