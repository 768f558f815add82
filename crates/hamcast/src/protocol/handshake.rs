// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection handshake.
//!
//! Runs on the blocking stream before the channel takes it over:
//!
//! ```text
//! client -> middleware : magic:u32  major:u32  minor:u32
//! middleware -> client : accepted:u8  max_msg_size:u32
//! ```

use std::io::{Read, Write};

use crate::config::{
    MAGIC_NUMBER, MAJOR_VERSION, MIN_COMPATIBLE_MAJOR_VERSION, MIN_COMPATIBLE_MINOR_VERSION,
    MINOR_VERSION,
};
use crate::error::{Error, Result};

/// First bytes a client writes after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub magic: u32,
    pub major: u32,
    pub minor: u32,
}

/// Middleware answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    pub accepted: bool,
    pub max_msg_size: u32,
}

impl HandshakeRequest {
    pub const SIZE: usize = 12;

    /// The request this build sends.
    pub fn current() -> Self {
        Self {
            magic: MAGIC_NUMBER,
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
        }
    }

    /// Magic matches and both version numbers lie in `[min, current]`.
    pub fn is_compatible(&self) -> bool {
        self.magic == MAGIC_NUMBER
            && (MIN_COMPATIBLE_MAJOR_VERSION..=MAJOR_VERSION).contains(&self.major)
            && (MIN_COMPATIBLE_MINOR_VERSION..=MINOR_VERSION).contains(&self.minor)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.magic.to_ne_bytes());
        out[4..8].copy_from_slice(&self.major.to_ne_bytes());
        out[8..12].copy_from_slice(&self.minor.to_ne_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_ne_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            magic: word(0),
            major: word(4),
            minor: word(8),
        }
    }
}

impl HandshakeReply {
    pub const SIZE: usize = 5;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = u8::from(self.accepted);
        out[1..5].copy_from_slice(&self.max_msg_size.to_ne_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            accepted: raw[0] == 1,
            max_msg_size: u32::from_ne_bytes([raw[1], raw[2], raw[3], raw[4]]),
        }
    }
}

/// Client side: send our version, return the negotiated max message size.
pub fn client_handshake<S: Read + Write>(stream: &mut S) -> Result<u32> {
    stream.write_all(&HandshakeRequest::current().to_bytes())?;
    stream.flush()?;

    let mut raw = [0u8; HandshakeReply::SIZE];
    stream.read_exact(&mut raw).map_err(Error::from_io_deadline)?;
    let reply = HandshakeReply::from_bytes(&raw);
    if !reply.accepted {
        log::warn!("middleware rejected handshake");
        return Err(Error::HandshakeRejected);
    }
    log::debug!("handshake accepted, max_msg_size = {}", reply.max_msg_size);
    Ok(reply.max_msg_size)
}

/// Middleware side: validate the client's request and always answer.
///
/// Returns the request on success and [`Error::IncompatibleVersion`]
/// after the rejection has been written.
pub fn server_handshake<S: Read + Write>(
    stream: &mut S,
    max_msg_size: u32,
) -> Result<HandshakeRequest> {
    let mut raw = [0u8; HandshakeRequest::SIZE];
    stream.read_exact(&mut raw).map_err(Error::from_io_deadline)?;
    let request = HandshakeRequest::from_bytes(&raw);
    let accepted = request.is_compatible();

    let reply = HandshakeReply {
        accepted,
        max_msg_size,
    };
    stream.write_all(&reply.to_bytes())?;
    stream.flush()?;

    if accepted {
        Ok(request)
    } else {
        log::warn!(
            "rejected client: magic {:#010x}, version {}.{}",
            request.magic,
            request.major,
            request.minor
        );
        Err(Error::IncompatibleVersion {
            magic: request.magic,
            major: request.major,
            minor: request.minor,
        })
    }
}
