// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental decoder for the IPC byte stream.
//!
//! The transport is a nonblocking stream without message boundaries.
//! The codec accumulates whatever bytes are available and cuts them into
//! [`Message`]s, keeping partial headers/content across reads.

use std::io::{self, Read};

use super::{Message, MessageType, HEADER_SIZE};
use crate::config::{MAX_CONTENT_SIZE, READ_CHUNK_SIZE};
use crate::error::{Error, Result};

/// Internal state for incremental decoding.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Waiting for a complete 16-byte header
    ReadingHeader,

    /// Header parsed, waiting for `content_size` bytes
    ReadingContent {
        msg_type: MessageType,
        field1: u16,
        field2: u32,
        field3: u32,
        content_size: usize,
    },
}

/// Wire message decoder with partial-read state.
#[derive(Debug)]
pub struct MessageCodec {
    state: ReadState,

    /// Bytes received but not consumed yet
    accumulator: Vec<u8>,

    /// Read position in `accumulator`
    pos: usize,

    /// Maximum allowed content size (anti-OOM protection)
    max_content: usize,

    /// Statistics: messages decoded
    messages_decoded: u64,

    /// Statistics: headers rejected (unknown type, oversized content)
    messages_rejected: u64,

    /// Statistics: bytes pulled from the transport
    bytes_read: u64,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_CONTENT_SIZE)
    }
}

impl MessageCodec {
    pub fn new(max_content: usize) -> Self {
        Self {
            state: ReadState::ReadingHeader,
            accumulator: Vec::with_capacity(READ_CHUNK_SIZE),
            pos: 0,
            max_content,
            messages_decoded: 0,
            messages_rejected: 0,
            bytes_read: 0,
        }
    }

    pub fn messages_decoded(&self) -> u64 {
        self.messages_decoded
    }

    pub fn messages_rejected(&self) -> u64 {
        self.messages_rejected
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes buffered but not yet turned into a message.
    pub fn buffered(&self) -> usize {
        self.accumulator.len() - self.pos
    }

    /// Append raw bytes (tests, in-memory transports).
    pub fn feed(&mut self, data: &[u8]) {
        self.compact();
        self.accumulator.extend_from_slice(data);
        self.bytes_read += data.len() as u64;
    }

    /// Pull one chunk from `reader` into the accumulator.
    ///
    /// Returns `Ok(0)` on end of stream. `WouldBlock` is passed through.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.compact();
        let start = self.accumulator.len();
        self.accumulator.resize(start + READ_CHUNK_SIZE, 0);
        let result = loop {
            match reader.read(&mut self.accumulator[start..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let n = *result.as_ref().unwrap_or(&0);
        self.accumulator.truncate(start + n);
        self.bytes_read += n as u64;
        result
    }

    /// Cut the next complete message out of the buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Unknown message
    /// types and oversized content are protocol errors.
    pub fn decode_buffered(&mut self) -> Result<Option<Message>> {
        loop {
            match self.state {
                ReadState::ReadingHeader => {
                    if self.buffered() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let h = &self.accumulator[self.pos..self.pos + HEADER_SIZE];
                    let raw_type = u16::from_ne_bytes([h[0], h[1]]);
                    let field1 = u16::from_ne_bytes([h[2], h[3]]);
                    let field2 = u32::from_ne_bytes([h[4], h[5], h[6], h[7]]);
                    let field3 = u32::from_ne_bytes([h[8], h[9], h[10], h[11]]);
                    let content_size = u32::from_ne_bytes([h[12], h[13], h[14], h[15]]) as usize;
                    self.pos += HEADER_SIZE;

                    let msg_type = match MessageType::try_from(raw_type) {
                        Ok(t) => t,
                        Err(e) => {
                            self.messages_rejected += 1;
                            return Err(e);
                        }
                    };
                    if content_size > self.max_content {
                        self.messages_rejected += 1;
                        return Err(Error::Protocol(format!(
                            "content too large: {} bytes (max {})",
                            content_size, self.max_content
                        )));
                    }
                    self.state = ReadState::ReadingContent {
                        msg_type,
                        field1,
                        field2,
                        field3,
                        content_size,
                    };
                }

                ReadState::ReadingContent {
                    msg_type,
                    field1,
                    field2,
                    field3,
                    content_size,
                } => {
                    if self.buffered() < content_size {
                        return Ok(None);
                    }
                    let content = self.accumulator[self.pos..self.pos + content_size].to_vec();
                    self.pos += content_size;
                    self.state = ReadState::ReadingHeader;
                    self.messages_decoded += 1;
                    return Ok(Some(Message::new(msg_type, field1, field2, field3, content)));
                }
            }
        }
    }

    /// Read and decode from a nonblocking stream.
    ///
    /// Returns `Ok(None)` once the stream would block. End of stream is
    /// reported as [`Error::Io`] with `UnexpectedEof`.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.decode_buffered()? {
                return Ok(Some(msg));
            }
            match self.read_from(reader) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        if self.buffered() == 0 {
                            "connection closed"
                        } else {
                            "connection closed inside a message"
                        },
                    )))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop consumed bytes once they dominate the buffer.
    fn compact(&mut self) {
        if self.pos == self.accumulator.len() {
            self.accumulator.clear();
            self.pos = 0;
        } else if self.pos > READ_CHUNK_SIZE {
            self.accumulator.drain(..self.pos);
            self.pos = 0;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
