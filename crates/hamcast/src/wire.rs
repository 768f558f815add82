// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary (de)serialization of RPC arguments and message content.
//!
//! All integers travel in host byte order: both peers live on the same
//! machine. Variable-length values are prefixed with a `u32` length.
//!
//! | Type | Encoding |
//! |------|----------|
//! | `u8`/`u16`/`u32`/`u64` | fixed width |
//! | `bool` | `u8` (0/1) |
//! | `String`, [`Uri`] | `u32` length + bytes |
//! | `Vec<T>` | `u32` count + elements |
//! | `(A, B)` | `A` then `B` |

use crate::error::{Error, Result};
use crate::uri::Uri;

/// Append-only encoder over a byte vector.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    /// Write a `u32` length followed by the raw bytes.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    /// Encode any [`Wire`] value.
    pub fn put<T: Wire>(&mut self, v: &T) -> &mut Self {
        v.encode(self);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-style decoder over a borrowed byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Take the next `n` bytes without copying.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Deserialize(format!(
                "need {} bytes, only {} left",
                n,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_ne_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.take_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Deserialize(format!("invalid bool byte {}", other))),
        }
    }

    /// Read a `u32` length and borrow that many bytes.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Deserialize(format!("invalid UTF-8 string: {}", e)))
    }

    /// Decode any [`Wire`] value.
    pub fn get<T: Wire>(&mut self) -> Result<T> {
        T::decode(self)
    }
}

/// A value with a defined IPC encoding.
pub trait Wire: Sized {
    fn encode(&self, w: &mut WireWriter);
    fn decode(r: &mut WireReader<'_>) -> Result<Self>;
}

/// Encode a single value into a fresh buffer.
pub fn to_bytes<T: Wire>(value: &T) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put(value);
    w.into_inner()
}

/// Decode a single value, rejecting trailing garbage.
pub fn from_bytes<T: Wire>(data: &[u8]) -> Result<T> {
    let mut r = WireReader::new(data);
    let value = T::decode(&mut r)?;
    if r.remaining() != 0 {
        return Err(Error::Deserialize(format!(
            "{} trailing bytes",
            r.remaining()
        )));
    }
    Ok(value)
}

impl Wire for () {
    fn encode(&self, _: &mut WireWriter) {}
    fn decode(_: &mut WireReader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_wire_scalar {
    ($($t:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Wire for $t {
                fn encode(&self, w: &mut WireWriter) {
                    w.$write(*self);
                }
                fn decode(r: &mut WireReader<'_>) -> Result<Self> {
                    r.$read()
                }
            }
        )*
    };
}

impl_wire_scalar! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    bool => write_bool, read_bool;
}

impl Wire for String {
    fn encode(&self, w: &mut WireWriter) {
        w.write_str(self);
    }
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        r.read_string()
    }
}

impl Wire for Uri {
    fn encode(&self, w: &mut WireWriter) {
        w.write_str(self.as_str());
    }
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        r.read_string().map(Uri::new)
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, w: &mut WireWriter) {
        w.write_u32(self.len() as u32);
        for item in self {
            item.encode(w);
        }
    }
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let count = r.read_u32()? as usize;
        // Every element takes at least one byte; cap the preallocation.
        let mut out = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl<A: Wire, B: Wire> Wire for (A, B) {
    fn encode(&self, w: &mut WireWriter) {
        w.put(&self.0).put(&self.1);
    }
    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok((A::decode(r)?, B::decode(r)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let bytes = to_bytes(&"abc".to_string());
        assert_eq!(bytes.len(), 4 + 3);
        assert_eq!(&bytes[..4], &3u32.to_ne_bytes());
        assert_eq!(&bytes[4..], b"abc");
    }

    #[test]
    fn test_nested_values() {
        let groups: Vec<(Uri, u32)> = vec![
            (Uri::from("ip://239.1.1.1:5000"), 2),
            (Uri::from("sip://chat@example.org"), 7),
        ];
        let decoded: Vec<(Uri, u32)> = from_bytes(&to_bytes(&groups)).unwrap();
        assert_eq!(decoded, groups);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = to_bytes(&"hello".to_string());
        let err = from_bytes::<String>(&bytes[..6]).unwrap_err();
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = to_bytes(&7u32);
        bytes.push(0);
        assert!(from_bytes::<u32>(&bytes).is_err());
    }

    #[test]
    fn test_invalid_bool() {
        assert!(from_bytes::<bool>(&[2]).is_err());
        assert!(from_bytes::<bool>(&[1]).unwrap());
    }

    #[test]
    fn test_huge_count_does_not_preallocate() {
        let mut w = WireWriter::new();
        w.write_u32(u32::MAX);
        let err = from_bytes::<Vec<u32>>(&w.into_inner()).unwrap_err();
        assert!(matches!(err, Error::Deserialize(_)));
    }
}
