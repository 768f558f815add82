// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types shared by the client stub and the middleware.

use crate::protocol::ExceptionId;
use std::fmt;
use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the HAMcast IPC layer.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Caller errors
    // ========================================================================
    /// Argument rejected before anything was sent
    InvalidArgument(String),

    /// Payload exceeds the negotiated maximum message size
    MessageTooLarge { size: usize, max: usize },

    // ========================================================================
    // Transport / protocol errors (fatal to the channel)
    // ========================================================================
    /// Underlying transport failure
    Io(io::Error),

    /// Peer violated the wire protocol
    Protocol(String),

    /// Content could not be decoded
    Deserialize(String),

    /// Middleware answered the handshake with `accepted = 0`
    HandshakeRejected,

    /// Handshake request carried a bad magic number or version
    IncompatibleVersion { magic: u32, major: u32, minor: u32 },

    /// The channel's I/O thread has terminated
    ChannelClosed,

    // ========================================================================
    // RPC-level errors (carried in sync_response)
    // ========================================================================
    /// A precondition of the invoked operation did not hold
    RequirementFailed(String),

    /// A technology interface failed while serving the request
    InternalInterfaceError(String),

    // ========================================================================
    // Lookup errors
    // ========================================================================
    /// No socket with this id exists
    NoSuchSocket(u32),

    /// No interface with this id exists
    NoSuchInterface(u32),

    // ========================================================================
    // Misc
    // ========================================================================
    /// Bounded wait elapsed
    Timeout,

    /// Discovery file or configuration could not be used
    Config(String),
}

impl Error {
    /// Build the typed error matching an exception id received in a
    /// `sync_response`. Returns `None` for [`ExceptionId::None`].
    pub fn from_exception(id: ExceptionId, message: String) -> Option<Self> {
        match id {
            ExceptionId::None => None,
            ExceptionId::RequirementFailed => Some(Self::RequirementFailed(message)),
            ExceptionId::InternalInterfaceError => Some(Self::InternalInterfaceError(message)),
        }
    }

    /// Exception id used when this error is reported back to a client.
    ///
    /// Everything that is not an interface failure is reported as a
    /// failed requirement.
    pub fn exception_id(&self) -> ExceptionId {
        match self {
            Self::InternalInterfaceError(_) | Self::Io(_) => ExceptionId::InternalInterfaceError,
            _ => ExceptionId::RequirementFailed,
        }
    }

    /// Shorthand for [`Error::RequirementFailed`].
    pub fn requirement(msg: impl Into<String>) -> Self {
        Self::RequirementFailed(msg.into())
    }

    /// Like `From<io::Error>`, but a read or connect that ran out of time
    /// becomes [`Error::Timeout`].
    pub fn from_io_deadline(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(e),
        }
    }

    /// Check whether this error ends the channel it was raised on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Protocol(_)
                | Self::Deserialize(_)
                | Self::HandshakeRejected
                | Self::IncompatibleVersion { .. }
                | Self::ChannelClosed
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes (max {})", size, max)
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            Self::Deserialize(msg) => write!(f, "Deserialization error: {}", msg),
            Self::HandshakeRejected => write!(f, "Handshake rejected by middleware"),
            Self::IncompatibleVersion {
                magic,
                major,
                minor,
            } => write!(
                f,
                "Incompatible client: magic {:#010x}, version {}.{}",
                magic, major, minor
            ),
            Self::ChannelClosed => write!(f, "IPC channel closed"),
            Self::RequirementFailed(msg) => write!(f, "Requirement failed: {}", msg),
            Self::InternalInterfaceError(msg) => write!(f, "Internal interface error: {}", msg),
            Self::NoSuchSocket(id) => write!(f, "No such socket (socket id = {})", id),
            Self::NoSuchInterface(id) => write!(f, "No such interface (id = {})", id),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_roundtrip() {
        let err = Error::from_exception(ExceptionId::RequirementFailed, "empty group".into())
            .expect("typed error");
        assert!(matches!(err, Error::RequirementFailed(ref m) if m == "empty group"));
        assert_eq!(err.exception_id(), ExceptionId::RequirementFailed);

        let err = Error::from_exception(ExceptionId::InternalInterfaceError, "down".into())
            .expect("typed error");
        assert_eq!(err.exception_id(), ExceptionId::InternalInterfaceError);

        assert!(Error::from_exception(ExceptionId::None, String::new()).is_none());
    }

    #[test]
    fn test_lookup_errors_map_to_requirement() {
        assert_eq!(
            Error::NoSuchSocket(3).exception_id(),
            ExceptionId::RequirementFailed
        );
        assert_eq!(
            Error::NoSuchSocket(3).to_string(),
            "No such socket (socket id = 3)"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ChannelClosed.is_fatal());
        assert!(Error::Protocol("bad".into()).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::requirement("x").is_fatal());
    }

    #[test]
    fn test_deadline_errors_become_timeout() {
        let e = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(Error::from_io_deadline(e), Error::Timeout));
        let e = io::Error::from(io::ErrorKind::TimedOut);
        assert!(matches!(Error::from_io_deadline(e), Error::Timeout));
        let e = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(Error::from_io_deadline(e), Error::Io(_)));
    }
}
