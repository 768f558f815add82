// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HAMcast protocol constants - single source of truth.
//!
//! Every limit shared by the client stub and the middleware lives here.
//! Both sides of the IPC link must agree on these values, so **never
//! hardcode them elsewhere**.
//!
//! # Flow control at a glance
//!
//! ```text
//! client socket                         middleware proxy
//! +--------------------+   async_send   +----------------------+
//! | out budget 16 MiB  | -------------> | send budget 16 MiB   |
//! | window 256 packets |                | ACK every 64 packets |
//! +--------------------+ <------------- | or at 50% budget     |
//!                         cumulative_ack +----------------------+
//! ```

use std::time::Duration;

// =======================================================================
// Handshake
// =======================================================================

/// Magic number opening every client handshake.
pub const MAGIC_NUMBER: u32 = 0xDEAD_C0DE;

/// Protocol major version spoken by this build.
pub const MAJOR_VERSION: u32 = 0;

/// Protocol minor version spoken by this build.
pub const MINOR_VERSION: u32 = 6;

/// Oldest major version the middleware still accepts.
pub const MIN_COMPATIBLE_MAJOR_VERSION: u32 = 0;

/// Oldest minor version the middleware still accepts.
pub const MIN_COMPATIBLE_MINOR_VERSION: u32 = 6;

// =======================================================================
// Byte budgets
// =======================================================================

/// Default size of every per-socket storage semaphore (16 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Window limit: packets a socket may have on the wire without an ACK.
pub const MAX_PENDING_SENDS: usize = 256;

/// Packets a socket may buffer (sent or not) before the budget runs dry
/// when every packet is at most [`MIN_BUFFER_CHUNK`] bytes.
pub const MAX_BUFFERED_SENDS: usize = 512;

/// Smallest amount charged against a byte budget per packet.
///
/// Tiny packets would otherwise let a socket buffer an unbounded number
/// of entries inside a fixed byte budget.
pub const MIN_BUFFER_CHUNK: usize = DEFAULT_MAX_BUFFER_SIZE / MAX_BUFFERED_SENDS;

/// Default maximum payload size of one multicast packet (8 KiB).
pub const DEFAULT_MAX_MSG_SIZE: u32 = 8 * 1024;

/// Default limit of the middleware's outbound write buffer per session (5 MiB).
pub const DEFAULT_MAX_WRITE_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Upper bound for a single wire message's content, used by the decoder
/// as anti-OOM protection.
pub const MAX_CONTENT_SIZE: usize = DEFAULT_MAX_BUFFER_SIZE;

/// Largest packet a technology module may hand to the middleware.
pub const MAX_INBOUND_PACKET_SIZE: usize = 65536;

// =======================================================================
// Acknowledgement scheduling
// =======================================================================

/// A proxy emits a cumulative ACK at least once per this many packets.
pub const MAX_ACK_BLOCK_SIZE: u32 = 64;

/// Poll timeout of a middleware session; each timeout flushes deferred ACKs.
pub const FORCE_ACK_INTERVAL: Duration = Duration::from_millis(1);

// =======================================================================
// Event loop
// =======================================================================

/// Maximum readiness events handled per poll.
pub const MAX_EVENTS: usize = 16;

/// Upper bound for one `notify_message` write into the wakeup pipe.
pub const MAX_NOTIFY_BATCH: usize = 31;

/// Read chunk used when draining the transport.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

// =======================================================================
// Discovery
// =======================================================================

/// Directory where the middleware publishes its discovery file.
pub const MEETING_POINT_DIR: &str = "/tmp/hamcast/meeting_point/middleware/";

/// Discovery file name inside [`MEETING_POINT_DIR`].
pub const DISCOVERY_FILE_NAME: &str = "middleware.config_file";

/// Key of the listening port inside the discovery file.
pub const PORT_KEY: &str = "middleware.port";

/// Key of the middleware process id inside the discovery file.
pub const PID_KEY: &str = "middleware.pid";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_chunk_matches_budget_split() {
        assert_eq!(MIN_BUFFER_CHUNK, 32768);
        assert_eq!(MIN_BUFFER_CHUNK * MAX_BUFFERED_SENDS, DEFAULT_MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_window_fits_budget() {
        assert!(MAX_PENDING_SENDS <= MAX_BUFFERED_SENDS);
        assert!((DEFAULT_MAX_MSG_SIZE as usize) <= MIN_BUFFER_CHUNK);
    }
}
