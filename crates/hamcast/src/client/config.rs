// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client stub configuration.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DEFAULT_MAX_BUFFER_SIZE, MAX_PENDING_SENDS, MEETING_POINT_DIR};

/// What the client does when its connection to the middleware breaks.
#[derive(Clone, Default)]
pub enum ExitPolicy {
    /// Log and abort the process.
    #[default]
    Abort,

    /// Invoke the hook with the failure reason and keep the process alive.
    /// Pending and later calls fail with [`Error::ChannelClosed`](crate::Error::ChannelClosed).
    Callback(Arc<dyn Fn(&str) + Send + Sync>),
}

impl fmt::Debug for ExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("Abort"),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Configuration for connecting to a middleware.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Middleware endpoint; read from the discovery file when `None`.
    pub endpoint: Option<SocketAddr>,

    /// Directory holding the discovery file.
    pub meeting_point: PathBuf,

    /// Connect timeout for the TCP connection.
    pub connect_timeout: Duration,

    /// Bytes a socket may hold in received-but-unread packets.
    pub receive_budget: usize,

    /// Packets a socket may have on the wire without an ACK.
    pub send_window: usize,

    /// Connection-loss behaviour.
    pub exit_policy: ExitPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            meeting_point: PathBuf::from(MEETING_POINT_DIR),
            connect_timeout: Duration::from_secs(5),
            receive_budget: DEFAULT_MAX_BUFFER_SIZE,
            send_window: MAX_PENDING_SENDS,
            exit_policy: ExitPolicy::Abort,
        }
    }
}

impl ClientConfig {
    /// Configuration targeting a known endpoint.
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    /// Builder: look up the endpoint in `dir` instead of the default
    /// meeting point.
    pub fn with_meeting_point(mut self, dir: impl Into<PathBuf>) -> Self {
        self.meeting_point = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_receive_budget(mut self, bytes: usize) -> Self {
        self.receive_budget = bytes;
        self
    }

    /// Builder: set the per-socket send window.
    pub fn with_send_window(mut self, packets: usize) -> Self {
        self.send_window = packets;
        self
    }

    /// Builder: run `hook` instead of aborting on connection loss.
    pub fn with_exit_callback<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.exit_policy = ExitPolicy::Callback(Arc::new(hook));
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be > 0");
        }
        if self.send_window == 0 {
            return Err("send_window must be > 0");
        }
        if self.receive_budget == 0 {
            return Err("receive_budget must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.endpoint.is_none());
        assert_eq!(config.send_window, MAX_PENDING_SENDS);
        assert!(matches!(config.exit_policy, ExitPolicy::Abort));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let config = ClientConfig::new(addr)
            .with_send_window(4)
            .with_receive_budget(1024)
            .with_meeting_point("/tmp/elsewhere")
            .with_exit_callback(|_| {});
        assert_eq!(config.endpoint, Some(addr));
        assert_eq!(config.send_window, 4);
        assert_eq!(config.receive_budget, 1024);
        assert_eq!(config.meeting_point, PathBuf::from("/tmp/elsewhere"));
        assert!(matches!(config.exit_policy, ExitPolicy::Callback(_)));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        assert!(ClientConfig::default().with_send_window(0).validate().is_err());
    }
}
