// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Middleware configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[cfg(feature = "config-file")]
use std::path::Path;

use crate::config::{DEFAULT_MAX_MSG_SIZE, DEFAULT_MAX_WRITE_BUFFER_SIZE, MEETING_POINT_DIR};
#[cfg(feature = "config-file")]
use crate::error::{Error, Result};

/// Middleware configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "config-file",
    derive(serde::Serialize, serde::Deserialize),
    serde(deny_unknown_fields)
)]
pub struct MiddlewareConfig {
    /// Address to listen on (default: 127.0.0.1)
    #[cfg_attr(feature = "config-file", serde(default = "default_bind"))]
    pub bind: IpAddr,

    /// TCP port to listen on (0 = pick an ephemeral port)
    #[cfg_attr(feature = "config-file", serde(default))]
    pub port: u16,

    /// Directory of the discovery file
    #[cfg_attr(feature = "config-file", serde(default = "default_meeting_point"))]
    pub meeting_point: PathBuf,

    /// Largest payload clients may send, announced in the handshake
    #[cfg_attr(feature = "config-file", serde(default = "default_max_msg_size"))]
    pub max_msg_size: u32,

    /// Output a session buffers before it stops serving its client
    #[cfg_attr(feature = "config-file", serde(default = "default_max_write_buffer_size"))]
    pub max_write_buffer_size: usize,

    /// Names of the loopback interfaces to start, in id order
    #[cfg_attr(feature = "config-file", serde(default = "default_loopback_interfaces"))]
    pub loopback_interfaces: Vec<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_meeting_point() -> PathBuf {
    PathBuf::from(MEETING_POINT_DIR)
}

fn default_max_msg_size() -> u32 {
    DEFAULT_MAX_MSG_SIZE
}

fn default_max_write_buffer_size() -> usize {
    DEFAULT_MAX_WRITE_BUFFER_SIZE
}

fn default_loopback_interfaces() -> Vec<String> {
    vec!["lo".to_string()]
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: 0,
            meeting_point: default_meeting_point(),
            max_msg_size: default_max_msg_size(),
            max_write_buffer_size: default_max_write_buffer_size(),
            loopback_interfaces: default_loopback_interfaces(),
        }
    }
}

impl MiddlewareConfig {
    /// Load configuration from a JSON file.
    #[cfg(feature = "config-file")]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_meeting_point(mut self, dir: impl Into<PathBuf>) -> Self {
        self.meeting_point = dir.into();
        self
    }

    pub fn with_max_msg_size(mut self, size: u32) -> Self {
        self.max_msg_size = size;
        self
    }

    pub fn with_max_write_buffer_size(mut self, bytes: usize) -> Self {
        self.max_write_buffer_size = bytes;
        self
    }

    pub fn with_loopback_interfaces<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.loopback_interfaces = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Validate configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.max_msg_size == 0 {
            return Err("max_msg_size cannot be 0");
        }
        if self.max_write_buffer_size < self.max_msg_size as usize {
            return Err("max_write_buffer_size must hold one packet");
        }
        if self.meeting_point.as_os_str().is_empty() {
            return Err("meeting_point cannot be empty");
        }
        if self.loopback_interfaces.iter().any(|n| n.is_empty()) {
            return Err("interface names cannot be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MiddlewareConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr().port(), 0);
        assert_eq!(config.loopback_interfaces, vec!["lo".to_string()]);
    }

    #[test]
    fn test_validation() {
        assert!(MiddlewareConfig::default().with_max_msg_size(0).validate().is_err());
        assert!(MiddlewareConfig::default()
            .with_max_write_buffer_size(1024)
            .validate()
            .is_err());
        assert!(MiddlewareConfig::default()
            .with_loopback_interfaces([""])
            .validate()
            .is_err());
        // No interface at all is allowed; socket creation fails instead.
        assert!(MiddlewareConfig::default()
            .with_loopback_interfaces(Vec::<String>::new())
            .validate()
            .is_ok());
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("middleware.json");
        std::fs::write(&path, r#"{ "port": 4711, "loopback_interfaces": ["a", "b"] }"#).unwrap();

        let config = MiddlewareConfig::from_json_file(&path).unwrap();
        assert_eq!(config.port, 4711);
        assert_eq!(config.loopback_interfaces, vec!["a", "b"]);
        assert_eq!(config.max_msg_size, DEFAULT_MAX_MSG_SIZE);
        assert_eq!(config.max_write_buffer_size, DEFAULT_MAX_WRITE_BUFFER_SIZE);

        std::fs::write(&path, r#"{ "prot": 1 }"#).unwrap();
        assert!(matches!(
            MiddlewareConfig::from_json_file(&path),
            Err(Error::Config(_))
        ));
    }
}
