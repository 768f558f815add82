// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Middleware discovery file.
//!
//! The middleware publishes its listening port and process id in the
//! meeting-point directory so clients started later can find it:
//!
//! ```text
//! middleware.port = 41234
//! middleware.pid = 4711
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{DISCOVERY_FILE_NAME, PID_KEY, PORT_KEY};
use crate::error::{Error, Result};

/// Contents of the discovery file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryFile {
    pub port: u16,
    pub pid: u32,
}

impl DiscoveryFile {
    /// Record for the current process listening on `port`.
    pub fn for_current_process(port: u16) -> Self {
        Self {
            port,
            pid: std::process::id(),
        }
    }

    /// Full path of the discovery file inside `dir`.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(DISCOVERY_FILE_NAME)
    }

    /// Create `dir` if needed and (over)write the discovery file.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Config(format!("cannot create {}: {}", dir.display(), e))
        })?;
        let path = Self::path_in(dir);
        let body = format!("{} = {}\n{} = {}\n", PORT_KEY, self.port, PID_KEY, self.pid);
        fs::write(&path, body)
            .map_err(|e| Error::Config(format!("cannot write {}: {}", path.display(), e)))?;
        log::debug!("discovery file written to {}", path.display());
        Ok(path)
    }

    /// Read and parse the discovery file in `dir`.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::Config(format!(
                    "no running middleware found ({} missing)",
                    path.display()
                ))
            } else {
                Error::Config(format!("cannot read {}: {}", path.display(), e))
            }
        })?;
        Self::parse(&text)
    }

    /// Parse `key = value` lines; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut port = None;
        let mut pid = None;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("line {}: expected `key = value`", lineno + 1))
            })?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                PORT_KEY => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        Error::Config(format!("line {}: invalid port {:?}", lineno + 1, value))
                    })?)
                }
                PID_KEY => {
                    pid = Some(value.parse::<u32>().map_err(|_| {
                        Error::Config(format!("line {}: invalid pid {:?}", lineno + 1, value))
                    })?)
                }
                other => log::debug!("ignoring unknown discovery key {:?}", other),
            }
        }

        Ok(Self {
            port: port.ok_or_else(|| Error::Config(format!("{} missing", PORT_KEY)))?,
            pid: pid.ok_or_else(|| Error::Config(format!("{} missing", PID_KEY)))?,
        })
    }

    /// Remove the discovery file; a missing file is not an error.
    pub fn remove(dir: &Path) -> Result<()> {
        match fs::remove_file(Self::path_in(dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Config(format!("cannot remove discovery file: {}", e))),
        }
    }

    /// Check whether the recorded process still exists.
    pub fn is_alive(&self) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return false;
        };
        // SAFETY: signal 0 performs only the existence/permission check.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("meeting_point/middleware");
        let record = DiscoveryFile { port: 41234, pid: 4711 };
        let path = record.write(&nested).unwrap();
        assert!(path.ends_with(DISCOVERY_FILE_NAME));

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "middleware.port = 41234\nmiddleware.pid = 4711\n");
        assert_eq!(DiscoveryFile::read(&nested).unwrap(), record);

        DiscoveryFile::remove(&nested).unwrap();
        DiscoveryFile::remove(&nested).unwrap();
        assert!(matches!(DiscoveryFile::read(&nested), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_tolerates_comments_and_spacing() {
        let text = "# written by hamcast\n\nmiddleware.pid=12\n  middleware.port =  9000  \nextra = 1\n";
        let record = DiscoveryFile::parse(text).unwrap();
        assert_eq!(record, DiscoveryFile { port: 9000, pid: 12 });
    }

    #[test]
    fn test_parse_rejects_incomplete_or_garbage() {
        assert!(matches!(
            DiscoveryFile::parse("middleware.port = 1\n"),
            Err(Error::Config(m)) if m.contains(PID_KEY)
        ));
        assert!(DiscoveryFile::parse("middleware.port 1\n").is_err());
        assert!(DiscoveryFile::parse("middleware.port = 70000\nmiddleware.pid = 1\n").is_err());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(DiscoveryFile::for_current_process(1).is_alive());
    }
}
