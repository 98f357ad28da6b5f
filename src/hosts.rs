//! Host redirection through the system hosts file.
//!
//! The redirect is a single tagged line mapping the intercepted hostname to
//! loopback. Enabling adds it when absent; disabling removes every line that
//! starts with it.

use std::io;
use std::path::{Path, PathBuf};

use crate::startup::HostsRedirect;

/// Address the intercepted host is pointed at.
pub const LOOPBACK: &str = "127.0.0.1";

/// A tagged redirect line in a hosts file.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
    line: String,
}

impl HostsFile {
    /// Manage the line `127.0.0.1   <hostname>   # <tag>` in the file at `path`.
    pub fn new(path: impl Into<PathBuf>, hostname: &str, tag: &str) -> Self {
        Self {
            path: path.into(),
            line: format!("{}   {}   # {}", LOOPBACK, hostname, tag),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The exact line written when the redirect is active.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Whether the redirect line is currently present.
    pub fn is_active(&self) -> io::Result<bool> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content.lines().any(|l| l.starts_with(&self.line)))
    }
}

impl HostsRedirect for HostsFile {
    fn set_redirect(&self, active: bool) -> io::Result<bool> {
        let content = std::fs::read_to_string(&self.path)?;
        let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
        let mut lines: Vec<&str> = content.lines().collect();

        if active {
            if lines.iter().any(|l| l.starts_with(&self.line)) {
                return Ok(true);
            }
            lines.push(self.line.as_str());
        } else {
            let before = lines.len();
            lines.retain(|l| !l.starts_with(&self.line));
            if lines.len() == before {
                return Ok(true);
            }
        }

        let mut updated = lines.join(newline);
        if !updated.is_empty() {
            updated.push_str(newline);
        }
        std::fs::write(&self.path, updated)?;
        tracing::debug!(
            "Hosts redirect {} in {}",
            if active { "added" } else { "removed" },
            self.path.display()
        );
        Ok(false)
    }
}
