//! Terminal backend (§4.2): the thing a persistent terminal node actually drives.
//!
//! Two implementations share [`TerminalBackend`]: a pseudo-terminal backend that owns
//! a child process under a controlling pty, and an external-terminal backend that
//! attaches to a pane of an already-running multiplexer. Both report the same
//! lifecycle — create → ready (within `ready_timeout`) → writable → stopped — and
//! `ready` requires at least one successful read.

pub mod external;
pub mod pty;

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Rolling buffer tail size kept by backends that maintain their own buffer (§4.2).
pub const DEFAULT_TAIL_LINES: usize = 2000;

#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Block until the backend has produced at least one successful read, or
    /// `ready_timeout` elapses.
    async fn wait_ready(&self, ready_timeout: Duration) -> Result<()>;

    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Non-destructive read of everything buffered so far.
    async fn read_all(&self) -> Result<String>;

    /// Non-destructive read of the last `lines` lines of the buffer.
    async fn read_tail(&self, lines: usize) -> Result<String>;

    /// SIGINT-equivalent. Safe to call from any state.
    async fn signal_interrupt(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Truncate a buffer to its last `tail` lines, used by both backend implementations'
/// `read_tail` and by the pty backend's rolling-buffer maintenance.
pub fn tail_lines(buffer: &str, tail: usize) -> String {
    let lines: Vec<&str> = buffer.lines().collect();
    if lines.len() <= tail {
        return buffer.to_string();
    }
    lines[lines.len() - tail..].join("\n")
}

pub(crate) fn stopped(what: &str) -> NodeError {
    NodeError::NodeStopped(what.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_keeps_only_the_last_n() {
        let buf = "a\nb\nc\nd\ne";
        assert_eq!(tail_lines(buf, 2), "d\ne");
        assert_eq!(tail_lines(buf, 10), buf);
    }
}
