//! External-terminal backend (§4.2): attaches to a pane of a multiplexer the node
//! doesn't own or spawn itself, instead of allocating its own pty.
//!
//! This is the capability a collaborator-facing "join my tmux pane" node needs: the
//! multiplexer (tmux, screen, a remote session manager) is represented abstractly as
//! [`PaneMultiplexer`] so the backend itself stays free of any particular multiplexer's
//! wire protocol. A test fixture implementation lives alongside the tests below; a real
//! tmux-backed implementation shells out to `tmux capture-pane`/`send-keys` and is
//! expected to live outside this crate's test-reachable surface.

use super::{stopped, tail_lines, TerminalBackend, DEFAULT_TAIL_LINES};
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The minimal capability an external terminal multiplexer must expose for a node to
/// attach to one of its panes.
#[async_trait]
pub trait PaneMultiplexer: Send + Sync {
    async fn send_keys(&self, pane_id: &str, bytes: &[u8]) -> Result<()>;
    async fn capture_pane(&self, pane_id: &str) -> Result<String>;
    async fn send_signal(&self, pane_id: &str, signal: &str) -> Result<()>;
    async fn pane_exists(&self, pane_id: &str) -> Result<bool>;

    /// Spawns a new pane running `command` (§4.2 "panes may be created on demand").
    /// A backend that only ever attaches to pre-existing panes may leave this
    /// returning `not_implemented`.
    async fn spawn_pane(&self, pane_id: &str, command: &[String]) -> Result<()>;
}

pub struct ExternalTerminalBackend {
    multiplexer: Box<dyn PaneMultiplexer>,
    pane_id: String,
    tail: usize,
    last_seen_nonempty: Mutex<bool>,
    stopped: AtomicBool,
}

impl ExternalTerminalBackend {
    pub fn new(multiplexer: Box<dyn PaneMultiplexer>, pane_id: impl Into<String>) -> Self {
        Self {
            multiplexer,
            pane_id: pane_id.into(),
            tail: DEFAULT_TAIL_LINES,
            last_seen_nonempty: Mutex::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_tail_lines(mut self, tail: usize) -> Self {
        self.tail = tail;
        self
    }
}

#[async_trait]
impl TerminalBackend for ExternalTerminalBackend {
    async fn wait_ready(&self, ready_timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + ready_timeout;
        loop {
            if self.multiplexer.pane_exists(&self.pane_id).await? {
                *self.last_seen_nonempty.lock() = true;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NodeError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(stopped("external terminal backend"));
        }
        self.multiplexer.send_keys(&self.pane_id, bytes).await
    }

    async fn read_all(&self) -> Result<String> {
        self.multiplexer.capture_pane(&self.pane_id).await
    }

    async fn read_tail(&self, lines: usize) -> Result<String> {
        let all = self.read_all().await?;
        Ok(tail_lines(&all, lines))
    }

    async fn signal_interrupt(&self) -> Result<()> {
        self.multiplexer.send_signal(&self.pane_id, "INT").await
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeMultiplexer {
        pane: Mutex<String>,
        exists: Mutex<bool>,
    }

    #[async_trait]
    impl PaneMultiplexer for FakeMultiplexer {
        async fn send_keys(&self, _pane_id: &str, bytes: &[u8]) -> Result<()> {
            self.pane.lock().push_str(&String::from_utf8_lossy(bytes));
            Ok(())
        }

        async fn capture_pane(&self, _pane_id: &str) -> Result<String> {
            Ok(self.pane.lock().clone())
        }

        async fn send_signal(&self, _pane_id: &str, _signal: &str) -> Result<()> {
            Ok(())
        }

        async fn pane_exists(&self, _pane_id: &str) -> Result<bool> {
            Ok(*self.exists.lock())
        }

        async fn spawn_pane(&self, _pane_id: &str, _command: &[String]) -> Result<()> {
            *self.exists.lock() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_then_capture_round_trips_through_the_multiplexer() {
        let mux = Arc::new(FakeMultiplexer {
            pane: Mutex::new(String::new()),
            exists: Mutex::new(true),
        });
        let backend = ExternalTerminalBackend::new(
            Box::new(FakeMultiplexerHandle(mux.clone())),
            "pane-0",
        );
        backend.write(b"echo hi\n").await.unwrap();
        let captured = backend.read_all().await.unwrap();
        assert_eq!(captured, "echo hi\n");
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_pane_never_appears() {
        let mux = Arc::new(FakeMultiplexer {
            pane: Mutex::new(String::new()),
            exists: Mutex::new(false),
        });
        let backend =
            ExternalTerminalBackend::new(Box::new(FakeMultiplexerHandle(mux)), "pane-missing");
        let result = backend.wait_ready(Duration::from_millis(80)).await;
        assert!(result.is_err());
    }

    struct FakeMultiplexerHandle(Arc<FakeMultiplexer>);

    #[async_trait]
    impl PaneMultiplexer for FakeMultiplexerHandle {
        async fn send_keys(&self, pane_id: &str, bytes: &[u8]) -> Result<()> {
            self.0.send_keys(pane_id, bytes).await
        }
        async fn capture_pane(&self, pane_id: &str) -> Result<String> {
            self.0.capture_pane(pane_id).await
        }
        async fn send_signal(&self, pane_id: &str, signal: &str) -> Result<()> {
            self.0.send_signal(pane_id, signal).await
        }
        async fn pane_exists(&self, pane_id: &str) -> Result<bool> {
            self.0.pane_exists(pane_id).await
        }
        async fn spawn_pane(&self, pane_id: &str, command: &[String]) -> Result<()> {
            self.0.spawn_pane(pane_id, command).await
        }
    }
}
