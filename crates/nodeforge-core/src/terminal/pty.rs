//! Pseudo-terminal backend (§4.2): owns a child process under a controlling pty.
//!
//! Spawn-time layout follows the pack's pty-over-websocket bridge: take the writer
//! once at spawn, clone the reader once, and hand the reader to a dedicated
//! `spawn_blocking` task since `portable_pty`'s reader is a blocking `std::io::Read`.
//! Unlike a passthrough bridge we don't have per-connection subscribers — instead the
//! reader task folds everything into a single rolling buffer guarded by a mutex, which
//! `read_all`/`read_tail` snapshot.

use super::{stopped, tail_lines, TerminalBackend, DEFAULT_TAIL_LINES};
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

pub struct PtySpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    pub tail_lines: usize,
}

impl Default for PtySpawnConfig {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            cols: 120,
            rows: 40,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

struct State {
    buffer: String,
    saw_output: bool,
    stopped: bool,
}

pub struct PtyBackend {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Box<dyn MasterPty + Send>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    state: Arc<Mutex<State>>,
    ready_notify: Arc<Notify>,
    tail: usize,
    stopping: AtomicBool,
}

impl PtyBackend {
    pub fn spawn(config: PtySpawnConfig) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| NodeError::Process(format!("failed to allocate pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&config.program);
        for arg in &config.args {
            cmd.arg(arg);
        }
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| NodeError::Process(format!("failed to spawn {}: {e}", config.program)))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| NodeError::Process(format!("failed to take pty writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| NodeError::Process(format!("failed to clone pty reader: {e}")))?;

        let state = Arc::new(Mutex::new(State {
            buffer: String::new(),
            saw_output: false,
            stopped: false,
        }));
        let ready_notify = Arc::new(Notify::new());

        let reader_state = state.clone();
        let reader_notify = ready_notify.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        let mut guard = reader_state.lock();
                        guard.buffer.push_str(&chunk);
                        guard.saw_output = true;
                        drop(guard);
                        reader_notify.notify_waiters();
                    }
                    Err(e) => {
                        warn!(error = %e, "pty reader stopped");
                        break;
                    }
                }
            }
            reader_state.lock().stopped = true;
            reader_notify.notify_waiters();
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            master: pair.master,
            child: Mutex::new(child),
            state,
            ready_notify,
            tail: config.tail_lines,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| NodeError::Process(format!("resize failed: {e}")))
    }
}

#[async_trait]
impl TerminalBackend for PtyBackend {
    async fn wait_ready(&self, ready_timeout: Duration) -> Result<()> {
        if self.state.lock().saw_output {
            return Ok(());
        }
        let notified = self.ready_notify.notified();
        if timeout(ready_timeout, notified).await.is_err() && !self.state.lock().saw_output {
            return Err(NodeError::Timeout);
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(stopped("pty backend"));
        }
        let writer = self.writer.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut w = writer.lock();
            w.write_all(&bytes)?;
            w.flush()
        })
        .await
        .map_err(|e| NodeError::Internal(e.to_string()))?
        .map_err(|e| NodeError::Process(format!("pty write failed: {e}")))
    }

    async fn read_all(&self) -> Result<String> {
        Ok(self.state.lock().buffer.clone())
    }

    async fn read_tail(&self, lines: usize) -> Result<String> {
        Ok(tail_lines(&self.state.lock().buffer, lines))
    }

    async fn signal_interrupt(&self) -> Result<()> {
        let mut child = self.child.lock();
        child
            .kill()
            .map_err(|e| NodeError::Process(format!("failed to signal pty child: {e}")))
    }

    async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::Release);
        let mut child = self.child.lock();
        let _ = child.kill();
        self.state.lock().stopped = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_echo_and_observes_output() {
        let config = PtySpawnConfig {
            program: "echo".to_string(),
            args: vec!["hello-pty".to_string()],
            ..Default::default()
        };
        let backend = PtyBackend::spawn(config).expect("spawn echo");
        backend
            .wait_ready(Duration::from_secs(5))
            .await
            .expect("echo should produce output promptly");
        let out = backend.read_all().await.unwrap();
        assert!(out.contains("hello-pty"), "buffer was: {out:?}");
    }

    #[tokio::test]
    async fn wait_ready_times_out_on_silent_command() {
        let config = PtySpawnConfig {
            program: "sleep".to_string(),
            args: vec!["5".to_string()],
            ..Default::default()
        };
        let backend = PtyBackend::spawn(config).expect("spawn sleep");
        let result = backend.wait_ready(Duration::from_millis(50)).await;
        assert!(result.is_err());
        let _ = backend.stop().await;
    }
}
