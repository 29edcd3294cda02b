//! BashNode (§3.1): runs a shell command in a fresh child process per call.
//!
//! Ephemeral — nothing survives past `execute` except, briefly, a handle to the
//! in-flight child so `interrupt` has something to kill.

use super::{ExecutionContext, Node, NodeInfo, NodeResult, NodeState};
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

pub struct BashNode {
    id: String,
    shell: String,
    current_child: Mutex<Option<Arc<Mutex<Child>>>>,
}

impl BashNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shell: "/bin/sh".to_string(),
            current_child: Mutex::new(None),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl Node for BashNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "bash"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn state(&self) -> NodeState {
        NodeState::Ready
    }

    async fn execute(&self, ctx: ExecutionContext) -> NodeResult {
        let command = ctx.input.as_text();
        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return NodeResult::from_node_error(&NodeError::Process(format!(
                    "failed to spawn {}: {e}",
                    self.shell
                )))
            }
        };

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let shared = Arc::new(Mutex::new(child));
        *self.current_child.lock() = Some(shared.clone());

        let wait_future = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            let _ = stdout_pipe.read_to_string(&mut stdout).await;
            let _ = stderr_pipe.read_to_string(&mut stderr).await;
            let status = {
                let mut guard = shared.lock();
                guard.wait().await
            };
            (stdout, stderr, status)
        };

        let outcome = match ctx.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait_future).await,
            None => Ok(wait_future.await),
        };

        *self.current_child.lock() = None;

        let (stdout, stderr, status) = match outcome {
            Ok(triple) => triple,
            Err(_) => {
                return NodeResult::err("operation timed out", "timeout");
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return NodeResult::from_node_error(&NodeError::Process(e.to_string()));
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        let mut attributes = serde_json::Map::new();
        attributes.insert("stdout".to_string(), stdout.clone().into());
        attributes.insert("stderr".to_string(), stderr.clone().into());
        attributes.insert("exit_code".to_string(), exit_code.into());
        attributes.insert("command".to_string(), command.into());
        attributes.insert("interrupted".to_string(), false.into());

        if status.success() {
            NodeResult::ok(attributes)
        } else {
            let mut result = NodeResult::err(
                format!("command exited with status {exit_code}"),
                "process_error",
            );
            result.attributes = attributes;
            result
        }
    }

    async fn interrupt(&self) {
        if let Some(child) = self.current_child.lock().clone() {
            let mut guard = child.lock();
            let _ = guard.start_kill();
        }
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn to_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            node_type: self.node_type().to_string(),
            state: NodeState::Ready,
            metadata: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_reports_stdout_and_zero_exit() {
        let node = BashNode::new("b1");
        let result = node.execute(ExecutionContext::new("echo hi")).await;
        assert!(result.success);
        assert_eq!(result.attributes["stdout"], "hi\n");
        assert_eq!(result.attributes["exit_code"], 0);
    }

    #[tokio::test]
    async fn missing_command_reports_process_error() {
        let node = BashNode::new("b2");
        let result = node.execute(ExecutionContext::new("notfound-xyz")).await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("process_error"));
        let exit_code = result.attributes["exit_code"].as_i64().unwrap();
        assert_ne!(exit_code, 0);
        assert!(!result.attributes["stderr"].as_str().unwrap().is_empty());
    }
}
