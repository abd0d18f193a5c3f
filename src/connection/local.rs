//! Co-located `docker exec` executor
//!
//! Runs commands inside a container on the same host. The streaming
//! variant wraps the command in `script -q` so tools inside the container
//! see a pseudo-TTY and keep their output line-buffered.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError, ConnectionResult, LineStream, STREAM_KILL_WAIT};

/// Environment preamble sourced before every command.
const ROS_ENV: &str = "ROS_DOMAIN_ID=$(cat $HOME/.ros_domain_id 2>/dev/null || echo 0) && \
     export ROS_DOMAIN_ID && \
     export ROS_LOCALHOST_ONLY=1";

pub struct LocalConnection {
    container: String,
    ros_setup: String,
    connected: AtomicBool,
}

impl LocalConnection {
    pub fn new(container: impl Into<String>, ros_setup: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            ros_setup: ros_setup.into(),
            connected: AtomicBool::new(false),
        }
    }

    fn build_docker_cmd(&self, cmd: &str) -> String {
        let escaped = cmd.replace('\'', "'\"'\"'");
        format!(
            "docker exec {} bash -c '{} && source {} && {}'",
            self.container, ROS_ENV, self.ros_setup, escaped
        )
    }

    /// Streaming variant: `script -q` allocates a pty inside the container
    /// so line buffering survives the pipe.
    fn build_docker_cmd_stream(&self, cmd: &str) -> String {
        let escaped = cmd.replace('\'', "'\"'\"'");
        format!(
            "docker exec {} script -q -c \"bash -c '{} && source {} && {}'\" /dev/null",
            self.container, ROS_ENV, self.ros_setup, escaped
        )
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn connect(&self) -> ConnectionResult<()> {
        // A handle alone proves nothing; ask Docker whether the container
        // is actually running.
        let inspect = format!(
            "docker inspect {} --format '{{{{.State.Running}}}}'",
            self.container
        );

        let output = Command::new("sh")
            .arg("-c")
            .arg(&inspect)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        if !output.status.success() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ConnectionError::ContainerNotFound(format!(
                "container '{}' not found",
                self.container
            )));
        }

        let state = String::from_utf8_lossy(&output.stdout);
        if state.trim().to_lowercase() != "true" {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ConnectionError::ConnectionFailed(format!(
                "container '{}' is not running",
                self.container
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        debug!("connected to container {}", self.container);
        Ok(())
    }

    async fn disconnect(&self) {
        // Nothing to tear down for a local connection.
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn exec(&self, cmd: &str, timeout_secs: u64) -> ConnectionResult<String> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let full_cmd = self.build_docker_cmd(cmd);
        trace!("exec: {full_cmd}");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&full_cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = timeout(std::time::Duration::from_secs(timeout_secs), child)
            .await
            .map_err(|_| ConnectionError::Timeout {
                seconds: timeout_secs,
            })?
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("No such container") {
                self.connected.store(false, Ordering::SeqCst);
                return Err(ConnectionError::ContainerNotFound(stderr));
            }
            return Err(ConnectionError::CommandFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn exec_stream(&self, cmd: &str) -> ConnectionResult<LineStream> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let full_cmd = self.build_docker_cmd_stream(cmd);
        trace!("exec_stream: {full_cmd}");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&full_cmd)
            .stdout(Stdio::piped())
            // `script` already merges stderr into the pty.
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectionError::ConnectionFailed("no stdout handle".to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        // Pump task owns the child: forwards lines until the consumer
        // terminates or the process exits, then kills and reaps it.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        break;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                if tx.send(trimmed).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("stream read error: {e}");
                                break;
                            }
                        }
                    }
                }
            }

            // Terminate, wait briefly, then give up reaping.
            if let Err(e) = child.start_kill() {
                trace!("stream child already gone: {e}");
            }
            if timeout(STREAM_KILL_WAIT, child.wait()).await.is_err() {
                warn!("stream child did not exit within {STREAM_KILL_WAIT:?}");
            }
        });

        Ok(LineStream::new(rx, shutdown_tx))
    }
}
