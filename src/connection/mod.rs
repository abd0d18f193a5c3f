//! Command execution inside the monitored environment
//!
//! Everything the rest of the crate knows about the target container goes
//! through the [`Connection`] trait: run a bounded command and capture its
//! output, or open an unbounded line stream. The local `docker exec`
//! implementation lives in [`local`]; the ROS 2 CLI wrappers that sit on
//! top of any connection live in [`ros2`].

pub mod local;
pub mod ros2;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub use local::LocalConnection;
pub use ros2::Ros2Client;

/// Result type alias for executor operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors that can occur while talking to the target environment
#[derive(Debug)]
pub enum ConnectionError {
    /// Target unreachable or handshake failed
    ConnectionFailed(String),

    /// The container itself vanished - callers should mark the
    /// connection stale instead of retrying
    ContainerNotFound(String),

    /// A bounded command did not finish in time
    Timeout { seconds: u64 },

    /// The command ran but exited non-zero
    CommandFailed { exit_code: i32, stderr: String },

    /// No connection has been established (or it was closed)
    NotConnected,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ConnectionFailed(msg) => {
                write!(f, "failed to connect to target: {}", msg)
            }
            ConnectionError::ContainerNotFound(msg) => {
                write!(f, "container not found: {}", msg)
            }
            ConnectionError::Timeout { seconds } => {
                write!(f, "command timed out after {}s", seconds)
            }
            ConnectionError::CommandFailed { exit_code, stderr } => {
                write!(f, "command failed with code {}: {}", exit_code, stderr)
            }
            ConnectionError::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Trait for command executors targeting one monitored environment
///
/// Implementations must be `Send + Sync` as they are shared across async
/// tasks (reconciler, alert monitors, log collector).
///
/// ## Contract
///
/// - `connect` verifies the target is actually reachable and running,
///   not merely that a handle was obtained.
/// - `disconnect` is idempotent.
/// - `exec` carries an explicit timeout; `exec_stream` is unbounded but
///   must support external termination without leaking the subprocess.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish and verify the connection
    async fn connect(&self) -> ConnectionResult<()>;

    /// Close the connection; safe to call repeatedly
    async fn disconnect(&self);

    /// Whether a verified connection is currently established
    fn is_connected(&self) -> bool;

    /// Execute a command and return its full captured stdout
    async fn exec(&self, cmd: &str, timeout_secs: u64) -> ConnectionResult<String>;

    /// Execute a command and stream its output line by line
    ///
    /// The returned stream is infinite from the caller's perspective and
    /// not restartable; drop it (or call `terminate`) to stop the
    /// underlying process.
    async fn exec_stream(&self, cmd: &str) -> ConnectionResult<LineStream>;
}

/// How long stream termination waits for the child to go away.
pub(crate) const STREAM_KILL_WAIT: Duration = Duration::from_secs(2);

/// An unbounded sequence of output lines from a streaming command.
///
/// The lines arrive over a channel fed by a pump task that owns the child
/// process. Dropping the stream (or calling [`LineStream::terminate`])
/// signals the pump, which kills the child and waits briefly for it to
/// exit, so early exits never leak a subprocess.
pub struct LineStream {
    rx: mpsc::Receiver<String>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl LineStream {
    /// Build a stream from a line channel and a shutdown signal; custom
    /// `Connection` implementations feed these from their own pump.
    pub fn new(rx: mpsc::Receiver<String>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            rx,
            shutdown: Some(shutdown),
        }
    }

    /// Next output line; `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Stop the underlying process explicitly.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            if tx.send(()).is_err() {
                // Pump already gone; nothing to stop.
                warn!("stream pump exited before termination request");
            }
        }
        self.rx.close();
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
