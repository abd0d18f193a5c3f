//! rosout stream parsing and log collection
//!
//! `ros2 topic echo /rosout` prints a free-form text rendering of each
//! log message terminated by a `---` sentinel line. There is no other
//! framing guarantee, so records are reassembled by accumulating lines
//! and flushing on the sentinel, then scraping the buffer with
//! independent field searches. Buffers missing a required field are
//! noise and get dropped silently.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use crate::connection::{Connection, LineStream};
use crate::{LogLevel, LogRecord};

/// End-of-record marker in `topic echo` output.
pub const SENTINEL: &str = "---";

/// QoS flags keep the subscription from missing bursts.
pub const ROSOUT_ECHO_CMD: &str = "ros2 topic echo /rosout --no-arr \
     --qos-reliability best_effort --qos-history keep_last --qos-depth 100";

/// Wait before resubscribing after the stream dies.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Per-subscriber buffer; laggards lose records rather than block.
const SUBSCRIBER_BUFFER: usize = 256;

static SEC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sec:\s*(\d+)").unwrap());
static NANOSEC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"nanosec:\s*(\d+)").unwrap());
static LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"level:\s*(\d+)").unwrap());
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name:\s*['"]?([^'"}\n]+)"#).unwrap());
static MSG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"msg:\s*['"]?([^'"}\n]*)"#).unwrap());

/// Extract one structured record from an assembled buffer.
///
/// Returns `None` when any required field (seconds, level, name, msg) is
/// missing; malformed records are not an error condition.
pub fn parse_rosout_record(text: &str) -> Option<LogRecord> {
    let sec: i64 = SEC_RE.captures(text)?.get(1)?.as_str().parse().ok()?;
    let nanosec: u32 = NANOSEC_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    let level_code: u8 = LEVEL_RE
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .unwrap_or(20);

    let node_name = NAME_RE.captures(text)?.get(1)?.as_str().trim().to_string();
    let message = MSG_RE.captures(text)?.get(1)?.as_str().trim().to_string();

    let timestamp: DateTime<Utc> = DateTime::from_timestamp(sec, nanosec)?;

    Some(LogRecord {
        timestamp,
        level: LogLevel::from_code(level_code),
        node_name,
        message,
    })
}

/// Accumulates raw lines and yields parsed records at each sentinel.
///
/// Small enough to embed anywhere a line stream needs framing (the
/// collector below and the alert engine's pattern monitor both do).
#[derive(Default)]
pub struct RecordFramer {
    buffer: Vec<String>,
}

impl RecordFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a record when the sentinel closes a frame.
    pub fn push(&mut self, line: &str) -> Option<LogRecord> {
        if line.trim() == SENTINEL {
            let text = self.buffer.join("\n");
            self.buffer.clear();
            parse_rosout_record(&text)
        } else {
            self.buffer.push(line.to_string());
            None
        }
    }
}

/// Commands understood by the log collector actor
enum LogCommand {
    Subscribe {
        /// `None` subscribes to the firehose, `Some` filters by node.
        node: Option<String>,
        respond_to: oneshot::Sender<mpsc::Receiver<LogRecord>>,
    },
    Shutdown,
}

struct Subscriber {
    node: Option<String>,
    tx: mpsc::Sender<LogRecord>,
}

/// Actor that owns the single rosout subscription and fans records out
///
/// The underlying stream is only held while subscribers exist; on stream
/// death it backs off and resubscribes, since the telemetry source may
/// itself restart.
pub struct LogCollector {
    conn: Arc<dyn Connection>,
    command_rx: mpsc::Receiver<LogCommand>,
    subscribers: Vec<Subscriber>,
}

impl LogCollector {
    fn new(conn: Arc<dyn Connection>, command_rx: mpsc::Receiver<LogCommand>) -> Self {
        Self {
            conn,
            command_rx,
            subscribers: Vec::new(),
        }
    }

    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting log collector");

        let mut stream: Option<LineStream> = None;
        let mut framer = RecordFramer::new();

        loop {
            // Idle: no subscribers means no stream to hold open.
            if self.subscribers.is_empty() {
                if let Some(mut s) = stream.take() {
                    s.terminate();
                }
                match self.command_rx.recv().await {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                        continue;
                    }
                    None => break,
                }
            }

            // (Re)open the subscription if needed.
            if stream.is_none() {
                match self.conn.exec_stream(ROSOUT_ECHO_CMD).await {
                    Ok(s) => {
                        framer = RecordFramer::new();
                        stream = Some(s);
                    }
                    Err(e) => {
                        warn!("rosout subscription failed: {e}, retrying");
                        if self.wait_backoff().await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let Some(active) = stream.as_mut() else {
                continue;
            };

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                line = active.next_line() => {
                    match line {
                        Some(line) => {
                            if let Some(record) = framer.push(&line) {
                                self.dispatch(record);
                            }
                        }
                        None => {
                            warn!("rosout stream ended, resubscribing");
                            stream = None;
                            if self.wait_backoff().await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(mut s) = stream.take() {
            s.terminate();
        }
        debug!("log collector stopped");
    }

    /// Cooperative backoff that still reacts to commands. Returns true
    /// when the actor should exit.
    async fn wait_backoff(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => false,
            cmd = self.command_rx.recv() => match cmd {
                Some(cmd) => self.handle_command(cmd),
                None => true,
            },
        }
    }

    /// Returns true on shutdown.
    fn handle_command(&mut self, cmd: LogCommand) -> bool {
        match cmd {
            LogCommand::Subscribe { node, respond_to } => {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                self.subscribers.push(Subscriber { node, tx });
                let _ = respond_to.send(rx);
                false
            }
            LogCommand::Shutdown => {
                debug!("received shutdown command");
                true
            }
        }
    }

    fn dispatch(&mut self, record: LogRecord) {
        // Drop subscribers whose receiver is gone.
        self.subscribers.retain(|s| !s.tx.is_closed());

        for sub in &self.subscribers {
            let wants = match &sub.node {
                None => true,
                Some(node) => node == &record.node_name,
            };
            if !wants {
                continue;
            }
            if sub.tx.try_send(record.clone()).is_err() {
                trace!("dropping log record for slow subscriber");
            }
        }
    }
}

/// Handle for the log collector actor
#[derive(Clone)]
pub struct LogCollectorHandle {
    sender: mpsc::Sender<LogCommand>,
}

impl LogCollectorHandle {
    pub fn spawn(conn: Arc<dyn Connection>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = LogCollector::new(conn, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    /// Subscribe to parsed log records; `None` for all nodes.
    ///
    /// The returned receiver is an infinite, non-restartable sequence.
    pub async fn subscribe(&self, node: Option<String>) -> Option<mpsc::Receiver<LogRecord>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LogCommand::Subscribe {
                node,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(LogCommand::Shutdown).await;
    }
}
