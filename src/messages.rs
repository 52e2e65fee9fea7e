//! Build events and the bus that carries them.
//!
//! [`Message`] is the wire schema the dashboard consumes: externally tagged,
//! snake_case JSON, one message per WebSocket text frame. Publishing never blocks
//! the build. The [`BroadcastBus`] fans events out to any number of
//! subscribers; lagging subscribers lose old events rather than stall
//! publishers. The [`LogBus`] renders the same events through `tracing` for
//! command-line builds.
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::PediaError;

/// Capacity of the broadcast ring. Subscribers further behind than this see a
/// lag notice instead of the dropped events.
pub const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    BuildStarted(BuildStartedMessage),
    BuildComplete(BuildCompleteMessage),
    PhaseStarted(String),
    CommandLaunched(String),
    Note(AlertMessage),
    Warning(AlertMessage),
    Error(AlertMessage),
    ToolOutput(ToolOutputMessage),
    InputDebugOutput(InputDebugOutputMessage),
    ServerInfo(ServerInfoMessage),
    ServerQuitting,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::BuildStarted(_) => "build_started",
            Message::BuildComplete(_) => "build_complete",
            Message::PhaseStarted(_) => "phase_started",
            Message::CommandLaunched(_) => "command_launched",
            Message::Note(_) => "note",
            Message::Warning(_) => "warning",
            Message::Error(_) => "error",
            Message::ToolOutput(_) => "tool_output",
            Message::InputDebugOutput(_) => "input_debug_output",
            Message::ServerInfo(_) => "server_info",
            Message::ServerQuitting => "server_quitting",
        }
    }

    /// The input this event is scoped to, if any.
    pub fn file(&self) -> Option<&str> {
        match self {
            Message::BuildStarted(m) => m.file.as_deref(),
            Message::BuildComplete(m) => m.file.as_deref(),
            Message::Note(a) | Message::Warning(a) | Message::Error(a) => a.file.as_deref(),
            Message::InputDebugOutput(m) => Some(&m.file),
            _ => None,
        }
    }

    pub fn build_started(file: Option<&str>) -> Message {
        Message::BuildStarted(BuildStartedMessage {
            file: file.map(String::from),
        })
    }

    pub fn build_complete(file: Option<&str>, success: bool, elapsed: f32) -> Message {
        Message::BuildComplete(BuildCompleteMessage {
            file: file.map(String::from),
            success,
            elapsed,
        })
    }

    pub fn to_wire(&self) -> Result<String, PediaError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one wire frame. The bare `"build_started"` literal older
    /// servers sent is read as a whole-build start.
    pub fn from_wire(text: &str) -> Result<Message, PediaError> {
        if text.trim() == "\"build_started\"" {
            return Ok(Message::build_started(None));
        }
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStartedMessage {
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildCompleteMessage {
    pub file: Option<String>,
    pub success: bool,
    /// Seconds.
    pub elapsed: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub file: Option<String>,
    pub message: String,
    pub context: Vec<String>,
}

impl AlertMessage {
    pub fn new(file: Option<&str>, message: impl ToString, context: Vec<String>) -> AlertMessage {
        AlertMessage {
            file: file.map(String::from),
            message: message.to_string(),
            context,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutputMessage {
    pub stream: ToolOutputStream,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDebugOutputMessage {
    pub file: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfoMessage {
    pub app_port: u16,
    pub n_workers: usize,
}

/// Where build events go. Posting must return promptly and must never fail the
/// caller; undeliverable events are dropped with a local log.
pub trait MessageBus: Clone + Send + Sync + 'static {
    fn post(&self, msg: Message);

    fn note(&self, file: Option<&str>, message: impl ToString, context: Vec<String>) {
        self.post(Message::Note(AlertMessage::new(file, message, context)))
    }

    fn warning(&self, file: Option<&str>, message: impl ToString, context: Vec<String>) {
        self.post(Message::Warning(AlertMessage::new(file, message, context)))
    }

    fn error(&self, file: Option<&str>, message: impl ToString, context: Vec<String>) {
        self.post(Message::Error(AlertMessage::new(file, message, context)))
    }

    fn phase(&self, name: &str) {
        self.post(Message::PhaseStarted(name.to_string()))
    }
}

/// Fan-out bus for any number of live subscribers.
///
/// Subscribers only see events posted after they subscribe.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Message>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        BroadcastBus::new(BUS_CAPACITY)
    }
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> BroadcastBus {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl MessageBus for BroadcastBus {
    fn post(&self, msg: Message) {
        let kind = msg.kind();
        if self.tx.send(msg).is_err() {
            tracing::trace!("[Bus] no subscribers for {kind} event");
        }
    }
}

/// Renders events through `tracing` for non-interactive builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogBus;

impl MessageBus for LogBus {
    fn post(&self, msg: Message) {
        match msg {
            Message::BuildStarted(m) => match m.file {
                Some(file) => tracing::debug!("compiling {file}"),
                None => tracing::info!("build started"),
            },
            Message::BuildComplete(m) => match m.file {
                Some(file) => tracing::debug!(
                    "{file}: {} in {:.2}s",
                    if m.success { "done" } else { "FAILED" },
                    m.elapsed
                ),
                None if m.success => tracing::info!("build succeeded in {:.1} seconds", m.elapsed),
                None => tracing::error!("build failed after {:.1} seconds", m.elapsed),
            },
            Message::PhaseStarted(phase) => tracing::info!("phase: {phase}"),
            Message::CommandLaunched(cmd) => tracing::debug!("running `{cmd}`"),
            Message::Note(a) => {
                tracing::info!("{}", alert_text(&a));
            }
            Message::Warning(a) => {
                tracing::warn!("{}", alert_text(&a));
            }
            Message::Error(a) => {
                tracing::error!("{}", alert_text(&a));
            }
            Message::ToolOutput(t) => {
                for line in t.lines {
                    match t.stream {
                        ToolOutputStream::Stdout => tracing::info!("| {line}"),
                        ToolOutputStream::Stderr => tracing::warn!("| {line}"),
                    }
                }
            }
            Message::InputDebugOutput(d) => {
                for line in d.lines {
                    tracing::info!("{}: {line}", d.file);
                }
            }
            Message::ServerInfo(info) => tracing::info!(
                "app port {}, {} worker(s)",
                info.app_port,
                info.n_workers
            ),
            Message::ServerQuitting => tracing::info!("server quitting"),
        }
    }
}

fn alert_text(alert: &AlertMessage) -> String {
    let mut text = match &alert.file {
        Some(file) => format!("{file}: {}", alert.message),
        None => alert.message.clone(),
    };
    for line in alert.context.iter() {
        text.push_str("\n  ");
        text.push_str(line);
    }
    text
}
