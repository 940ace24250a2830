use std::net::SocketAddr;
use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::broadcast;

/// A notification published by the supervisor.
///
/// [`Event::name`] returns the wire name subscribers match on (`"starting"`,
/// `"childmessage"`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A launch attempt begins. Does not mean the child is up.
    Starting(PathBuf),
    /// The socket listener is accepting connections. Fires once per supervisor.
    Ready(PathBuf),
    /// Child spawned; `None` when spawning failed.
    Start(Option<u32>),
    /// Every inbound child message, control tokens included.
    Message(Value),
    /// Inbound child messages that are not control tokens.
    ChildMessage(Value),
    Stdout(String),
    Stderr(String),
    Exit(PathBuf),
    Aborted(PathBuf),
    TooManyRestarts(PathBuf),
    ScriptChanged,
    ScriptDeleted,
    SocketError(String),
    SocketTimeout(u16),
    SocketClosed(u16),
    SocketConnect(SocketAddr),
    SocketData(Vec<u8>),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Starting(_) => "starting",
            Event::Ready(_) => "ready",
            Event::Start(_) => "start",
            Event::Message(_) => "message",
            Event::ChildMessage(_) => "childmessage",
            Event::Stdout(_) => "stdout",
            Event::Stderr(_) => "stderr",
            Event::Exit(_) => "exit",
            Event::Aborted(_) => "aborted",
            Event::TooManyRestarts(_) => "toomanyrestarts",
            Event::ScriptChanged => "scriptchanged",
            Event::ScriptDeleted => "scriptdeleted",
            Event::SocketError(_) => "socketerror",
            Event::SocketTimeout(_) => "sockettimeout",
            Event::SocketClosed(_) => "socketclosed",
            Event::SocketConnect(_) => "socketconnect",
            Event::SocketData(_) => "socketdata",
        }
    }
}

/// Publishes [`Event`]s to every subscriber. Sending with no subscriber is not an error.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: broadcast::Sender<Event>,
}

impl Emitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        tracing::trace!(event = event.name(), "notify");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
