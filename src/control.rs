use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::SupervisorError;
use crate::event::{Emitter, Event};
use crate::runtime::Termination;

/// Requests from a [`SupervisorHandle`] to the supervisor task.
#[derive(Debug)]
pub(crate) enum Command {
    Launch(oneshot::Sender<Result<(), SupervisorError>>),
    Send(Value, oneshot::Sender<Result<(), SupervisorError>>),
    Restart(oneshot::Sender<Result<(), SupervisorError>>),
    Kill,
    Status(oneshot::Sender<Status>),
}

/// Snapshot of the supervisor's runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub starts: u32,
    pub attempts: u32,
    pub wait: Duration,
    pub window_opened_at: Option<DateTime<Local>>,
    pub monitoring: bool,
    pub forcekill: bool,
}

/// Cheap, cloneable control surface of a running supervisor.
///
/// Every method talks to the supervisor task; once it has terminated they
/// return [`SupervisorError::Closed`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    pub(crate) tx: mpsc::UnboundedSender<Command>,
    pub(crate) emitter: Emitter,
    pub(crate) port: Arc<OnceLock<u16>>,
    pub(crate) done: watch::Receiver<Option<Termination>>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| SupervisorError::Closed)?;
        reply_rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Starts the child. The first call also opens the socket listener.
    ///
    /// Fails with [`SupervisorError::ChildAlreadyRunning`] while a child is owned.
    /// After a forced shutdown it does nothing.
    pub async fn launch(&self) -> Result<(), SupervisorError> {
        self.request(Command::Launch).await?
    }

    /// Delivers a payload to the running child over the control channel.
    pub async fn send_message<T: Serialize + ?Sized>(&self, msg: &T) -> Result<(), SupervisorError> {
        let value = serde_json::to_value(msg)?;
        self.request(|reply| Command::Send(value, reply)).await?
    }

    /// Kills the current child and launches a fresh one, like a child's `RESTART`.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.request(Command::Restart).await?
    }

    /// Begins the forced shutdown: no further launches, child killed, socket closed.
    ///
    /// Use [`SupervisorHandle::wait`] to know when it has finished.
    pub fn kill_child_process(&self) -> Result<(), SupervisorError> {
        self.tx.send(Command::Kill).map_err(|_| SupervisorError::Closed)
    }

    pub async fn status(&self) -> Result<Status, SupervisorError> {
        self.request(Command::Status).await
    }

    /// Port of the socket listener, once it is listening.
    pub fn port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.emitter.subscribe()
    }

    /// Resolves when the supervisor has terminated, with the reason.
    pub async fn wait(&self) -> Result<Termination, SupervisorError> {
        let mut done = self.done.clone();
        let termination = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SupervisorError::Closed)?;
        (*termination).ok_or(SupervisorError::Closed)
    }

    /// The termination reason, if the supervisor has already stopped.
    pub fn termination(&self) -> Option<Termination> {
        *self.done.borrow()
    }
}
