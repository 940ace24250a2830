use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Local;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::control::{Command, Status, SupervisorHandle};
use crate::error::SupervisorError;
use crate::event::{Emitter, Event};
use crate::logger::Sinks;
use crate::parse::SupervisorConfig;
use crate::policy::{RestartLimit, RestartPolicy};
use crate::protocol::{self, ControlCommand};
use crate::socket::{ListenerContext, SocketDataHandler, SocketListener};
use crate::watch::{ScriptWatcher, WatchTrigger};

/// Why a supervisor stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Forced shutdown: `kill_child_process`, a `STOP` from the child, or the script was deleted.
    Shutdown,
    /// The child failed while `abort_on_error` was set.
    Aborted { code: Option<i32> },
    TooManyRestarts(RestartLimit),
}

impl Termination {
    /// Exit code for a process whose only job was this supervisor.
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Shutdown => 0,
            Termination::Aborted { .. } | Termination::TooManyRestarts(_) => 1,
        }
    }
}

/// How a child ended: an exit code, or the signal that killed it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_wait(status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: status.signal(),
            },
            Err(e) => {
                warn!(error = %e, "failed to wait for child");
                Self::default()
            }
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn signal_name(&self) -> Option<&'static str> {
        self.signal
            .and_then(|raw| Signal::try_from(raw).ok())
            .map(Signal::as_str)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code: {code}")?,
            None => write!(f, "code: null")?,
        }
        match (self.signal_name(), self.signal) {
            (Some(name), _) => write!(f, ", signal: {name}"),
            (None, Some(raw)) => write!(f, ", signal: {raw}"),
            (None, None) => write!(f, ", signal: null"),
        }
    }
}

/// Wake-ups the supervisor task gives itself.
#[derive(Debug)]
enum Internal {
    RestartDue,
    WindowElapsed,
    Stable(u64),
    ChildMessage(u64, Value),
    Watch(WatchTrigger),
}

/// The supervisor's side of one running child.
struct ChildProcess {
    generation: u64,
    pid: Option<u32>,
    outbox: mpsc::UnboundedSender<String>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: oneshot::Receiver<ExitInfo>,
    kill_requested: bool,
}

impl ChildProcess {
    fn request_kill(&mut self) {
        self.kill_requested = true;
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    async fn terminate(mut self) -> ExitInfo {
        self.request_kill();
        self.exit_rx.await.unwrap_or_default()
    }
}

/// Keeps one script running.
///
/// Built by [`SupervisorBuilder`](crate::builder::SupervisorBuilder) and started
/// with [`Supervisor::run`]. All state lives in the task `run` spawns; the
/// returned [`SupervisorHandle`] is how callers reach it.
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    script_name: String,
    sinks: Sinks,
    on_socket_data: Option<SocketDataHandler>,
    emitter: Emitter,
    port: Arc<OnceLock<u16>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    done_tx: watch::Sender<Option<Termination>>,

    policy: RestartPolicy,
    child: Option<ChildProcess>,
    generation: u64,
    socket: Option<SocketListener>,
    socket_opened: bool,
    watcher: Option<ScriptWatcher>,
    forcekill: bool,
    enable_monitoring: bool,
    restart_pending: bool,
    termination: Option<Termination>,
}

impl Supervisor {
    pub(crate) fn new(
        config: SupervisorConfig,
        sinks: Sinks,
        on_socket_data: Option<SocketDataHandler>,
        event_capacity: usize,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (done_tx, _) = watch::channel(None);
        Self {
            script_name: config.script_name(),
            policy: RestartPolicy::from_config(&config),
            config: Arc::new(config),
            sinks,
            on_socket_data,
            emitter: Emitter::new(event_capacity),
            port: Arc::new(OnceLock::new()),
            commands_tx,
            commands_rx,
            internal_tx,
            internal_rx,
            done_tx,
            child: None,
            generation: 0,
            socket: None,
            socket_opened: false,
            watcher: None,
            forcekill: false,
            enable_monitoring: true,
            restart_pending: false,
            termination: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// A handle for the not-yet-running supervisor, e.g. to subscribe before [`Supervisor::run`].
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.commands_tx.clone(),
            emitter: self.emitter.clone(),
            port: self.port.clone(),
            done: self.done_tx.subscribe(),
        }
    }

    /// Spawns the supervisor task. Nothing is launched until [`SupervisorHandle::launch`].
    pub fn run(self) -> SupervisorHandle {
        let handle = self.handle();
        tokio::spawn(self.supervise());
        handle
    }

    async fn supervise(mut self) {
        let termination = loop {
            tokio::select! {
                Some(command) = self.commands_rx.recv() => self.handle_command(command).await,
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                info = child_exit(&mut self.child) => self.on_child_exit(info),
            }
            if let Some(termination) = self.termination.take() {
                break termination;
            }
        };
        self.release().await;
        info!(script = %self.script_name, ?termination, "supervisor stopped");
        self.done_tx.send_replace(Some(termination));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Launch(reply) => {
                let result = self.launch().await;
                let _ = reply.send(result);
            }
            Command::Send(msg, reply) => {
                let _ = reply.send(self.send_message(msg));
            }
            Command::Restart(reply) => {
                let result = self.restart_child().await;
                let _ = reply.send(result);
            }
            Command::Kill => self.kill_child_process().await,
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::RestartDue => self.on_restart_due().await,
            Internal::WindowElapsed => {
                debug!(script = %self.script_name, "restart window elapsed");
                self.policy.close_window();
            }
            Internal::Stable(generation) => {
                if self.child.as_ref().map(|c| c.generation) == Some(generation) {
                    self.monitor();
                }
            }
            Internal::ChildMessage(generation, msg) => self.on_child_message(generation, msg).await,
            Internal::Watch(trigger) => self.on_watch(trigger).await,
        }
    }

    /*
        @@@
        @launch();
        . Does nothing once forcekill is set; refuses a second child while one is owned.
        . Opens the socket listener on the very first call.
        . Opens a restart window if none is open and counts this start in it.
        . Spawns the child and starts the script watcher if restart_on_script_change is set.
        . Hands over to monitor(), right away or once the child has stayed up for reset_after.
    */
    async fn launch(&mut self) -> Result<(), SupervisorError> {
        if self.forcekill {
            debug!(script = %self.script_name, "launch ignored after forced shutdown");
            return Ok(());
        }
        if let Some(child) = &self.child {
            return Err(SupervisorError::ChildAlreadyRunning(child.pid));
        }

        if !self.socket_opened {
            self.socket_opened = true;
            self.open_socket().await;
        }

        let script = self.config.script.clone();
        self.sinks.syslog.info(&format!("Starting {}", script.display()));
        self.emitter.emit(Event::Starting(script));

        if let Some(window) = self.policy.open_window(Instant::now()) {
            self.schedule(window, Internal::WindowElapsed);
        }
        self.policy.record_start();

        self.generation += 1;
        let pid = match self.spawn_child() {
            Ok(child) => {
                let pid = child.pid;
                info!(script = %self.script_name, pid = ?pid, starts = self.policy.starts(), "child spawned");
                self.child = Some(child);
                pid
            }
            Err(e) => {
                self.sinks.errlog.error(&format!("Failed to start {}: {}", self.script_name, e));
                None
            }
        };

        if self.config.restart_on_script_change && self.watcher.is_none() {
            self.start_watcher();
        }

        self.emitter.emit(Event::Start(pid));

        let reset_after = self.config.reset_after();
        if self.child.is_some() && !reset_after.is_zero() {
            self.schedule(reset_after, Internal::Stable(self.generation));
        } else {
            self.monitor();
        }
        Ok(())
    }

    fn spawn_child(&self) -> Result<ChildProcess, SupervisorError> {
        let cfg = &self.config;
        let mut cmd = match &cfg.interpreter {
            Some(interpreter) => {
                let mut cmd = ProcessCommand::new(interpreter);
                cmd.arg(&cfg.script);
                cmd
            }
            None => ProcessCommand::new(&cfg.script),
        };
        cmd.args(&cfg.args)
            .envs(&cfg.env)
            .current_dir(cfg.cwd())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let (channel, child_end) = protocol::channel_pair().map_err(SupervisorError::Channel)?;
        protocol::install_child_end(&mut cmd, &child_end);
        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        drop(child_end);

        let generation = self.generation;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, Stream::Stdout, self.emitter.clone(), self.sinks.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, Stream::Stderr, self.emitter.clone(), self.sinks.clone());
        }

        let (reader, mut writer) = channel.into_split();
        let inbox = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let msg = protocol::decode_line(&line);
                if inbox.send(Internal::ChildMessage(generation, msg)).is_err() {
                    break;
                }
            }
        });

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = outbox_rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!(pid = ?pid, error = %e, "control channel write failed");
                    break;
                }
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(child, pid, cfg.stop_timeout(), kill_rx, exit_tx));

        Ok(ChildProcess {
            generation,
            pid,
            outbox,
            kill_tx: Some(kill_tx),
            exit_rx,
            kill_requested: false,
        })
    }

    async fn open_socket(&mut self) {
        let ctx = ListenerContext {
            emitter: self.emitter.clone(),
            sinks: self.sinks.clone(),
            on_data: self.on_socket_data.clone(),
            handle: self.handle(),
            idle_timeout: self.config.socket_timeout(),
        };
        match SocketListener::open(self.config.port, ctx).await {
            Ok(listener) => {
                let port = listener.port();
                let _ = self.port.set(port);
                self.socket = Some(listener);
                self.emitter.emit(Event::Ready(self.config.script.clone()));
                self.sinks
                    .syslog
                    .info(&format!("Socket communication established on port {port}."));
            }
            Err(e) => {
                self.emitter.emit(Event::SocketError(e.to_string()));
                self.sinks.errlog.error(&e.to_string());
            }
        }
    }

    fn start_watcher(&mut self) {
        let inbox = self.internal_tx.clone();
        self.watcher = Some(ScriptWatcher::spawn(
            self.config.script.clone(),
            self.config.watch_interval(),
            move |trigger| {
                let _ = inbox.send(Internal::Watch(trigger));
            },
        ));
    }

    fn schedule(&self, delay: Duration, wake: Internal) {
        let inbox = self.internal_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = inbox.send(wake);
        });
    }

    /*
        @@@
        @monitor();
        . No-op while monitoring is disabled.
        . Child gone: ends the supervisor if the window's restart budget is spent, else schedules a restart after `wait`.
        . Child alive: the launch counts as a success, attempts and wait go back to their base values.
    */
    fn monitor(&mut self) {
        if !self.enable_monitoring {
            return;
        }
        if self.child.is_some() {
            self.policy.reset();
            return;
        }

        if self.policy.window_exhausted(Instant::now()) {
            self.sinks.errlog.error(&format!(
                "Too many restarts within the last {} seconds. Please check the script.",
                self.config.max_wait_time_interval
            ));
            self.fail(RestartLimit::Window);
            return;
        }
        if self.restart_pending {
            return;
        }
        self.restart_pending = true;
        let wait = self.policy.wait();
        debug!(script = %self.script_name, wait_ms = wait.as_millis() as u64, "restart scheduled");
        self.schedule(wait, Internal::RestartDue);
    }

    async fn on_restart_due(&mut self) {
        self.restart_pending = false;
        if self.forcekill || self.child.is_some() {
            return;
        }
        if self.policy.next_attempt().is_err() {
            self.sinks.errlog.error(&format!(
                "Too many restarts. {} will not be restarted because the maximum number of total restarts has been exceeded.",
                self.config.script.display()
            ));
            self.fail(RestartLimit::Retries);
            return;
        }
        if let Err(e) = self.launch().await {
            warn!(script = %self.script_name, error = %e, "scheduled restart skipped");
        }
    }

    fn fail(&mut self, limit: RestartLimit) {
        self.emitter.emit(Event::TooManyRestarts(self.config.script.clone()));
        self.termination = Some(Termination::TooManyRestarts(limit));
    }

    fn on_child_exit(&mut self, info: ExitInfo) {
        let Some(child) = self.child.take() else {
            return;
        };
        self.report_exit(&info);

        if self.config.abort_on_error && !info.success() && !child.kill_requested {
            let code = info.code.map_or_else(|| info.to_string(), |code| code.to_string());
            self.sinks
                .errlog
                .error(&format!("{} exited with error code {}", self.script_name, code));
            self.emitter.emit(Event::Aborted(self.config.script.clone()));
            self.termination = Some(Termination::Aborted { code: info.code });
            return;
        }

        self.monitor();
    }

    fn report_exit(&self, info: &ExitInfo) {
        self.emitter.emit(Event::Exit(self.config.script.clone()));
        self.sinks
            .syslog
            .info(&format!("{} stopped running ({}).", self.script_name, info));
    }

    async fn on_child_message(&mut self, generation: u64, msg: Value) {
        self.emitter.emit(Event::Message(msg.clone()));
        let Some(command) = ControlCommand::parse(&msg) else {
            self.emitter.emit(Event::ChildMessage(msg));
            return;
        };
        if generation != self.generation {
            debug!(command = command.as_str(), "ignoring command from a replaced child");
            return;
        }

        match command {
            ControlCommand::Stop => {
                self.sinks
                    .syslog
                    .info("Script stopped itself by sending a STOP event to the supervisor.");
                self.enable_monitoring = false;
                self.kill_child_process().await;
            }
            ControlCommand::Start => {
                self.sinks
                    .syslog
                    .info("Script started itself by sending a START event to the supervisor.");
                if let Err(e) = self.launch().await {
                    self.sinks.errlog.warn(&format!("START ignored: {e}"));
                }
            }
            ControlCommand::Restart => {
                self.sinks
                    .syslog
                    .info("Script restarted itself by sending a RESTART event to the supervisor.");
                if let Err(e) = self.restart_child().await {
                    self.sinks.errlog.warn(&format!("RESTART failed: {e}"));
                }
            }
        }
    }

    async fn on_watch(&mut self, trigger: WatchTrigger) {
        match trigger {
            WatchTrigger::Changed => {
                self.emitter.emit(Event::ScriptChanged);
                self.sinks
                    .syslog
                    .info("The script was modified. Automatically restarting the process.");
                if let Some(child) = self.child.as_mut() {
                    child.request_kill();
                }
            }
            WatchTrigger::Removed => {
                if let Some(watcher) = self.watcher.take() {
                    watcher.stop();
                }
                self.emitter.emit(Event::ScriptDeleted);
                self.sinks.errlog.error(&format!(
                    "{} was removed. The file can no longer run as a background process.",
                    self.config.script.display()
                ));
                self.enable_monitoring = false;
                self.kill_child_process().await;
            }
        }
    }

    /// Replaces the running child: kill it without going through monitor, then launch.
    async fn restart_child(&mut self) -> Result<(), SupervisorError> {
        self.enable_monitoring = false;
        if let Some(child) = self.child.take() {
            let info = child.terminate().await;
            self.report_exit(&info);
        }
        self.enable_monitoring = true;
        self.launch().await
    }

    fn send_message(&self, msg: Value) -> Result<(), SupervisorError> {
        let child = self.child.as_ref().ok_or(SupervisorError::NoChild)?;
        let line = protocol::encode_line(&msg)?;
        child
            .outbox
            .send(line)
            .map_err(|_| SupervisorError::Channel(io::ErrorKind::BrokenPipe.into()))
    }

    /*
        @@@
        @kill_child_process();
        . Sets forcekill first so no pending timer or command can launch again.
        . Kills the owned child (SIGTERM, then SIGKILL after stop_timeout) and waits for it.
        . Ends the supervisor with Termination::Shutdown; release() closes the socket.
    */
    async fn kill_child_process(&mut self) {
        self.forcekill = true;
        if let Some(child) = self.child.take() {
            let info = child.terminate().await;
            self.report_exit(&info);
            let mut msg = format!(
                "Process forcibly closed with code {}",
                info.code.map_or_else(|| String::from("-"), |code| code.to_string())
            );
            if let Some(signal) = info.signal_name() {
                msg.push_str(&format!(", using {signal} signal."));
            }
            self.sinks.syslog.info(&msg);
        }
        self.termination = Some(Termination::Shutdown);
    }

    async fn release(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(child) = self.child.take() {
            let info = child.terminate().await;
            self.report_exit(&info);
        }
        if let Some(socket) = self.socket.take() {
            socket.close(&self.emitter, &self.sinks).await;
        }
    }

    fn status(&self) -> Status {
        let window_opened_at = self.policy.start_time().map(|opened| {
            let age = Instant::now().saturating_duration_since(opened);
            Local::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
        });
        Status {
            pid: self.child.as_ref().and_then(|c| c.pid),
            port: self.port.get().copied(),
            starts: self.policy.starts(),
            attempts: self.policy.attempts(),
            wait: self.policy.wait(),
            window_opened_at,
            monitoring: self.enable_monitoring,
            forcekill: self.forcekill,
        }
    }
}

async fn child_exit(child: &mut Option<ChildProcess>) -> ExitInfo {
    match child {
        Some(child) => (&mut child.exit_rx).await.unwrap_or_default(),
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn forward_output<R>(reader: R, stream: Stream, emitter: Emitter, sinks: Sinks)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(&['\r', '\n'][..]).to_string();
                    match stream {
                        Stream::Stdout => {
                            sinks.syslog.info(&line);
                            emitter.emit(Event::Stdout(line));
                        }
                        Stream::Stderr => {
                            sinks.errlog.error(&line);
                            emitter.emit(Event::Stderr(line));
                        }
                    }
                }
                Err(e) => {
                    debug!(?stream, error = %e, "output stream closed");
                    break;
                }
            }
        }
    });
}

async fn wait_for_exit(
    mut child: Child,
    pid: Option<u32>,
    grace: Duration,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitInfo>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => stop_child(&mut child, pid, grace).await,
    };
    let _ = exit_tx.send(ExitInfo::from_wait(status));
}

/*
    @@@
    @stop_child();
    . Sends SIGTERM and gives the child `grace` to exit on its own.
    . Falls back to SIGKILL once the grace period is over.
*/
async fn stop_child(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(pid) = pid {
        info!(pid, signal = ?Signal::SIGTERM, "sending stop signal");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            error!(pid, error = %e, "failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?pid, "sent SIGKILL after timeout");
            child.kill().await?;
            child.wait().await
        }
    }
}
