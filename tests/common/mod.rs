#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use script_supervisor::{Event, LogSink, SupervisorBuilder, SupervisorConfig, SupervisorHandle, Termination};
use tokio::sync::broadcast::{self, error::RecvError};

pub const LIMIT: Duration = Duration::from_secs(10);

/// Log sink that remembers every line, prefixed with its level.
#[derive(Default)]
pub struct Recorder {
    lines: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    fn push(&self, level: &str, msg: &str) {
        self.lines.lock().unwrap().push(format!("{level}: {msg}"));
    }
}

impl LogSink for Recorder {
    fn info(&self, msg: &str) {
        self.push("info", msg);
    }

    fn warn(&self, msg: &str) {
        self.push("warn", msg);
    }

    fn error(&self, msg: &str) {
        self.push("error", msg);
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Runs `script` through /bin/sh with short delays suited to tests.
pub fn sh_config(script: &Path) -> SupervisorConfig {
    let mut cfg = SupervisorConfig::new(script);
    cfg.interpreter = Some(String::from("/bin/sh"));
    cfg.wait = 0.05;
    cfg.grow = 0.0;
    cfg.stop_timeout = 1.0;
    cfg
}

pub struct Running {
    pub handle: SupervisorHandle,
    /// Subscribed before the supervisor started, so nothing is missed.
    pub events: broadcast::Receiver<Event>,
    pub log: Arc<Recorder>,
}

/// Builds and runs a supervisor with a recording sink. Does not launch.
pub fn start(builder: SupervisorBuilder) -> Running {
    let log = Arc::new(Recorder::default());
    let supervisor = builder
        .with_syslog(log.clone())
        .with_event_capacity(1024)
        .build()
        .unwrap();
    let events = supervisor.handle().subscribe();
    Running {
        handle: supervisor.run(),
        events,
        log,
    }
}

/// Skips events until one named `name` arrives.
pub async fn next_named(events: &mut broadcast::Receiver<Event>, name: &str) -> Event {
    tokio::time::timeout(LIMIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.name() == name => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed before `{name}`"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no `{name}` event within {LIMIT:?}"))
}

pub async fn finish(handle: &SupervisorHandle) -> Termination {
    tokio::time::timeout(LIMIT, handle.wait())
        .await
        .expect("supervisor did not terminate in time")
        .expect("supervisor vanished without a termination")
}

/// Everything still queued on `events`.
pub fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

pub fn count(events: &[Event], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}
