use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

/// Where the supervisor writes its own messages and the child's output.
///
/// Anything that behaves like a console works: `info`, `warn`, `error`, and a
/// plain `log` line.
pub trait LogSink: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
    fn log(&self, msg: &str) {
        self.info(msg);
    }
}

/// Default sink: every line becomes a `tracing` event tagged with the sink name.
#[derive(Debug, Clone)]
pub struct TracingSink {
    name: &'static str,
}

impl TracingSink {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new("syslog")
    }
}

impl LogSink for TracingSink {
    fn info(&self, msg: &str) {
        tracing::info!(sink = self.name, "{}", msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(sink = self.name, "{}", msg);
    }

    fn error(&self, msg: &str) {
        tracing::error!(sink = self.name, "{}", msg);
    }

    fn log(&self, msg: &str) {
        tracing::debug!(sink = self.name, "{}", msg);
    }
}

/// The pair of sinks a supervisor writes to. `errlog` falls back to `syslog`.
#[derive(Clone)]
pub struct Sinks {
    pub syslog: Arc<dyn LogSink>,
    pub errlog: Arc<dyn LogSink>,
}

impl Sinks {
    pub fn new(syslog: Option<Arc<dyn LogSink>>, errlog: Option<Arc<dyn LogSink>>) -> Self {
        let syslog = syslog.unwrap_or_else(|| Arc::new(TracingSink::default()));
        let errlog = errlog.unwrap_or_else(|| syslog.clone());
        Self { syslog, errlog }
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Parses a level name such as `debug`, falling back to INFO.
pub fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}



/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<dir>/supervisor.log) and wraps it in a non-blocking writer.
    . Configures a tracing subscriber to log events at `level` (with timestamps and targets) to that writer.
    . keeps the appender alive by returning the guard.
*/
pub fn logs_tracing(dir: &Path, level: Level) -> WorkerGuard {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "supervisor.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");
    guard
}

/// Foreground variant of [`logs_tracing`]: plain lines on stderr.
pub fn logs_stderr(level: Level) {
    let subscriber = SubscriberBuilder::default()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");
}
