use std::{io, path::PathBuf};

use thiserror::Error;

/// Problems loading or validating a [`SupervisorConfig`](crate::parse::SupervisorConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("script path must be absolute, got {0}")]
    RelativeScript(PathBuf),
    #[error("`{0}` must be a finite number")]
    NotFinite(&'static str),
    #[error("`{0}` is too large to be a duration in seconds")]
    OutOfRange(&'static str),
}

/// Errors surfaced to callers of the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no child process is running")]
    NoChild,
    #[error("a child process is already running (pid {0:?})")]
    ChildAlreadyRunning(Option<u32>),
    #[error("supervisor has shut down")]
    Closed,
    #[error("failed to spawn child: {0}")]
    Spawn(#[source] io::Error),
    #[error("control channel error: {0}")]
    Channel(#[source] io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("socket listener error: {0}")]
    Socket(#[source] io::Error),
}

/// Errors from a [`ServiceInstaller`](crate::installer::ServiceInstaller).
#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("service registration is not supported on this platform")]
    Unsupported,
    #[error("service name is required")]
    MissingName,
}
