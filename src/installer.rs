//! Service registration interface.
//!
//! Registering the script as an OS service is platform work this crate does not
//! do. [`ServiceInstaller`] is the seam a platform backend plugs into, and
//! [`PlaceholderInstaller`] only reports what it was asked to do.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::InstallerError;

/// Notifications from an installer, named like the supervisor's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerEvent {
    Install(PathBuf),
    Uninstall,
    Start,
    Stop,
}

impl InstallerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InstallerEvent::Install(_) => "install",
            InstallerEvent::Uninstall => "uninstall",
            InstallerEvent::Start => "start",
            InstallerEvent::Stop => "stop",
        }
    }
}

#[async_trait]
pub trait ServiceInstaller: Send + Sync {
    /// Service id derived from its display name.
    fn id(&self) -> &str;

    /// Installs the service, keeping its files in `dir`.
    async fn install(&self, dir: &Path) -> Result<(), InstallerError>;
    async fn uninstall(&self) -> Result<(), InstallerError>;
    async fn start(&self) -> Result<(), InstallerError>;
    async fn stop(&self) -> Result<(), InstallerError>;

    async fn restart(&self) -> Result<(), InstallerError> {
        self.stop().await?;
        self.start().await
    }

    async fn exists(&self) -> Result<bool, InstallerError>;
}

/// Service id: word characters of `name`, lowercased. `"Hello World"` becomes `"helloworld"`.
pub fn service_id(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Installer that registers nothing and only emits [`InstallerEvent`]s.
pub struct PlaceholderInstaller {
    name: String,
    id: String,
    script: PathBuf,
    events: broadcast::Sender<InstallerEvent>,
}

impl PlaceholderInstaller {
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Result<Self, InstallerError> {
        let name = name.into();
        let id = service_id(&name);
        if id.is_empty() {
            return Err(InstallerError::MissingName);
        }
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            name,
            id,
            script: script.into(),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstallerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: InstallerEvent) {
        info!(service = %self.id, script = %self.script.display(), event = event.name(), "installer placeholder");
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ServiceInstaller for PlaceholderInstaller {
    fn id(&self) -> &str {
        &self.id
    }

    async fn install(&self, dir: &Path) -> Result<(), InstallerError> {
        self.emit(InstallerEvent::Install(dir.to_path_buf()));
        Ok(())
    }

    async fn uninstall(&self) -> Result<(), InstallerError> {
        self.emit(InstallerEvent::Uninstall);
        Ok(())
    }

    async fn start(&self) -> Result<(), InstallerError> {
        self.emit(InstallerEvent::Start);
        Ok(())
    }

    async fn stop(&self) -> Result<(), InstallerError> {
        self.emit(InstallerEvent::Stop);
        Ok(())
    }

    async fn exists(&self) -> Result<bool, InstallerError> {
        Err(InstallerError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_strips_non_word_characters() {
        assert_eq!(service_id("Hello World!"), "helloworld");
        assert_eq!(service_id("my_app-2"), "my_app2");
        assert!(matches!(
            PlaceholderInstaller::new(" - ", "/srv/app.sh"),
            Err(InstallerError::MissingName)
        ));
    }

    #[tokio::test]
    async fn restart_is_stop_then_start() {
        let installer = PlaceholderInstaller::new("Hello World", "/srv/app.sh").unwrap();
        assert_eq!(installer.id(), "helloworld");
        let mut events = installer.subscribe();

        installer.install(Path::new("/srv")).await.unwrap();
        installer.restart().await.unwrap();
        installer.uninstall().await.unwrap();

        let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, ["install", "stop", "start", "uninstall"]);
    }

    #[tokio::test]
    async fn exists_is_unsupported() {
        let installer = PlaceholderInstaller::new("svc", "/srv/app.sh").unwrap();
        assert!(matches!(installer.exists().await, Err(InstallerError::Unsupported)));
    }
}
