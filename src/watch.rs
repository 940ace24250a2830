use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What happened to the watched script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTrigger {
    Changed,
    /// Deleted or moved away. The watcher stops after reporting it.
    Removed,
}

/// Identity and content markers of the script file between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    ino: u64,
    len: u64,
    mtime: i64,
    mtime_nsec: i64,
}

async fn fingerprint(path: &Path) -> io::Result<Option<Fingerprint>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(Fingerprint {
            ino: meta.ino(),
            len: meta.len(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Polls one script file and reports modifications and removal.
pub struct ScriptWatcher {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ScriptWatcher {
    pub fn spawn<F>(path: PathBuf, interval: Duration, on_trigger: F) -> Self
    where
        F: Fn(WatchTrigger) + Send + 'static,
    {
        let watched = path.clone();
        let task = tokio::spawn(async move {
            let mut last = match fingerprint(&watched).await {
                Ok(Some(fp)) => fp,
                Ok(None) => {
                    on_trigger(WatchTrigger::Removed);
                    return;
                }
                Err(e) => {
                    warn!(script = %watched.display(), error = %e, "cannot stat script, not watching");
                    return;
                }
            };
            debug!(script = %watched.display(), "watching script");

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match fingerprint(&watched).await {
                    Ok(Some(fp)) if fp != last => {
                        last = fp;
                        on_trigger(WatchTrigger::Changed);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        on_trigger(WatchTrigger::Removed);
                        return;
                    }
                    Err(e) => {
                        warn!(script = %watched.display(), error = %e, "cannot stat script");
                    }
                }
            }
        });
        Self { path, task }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn collector() -> (impl Fn(WatchTrigger) + Send + 'static, mpsc::UnboundedReceiver<WatchTrigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |t| { let _ = tx.send(t); }, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WatchTrigger>) -> WatchTrigger {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no trigger within 5s")
            .expect("watcher hung up")
    }

    #[tokio::test]
    async fn reports_modification_then_removal() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("app.sh");
        std::fs::write(&script, "echo one\n").unwrap();

        let (on_trigger, mut rx) = collector();
        let watcher = ScriptWatcher::spawn(script.clone(), Duration::from_millis(20), on_trigger);
        assert_eq!(watcher.path(), script.as_path());
        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&script).unwrap();
        file.write_all(b"echo two\n").unwrap();
        drop(file);
        assert_eq!(next(&mut rx).await, WatchTrigger::Changed);

        std::fs::remove_file(&script).unwrap();
        assert_eq!(next(&mut rx).await, WatchTrigger::Removed);
    }

    #[tokio::test]
    async fn missing_script_reports_removed_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (on_trigger, mut rx) = collector();
        let _watcher =
            ScriptWatcher::spawn(dir.path().join("gone.sh"), Duration::from_millis(20), on_trigger);
        assert_eq!(next(&mut rx).await, WatchTrigger::Removed);
    }

    #[tokio::test]
    async fn untouched_script_stays_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("app.sh");
        std::fs::write(&script, "echo one\n").unwrap();
        let (on_trigger, mut rx) = collector();
        let watcher = ScriptWatcher::spawn(script, Duration::from_millis(10), on_trigger);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        watcher.stop();
    }
}
