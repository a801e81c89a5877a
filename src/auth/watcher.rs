use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// Quiet period after the last qualifying event before the callback fires.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// Reload callbacks report errors, which are logged and never propagated.
pub type ReloadCallback =
    Box<dyn Fn() -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Watches a single file for edits and invokes a callback once per burst
/// of changes.
///
/// The watch is placed on the file's containing directory, not the file
/// itself: editors commonly write a new file and rename it over the old
/// one, which orphans a watch on the original inode.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `path`. Must be called from within a tokio runtime.
    pub fn watch(path: &Path, callback: ReloadCallback) -> Result<Self, notify::Error> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };
        let file_name: OsString = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        let watched = file_name.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if qualifies(&event, &watched) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "file watch error"),
            })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        tracing::debug!(dir = %dir.display(), file = ?file_name, "watching credential file");

        let task = tokio::spawn(debounce_loop(rx, callback));
        Ok(Self { watcher, task })
    }

    /// Release the watch and stop the debounce task.
    pub fn stop(self) {
        drop(self)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        // Dropping the watcher closes the event channel; abort in case the
        // task is mid-debounce.
        let _ = &self.watcher;
        self.task.abort();
    }
}

/// Create or write events targeting the watched file name.
fn qualifies(event: &Event, file_name: &OsString) -> bool {
    if file_name.is_empty() {
        return false;
    }
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Coalesce bursts: each qualifying event restarts the debounce timer;
/// the callback runs once per quiet period.
async fn debounce_loop(mut rx: mpsc::UnboundedReceiver<()>, callback: ReloadCallback) {
    while rx.recv().await.is_some() {
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        if let Err(e) = callback() {
            tracing::warn!(error = %e, "reload callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: Arc<AtomicUsize>) -> ReloadCallback {
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn rapid_writes_coalesce_into_one_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.yaml");
        std::fs::write(&path, "tokens: {}\n").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let watcher = FileWatcher::watch(&path, counting_callback(counter.clone())).unwrap();

        for i in 0..5 {
            std::fs::write(&path, format!("tokens: {{}} # {i}\n")).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one callback");
        assert!(fired < 5, "expected rapid writes to coalesce, got {fired}");
        watcher.stop();
    }

    #[tokio::test]
    async fn rename_over_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        std::fs::write(&path, "users: {}\n").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let _watcher = FileWatcher::watch(&path, counting_callback(counter.clone())).unwrap();

        // Editor-style replace: write a sibling, rename over the target.
        let tmp = dir.path().join(".users.yaml.tmp");
        std::fs::write(&tmp, "users: {}\n# edited\n").unwrap();
        std::fs::rename(&tmp, &path).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn unrelated_files_do_not_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.yaml");
        std::fs::write(&path, "tokens: {}\n").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let _watcher = FileWatcher::watch(&path, counting_callback(counter.clone())).unwrap();

        std::fs::write(dir.path().join("other.yaml"), "users: {}\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_errors_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.yaml");
        std::fs::write(&path, "tokens: {}\n").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let watcher = FileWatcher::watch(
            &path,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            }),
        )
        .unwrap();

        std::fs::write(&path, "tokens: {}\n# 1\n").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        std::fs::write(&path, "tokens: {}\n# 2\n").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        // The watcher keeps running after a failing callback.
        assert!(counter.load(Ordering::SeqCst) >= 2);
        watcher.stop();
    }
}
