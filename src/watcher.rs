use crate::config::{WatchMode, WatchSettings};
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Keeps a running watcher alive; dropping it stops the watch.
pub enum WatcherHandle {
    Native {
        _watcher: RecommendedWatcher,
        _thread: thread::JoinHandle<()>,
    },
    Poll {
        task: tokio::task::JoinHandle<()>,
    },
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let WatcherHandle::Poll { task } = self {
            task.abort();
        }
    }
}

/// Fires `trigger` once per settled burst of changes to the slots document.
pub struct ConfigWatcher {
    config_path: PathBuf,
    settings: WatchSettings,
    trigger: Arc<Notify>,
}

impl ConfigWatcher {
    pub fn new(config_path: PathBuf, settings: WatchSettings, trigger: Arc<Notify>) -> Self {
        Self {
            config_path,
            settings,
            trigger,
        }
    }

    /// Start in the configured mode, falling back to polling when native
    /// events are unavailable. Must be called inside a tokio runtime.
    pub fn start(self) -> WatcherHandle {
        match self.settings.mode {
            WatchMode::Native => match self.start_native() {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Native file watching unavailable ({:#}); polling instead", e);
                    self.start_poll()
                }
            },
            WatchMode::Poll => self.start_poll(),
        }
    }

    fn start_native(&self) -> Result<WatcherHandle> {
        // The document is replaced by rename, so watch its directory rather
        // than the file itself.
        let dir = watch_dir(&self.config_path);
        let file_name = self
            .config_path
            .file_name()
            .context("Config path has no file name")?
            .to_os_string();

        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        let debounce = self.settings.debounce();
        let trigger = self.trigger.clone();
        let is_relevant = move |event: &Event| {
            is_mutation(&event.kind)
                && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
        };
        let thread = thread::spawn(move || debounce_loop(rx, is_relevant, debounce, &trigger));

        info!(
            "Watching {} for changes (native, {}ms debounce)",
            self.config_path.display(),
            debounce.as_millis()
        );
        Ok(WatcherHandle::Native {
            _watcher: watcher,
            _thread: thread,
        })
    }

    fn start_poll(&self) -> WatcherHandle {
        let path = self.config_path.clone();
        let interval = self.settings.poll_interval();
        let debounce = self.settings.debounce();
        let trigger = self.trigger.clone();

        info!(
            "Watching {} for changes (poll every {}ms)",
            path.display(),
            interval.as_millis()
        );
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = read_contents(&path).await;
            let mut changed_at: Option<Instant> = None;
            loop {
                ticker.tick().await;
                let current = read_contents(&path).await;
                if current != last {
                    last = current;
                    changed_at = Some(Instant::now());
                    continue;
                }
                if changed_at.is_some_and(|t| t.elapsed() >= debounce) {
                    changed_at = None;
                    debug!("Config change settled; triggering reconcile");
                    trigger.notify_one();
                }
            }
        });
        WatcherHandle::Poll { task }
    }
}

/// Block on relevant events, then drain until `debounce` passes with no
/// relevant event, then fire once. Returns when the sender side is dropped.
fn debounce_loop<F>(rx: mpsc::Receiver<Event>, is_relevant: F, debounce: Duration, trigger: &Notify)
where
    F: Fn(&Event) -> bool,
{
    loop {
        match rx.recv() {
            Ok(event) => {
                if !is_relevant(&event) {
                    continue;
                }
                debug!("Config event: {:?}", event.kind);
            }
            Err(_) => return,
        }

        // Irrelevant events (lock and temp files) are consumed without
        // extending the deadline.
        let mut deadline = Instant::now() + debounce;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(event) => {
                    if is_relevant(&event) {
                        deadline = Instant::now() + debounce;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    trigger.notify_one();
                    return;
                }
            }
        }

        trigger.notify_one();
    }
}

fn watch_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Returns true for event kinds that represent actual filesystem mutations
/// (create, modify, remove, rename). Access and Other events are ignored.
fn is_mutation(kind: &notify::EventKind) -> bool {
    matches!(
        kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    )
}

async fn read_contents(path: &Path) -> Option<Vec<u8>> {
    tokio::fs::read(path).await.ok()
}
