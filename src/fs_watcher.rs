use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEBOUNCE_DURATION: Duration = Duration::from_millis(300);

/// Called once per changed bundle root after each debounce window.
pub type BundleHandler = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Watches bundle directories and reports bundles that were created or modified.
/// Removals are ignored: thumbnails are only evicted by external tools.
pub struct BundleWatcher {
    watchers: Arc<Mutex<HashMap<PathBuf, RecommendedWatcher>>>,
    handler: BundleHandler,
}

impl BundleWatcher {
    pub fn new(handler: BundleHandler) -> Self {
        Self {
            watchers: Arc::new(Mutex::new(HashMap::new())),
            handler,
        }
    }

    pub fn start_watching(&self, dir: &Path) -> Result<(), String> {
        if !dir.exists() {
            return Err("Path does not exist".to_string());
        }
        if !dir.is_dir() {
            return Err("Path is not a directory".to_string());
        }

        let watch_dir = dir.to_path_buf();
        {
            let watchers = self
                .watchers
                .lock()
                .map_err(|_| "Watcher registry is poisoned".to_string())?;
            if watchers.contains_key(&watch_dir) {
                return Ok(()); // Already watching
            }
        }

        let (tx, rx) = mpsc::channel();
        let config = Config::default()
            .with_poll_interval(Duration::from_millis(500))
            .with_compare_contents(false);

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx.send(event);
                }
            },
            config,
        )
        .map_err(|e| format!("Failed to create watcher: {}", e))?;

        // Recursive so that icon changes inside a bundle are seen too
        watcher
            .watch(&watch_dir, RecursiveMode::Recursive)
            .map_err(|e| format!("Failed to start watching: {}", e))?;

        self.watchers
            .lock()
            .map_err(|_| "Watcher registry is poisoned".to_string())?
            .insert(watch_dir.clone(), watcher);

        let handler = self.handler.clone();
        std::thread::spawn(move || debounce_loop(watch_dir, rx, handler));

        log::info!("Watching {} for bundles", dir.display());
        Ok(())
    }

    pub fn stop_watching(&self, dir: &Path) -> Result<(), String> {
        let mut watchers = self
            .watchers
            .lock()
            .map_err(|_| "Watcher registry is poisoned".to_string())?;
        // Dropping the watcher closes the channel and ends the debounce thread
        if watchers.remove(dir).is_some() {
            Ok(())
        } else {
            Err("Path is not being watched".to_string())
        }
    }

    pub fn stop_all_watchers(&self) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.clear();
        }
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watchers
            .lock()
            .map(|watchers| watchers.contains_key(dir))
            .unwrap_or(false)
    }

    pub fn get_watched_paths(&self) -> Vec<PathBuf> {
        self.watchers
            .lock()
            .map(|watchers| watchers.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Batch events within the debounce window instead of dropping them.
fn debounce_loop(watch_dir: PathBuf, rx: mpsc::Receiver<Event>, handler: BundleHandler) {
    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut batch_start: Option<Instant> = None;

    loop {
        let recv_result = if let Some(start) = batch_start {
            let elapsed = start.elapsed();
            if elapsed >= DEBOUNCE_DURATION {
                Err(mpsc::RecvTimeoutError::Timeout)
            } else {
                rx.recv_timeout(DEBOUNCE_DURATION - elapsed)
            }
        } else {
            rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected)
        };

        match recv_result {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                pending.extend(
                    event
                        .paths
                        .iter()
                        .filter_map(|path| bundle_root_for(&watch_dir, path)),
                );
                if batch_start.is_none() && !pending.is_empty() {
                    batch_start = Some(Instant::now());
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for root in pending.drain() {
                    log::debug!("Bundle changed: {}", root.display());
                    handler(root);
                }
                batch_start = None;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("Stopped watching {}", watch_dir.display());
}

/// The entry directly under `watch_dir` that contains `event_path`.
///
/// Hidden entries are skipped so editor swap files and our own temp files
/// never trigger a run.
pub fn bundle_root_for(watch_dir: &Path, event_path: &Path) -> Option<PathBuf> {
    let relative = event_path.strip_prefix(watch_dir).ok()?;
    match relative.components().next()? {
        Component::Normal(name) if !name.to_string_lossy().starts_with('.') => {
            Some(watch_dir.join(name))
        }
        _ => None,
    }
}
