//! Project watcher for the dev loop.
//!
//! A debounced `notify` watcher over the project root. Changes below the
//! output directory, inside dot-prefixed entries or under `node_modules`
//! are dropped, so writing a build never schedules the next one.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use tokio::sync::mpsc;

use crate::CrxError;

/// Directory names that never feed a build.
const IGNORED_DIRS: &[&str] = &["node_modules"];

pub struct ProjectWatcher {
    /// Stops watching when dropped.
    _debouncer: Debouncer<notify::RecommendedWatcher, FileIdMap>,
    changes: mpsc::UnboundedReceiver<Vec<PathBuf>>,
}

impl ProjectWatcher {
    /// Watch `root` recursively, ignoring everything under `out_dir`.
    pub fn new(root: &Path, out_dir: &Path, debounce: Duration) -> Result<Self, CrxError> {
        // Events report canonical paths on some platforms.
        let watched = root.canonicalize()?;
        let out_dir = match out_dir.strip_prefix(root) {
            Ok(relative) => watched.join(relative),
            Err(_) => out_dir.to_path_buf(),
        };

        let (tx, changes) = mpsc::unbounded_channel();
        let filter_root = watched.clone();
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events
                        .into_iter()
                        .filter(|e| !matches!(e.event.kind, EventKind::Access(_)))
                        .flat_map(|e| e.event.paths)
                        .filter(|path| !is_ignored(&filter_root, &out_dir, path))
                        .collect();
                    if !paths.is_empty() {
                        // The receiver is gone once the dev loop exits.
                        let _ = tx.send(paths);
                    }
                }
                Err(errors) => {
                    for error in errors {
                        tracing::warn!(%error, "file watcher error");
                    }
                }
            }
        })?;
        debouncer.watcher().watch(&watched, RecursiveMode::Recursive)?;
        tracing::debug!(root = %watched.display(), "watching project");

        Ok(Self {
            _debouncer: debouncer,
            changes,
        })
    }

    /// Wait for the next batch of relevant changes, coalescing whatever else
    /// is already queued. `None` once the watcher has stopped.
    pub async fn next_change(&mut self) -> Option<Vec<PathBuf>> {
        let mut paths = self.changes.recv().await?;
        while let Ok(more) = self.changes.try_recv() {
            paths.extend(more);
        }
        paths.sort();
        paths.dedup();
        Some(paths)
    }
}

/// Whether a change to `path` can be skipped.
pub fn is_ignored(root: &Path, out_dir: &Path, path: &Path) -> bool {
    if path.starts_with(out_dir) {
        return true;
    }
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())
        }
        _ => false,
    })
}
