//! Filesystem watcher for `pedia serve`.
//!
//! Changes under the configured watch directories are debounced and handed to
//! the serve loop as [`ServeCommand::FilesChanged`].
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use tokio::sync::mpsc::Sender;

use crate::{error::PediaError, serve::ServeCommand};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Editors and our own atomic writes leave dotfiles behind; they never matter.
pub fn is_relevant(path: &Path) -> bool {
    !path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.') || name.ends_with('~'))
        .unwrap_or(true)
}

/// Keeps the debouncer alive; dropping it stops watching.
pub struct InputWatcher {
    debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    roots: Vec<PathBuf>,
}

impl InputWatcher {
    /// Start watching `roots`. Roots that do not exist are skipped with a
    /// warning.
    pub fn start(roots: &[PathBuf], commands: Sender<ServeCommand>) -> Result<InputWatcher, PediaError> {
        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let mut changed: Vec<PathBuf> = events
                        .iter()
                        .filter(|event| {
                            matches!(
                                event.event.kind,
                                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                            )
                        })
                        .flat_map(|event| event.paths.iter())
                        .filter(|path| is_relevant(path))
                        .cloned()
                        .collect();
                    changed.sort();
                    changed.dedup();
                    if changed.is_empty() {
                        return;
                    }
                    tracing::info!("[Watcher] {} path(s) changed", changed.len());
                    // the debouncer calls us on its own thread, outside the runtime
                    if commands
                        .blocking_send(ServeCommand::FilesChanged(changed))
                        .is_err()
                    {
                        tracing::debug!("[Watcher] serve loop is gone; dropping change");
                    }
                }
                Err(errors) => {
                    tracing::error!("[Watcher] notify returned errors: {:?}", errors);
                }
            }
        })?;

        let mut watched = Vec::new();
        for root in roots.iter() {
            if !root.is_dir() {
                tracing::warn!("[Watcher] not watching missing directory {}", root.display());
                continue;
            }
            debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
            tracing::debug!("[Watcher] watching {}", root.display());
            watched.push(root.clone());
        }
        Ok(InputWatcher {
            debouncer,
            roots: watched,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn stop(mut self) {
        for root in self.roots.iter() {
            if let Err(e) = self.debouncer.watcher().unwatch(root) {
                tracing::debug!("[Watcher] unwatch {} failed: {e}", root.display());
            }
        }
    }
}
