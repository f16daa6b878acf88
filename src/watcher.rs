// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! Filesystem change watching.
//!
//! The notify debouncer coalesces raw editor write bursts over a small
//! window; everything else (per-event-kind debouncing, classification,
//! scheduling) belongs to the controller. Events are turned into
//! added/changed/removed by comparing against a seen-set built from an
//! initial scan of the watch root.

use notify_debouncer_mini::{
    new_debouncer, notify, DebounceEventHandler, DebounceEventResult, DebouncedEventKind,
    Debouncer,
};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use anyhow::Context;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatcherEventKind {
    Added,
    Changed,
    Removed,
}

impl std::fmt::Display for WatcherEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WatcherEventKind::Added => "added",
            WatcherEventKind::Changed => "changed",
            WatcherEventKind::Removed => "removed",
        })
    }
}

#[derive(Clone, Debug)]
pub struct RawWatcherEvent {
    pub kind: WatcherEventKind,
    pub path: PathBuf,
}

#[derive(Debug)]
pub enum WatcherNotification {
    Event(RawWatcherEvent),
    /// The watcher itself broke; the run must end with a handled error.
    FatalError(String),
}

/// Directories we never look inside. The compiler scratch directory is
/// special: its own removal is interesting, its contents are not.
fn is_ignored_dir_name(name: &str) -> bool {
    name == "node_modules" || name.starts_with('.')
}

fn is_scratch_dir_name(name: &str) -> bool {
    name == "elm-stuff"
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Should an event for `path` be forwarded at all?
fn is_watchable(path: &Path, watch_root: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(watch_root) else {
        return false;
    };
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        let name = component.as_os_str().to_str().unwrap_or("");
        if is_ignored_dir_name(name) {
            return false;
        }
        // The scratch dir itself is watchable; anything under it is not.
        if is_scratch_dir_name(name) && components.peek().is_some() {
            return false;
        }
    }
    true
}

struct EventForwarder {
    watch_root: PathBuf,
    seen: HashSet<PathBuf>,
    tx: mpsc::UnboundedSender<WatcherNotification>,
}

impl EventForwarder {
    fn classify(&mut self, path: PathBuf) -> Option<RawWatcherEvent> {
        let exists = path.exists();
        let was_seen = self.seen.contains(&path);
        let kind = match (exists, was_seen) {
            (true, true) => WatcherEventKind::Changed,
            (true, false) => {
                self.seen.insert(path.clone());
                WatcherEventKind::Added
            }
            (false, true) => {
                self.seen.remove(&path);
                WatcherEventKind::Removed
            }
            // Created and deleted within the debounce window.
            (false, false) => WatcherEventKind::Removed,
        };
        Some(RawWatcherEvent { kind, path })
    }
}

impl DebounceEventHandler for EventForwarder {
    fn handle_event(&mut self, result: DebounceEventResult) {
        match result {
            Ok(events) => {
                for event in events {
                    // AnyContinuous events precede a final Any once the
                    // writes stop; only the final one matters.
                    if !matches!(event.kind, DebouncedEventKind::Any) {
                        continue;
                    }
                    if !is_watchable(&event.path, &self.watch_root) {
                        continue;
                    }
                    if let Some(raw) = self.classify(event.path) {
                        let _ = self.tx.send(WatcherNotification::Event(raw));
                    }
                }
            }
            Err(errors) => {
                let rendered = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                let _ = self.tx.send(WatcherNotification::FatalError(rendered));
            }
        }
    }
}

/// A running watcher. Dropping it stops watching.
pub struct Watcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

/// Scan the watch root so the first events can be classified as
/// added/changed/removed rather than all looking new. Ignored directories
/// are not entered; scratch dirs are recorded but not entered either.
fn initial_seen_set(watch_root: &Path) -> HashSet<PathBuf> {
    let mut seen = HashSet::new();
    let mut walker = WalkDir::new(watch_root).into_iter();
    loop {
        let entry = match walker.next() {
            None => break,
            Some(Err(_)) => continue,
            Some(Ok(entry)) => entry,
        };
        let name = entry.file_name().to_str().unwrap_or("");
        if entry.depth() > 0 && entry.file_type().is_dir() {
            if is_ignored_dir_name(name) {
                walker.skip_current_dir();
                continue;
            }
            if is_scratch_dir_name(name) {
                seen.insert(entry.path().to_owned());
                walker.skip_current_dir();
                continue;
            }
        }
        if entry.depth() > 0 && is_ignored_dir_name(name) {
            continue;
        }
        seen.insert(entry.path().to_owned());
    }
    seen
}

/// Watch `watch_root` recursively, forwarding events into `tx`.
pub fn start(
    watch_root: &Path,
    tx: mpsc::UnboundedSender<WatcherNotification>,
) -> anyhow::Result<Watcher> {
    let forwarder = EventForwarder {
        watch_root: watch_root.to_owned(),
        seen: initial_seen_set(watch_root),
        tx,
    };

    let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, None, forwarder)
        .context("failed to set up the filesystem change notifier")?;

    debouncer
        .watcher()
        .watch(watch_root, notify::RecursiveMode::Recursive)
        .with_context(|| {
            format!("failed to watch directory `{}`", watch_root.display())
        })?;

    Ok(Watcher {
        _debouncer: debouncer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_hidden_and_node_modules() {
        let root = Path::new("/proj");
        assert!(!is_watchable(Path::new("/proj/.git/HEAD"), root));
        assert!(!is_watchable(Path::new("/proj/node_modules/x/y.js"), root));
        assert!(is_watchable(Path::new("/proj/src/Main.elm"), root));
    }

    #[test]
    fn scratch_dir_itself_is_watchable_but_contents_are_not() {
        let root = Path::new("/proj");
        assert!(is_watchable(Path::new("/proj/elm-stuff"), root));
        assert!(!is_watchable(Path::new("/proj/elm-stuff/0.19.1/d.dat"), root));
        assert!(is_watchable(Path::new("/proj/sub/elm-stuff"), root));
    }

    #[test]
    fn paths_outside_the_root_are_dropped() {
        let root = Path::new("/proj");
        assert!(!is_watchable(Path::new("/elsewhere/Main.elm"), root));
    }

    #[tokio::test]
    async fn classifies_against_the_seen_set() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut forwarder = EventForwarder {
            watch_root: PathBuf::from("/proj"),
            seen: HashSet::from([PathBuf::from("/proj/known.elm")]),
            tx,
        };

        // A path that does not exist on disk and was known: removed.
        let event = forwarder
            .classify(PathBuf::from("/proj/known.elm"))
            .unwrap();
        assert_eq!(event.kind, WatcherEventKind::Removed);

        // Same path again, now unknown: still removed (create+delete burst).
        let event = forwarder
            .classify(PathBuf::from("/proj/known.elm"))
            .unwrap();
        assert_eq!(event.kind, WatcherEventKind::Removed);
    }

    #[tokio::test]
    async fn existing_paths_flip_between_added_and_changed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("Main.elm");
        std::fs::write(&file, "module Main exposing (main)\n").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut forwarder = EventForwarder {
            watch_root: tmp.path().to_owned(),
            seen: HashSet::new(),
            tx,
        };

        let event = forwarder.classify(file.clone()).unwrap();
        assert_eq!(event.kind, WatcherEventKind::Added);
        let event = forwarder.classify(file).unwrap();
        assert_eq!(event.kind, WatcherEventKind::Changed);
    }
}
