// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The scratch state file.
//!
//! A small JSON document under `elm-stuff/` remembers the WebSocket port,
//! the security token, and per-target UI settings between runs. It is safe
//! to delete at any time: the next run picks a new port and defaults.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Write,
    path::Path,
};

use crate::project::{BrowserUiPosition, CompilationMode, Project};

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub web_socket_token: Option<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, PersistedTarget>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTarget {
    pub compilation_mode: CompilationMode,
    pub browser_ui_position: BrowserUiPosition,
    pub open_error_overlay: bool,
}

/// Read the state file. Missing or corrupt files yield the defaults; a
/// half-written state file must never prevent startup.
pub fn read(path: &Path) -> PersistedState {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => PersistedState::default(),
    }
}

/// Write the state file atomically via a temp sibling.
pub fn write(path: &Path, state: &PersistedState) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Capture the current per-target UI settings of a project.
pub fn snapshot(project: &Project, port: u16, token: &str) -> PersistedState {
    let mut targets = BTreeMap::new();
    for target in project.targets() {
        targets.insert(
            target.name.clone(),
            PersistedTarget {
                compilation_mode: target.compilation_mode,
                browser_ui_position: target.browser_ui_position.clone(),
                open_error_overlay: target.open_error_overlay,
            },
        );
    }
    PersistedState {
        port: Some(port),
        web_socket_token: Some(token.to_owned()),
        targets,
    }
}

/// Apply persisted UI settings onto a freshly loaded project.
pub fn apply(project: &mut Project, state: &PersistedState) {
    for target in project.targets_mut() {
        if let Some(persisted) = state.targets.get(&target.name) {
            target.compilation_mode = persisted.compilation_mode;
            target.browser_ui_position = persisted.browser_ui_position.clone();
            target.open_error_overlay = persisted.open_error_overlay;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> PersistedState {
        let mut targets = BTreeMap::new();
        targets.insert(
            "app".to_owned(),
            PersistedTarget {
                compilation_mode: CompilationMode::Debug,
                browser_ui_position: BrowserUiPosition("TopRight".into()),
                open_error_overlay: true,
            },
        );
        PersistedState {
            port: Some(12345),
            web_socket_token: Some("cafe".into()),
            targets,
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("elm-stuff").join("elm-watch-state.json");
        let state = sample();
        write(&path, &state).unwrap();
        assert_eq!(read(&path), state);
    }

    #[test]
    fn round_trips_through_json_text() {
        let state = sample();
        let json = serde_json::to_string(&state).unwrap();
        let back: PersistedState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn uses_the_documented_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["port"], 12345);
        assert_eq!(json["webSocketToken"], "cafe");
        assert_eq!(json["targets"]["app"]["compilationMode"], "debug");
        assert_eq!(json["targets"]["app"]["browserUiPosition"], "TopRight");
        assert_eq!(json["targets"]["app"]["openErrorOverlay"], true);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let state = read(&tmp.path().join("nope.json"));
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(read(&path), PersistedState::default());
    }
}
