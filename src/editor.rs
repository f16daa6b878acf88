// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! Opening the user's editor from the browser.
//!
//! The command comes from `ELM_WATCH_OPEN_EDITOR` and runs through the
//! shell with `$file`, `$line`, and `$column` in its environment. Only
//! files inside the project may be opened; anything else coming over the
//! wire is refused.

use std::{path::Path, process::Stdio, time::Duration};
use tokio::process::Command;

use crate::config::absolutize;
use crate::protocol::OpenEditorError;

pub const EDITOR_ENV_VAR: &str = "ELM_WATCH_OPEN_EDITOR";
pub const TIMEOUT_ENV_VAR: &str = "__ELM_WATCH_OPEN_EDITOR_TIMEOUT_MS";
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

fn timeout_ms() -> u64 {
    std::env::var(TIMEOUT_ENV_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

/// Check that `file` stays inside the project and resolve it.
fn resolve_file(watch_root: &Path, file: &str) -> Result<std::path::PathBuf, OpenEditorError> {
    let absolute = absolutize(watch_root, file);
    if !absolute.starts_with(watch_root) {
        return Err(OpenEditorError::InvalidFilePath {
            message: format!("`{file}` is outside the project"),
        });
    }
    if !absolute.is_file() {
        return Err(OpenEditorError::InvalidFilePath {
            message: format!("`{file}` does not exist in the project"),
        });
    }
    Ok(absolute)
}

pub async fn open_editor(
    watch_root: &Path,
    file: &str,
    line: u32,
    column: u32,
) -> Result<(), OpenEditorError> {
    let command = match std::env::var(EDITOR_ENV_VAR) {
        Ok(command) if !command.trim().is_empty() => command,
        _ => return Err(OpenEditorError::EnvNotSet),
    };

    let absolute = resolve_file(watch_root, file)?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c");
    cmd.arg(&command);
    cmd.env("file", &absolute);
    cmd.env("line", line.to_string());
    cmd.env("column", column.to_string());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| OpenEditorError::CommandFailed {
        message: format!("failed to run `{command}`: {e}"),
    })?;

    let output = tokio::time::timeout(
        Duration::from_millis(timeout_ms()),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| OpenEditorError::CommandFailed {
        message: format!("`{command}` timed out after {} ms", timeout_ms()),
    })?
    .map_err(|e| OpenEditorError::CommandFailed {
        message: e.to_string(),
    })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(OpenEditorError::CommandFailed {
            message: format!(
                "`{command}` exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn files_outside_the_project_are_refused() {
        let tmp = TempDir::new().unwrap();
        let err = resolve_file(tmp.path(), "../../etc/passwd").unwrap_err();
        assert!(matches!(err, OpenEditorError::InvalidFilePath { .. }));
    }

    #[test]
    fn missing_files_are_refused() {
        let tmp = TempDir::new().unwrap();
        let err = resolve_file(tmp.path(), "src/Missing.elm").unwrap_err();
        assert!(matches!(err, OpenEditorError::InvalidFilePath { .. }));
    }

    #[test]
    fn existing_project_files_resolve() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/Main.elm"), "").unwrap();
        let resolved = resolve_file(tmp.path(), "src/Main.elm").unwrap();
        assert_eq!(resolved, tmp.path().join("src/Main.elm"));
    }
}
