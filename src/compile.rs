// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! Invoking the external compiler.
//!
//! The compiler is a single-shot subprocess. We always pass `--report=json`
//! so that failures arrive as a structured report on stderr rather than
//! human-formatted text. Invocations are cancellable: a fired [`KillSwitch`]
//! kills the child and surfaces as [`CompileResult::Killed`].

use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;

use crate::project::{CompilationMode, InputPath, KillSwitch};

/// The compiler executable. Overridable for tests and exotic setups.
pub fn compiler_command() -> String {
    std::env::var("ELM_WATCH_ELM").unwrap_or_else(|_| "elm".to_owned())
}

/// What to do with the compiled output.
#[derive(Clone, Debug)]
pub enum OutputTarget {
    /// Write the artifact to this path.
    File(PathBuf),
    /// Typecheck only; the compiler is pointed at the null device.
    Null,
}

impl OutputTarget {
    fn as_arg(&self) -> OsString {
        match self {
            OutputTarget::File(path) => path.as_os_str().to_os_string(),
            OutputTarget::Null => OsString::from("/dev/null"),
        }
    }
}

/// The outcome of one compiler invocation.
#[derive(Debug)]
pub enum CompileResult {
    Success,
    /// The invocation was cancelled via its kill switch.
    Killed,
    /// The executable could not be found.
    ElmNotFound { command: String },
    /// Spawning failed for another reason.
    CommandRun { message: String },
    /// Exit was non-zero and stderr held a parseable JSON report.
    Report(ElmReport),
    /// Exit was non-zero but the report did not parse.
    JsonParseError { message: String, raw: String },
    /// Exit was zero but the compiler wrote something unexpected.
    UnexpectedOutput { stdout: String, stderr: String },
}

/// The compiler's `--report=json` document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ElmReport {
    #[serde(rename = "compile-errors")]
    CompileErrors { errors: Vec<ElmError> },
    #[serde(rename = "error")]
    GeneralError {
        path: Option<String>,
        title: String,
        message: Vec<MessageChunk>,
    },
}

/// One source file's worth of problems.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ElmError {
    pub path: Option<String>,
    pub name: String,
    pub problems: Vec<Problem>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Problem {
    pub title: String,
    pub region: Region,
    pub message: Vec<MessageChunk>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Region {
    pub start: Position,
    pub end: Position,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// Message text mixes bare strings with styled chunks.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageChunk {
    Unstyled(String),
    Styled {
        string: String,
        #[serde(default)]
        bold: bool,
        #[serde(default)]
        underline: bool,
        #[serde(default)]
        color: Option<String>,
    },
}

impl MessageChunk {
    pub fn text(&self) -> &str {
        match self {
            MessageChunk::Unstyled(s) => s,
            MessageChunk::Styled { string, .. } => string,
        }
    }
}

/// Render a message array to plain text (for logs and client frames).
pub fn message_to_plain_text(message: &[MessageChunk]) -> String {
    message.iter().map(|c| c.text()).collect()
}

fn mode_flag(mode: CompilationMode) -> Option<&'static str> {
    match mode {
        CompilationMode::Debug => Some("--debug"),
        CompilationMode::Standard => None,
        CompilationMode::Optimize => Some("--optimize"),
    }
}

/// Run the compiler over `inputs`, writing to `output`.
///
/// `elm_json_dir` becomes the working directory so that the compiler finds
/// the right `elm.json`. The caller is responsible for never running two
/// invocations against the same `elm.json` concurrently.
pub async fn run(
    inputs: &[InputPath],
    mode: CompilationMode,
    output: OutputTarget,
    elm_json_dir: &Path,
    kill: &KillSwitch,
) -> CompileResult {
    let command = compiler_command();
    let mut cmd = Command::new(&command);
    cmd.arg("make");
    cmd.arg("--report=json");
    if let Some(flag) = mode_flag(mode) {
        cmd.arg(flag);
    }
    let mut output_arg = OsString::from("--output=");
    output_arg.push(output.as_arg());
    cmd.arg(output_arg);
    for input in inputs {
        cmd.arg(&input.absolute);
    }
    cmd.current_dir(elm_json_dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return CompileResult::ElmNotFound { command };
        }
        Err(e) => {
            return CompileResult::CommandRun {
                message: e.to_string(),
            };
        }
    };

    let output = tokio::select! {
        result = child.wait_with_output() => match result {
            Ok(output) => output,
            Err(e) => {
                return CompileResult::CommandRun {
                    message: e.to_string(),
                };
            }
        },
        _ = kill.killed() => {
            // Dropping the child kills it (`kill_on_drop` above).
            return CompileResult::Killed;
        }
    };

    if kill.is_killed() {
        return CompileResult::Killed;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        if stdout.trim().is_empty() && stderr.trim().is_empty() {
            CompileResult::Success
        } else {
            CompileResult::UnexpectedOutput { stdout, stderr }
        }
    } else {
        match serde_json::from_str::<ElmReport>(&stderr) {
            Ok(report) => CompileResult::Report(report),
            Err(e) => CompileResult::JsonParseError {
                message: e.to_string(),
                raw: stderr,
            },
        }
    }
}

/// The result of the dependency-install phase for one `elm.json` group.
#[derive(Debug)]
pub enum InstallResult {
    Success,
    Killed,
    Error { message: String },
}

/// Force the compiler to download and set up dependencies for one group by
/// running it against the null device before the first real build.
pub async fn install_dependencies(
    inputs: &[InputPath],
    elm_json_dir: &Path,
    kill: &KillSwitch,
) -> InstallResult {
    match run(
        inputs,
        CompilationMode::Standard,
        OutputTarget::Null,
        elm_json_dir,
        kill,
    )
    .await
    {
        CompileResult::Success => InstallResult::Success,
        // Compile errors are fine here: dependencies were installed, which
        // is all this phase is for. The real build will report them.
        CompileResult::Report(_) => InstallResult::Success,
        CompileResult::Killed => InstallResult::Killed,
        CompileResult::ElmNotFound { command } => InstallResult::Error {
            message: format!("the compiler executable `{command}` was not found in PATH"),
        },
        CompileResult::CommandRun { message } => InstallResult::Error { message },
        CompileResult::JsonParseError { message, .. } => InstallResult::Error { message },
        CompileResult::UnexpectedOutput { stderr, .. } => InstallResult::Error {
            message: format!("unexpected compiler output: {stderr}"),
        },
    }
}

/// Deduplicate inputs by their canonical path, preserving first-seen order.
/// Used when batching several targets into one typecheck invocation.
pub fn uniq_inputs(groups_of_inputs: &[&[InputPath]]) -> Vec<InputPath> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for inputs in groups_of_inputs {
        for input in *inputs {
            let canonical = std::fs::canonicalize(&input.absolute)
                .unwrap_or_else(|_| input.absolute.clone());
            if seen.insert(canonical) {
                result.push(input.clone());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compile_errors_report() {
        let raw = r#"{
            "type": "compile-errors",
            "errors": [{
                "path": "src/Main.elm",
                "name": "Main",
                "problems": [{
                    "title": "TYPE MISMATCH",
                    "region": {
                        "start": {"line": 10, "column": 5},
                        "end": {"line": 10, "column": 12}
                    },
                    "message": [
                        "Something is off with ",
                        {"string": "this", "bold": false, "underline": true, "color": "RED"}
                    ]
                }]
            }]
        }"#;
        let report: ElmReport = serde_json::from_str(raw).unwrap();
        match report {
            ElmReport::CompileErrors { errors } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].path.as_deref(), Some("src/Main.elm"));
                assert_eq!(errors[0].problems[0].title, "TYPE MISMATCH");
                assert_eq!(
                    message_to_plain_text(&errors[0].problems[0].message),
                    "Something is off with this"
                );
            }
            other => panic!("wrong report variant: {other:?}"),
        }
    }

    #[test]
    fn parses_general_error_report() {
        let raw = r#"{
            "type": "error",
            "path": "elm.json",
            "title": "UNREADABLE ELM.JSON",
            "message": ["I could not read the file."]
        }"#;
        let report: ElmReport = serde_json::from_str(raw).unwrap();
        match report {
            ElmReport::GeneralError { path, title, .. } => {
                assert_eq!(path.as_deref(), Some("elm.json"));
                assert_eq!(title, "UNREADABLE ELM.JSON");
            }
            other => panic!("wrong report variant: {other:?}"),
        }
    }

    #[test]
    fn uniq_inputs_preserves_order_and_dedupes() {
        let a = InputPath {
            absolute: PathBuf::from("/nonexistent/a.elm"),
            original: "a.elm".into(),
        };
        let b = InputPath {
            absolute: PathBuf::from("/nonexistent/b.elm"),
            original: "b.elm".into(),
        };
        let merged = uniq_inputs(&[&[a.clone(), b.clone()], &[b.clone(), a.clone()]]);
        assert_eq!(merged, vec![a, b]);
    }

    #[tokio::test]
    async fn killed_invocation_reports_killed() {
        let kill = KillSwitch::new();
        kill.kill(false);
        // Even though the command would fail to spawn meaningfully, the
        // kill switch resolves the race deterministically after spawn.
        let inputs = [InputPath {
            absolute: PathBuf::from("Main.elm"),
            original: "Main.elm".into(),
        }];
        std::env::set_var("ELM_WATCH_ELM", "sleep");
        let result = run(
            &inputs,
            CompilationMode::Standard,
            OutputTarget::Null,
            Path::new("."),
            &kill,
        )
        .await;
        std::env::remove_var("ELM_WATCH_ELM");
        assert!(matches!(
            result,
            CompileResult::Killed | CompileResult::ElmNotFound { .. }
        ));
    }
}
