// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The in-memory model of one watched project.
//!
//! A project is an ordered collection of build targets, grouped by the
//! `elm.json` that owns them. Each target tracks the lifecycle of one
//! compiled artifact through [`OutputStatus`], plus the bookkeeping the
//! scheduler needs: the dirty flag, the transitive import closure, and the
//! record-field set used for hot-swap change detection.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Notify;

use crate::compile::ElmError;

/// Milliseconds since the Unix epoch, as reported to browser clients.
pub type CompiledTimestamp = u64;

pub fn now_timestamp() -> CompiledTimestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Which driver is running: one-shot batch or the long-running watcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunMode {
    Make,
    Hot,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Make => "make",
            RunMode::Hot => "hot",
        })
    }
}

/// How the compiler is asked to build a target. Mutable at runtime from
/// browser clients.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationMode {
    Debug,
    Standard,
    Optimize,
}

impl Default for CompilationMode {
    fn default() -> Self {
        CompilationMode::Standard
    }
}

impl fmt::Display for CompilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompilationMode::Debug => "debug",
            CompilationMode::Standard => "standard",
            CompilationMode::Optimize => "optimize",
        };
        f.write_str(s)
    }
}

/// Where the browser UI widget sits. Opaque to the scheduler; we only store
/// and round-trip it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BrowserUiPosition(pub String);

impl Default for BrowserUiPosition {
    fn default() -> Self {
        BrowserUiPosition("BottomLeft".to_owned())
    }
}

/// The artifact path of a target: the canonicalised absolute form used as
/// the target's identity, the original text from the configuration for
/// display, and a temp sibling for atomic writes.
#[derive(Clone, Debug)]
pub struct OutputPath {
    pub absolute: PathBuf,
    pub original: String,
    pub temp: PathBuf,
}

impl OutputPath {
    pub fn new(absolute: PathBuf, original: String) -> Self {
        let mut file_name = absolute
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        file_name.push(".tmp");
        let temp = absolute.with_file_name(file_name);
        OutputPath {
            absolute,
            original,
            temp,
        }
    }
}

// Identity is the canonical path; `original` and `temp` are derived.
impl PartialEq for OutputPath {
    fn eq(&self, other: &Self) -> bool {
        self.absolute == other.absolute
    }
}

impl Eq for OutputPath {}

impl std::hash::Hash for OutputPath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.absolute.hash(state);
    }
}

impl PartialOrd for OutputPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OutputPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.absolute.cmp(&other.absolute)
    }
}

impl fmt::Display for OutputPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// One source file named in the configuration as an entry point.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InputPath {
    pub absolute: PathBuf,
    pub original: String,
}

/// A cooperative cancellation handle shared between the scheduler and an
/// in-flight subprocess or worker.
#[derive(Clone, Debug)]
pub struct KillSwitch {
    killed: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl KillSwitch {
    pub fn new() -> Self {
        KillSwitch {
            killed: Arc::new(AtomicBool::new(false)),
            forced: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn kill(&self, force: bool) {
        if force {
            self.forced.store(true, Ordering::SeqCst);
        }
        self.killed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Resolve once `kill` has been called. Safe to race with `kill`: the
    /// flag is checked again after registering for notification.
    pub async fn killed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_killed() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        KillSwitch::new()
    }
}

/// A labelled wall-clock measurement from one build attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LabeledDuration {
    QueuedForCompile(Duration),
    Compile(Duration),
    ImportWalk(Duration),
    Inject(Duration),
    Postprocess(Duration),
}

impl LabeledDuration {
    pub fn label(&self) -> &'static str {
        match self {
            LabeledDuration::QueuedForCompile(_) => "queued",
            LabeledDuration::Compile(_) => "compile",
            LabeledDuration::ImportWalk(_) => "import walk",
            LabeledDuration::Inject(_) => "inject",
            LabeledDuration::Postprocess(_) => "postprocess",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            LabeledDuration::QueuedForCompile(d)
            | LabeledDuration::Compile(d)
            | LabeledDuration::ImportWalk(d)
            | LabeledDuration::Inject(d)
            | LabeledDuration::Postprocess(d) => *d,
        }
    }
}

/// The per-target state machine.
#[derive(Debug)]
pub enum OutputStatus {
    /// Initial state: nothing has been compiled yet this run.
    NotWrittenToDisk,
    QueuedForCompile {
        enqueued_at: Instant,
    },
    Compiling {
        mode: CompilationMode,
        start: Instant,
        durations: Vec<LabeledDuration>,
        kill: KillSwitch,
    },
    QueuedForPostprocess {
        code: String,
        compiled_timestamp: CompiledTimestamp,
        record_fields: Option<BTreeSet<String>>,
        durations: Vec<LabeledDuration>,
    },
    Postprocessing {
        kill: KillSwitch,
        durations: Vec<LabeledDuration>,
    },
    TypecheckOnly {
        start: Instant,
        kill: KillSwitch,
    },
    /// A build was cancelled because the target went dirty mid-flight.
    Interrupted,
    Success {
        artifact_size: u64,
        postprocess_size: Option<u64>,
        compiled_timestamp: CompiledTimestamp,
        durations: Vec<LabeledDuration>,
    },
    Error(OutputError),
}

/// Coarse classification of a status, used by the planner and by the status
/// line renderer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusCategory {
    /// Work is in flight or queued for this target.
    Transient,
    Success,
    Error,
}

impl OutputStatus {
    pub fn category(&self) -> StatusCategory {
        match self {
            OutputStatus::NotWrittenToDisk
            | OutputStatus::QueuedForCompile { .. }
            | OutputStatus::Compiling { .. }
            | OutputStatus::QueuedForPostprocess { .. }
            | OutputStatus::Postprocessing { .. }
            | OutputStatus::TypecheckOnly { .. } => StatusCategory::Transient,
            OutputStatus::Success { .. } => StatusCategory::Success,
            OutputStatus::Interrupted | OutputStatus::Error(_) => StatusCategory::Error,
        }
    }

    /// Is a compiler subprocess or worker currently running for this target?
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            OutputStatus::Compiling { .. }
                | OutputStatus::TypecheckOnly { .. }
                | OutputStatus::Postprocessing { .. }
        )
    }

    pub fn last_compiled_timestamp(&self) -> Option<CompiledTimestamp> {
        match self {
            OutputStatus::Success {
                compiled_timestamp, ..
            } => Some(*compiled_timestamp),
            OutputStatus::QueuedForPostprocess {
                compiled_timestamp, ..
            } => Some(*compiled_timestamp),
            _ => None,
        }
    }
}

/// Everything that can go wrong for a single target. These stick to the
/// target until the next dirty-and-compile cycle clears them.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("the compiler executable `{command}` was not found in PATH")]
    ElmNotFound { command: String },

    #[error("failed to run the compiler: {message}")]
    CommandRun { message: String },

    #[error("the compiler exited with an error but its JSON report could not be parsed")]
    ElmMakeJsonParseError {
        message: String,
        raw: String,
    },

    #[error("the compiler reported {} error(s)", .errors.len())]
    CompileErrors { errors: Vec<ElmError> },

    #[error("the compiler reported an error: {title}")]
    GeneralCompilerError {
        title: String,
        message: String,
        path: Option<String>,
    },

    #[error("the compiler produced unexpected output")]
    UnexpectedCompilerOutput { stdout: String, stderr: String },

    #[error("failed to read `elm.json` at {path}", path = .path.display())]
    ElmJsonReadError {
        path: PathBuf,
        message: String,
    },

    #[error("failed to decode `elm.json` at {path}", path = .path.display())]
    ElmJsonDecodeError {
        path: PathBuf,
        message: String,
    },

    #[error("failed to walk imports starting from `{path}`", path = .path.display())]
    ImportWalkerFileError {
        path: PathBuf,
        message: String,
    },

    #[error("failed to read the compiled artifact `{path}`", path = .path.display())]
    ReadOutputError {
        path: PathBuf,
        message: String,
    },

    #[error("failed to write the artifact `{path}`", path = .path.display())]
    WriteOutputError {
        path: PathBuf,
        reason: WriteOutputReason,
        message: String,
    },

    #[error("failed to write the proxy artifact `{path}`", path = .path.display())]
    WriteProxyOutputError {
        path: PathBuf,
        message: String,
    },

    #[error("could not find the injection anchor in the compiled artifact")]
    InjectSearchAndReplaceNotFound { probe: String },

    #[error("the postprocess command `{command}` was not found")]
    PostprocessCommandNotFound { command: String },

    #[error("failed to run the postprocess command: {message}")]
    PostprocessSpawnError { message: String },

    #[error("the postprocess command exited with code {exit_code}")]
    PostprocessNonZeroExit {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("failed to import the postprocess script: {message}")]
    ElmWatchNodeImportError { message: String },

    #[error("the postprocess script's default export is not a function")]
    ElmWatchNodeDefaultExportNotFunction { exported: String },

    #[error("the postprocess script threw an error: {message}")]
    ElmWatchNodeRunError { message: String },

    #[error("the postprocess script returned a bad value: {message}")]
    ElmWatchNodeBadReturnValue { message: String },

    #[error("failed to install dependencies for `{elm_json_path}`: {message}", elm_json_path = .elm_json_path.display())]
    DependenciesError {
        elm_json_path: PathBuf,
        message: String,
    },

    /// Sentinel for work that was still marked in-flight when it should not
    /// be. Indicates a scheduler bug; reported rather than panicking.
    #[error("target was stuck in progress: {what}")]
    StuckInProgress { what: String },
}

/// Why an artifact write failed, for error rendering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutputReason {
    InjectWebSocketClient,
    Postprocess,
}

/// One build target: a name, the inputs, the artifact, and the live state.
#[derive(Debug)]
pub struct Target {
    pub name: String,
    pub output: OutputPath,
    /// Position in `elm-watch.json`, project-wide. Drives planner ordering.
    pub index: usize,
    pub inputs: Vec<InputPath>,
    pub compilation_mode: CompilationMode,
    pub browser_ui_position: BrowserUiPosition,
    pub open_error_overlay: bool,
    pub status: OutputStatus,
    /// Transitive import closure of `inputs`, refreshed on each build.
    pub all_related_source_paths: BTreeSet<PathBuf>,
    /// Record field names seen in the last compiled artifact.
    pub record_fields: Option<BTreeSet<String>>,
    dirty: Arc<AtomicBool>,
}

impl Target {
    pub fn new(
        name: String,
        output: OutputPath,
        index: usize,
        inputs: Vec<InputPath>,
    ) -> Self {
        Target {
            name,
            output,
            index,
            inputs,
            compilation_mode: CompilationMode::default(),
            browser_ui_position: BrowserUiPosition::default(),
            open_error_overlay: false,
            status: OutputStatus::NotWrittenToDisk,
            all_related_source_paths: BTreeSet::new(),
            record_fields: None,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// A clone of the dirty flag for build tasks to poll mid-flight.
    pub fn dirty_flag(&self) -> Arc<AtomicBool> {
        self.dirty.clone()
    }

    /// Does a file-system event for `path` affect this target?
    ///
    /// Falls back to the declared inputs when the import closure is empty,
    /// so a failed walk cannot permanently detach a target from its sources.
    pub fn is_affected_by(&self, path: &Path) -> bool {
        if self.all_related_source_paths.is_empty() {
            self.inputs.iter().any(|input| input.absolute == path)
        } else {
            self.all_related_source_paths.contains(path)
                || self.inputs.iter().any(|input| input.absolute == path)
        }
    }

    pub fn has_input(&self, path: &Path) -> bool {
        self.inputs.iter().any(|input| input.absolute == path)
    }
}

/// The postprocess configuration from `elm-watch.json`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PostprocessConfig {
    NoPostprocess,
    /// An argv; the first element may name the in-process script runner.
    Command(Vec<String>),
}

impl PostprocessConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, PostprocessConfig::NoPostprocess)
    }

    /// The script path, when the in-process runner is configured. Watched
    /// so that edits to the script retrigger compilation.
    pub fn script_path(&self, watch_root: &Path) -> Option<PathBuf> {
        match self {
            PostprocessConfig::NoPostprocess => None,
            PostprocessConfig::Command(argv) => match argv.as_slice() {
                [runner, script, ..] if runner == crate::postprocess::NODE_RUNNER_NAME => {
                    Some(watch_root.join(script))
                }
                _ => None,
            },
        }
    }
}

/// Targets that share an `elm.json`. The compiler corrupts its scratch
/// files when two invocations share one project, so the scheduler never
/// runs two builds in the same group at once.
#[derive(Debug)]
pub struct ProjectGroup {
    pub elm_json_path: PathBuf,
    pub source_directories: Vec<PathBuf>,
    pub targets: Vec<Target>,
}

impl ProjectGroup {
    pub fn compiler_scratch_dir(&self) -> PathBuf {
        self.elm_json_path
            .parent()
            .map(|p| p.join("elm-stuff"))
            .unwrap_or_else(|| PathBuf::from("elm-stuff"))
    }
}

/// A target that is known from the configuration but was filtered out on
/// the command line. Kept so client connections for it can be answered.
#[derive(Clone, Debug)]
pub struct DisabledTarget {
    pub name: String,
    pub output: OutputPath,
}

/// The whole project: ordered groups of targets plus project-wide settings.
#[derive(Debug)]
pub struct Project {
    pub watch_root: PathBuf,
    pub watch_config_path: PathBuf,
    pub state_file_path: PathBuf,
    pub postprocess: PostprocessConfig,
    pub port_from_config: Option<u16>,
    pub max_parallel: usize,
    pub groups: Vec<ProjectGroup>,
    pub disabled: Vec<DisabledTarget>,
}

impl Project {
    /// All enabled targets in configuration order.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        let mut refs: Vec<&Target> = self
            .groups
            .iter()
            .flat_map(|g| g.targets.iter())
            .collect();
        refs.sort_by_key(|t| t.index);
        refs.into_iter()
    }

    pub fn targets_mut(&mut self) -> impl Iterator<Item = &mut Target> {
        self.groups.iter_mut().flat_map(|g| g.targets.iter_mut())
    }

    pub fn target(&self, output: &OutputPath) -> Option<&Target> {
        self.groups
            .iter()
            .flat_map(|g| g.targets.iter())
            .find(|t| &t.output == output)
    }

    pub fn target_mut(&mut self, output: &OutputPath) -> Option<&mut Target> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.targets.iter_mut())
            .find(|t| &t.output == output)
    }

    pub fn target_by_name(&self, name: &str) -> Option<&Target> {
        self.groups
            .iter()
            .flat_map(|g| g.targets.iter())
            .find(|t| t.name == name)
    }

    pub fn group_of(&self, output: &OutputPath) -> Option<&ProjectGroup> {
        self.groups
            .iter()
            .find(|g| g.targets.iter().any(|t| &t.output == output))
    }

    pub fn num_executing(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.targets.iter())
            .filter(|t| t.status.is_executing())
            .count()
    }

    pub fn is_elm_json_path(&self, path: &Path) -> bool {
        self.groups.iter().any(|g| g.elm_json_path == path)
    }

    /// Is `path` a removal of some group's `elm-stuff` scratch directory
    /// (or anything inside one)?
    pub fn is_inside_compiler_scratch(&self, path: &Path) -> bool {
        self.groups
            .iter()
            .any(|g| path.starts_with(g.compiler_scratch_dir()))
    }

    pub fn mark_all_dirty(&self) {
        for group in &self.groups {
            for target in &group.targets {
                target.mark_dirty();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_path(p: &str) -> OutputPath {
        OutputPath::new(PathBuf::from(p), p.to_owned())
    }

    fn target(name: &str, index: usize) -> Target {
        Target::new(
            name.to_owned(),
            output_path(&format!("/proj/build/{name}.js")),
            index,
            vec![InputPath {
                absolute: PathBuf::from(format!("/proj/src/{name}.elm")),
                original: format!("src/{name}.elm"),
            }],
        )
    }

    #[test]
    fn temp_path_is_a_sibling() {
        let out = output_path("/proj/build/main.js");
        assert_eq!(out.temp, PathBuf::from("/proj/build/main.js.tmp"));
    }

    #[test]
    fn output_path_identity_ignores_original_text() {
        let a = OutputPath::new(PathBuf::from("/p/x.js"), "x.js".into());
        let b = OutputPath::new(PathBuf::from("/p/x.js"), "./x.js".into());
        assert_eq!(a, b);
    }

    #[test]
    fn status_categories_are_disjoint_and_total() {
        let transient = [
            OutputStatus::NotWrittenToDisk,
            OutputStatus::QueuedForCompile {
                enqueued_at: Instant::now(),
            },
            OutputStatus::Compiling {
                mode: CompilationMode::Standard,
                start: Instant::now(),
                durations: Vec::new(),
                kill: KillSwitch::new(),
            },
            OutputStatus::QueuedForPostprocess {
                code: String::new(),
                compiled_timestamp: 0,
                record_fields: None,
                durations: Vec::new(),
            },
            OutputStatus::Postprocessing {
                kill: KillSwitch::new(),
                durations: Vec::new(),
            },
            OutputStatus::TypecheckOnly {
                start: Instant::now(),
                kill: KillSwitch::new(),
            },
        ];
        for status in &transient {
            assert_eq!(status.category(), StatusCategory::Transient);
        }

        let success = OutputStatus::Success {
            artifact_size: 1,
            postprocess_size: None,
            compiled_timestamp: 1,
            durations: Vec::new(),
        };
        assert_eq!(success.category(), StatusCategory::Success);

        let errors = [
            OutputStatus::Interrupted,
            OutputStatus::Error(OutputError::ElmNotFound {
                command: "elm".into(),
            }),
        ];
        for status in &errors {
            assert_eq!(status.category(), StatusCategory::Error);
        }
    }

    #[test]
    fn executing_statuses_match_transient_subprocess_states() {
        assert!(OutputStatus::Compiling {
            mode: CompilationMode::Standard,
            start: Instant::now(),
            durations: Vec::new(),
            kill: KillSwitch::new(),
        }
        .is_executing());
        assert!(!OutputStatus::QueuedForCompile {
            enqueued_at: Instant::now(),
        }
        .is_executing());
        assert!(!OutputStatus::NotWrittenToDisk.is_executing());
    }

    #[test]
    fn empty_import_closure_falls_back_to_inputs() {
        let t = target("a", 0);
        assert!(t.all_related_source_paths.is_empty());
        assert!(t.is_affected_by(Path::new("/proj/src/a.elm")));
        assert!(!t.is_affected_by(Path::new("/proj/src/other.elm")));
    }

    #[test]
    fn dirty_flag_is_shared_with_clones() {
        let t = target("a", 0);
        let flag = t.dirty_flag();
        assert!(!t.is_dirty());
        flag.store(true, Ordering::SeqCst);
        assert!(t.is_dirty());
        t.clear_dirty();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn kill_switch_wakes_waiters() {
        let kill = KillSwitch::new();
        let waiter = kill.clone();
        let handle = tokio::spawn(async move {
            waiter.killed().await;
            waiter.is_forced()
        });
        kill.kill(true);
        assert!(handle.await.unwrap());
    }
}
