// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The long-running `hot` operation.
//!
//! The controller is a Mealy machine: every incoming [`Msg`] runs through
//! the pure [`update`] reducer, which mutates only the [`Model`] and
//! returns [`Cmd`]s; the interpreter in the main loop performs the I/O
//! those commands describe. Watcher events, WebSocket traffic, timers,
//! and finished build jobs all arrive as messages on one channel, so the
//! project state has a single writer.

use anyhow::{bail, Context, Result};
use clap::Args;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncReadExt,
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    task::JoinHandle,
};

use crate::compile::ElmError;
use crate::config;
use crate::editor;
use crate::execute::{self, CompileFinished, ExecuteEnv, HandleResult};
use crate::plan::{self, OutputAction, Priorities};
use crate::postprocess::WorkerPool;
use crate::project::{
    BrowserUiPosition, CompilationMode, KillSwitch, OutputError, OutputPath, OutputStatus,
    PostprocessConfig, Project, RunMode, Target,
};
use crate::protocol::{
    ClientErrorReason, ClientFrame, ServerFrame, StatusFrame, WebSocketParams,
};
use crate::report::{self, Reporter};
use crate::state_file;
use crate::watcher::{self, RawWatcherEvent, WatcherEventKind, WatcherNotification};
use crate::websocket::{self, PortError, PortPreference, ServerEvent, WebSocketServer};

const WATCHER_DEBOUNCE_MS: u64 = 10;
const WEB_SOCKET_DEBOUNCE_MS: u64 = 100;
const UI_CHANGE_DEBOUNCE_MS: u64 = 10;
const DEFAULT_WORKER_LIMIT_TIMEOUT_MS: u64 = 10_000;

fn env_ms(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

/// Behavioural toggles read once per run.
#[derive(Clone, Copy, Debug, Default)]
pub struct HotFlags {
    pub exit_on_error: bool,
    pub exit_on_worker_limit: bool,
    pub debug: bool,
    pub worker_limit_timeout_ms: u64,
    pub loading_message_delay_ms: u64,
}

impl HotFlags {
    fn from_env() -> Self {
        HotFlags {
            exit_on_error: env_flag("__ELM_WATCH_EXIT_ON_ERROR"),
            exit_on_worker_limit: env_flag("__ELM_WATCH_EXIT_ON_WORKER_LIMIT"),
            debug: env_flag("__ELM_WATCH_DEBUG"),
            worker_limit_timeout_ms: env_ms(
                "__ELM_WATCH_WORKER_LIMIT_TIMEOUT_MS",
                DEFAULT_WORKER_LIMIT_TIMEOUT_MS,
            ),
            loading_message_delay_ms: env_ms("__ELM_WATCH_LOADING_MESSAGE_DELAY", 100),
        }
    }
}

/// Everything that can wake the controller.
#[derive(Debug)]
pub enum Msg {
    GotWatcherEvent {
        kind: WatcherEventKind,
        path: PathBuf,
    },
    SleepBeforeNextActionDone {
        generation: u64,
    },
    /// Progress of the current compile batch; see [`PartDone`].
    CompilationPartDone { part: PartDone },
    InstallDependenciesDone {
        result: InstallOutcome,
    },
    WebSocketConnected {
        id: u64,
        params: Result<WebSocketParams, ClientErrorReason>,
    },
    WebSocketMessageReceived {
        id: u64,
        data: String,
    },
    WebSocketClosed {
        id: u64,
    },
    WorkerLimitTimeoutPassed,
    WorkersLimited {
        num_terminated: usize,
    },
    ExitRequested,
    WatcherFatal {
        message: String,
    },
}

/// A compile batch progresses in three shapes: a planner tick that found
/// nothing to start, a raw job result from an executor task (applied to
/// the project by the event loop, which owns it), and the applied summary
/// the reducer acts on.
#[derive(Debug)]
pub enum PartDone {
    NothingToStart,
    Finished(Box<CompileFinished>),
    Applied {
        output: OutputPath,
        result: HandleResult,
    },
}

#[derive(Debug)]
pub enum InstallOutcome {
    Success,
    Killed,
    Error { elm_json_path: PathBuf, message: String },
}

/// The effects the reducer can ask for.
#[derive(Debug)]
pub enum Cmd {
    ClearScreen,
    InstallDependencies,
    CompileAllOutputsAsNeeded {
        include_interrupted: bool,
    },
    MarkAsDirty {
        outputs: Vec<OutputPath>,
        kill_install_dependencies: bool,
    },
    MarkInstallFailed {
        elm_json_path: PathBuf,
        message: String,
    },
    RestartWorkers,
    LimitWorkers,
    Restart {
        watch_config_changed: bool,
    },
    ExitOnIdle {
        code: i32,
    },
    LogInfoMessageWithTimeline {
        message: String,
        events: Vec<String>,
    },
    PrintCompileErrors,
    PersistState,
    OpenEditor {
        id: u64,
        file: String,
        line: u32,
        column: u32,
    },
    SleepBeforeNextAction {
        ms: u64,
        generation: u64,
    },
    WebSocketSend {
        id: u64,
        frame: ServerFrame,
    },
    WebSocketSendToOutput {
        output: OutputPath,
        frame: ServerFrame,
    },
    WebSocketSendCompileErrorToOutput {
        output: OutputPath,
    },
    WebSocketUpdatePriority {
        id: u64,
    },
    RegisterConnection {
        id: u64,
        output: Result<OutputPath, ()>,
        priority: u64,
    },
    ChangeCompilationMode {
        output: OutputPath,
        mode: CompilationMode,
    },
    ChangeBrowserUiPosition {
        output: OutputPath,
        position: BrowserUiPosition,
    },
    ChangeOpenErrorOverlay {
        output: OutputPath,
        open: bool,
    },
    ArmWorkerLimitTimer,
    Throw {
        message: String,
    },
}

/// The single upcoming decision, collapsing simultaneous triggers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum NextAction {
    NoAction,
    Compile,
    Restart,
}

#[derive(Debug)]
pub enum HotState {
    Idle,
    InstallingDependencies { start: Instant },
    Compiling { start: Instant },
    Restarting,
}

/// Timeline entries shown to the user and used for debounce timing.
#[derive(Clone, Debug)]
pub enum Event {
    WatcherEvent {
        kind: WatcherEventKind,
        path: PathBuf,
        affects_any_target: bool,
    },
    WebSocketConnectedNeedingCompilation { target: String },
    WebSocketConnectedNoAction { target: String },
    WebSocketConnectedWithErrors,
    WebSocketClosed,
    WebSocketChangedCompilationMode {
        target: String,
        mode: CompilationMode,
    },
    WebSocketChangedBrowserUiPosition { target: String },
    WorkersLimitedAfterWebSocketClosed { num_terminated: usize },
}

impl Event {
    fn debounce_ms(&self) -> u64 {
        match self {
            Event::WatcherEvent { .. } => WATCHER_DEBOUNCE_MS,
            Event::WebSocketConnectedNeedingCompilation { .. }
            | Event::WebSocketConnectedNoAction { .. }
            | Event::WebSocketConnectedWithErrors
            | Event::WebSocketClosed
            | Event::WorkersLimitedAfterWebSocketClosed { .. } => WEB_SOCKET_DEBOUNCE_MS,
            Event::WebSocketChangedCompilationMode { .. }
            | Event::WebSocketChangedBrowserUiPosition { .. } => UI_CHANGE_DEBOUNCE_MS,
        }
    }

    fn describe(&self) -> String {
        match self {
            Event::WatcherEvent {
                kind,
                path,
                affects_any_target,
            } => {
                let suffix = if *affects_any_target {
                    ""
                } else {
                    " (no target affected)"
                };
                format!("{kind} {}{suffix}", path.display())
            }
            Event::WebSocketConnectedNeedingCompilation { target } => {
                format!("web socket connected needing compilation of `{target}`")
            }
            Event::WebSocketConnectedNoAction { target } => {
                format!("web socket connected for `{target}` (already up to date)")
            }
            Event::WebSocketConnectedWithErrors => {
                "web socket connected with errors".to_owned()
            }
            Event::WebSocketClosed => "web socket disconnected".to_owned(),
            Event::WebSocketChangedCompilationMode { target, mode } => {
                format!("changed compilation mode of `{target}` to {mode}")
            }
            Event::WebSocketChangedBrowserUiPosition { target } => {
                format!("moved the browser UI of `{target}`")
            }
            Event::WorkersLimitedAfterWebSocketClosed { num_terminated } => {
                format!("terminated {num_terminated} idle postprocess worker(s)")
            }
        }
    }
}

/// The controller's own state: small on purpose, the heavy lifting lives
/// in the [`Project`].
#[derive(Debug)]
pub struct Model {
    pub next_action: NextAction,
    pub hot_state: HotState,
    pub latest_events: Vec<Event>,
    /// The dependency install must finish (or die) before a restart.
    pub install_in_flight: bool,
    sleep_generation: u64,
}

impl Model {
    /// `generation_base` separates sleep timers of successive runs, since
    /// the message channel is shared across restarts.
    pub fn new(generation_base: u64) -> Self {
        Model {
            next_action: NextAction::NoAction,
            hot_state: HotState::InstallingDependencies {
                start: Instant::now(),
            },
            latest_events: Vec::new(),
            install_in_flight: true,
            sleep_generation: generation_base,
        }
    }

    fn escalate(&mut self, action: NextAction) {
        if action > self.next_action {
            self.next_action = action;
        }
    }

    /// Push an event and return the debounce command for the batch.
    fn record(&mut self, event: Event) -> Cmd {
        self.latest_events.push(event);
        self.sleep_generation += 1;
        let ms = self
            .latest_events
            .iter()
            .map(Event::debounce_ms)
            .max()
            .unwrap_or(WATCHER_DEBOUNCE_MS);
        Cmd::SleepBeforeNextAction {
            ms,
            generation: self.sleep_generation,
        }
    }

    fn drain_events(&mut self) -> Vec<String> {
        let events: Vec<String> = self.latest_events.iter().map(Event::describe).collect();
        self.latest_events.clear();
        events
    }
}

fn ready_to_restart(model: &Model, project: &Project) -> bool {
    !model.install_in_flight && project.num_executing() == 0
}

/// A connection that completed the handshake (successfully or not).
#[derive(Clone, Debug)]
pub struct ConnectionState {
    /// `Err` for connections that failed validation but stay open.
    pub output: Result<OutputPath, ()>,
    pub priority: u64,
}

pub type Connections = HashMap<u64, ConnectionState>;

fn priorities_from_connections(connections: &Connections) -> Priorities {
    let mut map: HashMap<OutputPath, u64> = HashMap::new();
    for connection in connections.values() {
        if let Ok(output) = &connection.output {
            let entry = map.entry(output.clone()).or_insert(0);
            *entry = (*entry).max(connection.priority);
        }
    }
    Priorities::ByOutput(map)
}

/// Is there anything at all for a compile pass to pick up?
fn anything_to_do(project: &Project) -> bool {
    project.targets().any(|t| {
        t.is_dirty()
            || matches!(
                t.status,
                OutputStatus::QueuedForCompile { .. }
                    | OutputStatus::QueuedForPostprocess { .. }
                    | OutputStatus::Interrupted
            )
    })
}

/// Has the current compile batch fully settled?
fn batch_finished(project: &Project) -> bool {
    project.num_executing() == 0 && !anything_to_do(project)
}

fn num_error_statuses(project: &Project) -> usize {
    project
        .targets()
        .filter(|t| matches!(t.status, OutputStatus::Error(_)))
        .count()
}

/// The pure transition function. Reads the project, mutates only the
/// model, describes everything else as commands.
pub fn update(
    msg: Msg,
    model: &mut Model,
    project: &Project,
    connections: &Connections,
    now_ms: u64,
    flags: &HotFlags,
) -> Vec<Cmd> {
    match msg {
        Msg::GotWatcherEvent { kind, path } => {
            on_watcher_event(kind, path, model, project)
        }

        Msg::SleepBeforeNextActionDone { generation } => {
            if generation != model.sleep_generation {
                return Vec::new();
            }
            match model.next_action {
                NextAction::NoAction => Vec::new(),
                NextAction::Compile => match model.hot_state {
                    HotState::Idle => {
                        if anything_to_do(project) {
                            model.next_action = NextAction::NoAction;
                            model.hot_state = HotState::Compiling {
                                start: Instant::now(),
                            };
                            vec![Cmd::CompileAllOutputsAsNeeded {
                                include_interrupted: true,
                            }]
                        } else {
                            model.next_action = NextAction::NoAction;
                            let events = model.drain_events();
                            vec![Cmd::LogInfoMessageWithTimeline {
                                message: "nothing to do".to_owned(),
                                events,
                            }]
                        }
                    }
                    HotState::Compiling { .. } => {
                        model.next_action = NextAction::NoAction;
                        vec![Cmd::CompileAllOutputsAsNeeded {
                            include_interrupted: true,
                        }]
                    }
                    // The pending compile fires after the install phase.
                    HotState::InstallingDependencies { .. } => Vec::new(),
                    HotState::Restarting => Vec::new(),
                },
                NextAction::Restart => {
                    model.hot_state = HotState::Restarting;
                    if ready_to_restart(model, project) {
                        vec![Cmd::Restart {
                            watch_config_changed: restart_touches_watch_config(model, project),
                        }]
                    } else {
                        Vec::new()
                    }
                }
            }
        }

        Msg::CompilationPartDone { part } => {
            let mut cmds = Vec::new();

            if let PartDone::Applied { output, result } = part {
                match result {
                    HandleResult::FullyCompiledJS {
                        code,
                        compiled_timestamp,
                        compilation_mode,
                    } => {
                        let (position, _) = target_ui(project, &output);
                        cmds.push(Cmd::WebSocketSendToOutput {
                            output: output.clone(),
                            frame: ServerFrame::SuccessfullyCompiled {
                                code,
                                elm_compiled_timestamp: compiled_timestamp,
                                compilation_mode,
                                browser_ui_position: position,
                            },
                        });
                    }
                    HandleResult::FullyCompiledJSButRecordFieldsChanged => {
                        cmds.push(Cmd::WebSocketSendToOutput {
                            output: output.clone(),
                            frame: ServerFrame::SuccessfullyCompiledButRecordFieldsChanged,
                        });
                    }
                    HandleResult::CompileError => {
                        cmds.push(Cmd::WebSocketSendCompileErrorToOutput {
                            output: output.clone(),
                        });
                    }
                    HandleResult::Nothing => {}
                }
            }

            match model.hot_state {
                HotState::Restarting => {
                    if ready_to_restart(model, project) {
                        cmds.push(Cmd::Restart {
                            watch_config_changed: restart_touches_watch_config(model, project),
                        });
                    }
                }
                HotState::Compiling { start } => {
                    if batch_finished(project) {
                        let num_errors = num_error_statuses(project);
                        if num_errors > 0 {
                            cmds.push(Cmd::PrintCompileErrors);
                        }
                        let elapsed = start.elapsed();
                        if elapsed.as_millis() as u64 >= flags.loading_message_delay_ms {
                            let events = model.drain_events();
                            cmds.push(Cmd::LogInfoMessageWithTimeline {
                                message: format!(
                                    "compilation finished in {:.1}s",
                                    elapsed.as_secs_f32()
                                ),
                                events,
                            });
                        } else {
                            model.latest_events.clear();
                        }
                        model.hot_state = HotState::Idle;
                        if flags.exit_on_error && num_errors > 0 {
                            cmds.push(Cmd::ExitOnIdle { code: 1 });
                        }
                    } else {
                        cmds.push(Cmd::CompileAllOutputsAsNeeded {
                            include_interrupted: true,
                        });
                    }
                }
                HotState::Idle | HotState::InstallingDependencies { .. } => {}
            }

            cmds
        }

        Msg::InstallDependenciesDone { result } => {
            model.install_in_flight = false;
            match result {
                InstallOutcome::Success => match model.hot_state {
                    HotState::Restarting => {
                        if ready_to_restart(model, project) {
                            vec![Cmd::Restart {
                                watch_config_changed: restart_touches_watch_config(
                                    model, project,
                                ),
                            }]
                        } else {
                            Vec::new()
                        }
                    }
                    _ => {
                        model.next_action = NextAction::NoAction;
                        model.hot_state = HotState::Compiling {
                            start: Instant::now(),
                        };
                        vec![Cmd::CompileAllOutputsAsNeeded {
                            include_interrupted: true,
                        }]
                    }
                },
                InstallOutcome::Killed => match model.hot_state {
                    HotState::Restarting => {
                        if ready_to_restart(model, project) {
                            vec![Cmd::Restart {
                                watch_config_changed: restart_touches_watch_config(
                                    model, project,
                                ),
                            }]
                        } else {
                            Vec::new()
                        }
                    }
                    _ => {
                        model.hot_state = HotState::Idle;
                        Vec::new()
                    }
                },
                InstallOutcome::Error {
                    elm_json_path,
                    message,
                } => {
                    model.hot_state = HotState::Idle;
                    let mut cmds = vec![Cmd::MarkInstallFailed {
                        elm_json_path,
                        message,
                    }];
                    if flags.exit_on_error {
                        cmds.push(Cmd::ExitOnIdle { code: 1 });
                    }
                    cmds
                }
            }
        }

        Msg::WebSocketConnected { id, params } => {
            on_web_socket_connected(id, params, model, project, now_ms)
        }

        Msg::WebSocketMessageReceived { id, data } => {
            on_web_socket_message(id, &data, model, project, connections)
        }

        Msg::WebSocketClosed { id: _ } => {
            let sleep = model.record(Event::WebSocketClosed);
            vec![Cmd::ArmWorkerLimitTimer, sleep]
        }

        Msg::WorkerLimitTimeoutPassed => {
            let mut cmds = vec![Cmd::LimitWorkers];
            if flags.exit_on_worker_limit {
                cmds.push(Cmd::ExitOnIdle { code: 0 });
            }
            cmds
        }

        Msg::WorkersLimited { num_terminated } => {
            if num_terminated > 0 {
                let sleep =
                    model.record(Event::WorkersLimitedAfterWebSocketClosed { num_terminated });
                vec![sleep]
            } else {
                Vec::new()
            }
        }

        // Handled by the loop itself (they end the run), kept here so the
        // match stays total.
        Msg::ExitRequested => Vec::new(),
        Msg::WatcherFatal { message } => vec![Cmd::Throw { message }],
    }
}

fn restart_touches_watch_config(model: &Model, project: &Project) -> bool {
    model.latest_events.iter().any(|event| match event {
        Event::WatcherEvent { path, .. } => path == &project.watch_config_path,
        _ => false,
    })
}

fn target_ui(project: &Project, output: &OutputPath) -> (BrowserUiPosition, bool) {
    project
        .target(output)
        .map(|t| (t.browser_ui_position.clone(), t.open_error_overlay))
        .unwrap_or((BrowserUiPosition::default(), false))
}

fn on_watcher_event(
    kind: WatcherEventKind,
    path: PathBuf,
    model: &mut Model,
    project: &Project,
) -> Vec<Cmd> {
    let is_watch_config = path == project.watch_config_path;
    let is_elm_json_name = path
        .file_name()
        .map(|n| n == config::ELM_JSON_FILE_NAME)
        .unwrap_or(false);
    let is_known_elm_json = project.is_elm_json_path(&path);
    let is_scratch_dir = path
        .file_name()
        .map(|n| n == "elm-stuff")
        .unwrap_or(false)
        && kind == WatcherEventKind::Removed;
    let postprocess_script = project.postprocess.script_path(&project.watch_root);
    let is_postprocess_script = postprocess_script.as_deref() == Some(path.as_path());
    let is_source_file = path
        .extension()
        .map(|e| e == "elm")
        .unwrap_or(false);

    // Restart-causing paths first.
    let restart = is_watch_config
        || (is_elm_json_name && (kind == WatcherEventKind::Added || is_known_elm_json))
        || is_scratch_dir;

    if restart {
        model.escalate(NextAction::Restart);
        let all_outputs: Vec<OutputPath> =
            project.targets().map(|t| t.output.clone()).collect();
        let sleep = model.record(Event::WatcherEvent {
            kind,
            path,
            affects_any_target: true,
        });
        return vec![
            Cmd::MarkAsDirty {
                outputs: all_outputs,
                kill_install_dependencies: true,
            },
            sleep,
        ];
    }

    if is_postprocess_script {
        model.escalate(NextAction::Compile);
        let all_outputs: Vec<OutputPath> =
            project.targets().map(|t| t.output.clone()).collect();
        let sleep = model.record(Event::WatcherEvent {
            kind,
            path,
            affects_any_target: true,
        });
        return vec![
            Cmd::MarkAsDirty {
                outputs: all_outputs,
                kill_install_dependencies: false,
            },
            Cmd::RestartWorkers,
            sleep,
        ];
    }

    if is_source_file {
        // A deleted input cannot be rebuilt; the configuration no longer
        // matches reality, so restart and re-validate.
        if kind == WatcherEventKind::Removed
            && project.targets().any(|t| t.has_input(&path))
        {
            model.escalate(NextAction::Restart);
            let all_outputs: Vec<OutputPath> =
                project.targets().map(|t| t.output.clone()).collect();
            let sleep = model.record(Event::WatcherEvent {
                kind,
                path,
                affects_any_target: true,
            });
            return vec![
                Cmd::MarkAsDirty {
                    outputs: all_outputs,
                    kill_install_dependencies: true,
                },
                sleep,
            ];
        }

        let affected: Vec<OutputPath> = project
            .targets()
            .filter(|t| t.is_affected_by(&path))
            .map(|t| t.output.clone())
            .collect();

        if affected.is_empty() {
            let sleep = model.record(Event::WatcherEvent {
                kind,
                path,
                affects_any_target: false,
            });
            return vec![sleep];
        }

        model.escalate(NextAction::Compile);
        let sleep = model.record(Event::WatcherEvent {
            kind,
            path,
            affects_any_target: true,
        });
        return vec![
            Cmd::MarkAsDirty {
                outputs: affected,
                kill_install_dependencies: false,
            },
            sleep,
        ];
    }

    // Anything else is noise.
    Vec::new()
}

fn on_web_socket_connected(
    id: u64,
    params: Result<WebSocketParams, ClientErrorReason>,
    model: &mut Model,
    project: &Project,
    now_ms: u64,
) -> Vec<Cmd> {
    let params = match params {
        Err(reason) => {
            let sleep = model.record(Event::WebSocketConnectedWithErrors);
            return vec![
                Cmd::RegisterConnection {
                    id,
                    output: Err(()),
                    priority: now_ms,
                },
                Cmd::WebSocketSend {
                    id,
                    frame: reason.frame(),
                },
                sleep,
            ];
        }
        Ok(params) => params,
    };

    let target = match project.target_by_name(&params.target_name) {
        Some(target) => target,
        None => {
            let reason = if project
                .disabled
                .iter()
                .any(|d| d.name == params.target_name)
            {
                ClientErrorReason::TargetDisabled {
                    target_name: params.target_name.clone(),
                }
            } else {
                ClientErrorReason::UnknownTarget {
                    target_name: params.target_name.clone(),
                }
            };
            let sleep = model.record(Event::WebSocketConnectedWithErrors);
            return vec![
                Cmd::RegisterConnection {
                    id,
                    output: Err(()),
                    priority: now_ms,
                },
                Cmd::WebSocketSend {
                    id,
                    frame: reason.frame(),
                },
                sleep,
            ];
        }
    };

    let register = Cmd::RegisterConnection {
        id,
        output: Ok(target.output.clone()),
        priority: now_ms,
    };

    match target.status.last_compiled_timestamp() {
        Some(timestamp) if timestamp == params.elm_compiled_timestamp => {
            let sleep = model.record(Event::WebSocketConnectedNoAction {
                target: target.name.clone(),
            });
            vec![
                register,
                Cmd::WebSocketSend {
                    id,
                    frame: ServerFrame::StatusChanged {
                        status: StatusFrame::AlreadyUpToDate {
                            compilation_mode: target.compilation_mode,
                            browser_ui_position: target.browser_ui_position.clone(),
                        },
                    },
                },
                sleep,
            ]
        }
        _ => {
            model.escalate(NextAction::Compile);
            let sleep = model.record(Event::WebSocketConnectedNeedingCompilation {
                target: target.name.clone(),
            });
            vec![
                register,
                Cmd::MarkAsDirty {
                    outputs: vec![target.output.clone()],
                    kill_install_dependencies: false,
                },
                Cmd::WebSocketSend {
                    id,
                    frame: ServerFrame::StatusChanged {
                        status: StatusFrame::Busy {
                            compilation_mode: target.compilation_mode,
                            browser_ui_position: target.browser_ui_position.clone(),
                        },
                    },
                },
                sleep,
            ]
        }
    }
}

fn on_web_socket_message(
    id: u64,
    data: &str,
    model: &mut Model,
    project: &Project,
    connections: &Connections,
) -> Vec<Cmd> {
    let frame: ClientFrame = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(e) => {
            return vec![Cmd::WebSocketSend {
                id,
                frame: ServerFrame::StatusChanged {
                    status: StatusFrame::ClientError {
                        message: format!("could not decode the message: {e}"),
                    },
                },
            }];
        }
    };

    let output = connections
        .get(&id)
        .and_then(|c| c.output.as_ref().ok())
        .cloned();

    match frame {
        ClientFrame::ChangedCompilationMode { compilation_mode } => {
            let Some(output) = output else {
                return Vec::new();
            };
            let target_name = project
                .target(&output)
                .map(|t| t.name.clone())
                .unwrap_or_default();
            model.escalate(NextAction::Compile);
            let sleep = model.record(Event::WebSocketChangedCompilationMode {
                target: target_name,
                mode: compilation_mode,
            });
            vec![
                Cmd::ChangeCompilationMode {
                    output: output.clone(),
                    mode: compilation_mode,
                },
                Cmd::PersistState,
                Cmd::MarkAsDirty {
                    outputs: vec![output],
                    kill_install_dependencies: false,
                },
                sleep,
            ]
        }

        ClientFrame::ChangedBrowserUiPosition { browser_ui_position } => {
            let Some(output) = output else {
                return Vec::new();
            };
            let target_name = project
                .target(&output)
                .map(|t| t.name.clone())
                .unwrap_or_default();
            model.escalate(NextAction::Compile);
            let sleep = model.record(Event::WebSocketChangedBrowserUiPosition {
                target: target_name,
            });
            vec![
                Cmd::ChangeBrowserUiPosition {
                    output: output.clone(),
                    position: browser_ui_position,
                },
                Cmd::PersistState,
                Cmd::MarkAsDirty {
                    outputs: vec![output],
                    kill_install_dependencies: false,
                },
                sleep,
            ]
        }

        ClientFrame::ChangedOpenErrorOverlay { open_error_overlay } => {
            let Some(output) = output else {
                return Vec::new();
            };
            vec![
                Cmd::ChangeOpenErrorOverlay {
                    output,
                    open: open_error_overlay,
                },
                Cmd::PersistState,
            ]
        }

        ClientFrame::FocusedTab => vec![
            Cmd::WebSocketUpdatePriority { id },
            Cmd::WebSocketSend {
                id,
                frame: ServerFrame::FocusedTabAcknowledged,
            },
        ],

        ClientFrame::PressedOpenEditor { file, line, column } => {
            vec![Cmd::OpenEditor {
                id,
                file,
                line,
                column,
            }]
        }
    }
}

// --- The interpreter -------------------------------------------------------

enum LoopSignal {
    Exit(i32),
    Signal(libc::c_int),
    Restart { watch_config_changed: bool },
}

pub enum RunOutcome {
    Exit(i32),
    Restart {
        watch_config_changed: bool,
        reasons: Vec<String>,
    },
}

/// Handles that survive a restart when `elm-watch.json` is unchanged.
pub struct Passthrough {
    pub server: Option<Arc<WebSocketServer>>,
    pub pool: Option<WorkerPool>,
}

struct RunState {
    project: Project,
    connections: Connections,
    server: Arc<WebSocketServer>,
    pool: WorkerPool,
    env: ExecuteEnv,
    msg_tx: mpsc::UnboundedSender<Msg>,
    pending_sleep: Option<JoinHandle<()>>,
    worker_limit_timer: Option<JoinHandle<()>>,
    install_kill: KillSwitch,
    desired_workers: Arc<AtomicUsize>,
    exit_when_idle: Option<i32>,
    flags: HotFlags,
    started_at: Instant,
}

impl RunState {
    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// The hot operation.
#[derive(Args, Debug)]
pub struct HotArgs {
    /// Watch only targets whose names contain one of these substrings.
    targets: Vec<String>,
}

impl HotArgs {
    pub fn exec(self, reporter: &mut Reporter) -> Result<i32> {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(hot_main(self.targets, reporter))
    }
}

async fn hot_main(substrings: Vec<String>, reporter: &mut Reporter) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let mut passthrough = Passthrough {
        server: None,
        pool: None,
    };

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Msg>();

    // WebSocket events flow through one adapter for the whole process
    // lifetime, because the server itself may outlive individual runs.
    let (ws_event_tx, mut ws_event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    {
        let msg_tx = msg_tx.clone();
        tokio::task::spawn(async move {
            while let Some(event) = ws_event_rx.recv().await {
                let msg = match event {
                    ServerEvent::Connected { id, params } => {
                        Msg::WebSocketConnected { id, params }
                    }
                    ServerEvent::MessageReceived { id, data } => {
                        Msg::WebSocketMessageReceived { id, data }
                    }
                    ServerEvent::Closed { id } => Msg::WebSocketClosed { id },
                };
                if msg_tx.send(msg).is_err() {
                    break;
                }
            }
        });
    }

    // Stdin closing is a quit request, so supervisors can stop us by
    // closing the pipe.
    {
        let msg_tx = msg_tx.clone();
        tokio::task::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0_u8; 1024];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = msg_tx.send(Msg::ExitRequested);
        });
    }

    loop {
        let project = match config::load_project(&cwd, &substrings) {
            Ok(project) => project,
            Err(e) => {
                reporter.fatal("INVALID CONFIGURATION", &e.to_string());
                return Ok(1);
            }
        };

        let outcome = run_once(
            project,
            reporter,
            &mut passthrough,
            &msg_tx,
            &mut msg_rx,
            &ws_event_tx,
        )
        .await?;

        match outcome {
            RunOutcome::Exit(code) => return Ok(code),
            RunOutcome::Restart {
                watch_config_changed,
                reasons,
            } => {
                reporter.note("restarting");
                reporter.timeline(&reasons);
                if watch_config_changed {
                    if let Some(server) = passthrough.server.take() {
                        server.shutdown();
                    }
                    if let Some(pool) = passthrough.pool.take() {
                        pool.terminate().await;
                    }
                }
            }
        }
    }
}

async fn run_once(
    project: Project,
    reporter: &mut Reporter,
    passthrough: &mut Passthrough,
    msg_tx: &mpsc::UnboundedSender<Msg>,
    msg_rx: &mut mpsc::UnboundedReceiver<Msg>,
    ws_event_tx: &mpsc::UnboundedSender<ServerEvent>,
) -> Result<RunOutcome> {
    let flags = HotFlags::from_env();
    let mut project = project;

    // Persisted UI settings and the previously chosen port.
    let persisted = state_file::read(&project.state_file_path);
    state_file::apply(&mut project, &persisted);

    // Reuse or start the WebSocket server.
    let server = match passthrough.server.take() {
        Some(server) => server,
        None => {
            let preference = match (project.port_from_config, persisted.port) {
                (Some(port), _) => PortPreference::PortFromConfig(port),
                (None, Some(port)) => PortPreference::PersistedPort(port),
                (None, None) => PortPreference::NoPort,
            };
            let token = persisted
                .web_socket_token
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            let target_names: Vec<String> =
                project.targets().map(|t| t.name.clone()).collect();
            match WebSocketServer::start(
                preference,
                token,
                websocket::landing_page(&target_names),
                ws_event_tx.clone(),
            )
            .await
            {
                Ok(server) => Arc::new(server),
                Err(PortError::Conflict { preference }) => {
                    let (title, body) = port_conflict_template(&project, preference);
                    reporter.fatal(&title, &body);
                    return Ok(RunOutcome::Exit(1));
                }
                Err(PortError::Other { message }) => {
                    reporter.fatal(
                        "WEB SOCKET SERVER FAILED",
                        &format!("Could not start the web socket server:\n{message}"),
                    );
                    return Ok(RunOutcome::Exit(1));
                }
            }
        }
    };

    let pool = passthrough.pool.take().unwrap_or_default();
    let desired_workers = Arc::new(AtomicUsize::new(num_cpus::get()));
    {
        let desired_workers = desired_workers.clone();
        pool.set_calculate_max(Arc::new(move || {
            desired_workers.load(Ordering::SeqCst)
        }));
    }

    // Persist the port and token right away so browser pages can find us
    // again after a crash.
    let persist_now =
        state_file::snapshot(&project, server.port, &server.token);
    if let Err(e) = state_file::write(&project.state_file_path, &persist_now) {
        reporter.warning(&format!(
            "failed to write `{}`: {e}",
            project.state_file_path.display()
        ));
    }

    let env = ExecuteEnv {
        run_mode: RunMode::Hot,
        postprocess_argv: match &project.postprocess {
            PostprocessConfig::NoPostprocess => None,
            PostprocessConfig::Command(argv) => Some(argv.clone()),
        },
        pool: pool.clone(),
        web_socket_port: server.port,
        debug_client: flags.debug,
    };

    // The watcher lives exactly as long as this run.
    let (watch_tx, mut watch_rx) = mpsc::unbounded_channel::<WatcherNotification>();
    let _watcher = watcher::start(&project.watch_root, watch_tx)
        .context("failed to start the file watcher")?;
    {
        let msg_tx = msg_tx.clone();
        tokio::task::spawn(async move {
            while let Some(notification) = watch_rx.recv().await {
                let msg = match notification {
                    WatcherNotification::Event(RawWatcherEvent { kind, path }) => {
                        Msg::GotWatcherEvent { kind, path }
                    }
                    WatcherNotification::FatalError(message) => Msg::WatcherFatal { message },
                };
                if msg_tx.send(msg).is_err() {
                    break;
                }
            }
        });
    }

    project.mark_all_dirty();

    static GENERATION_BASE: AtomicUsize = AtomicUsize::new(0);
    let generation_base =
        GENERATION_BASE.fetch_add(1, Ordering::SeqCst) as u64 * 1_000_000;
    let mut model = Model::new(generation_base);
    let mut state = RunState {
        project,
        connections: Connections::new(),
        server,
        pool,
        env,
        msg_tx: msg_tx.clone(),
        pending_sleep: None,
        worker_limit_timer: None,
        install_kill: KillSwitch::new(),
        desired_workers,
        exit_when_idle: None,
        flags,
        started_at: Instant::now(),
    };

    // Kick things off.
    let startup_cmds = vec![Cmd::ClearScreen, Cmd::InstallDependencies];
    if let Some(signal) = run_cmds(startup_cmds, &mut state, reporter).await? {
        return Ok(finish(signal, &mut model, &mut state, passthrough).await);
    }
    reporter.note(&format!(
        "listening on ws://127.0.0.1:{}",
        state.server.port
    ));

    let mut sigint = signal(SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup())
        .context("failed to register SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;

    let signal_result = loop {
        let msg = tokio::select! {
            msg = msg_rx.recv() => match msg {
                Some(msg) => msg,
                None => break LoopSignal::Exit(1),
            },
            _ = sigint.recv() => break LoopSignal::Signal(libc::SIGINT),
            _ = sighup.recv() => break LoopSignal::Signal(libc::SIGHUP),
            _ = sigterm.recv() => break LoopSignal::Signal(libc::SIGTERM),
        };

        // Pre-processing owned by the event loop: raw job results are
        // applied to the project here (finishing the executor's work),
        // and closed connections leave the registry, before the reducer
        // sees the message.
        let msg = match msg {
            Msg::CompilationPartDone {
                part: PartDone::Finished(finished),
            } => {
                let output = finished.output.clone();
                let result = match state.project.target_mut(&output) {
                    Some(target) => execute::apply_finished(target, *finished),
                    None => HandleResult::Nothing,
                };
                if let Some(target) = state.project.target(&output) {
                    reporter.status_line(target);
                }
                Msg::CompilationPartDone {
                    part: PartDone::Applied { output, result },
                }
            }
            Msg::WebSocketClosed { id } => {
                state.connections.remove(&id);
                Msg::WebSocketClosed { id }
            }
            other => other,
        };

        match msg {
            Msg::ExitRequested => break LoopSignal::Exit(0),
            Msg::WatcherFatal { message } => {
                reporter.fatal(
                    "FILE WATCHER FAILED",
                    &format!("The file watcher reported a fatal error:\n{message}"),
                );
                break LoopSignal::Exit(1);
            }
            msg => {
                let now_ms = state.now_ms();
                let cmds = update(
                    msg,
                    &mut model,
                    &state.project,
                    &state.connections,
                    now_ms,
                    &state.flags,
                );
                if let Some(signal) = run_cmds(cmds, &mut state, reporter).await? {
                    break signal;
                }
                if let Some(code) = state.exit_when_idle {
                    if state.project.num_executing() == 0 {
                        break LoopSignal::Exit(code);
                    }
                }
            }
        }
    };

    Ok(finish(signal_result, &mut model, &mut state, passthrough).await)
}

/// Tear down one run. Signals re-raise after restoring the default
/// handler so the parent process sees the real cause of death.
async fn finish(
    signal: LoopSignal,
    model: &mut Model,
    state: &mut RunState,
    passthrough: &mut Passthrough,
) -> RunOutcome {
    // Cancel whatever is still in flight.
    state.install_kill.kill(true);
    for target in state.project.targets() {
        match &target.status {
            OutputStatus::Compiling { kill, .. }
            | OutputStatus::Postprocessing { kill, .. }
            | OutputStatus::TypecheckOnly { kill, .. } => kill.kill(true),
            _ => {}
        }
    }
    if let Some(handle) = state.pending_sleep.take() {
        handle.abort();
    }
    if let Some(handle) = state.worker_limit_timer.take() {
        handle.abort();
    }

    match signal {
        LoopSignal::Restart { watch_config_changed } => {
            passthrough.server = Some(state.server.clone());
            passthrough.pool = Some(state.pool.clone());
            RunOutcome::Restart {
                watch_config_changed,
                reasons: model.drain_events(),
            }
        }
        LoopSignal::Exit(code) => {
            state.server.shutdown();
            state.pool.terminate().await;
            RunOutcome::Exit(code)
        }
        LoopSignal::Signal(signum) => {
            state.server.shutdown();
            state.pool.terminate().await;
            // Restore the default handler and re-kill ourselves so the
            // exit status reflects the signal.
            unsafe {
                libc::signal(signum, libc::SIG_DFL);
                libc::kill(libc::getpid(), signum);
            }
            RunOutcome::Exit(1)
        }
    }
}

fn port_conflict_template(project: &Project, preference: PortPreference) -> (String, String) {
    match preference {
        PortPreference::PortFromConfig(port) => (
            "PORT CONFLICT".to_owned(),
            format!(
                "The port {port} from `elm-watch.json` is already in use.\n\
                 Pick another port or remove the `port` field."
            ),
        ),
        PortPreference::PersistedPort(port) => (
            "PORT CONFLICT".to_owned(),
            format!(
                "The previously used port {port} is already in use.\n\
                 Deleting `{}` makes the next run pick a fresh port.",
                project.state_file_path.display()
            ),
        ),
        PortPreference::NoPort => (
            "PORT CONFLICT".to_owned(),
            "Could not find a free port for the web socket server.".to_owned(),
        ),
    }
}

async fn run_cmds(
    cmds: Vec<Cmd>,
    state: &mut RunState,
    reporter: &mut Reporter,
) -> Result<Option<LoopSignal>> {
    for cmd in cmds {
        if let Some(signal) = run_cmd(cmd, state, reporter).await? {
            return Ok(Some(signal));
        }
    }
    Ok(None)
}

async fn run_cmd(
    cmd: Cmd,
    state: &mut RunState,
    reporter: &mut Reporter,
) -> Result<Option<LoopSignal>> {
    match cmd {
        Cmd::ClearScreen => {
            reporter.clear_screen();
        }

        Cmd::InstallDependencies => {
            state.install_kill = KillSwitch::new();
            let kill = state.install_kill.clone();
            let groups: Vec<(PathBuf, Vec<_>)> = state
                .project
                .groups
                .iter()
                .map(|g| {
                    let inputs = g
                        .targets
                        .iter()
                        .flat_map(|t| t.inputs.iter().cloned())
                        .collect();
                    (g.elm_json_path.clone(), inputs)
                })
                .collect();
            let msg_tx = state.msg_tx.clone();
            tokio::task::spawn(async move {
                let result = match execute::install_all_dependencies(groups, &kill).await {
                    Ok(()) => InstallOutcome::Success,
                    Err((elm_json_path, message)) if message == "killed" => {
                        let _ = elm_json_path;
                        InstallOutcome::Killed
                    }
                    Err((elm_json_path, message)) => InstallOutcome::Error {
                        elm_json_path,
                        message,
                    },
                };
                let _ = msg_tx.send(Msg::InstallDependenciesDone { result });
            });
        }

        Cmd::CompileAllOutputsAsNeeded {
            include_interrupted,
        } => {
            compile_all_outputs_as_needed(include_interrupted, state, reporter);
        }

        Cmd::MarkAsDirty {
            outputs,
            kill_install_dependencies,
        } => {
            if kill_install_dependencies {
                state.install_kill.kill(true);
            }
            for output in outputs {
                if let Some(target) = state.project.target(&output) {
                    target.mark_dirty();
                    if let OutputStatus::Postprocessing { kill, .. } = &target.status {
                        kill.kill(false);
                    }
                }
            }
        }

        Cmd::MarkInstallFailed {
            elm_json_path,
            message,
        } => {
            reporter.error(&format!(
                "failed to install dependencies for `{}`: {message}",
                elm_json_path.display()
            ));
            for group in state
                .project
                .groups
                .iter_mut()
                .filter(|g| g.elm_json_path == elm_json_path)
            {
                for target in &mut group.targets {
                    target.status = OutputStatus::Error(OutputError::DependenciesError {
                        elm_json_path: elm_json_path.clone(),
                        message: message.clone(),
                    });
                }
            }
        }

        Cmd::RestartWorkers => {
            state.pool.terminate().await;
        }

        Cmd::LimitWorkers => {
            let distinct: std::collections::HashSet<&OutputPath> = state
                .connections
                .values()
                .filter_map(|c| c.output.as_ref().ok())
                .collect();
            state
                .desired_workers
                .store(distinct.len().max(1), Ordering::SeqCst);
            let num_terminated = state.pool.limit().await;
            let _ = state.msg_tx.send(Msg::WorkersLimited { num_terminated });
        }

        Cmd::Restart {
            watch_config_changed,
        } => {
            return Ok(Some(LoopSignal::Restart {
                watch_config_changed,
            }));
        }

        Cmd::ExitOnIdle { code } => {
            state.exit_when_idle = Some(code);
            if state.project.num_executing() == 0 {
                return Ok(Some(LoopSignal::Exit(code)));
            }
        }

        Cmd::LogInfoMessageWithTimeline { message, events } => {
            reporter.note(&message);
            reporter.timeline(&events);
            for target in state.project.targets() {
                reporter.status_line(target);
            }
        }

        Cmd::PrintCompileErrors => {
            for target in state.project.targets() {
                if let OutputStatus::Error(error) = &target.status {
                    match error {
                        OutputError::CompileErrors { errors } => {
                            reporter.compile_errors(&target.name, errors);
                        }
                        other => reporter.error(&format!("{}: {other}", target.name)),
                    }
                }
            }
        }

        Cmd::PersistState => {
            let snapshot = state_file::snapshot(
                &state.project,
                state.server.port,
                &state.server.token,
            );
            if let Err(e) = state_file::write(&state.project.state_file_path, &snapshot) {
                reporter.warning(&format!(
                    "failed to write `{}`: {e}",
                    state.project.state_file_path.display()
                ));
            }
        }

        Cmd::OpenEditor {
            id,
            file,
            line,
            column,
        } => {
            let watch_root = state.project.watch_root.clone();
            let server = state.server.clone();
            tokio::task::spawn(async move {
                if let Err(error) = editor::open_editor(&watch_root, &file, line, column).await
                {
                    server
                        .send(id, &ServerFrame::OpenEditorFailed { error })
                        .await;
                }
            });
        }

        Cmd::SleepBeforeNextAction { ms, generation } => {
            if let Some(handle) = state.pending_sleep.take() {
                handle.abort();
            }
            let msg_tx = state.msg_tx.clone();
            state.pending_sleep = Some(tokio::task::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = msg_tx.send(Msg::SleepBeforeNextActionDone { generation });
            }));
        }

        Cmd::WebSocketSend { id, frame } => {
            state.server.send(id, &frame).await;
        }

        Cmd::WebSocketSendToOutput { output, frame } => {
            let ids: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.output.as_ref() == Ok(&output))
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                state.server.send(id, &frame).await;
            }
        }

        Cmd::WebSocketSendCompileErrorToOutput { output } => {
            if let Some(target) = state.project.target(&output) {
                let frame = compile_error_frame(target);
                let ids: Vec<u64> = state
                    .connections
                    .iter()
                    .filter(|(_, c)| c.output.as_ref() == Ok(&output))
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    state.server.send(id, &frame).await;
                }
            }
        }

        Cmd::WebSocketUpdatePriority { id } => {
            let now_ms = state.now_ms();
            if let Some(connection) = state.connections.get_mut(&id) {
                connection.priority = connection.priority.max(now_ms);
            }
        }

        Cmd::RegisterConnection {
            id,
            output,
            priority,
        } => {
            state
                .connections
                .insert(id, ConnectionState { output, priority });
        }

        Cmd::ChangeCompilationMode { output, mode } => {
            if let Some(target) = state.project.target_mut(&output) {
                target.compilation_mode = mode;
            }
        }

        Cmd::ChangeBrowserUiPosition { output, position } => {
            if let Some(target) = state.project.target_mut(&output) {
                target.browser_ui_position = position;
            }
        }

        Cmd::ChangeOpenErrorOverlay { output, open } => {
            if let Some(target) = state.project.target_mut(&output) {
                target.open_error_overlay = open;
            }
        }

        Cmd::ArmWorkerLimitTimer => {
            if let Some(handle) = state.worker_limit_timer.take() {
                handle.abort();
            }
            let ms = state.flags.worker_limit_timeout_ms;
            let msg_tx = state.msg_tx.clone();
            state.worker_limit_timer = Some(tokio::task::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = msg_tx.send(Msg::WorkerLimitTimeoutPassed);
            }));
        }

        Cmd::Throw { message } => {
            bail!(message);
        }
    }

    Ok(None)
}

/// Plan and start actions. Finished jobs come back as
/// `CompilationPartDone` messages; a tick that starts nothing synthesizes
/// one so the reducer can close the batch.
fn compile_all_outputs_as_needed(
    include_interrupted: bool,
    state: &mut RunState,
    reporter: &mut Reporter,
) {
    let priorities = priorities_from_connections(&state.connections);
    let actions = plan::plan(&state.project, RunMode::Hot, include_interrupted, &priorities);
    let started_any = actions.num_started() > 0;

    for action in actions.actions {
        match action {
            OutputAction::Compile { output, .. } => {
                let elm_json_path = state
                    .project
                    .group_of(&output)
                    .map(|g| g.elm_json_path.clone())
                    .expect("planner only names known outputs");
                let target = state
                    .project
                    .target_mut(&output)
                    .expect("known output");
                let job = execute::start_compile_action(target, &elm_json_path);
                reporter.status_line(state.project.target(&output).expect("known output"));
                spawn_part(execute::run_compile(job, state.env.clone()), state);
            }

            OutputAction::Postprocess {
                output,
                code,
                compiled_timestamp,
                record_fields,
                durations,
                ..
            } => {
                let target = state
                    .project
                    .target_mut(&output)
                    .expect("known output");
                let job = execute::PostprocessJob {
                    output: target.output.clone(),
                    target_name: target.name.clone(),
                    code,
                    compiled_timestamp,
                    record_fields,
                    record_fields_before: target.record_fields.clone(),
                    durations: durations.clone(),
                    mode: target.compilation_mode,
                    dirty: target.dirty_flag(),
                };
                let (kill, fut) = execute::begin_postprocess(job, &state.env);
                target.status = OutputStatus::Postprocessing { kill, durations };
                spawn_part(fut, state);
            }

            OutputAction::TypecheckOnly {
                elm_json_path,
                outputs,
            } => {
                let group = state
                    .project
                    .groups
                    .iter_mut()
                    .find(|g| g.elm_json_path == elm_json_path)
                    .expect("planner only names known groups");
                let mut targets: Vec<&mut Target> = group
                    .targets
                    .iter_mut()
                    .filter(|t| outputs.contains(&t.output))
                    .collect();
                let job = execute::start_typecheck_action(&mut targets, &elm_json_path);
                let env = state.env.clone();
                let msg_tx = state.msg_tx.clone();
                tokio::task::spawn(async move {
                    for finished in execute::run_typecheck(job, env).await {
                        let _ = msg_tx.send(Msg::CompilationPartDone {
                            part: PartDone::Finished(Box::new(finished)),
                        });
                    }
                });
            }

            OutputAction::QueueForCompile { output } => {
                let target = state
                    .project
                    .target_mut(&output)
                    .expect("known output");
                execute::queue_for_compile(target);
                reporter.status_line(state.project.target(&output).expect("known output"));
            }
        }
    }

    if !started_any && state.project.num_executing() == 0 {
        let _ = state.msg_tx.send(Msg::CompilationPartDone {
            part: PartDone::NothingToStart,
        });
    }
}

fn spawn_part<F>(fut: F, state: &RunState)
where
    F: std::future::Future<Output = CompileFinished> + Send + 'static,
{
    let msg_tx = state.msg_tx.clone();
    tokio::task::spawn(async move {
        let finished = fut.await;
        let _ = msg_tx.send(Msg::CompilationPartDone {
            part: PartDone::Finished(Box::new(finished)),
        });
    });
}

/// Build the error status frame for one target. Problems with the
/// project's own `elm.json` get their dedicated frame; everything else is
/// a compile error listing.
pub fn compile_error_frame(target: &Target) -> ServerFrame {
    if let OutputStatus::Error(
        error @ (OutputError::ElmJsonReadError { .. } | OutputError::ElmJsonDecodeError { .. }),
    ) = &target.status
    {
        return ServerFrame::StatusChanged {
            status: StatusFrame::ElmJsonError {
                error: error.to_string(),
            },
        };
    }

    let errors: Vec<ElmError> = match &target.status {
        OutputStatus::Error(OutputError::CompileErrors { errors }) => errors.clone(),
        OutputStatus::Error(other) => vec![ElmError {
            path: None,
            name: target.name.clone(),
            problems: vec![crate::compile::Problem {
                title: "BUILD FAILED".to_owned(),
                region: crate::compile::Region {
                    start: crate::compile::Position { line: 1, column: 1 },
                    end: crate::compile::Position { line: 1, column: 1 },
                },
                message: vec![crate::compile::MessageChunk::Unstyled(other.to_string())],
            }],
        }],
        _ => Vec::new(),
    };

    ServerFrame::StatusChanged {
        status: StatusFrame::CompileError {
            compilation_mode: target.compilation_mode,
            browser_ui_position: target.browser_ui_position.clone(),
            open_error_overlay: target.open_error_overlay,
            errors,
            foreground_color: report::overlay_foreground_color(),
            background_color: report::overlay_background_color(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{InputPath, ProjectGroup};

    fn output_path(name: &str) -> OutputPath {
        OutputPath::new(
            PathBuf::from(format!("/proj/build/{name}.js")),
            format!("build/{name}.js"),
        )
    }

    fn target(name: &str, index: usize) -> Target {
        Target::new(
            name.to_owned(),
            output_path(name),
            index,
            vec![InputPath {
                absolute: PathBuf::from(format!("/proj/src/{name}.elm")),
                original: format!("src/{name}.elm"),
            }],
        )
    }

    fn project(targets: Vec<Target>) -> Project {
        Project {
            watch_root: PathBuf::from("/proj"),
            watch_config_path: PathBuf::from("/proj/elm-watch.json"),
            state_file_path: PathBuf::from("/proj/elm-stuff/elm-watch-state.json"),
            postprocess: PostprocessConfig::NoPostprocess,
            port_from_config: None,
            max_parallel: 4,
            groups: vec![ProjectGroup {
                elm_json_path: PathBuf::from("/proj/elm.json"),
                source_directories: vec![PathBuf::from("/proj/src")],
                targets,
            }],
            disabled: Vec::new(),
        }
    }

    fn model() -> Model {
        let mut model = Model::new(0);
        model.install_in_flight = false;
        model.hot_state = HotState::Idle;
        model
    }

    fn flags() -> HotFlags {
        HotFlags::default()
    }

    fn sleep_of(cmds: &[Cmd]) -> Option<(u64, u64)> {
        cmds.iter().find_map(|cmd| match cmd {
            Cmd::SleepBeforeNextAction { ms, generation } => Some((*ms, *generation)),
            _ => None,
        })
    }

    #[test]
    fn source_change_marks_affected_targets_dirty() {
        let mut t = target("a", 0);
        t.all_related_source_paths
            .insert(PathBuf::from("/proj/src/Util.elm"));
        let project = project(vec![t, target("b", 1)]);
        let mut model = model();

        let cmds = update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/src/Util.elm"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert_eq!(model.next_action, NextAction::Compile);
        match &cmds[0] {
            Cmd::MarkAsDirty { outputs, .. } => {
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs[0].original, "build/a.js");
            }
            other => panic!("unexpected cmd: {other:?}"),
        }
        assert_eq!(sleep_of(&cmds).unwrap().0, WATCHER_DEBOUNCE_MS);
    }

    #[test]
    fn unrelated_source_change_records_but_schedules_nothing() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        let cmds = update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/src/Elsewhere.elm"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert_eq!(model.next_action, NextAction::NoAction);
        assert!(matches!(
            model.latest_events.last(),
            Some(Event::WatcherEvent {
                affects_any_target: false,
                ..
            })
        ));
        assert!(sleep_of(&cmds).is_some());
    }

    #[test]
    fn non_source_noise_is_ignored_entirely() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        let cmds = update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/README.md"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert!(cmds.is_empty());
        assert!(model.latest_events.is_empty());
    }

    #[test]
    fn watch_config_change_escalates_to_restart() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        let cmds = update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/elm-watch.json"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert_eq!(model.next_action, NextAction::Restart);
        assert!(matches!(
            &cmds[0],
            Cmd::MarkAsDirty {
                kill_install_dependencies: true,
                ..
            }
        ));
    }

    #[test]
    fn restart_is_never_downgraded_by_a_later_source_change() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/elm-watch.json"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/src/a.elm"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert_eq!(model.next_action, NextAction::Restart);
    }

    #[test]
    fn only_the_latest_sleep_generation_fires() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        let first = update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/src/a.elm"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        let (_, first_generation) = sleep_of(&first).unwrap();

        let second = update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/src/a.elm"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        let (_, second_generation) = sleep_of(&second).unwrap();
        assert!(second_generation > first_generation);

        // The interpreter would have run MarkAsDirty by now; do it by hand.
        for target in project.targets() {
            target.mark_dirty();
        }

        // The stale timer is a no-op.
        let cmds = update(
            Msg::SleepBeforeNextActionDone {
                generation: first_generation,
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        assert!(cmds.is_empty());

        // The fresh one starts the compile pass.
        let cmds = update(
            Msg::SleepBeforeNextActionDone {
                generation: second_generation,
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        assert!(matches!(
            cmds[0],
            Cmd::CompileAllOutputsAsNeeded { .. }
        ));
        assert!(matches!(model.hot_state, HotState::Compiling { .. }));
    }

    #[test]
    fn debounce_takes_the_batch_maximum() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        let cmds = update(
            Msg::GotWatcherEvent {
                kind: WatcherEventKind::Changed,
                path: PathBuf::from("/proj/src/a.elm"),
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        assert_eq!(sleep_of(&cmds).unwrap().0, WATCHER_DEBOUNCE_MS);

        // A WebSocket close in the same batch raises the window to 100 ms.
        let cmds = update(
            Msg::WebSocketClosed { id: 1 },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        assert_eq!(sleep_of(&cmds).unwrap().0, WEB_SOCKET_DEBOUNCE_MS);
    }

    fn params_for(name: &str, timestamp: u64) -> WebSocketParams {
        WebSocketParams {
            elm_watch_version: crate::protocol::PROTOCOL_VERSION.to_owned(),
            web_socket_token: "t".to_owned(),
            target_name: name.to_owned(),
            elm_compiled_timestamp: timestamp,
        }
    }

    #[test]
    fn up_to_date_client_is_not_marked_dirty() {
        let mut t = target("a", 0);
        t.status = OutputStatus::Success {
            artifact_size: 1,
            postprocess_size: None,
            compiled_timestamp: 777,
            durations: Vec::new(),
        };
        let project = project(vec![t]);
        let mut model = model();

        let cmds = update(
            Msg::WebSocketConnected {
                id: 1,
                params: Ok(params_for("a", 777)),
            },
            &mut model,
            &project,
            &Connections::new(),
            5,
            &flags(),
        );

        assert_eq!(model.next_action, NextAction::NoAction);
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::WebSocketSend {
                frame: ServerFrame::StatusChanged {
                    status: StatusFrame::AlreadyUpToDate { .. }
                },
                ..
            }
        )));
        assert!(!cmds
            .iter()
            .any(|cmd| matches!(cmd, Cmd::MarkAsDirty { .. })));
    }

    #[test]
    fn stale_client_triggers_a_compile() {
        let mut t = target("a", 0);
        t.status = OutputStatus::Success {
            artifact_size: 1,
            postprocess_size: None,
            compiled_timestamp: 777,
            durations: Vec::new(),
        };
        let project = project(vec![t]);
        let mut model = model();

        let cmds = update(
            Msg::WebSocketConnected {
                id: 1,
                params: Ok(params_for("a", 123)),
            },
            &mut model,
            &project,
            &Connections::new(),
            5,
            &flags(),
        );

        assert_eq!(model.next_action, NextAction::Compile);
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, Cmd::MarkAsDirty { .. })));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::WebSocketSend {
                frame: ServerFrame::StatusChanged {
                    status: StatusFrame::Busy { .. }
                },
                ..
            }
        )));
    }

    #[test]
    fn unknown_target_gets_a_client_error_and_an_error_connection() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        let cmds = update(
            Msg::WebSocketConnected {
                id: 9,
                params: Ok(params_for("nope", 1)),
            },
            &mut model,
            &project,
            &Connections::new(),
            5,
            &flags(),
        );

        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::RegisterConnection { output: Err(()), .. }
        )));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::WebSocketSend {
                frame: ServerFrame::StatusChanged {
                    status: StatusFrame::ClientError { .. }
                },
                ..
            }
        )));
    }

    #[test]
    fn restart_waits_for_executing_work() {
        let mut t = target("a", 0);
        t.status = OutputStatus::Compiling {
            mode: CompilationMode::Standard,
            start: Instant::now(),
            durations: Vec::new(),
            kill: KillSwitch::new(),
        };
        let project = project(vec![t]);
        let mut model = model();
        model.next_action = NextAction::Restart;
        model.sleep_generation = 1;

        let cmds = update(
            Msg::SleepBeforeNextActionDone { generation: 1 },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert!(matches!(model.hot_state, HotState::Restarting));
        assert!(!cmds.iter().any(|cmd| matches!(cmd, Cmd::Restart { .. })));
    }

    #[test]
    fn restart_fires_once_the_last_part_finishes() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();
        model.hot_state = HotState::Restarting;

        let cmds = update(
            Msg::CompilationPartDone {
                part: PartDone::Applied {
                    output: output_path("a"),
                    result: HandleResult::Nothing,
                },
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert!(cmds.iter().any(|cmd| matches!(cmd, Cmd::Restart { .. })));
    }

    #[test]
    fn finished_batch_returns_to_idle_and_logs() {
        let mut t = target("a", 0);
        t.status = OutputStatus::Success {
            artifact_size: 1,
            postprocess_size: None,
            compiled_timestamp: 1,
            durations: Vec::new(),
        };
        let project = project(vec![t]);
        let mut model = model();
        model.hot_state = HotState::Compiling {
            start: Instant::now() - Duration::from_secs(1),
        };
        model.latest_events.push(Event::WebSocketClosed);

        let cmds = update(
            Msg::CompilationPartDone {
                part: PartDone::Applied {
                    output: output_path("a"),
                    result: HandleResult::Nothing,
                },
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert!(matches!(model.hot_state, HotState::Idle));
        assert!(model.latest_events.is_empty());
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::LogInfoMessageWithTimeline { .. }
        )));
    }

    #[test]
    fn compile_error_parts_notify_the_relevant_clients() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();
        model.hot_state = HotState::Compiling {
            start: Instant::now(),
        };

        let cmds = update(
            Msg::CompilationPartDone {
                part: PartDone::Applied {
                    output: output_path("a"),
                    result: HandleResult::CompileError,
                },
            },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );

        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::WebSocketSendCompileErrorToOutput { .. }
        )));
    }

    #[test]
    fn worker_limit_timer_rearms_per_close_and_limits_on_fire() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();

        let cmds = update(
            Msg::WebSocketClosed { id: 3 },
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, Cmd::ArmWorkerLimitTimer)));

        let cmds = update(
            Msg::WorkerLimitTimeoutPassed,
            &mut model,
            &project,
            &Connections::new(),
            0,
            &flags(),
        );
        assert!(cmds.iter().any(|cmd| matches!(cmd, Cmd::LimitWorkers)));
    }

    #[test]
    fn persisted_port_conflict_names_the_state_file() {
        let project = project(vec![target("a", 0)]);
        let (title, body) =
            port_conflict_template(&project, PortPreference::PersistedPort(12345));
        assert_eq!(title, "PORT CONFLICT");
        assert!(body.contains("12345"));
        assert!(body.contains("elm-watch-state.json"));
    }

    #[test]
    fn priorities_take_the_maximum_per_output() {
        let mut connections = Connections::new();
        connections.insert(
            1,
            ConnectionState {
                output: Ok(output_path("a")),
                priority: 10,
            },
        );
        connections.insert(
            2,
            ConnectionState {
                output: Ok(output_path("a")),
                priority: 50,
            },
        );
        connections.insert(
            3,
            ConnectionState {
                output: Err(()),
                priority: 99,
            },
        );

        match priorities_from_connections(&connections) {
            Priorities::ByOutput(map) => {
                assert_eq!(map.len(), 1);
                assert_eq!(map[&output_path("a")], 50);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn changed_compilation_mode_persists_and_recompiles() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();
        let mut connections = Connections::new();
        connections.insert(
            1,
            ConnectionState {
                output: Ok(output_path("a")),
                priority: 0,
            },
        );

        let cmds = update(
            Msg::WebSocketMessageReceived {
                id: 1,
                data: r#"{"tag":"ChangedCompilationMode","compilationMode":"optimize"}"#
                    .to_owned(),
            },
            &mut model,
            &project,
            &connections,
            0,
            &flags(),
        );

        assert_eq!(model.next_action, NextAction::Compile);
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::ChangeCompilationMode {
                mode: CompilationMode::Optimize,
                ..
            }
        )));
        assert!(cmds.iter().any(|cmd| matches!(cmd, Cmd::PersistState)));
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, Cmd::MarkAsDirty { .. })));
        assert_eq!(sleep_of(&cmds).unwrap().0, UI_CHANGE_DEBOUNCE_MS);
    }

    #[test]
    fn focused_tab_acknowledges_and_bumps_priority() {
        let project = project(vec![target("a", 0)]);
        let mut model = model();
        let mut connections = Connections::new();
        connections.insert(
            1,
            ConnectionState {
                output: Ok(output_path("a")),
                priority: 0,
            },
        );

        let cmds = update(
            Msg::WebSocketMessageReceived {
                id: 1,
                data: r#"{"tag":"FocusedTab"}"#.to_owned(),
            },
            &mut model,
            &project,
            &connections,
            1234,
            &flags(),
        );

        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, Cmd::WebSocketUpdatePriority { id: 1 })));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            Cmd::WebSocketSend {
                frame: ServerFrame::FocusedTabAcknowledged,
                ..
            }
        )));
    }
}
