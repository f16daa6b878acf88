// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The per-target build executor.
//!
//! Each planner action turns into a job here. Jobs are pure I/O: they get
//! an immutable snapshot of the target plus its shared dirty flag, do the
//! compiling/walking/injecting/writing, and come back as a
//! [`CompileFinished`] that the owner applies to the target's status. A
//! dirty flag flipping mid-job discards the work as `Interrupted`.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    time::Instant,
};

use futures::future::join_all;

use crate::compile::{self, CompileResult, ElmError, ElmReport, OutputTarget};
use crate::importgraph::{self, WalkResult};
use crate::inject;
use crate::postprocess::{PostprocessResult, PostprocessSpec, WorkerPool};
use crate::project::{
    CompilationMode, CompiledTimestamp, InputPath, KillSwitch, LabeledDuration, OutputError,
    OutputPath, OutputStatus, RunMode, WriteOutputReason, now_timestamp,
};

/// Ambient settings shared by all jobs of one run.
#[derive(Clone)]
pub struct ExecuteEnv {
    pub run_mode: RunMode,
    pub postprocess_argv: Option<Vec<String>>,
    pub pool: WorkerPool,
    /// The WebSocket port baked into prologues. Unused in batch mode.
    pub web_socket_port: u16,
    pub debug_client: bool,
}

/// What the caller (and connected clients) need to know about a finished
/// job for one target.
#[derive(Debug)]
pub enum HandleResult {
    CompileError,
    FullyCompiledJS {
        code: String,
        compiled_timestamp: CompiledTimestamp,
        compilation_mode: CompilationMode,
    },
    FullyCompiledJSButRecordFieldsChanged,
    Nothing,
}

/// The full effect of a finished job, to be applied to the target by
/// whoever owns the project.
#[derive(Debug)]
pub struct CompileFinished {
    pub output: OutputPath,
    pub new_status: OutputStatus,
    /// `Some` when the walker produced a fresh import closure.
    pub new_related_paths: Option<BTreeSet<PathBuf>>,
    /// `Some` when the record-field set should be stored.
    pub new_record_fields: Option<Option<BTreeSet<String>>>,
    /// Re-mark the target dirty (killed postprocess work must rerun).
    pub set_dirty: bool,
    pub result: HandleResult,
}

impl CompileFinished {
    fn plain(output: OutputPath, new_status: OutputStatus, result: HandleResult) -> Self {
        CompileFinished {
            output,
            new_status,
            new_related_paths: None,
            new_record_fields: None,
            set_dirty: false,
            result,
        }
    }
}

/// Snapshot of one target for a compile job.
#[derive(Clone, Debug)]
pub struct CompileJob {
    pub output: OutputPath,
    pub target_name: String,
    pub inputs: Vec<InputPath>,
    pub mode: CompilationMode,
    pub elm_json_path: PathBuf,
    pub kill: KillSwitch,
    pub dirty: Arc<AtomicBool>,
    /// Durations carried over from queueing, if any.
    pub durations: Vec<LabeledDuration>,
    pub record_fields_before: Option<BTreeSet<String>>,
}

fn elm_json_dir(elm_json_path: &Path) -> &Path {
    elm_json_path.parent().unwrap_or_else(|| Path::new("."))
}

fn write_artifact_atomically(output: &OutputPath, code: &str) -> std::io::Result<()> {
    if let Some(parent) = output.absolute.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output.temp, code)?;
    std::fs::rename(&output.temp, &output.absolute)
}

fn compile_error_status(output: &OutputPath, result: CompileResult) -> OutputStatus {
    let error = match result {
        CompileResult::ElmNotFound { command } => OutputError::ElmNotFound { command },
        CompileResult::CommandRun { message } => OutputError::CommandRun { message },
        CompileResult::JsonParseError { message, raw } => {
            OutputError::ElmMakeJsonParseError { message, raw }
        }
        CompileResult::Report(ElmReport::CompileErrors { errors }) => {
            OutputError::CompileErrors { errors }
        }
        CompileResult::Report(ElmReport::GeneralError {
            path,
            title,
            message,
        }) => OutputError::GeneralCompilerError {
            title,
            message: compile::message_to_plain_text(&message),
            path,
        },
        CompileResult::UnexpectedOutput { stdout, stderr } => {
            OutputError::UnexpectedCompilerOutput { stdout, stderr }
        }
        CompileResult::Success | CompileResult::Killed => OutputError::StuckInProgress {
            what: format!("`{}` was not an error", output.original),
        },
    };
    OutputStatus::Error(error)
}

fn walker_error_status(result: &WalkResult) -> Option<OutputStatus> {
    match result {
        WalkResult::Success { .. } => None,
        WalkResult::PartialFailure { path, message, .. } => {
            Some(OutputStatus::Error(OutputError::ImportWalkerFileError {
                path: path.clone(),
                message: message.clone(),
            }))
        }
        WalkResult::ElmJsonError { path, message } => {
            Some(OutputStatus::Error(OutputError::ElmJsonDecodeError {
                path: path.clone(),
                message: message.clone(),
            }))
        }
    }
}

fn walker_paths(result: &WalkResult, inputs: &[InputPath]) -> Option<BTreeSet<PathBuf>> {
    match result {
        WalkResult::Success {
            all_related_source_paths,
        } => Some(all_related_source_paths.clone()),
        // Keep whatever was discovered plus the declared inputs, so the
        // target stays reachable by watcher events.
        WalkResult::PartialFailure { discovered, .. } => {
            let mut paths = discovered.clone();
            for input in inputs {
                paths.insert(input.absolute.clone());
            }
            Some(paths)
        }
        WalkResult::ElmJsonError { .. } => None,
    }
}

/// Run one compile action to completion.
pub async fn run_compile(job: CompileJob, env: ExecuteEnv) -> CompileFinished {
    let compile_start = Instant::now();
    let mut durations = job.durations.clone();

    let compile_fut = compile::run(
        &job.inputs,
        job.mode,
        OutputTarget::File(job.output.absolute.clone()),
        elm_json_dir(&job.elm_json_path),
        &job.kill,
    );

    let (compile_result, walk_result) = match env.run_mode {
        RunMode::Hot => {
            let elm_json_path = job.elm_json_path.clone();
            let inputs = job.inputs.clone();
            let walk_fut = tokio::task::spawn_blocking(move || {
                importgraph::walk(&elm_json_path, &inputs)
            });
            let (compile_result, walk_result) = tokio::join!(compile_fut, walk_fut);
            let walk_result = walk_result.unwrap_or_else(|e| WalkResult::PartialFailure {
                discovered: BTreeSet::new(),
                path: job.elm_json_path.clone(),
                message: format!("import walker task failed: {e}"),
            });
            (compile_result, Some(walk_result))
        }
        RunMode::Make => (compile_fut.await, None),
    };

    durations.push(LabeledDuration::Compile(compile_start.elapsed()));

    if job.dirty.load(Ordering::SeqCst) || matches!(compile_result, CompileResult::Killed) {
        return CompileFinished::plain(job.output, OutputStatus::Interrupted, HandleResult::Nothing);
    }

    let new_related_paths = walk_result
        .as_ref()
        .and_then(|w| walker_paths(w, &job.inputs));

    let walker_failure = walk_result.as_ref().and_then(walker_error_status);

    if !matches!(compile_result, CompileResult::Success) {
        // Compiler failure wins over a walker failure.
        let new_status = compile_error_status(&job.output, compile_result);
        return CompileFinished {
            output: job.output,
            new_status,
            new_related_paths,
            new_record_fields: None,
            set_dirty: false,
            result: HandleResult::CompileError,
        };
    }

    if let Some(walker_status) = walker_failure {
        return CompileFinished {
            output: job.output,
            new_status: walker_status,
            new_related_paths,
            new_record_fields: None,
            set_dirty: false,
            result: HandleResult::CompileError,
        };
    }

    on_compile_success(job, env, durations, new_related_paths).await
}

async fn on_compile_success(
    job: CompileJob,
    env: ExecuteEnv,
    mut durations: Vec<LabeledDuration>,
    new_related_paths: Option<BTreeSet<PathBuf>>,
) -> CompileFinished {
    let compiled_timestamp = now_timestamp();

    match (env.run_mode, &env.postprocess_argv) {
        (RunMode::Make, None) => {
            let new_status = match std::fs::metadata(&job.output.absolute) {
                Ok(metadata) => OutputStatus::Success {
                    artifact_size: metadata.len(),
                    postprocess_size: None,
                    compiled_timestamp,
                    durations,
                },
                Err(e) => OutputStatus::Error(OutputError::ReadOutputError {
                    path: job.output.absolute.clone(),
                    message: e.to_string(),
                }),
            };
            let result = match &new_status {
                OutputStatus::Success { .. } => HandleResult::Nothing,
                _ => HandleResult::CompileError,
            };
            CompileFinished {
                output: job.output,
                new_status,
                new_related_paths,
                new_record_fields: None,
                set_dirty: false,
                result,
            }
        }

        (RunMode::Make, Some(_)) => {
            match std::fs::read_to_string(&job.output.absolute) {
                Ok(code) => CompileFinished {
                    output: job.output,
                    new_status: OutputStatus::QueuedForPostprocess {
                        code,
                        compiled_timestamp,
                        record_fields: None,
                        durations,
                    },
                    new_related_paths,
                    new_record_fields: None,
                    set_dirty: false,
                    result: HandleResult::Nothing,
                },
                Err(e) => {
                    let path = job.output.absolute.clone();
                    CompileFinished {
                    output: job.output,
                    new_status: OutputStatus::Error(OutputError::ReadOutputError {
                        path,
                        message: e.to_string(),
                    }),
                    new_related_paths,
                    new_record_fields: None,
                    set_dirty: false,
                    result: HandleResult::CompileError,
                }
                }
            }
        }

        (RunMode::Hot, postprocess) => {
            let code = match std::fs::read_to_string(&job.output.absolute) {
                Ok(code) => code,
                Err(e) => {
                    return CompileFinished {
                        output: job.output.clone(),
                        new_status: OutputStatus::Error(OutputError::ReadOutputError {
                            path: job.output.absolute.clone(),
                            message: e.to_string(),
                        }),
                        new_related_paths,
                        new_record_fields: None,
                        set_dirty: false,
                        result: HandleResult::CompileError,
                    };
                }
            };

            let inject_start = Instant::now();
            let record_fields = inject::record_fields(job.mode, &code);
            let injected = match inject::inject(&code) {
                Ok(injected) => injected,
                Err(inject::InjectError::SearchAndReplaceNotFound { probe }) => {
                    return CompileFinished {
                        output: job.output,
                        new_status: OutputStatus::Error(
                            OutputError::InjectSearchAndReplaceNotFound { probe },
                        ),
                        new_related_paths,
                        new_record_fields: None,
                        set_dirty: false,
                        result: HandleResult::CompileError,
                    };
                }
            };
            durations.push(LabeledDuration::Inject(inject_start.elapsed()));

            match postprocess {
                Some(_) => CompileFinished {
                    output: job.output,
                    new_status: OutputStatus::QueuedForPostprocess {
                        code: injected,
                        compiled_timestamp,
                        record_fields,
                        durations,
                    },
                    new_related_paths,
                    new_record_fields: None,
                    set_dirty: false,
                    result: HandleResult::Nothing,
                },
                None => {
                    let prologue = inject::client_prologue(&inject::PrologueInfo {
                        target_name: &job.target_name,
                        compiled_timestamp,
                        compilation_mode: job.mode,
                        web_socket_port: env.web_socket_port,
                        debug: env.debug_client,
                    });
                    let full_code = format!("{prologue}{injected}");

                    if let Err(e) = write_artifact_atomically(&job.output, &full_code) {
                        return CompileFinished {
                            output: job.output.clone(),
                            new_status: OutputStatus::Error(OutputError::WriteOutputError {
                                path: job.output.absolute.clone(),
                                reason: WriteOutputReason::InjectWebSocketClient,
                                message: e.to_string(),
                            }),
                            new_related_paths,
                            new_record_fields: None,
                            set_dirty: false,
                            result: HandleResult::CompileError,
                        };
                    }

                    let changed = inject::record_fields_changed(
                        job.record_fields_before.as_ref(),
                        record_fields.as_ref(),
                    );
                    let result = if changed {
                        HandleResult::FullyCompiledJSButRecordFieldsChanged
                    } else {
                        HandleResult::FullyCompiledJS {
                            code: full_code.clone(),
                            compiled_timestamp,
                            compilation_mode: job.mode,
                        }
                    };
                    CompileFinished {
                        output: job.output,
                        new_status: OutputStatus::Success {
                            artifact_size: full_code.len() as u64,
                            postprocess_size: None,
                            compiled_timestamp,
                            durations,
                        },
                        new_related_paths,
                        new_record_fields: Some(record_fields),
                        set_dirty: false,
                        result,
                    }
                }
            }
        }
    }
}

/// Snapshot of one target for a postprocess job, built from its
/// `QueuedForPostprocess` status.
#[derive(Clone, Debug)]
pub struct PostprocessJob {
    pub output: OutputPath,
    pub target_name: String,
    pub code: String,
    pub compiled_timestamp: CompiledTimestamp,
    pub record_fields: Option<BTreeSet<String>>,
    pub record_fields_before: Option<BTreeSet<String>>,
    pub durations: Vec<LabeledDuration>,
    pub mode: CompilationMode,
    pub dirty: Arc<AtomicBool>,
}

/// Start a postprocess run. The returned kill switch belongs in the
/// target's `Postprocessing` status so that going dirty can stop the
/// worker immediately.
pub fn begin_postprocess(
    job: PostprocessJob,
    env: &ExecuteEnv,
) -> (KillSwitch, impl std::future::Future<Output = CompileFinished>) {
    let argv = env
        .postprocess_argv
        .clone()
        .unwrap_or_else(|| vec!["false".to_owned()]);
    let running = env.pool.run(PostprocessSpec {
        argv,
        code: job.code.clone(),
        target_name: job.target_name.clone(),
        compilation_mode: job.mode,
        run_mode: env.run_mode,
    });
    let kill = running.kill.clone();
    let env = env.clone();

    let fut = async move {
        let postprocess_start = Instant::now();
        let result = match running.done.await {
            Ok(result) => result,
            Err(_) => PostprocessResult::Killed,
        };
        finish_postprocess(job, env, result, postprocess_start).await
    };

    (kill, fut)
}

async fn finish_postprocess(
    job: PostprocessJob,
    env: ExecuteEnv,
    result: PostprocessResult,
    postprocess_start: Instant,
) -> CompileFinished {
    let mut durations = job.durations.clone();
    durations.push(LabeledDuration::Postprocess(postprocess_start.elapsed()));

    let error = match result {
        PostprocessResult::Success { code } => {
            if job.dirty.load(Ordering::SeqCst) {
                return CompileFinished::plain(
                    job.output,
                    OutputStatus::Interrupted,
                    HandleResult::Nothing,
                );
            }

            let full_code = match env.run_mode {
                RunMode::Hot => {
                    let prologue = inject::client_prologue(&inject::PrologueInfo {
                        target_name: &job.target_name,
                        compiled_timestamp: job.compiled_timestamp,
                        compilation_mode: job.mode,
                        web_socket_port: env.web_socket_port,
                        debug: env.debug_client,
                    });
                    format!("{prologue}{code}")
                }
                RunMode::Make => code,
            };

            if let Err(e) = write_artifact_atomically(&job.output, &full_code) {
                return CompileFinished {
                    output: job.output.clone(),
                    new_status: OutputStatus::Error(OutputError::WriteOutputError {
                        path: job.output.absolute.clone(),
                        reason: WriteOutputReason::Postprocess,
                        message: e.to_string(),
                    }),
                    new_related_paths: None,
                    new_record_fields: None,
                    set_dirty: false,
                    result: HandleResult::CompileError,
                };
            }

            let changed = inject::record_fields_changed(
                job.record_fields_before.as_ref(),
                job.record_fields.as_ref(),
            );
            let result = if changed {
                HandleResult::FullyCompiledJSButRecordFieldsChanged
            } else {
                HandleResult::FullyCompiledJS {
                    code: full_code.clone(),
                    compiled_timestamp: job.compiled_timestamp,
                    compilation_mode: job.mode,
                }
            };
            return CompileFinished {
                output: job.output,
                new_status: OutputStatus::Success {
                    artifact_size: job.code.len() as u64,
                    postprocess_size: Some(full_code.len() as u64),
                    compiled_timestamp: job.compiled_timestamp,
                    durations,
                },
                new_related_paths: None,
                new_record_fields: Some(job.record_fields.clone()),
                set_dirty: false,
                result,
            };
        }

        // Killed workers leave the target dirty so the work reruns.
        PostprocessResult::Killed => {
            return CompileFinished {
                output: job.output,
                new_status: OutputStatus::Interrupted,
                new_related_paths: None,
                new_record_fields: None,
                set_dirty: true,
                result: HandleResult::Nothing,
            };
        }

        PostprocessResult::CommandNotFound { command } => {
            OutputError::PostprocessCommandNotFound { command }
        }
        PostprocessResult::SpawnError { message } => {
            OutputError::PostprocessSpawnError { message }
        }
        PostprocessResult::NonZeroExit {
            exit_code,
            stdout,
            stderr,
        } => OutputError::PostprocessNonZeroExit {
            exit_code,
            stdout,
            stderr,
        },
        PostprocessResult::NodeImportError { message } => {
            OutputError::ElmWatchNodeImportError { message }
        }
        PostprocessResult::NodeDefaultExportNotFunction { exported } => {
            OutputError::ElmWatchNodeDefaultExportNotFunction { exported }
        }
        PostprocessResult::NodeRunError { message } => {
            OutputError::ElmWatchNodeRunError { message }
        }
        PostprocessResult::NodeBadReturnValue { message } => {
            OutputError::ElmWatchNodeBadReturnValue { message }
        }
    };

    CompileFinished::plain(
        job.output,
        OutputStatus::Error(error),
        HandleResult::CompileError,
    )
}

/// Snapshot for one target inside a typecheck batch.
#[derive(Clone, Debug)]
pub struct TypecheckTarget {
    pub output: OutputPath,
    pub target_name: String,
    pub inputs: Vec<InputPath>,
    pub mode: CompilationMode,
    pub dirty: Arc<AtomicBool>,
}

/// A batched typecheck of several unwatched targets of one group.
#[derive(Clone, Debug)]
pub struct TypecheckJob {
    pub elm_json_path: PathBuf,
    pub targets: Vec<TypecheckTarget>,
    pub kill: KillSwitch,
}

/// Run one typecheck batch: a single compiler invocation, then per-target
/// error attribution and proxy writing.
pub async fn run_typecheck(job: TypecheckJob, env: ExecuteEnv) -> Vec<CompileFinished> {
    let inputs_per_target: Vec<&[InputPath]> =
        job.targets.iter().map(|t| t.inputs.as_slice()).collect();
    let merged_inputs = compile::uniq_inputs(&inputs_per_target);

    let compile_fut = compile::run(
        &merged_inputs,
        CompilationMode::Standard,
        OutputTarget::Null,
        elm_json_dir(&job.elm_json_path),
        &job.kill,
    );

    let walks_fut = join_all(job.targets.iter().map(|target| {
        let elm_json_path = job.elm_json_path.clone();
        let inputs = target.inputs.clone();
        tokio::task::spawn_blocking(move || importgraph::walk(&elm_json_path, &inputs))
    }));

    let (compile_result, walk_results) = tokio::join!(compile_fut, walks_fut);

    if matches!(compile_result, CompileResult::Killed) {
        return job
            .targets
            .into_iter()
            .map(|t| {
                CompileFinished::plain(t.output, OutputStatus::Interrupted, HandleResult::Nothing)
            })
            .collect();
    }

    let mut finished = Vec::with_capacity(job.targets.len());

    for (target, walk_result) in job.targets.iter().zip(walk_results) {
        let walk_result = walk_result.unwrap_or_else(|e| WalkResult::PartialFailure {
            discovered: BTreeSet::new(),
            path: job.elm_json_path.clone(),
            message: format!("import walker task failed: {e}"),
        });

        if target.dirty.load(Ordering::SeqCst) {
            finished.push(CompileFinished::plain(
                target.output.clone(),
                OutputStatus::Interrupted,
                HandleResult::Nothing,
            ));
            continue;
        }

        let new_related_paths = walker_paths(&walk_result, &target.inputs);

        let new_status = match &compile_result {
            CompileResult::Success => {
                typecheck_success_status(target, &env, new_related_paths.as_ref())
            }
            CompileResult::Report(ElmReport::CompileErrors { errors }) => {
                let relevant = filter_errors_for_target(
                    errors,
                    &job.elm_json_path,
                    new_related_paths.as_ref(),
                );
                if relevant.is_empty() {
                    typecheck_success_status(target, &env, new_related_paths.as_ref())
                } else {
                    OutputStatus::Error(OutputError::CompileErrors { errors: relevant })
                }
            }
            // Not addressable to a file: every target gets the error.
            other => compile_error_status_ref(&target.output, other),
        };

        let result = match new_status.category() {
            crate::project::StatusCategory::Error => HandleResult::CompileError,
            _ => HandleResult::Nothing,
        };

        finished.push(CompileFinished {
            output: target.output.clone(),
            new_status,
            new_related_paths,
            new_record_fields: None,
            set_dirty: false,
            result,
        });
    }

    finished
}

/// Keep only the errors whose source file belongs to this target. Error
/// paths in the report are relative to the `elm.json` directory.
fn filter_errors_for_target(
    errors: &[ElmError],
    elm_json_path: &Path,
    related: Option<&BTreeSet<PathBuf>>,
) -> Vec<ElmError> {
    let Some(related) = related else {
        // No import closure: attribute everything, better noisy than
        // silent.
        return errors.to_vec();
    };
    let base = elm_json_dir(elm_json_path);
    errors
        .iter()
        .filter(|error| match &error.path {
            Some(path) => {
                let absolute = if Path::new(path).is_absolute() {
                    PathBuf::from(path)
                } else {
                    base.join(path)
                };
                related.contains(&absolute)
            }
            None => true,
        })
        .cloned()
        .collect()
}

fn compile_error_status_ref(output: &OutputPath, result: &CompileResult) -> OutputStatus {
    match result {
        CompileResult::ElmNotFound { command } => OutputStatus::Error(OutputError::ElmNotFound {
            command: command.clone(),
        }),
        CompileResult::CommandRun { message } => OutputStatus::Error(OutputError::CommandRun {
            message: message.clone(),
        }),
        CompileResult::JsonParseError { message, raw } => {
            OutputStatus::Error(OutputError::ElmMakeJsonParseError {
                message: message.clone(),
                raw: raw.clone(),
            })
        }
        CompileResult::Report(ElmReport::GeneralError {
            path,
            title,
            message,
        }) => OutputStatus::Error(OutputError::GeneralCompilerError {
            title: title.clone(),
            message: compile::message_to_plain_text(message),
            path: path.clone(),
        }),
        CompileResult::UnexpectedOutput { stdout, stderr } => {
            OutputStatus::Error(OutputError::UnexpectedCompilerOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            })
        }
        CompileResult::Report(ElmReport::CompileErrors { errors }) => {
            OutputStatus::Error(OutputError::CompileErrors {
                errors: errors.clone(),
            })
        }
        CompileResult::Success | CompileResult::Killed => {
            OutputStatus::Error(OutputError::StuckInProgress {
                what: format!("`{}` was not an error", output.original),
            })
        }
    }
}

/// A clean typecheck leaves the artifact alone when it is one of ours, and
/// drops in a proxy otherwise so the page can connect and ask for a real
/// build.
fn typecheck_success_status(
    target: &TypecheckTarget,
    env: &ExecuteEnv,
    _related: Option<&BTreeSet<PathBuf>>,
) -> OutputStatus {
    let existing = std::fs::read_to_string(&target.output.absolute).ok();

    if env.run_mode == RunMode::Hot && inject::needs_proxy(existing.as_deref()) {
        let contents = inject::proxy_file_contents(&inject::PrologueInfo {
            target_name: &target.target_name,
            compiled_timestamp: 0,
            compilation_mode: target.mode,
            web_socket_port: env.web_socket_port,
            debug: env.debug_client,
        });
        if let Err(e) = write_artifact_atomically(&target.output, &contents) {
            return OutputStatus::Error(OutputError::WriteProxyOutputError {
                path: target.output.absolute.clone(),
                message: e.to_string(),
            });
        }
    }

    let artifact_size = std::fs::metadata(&target.output.absolute)
        .map(|m| m.len())
        .unwrap_or(0);
    OutputStatus::Success {
        artifact_size,
        postprocess_size: None,
        compiled_timestamp: now_timestamp(),
        durations: Vec::new(),
    }
}

/// Owner-side start of a compile action: flips the status, clears the
/// dirty flag, and snapshots everything the job needs.
pub fn start_compile_action(
    target: &mut crate::project::Target,
    elm_json_path: &Path,
) -> CompileJob {
    let mut durations = Vec::new();
    if let OutputStatus::QueuedForCompile { enqueued_at } = &target.status {
        durations.push(LabeledDuration::QueuedForCompile(enqueued_at.elapsed()));
    }

    let kill = KillSwitch::new();
    target.clear_dirty();
    target.status = OutputStatus::Compiling {
        mode: target.compilation_mode,
        start: Instant::now(),
        durations: durations.clone(),
        kill: kill.clone(),
    };

    CompileJob {
        output: target.output.clone(),
        target_name: target.name.clone(),
        inputs: target.inputs.clone(),
        mode: target.compilation_mode,
        elm_json_path: elm_json_path.to_owned(),
        kill,
        dirty: target.dirty_flag(),
        durations,
        record_fields_before: target.record_fields.clone(),
    }
}

/// Owner-side start of a queue side-action.
pub fn queue_for_compile(target: &mut crate::project::Target) {
    target.status = OutputStatus::QueuedForCompile {
        enqueued_at: Instant::now(),
    };
}

/// Owner-side start of a typecheck batch for one group.
pub fn start_typecheck_action(
    targets: &mut [&mut crate::project::Target],
    elm_json_path: &Path,
) -> TypecheckJob {
    let kill = KillSwitch::new();
    let mut snapshots = Vec::with_capacity(targets.len());
    for target in targets.iter_mut() {
        target.clear_dirty();
        target.status = OutputStatus::TypecheckOnly {
            start: Instant::now(),
            kill: kill.clone(),
        };
        snapshots.push(TypecheckTarget {
            output: target.output.clone(),
            target_name: target.name.clone(),
            inputs: target.inputs.clone(),
            mode: target.compilation_mode,
            dirty: target.dirty_flag(),
        });
    }
    TypecheckJob {
        elm_json_path: elm_json_path.to_owned(),
        targets: snapshots,
        kill,
    }
}

/// Owner-side application of a finished job. Re-checks the dirty flag so
/// that work raced by a fresh change is discarded, not surfaced.
pub fn apply_finished(
    target: &mut crate::project::Target,
    finished: CompileFinished,
) -> HandleResult {
    if let Some(paths) = finished.new_related_paths {
        target.all_related_source_paths = paths;
    }
    if let Some(fields) = finished.new_record_fields {
        target.record_fields = fields;
    }
    if finished.set_dirty {
        target.mark_dirty();
    }
    if target.is_dirty() {
        target.status = OutputStatus::Interrupted;
        return HandleResult::Nothing;
    }
    target.status = finished.new_status;
    finished.result
}

/// The dependency-install phase: one sequential compiler run per group
/// against the null device, before the first build of a run.
pub async fn install_all_dependencies(
    groups: Vec<(PathBuf, Vec<InputPath>)>,
    kill: &KillSwitch,
) -> Result<(), (PathBuf, String)> {
    for (elm_json_path, inputs) in groups {
        match compile::install_dependencies(&inputs, elm_json_dir(&elm_json_path), kill).await {
            compile::InstallResult::Success => {}
            compile::InstallResult::Killed => {
                return Err((elm_json_path, "killed".to_owned()));
            }
            compile::InstallResult::Error { message } => {
                return Err((elm_json_path, message));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(run_mode: RunMode) -> ExecuteEnv {
        ExecuteEnv {
            run_mode,
            postprocess_argv: None,
            pool: WorkerPool::new(),
            web_socket_port: 43210,
            debug_client: false,
        }
    }

    fn output_in(dir: &Path, name: &str) -> OutputPath {
        OutputPath::new(dir.join(name), name.to_owned())
    }

    #[test]
    fn atomic_write_replaces_via_temp_sibling() {
        let tmp = TempDir::new().unwrap();
        let output = output_in(tmp.path(), "app.js");
        std::fs::write(&output.absolute, "old").unwrap();

        write_artifact_atomically(&output, "new contents").unwrap();
        assert_eq!(
            std::fs::read_to_string(&output.absolute).unwrap(),
            "new contents"
        );
        assert!(!output.temp.exists());
    }

    #[test]
    fn atomic_write_creates_missing_directories() {
        let tmp = TempDir::new().unwrap();
        let output = output_in(&tmp.path().join("deep/nested"), "app.js");
        write_artifact_atomically(&output, "x").unwrap();
        assert!(output.absolute.is_file());
    }

    #[test]
    fn walker_paths_fall_back_to_inputs_on_partial_failure() {
        let input = InputPath {
            absolute: PathBuf::from("/proj/src/Main.elm"),
            original: "src/Main.elm".into(),
        };
        let partial = WalkResult::PartialFailure {
            discovered: BTreeSet::from([PathBuf::from("/proj/src/Util.elm")]),
            path: PathBuf::from("/proj/src/Gone.elm"),
            message: "gone".into(),
        };
        let paths = walker_paths(&partial, std::slice::from_ref(&input)).unwrap();
        assert!(paths.contains(&PathBuf::from("/proj/src/Main.elm")));
        assert!(paths.contains(&PathBuf::from("/proj/src/Util.elm")));
    }

    #[test]
    fn error_filtering_keeps_only_related_files() {
        let errors = vec![
            ElmError {
                path: Some("src/Mine.elm".into()),
                name: "Mine".into(),
                problems: Vec::new(),
            },
            ElmError {
                path: Some("src/Other.elm".into()),
                name: "Other".into(),
                problems: Vec::new(),
            },
            ElmError {
                path: None,
                name: "General".into(),
                problems: Vec::new(),
            },
        ];
        let related = BTreeSet::from([PathBuf::from("/proj/src/Mine.elm")]);
        let filtered =
            filter_errors_for_target(&errors, Path::new("/proj/elm.json"), Some(&related));
        let names: Vec<&str> = filtered.iter().map(|e| e.name.as_str()).collect();
        // Path-less errors are attributed to everyone.
        assert_eq!(names, vec!["Mine", "General"]);
    }

    #[tokio::test]
    async fn dirty_flag_interrupts_a_finished_compile() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("elm.json"),
            r#"{ "type": "application", "source-directories": ["src"] }"#,
        )
        .unwrap();
        let dirty = Arc::new(AtomicBool::new(true));
        let job = CompileJob {
            output: output_in(tmp.path(), "app.js"),
            target_name: "app".into(),
            inputs: vec![InputPath {
                absolute: tmp.path().join("src/Main.elm"),
                original: "src/Main.elm".into(),
            }],
            mode: CompilationMode::Standard,
            elm_json_path: tmp.path().join("elm.json"),
            kill: KillSwitch::new(),
            dirty: dirty.clone(),
            durations: Vec::new(),
            record_fields_before: None,
        };
        // The compiler invocation itself fails (no real compiler here),
        // but the dirty flag wins regardless of the outcome.
        let finished = run_compile(job, env(RunMode::Make)).await;
        assert!(matches!(finished.new_status, OutputStatus::Interrupted));
        assert!(matches!(finished.result, HandleResult::Nothing));
    }

    #[tokio::test]
    async fn typecheck_writes_proxy_for_unrecognised_artifacts() {
        let tmp = TempDir::new().unwrap();
        let target = TypecheckTarget {
            output: output_in(tmp.path(), "app.js"),
            target_name: "app".into(),
            inputs: Vec::new(),
            mode: CompilationMode::Standard,
            dirty: Arc::new(AtomicBool::new(false)),
        };
        let status = typecheck_success_status(&target, &env(RunMode::Hot), None);
        assert!(matches!(status, OutputStatus::Success { .. }));
        let written = std::fs::read_to_string(&target.output.absolute).unwrap();
        assert!(written.starts_with(inject::PROXY_HEADER));

        // Running again leaves the proxy alone.
        let status = typecheck_success_status(&target, &env(RunMode::Hot), None);
        assert!(matches!(status, OutputStatus::Success { .. }));
    }
}
