// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The one-shot `make` driver.
//!
//! Install dependencies, then run planner ticks until nothing is left to
//! do. No watcher, no server: the planner and executor are shared with
//! the hot driver, everything else is sequential and plain.

use anyhow::{bail, Result};
use clap::Args;
use futures::future::{join_all, BoxFuture};
use std::path::PathBuf;

use crate::config;
use crate::execute::{self, CompileFinished, ExecuteEnv};
use crate::plan::{self, OutputAction, Priorities};
use crate::postprocess::WorkerPool;
use crate::project::{
    CompilationMode, KillSwitch, OutputError, OutputStatus, PostprocessConfig, Project, RunMode,
    StatusCategory, Target,
};
use crate::report::Reporter;

/// The batch build operation.
#[derive(Args, Debug)]
pub struct MakeArgs {
    /// Compile with the time-travelling debugger.
    #[arg(long)]
    debug: bool,

    /// Compile with optimizations.
    #[arg(long)]
    optimize: bool,

    /// Build only targets whose names contain one of these substrings.
    targets: Vec<String>,
}

impl MakeArgs {
    pub fn exec(self, reporter: &mut Reporter) -> Result<i32> {
        if self.debug && self.optimize {
            bail!("--debug and --optimize cannot be combined");
        }

        let cwd = std::env::current_dir()?;
        let mut project = config::load_project(&cwd, &self.targets)?;

        let mode_override = if self.debug {
            Some(CompilationMode::Debug)
        } else if self.optimize {
            Some(CompilationMode::Optimize)
        } else {
            None
        };
        if let Some(mode) = mode_override {
            for target in project.targets_mut() {
                target.compilation_mode = mode;
            }
        }

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(run_make(&mut project, reporter))
    }
}

async fn run_make(project: &mut Project, reporter: &mut Reporter) -> Result<i32> {
    let env = ExecuteEnv {
        run_mode: RunMode::Make,
        postprocess_argv: match &project.postprocess {
            PostprocessConfig::NoPostprocess => None,
            PostprocessConfig::Command(argv) => Some(argv.clone()),
        },
        pool: WorkerPool::new(),
        web_socket_port: 0,
        debug_client: false,
    };

    // Dependencies first; nothing can compile before they are in place.
    let groups: Vec<(PathBuf, Vec<_>)> = project
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
    let install_kill = KillSwitch::new();
    if let Err((elm_json_path, message)) =
        execute::install_all_dependencies(groups, &install_kill).await
    {
        reporter.fatal(
            "DEPENDENCY INSTALL FAILED",
            &format!(
                "Could not install dependencies for `{}`:\n{message}",
                elm_json_path.display()
            ),
        );
        return Ok(1);
    }

    project.mark_all_dirty();

    // Planner ticks until quiescent. Each tick awaits everything it
    // started, so every target settles into a terminal status after a
    // bounded number of ticks.
    loop {
        let actions = plan::plan(project, RunMode::Make, true, &Priorities::AllEqual);
        if actions.num_started() == 0 {
            break;
        }

        let mut jobs: Vec<BoxFuture<'static, CompileFinished>> = Vec::new();
        let mut typecheck_jobs = Vec::new();
        for action in actions.actions {
            match action {
                OutputAction::Compile { output, .. } => {
                    let elm_json_path = project
                        .group_of(&output)
                        .map(|g| g.elm_json_path.clone())
                        .expect("planner only names known outputs");
                    let target = project.target_mut(&output).expect("known output");
                    let job = execute::start_compile_action(target, &elm_json_path);
                    jobs.push(Box::pin(execute::run_compile(job, env.clone())));
                }
                OutputAction::Postprocess {
                    output,
                    code,
                    compiled_timestamp,
                    record_fields,
                    durations,
                    ..
                } => {
                    let target = project.target_mut(&output).expect("known output");
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
                    let (kill, fut) = execute::begin_postprocess(job, &env);
                    target.status = OutputStatus::Postprocessing { kill, durations };
                    jobs.push(Box::pin(fut));
                }
                OutputAction::TypecheckOnly {
                    elm_json_path,
                    outputs,
                } => {
                    let group = project
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
                    typecheck_jobs.push(execute::run_typecheck(job, env.clone()));
                }
                OutputAction::QueueForCompile { output } => {
                    let target = project.target_mut(&output).expect("known output");
                    execute::queue_for_compile(target);
                }
            }
        }

        let (compile_results, typecheck_results) =
            futures::join!(join_all(jobs), join_all(typecheck_jobs));

        for finished in compile_results
            .into_iter()
            .chain(typecheck_results.into_iter().flatten())
        {
            let output = finished.output.clone();
            if let Some(target) = project.target_mut(&output) {
                let _ = execute::apply_finished(target, finished);
            }
        }
    }

    // Final per-target report and exit code.
    let mut exit_code = 0;
    for target in project.targets() {
        reporter.status_line(target);
        if target.status.category() == StatusCategory::Error {
            exit_code = 1;
            if let OutputStatus::Error(OutputError::CompileErrors { errors }) = &target.status {
                reporter.compile_errors(&target.name, errors);
            }
        }
    }

    Ok(exit_code)
}
