// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The output-action planner.
//!
//! A pure function from the project state to the set of actions worth
//! starting right now. The planner enforces the parallelism cap and the
//! one-compile-per-`elm.json` rule, downgrades builds nobody is watching
//! to batched typechecks, and queues whatever does not fit this tick.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use crate::project::{
    CompiledTimestamp, LabeledDuration, OutputPath, OutputStatus, Project, RunMode,
};

/// Connected-client priorities: the focus timestamp per artifact. Targets
/// absent from the map have no client watching them right now.
#[derive(Clone, Debug)]
pub enum Priorities {
    /// Batch mode: every target matters equally.
    AllEqual,
    ByOutput(HashMap<OutputPath, u64>),
}

impl Priorities {
    fn get(&self, output: &OutputPath) -> Option<u64> {
        match self {
            Priorities::AllEqual => Some(0),
            Priorities::ByOutput(map) => map.get(output).copied(),
        }
    }
}

/// Why a target needs compiling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompileSource {
    /// It was sitting in the queue from an earlier tick.
    Queued,
    /// Its sources or options changed.
    Dirty,
}

#[derive(Debug)]
pub enum OutputAction {
    Compile {
        output: OutputPath,
        index: usize,
        source: CompileSource,
    },
    Postprocess {
        output: OutputPath,
        index: usize,
        code: String,
        compiled_timestamp: CompiledTimestamp,
        record_fields: Option<BTreeSet<String>>,
        durations: Vec<LabeledDuration>,
    },
    /// One compiler invocation covering every listed target of one group.
    TypecheckOnly {
        elm_json_path: PathBuf,
        outputs: Vec<OutputPath>,
    },
    /// Side-action for a dirty target that did not fit this tick.
    QueueForCompile {
        output: OutputPath,
    },
}

impl OutputAction {
    fn is_queue_side_action(&self) -> bool {
        matches!(self, OutputAction::QueueForCompile { .. })
    }
}

#[derive(Debug)]
pub struct OutputActions {
    pub total: usize,
    pub num_executing: usize,
    pub num_interrupted: usize,
    pub num_errors: usize,
    pub actions: Vec<OutputAction>,
    /// Everything else, for status-line rendering.
    pub outputs_without_action: Vec<OutputPath>,
}

impl OutputActions {
    /// Actions that actually start work (excludes queue side-actions).
    pub fn num_started(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| !a.is_queue_side_action())
            .count()
    }
}

enum Candidate {
    Compile {
        output: OutputPath,
        index: usize,
        source: CompileSource,
        elm_json_path: PathBuf,
        priority: Option<u64>,
    },
    Postprocess {
        output: OutputPath,
        index: usize,
        code: String,
        compiled_timestamp: CompiledTimestamp,
        record_fields: Option<BTreeSet<String>>,
        durations: Vec<LabeledDuration>,
        priority: Option<u64>,
    },
    Typecheck {
        elm_json_path: PathBuf,
        outputs: Vec<(OutputPath, usize)>,
    },
}

impl Candidate {
    fn sort_index(&self) -> usize {
        match self {
            Candidate::Compile { index, .. } => *index,
            Candidate::Postprocess { index, .. } => *index,
            Candidate::Typecheck { outputs, .. } => {
                outputs.iter().map(|(_, i)| *i).min().unwrap_or(usize::MAX)
            }
        }
    }

    fn priority(&self) -> u64 {
        match self {
            Candidate::Compile { priority, .. } => priority.unwrap_or(0),
            Candidate::Postprocess { priority, .. } => priority.unwrap_or(0),
            Candidate::Typecheck { .. } => 0,
        }
    }

    fn kind_rank(&self, run_mode: RunMode) -> usize {
        match (run_mode, self) {
            // Batch mode: time to first error wins, compiles go first.
            (RunMode::Make, Candidate::Compile { .. }) => 0,
            (RunMode::Make, Candidate::Typecheck { .. }) => 1,
            (RunMode::Make, Candidate::Postprocess { .. }) => 2,
            // Hot mode: finishing nearly-done work first feels fastest.
            (RunMode::Hot, Candidate::Postprocess { .. }) => 0,
            (RunMode::Hot, Candidate::Compile { .. }) => 1,
            (RunMode::Hot, Candidate::Typecheck { .. }) => 2,
        }
    }
}

/// Decide what to do for every target this tick.
pub fn plan(
    project: &Project,
    run_mode: RunMode,
    include_interrupted: bool,
    priorities: &Priorities,
) -> OutputActions {
    let mut total = 0;
    let mut num_executing = 0;
    let mut num_interrupted = 0;
    let mut num_errors = 0;
    let mut busy_groups: HashSet<PathBuf> = HashSet::new();
    let mut candidates: Vec<Candidate> = Vec::new();
    // Targets that want a compile but have no watching client, per group.
    let mut typecheck_groups: Vec<(PathBuf, Vec<(OutputPath, usize)>)> = Vec::new();

    for group in &project.groups {
        for target in &group.targets {
            total += 1;

            let needs_compile = match &target.status {
                status if status.is_executing() => {
                    num_executing += 1;
                    busy_groups.insert(group.elm_json_path.clone());
                    None
                }
                OutputStatus::QueuedForCompile { .. } => Some(CompileSource::Queued),
                OutputStatus::QueuedForPostprocess {
                    code,
                    compiled_timestamp,
                    record_fields,
                    durations,
                } => {
                    candidates.push(Candidate::Postprocess {
                        output: target.output.clone(),
                        index: target.index,
                        code: code.clone(),
                        compiled_timestamp: *compiled_timestamp,
                        record_fields: record_fields.clone(),
                        durations: durations.clone(),
                        priority: priorities.get(&target.output),
                    });
                    None
                }
                OutputStatus::Interrupted => {
                    num_interrupted += 1;
                    if include_interrupted {
                        Some(CompileSource::Dirty)
                    } else {
                        None
                    }
                }
                OutputStatus::Error(_) => {
                    num_errors += 1;
                    if target.is_dirty() {
                        Some(CompileSource::Dirty)
                    } else {
                        None
                    }
                }
                OutputStatus::Success { .. } | OutputStatus::NotWrittenToDisk => {
                    if target.is_dirty() {
                        Some(CompileSource::Dirty)
                    } else {
                        None
                    }
                }
                // Remaining transient statuses were handled by is_executing.
                _ => None,
            };

            if let Some(source) = needs_compile {
                match priorities.get(&target.output) {
                    Some(priority) => candidates.push(Candidate::Compile {
                        output: target.output.clone(),
                        index: target.index,
                        source,
                        elm_json_path: group.elm_json_path.clone(),
                        priority: Some(priority),
                    }),
                    // Nobody is watching: fold into the group's typecheck.
                    None => match typecheck_groups
                        .iter_mut()
                        .find(|(path, _)| path == &group.elm_json_path)
                    {
                        Some((_, outputs)) => {
                            outputs.push((target.output.clone(), target.index));
                        }
                        None => typecheck_groups.push((
                            group.elm_json_path.clone(),
                            vec![(target.output.clone(), target.index)],
                        )),
                    },
                }
            }
        }
    }

    for (elm_json_path, outputs) in typecheck_groups {
        candidates.push(Candidate::Typecheck {
            elm_json_path,
            outputs,
        });
    }

    candidates.sort_by(|a, b| {
        a.kind_rank(run_mode)
            .cmp(&b.kind_rank(run_mode))
            .then_with(|| match run_mode {
                RunMode::Make => a.sort_index().cmp(&b.sort_index()),
                RunMode::Hot => b
                    .priority()
                    .cmp(&a.priority())
                    .then_with(|| a.sort_index().cmp(&b.sort_index())),
            })
    });

    // Admission under the parallelism cap and the per-group exclusion.
    let capacity = project.max_parallel.saturating_sub(num_executing);
    let mut actions: Vec<OutputAction> = Vec::new();
    let mut queue_side_actions: Vec<OutputAction> = Vec::new();
    let mut acted_outputs: HashSet<OutputPath> = HashSet::new();

    for candidate in candidates {
        let admitted = actions.len() < capacity;
        match candidate {
            Candidate::Compile {
                output,
                index,
                source,
                elm_json_path,
                ..
            } => {
                if admitted && !busy_groups.contains(&elm_json_path) {
                    busy_groups.insert(elm_json_path);
                    acted_outputs.insert(output.clone());
                    actions.push(OutputAction::Compile {
                        output,
                        index,
                        source,
                    });
                } else if source == CompileSource::Dirty {
                    acted_outputs.insert(output.clone());
                    queue_side_actions.push(OutputAction::QueueForCompile { output });
                }
                // A rejected queued compile stays queued; nothing to do.
            }
            Candidate::Postprocess {
                output,
                index,
                code,
                compiled_timestamp,
                record_fields,
                durations,
                ..
            } => {
                if admitted {
                    acted_outputs.insert(output.clone());
                    actions.push(OutputAction::Postprocess {
                        output,
                        index,
                        code,
                        compiled_timestamp,
                        record_fields,
                        durations,
                    });
                }
            }
            Candidate::Typecheck {
                elm_json_path,
                outputs,
            } => {
                if admitted && !busy_groups.contains(&elm_json_path) {
                    busy_groups.insert(elm_json_path.clone());
                    let outputs: Vec<OutputPath> = outputs
                        .into_iter()
                        .map(|(output, _)| {
                            acted_outputs.insert(output.clone());
                            output
                        })
                        .collect();
                    actions.push(OutputAction::TypecheckOnly {
                        elm_json_path,
                        outputs,
                    });
                }
            }
        }
    }

    let outputs_without_action: Vec<OutputPath> = project
        .targets()
        .map(|t| t.output.clone())
        .filter(|output| !acted_outputs.contains(output))
        .collect();

    actions.extend(queue_side_actions);

    OutputActions {
        total,
        num_executing,
        num_interrupted,
        num_errors,
        actions,
        outputs_without_action,
    }
}
