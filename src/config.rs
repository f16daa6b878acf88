// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! Locating and decoding `elm-watch.json`, and building the [`Project`]
//! model from it.
//!
//! Configuration problems are fatal: nothing is built until the file
//! decodes and every target resolves to an owning `elm.json`.

use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    path::{Component, Path, PathBuf},
};
use thiserror::Error;

use crate::project::{
    DisabledTarget, InputPath, OutputPath, PostprocessConfig, Project, ProjectGroup, Target,
};

pub const WATCH_CONFIG_FILE_NAME: &str = "elm-watch.json";
pub const ELM_JSON_FILE_NAME: &str = "elm.json";
pub const STATE_FILE_NAME: &str = "elm-watch-state.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find `{WATCH_CONFIG_FILE_NAME}` in `{cwd}` or any parent directory", cwd = .cwd.display())]
    NotFound { cwd: PathBuf },

    #[error("failed to read `{path}`: {message}", path = .path.display())]
    ReadError { path: PathBuf, message: String },

    #[error("failed to decode `{path}`: {message}", path = .path.display())]
    DecodeError { path: PathBuf, message: String },

    #[error("`{WATCH_CONFIG_FILE_NAME}` contains no targets")]
    EmptyTargets,

    #[error("target `{target}` has no inputs")]
    EmptyInputs { target: String },

    #[error("target `{target}` lists the input `{input}` twice")]
    DuplicateInputs { target: String, input: String },

    #[error("targets `{first}` and `{second}` write to the same output `{output}`")]
    DuplicateOutputs {
        first: String,
        second: String,
        output: String,
    },

    #[error(
        "no `{ELM_JSON_FILE_NAME}` found for input `{input}` of target `{target}` \
         (searched from its directory up to the filesystem root)"
    )]
    ElmJsonNotFound { target: String, input: String },

    #[error(
        "the inputs of target `{target}` belong to different `{ELM_JSON_FILE_NAME}` files: \
         `{first}` and `{second}`",
        first = .first.display(),
        second = .second.display()
    )]
    MixedElmJson {
        target: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error(
        "`{elm_json}` lives outside the watch root `{watch_root}`; \
         move `{WATCH_CONFIG_FILE_NAME}` to a common ancestor",
        elm_json = .elm_json.display(),
        watch_root = .watch_root.display()
    )]
    NoCommonWatchRoot {
        elm_json: PathBuf,
        watch_root: PathBuf,
    },

    #[error("these substrings did not match any target name: {}", .substrings.join(", "))]
    UnknownTargetsSubstrings { substrings: Vec<String> },
}

/// The decoded shape of `elm-watch.json`. Target order is preserved.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WatchConfigFile {
    targets: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    postprocess: Option<Vec<String>>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    max_parallel: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetConfig {
    inputs: Vec<String>,
    output: String,
}

/// The parts of `elm.json` we care about.
#[derive(Debug, Deserialize)]
struct ElmJsonFile {
    #[serde(rename = "source-directories", default)]
    source_directories: Option<Vec<String>>,
}

/// Walk up from `cwd` looking for the watch config.
pub fn find_watch_config(cwd: &Path) -> Result<PathBuf, ConfigError> {
    let mut dir = cwd;
    loop {
        let candidate = dir.join(WATCH_CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => {
                return Err(ConfigError::NotFound {
                    cwd: cwd.to_owned(),
                })
            }
        }
    }
}

/// Join `relative` onto `base` and collapse `.` and `..` lexically. We do
/// not resolve symlinks: artifact paths usually do not exist yet.
pub fn absolutize(base: &Path, relative: &str) -> PathBuf {
    let joined = base.join(relative);
    let mut result = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other),
        }
    }
    result
}

/// Find the closest-ancestor `elm.json` for a source file.
fn find_elm_json(input: &Path) -> Option<PathBuf> {
    let mut dir = input.parent()?;
    loop {
        let candidate = dir.join(ELM_JSON_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
}

/// Read the source directories of one `elm.json`, defaulting to `src` for
/// package-style projects that do not list any.
pub fn read_source_directories(elm_json_path: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let raw = std::fs::read_to_string(elm_json_path).map_err(|e| ConfigError::ReadError {
        path: elm_json_path.to_owned(),
        message: e.to_string(),
    })?;
    let parsed: ElmJsonFile =
        serde_json::from_str(&raw).map_err(|e| ConfigError::DecodeError {
            path: elm_json_path.to_owned(),
            message: e.to_string(),
        })?;
    let base = elm_json_path.parent().unwrap_or_else(|| Path::new("."));
    let dirs = parsed
        .source_directories
        .unwrap_or_else(|| vec!["src".to_owned()]);
    Ok(dirs.iter().map(|d| absolutize(base, d)).collect())
}

/// Load the full project model.
///
/// `substrings` filters targets by name: an empty list enables everything,
/// otherwise a target is enabled when any substring matches. Substrings
/// matching nothing at all are an error.
pub fn load_project(cwd: &Path, substrings: &[String]) -> Result<Project, ConfigError> {
    let watch_config_path = find_watch_config(cwd)?;
    load_project_at(&watch_config_path, substrings)
}

pub fn load_project_at(
    watch_config_path: &Path,
    substrings: &[String],
) -> Result<Project, ConfigError> {
    let raw =
        std::fs::read_to_string(watch_config_path).map_err(|e| ConfigError::ReadError {
            path: watch_config_path.to_owned(),
            message: e.to_string(),
        })?;
    let parsed: WatchConfigFile =
        serde_json::from_str(&raw).map_err(|e| ConfigError::DecodeError {
            path: watch_config_path.to_owned(),
            message: e.to_string(),
        })?;

    if parsed.targets.is_empty() {
        return Err(ConfigError::EmptyTargets);
    }

    let watch_root = watch_config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_owned();

    // Every substring must match at least one target name.
    let unknown: Vec<String> = substrings
        .iter()
        .filter(|s| !parsed.targets.keys().any(|name| name.contains(s.as_str())))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(ConfigError::UnknownTargetsSubstrings {
            substrings: unknown,
        });
    }

    let mut seen_outputs: HashMap<PathBuf, String> = HashMap::new();
    let mut groups: Vec<ProjectGroup> = Vec::new();
    let mut disabled: Vec<DisabledTarget> = Vec::new();

    for (index, (name, value)) in parsed.targets.iter().enumerate() {
        let target_config: TargetConfig =
            serde_json::from_value(value.clone()).map_err(|e| ConfigError::DecodeError {
                path: watch_config_path.to_owned(),
                message: format!("target `{name}`: {e}"),
            })?;

        if target_config.inputs.is_empty() {
            return Err(ConfigError::EmptyInputs {
                target: name.clone(),
            });
        }

        let mut seen_inputs = HashSet::new();
        let mut inputs = Vec::new();
        for original in &target_config.inputs {
            let absolute = absolutize(&watch_root, original);
            if !seen_inputs.insert(absolute.clone()) {
                return Err(ConfigError::DuplicateInputs {
                    target: name.clone(),
                    input: original.clone(),
                });
            }
            inputs.push(InputPath {
                absolute,
                original: original.clone(),
            });
        }

        let output_absolute = absolutize(&watch_root, &target_config.output);
        if let Some(first) = seen_outputs.insert(output_absolute.clone(), name.clone()) {
            return Err(ConfigError::DuplicateOutputs {
                first,
                second: name.clone(),
                output: target_config.output.clone(),
            });
        }
        let output = OutputPath::new(output_absolute, target_config.output.clone());

        let enabled =
            substrings.is_empty() || substrings.iter().any(|s| name.contains(s.as_str()));
        if !enabled {
            disabled.push(DisabledTarget {
                name: name.clone(),
                output,
            });
            continue;
        }

        // Resolve the owning elm.json; all inputs must agree on it.
        let mut elm_json_path: Option<PathBuf> = None;
        for input in &inputs {
            let found =
                find_elm_json(&input.absolute).ok_or_else(|| ConfigError::ElmJsonNotFound {
                    target: name.clone(),
                    input: input.original.clone(),
                })?;
            match &elm_json_path {
                None => elm_json_path = Some(found),
                Some(existing) if existing != &found => {
                    return Err(ConfigError::MixedElmJson {
                        target: name.clone(),
                        first: existing.clone(),
                        second: found,
                    });
                }
                Some(_) => {}
            }
        }
        let elm_json_path = elm_json_path.expect("inputs is non-empty");

        if !elm_json_path.starts_with(&watch_root) {
            return Err(ConfigError::NoCommonWatchRoot {
                elm_json: elm_json_path,
                watch_root,
            });
        }

        let target = Target::new(name.clone(), output, index, inputs);

        match groups.iter_mut().find(|g| g.elm_json_path == elm_json_path) {
            Some(group) => group.targets.push(target),
            None => {
                let source_directories = read_source_directories(&elm_json_path)?;
                groups.push(ProjectGroup {
                    elm_json_path,
                    source_directories,
                    targets: vec![target],
                });
            }
        }
    }

    let state_file_path = watch_root.join("elm-stuff").join(STATE_FILE_NAME);

    Ok(Project {
        watch_root,
        watch_config_path: watch_config_path.to_owned(),
        state_file_path,
        postprocess: match parsed.postprocess {
            None => PostprocessConfig::NoPostprocess,
            Some(argv) if argv.is_empty() => PostprocessConfig::NoPostprocess,
            Some(argv) => PostprocessConfig::Command(argv),
        },
        port_from_config: parsed.port,
        max_parallel: parsed.max_parallel.unwrap_or_else(num_cpus::get).max(1),
        groups,
        disabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn scaffold(dir: &Path, targets_json: &str) {
        write(
            &dir.join("elm-watch.json"),
            &format!(r#"{{ "targets": {targets_json} }}"#),
        );
        write(
            &dir.join("elm.json"),
            r#"{ "type": "application", "source-directories": ["src"] }"#,
        );
        write(&dir.join("src/Main.elm"), "module Main exposing (main)\n");
        write(&dir.join("src/Admin.elm"), "module Admin exposing (main)\n");
    }

    #[test]
    fn loads_a_minimal_project() {
        let tmp = TempDir::new().unwrap();
        scaffold(
            tmp.path(),
            r#"{
                "app": { "inputs": ["src/Main.elm"], "output": "build/app.js" },
                "admin": { "inputs": ["src/Admin.elm"], "output": "build/admin.js" }
            }"#,
        );

        let project = load_project(tmp.path(), &[]).unwrap();
        assert_eq!(project.groups.len(), 1);
        let names: Vec<&str> = project.targets().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["app", "admin"]);
        assert!(project.disabled.is_empty());
        assert!(project.max_parallel >= 1);
    }

    #[test]
    fn substring_selection_disables_the_rest() {
        let tmp = TempDir::new().unwrap();
        scaffold(
            tmp.path(),
            r#"{
                "app": { "inputs": ["src/Main.elm"], "output": "build/app.js" },
                "admin": { "inputs": ["src/Admin.elm"], "output": "build/admin.js" }
            }"#,
        );

        let project = load_project(tmp.path(), &["pp".to_owned()]).unwrap();
        // "pp" matches only `app`.
        let names: Vec<&str> = project.targets().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["app"]);
        assert_eq!(project.disabled.len(), 1);
        assert_eq!(project.disabled[0].name, "admin");
    }

    #[test]
    fn unknown_substring_is_an_error() {
        let tmp = TempDir::new().unwrap();
        scaffold(
            tmp.path(),
            r#"{ "app": { "inputs": ["src/Main.elm"], "output": "build/app.js" } }"#,
        );

        let err = load_project(tmp.path(), &["nope".to_owned()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTargetsSubstrings { .. }));
    }

    #[test]
    fn duplicate_outputs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        scaffold(
            tmp.path(),
            r#"{
                "a": { "inputs": ["src/Main.elm"], "output": "build/app.js" },
                "b": { "inputs": ["src/Admin.elm"], "output": "build/app.js" }
            }"#,
        );

        let err = load_project(tmp.path(), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateOutputs { .. }));
    }

    #[test]
    fn duplicate_inputs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        scaffold(
            tmp.path(),
            r#"{
                "a": { "inputs": ["src/Main.elm", "./src/Main.elm"], "output": "build/app.js" }
            }"#,
        );

        let err = load_project(tmp.path(), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateInputs { .. }));
    }

    #[test]
    fn finds_config_in_parent_directory() {
        let tmp = TempDir::new().unwrap();
        scaffold(
            tmp.path(),
            r#"{ "app": { "inputs": ["src/Main.elm"], "output": "build/app.js" } }"#,
        );
        let nested = tmp.path().join("src");
        let found = find_watch_config(&nested).unwrap();
        assert_eq!(found, tmp.path().join("elm-watch.json"));
    }

    #[test]
    fn absolutize_collapses_dots() {
        let base = Path::new("/proj/sub");
        assert_eq!(
            absolutize(base, "../build/./app.js"),
            PathBuf::from("/proj/build/app.js")
        );
    }

    #[test]
    fn empty_postprocess_list_means_none() {
        let tmp = TempDir::new().unwrap();
        write(
            &tmp.path().join("elm-watch.json"),
            r#"{
                "targets": { "app": { "inputs": ["src/Main.elm"], "output": "a.js" } },
                "postprocess": []
            }"#,
        );
        write(
            &tmp.path().join("elm.json"),
            r#"{ "type": "application", "source-directories": ["src"] }"#,
        );
        write(
            &tmp.path().join("src/Main.elm"),
            "module Main exposing (main)\n",
        );
        let project = load_project(tmp.path(), &[]).unwrap();
        assert!(project.postprocess.is_none());
    }
}
