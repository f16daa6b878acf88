// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The import-graph walker.
//!
//! Starting from a target's inputs, follow `import` lines breadth-first
//! through the project's source directories until the set of reachable
//! files is closed. Package imports resolve to no source directory and
//! simply drop out. The owning `elm.json` is re-read on every walk so a
//! changed `source-directories` list takes effect without a restart.

use std::{
    collections::{BTreeSet, VecDeque},
    path::{Path, PathBuf},
};

use crate::config::{self, ConfigError};
use crate::project::InputPath;

#[derive(Debug)]
pub enum WalkResult {
    Success {
        all_related_source_paths: BTreeSet<PathBuf>,
    },
    /// An I/O error mid-walk; carries whatever was discovered first.
    PartialFailure {
        discovered: BTreeSet<PathBuf>,
        path: PathBuf,
        message: String,
    },
    /// The `elm.json` could not be read or decoded.
    ElmJsonError {
        path: PathBuf,
        message: String,
    },
}

/// Pull the module names out of one source file's `import` lines.
///
/// Imports in the language sit at column zero, one per line:
/// `import Json.Decode as D exposing (Decoder)`. Anything else on the line
/// is irrelevant here.
pub fn parse_imports(source: &str) -> Vec<String> {
    let mut imports = Vec::new();
    for line in source.lines() {
        let Some(rest) = line.strip_prefix("import ") else {
            continue;
        };
        let module = rest.split_whitespace().next().unwrap_or("");
        if !module.is_empty() && is_module_name(module) {
            imports.push(module.to_owned());
        }
    }
    imports
}

fn is_module_name(s: &str) -> bool {
    s.split('.').all(|segment| {
        let mut chars = segment.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// `Json.Decode` → `Json/Decode.elm` under the first source directory that
/// has it. `None` for package modules.
fn resolve_module(module: &str, source_directories: &[PathBuf]) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in module.split('.') {
        relative.push(segment);
    }
    relative.set_extension("elm");
    source_directories
        .iter()
        .map(|dir| dir.join(&relative))
        .find(|candidate| candidate.is_file())
}

/// Compute the transitive import closure of `inputs`.
pub fn walk(elm_json_path: &Path, inputs: &[InputPath]) -> WalkResult {
    let source_directories = match config::read_source_directories(elm_json_path) {
        Ok(dirs) => dirs,
        Err(ConfigError::ReadError { path, message })
        | Err(ConfigError::DecodeError { path, message }) => {
            return WalkResult::ElmJsonError { path, message };
        }
        Err(other) => {
            return WalkResult::ElmJsonError {
                path: elm_json_path.to_owned(),
                message: other.to_string(),
            };
        }
    };

    let mut discovered: BTreeSet<PathBuf> = BTreeSet::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();

    for input in inputs {
        if discovered.insert(input.absolute.clone()) {
            queue.push_back(input.absolute.clone());
        }
    }

    while let Some(path) = queue.pop_front() {
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                return WalkResult::PartialFailure {
                    discovered,
                    path,
                    message: e.to_string(),
                };
            }
        };

        for module in parse_imports(&source) {
            if let Some(resolved) = resolve_module(&module, &source_directories) {
                if discovered.insert(resolved.clone()) {
                    queue.push_back(resolved);
                }
            }
        }
    }

    WalkResult::Success {
        all_related_source_paths: discovered,
    }
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

    fn input(path: &Path) -> InputPath {
        InputPath {
            absolute: path.to_owned(),
            original: path.display().to_string(),
        }
    }

    #[test]
    fn parses_import_lines_only_at_column_zero() {
        let source = "\
module Main exposing (main)

import Html
import Json.Decode as D exposing (Decoder)
 import Indented.Ignored
-- import Commented.Out is still a line comment, but starts with dashes
importNotAnImport
";
        assert_eq!(parse_imports(source), vec!["Html", "Json.Decode"]);
    }

    #[test]
    fn module_names_are_dotted_upper_camel() {
        assert!(is_module_name("Html"));
        assert!(is_module_name("Json.Decode"));
        assert!(!is_module_name("lowercase"));
        assert!(!is_module_name("Bad..Dots"));
    }

    #[test]
    fn walks_the_transitive_closure() {
        let tmp = TempDir::new().unwrap();
        write(
            &tmp.path().join("elm.json"),
            r#"{ "type": "application", "source-directories": ["src"] }"#,
        );
        write(
            &tmp.path().join("src/Main.elm"),
            "module Main exposing (main)\nimport Page.Home\nimport Html\n",
        );
        write(
            &tmp.path().join("src/Page/Home.elm"),
            "module Page.Home exposing (view)\nimport Util\n",
        );
        write(&tmp.path().join("src/Util.elm"), "module Util exposing (x)\n");

        let main = tmp.path().join("src/Main.elm");
        let result = walk(&tmp.path().join("elm.json"), &[input(&main)]);
        match result {
            WalkResult::Success {
                all_related_source_paths,
            } => {
                assert_eq!(
                    all_related_source_paths,
                    BTreeSet::from([
                        tmp.path().join("src/Main.elm"),
                        tmp.path().join("src/Page/Home.elm"),
                        tmp.path().join("src/Util.elm"),
                    ])
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn package_imports_drop_out() {
        let tmp = TempDir::new().unwrap();
        write(
            &tmp.path().join("elm.json"),
            r#"{ "type": "application", "source-directories": ["src"] }"#,
        );
        write(
            &tmp.path().join("src/Main.elm"),
            "module Main exposing (main)\nimport Html\nimport Browser\n",
        );

        let main = tmp.path().join("src/Main.elm");
        match walk(&tmp.path().join("elm.json"), &[input(&main)]) {
            WalkResult::Success {
                all_related_source_paths,
            } => assert_eq!(all_related_source_paths.len(), 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_input_is_a_partial_failure() {
        let tmp = TempDir::new().unwrap();
        write(
            &tmp.path().join("elm.json"),
            r#"{ "type": "application", "source-directories": ["src"] }"#,
        );
        let gone = tmp.path().join("src/Gone.elm");
        match walk(&tmp.path().join("elm.json"), &[input(&gone)]) {
            WalkResult::PartialFailure { path, .. } => assert_eq!(path, gone),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unreadable_elm_json_is_its_own_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("elm.json");
        match walk(&missing, &[]) {
            WalkResult::ElmJsonError { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
