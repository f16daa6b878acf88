// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! Artifact surgery: the generated client prologue, the hot-reload shim
//! injected into compiled output, the proxy artifact served before a first
//! real build, and the record-field scan used for hot-swap change
//! detection.

use std::collections::BTreeSet;

use crate::project::{CompilationMode, CompiledTimestamp};
use crate::protocol::PROTOCOL_VERSION;

/// First line of every proxy artifact. Files that do not start with this
/// exact line are never overwritten by a proxy.
pub const PROXY_HEADER: &str = "// elm-watch proxy v1";

/// First line of the client prologue, prepended to every hot artifact.
pub const PROLOGUE_HEADER: &str = "// elm-watch hot client";

/// The anchor the injector looks for in compiled output.
const INJECT_PROBE: &str = "'use strict';";

#[derive(Debug)]
pub enum InjectError {
    SearchAndReplaceNotFound { probe: String },
}

/// Parameters baked into the generated prologue so that the page can dial
/// back home.
#[derive(Clone, Debug)]
pub struct PrologueInfo<'a> {
    pub target_name: &'a str,
    pub compiled_timestamp: CompiledTimestamp,
    pub compilation_mode: CompilationMode,
    pub web_socket_port: u16,
    pub debug: bool,
}

/// Generate the client prologue. The in-browser client reads the settings
/// object this leaves on `globalThis` and opens the WebSocket connection.
pub fn client_prologue(info: &PrologueInfo<'_>) -> String {
    let target_name_json =
        serde_json::to_string(info.target_name).unwrap_or_else(|_| "\"\"".to_owned());
    format!(
        "{PROLOGUE_HEADER} v{version}\n\
         (function () {{\n\
         var settings = {{\n\
         \x20 version: \"{version}\",\n\
         \x20 targetName: {target_name_json},\n\
         \x20 compiledTimestamp: {timestamp},\n\
         \x20 compilationMode: \"{mode}\",\n\
         \x20 webSocketPort: {port},\n\
         \x20 debug: {debug}\n\
         }};\n\
         globalThis.__ELM_WATCH = globalThis.__ELM_WATCH || {{}};\n\
         globalThis.__ELM_WATCH[settings.targetName] = settings;\n\
         }})();\n\
         // end elm-watch prologue\n",
        version = PROTOCOL_VERSION,
        timestamp = info.compiled_timestamp,
        mode = info.compilation_mode,
        port = info.web_socket_port,
        debug = info.debug,
    )
}

/// Does an artifact on disk begin with our generated prologue?
pub fn starts_with_prologue(code: &str) -> bool {
    code.starts_with(PROLOGUE_HEADER)
}

/// Rewrite compiled output so that the hot-reload client can reach the
/// program's internals. The compiler emits an IIFE opening with a strict
/// mode pragma; the shim is slotted in right after it.
pub fn inject(code: &str) -> Result<String, InjectError> {
    match code.find(INJECT_PROBE) {
        Some(idx) => {
            let insert_at = idx + INJECT_PROBE.len();
            let shim = "\nvar _elm_watch_scope = typeof globalThis !== 'undefined' \
                        ? globalThis : this;\n\
                        _elm_watch_scope.__ELM_WATCH_EXPORTS = \
                        _elm_watch_scope.__ELM_WATCH_EXPORTS || {};\n";
            let mut result = String::with_capacity(code.len() + shim.len());
            result.push_str(&code[..insert_at]);
            result.push_str(shim);
            result.push_str(&code[insert_at..]);
            Ok(result)
        }
        None => Err(InjectError::SearchAndReplaceNotFound {
            probe: INJECT_PROBE.to_owned(),
        }),
    }
}

/// Contents of the proxy artifact for a target that has not been compiled
/// yet. Loading it connects to the server, which then schedules a real
/// build for the target.
pub fn proxy_file_contents(info: &PrologueInfo<'_>) -> String {
    let prologue = client_prologue(info);
    format!(
        "{PROXY_HEADER}\n\
         {prologue}\
         (function () {{\n\
         globalThis.Elm = new Proxy({{}}, {{\n\
         \x20 get: function () {{\n\
         \x20   throw new Error(\n\
         \x20     \"elm-watch: this is a proxy artifact; the real build is \" +\n\
         \x20     \"starting now. The page reloads when it finishes.\");\n\
         \x20 }}\n\
         }});\n\
         }})();\n"
    )
}

/// Does a target need a proxy artifact written?
///
/// Yes when the file is absent, or when its contents do not start with one
/// of our versioned headers. An artifact we compiled ourselves (prologue
/// header) or an earlier proxy is left alone.
pub fn needs_proxy(existing: Option<&str>) -> bool {
    match existing {
        None => true,
        Some(contents) => {
            let first_line = contents.lines().next().unwrap_or("");
            !(first_line.starts_with(PROXY_HEADER) || first_line.starts_with(PROLOGUE_HEADER))
        }
    }
}

fn is_js_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Extract the set of record field names from compiled output.
///
/// Only meaningful in optimize mode, where the compiler shortens field
/// names: a changed set means previously loaded code cannot be hot-swapped
/// against the new artifact. The scan collects keys of object literals
/// returned by record constructors (`return {a: …, b: …};`).
pub fn record_fields(mode: CompilationMode, code: &str) -> Option<BTreeSet<String>> {
    if mode != CompilationMode::Optimize {
        return None;
    }

    let mut fields = BTreeSet::new();
    let mut rest = code;
    while let Some(idx) = rest.find("return {") {
        rest = &rest[idx + "return {".len()..];
        let Some(end) = rest.find('}') else { break };
        let body = &rest[..end];
        // Nested braces mean this is not a flat record literal; skip it.
        if body.contains('{') {
            continue;
        }
        for pair in body.split(',') {
            if let Some((key, _value)) = pair.split_once(':') {
                let key = key.trim();
                if is_js_ident(key) {
                    fields.insert(key.to_owned());
                }
            }
        }
    }
    Some(fields)
}

/// Did the record-field set change between two compiles? Unknown sets
/// (plain or debug mode, or a first build) never count as changed.
pub fn record_fields_changed(
    old: Option<&BTreeSet<String>>,
    new: Option<&BTreeSet<String>>,
) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => old != new,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> PrologueInfo<'static> {
        PrologueInfo {
            target_name: "app",
            compiled_timestamp: 1_700_000_000_000,
            compilation_mode: CompilationMode::Standard,
            web_socket_port: 43210,
            debug: false,
        }
    }

    #[test]
    fn prologue_starts_with_the_header() {
        let prologue = client_prologue(&info());
        assert!(starts_with_prologue(&prologue));
        assert!(prologue.contains("compiledTimestamp: 1700000000000"));
        assert!(prologue.contains("webSocketPort: 43210"));
        assert!(prologue.contains("compilationMode: \"standard\""));
    }

    #[test]
    fn prologue_escapes_target_names() {
        let mut i = info();
        i.target_name = "my \"app\"";
        let prologue = client_prologue(&i);
        assert!(prologue.contains(r#"targetName: "my \"app\"""#));
    }

    #[test]
    fn inject_slots_in_after_strict_pragma() {
        let code = "(function(scope){\n'use strict';\nvar x = 1;\n})(this);";
        let injected = inject(code).unwrap();
        assert!(injected.contains("__ELM_WATCH_EXPORTS"));
        let strict = injected.find("'use strict';").unwrap();
        let shim = injected.find("__ELM_WATCH_EXPORTS").unwrap();
        let body = injected.find("var x = 1;").unwrap();
        assert!(strict < shim && shim < body);
    }

    #[test]
    fn inject_fails_without_anchor() {
        assert!(matches!(
            inject("console.log('hello');"),
            Err(InjectError::SearchAndReplaceNotFound { .. })
        ));
    }

    #[test]
    fn proxy_header_is_the_first_line() {
        let contents = proxy_file_contents(&info());
        assert_eq!(contents.lines().next().unwrap(), PROXY_HEADER);
    }

    #[test]
    fn proxy_replaces_unrecognised_files_only() {
        assert!(needs_proxy(None));
        assert!(!needs_proxy(Some(&proxy_file_contents(&info()))));
        assert!(!needs_proxy(Some(&client_prologue(&info()))));
        // A file from some other tool: replace it so the page can connect.
        assert!(needs_proxy(Some("var user = 'content';")));
    }

    #[test]
    fn record_fields_only_in_optimize_mode() {
        let code = "function f(a, b) { return {x: a, y: b}; }";
        assert_eq!(record_fields(CompilationMode::Standard, code), None);
        assert_eq!(record_fields(CompilationMode::Debug, code), None);
        let fields = record_fields(CompilationMode::Optimize, code).unwrap();
        assert_eq!(
            fields,
            BTreeSet::from(["x".to_owned(), "y".to_owned()])
        );
    }

    #[test]
    fn record_field_scan_skips_nested_literals() {
        let code = "return {a: 1}; return {nested: {q: 2}, w: 3}; return {b: 2};";
        let fields = record_fields(CompilationMode::Optimize, code).unwrap();
        assert!(fields.contains("a"));
        assert!(fields.contains("b"));
        assert!(!fields.contains("nested"));
    }

    #[test]
    fn changed_detection_needs_both_sets() {
        let a = BTreeSet::from(["x".to_owned()]);
        let b = BTreeSet::from(["y".to_owned()]);
        assert!(record_fields_changed(Some(&a), Some(&b)));
        assert!(!record_fields_changed(Some(&a), Some(&a)));
        assert!(!record_fields_changed(None, Some(&b)));
        assert!(!record_fields_changed(Some(&a), None));
    }
}
