// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The wire protocol between the server and browser clients.
//!
//! Frames are JSON objects tagged by a `tag` field. The client half of this
//! protocol lives in the injected artifact prologue; the shapes here must
//! stay in lockstep with it.

use serde::{Deserialize, Serialize};

use crate::compile::ElmError;
use crate::project::{BrowserUiPosition, CompilationMode, CompiledTimestamp};

/// The URL path prefix clients must connect under.
pub const WEBSOCKET_PATH: &str = "elm-watch";

/// The protocol version. Client and server must agree exactly.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The decoded query parameters of a client connection URL.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebSocketParams {
    pub elm_watch_version: String,
    pub web_socket_token: String,
    pub target_name: String,
    pub elm_compiled_timestamp: CompiledTimestamp,
}

impl WebSocketParams {
    pub fn to_query(&self) -> String {
        // Only flat strings and an integer; this cannot fail.
        serde_urlencoded::to_string(self).unwrap_or_default()
    }

    pub fn parse_query(query: &str) -> Result<Self, String> {
        serde_urlencoded::from_str(query).map_err(|e| e.to_string())
    }
}

/// Server → client frames.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "tag")]
pub enum ServerFrame {
    StatusChanged {
        status: StatusFrame,
    },
    #[serde(rename_all = "camelCase")]
    SuccessfullyCompiled {
        code: String,
        elm_compiled_timestamp: CompiledTimestamp,
        compilation_mode: CompilationMode,
        browser_ui_position: BrowserUiPosition,
    },
    SuccessfullyCompiledButRecordFieldsChanged,
    StaticFilesMayHaveChangedWhileDisconnected,
    #[serde(rename_all = "camelCase")]
    StaticFilesChanged {
        changed_file_url_paths: Vec<String>,
    },
    FocusedTabAcknowledged,
    OpenEditorFailed {
        error: OpenEditorError,
    },
}

/// The `status` payload of a `StatusChanged` frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "tag")]
pub enum StatusFrame {
    #[serde(rename_all = "camelCase")]
    Busy {
        compilation_mode: CompilationMode,
        browser_ui_position: BrowserUiPosition,
    },
    #[serde(rename_all = "camelCase")]
    AlreadyUpToDate {
        compilation_mode: CompilationMode,
        browser_ui_position: BrowserUiPosition,
    },
    #[serde(rename_all = "camelCase")]
    CompileError {
        compilation_mode: CompilationMode,
        browser_ui_position: BrowserUiPosition,
        open_error_overlay: bool,
        errors: Vec<ElmError>,
        foreground_color: String,
        background_color: String,
    },
    ClientError {
        message: String,
    },
    ElmJsonError {
        error: String,
    },
}

/// Why opening the user's editor failed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "tag")]
pub enum OpenEditorError {
    EnvNotSet,
    #[serde(rename_all = "camelCase")]
    InvalidFilePath {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    CommandFailed {
        message: String,
    },
}

/// Client → server frames.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "tag")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    ChangedCompilationMode {
        compilation_mode: CompilationMode,
    },
    #[serde(rename_all = "camelCase")]
    ChangedBrowserUiPosition {
        browser_ui_position: BrowserUiPosition,
    },
    #[serde(rename_all = "camelCase")]
    ChangedOpenErrorOverlay {
        open_error_overlay: bool,
    },
    FocusedTab,
    #[serde(rename_all = "camelCase")]
    PressedOpenEditor {
        file: String,
        line: u32,
        column: u32,
    },
}

/// The reasons a connection attempt is turned away. Each renders to a
/// distinct human-readable `ClientError` message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientErrorReason {
    WrongUrlPrefix { actual_path: String },
    BadQuery { message: String },
    WrongToken,
    WrongVersion { client_version: String },
    TargetDisabled { target_name: String },
    UnknownTarget { target_name: String },
}

impl ClientErrorReason {
    pub fn message(&self) -> String {
        match self {
            ClientErrorReason::WrongUrlPrefix { actual_path } => format!(
                "The web socket URL must start with /{WEBSOCKET_PATH}, but the page \
                 connected to `{actual_path}`. This usually means the artifact was \
                 generated by a different tool or server."
            ),
            ClientErrorReason::BadQuery { message } => format!(
                "Could not decode the web socket URL query parameters: {message}"
            ),
            ClientErrorReason::WrongToken => {
                "The web socket token does not match this server. The page is \
                 probably talking to a different elm-watch instance; reload it."
                    .to_owned()
            }
            ClientErrorReason::WrongVersion { client_version } => format!(
                "WrongVersion: the page was compiled by elm-watch {client_version}, \
                 but this server is elm-watch {PROTOCOL_VERSION}. Reload the page to \
                 pick up the matching client."
            ),
            ClientErrorReason::TargetDisabled { target_name } => format!(
                "The target `{target_name}` exists in elm-watch.json but was not \
                 enabled on the command line for this run."
            ),
            ClientErrorReason::UnknownTarget { target_name } => format!(
                "The target `{target_name}` does not exist in elm-watch.json."
            ),
        }
    }

    pub fn frame(&self) -> ServerFrame {
        ServerFrame::StatusChanged {
            status: StatusFrame::ClientError {
                message: self.message(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips() {
        let params = WebSocketParams {
            elm_watch_version: PROTOCOL_VERSION.to_owned(),
            web_socket_token: "f00dcafef00dcafef00dcafef00dcafe".to_owned(),
            target_name: "My Target".to_owned(),
            elm_compiled_timestamp: 1_700_000_000_123,
        };
        let query = params.to_query();
        let parsed = WebSocketParams::parse_query(&query).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn query_field_names_are_camel_case() {
        let params = WebSocketParams {
            elm_watch_version: "1.0.0".to_owned(),
            web_socket_token: "t".to_owned(),
            target_name: "a".to_owned(),
            elm_compiled_timestamp: 42,
        };
        let query = params.to_query();
        assert!(query.contains("elmWatchVersion=1.0.0"), "{query}");
        assert!(query.contains("webSocketToken=t"), "{query}");
        assert!(query.contains("targetName=a"), "{query}");
        assert!(query.contains("elmCompiledTimestamp=42"), "{query}");
    }

    #[test]
    fn rejects_missing_parameters() {
        assert!(WebSocketParams::parse_query("targetName=a").is_err());
    }

    #[test]
    fn server_frames_are_tagged() {
        let frame = ServerFrame::StatusChanged {
            status: StatusFrame::Busy {
                compilation_mode: CompilationMode::Standard,
                browser_ui_position: BrowserUiPosition::default(),
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["tag"], "StatusChanged");
        assert_eq!(json["status"]["tag"], "Busy");
        assert_eq!(json["status"]["compilationMode"], "standard");
    }

    #[test]
    fn client_frames_parse() {
        let json = r#"{"tag":"ChangedCompilationMode","compilationMode":"optimize"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame,
            ClientFrame::ChangedCompilationMode {
                compilation_mode: CompilationMode::Optimize,
            }
        );

        let json = r#"{"tag":"PressedOpenEditor","file":"src/Main.elm","line":3,"column":7}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame,
            ClientFrame::PressedOpenEditor {
                file: "src/Main.elm".into(),
                line: 3,
                column: 7,
            }
        );
    }

    #[test]
    fn static_file_frames_round_trip() {
        let frame = ServerFrame::StaticFilesChanged {
            changed_file_url_paths: vec!["/assets/logo.svg".to_owned()],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""tag":"StaticFilesChanged""#));
        assert!(json.contains("changedFileUrlPaths"));
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);

        let frame = ServerFrame::StaticFilesMayHaveChangedWhileDisconnected;
        let json = serde_json::to_string(&frame).unwrap();
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn client_error_messages_are_distinct() {
        let reasons = [
            ClientErrorReason::WrongUrlPrefix {
                actual_path: "/ws".into(),
            },
            ClientErrorReason::BadQuery {
                message: "missing field".into(),
            },
            ClientErrorReason::WrongToken,
            ClientErrorReason::WrongVersion {
                client_version: "0.0.1".into(),
            },
            ClientErrorReason::TargetDisabled {
                target_name: "a".into(),
            },
            ClientErrorReason::UnknownTarget {
                target_name: "a".into(),
            },
        ];
        let messages: std::collections::BTreeSet<String> =
            reasons.iter().map(|r| r.message()).collect();
        assert_eq!(messages.len(), reasons.len());
    }
}
