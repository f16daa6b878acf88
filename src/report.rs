// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! Terminal status reporting.
//!
//! One line per target after each pass, full compiler error listings at
//! the end of a batch, and the occasional note. Color is on by default,
//! off under `NO_COLOR`, and output is kept plain when
//! `__ELM_WATCH_NOT_TTY` is set (tests and pipes).

use std::time::Duration;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::compile::{ElmError, MessageChunk};
use crate::project::{LabeledDuration, OutputStatus, Target};

/// Colors mirrored to browser error overlays.
pub fn overlay_foreground_color() -> String {
    "#ffffff".to_owned()
}

pub fn overlay_background_color() -> String {
    "#222222".to_owned()
}

pub struct Reporter {
    stream: StandardStream,
    plain: bool,
}

fn color_choice() -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        ColorChoice::Never
    } else if std::env::var_os("__ELM_WATCH_NOT_TTY").is_some() {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    }
}

impl Reporter {
    pub fn new() -> Self {
        Reporter {
            stream: StandardStream::stderr(color_choice()),
            plain: std::env::var_os("__ELM_WATCH_NOT_TTY").is_some(),
        }
    }

    fn with_color(&mut self, spec: &ColorSpec, text: &str) {
        let _ = self.stream.set_color(spec);
        let _ = std::io::Write::write_all(&mut self.stream, text.as_bytes());
        let _ = self.stream.reset();
    }

    pub fn note(&mut self, message: &str) {
        self.with_color(ColorSpec::new().set_fg(Some(Color::Cyan)), "note: ");
        let _ = std::io::Write::write_all(&mut self.stream, message.as_bytes());
        let _ = std::io::Write::write_all(&mut self.stream, b"\n");
    }

    pub fn warning(&mut self, message: &str) {
        self.with_color(
            ColorSpec::new().set_fg(Some(Color::Yellow)).set_bold(true),
            "warning: ",
        );
        let _ = std::io::Write::write_all(&mut self.stream, message.as_bytes());
        let _ = std::io::Write::write_all(&mut self.stream, b"\n");
    }

    pub fn error(&mut self, message: &str) {
        self.with_color(
            ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true),
            "error: ",
        );
        let _ = std::io::Write::write_all(&mut self.stream, message.as_bytes());
        let _ = std::io::Write::write_all(&mut self.stream, b"\n");
    }

    /// Clear the terminal between passes. Skipped when not a TTY so logs
    /// stay greppable.
    pub fn clear_screen(&mut self) {
        if !self.plain {
            let _ = std::io::Write::write_all(&mut self.stream, b"\x1b[2J\x1b[H");
        }
    }

    /// One status line for one target.
    pub fn status_line(&mut self, target: &Target) {
        let (glyph, spec, text) = describe_status(&target.status);
        self.with_color(&spec, glyph);
        let line = format!(" {}: {}\n", target.name, text);
        let _ = std::io::Write::write_all(&mut self.stream, line.as_bytes());
    }

    /// The timeline of recent events, newest last.
    pub fn timeline(&mut self, lines: &[String]) {
        for line in lines {
            let _ = std::io::Write::write_all(&mut self.stream, b"  ");
            let _ = std::io::Write::write_all(&mut self.stream, line.as_bytes());
            let _ = std::io::Write::write_all(&mut self.stream, b"\n");
        }
    }

    /// Render a full compiler error listing for one target.
    pub fn compile_errors(&mut self, target_name: &str, errors: &[ElmError]) {
        for error in errors {
            for problem in &error.problems {
                let location = error.path.as_deref().unwrap_or(target_name);
                let header = format!(
                    "-- {} {} {}\n",
                    problem.title,
                    "-".repeat(50_usize.saturating_sub(problem.title.len())),
                    location
                );
                self.with_color(
                    ColorSpec::new().set_fg(Some(Color::Cyan)).set_bold(true),
                    &header,
                );
                for chunk in &problem.message {
                    self.message_chunk(chunk);
                }
                let _ = std::io::Write::write_all(&mut self.stream, b"\n\n");
            }
        }
    }

    fn message_chunk(&mut self, chunk: &MessageChunk) {
        match chunk {
            MessageChunk::Unstyled(text) => {
                let _ = std::io::Write::write_all(&mut self.stream, text.as_bytes());
            }
            MessageChunk::Styled {
                string,
                bold,
                underline,
                color,
            } => {
                let mut spec = ColorSpec::new();
                spec.set_bold(*bold);
                spec.set_underline(*underline);
                if let Some(color) = color.as_deref().and_then(parse_color) {
                    spec.set_fg(Some(color));
                }
                self.with_color(&spec, string);
            }
        }
    }

    /// A fatal error template: a title bar and indented body lines. Used
    /// for the handled errors that end a run.
    pub fn fatal(&mut self, title: &str, body: &str) {
        let header = format!("-- {} {}\n", title, "-".repeat(60_usize.saturating_sub(title.len())));
        self.with_color(
            ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true),
            &header,
        );
        for line in body.lines() {
            let _ = std::io::Write::write_all(&mut self.stream, line.as_bytes());
            let _ = std::io::Write::write_all(&mut self.stream, b"\n");
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Reporter::new()
    }
}

fn parse_color(name: &str) -> Option<Color> {
    match name.to_ascii_lowercase().as_str() {
        "red" => Some(Color::Red),
        "green" => Some(Color::Green),
        "yellow" => Some(Color::Yellow),
        "blue" => Some(Color::Blue),
        "magenta" => Some(Color::Magenta),
        "cyan" => Some(Color::Cyan),
        "black" => Some(Color::Black),
        "white" => Some(Color::White),
        _ => None,
    }
}

fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms >= 1000 {
        format!("{:.1}s", d.as_secs_f32())
    } else {
        format!("{ms}ms")
    }
}

pub fn format_durations(durations: &[LabeledDuration]) -> String {
    durations
        .iter()
        .map(|d| format!("{} {}", format_duration(d.duration()), d.label()))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn describe_status(status: &OutputStatus) -> (&'static str, ColorSpec, String) {
    let mut green = ColorSpec::new();
    green.set_fg(Some(Color::Green));
    let mut yellow = ColorSpec::new();
    yellow.set_fg(Some(Color::Yellow));
    let mut red = ColorSpec::new();
    red.set_fg(Some(Color::Red)).set_bold(true);
    let dim = ColorSpec::new();

    match status {
        OutputStatus::NotWrittenToDisk => ("·", dim, "waiting".to_owned()),
        OutputStatus::QueuedForCompile { .. } => ("⧗", yellow, "queued".to_owned()),
        OutputStatus::Compiling { .. } => ("⚙", yellow, "compiling".to_owned()),
        OutputStatus::QueuedForPostprocess { .. } => {
            ("⧗", yellow, "queued for postprocess".to_owned())
        }
        OutputStatus::Postprocessing { .. } => ("⚙", yellow, "postprocessing".to_owned()),
        OutputStatus::TypecheckOnly { .. } => ("⚙", yellow, "typechecking".to_owned()),
        OutputStatus::Interrupted => ("↻", yellow, "interrupted".to_owned()),
        OutputStatus::Success { durations, .. } => {
            let text = if durations.is_empty() {
                "success".to_owned()
            } else {
                format!("success ({})", format_durations(durations))
            };
            ("✓", green, text)
        }
        OutputStatus::Error(error) => ("✗", red, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_render_compactly() {
        let durations = [
            LabeledDuration::QueuedForCompile(Duration::from_millis(12)),
            LabeledDuration::Compile(Duration::from_millis(1500)),
        ];
        assert_eq!(format_durations(&durations), "12ms queued | 1.5s compile");
    }

    #[test]
    fn status_descriptions_cover_the_lifecycle() {
        let (_, _, text) = describe_status(&OutputStatus::NotWrittenToDisk);
        assert_eq!(text, "waiting");
        let (_, _, text) = describe_status(&OutputStatus::Interrupted);
        assert_eq!(text, "interrupted");
        let (glyph, _, text) = describe_status(&OutputStatus::Success {
            artifact_size: 10,
            postprocess_size: None,
            compiled_timestamp: 0,
            durations: vec![LabeledDuration::Compile(Duration::from_millis(80))],
        });
        assert_eq!(glyph, "✓");
        assert!(text.contains("80ms compile"));
    }

    #[test]
    fn known_colors_parse_case_insensitively() {
        assert_eq!(parse_color("RED"), Some(Color::Red));
        assert_eq!(parse_color("cyan"), Some(Color::Cyan));
        assert_eq!(parse_color("chartreuse"), None);
    }
}
