// Copyright 2024 the elm-watch project
// Licensed under the MIT License

use clap::{error::ErrorKind, Parser, Subcommand};

mod compile;
mod config;
mod editor;
mod execute;
mod hot;
mod importgraph;
mod inject;
mod make;
mod plan;
mod postprocess;
mod project;
mod protocol;
mod report;
mod state_file;
mod watcher;
mod websocket;

use report::Reporter;

fn main() {
    // Help and version are not failures; anything else (unexpected flags,
    // bad subcommands) exits 1 like compile errors do.
    let args = match ToplevelArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            std::process::exit(0)
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1)
        }
    };

    let mut reporter = Reporter::new();

    match args.exec(&mut reporter) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            reporter.error(&format!("{e:#}"));
            std::process::exit(1)
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "elm-watch",
    version,
    about = "Watch, compile and hot-reload Elm projects"
)]
struct ToplevelArgs {
    #[command(subcommand)]
    action: Action,
}

impl ToplevelArgs {
    fn exec(self, reporter: &mut Reporter) -> anyhow::Result<i32> {
        match self.action {
            Action::Make(a) => a.exec(reporter),
            Action::Hot(a) => a.exec(reporter),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Compile the configured targets once and exit.
    Make(make::MakeArgs),
    /// Watch the project, recompiling and hot-reloading browsers on change.
    Hot(hot::HotArgs),
}
