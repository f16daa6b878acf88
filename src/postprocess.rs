// Copyright 2024 the elm-watch project
// Licensed under the MIT License

//! The postprocess worker pool.
//!
//! User-supplied postprocessing comes in two flavours. A plain argv spawns
//! a fresh subprocess per job, with the compiled code on stdin and the
//! result on stdout. The special first element `elm-watch-node` instead
//! runs the named script inside a long-lived `node` worker, saving its
//! startup cost across rebuilds; those workers form an elastic pool that
//! can be shrunk when browser windows go idle.

use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    process::Stdio,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::oneshot,
};

use crate::project::{CompilationMode, KillSwitch, RunMode};

/// The magic first argv element selecting the persistent script runner.
pub const NODE_RUNNER_NAME: &str = "elm-watch-node";

/// One postprocess job.
#[derive(Clone, Debug)]
pub struct PostprocessSpec {
    pub argv: Vec<String>,
    pub code: String,
    pub target_name: String,
    pub compilation_mode: CompilationMode,
    pub run_mode: RunMode,
}

/// The outcome of one postprocess job.
#[derive(Debug)]
pub enum PostprocessResult {
    Success { code: String },
    /// The job (or the worker running it) was killed.
    Killed,
    CommandNotFound { command: String },
    SpawnError { message: String },
    NonZeroExit {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    NodeImportError { message: String },
    NodeDefaultExportNotFunction { exported: String },
    NodeRunError { message: String },
    NodeBadReturnValue { message: String },
}

/// The JSON-line harness running inside each persistent worker. Jobs go in
/// on stdin, one reply comes out per job on stdout.
const NODE_HARNESS: &str = r#"
const readline = require("readline");
const { pathToFileURL } = require("url");
const rl = readline.createInterface({ input: process.stdin, terminal: false });
const reply = (msg) => process.stdout.write(JSON.stringify(msg) + "\n");
rl.on("line", async (line) => {
  let job;
  try { job = JSON.parse(line); } catch (e) { reply({ tag: "RunError", message: String(e) }); return; }
  let fn;
  try {
    const mod = await import(pathToFileURL(job.script).href);
    fn = mod.default;
  } catch (e) { reply({ tag: "ImportError", message: String(e) }); return; }
  if (typeof fn !== "function") { reply({ tag: "DefaultExportNotFunction", exported: typeof fn }); return; }
  let result;
  try {
    result = await fn({
      code: job.code,
      targetName: job.targetName,
      compilationMode: job.compilationMode,
      runMode: job.runMode,
      args: job.args,
    });
  } catch (e) { reply({ tag: "RunError", message: String((e && e.stack) || e) }); return; }
  if (typeof result !== "string") {
    reply({ tag: "BadReturnValue", message: "expected a string, got " + typeof result });
    return;
  }
  reply({ tag: "Success", code: result });
});
"#;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeJob<'a> {
    script: &'a str,
    code: &'a str,
    target_name: &'a str,
    compilation_mode: String,
    run_mode: String,
    args: &'a [String],
}

#[derive(Deserialize)]
#[serde(tag = "tag")]
enum NodeReply {
    Success { code: String },
    ImportError { message: String },
    DefaultExportNotFunction { exported: String },
    RunError { message: String },
    BadReturnValue { message: String },
}

struct NodeWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl NodeWorker {
    async fn spawn() -> Result<NodeWorker, PostprocessResult> {
        let mut cmd = Command::new("node");
        cmd.arg("-e");
        cmd.arg(NODE_HARNESS);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PostprocessResult::CommandNotFound {
                    command: "node".to_owned(),
                });
            }
            Err(e) => {
                return Err(PostprocessResult::SpawnError {
                    message: e.to_string(),
                });
            }
        };

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        Ok(NodeWorker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn run_job(&mut self, spec: &PostprocessSpec, script: &str) -> PostprocessResult {
        let job = NodeJob {
            script,
            code: &spec.code,
            target_name: &spec.target_name,
            compilation_mode: spec.compilation_mode.to_string(),
            run_mode: spec.run_mode.to_string(),
            args: &spec.argv[2..],
        };
        let mut line = match serde_json::to_string(&job) {
            Ok(line) => line,
            Err(e) => {
                return PostprocessResult::SpawnError {
                    message: e.to_string(),
                }
            }
        };
        line.push('\n');

        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            return PostprocessResult::SpawnError {
                message: e.to_string(),
            };
        }

        match self.stdout.next_line().await {
            Ok(Some(reply)) => match serde_json::from_str::<NodeReply>(&reply) {
                Ok(NodeReply::Success { code }) => PostprocessResult::Success { code },
                Ok(NodeReply::ImportError { message }) => {
                    PostprocessResult::NodeImportError { message }
                }
                Ok(NodeReply::DefaultExportNotFunction { exported }) => {
                    PostprocessResult::NodeDefaultExportNotFunction { exported }
                }
                Ok(NodeReply::RunError { message }) => {
                    PostprocessResult::NodeRunError { message }
                }
                Ok(NodeReply::BadReturnValue { message }) => {
                    PostprocessResult::NodeBadReturnValue { message }
                }
                Err(e) => PostprocessResult::NodeBadReturnValue {
                    message: format!("unparseable worker reply: {e}"),
                },
            },
            // Stdout closing early means the worker died (or was killed).
            Ok(None) => PostprocessResult::Killed,
            Err(e) => PostprocessResult::SpawnError {
                message: e.to_string(),
            },
        }
    }

    async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

struct PoolInner {
    idle: Mutex<Vec<NodeWorker>>,
    busy_count: AtomicUsize,
    calculate_max: Mutex<Arc<dyn Fn() -> usize + Send + Sync>>,
}

/// Handle to the elastic worker pool. Clones share one pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// A postprocess run in flight: a kill switch and the eventual result.
pub struct RunningPostprocess {
    pub kill: KillSwitch,
    pub done: oneshot::Receiver<PostprocessResult>,
}

impl WorkerPool {
    pub fn new() -> Self {
        WorkerPool {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                busy_count: AtomicUsize::new(0),
                calculate_max: Mutex::new(Arc::new(num_cpus::get)),
            }),
        }
    }

    /// Replace the sizing function consulted by [`WorkerPool::limit`].
    pub fn set_calculate_max(&self, f: Arc<dyn Fn() -> usize + Send + Sync>) {
        *self.inner.calculate_max.lock().unwrap() = f;
    }

    /// Start one job. The returned kill switch stops it mid-flight, which
    /// surfaces as [`PostprocessResult::Killed`].
    pub fn run(&self, spec: PostprocessSpec) -> RunningPostprocess {
        let kill = KillSwitch::new();
        let (done_tx, done_rx) = oneshot::channel();
        let pool = self.clone();
        let task_kill = kill.clone();

        tokio::spawn(async move {
            let result = pool.run_inner(spec, &task_kill).await;
            let _ = done_tx.send(result);
        });

        RunningPostprocess {
            kill,
            done: done_rx,
        }
    }

    async fn run_inner(&self, spec: PostprocessSpec, kill: &KillSwitch) -> PostprocessResult {
        if kill.is_killed() {
            return PostprocessResult::Killed;
        }
        let node_script = match spec.argv.as_slice() {
            [runner, script, ..] if runner == NODE_RUNNER_NAME => Some(script.clone()),
            _ => None,
        };
        match node_script {
            Some(script) => self.run_node(spec, &script, kill).await,
            None => run_command(&spec, kill).await,
        }
    }

    async fn run_node(
        &self,
        spec: PostprocessSpec,
        script: &str,
        kill: &KillSwitch,
    ) -> PostprocessResult {
        let mut worker = match self.get_or_create_available_worker().await {
            Ok(worker) => worker,
            Err(result) => return result,
        };

        self.inner.busy_count.fetch_add(1, Ordering::SeqCst);
        let result = tokio::select! {
            result = worker.run_job(&spec, script) => result,
            _ = kill.killed() => {
                worker.kill().await;
                self.inner.busy_count.fetch_sub(1, Ordering::SeqCst);
                return PostprocessResult::Killed;
            }
        };
        self.inner.busy_count.fetch_sub(1, Ordering::SeqCst);

        // Only healthy workers go back into the pool.
        match &result {
            PostprocessResult::Killed | PostprocessResult::SpawnError { .. } => {
                worker.kill().await;
            }
            _ => {
                self.inner.idle.lock().unwrap().push(worker);
            }
        }
        result
    }

    /// Take an idle worker out of the pool, or spawn a new one. Workers
    /// are owned exclusively by one job while it runs.
    async fn get_or_create_available_worker(&self) -> Result<NodeWorker, PostprocessResult> {
        if let Some(worker) = self.inner.idle.lock().unwrap().pop() {
            return Ok(worker);
        }
        NodeWorker::spawn().await
    }

    /// Shrink the idle half of the pool down to the configured maximum.
    /// Returns how many workers were terminated.
    pub async fn limit(&self) -> usize {
        let max = {
            let f = self.inner.calculate_max.lock().unwrap().clone();
            f().max(1)
        };
        let busy = self.inner.busy_count.load(Ordering::SeqCst);
        let victims = {
            let mut idle = self.inner.idle.lock().unwrap();
            let keep = max.saturating_sub(busy);
            let excess = idle.len().saturating_sub(keep);
            let split_at = idle.len() - excess;
            idle.split_off(split_at)
        };
        let terminated = victims.len();
        for worker in victims {
            worker.kill().await;
        }
        terminated
    }

    /// Kill every idle worker. In-flight jobs are stopped via their own
    /// kill switches by the caller.
    pub async fn terminate(&self) {
        let workers = {
            let mut idle = self.inner.idle.lock().unwrap();
            std::mem::take(&mut *idle)
        };
        for worker in workers {
            worker.kill().await;
        }
    }

    pub fn idle_workers(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new()
    }
}

/// Run a plain-argv postprocess: code on stdin, result on stdout. The
/// target name, compilation mode, and run mode are appended as arguments.
async fn run_command(spec: &PostprocessSpec, kill: &KillSwitch) -> PostprocessResult {
    let command = &spec.argv[0];
    let mut cmd = Command::new(command);
    cmd.args(&spec.argv[1..]);
    cmd.arg(&spec.target_name);
    cmd.arg(spec.compilation_mode.to_string());
    cmd.arg(spec.run_mode.to_string());
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return PostprocessResult::CommandNotFound {
                command: command.clone(),
            };
        }
        Err(e) => {
            return PostprocessResult::SpawnError {
                message: e.to_string(),
            };
        }
    };

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let code = spec.code.clone();
    let write_stdin = async move {
        let _ = stdin.write_all(code.as_bytes()).await;
        // Dropping stdin closes it so the child sees EOF.
    };

    let output = tokio::select! {
        (_, result) = futures::future::join(write_stdin, child.wait_with_output()) => match result {
            Ok(output) => output,
            Err(e) => {
                return PostprocessResult::SpawnError {
                    message: e.to_string(),
                };
            }
        },
        _ = kill.killed() => {
            return PostprocessResult::Killed;
        }
    };

    if kill.is_killed() {
        return PostprocessResult::Killed;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        PostprocessResult::Success { code: stdout }
    } else {
        PostprocessResult::NonZeroExit {
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}
