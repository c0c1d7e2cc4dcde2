use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::layout;

pub mod runner;
pub mod sanitize;

pub use runner::{CommandRunner, ExitInfo, Invocation, SystemRunner};

use sanitize::clean_line;

/// Lines of child output kept for error messages.
const TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    StageStarted {
        id: String,
    },
    StageLog {
        id: String,
        line: String,
    },
    StageFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Default sink: forwards events to `tracing` and, for every failed stage,
/// writes the buffered stage output to `<logs_dir>/<run timestamp>/<id>.log`.
pub struct TracingSink {
    logs_root: PathBuf,
    state: Mutex<TracingSinkState>,
}

#[derive(Default)]
struct TracingSinkState {
    stage_logs: BTreeMap<String, VecDeque<String>>,
    run_dir: Option<PathBuf>,
}

impl TracingSink {
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_root: logs_root.into(),
            state: Mutex::new(TracingSinkState::default()),
        }
    }

    fn write_error_log(
        &self,
        state: &mut TracingSinkState,
        id: &str,
        error: Option<&str>,
        elapsed_ms: u128,
    ) -> Result<PathBuf> {
        let dir = match &state.run_dir {
            Some(d) => d.clone(),
            None => {
                let d = self
                    .logs_root
                    .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
                fs::create_dir_all(&d)?;
                state.run_dir = Some(d.clone());
                d
            }
        };
        let path = dir.join(format!("{}.log", file_component(id)));

        let mut body = format!("stage: {id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
        if let Some(e) = error.filter(|e| !e.trim().is_empty()) {
            body.push_str(&format!("error: {e}\n"));
        }
        body.push_str("\nlogs:\n");
        for line in state.stage_logs.remove(id).unwrap_or_default() {
            body.push_str(&line);
            body.push('\n');
        }
        fs::write(&path, body).map_err(|e| {
            Error::msg(format!("failed to write stage log {}: {e}", path.display()))
        })?;
        Ok(path)
    }
}

impl ExecSink for TracingSink {
    fn emit(&self, ev: ExecEvent) {
        const MAX_BUFFERED: usize = 4000;
        match ev {
            ExecEvent::StageStarted { id } => {
                tracing::info!(stage = %id, "stage started");
            }
            ExecEvent::StageLog { id, line } => {
                tracing::info!(stage = %id, "{line}");
                if let Ok(mut s) = self.state.lock() {
                    let q = s.stage_logs.entry(id).or_default();
                    while q.len() >= MAX_BUFFERED {
                        q.pop_front();
                    }
                    q.push_back(line);
                }
            }
            ExecEvent::StageFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    tracing::info!(stage = %id, elapsed_ms, "stage finished");
                    if let Ok(mut s) = self.state.lock() {
                        s.stage_logs.remove(&id);
                    }
                    return;
                }
                tracing::error!(
                    stage = %id,
                    elapsed_ms,
                    error = error.as_deref().unwrap_or(""),
                    "stage failed"
                );
                if let Ok(mut s) = self.state.lock() {
                    match self.write_error_log(&mut s, &id, error.as_deref(), elapsed_ms) {
                        Ok(path) => {
                            tracing::warn!(stage = %id, log = %path.display(), "stage log saved")
                        }
                        Err(e) => tracing::warn!(stage = %id, "could not save stage log: {e}"),
                    }
                }
            }
            ExecEvent::RunDone { ok } => {
                if ok {
                    tracing::info!("run finished");
                } else {
                    tracing::warn!("run finished with failures");
                }
            }
        }
    }
}

fn file_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "stage".into() } else { out }
}

/// Which part of a stage an external command belongs to; decides the error
/// variant a non-zero exit maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Rewrite,
    Configure,
    Compile,
    Install,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit: ExitInfo,
    pub tail: Vec<String>,
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_stage: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl ExecCtx {
    pub fn new(runner: Arc<dyn CommandRunner>, sink: Arc<dyn ExecSink>, dry_run: bool) -> Self {
        Self {
            dry_run,
            sink,
            current_stage: None,
            runner,
        }
    }

    pub fn for_stage(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.current_stage = Some(id.into());
        next
    }

    pub fn stage_id(&self) -> String {
        self.current_stage.clone().unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::StageLog {
            id: self.stage_id(),
            line: msg.to_string(),
        });
    }

    /// Runs one command, streaming sanitized output to the sink. A non-zero
    /// exit is returned as `Ok` with `exit.success == false`.
    pub fn run(&self, inv: &Invocation) -> Result<CommandOutput> {
        self.log(&format!("$ {inv}"));
        if self.dry_run {
            self.log("DRY-RUN: skipped");
            return Ok(CommandOutput {
                exit: ExitInfo::ok(),
                tail: Vec::new(),
            });
        }

        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
        let exit = self.runner.run(inv, &mut |raw| {
            let line = clean_line(raw);
            if line.is_empty() {
                return;
            }
            self.log(&line);
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        })?;
        Ok(CommandOutput {
            exit,
            tail: tail.into_iter().collect(),
        })
    }

    /// Like [`ExecCtx::run`] but a failed exit, or a program that cannot be
    /// started, becomes the error for `step`.
    pub fn run_step(&self, step: Step, inv: &Invocation) -> Result<CommandOutput> {
        let out = self
            .run(inv)
            .map_err(|e| self.step_error(step, e.to_string()))?;
        if out.exit.success {
            return Ok(out);
        }
        let mut reason = format!("`{} {}` {}", inv.program, inv.args.join(" "), out.exit);
        if let Some(last) = out.tail.last() {
            reason.push_str(&format!("; last output: {last}"));
        }
        Err(self.step_error(step, reason))
    }

    fn step_error(&self, step: Step, reason: String) -> Error {
        let stage = self.stage_id();
        match step {
            Step::Fetch => Error::Fetch {
                repo: stage,
                reason,
            },
            Step::Rewrite => Error::Rewrite(reason),
            Step::Configure => Error::Configure { stage, reason },
            Step::Compile => Error::Compile { stage, reason },
            Step::Install => Error::Install { stage, reason },
        }
    }

    pub fn remove_dir_within(&self, base: &Path, dir: &Path) -> Result<()> {
        if self.dry_run {
            if dir.exists() {
                self.log(&format!("DRY-RUN: would remove {}", dir.display()));
            }
            return Ok(());
        }
        layout::remove_dir_within(base, dir)
    }

    pub fn recreate_dir_within(&self, base: &Path, dir: &Path) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: would recreate {}", dir.display()));
            return Ok(());
        }
        layout::recreate_dir_within(base, dir)
    }

    pub fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if self.dry_run {
            self.log(&format!(
                "DRY-RUN: would write {} ({} bytes)",
                path.display(),
                contents.len()
            ));
            return Ok(());
        }
        fs::write(path, contents)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SearchPath, StageContext};
    use crate::fakes::{MemorySink, RecordingRunner};

    fn ctx_with(runner: RecordingRunner, sink: Arc<MemorySink>) -> ExecCtx {
        ExecCtx::new(Arc::new(runner), sink, false).for_stage("elf.kernel")
    }

    #[test]
    fn failed_exit_maps_to_step_error() {
        let runner = RecordingRunner::new();
        runner.fail_when("make", "install");
        let sink = Arc::new(MemorySink::default());
        let ctx = ctx_with(runner, sink);
        let sc = StageContext::new("/tmp", SearchPath::new("/usr/bin"));

        let inv = Invocation::new("make", &sc).unwrap().arg("install");
        let err = ctx.run_step(Step::Install, &inv).unwrap_err();
        assert_eq!(err.kind(), "install");
        assert!(err.to_string().contains("elf.kernel"), "{err}");

        let ok = Invocation::new("make", &sc).unwrap().arg("-j2");
        assert!(ctx.run_step(Step::Compile, &ok).is_ok());
    }

    #[test]
    fn unstartable_program_keeps_step_error_kind() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctx = ExecCtx::new(Arc::new(SystemRunner), Arc::new(MemorySink::default()), false)
            .for_stage("elf.kernel");
        let sc = StageContext::new(tmp.path(), SearchPath::new("/usr/bin"));
        let missing = tmp.path().join("riscv-pk/configure");

        let inv = Invocation::new(missing.display().to_string(), &sc).unwrap();
        let err = ctx.run_step(Step::Configure, &inv).unwrap_err();
        assert_eq!(err.kind(), "configure");
        assert!(err.to_string().contains("failed to start"), "{err}");
    }

    #[test]
    fn dry_run_never_reaches_runner() {
        let runner = Arc::new(RecordingRunner::new());
        let sink = Arc::new(MemorySink::default());
        let ctx = ExecCtx::new(runner.clone(), sink.clone(), true).for_stage("llvm.build");
        let sc = StageContext::new("/tmp", SearchPath::new("/usr/bin"));
        let inv = Invocation::new("ninja", &sc).unwrap();
        ctx.run(&inv).unwrap();
        assert!(runner.calls().is_empty());
        assert!(sink.lines("llvm.build").iter().any(|l| l.contains("DRY-RUN")));
    }

    #[test]
    fn error_log_is_written_for_failed_stage() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sink = TracingSink::new(tmp.path());
        sink.emit(ExecEvent::StageLog {
            id: "linux.toolchain".into(),
            line: "configure: error: no acceptable C compiler".into(),
        });
        sink.emit(ExecEvent::StageFinished {
            id: "linux.toolchain".into(),
            ok: false,
            error: Some("configure failed".into()),
            elapsed_ms: 12,
        });

        let logs: Vec<_> = walkdir::WalkDir::new(tmp.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(logs.len(), 1);
        let body = fs::read_to_string(logs[0].path()).unwrap();
        assert!(body.contains("stage: linux.toolchain"));
        assert!(body.contains("no acceptable C compiler"));
    }
}
