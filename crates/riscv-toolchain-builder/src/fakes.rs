//! In-process fakes for the runner and sink seams (testing only).
//!
//! `RecordingRunner` records every invocation, including the `PATH` it would
//! have been started with, and can be told to fail selected commands.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::exec::{CommandRunner, ExecEvent, ExecSink, ExitInfo, Invocation};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct FailRule {
    program_suffix: String,
    arg_fragment: String,
    cwd_fragment: Option<String>,
}

impl FailRule {
    fn matches(&self, inv: &Invocation) -> bool {
        inv.program.ends_with(&self.program_suffix)
            && (self.arg_fragment.is_empty()
                || inv.args.iter().any(|a| a.contains(&self.arg_fragment)))
            && self
                .cwd_fragment
                .as_ref()
                .is_none_or(|f| inv.cwd.to_string_lossy().contains(f.as_str()))
    }
}

#[derive(Debug)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    rules: Mutex<Vec<FailRule>>,
    /// When set, `git clone <url> <dir>` creates `<dir>/.git` so fetch
    /// validation succeeds without a network.
    simulate_clones: bool,
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            simulate_clones: true,
        }
    }

    /// Clones "succeed" but leave nothing on disk.
    pub fn without_clone_side_effects(mut self) -> Self {
        self.simulate_clones = false;
        self
    }

    /// Fail any command whose program ends with `program_suffix` and that
    /// has an argument containing `arg_fragment` (empty matches all).
    pub fn fail_when(&self, program_suffix: &str, arg_fragment: &str) {
        lock(&self.rules).push(FailRule {
            program_suffix: program_suffix.into(),
            arg_fragment: arg_fragment.into(),
            cwd_fragment: None,
        });
    }

    /// Like [`RecordingRunner::fail_when`], restricted to a working
    /// directory containing `cwd_fragment`.
    pub fn fail_when_in(&self, program_suffix: &str, arg_fragment: &str, cwd_fragment: &str) {
        lock(&self.rules).push(FailRule {
            program_suffix: program_suffix.into(),
            arg_fragment: arg_fragment.into(),
            cwd_fragment: Some(cwd_fragment.into()),
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    pub fn calls_in(&self, cwd: &std::path::Path) -> Vec<Invocation> {
        self.calls().into_iter().filter(|c| c.cwd == cwd).collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, inv: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<ExitInfo> {
        lock(&self.calls).push(inv.clone());

        if lock(&self.rules).iter().any(|r| r.matches(inv)) {
            on_line(&format!("{}: simulated failure", inv.program));
            return Ok(ExitInfo::failed(2));
        }

        if self.simulate_clones && inv.program == "git" && inv.args.first().is_some_and(|a| a == "clone")
        {
            if let Some(dest) = inv.args.last() {
                let dest = inv.cwd.join(PathBuf::from(dest));
                fs::create_dir_all(dest.join(".git"))?;
            }
        }
        Ok(ExitInfo::ok())
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ExecEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ExecEvent> {
        lock(&self.events).clone()
    }

    /// Ids of started stages, in start order.
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecEvent::StageStarted { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn lines(&self, stage: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecEvent::StageLog { id, line } if id == stage => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn finished(&self) -> BTreeMap<String, bool> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecEvent::StageFinished { id, ok, .. } => Some((id, ok)),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for MemorySink {
    fn emit(&self, ev: ExecEvent) {
        lock(&self.events).push(ev);
    }
}
