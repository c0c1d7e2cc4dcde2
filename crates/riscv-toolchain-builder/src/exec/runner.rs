use std::ffi::OsString;
use std::fmt;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;

use crate::context::StageContext;
use crate::error::{Error, Result};

/// One external command, fully described: the working directory and `PATH`
/// come from the stage context rather than from the parent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub path_env: OsString,
}

impl Invocation {
    pub fn new(program: impl Into<String>, ctx: &StageContext) -> Result<Self> {
        Ok(Self {
            program: program.into(),
            args: Vec::new(),
            cwd: ctx.working_dir().to_path_buf(),
            path_env: ctx.search_path().to_env()?,
        })
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    pub fn path_entries(&self) -> Vec<PathBuf> {
        std::env::split_paths(&self.path_env).collect()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            if a.contains(' ') {
                write!(f, " \"{a}\"")?;
            } else {
                write!(f, " {a}")?;
            }
        }
        write!(f, " (in {})", self.cwd.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub success: bool,
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            success: false,
            code: Some(code),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(c) => write!(f, "exit status: {c}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Seam between the pipeline and real processes. Implementations must be
/// usable from the parallel fetch workers.
pub trait CommandRunner: Send + Sync {
    /// Runs `inv` to completion, handing each output line to `on_line`.
    /// `Err` is reserved for failures to start or wait on the process.
    fn run(&self, inv: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<ExitInfo>;
}

#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, inv: &Invocation, on_line: &mut dyn FnMut(&str)) -> Result<ExitInfo> {
        let mut child = Command::new(&inv.program)
            .args(&inv.args)
            .current_dir(&inv.cwd)
            .env("PATH", &inv.path_env)
            // Build systems occasionally prompt; never let them block on our TTY.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&inv.program, &inv.cwd, e))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || forward_lines(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || forward_lines(err, tx));
        }
        drop(tx);

        for line in rx {
            on_line(&line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait on '{}' failed: {e}", inv.program)))?;
        Ok(ExitInfo {
            success: status.success(),
            code: status.code(),
        })
    }
}

fn spawn_error(program: &str, cwd: &Path, e: std::io::Error) -> Error {
    Error::msg(format!(
        "failed to start '{program}' in {}: {e}",
        cwd.display()
    ))
}

fn forward_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SearchPath;

    #[test]
    fn invocation_takes_cwd_and_path_from_context() {
        let ctx = StageContext::new("/src", SearchPath::new("/usr/bin"))
            .with_bin("/opt/rv/elf/bin");
        let inv = Invocation::new("make", &ctx)
            .unwrap()
            .args(["-j", "4"]);
        assert_eq!(inv.cwd, PathBuf::from("/src"));
        assert_eq!(
            inv.path_entries(),
            vec![PathBuf::from("/opt/rv/elf/bin"), PathBuf::from("/usr/bin")]
        );
        assert_eq!(inv.to_string(), "make -j 4 (in /src)");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_streams_lines_and_reports_status() {
        let ctx = StageContext::new("/", SearchPath::from_env());
        let inv = Invocation::new("sh", &ctx)
            .unwrap()
            .args(["-c", "echo one; echo two 1>&2; exit 3"]);
        let mut lines = Vec::new();
        let exit = SystemRunner
            .run(&inv, &mut |l| lines.push(l.to_string()))
            .unwrap();
        assert!(!exit.success);
        assert_eq!(exit.code, Some(3));
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }
}
