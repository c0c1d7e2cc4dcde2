use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::context::StageContext;
use crate::error::{Error, Result};
use crate::exec::{ExecCtx, ExecEvent, Invocation, Step};

pub const TOOLCHAIN_REPO: &str = "riscv-gnu-toolchain";
pub const KERNEL_REPO: &str = "riscv-pk";
pub const SIMULATOR_REPO: &str = "riscv-isa-sim";
pub const INFRA_REPO: &str = "llvm-project";

const MIRROR: &str = "https://github.91chi.fun/https://github.com";

fn default_toolchain_url() -> String {
    format!("{MIRROR}/riscv/riscv-gnu-toolchain")
}

fn default_kernel_url() -> String {
    format!("{MIRROR}/riscv-software-src/riscv-pk.git")
}

fn default_simulator_url() -> String {
    format!("{MIRROR}/riscv-software-src/riscv-isa-sim")
}

fn default_infra_url() -> String {
    format!("{MIRROR}/llvm/llvm-project")
}

/// `[repos]` table: clone URL per repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReposConfig {
    #[serde(default = "default_toolchain_url")]
    pub riscv_gnu_toolchain: String,
    #[serde(default = "default_kernel_url")]
    pub riscv_pk: String,
    #[serde(default = "default_simulator_url")]
    pub riscv_isa_sim: String,
    #[serde(default = "default_infra_url")]
    pub llvm_project: String,
}

impl Default for ReposConfig {
    fn default() -> Self {
        Self {
            riscv_gnu_toolchain: default_toolchain_url(),
            riscv_pk: default_kernel_url(),
            riscv_isa_sim: default_simulator_url(),
            llvm_project: default_infra_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
}

impl RepositorySpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

impl ReposConfig {
    /// The three repositories every RISC-V variant builds from.
    pub fn riscv(&self) -> Vec<RepositorySpec> {
        vec![
            RepositorySpec::new(TOOLCHAIN_REPO, self.riscv_gnu_toolchain.trim()),
            RepositorySpec::new(KERNEL_REPO, self.riscv_pk.trim()),
            RepositorySpec::new(SIMULATOR_REPO, self.riscv_isa_sim.trim()),
        ]
    }

    pub fn infra(&self) -> RepositorySpec {
        RepositorySpec::new(INFRA_REPO, self.llvm_project.trim())
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub repo: RepositorySpec,
    pub elapsed_ms: u128,
    pub result: Result<()>,
}

impl FetchOutcome {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub fn fetch_stage_id(repo: &str) -> String {
    format!("fetch.{repo}")
}

/// Re-clones every repository into `ctx.working_dir()`, one worker thread
/// per repository. Stale checkouts are deleted first. All workers are joined
/// before returning; outcomes are in input order.
pub fn fetch_all(exec: &ExecCtx, ctx: &StageContext, repos: &[RepositorySpec]) -> Vec<FetchOutcome> {
    if repos.is_empty() {
        return Vec::new();
    }
    if !exec.dry_run {
        if let Err(e) = fs::create_dir_all(ctx.working_dir()) {
            let reason = format!("cannot create {}: {e}", ctx.working_dir().display());
            return repos
                .iter()
                .map(|r| FetchOutcome {
                    repo: r.clone(),
                    elapsed_ms: 0,
                    result: Err(Error::Fetch {
                        repo: r.name.clone(),
                        reason: reason.clone(),
                    }),
                })
                .collect();
        }
    }

    std::thread::scope(|scope| {
        let handles: Vec<_> = repos
            .iter()
            .map(|repo| {
                let exec = exec.for_stage(fetch_stage_id(&repo.name));
                scope.spawn(move || fetch_one(&exec, ctx, repo))
            })
            .collect();

        handles
            .into_iter()
            .zip(repos)
            .map(|(h, repo)| {
                h.join().unwrap_or_else(|_| FetchOutcome {
                    repo: repo.clone(),
                    elapsed_ms: 0,
                    result: Err(Error::Fetch {
                        repo: repo.name.clone(),
                        reason: "clone worker panicked".into(),
                    }),
                })
            })
            .collect()
    })
}

fn fetch_one(exec: &ExecCtx, ctx: &StageContext, repo: &RepositorySpec) -> FetchOutcome {
    let id = exec.stage_id();
    exec.sink.emit(ExecEvent::StageStarted { id: id.clone() });
    let start = Instant::now();
    let result = clone_fresh(exec, ctx, repo);
    let elapsed_ms = start.elapsed().as_millis();
    exec.sink.emit(ExecEvent::StageFinished {
        id,
        ok: result.is_ok(),
        error: result.as_ref().err().map(ToString::to_string),
        elapsed_ms,
    });
    FetchOutcome {
        repo: repo.clone(),
        elapsed_ms,
        result,
    }
}

fn clone_fresh(exec: &ExecCtx, ctx: &StageContext, repo: &RepositorySpec) -> Result<()> {
    let dest = ctx.working_dir().join(&repo.name);
    let as_fetch_error = |e: Error| match e {
        Error::Fetch { .. } => e,
        other => Error::Fetch {
            repo: repo.name.clone(),
            reason: other.to_string(),
        },
    };

    exec.log(&format!("{} <- {}", repo.name, repo.url));
    exec.remove_dir_within(ctx.working_dir(), &dest)
        .map_err(as_fetch_error)?;

    let inv = Invocation::new("git", ctx)?
        .arg("clone")
        .arg(&repo.url)
        .arg(dest.display().to_string());
    exec.run_step(Step::Fetch, &inv).map_err(|e| match e {
        Error::Fetch { reason, .. } => Error::Fetch {
            repo: repo.name.clone(),
            reason,
        },
        other => as_fetch_error(other),
    })?;

    if !exec.dry_run && !is_git_checkout(&dest) {
        return Err(Error::Fetch {
            repo: repo.name.clone(),
            reason: format!("clone left no git repository at {}", dest.display()),
        });
    }
    Ok(())
}

pub fn is_git_checkout(dir: &Path) -> bool {
    dir.join(".git").exists()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::SearchPath;
    use crate::exec::{CommandRunner, ExitInfo};
    use crate::fakes::{MemorySink, RecordingRunner};

    fn setup(runner: Arc<RecordingRunner>) -> (tempfile::TempDir, ExecCtx, StageContext) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = ExecCtx::new(runner, Arc::new(MemorySink::default()), false);
        let ctx = StageContext::new(tmp.path(), SearchPath::new("/usr/bin"));
        (tmp, exec, ctx)
    }

    #[test]
    fn stale_checkouts_are_replaced() {
        let runner = Arc::new(RecordingRunner::new());
        let (tmp, exec, ctx) = setup(runner.clone());
        let stale = tmp.path().join(KERNEL_REPO);
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("leftover.o"), "x").unwrap();

        let outcomes = fetch_all(&exec, &ctx, &ReposConfig::default().riscv());
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(FetchOutcome::ok));
        assert!(!stale.join("leftover.o").exists());
        assert!(is_git_checkout(&stale));
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn each_repo_reports_its_own_outcome_in_order() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_when("git", "riscv-pk.git");
        let (_tmp, exec, ctx) = setup(runner);

        let outcomes = fetch_all(&exec, &ctx, &ReposConfig::default().riscv());
        let names: Vec<_> = outcomes.iter().map(|o| o.repo.name.as_str()).collect();
        assert_eq!(names, vec![TOOLCHAIN_REPO, KERNEL_REPO, SIMULATOR_REPO]);
        assert!(outcomes[0].ok());
        assert!(outcomes[2].ok());
        match &outcomes[1].result {
            Err(Error::Fetch { repo, .. }) => assert_eq!(repo, KERNEL_REPO),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn successful_exit_without_checkout_is_a_failure() {
        let runner = Arc::new(RecordingRunner::new().without_clone_side_effects());
        let (_tmp, exec, ctx) = setup(runner);
        let outcomes = fetch_all(&exec, &ctx, &[ReposConfig::default().infra()]);
        assert_eq!(outcomes.len(), 1);
        let err = outcomes[0].result.as_ref().unwrap_err();
        assert!(err.to_string().contains("no git repository"), "{err}");
    }

    /// Each clone blocks until every clone has started.
    struct RendezvousRunner {
        barrier: std::sync::Barrier,
    }

    impl CommandRunner for RendezvousRunner {
        fn run(&self, inv: &Invocation, _on_line: &mut dyn FnMut(&str)) -> Result<ExitInfo> {
            if inv.args.first().is_some_and(|a| a == "clone") {
                self.barrier.wait();
                if let Some(dest) = inv.args.last() {
                    fs::create_dir_all(inv.cwd.join(dest).join(".git"))?;
                }
            }
            Ok(ExitInfo::ok())
        }
    }

    #[test]
    fn clones_run_concurrently() {
        let repos = ReposConfig::default().riscv();
        let runner = Arc::new(RendezvousRunner {
            barrier: std::sync::Barrier::new(repos.len()),
        });
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = ExecCtx::new(runner, Arc::new(MemorySink::default()), false);
        let ctx = StageContext::new(tmp.path(), SearchPath::new("/usr/bin"));

        // A sequential fetch would block on the barrier forever.
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(fetch_all(&exec, &ctx, &repos));
        });
        let outcomes = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("clones did not run concurrently");
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(FetchOutcome::ok));
    }

    #[test]
    fn url_overrides_flow_into_specs() {
        let cfg = ReposConfig {
            riscv_pk: " https://example.org/pk.git ".into(),
            ..ReposConfig::default()
        };
        let specs = cfg.riscv();
        assert_eq!(specs[1], RepositorySpec::new(KERNEL_REPO, "https://example.org/pk.git"));
        assert_eq!(cfg.infra().name, INFRA_REPO);
    }
}
