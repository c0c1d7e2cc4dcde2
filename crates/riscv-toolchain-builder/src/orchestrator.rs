//! Drives a resolved [`ExecutionPlan`]: infra track, then shared RISC-V
//! sources, then every requested variant in order.
//!
//! The orchestrator is the only place that decides whether to continue after
//! a failure. Stages themselves just return `Result`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::context::{SearchPath, StageContext};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, ExecCtx, ExecEvent, ExecSink};
use crate::layout;
use crate::plan::ExecutionPlan;
use crate::profile::VariantId;
use crate::progress::{StageKind, ToolchainFailurePolicy, VariantProgress};
use crate::repos::{self, INFRA_REPO, fetch_stage_id};
use crate::report::{InfraReport, RunReport, StageRecord, VariantReport};
use crate::stages::{self, stage_id};
use crate::submodules::{self, REWRITE_STAGE_ID, TOOLCHAIN_SUBMODULES};

pub const INFRA_BUILD_STAGE: &str = "llvm.build";

const VARIANT_STAGES: [StageKind; 3] = [StageKind::Toolchain, StageKind::Kernel, StageKind::Simulator];

pub struct Orchestrator {
    settings: Settings,
    exec: ExecCtx,
    search_path: SearchPath,
}

impl Orchestrator {
    /// The inherited `PATH` is read once, here.
    pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            settings,
            exec: ExecCtx::new(runner, sink, false),
            search_path: SearchPath::from_env(),
        }
    }

    pub fn with_search_path(mut self, search_path: SearchPath) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.exec.dry_run = on;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn base_context(&self) -> StageContext {
        StageContext::new(&self.settings.layout.sources_dir, self.search_path.reset())
    }

    pub fn run(&self, plan: &ExecutionPlan) -> RunReport {
        let mut report = RunReport::new(self.exec.dry_run);
        if plan.is_noop() {
            tracing::info!("empty plan; nothing to do");
            self.exec.sink.emit(ExecEvent::RunDone { ok: true });
            return report;
        }

        let base = self.base_context();
        if plan.infra {
            report.infra = Some(self.run_infra(plan, &base));
        }
        if plan.touches_sources() {
            let sources_ready = self.prepare_sources(plan, &base, &mut report.sources);
            for &variant in &plan.variants {
                let v = self.run_variant(variant, &base, sources_ready.as_ref().err());
                report.variants.push(v);
            }
        }

        report.finished_at = chrono::Utc::now();
        self.exec.sink.emit(ExecEvent::RunDone { ok: report.ok() });
        report
    }

    /// Runs `f` as stage `id`, bracketed by start/finish events.
    fn run_stage<T>(&self, id: &str, f: impl FnOnce(&ExecCtx) -> Result<T>) -> (StageRecord, Result<T>) {
        let exec = self.exec.for_stage(id);
        exec.sink.emit(ExecEvent::StageStarted { id: id.to_string() });
        let start = Instant::now();
        let result = f(&exec);
        let elapsed_ms = start.elapsed().as_millis();
        exec.sink.emit(ExecEvent::StageFinished {
            id: id.to_string(),
            ok: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            elapsed_ms,
        });
        let record = match &result {
            Ok(_) => StageRecord::ok(id, elapsed_ms),
            Err(e) => StageRecord::failed(id, e, elapsed_ms),
        };
        (record, result)
    }

    fn run_infra(&self, plan: &ExecutionPlan, base: &StageContext) -> InfraReport {
        let llvm = &self.settings.llvm;
        let mut records = Vec::new();
        // The infra track starts from the bare inherited PATH like every variant.
        let ctx = base.with_fresh_overlay();

        let ready = if plan.fetch_infra {
            let outcomes = repos::fetch_all(&self.exec, &ctx, &[self.settings.repos.infra()]);
            let mut ready = Ok(());
            for o in &outcomes {
                records.push(StageRecord::from_fetch(fetch_stage_id(&o.repo.name), o));
                if let Err(e) = &o.result {
                    ready = Err(e.to_string());
                }
            }
            ready
        } else {
            self.check_sources(&[INFRA_REPO], &mut records)
        };

        match ready {
            Ok(()) => {
                let (record, _) = self.run_stage(INFRA_BUILD_STAGE, |exec| {
                    stages::build_llvm(exec, &ctx, llvm, self.settings.jobs)
                });
                records.push(record);
            }
            Err(reason) => records.push(StageRecord::skipped(INFRA_BUILD_STAGE, reason)),
        }

        InfraReport {
            install_dir: llvm.install_dir.clone(),
            stages: records,
            installed_files: layout::count_files(&llvm.install_dir),
        }
    }

    /// Fetch, rewrite, or presence check for the three RISC-V repositories.
    /// `Err` carries the reason every variant will fail with.
    fn prepare_sources(
        &self,
        plan: &ExecutionPlan,
        base: &StageContext,
        records: &mut Vec<StageRecord>,
    ) -> std::result::Result<(), String> {
        if plan.fetch {
            let outcomes = repos::fetch_all(&self.exec, base, &self.settings.repos.riscv());
            let mut failed = Vec::new();
            for o in &outcomes {
                records.push(StageRecord::from_fetch(fetch_stage_id(&o.repo.name), o));
                if !o.ok() {
                    failed.push(o.repo.name.clone());
                }
            }
            if !failed.is_empty() {
                if plan.rewrite {
                    records.push(StageRecord::skipped(REWRITE_STAGE_ID, "fetch failed"));
                }
                return Err(format!("fetch failed for {}", failed.join(", ")));
            }
        } else {
            self.check_sources(
                &[repos::TOOLCHAIN_REPO, repos::KERNEL_REPO, repos::SIMULATOR_REPO],
                records,
            )?;
        }

        if plan.rewrite {
            let repo_dir = self.settings.layout.source_dir(repos::TOOLCHAIN_REPO);
            let (record, result) = self.run_stage(REWRITE_STAGE_ID, |exec| {
                submodules::rewrite(exec, base, &repo_dir, TOOLCHAIN_SUBMODULES)
            });
            records.push(record);
            result.map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Without a fetch the trees must already be there. Each missing one is
    /// recorded as a failed `check.<repo>` stage.
    fn check_sources(
        &self,
        names: &[&str],
        records: &mut Vec<StageRecord>,
    ) -> std::result::Result<(), String> {
        if self.exec.dry_run {
            return Ok(());
        }
        let mut missing = Vec::new();
        for &name in names {
            let dir = self.settings.layout.source_dir(name);
            if dir.is_dir() {
                continue;
            }
            let err = Error::Fetch {
                repo: name.to_string(),
                reason: format!("no source tree at {} and no fetch requested", dir.display()),
            };
            tracing::error!("{err}");
            records.push(StageRecord::failed(check_stage_id(name), &err, 0));
            missing.push(name);
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing source trees: {}", missing.join(", ")))
        }
    }

    fn run_variant(&self, variant: VariantId, base: &StageContext, sources_failed: Option<&String>) -> VariantReport {
        let profile = variant.profile();
        let install = self.settings.layout.install_dir(variant);
        let jobs = self.settings.jobs;
        let mut progress = VariantProgress::default();
        let mut records = Vec::new();
        // Nothing a previous variant added to the search path survives here.
        let ctx = base.with_fresh_overlay();
        let mut overlay = ctx.search_path().overlay().to_vec();

        let finish = |progress: VariantProgress, records: Vec<StageRecord>, overlay: Vec<PathBuf>| VariantReport {
            variant,
            install_dir: install.clone(),
            state: progress.state().clone(),
            stages: records,
            overlay,
            installed_files: layout::count_files(&install),
        };

        if let Some(reason) = sources_failed {
            progress.fail(StageKind::Fetch, reason.clone());
            skip_all(variant, &mut records, "sources unavailable");
            return finish(progress, records, overlay);
        }
        progress.complete(StageKind::Fetch);

        let prepare_id = stage_id(variant.as_str(), StageKind::Prepare.as_str());
        if let Err(e) = self.prepare_install_dir(&install) {
            tracing::error!(variant = %variant, "cannot prepare {}: {e}", install.display());
            progress.fail(StageKind::Prepare, e.to_string());
            records.push(StageRecord::failed(prepare_id, &e, 0));
            skip_all(variant, &mut records, "install directory could not be prepared");
            return finish(progress, records, overlay);
        }

        let toolchain_id = stage_id(variant.as_str(), StageKind::Toolchain.as_str());
        let (record, toolchain) = self.run_stage(&toolchain_id, |exec| {
            stages::build_toolchain(exec, &ctx, profile, &install, jobs)
        });
        records.push(record);
        match &toolchain {
            Ok(()) => {
                progress.complete(StageKind::Toolchain);
            }
            Err(e) => progress.fail(StageKind::Toolchain, e.to_string()),
        }

        let kernel_id = stage_id(variant.as_str(), StageKind::Kernel.as_str());
        let attempt_kernel = toolchain.is_ok()
            || self.settings.on_toolchain_failure == ToolchainFailurePolicy::AttemptKernel;
        if attempt_kernel {
            overlay = stages::cross_context(&ctx, &install).search_path().overlay().to_vec();
            let (record, kernel) = self.run_stage(&kernel_id, |exec| {
                stages::build_kernel(exec, &ctx, profile, &install, jobs)
            });
            records.push(record);
            match kernel {
                Ok(_) => {
                    progress.complete(StageKind::Kernel);
                }
                Err(e) => progress.fail(StageKind::Kernel, e.to_string()),
            }
        } else {
            records.push(StageRecord::skipped(kernel_id, "toolchain stage failed"));
        }

        // The simulator is a host build and always runs.
        let simulator_id = stage_id(variant.as_str(), StageKind::Simulator.as_str());
        let (record, simulator) = self.run_stage(&simulator_id, |exec| {
            stages::build_simulator(exec, &ctx, &install, jobs)
        });
        records.push(record);
        match simulator {
            Ok(()) => {
                progress.complete(StageKind::Simulator);
            }
            Err(e) => progress.fail(StageKind::Simulator, e.to_string()),
        }

        finish(progress, records, overlay)
    }

    fn prepare_install_dir(&self, install: &Path) -> Result<()> {
        let root = &self.settings.layout.install_root;
        if self.exec.dry_run {
            if install.exists() {
                tracing::info!("DRY-RUN: would remove {}", install.display());
            }
            return Ok(());
        }
        layout::prepare(root, install)
    }
}

pub fn check_stage_id(repo: &str) -> String {
    format!("check.{repo}")
}

fn skip_all(variant: VariantId, stages: &mut Vec<StageRecord>, reason: &str) {
    for kind in VARIANT_STAGES {
        stages.push(StageRecord::skipped(stage_id(variant.as_str(), kind.as_str()), reason));
    }
}

/// Stage ids a plan would run, in order, assuming nothing fails.
pub fn planned_stages(plan: &ExecutionPlan) -> Vec<String> {
    let mut out = Vec::new();
    if plan.infra {
        if plan.fetch_infra {
            out.push(fetch_stage_id(INFRA_REPO));
        }
        out.push(INFRA_BUILD_STAGE.to_string());
    }
    if plan.touches_sources() {
        if plan.fetch {
            for repo in [repos::TOOLCHAIN_REPO, repos::KERNEL_REPO, repos::SIMULATOR_REPO] {
                out.push(fetch_stage_id(repo));
            }
        }
        if plan.rewrite {
            out.push(REWRITE_STAGE_ID.to_string());
        }
        for v in &plan.variants {
            for kind in VARIANT_STAGES {
                out.push(stage_id(v.as_str(), kind.as_str()));
            }
        }
    }
    out
}
