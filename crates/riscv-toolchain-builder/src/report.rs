use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::profile::VariantId;
use crate::progress::VariantState;
use crate::repos::FetchOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum StageOutcome {
    Ok,
    Failed { kind: String, reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub id: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub elapsed_ms: u128,
}

impl StageRecord {
    pub fn ok(id: impl Into<String>, elapsed_ms: u128) -> Self {
        Self {
            id: id.into(),
            outcome: StageOutcome::Ok,
            elapsed_ms,
        }
    }

    pub fn failed(id: impl Into<String>, err: &Error, elapsed_ms: u128) -> Self {
        Self {
            id: id.into(),
            outcome: StageOutcome::Failed {
                kind: err.kind().to_string(),
                reason: err.to_string(),
            },
            elapsed_ms,
        }
    }

    pub fn skipped(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: StageOutcome::Skipped {
                reason: reason.into(),
            },
            elapsed_ms: 0,
        }
    }

    pub fn from_fetch(id: impl Into<String>, outcome: &FetchOutcome) -> Self {
        match &outcome.result {
            Ok(()) => Self::ok(id, outcome.elapsed_ms),
            Err(e) => Self::failed(id, e, outcome.elapsed_ms),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, StageOutcome::Failed { .. })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, StageOutcome::Ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantReport {
    pub variant: VariantId,
    pub install_dir: PathBuf,
    pub state: VariantState,
    pub stages: Vec<StageRecord>,
    /// Search path overlay the kernel stage ran with, whatever its outcome.
    /// Empty when the kernel stage was skipped.
    pub overlay: Vec<PathBuf>,
    pub installed_files: usize,
}

impl VariantReport {
    pub fn stage(&self, id: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InfraReport {
    pub install_dir: PathBuf,
    pub stages: Vec<StageRecord>,
    pub installed_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub infra: Option<InfraReport>,
    /// Shared RISC-V source stages (fetch and manifest rewrite).
    pub sources: Vec<StageRecord>,
    pub variants: Vec<VariantReport>,
}

impl RunReport {
    pub fn new(dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            dry_run,
            infra: None,
            sources: Vec::new(),
            variants: Vec::new(),
        }
    }

    pub fn all_stages(&self) -> impl Iterator<Item = &StageRecord> {
        self.infra
            .iter()
            .flat_map(|i| i.stages.iter())
            .chain(self.sources.iter())
            .chain(self.variants.iter().flat_map(|v| v.stages.iter()))
    }

    pub fn ok(&self) -> bool {
        !self.all_stages().any(StageRecord::is_failed)
            && !self
                .variants
                .iter()
                .any(|v| matches!(v.state, VariantState::Failed { .. }))
    }

    pub fn failed_stages(&self) -> Vec<&StageRecord> {
        self.all_stages().filter(|s| s.is_failed()).collect()
    }

    pub fn variant(&self, id: VariantId) -> Option<&VariantReport> {
        self.variants.iter().find(|v| v.variant == id)
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        if self.infra.is_none() && self.sources.is_empty() && self.variants.is_empty() {
            out.push_str("nothing to build\n");
            return out;
        }
        for s in self.all_stages() {
            let status = match &s.outcome {
                StageOutcome::Ok => "ok".to_string(),
                StageOutcome::Failed { kind, .. } => format!("FAILED ({kind})"),
                StageOutcome::Skipped { reason } => format!("skipped: {reason}"),
            };
            let _ = writeln!(out, "  {:<28} {status}", s.id);
        }
        if let Some(infra) = &self.infra {
            let _ = writeln!(
                out,
                "llvm installed in {} ({} files)",
                infra.install_dir.display(),
                infra.installed_files
            );
        }
        for v in &self.variants {
            let _ = writeln!(
                out,
                "{} installed in {} ({} files)",
                v.variant,
                v.install_dir.display(),
                v.installed_files
            );
        }
        if let Some(root) = self.variants.first().and_then(|v| v.install_dir.parent()) {
            let _ = writeln!(
                out,
                "add <dir>/bin to PATH to use a toolchain; RISC-V installs live under {}",
                root.display()
            );
        }
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| Error::msg(format!("failed to encode report: {e}")))?;
        fs::write(path, body)
            .map_err(|e| Error::msg(format!("failed to write report {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(stages: Vec<StageRecord>) -> VariantReport {
        VariantReport {
            variant: VariantId::ElfRvv,
            install_dir: PathBuf::from("/inst/elf-rvv"),
            state: VariantState::SimulatorBuilt,
            stages,
            overlay: Vec::new(),
            installed_files: 3,
        }
    }

    #[test]
    fn skipped_stages_do_not_fail_the_run() {
        let mut r = RunReport::new(false);
        r.variants.push(variant(vec![
            StageRecord::ok("elf-rvv.toolchain", 5),
            StageRecord::skipped("elf-rvv.kernel", "toolchain failed"),
        ]));
        assert!(r.ok());

        let err = Error::Compile {
            stage: "elf-rvv.simulator".into(),
            reason: "exit status: 2".into(),
        };
        r.variants[0]
            .stages
            .push(StageRecord::failed("elf-rvv.simulator", &err, 9));
        assert!(!r.ok());
        assert_eq!(r.failed_stages().len(), 1);
        assert!(r.summary().contains("FAILED (compile)"));
    }

    #[test]
    fn json_report_carries_status_tags() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut r = RunReport::new(true);
        r.variants.push(variant(vec![StageRecord::skipped("elf-rvv.kernel", "policy")]));
        let path = tmp.path().join("out/report.json");
        r.write_json(&path).unwrap();

        let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["dry_run"], true);
        assert_eq!(v["variants"][0]["variant"], "elf-rvv");
        assert_eq!(v["variants"][0]["state"]["state"], "simulator-built");
        assert_eq!(v["variants"][0]["stages"][0]["status"], "skipped");
        assert_eq!(v["variants"][0]["installed_files"], 3);
    }

    #[test]
    fn empty_report_says_so() {
        assert_eq!(RunReport::new(false).summary(), "nothing to build\n");
    }
}
