use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Fetch,
    /// Clearing the install directory. It can fail a variant but never
    /// advances one.
    Prepare,
    Toolchain,
    Kernel,
    Simulator,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Fetch => "fetch",
            StageKind::Prepare => "prepare",
            StageKind::Toolchain => "toolchain",
            StageKind::Kernel => "kernel",
            StageKind::Simulator => "simulator",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum VariantState {
    Pending,
    Fetched,
    ToolchainBuilt,
    KernelBuilt,
    SimulatorBuilt,
    Failed { stage: StageKind, reason: String },
}

impl VariantState {
    /// The stage whose success moves this state forward.
    fn next_stage(&self) -> Option<StageKind> {
        match self {
            VariantState::Pending => Some(StageKind::Fetch),
            VariantState::Fetched => Some(StageKind::Toolchain),
            VariantState::ToolchainBuilt => Some(StageKind::Kernel),
            VariantState::KernelBuilt => Some(StageKind::Simulator),
            VariantState::SimulatorBuilt | VariantState::Failed { .. } => None,
        }
    }

    fn after(stage: StageKind) -> Option<Self> {
        match stage {
            StageKind::Fetch => Some(VariantState::Fetched),
            StageKind::Prepare => None,
            StageKind::Toolchain => Some(VariantState::ToolchainBuilt),
            StageKind::Kernel => Some(VariantState::KernelBuilt),
            StageKind::Simulator => Some(VariantState::SimulatorBuilt),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VariantState::SimulatorBuilt | VariantState::Failed { .. }
        )
    }
}

/// `Pending → Fetched → ToolchainBuilt → KernelBuilt → SimulatorBuilt`, with
/// `Failed` absorbing. Only the first failure is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantProgress {
    state: VariantState,
}

impl Default for VariantProgress {
    fn default() -> Self {
        Self {
            state: VariantState::Pending,
        }
    }
}

impl VariantProgress {
    pub fn state(&self) -> &VariantState {
        &self.state
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, VariantState::Failed { .. })
    }

    /// Records a successful stage. Returns `false` (and changes nothing) if
    /// `stage` is not the one the current state is waiting for.
    pub fn complete(&mut self, stage: StageKind) -> bool {
        if self.state.next_stage() != Some(stage) {
            return false;
        }
        match VariantState::after(stage) {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        }
    }

    pub fn fail(&mut self, stage: StageKind, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = VariantState::Failed {
            stage,
            reason: reason.into(),
        };
    }
}

/// What to do with the runtime-kernel stage when the same variant's
/// toolchain stage failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolchainFailurePolicy {
    #[default]
    SkipKernel,
    AttemptKernel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_state() {
        let mut p = VariantProgress::default();
        for stage in [
            StageKind::Fetch,
            StageKind::Toolchain,
            StageKind::Kernel,
            StageKind::Simulator,
        ] {
            assert!(p.complete(stage), "{stage}");
        }
        assert_eq!(p.state(), &VariantState::SimulatorBuilt);
        assert!(p.state().is_terminal());
    }

    #[test]
    fn out_of_order_completion_is_ignored() {
        let mut p = VariantProgress::default();
        assert!(!p.complete(StageKind::Kernel));
        assert_eq!(p.state(), &VariantState::Pending);
    }

    #[test]
    fn failure_absorbs_and_keeps_first_reason() {
        let mut p = VariantProgress::default();
        p.complete(StageKind::Fetch);
        p.fail(StageKind::Toolchain, "make exited 2");
        p.fail(StageKind::Simulator, "later");
        assert!(!p.complete(StageKind::Kernel));
        assert_eq!(
            p.state(),
            &VariantState::Failed {
                stage: StageKind::Toolchain,
                reason: "make exited 2".into()
            }
        );
    }

    #[test]
    fn prepare_can_fail_but_never_completes() {
        let mut p = VariantProgress::default();
        p.complete(StageKind::Fetch);
        assert!(!p.complete(StageKind::Prepare));
        assert_eq!(p.state(), &VariantState::Fetched);
        p.fail(StageKind::Prepare, "refusing to remove");
        assert!(matches!(
            p.state(),
            VariantState::Failed { stage: StageKind::Prepare, .. }
        ));
    }

    #[test]
    fn policy_parses_from_kebab_case() {
        #[derive(Deserialize)]
        struct Wrap {
            p: ToolchainFailurePolicy,
        }
        let w: Wrap = toml::from_str("p = \"attempt-kernel\"").unwrap();
        assert_eq!(w.p, ToolchainFailurePolicy::AttemptKernel);
        assert_eq!(ToolchainFailurePolicy::default(), ToolchainFailurePolicy::SkipKernel);
    }
}
