//! The external build steps. Each function gets the variant's base context
//! (working directory = sources dir) and derives the directories it needs.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::context::StageContext;
use crate::error::Result;
use crate::exec::{ExecCtx, Invocation, Step};
use crate::profile::{VariantProfile, prefix_arg};
use crate::repos::{INFRA_REPO, KERNEL_REPO, SIMULATOR_REPO, TOOLCHAIN_REPO};

pub const BUILD_DIR: &str = "build";
pub const GCC_SUBMODULE: &str = "riscv-gcc";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlvmGenerator {
    #[default]
    Ninja,
    Make,
}

impl LlvmGenerator {
    /// Value for `cmake -G`.
    pub fn cmake_name(self) -> &'static str {
        match self {
            LlvmGenerator::Ninja => "Ninja",
            LlvmGenerator::Make => "Unix Makefiles",
        }
    }

    pub fn driver(self) -> &'static str {
        match self {
            LlvmGenerator::Ninja => "ninja",
            LlvmGenerator::Make => "make",
        }
    }
}

fn default_c_compiler() -> String {
    "gcc".into()
}

fn default_cxx_compiler() -> String {
    "g++".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlvmConfig {
    pub generator: LlvmGenerator,
    /// Defaults to `<sources_dir>/llvm-project/install`.
    pub install_dir: Option<String>,
    #[serde(default = "default_c_compiler")]
    pub c_compiler: String,
    #[serde(default = "default_cxx_compiler")]
    pub cxx_compiler: String,
}

impl Default for LlvmConfig {
    fn default() -> Self {
        Self {
            generator: LlvmGenerator::default(),
            install_dir: None,
            c_compiler: default_c_compiler(),
            cxx_compiler: default_cxx_compiler(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlvmSettings {
    pub generator: LlvmGenerator,
    pub install_dir: PathBuf,
    pub c_compiler: String,
    pub cxx_compiler: String,
}

pub fn stage_id(variant: &str, stage: &str) -> String {
    format!("{variant}.{stage}")
}

fn fresh_build_dir(exec: &ExecCtx, repo_dir: &Path) -> Result<PathBuf> {
    let build = repo_dir.join(BUILD_DIR);
    exec.recreate_dir_within(repo_dir, &build)?;
    Ok(build)
}

fn configure_script(repo_dir: &Path) -> String {
    repo_dir.join("configure").display().to_string()
}

/// Stage 1. Builds the cross compiler; its own make run leaves the tools
/// under `install`, so there is no separate install step.
pub fn build_toolchain(
    exec: &ExecCtx,
    base: &StageContext,
    profile: &VariantProfile,
    install: &Path,
    jobs: usize,
) -> Result<()> {
    let repo_dir = base.working_dir().join(TOOLCHAIN_REPO);

    let gcc = base.in_dir(repo_dir.join(GCC_SUBMODULE));
    exec.log(&format!("selecting {} branch {}", GCC_SUBMODULE, profile.gcc_branch));
    let checkout = Invocation::new("git", &gcc)?.args(["checkout", profile.gcc_branch]);
    exec.run_step(Step::Configure, &checkout)?;

    let build = base.in_dir(fresh_build_dir(exec, &repo_dir)?);
    let configure = Invocation::new(configure_script(&repo_dir), &build)?
        .args(profile.toolchain_configure_args(install));
    exec.run_step(Step::Configure, &configure)?;

    let make = Invocation::new("make", &build)?.args(profile.toolchain_make_args(jobs));
    exec.run_step(Step::Compile, &make)?;
    Ok(())
}

/// `base` with `<install>/bin` in front of the search path.
pub fn cross_context(base: &StageContext, install: &Path) -> StageContext {
    base.with_bin(install.join("bin"))
}

/// Stage 2. Runs under [`cross_context`] so the freshly built
/// `<triple>-gcc` is the one configure finds, and returns that context.
pub fn build_kernel(
    exec: &ExecCtx,
    base: &StageContext,
    profile: &VariantProfile,
    install: &Path,
    jobs: usize,
) -> Result<StageContext> {
    let repo_dir = base.working_dir().join(KERNEL_REPO);
    let build_dir = fresh_build_dir(exec, &repo_dir)?;

    let with_cross = cross_context(base, install);
    let build = with_cross.in_dir(&build_dir);
    let configure = Invocation::new(configure_script(&repo_dir), &build)?
        .args(profile.kernel_configure_args(install));
    exec.run_step(Step::Configure, &configure)?;

    make_and_install(exec, &build, jobs)?;
    Ok(with_cross)
}

/// Stage 3. Host build of the simulator; does not need the cross compiler.
pub fn build_simulator(exec: &ExecCtx, base: &StageContext, install: &Path, jobs: usize) -> Result<()> {
    let repo_dir = base.working_dir().join(SIMULATOR_REPO);
    let build = base.in_dir(fresh_build_dir(exec, &repo_dir)?);

    let configure = Invocation::new(configure_script(&repo_dir), &build)?.arg(prefix_arg(install));
    exec.run_step(Step::Configure, &configure)?;

    make_and_install(exec, &build, jobs)
}

fn make_and_install(exec: &ExecCtx, build: &StageContext, jobs: usize) -> Result<()> {
    let make = Invocation::new("make", build)?.arg(format!("-j{jobs}"));
    exec.run_step(Step::Compile, &make)?;
    let install = Invocation::new("make", build)?.arg("install");
    exec.run_step(Step::Install, &install)?;
    Ok(())
}

/// Compiler-infrastructure track: LLVM + clang restricted to the RISC-V
/// backend, built with the host compilers.
pub fn build_llvm(exec: &ExecCtx, base: &StageContext, llvm: &LlvmSettings, jobs: usize) -> Result<()> {
    let repo_dir = base.working_dir().join(INFRA_REPO);
    let build = base.in_dir(fresh_build_dir(exec, &repo_dir)?);

    let cc = host_compiler(exec, base, &llvm.c_compiler);
    let cxx = host_compiler(exec, base, &llvm.cxx_compiler);

    let configure = Invocation::new("cmake", &build)?.args([
        "-G".to_string(),
        llvm.generator.cmake_name().to_string(),
        format!("-DCMAKE_C_COMPILER={cc}"),
        format!("-DCMAKE_CXX_COMPILER={cxx}"),
        format!("-DCMAKE_ASM_COMPILER={cc}"),
        "-DCMAKE_BUILD_TYPE=Release".to_string(),
        format!("-DCMAKE_INSTALL_PREFIX={}", llvm.install_dir.display()),
        "-DLLVM_TARGETS_TO_BUILD=RISCV".to_string(),
        "-DLLVM_ENABLE_PROJECTS=clang".to_string(),
        repo_dir.join("llvm").display().to_string(),
    ]);
    exec.run_step(Step::Configure, &configure)?;

    let driver = llvm.generator.driver();
    let compile = Invocation::new(driver, &build)?.arg(format!("-j{jobs}"));
    exec.run_step(Step::Compile, &compile)?;
    let install = Invocation::new(driver, &build)?.arg("install");
    exec.run_step(Step::Install, &install)?;
    Ok(())
}

fn host_compiler(exec: &ExecCtx, ctx: &StageContext, name: &str) -> String {
    match ctx.search_path().lookup(name) {
        Some(p) => p.display().to_string(),
        None => {
            exec.log(&format!("{name} not found on PATH; passing it to cmake unresolved"));
            name.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::context::SearchPath;
    use crate::fakes::{MemorySink, RecordingRunner};
    use crate::profile::VariantId;

    fn fixture() -> (tempfile::TempDir, Arc<RecordingRunner>, ExecCtx, StageContext) {
        let tmp = tempfile::tempdir().expect("tempdir");
        for repo in [TOOLCHAIN_REPO, KERNEL_REPO, SIMULATOR_REPO, INFRA_REPO] {
            fs::create_dir_all(tmp.path().join(repo)).unwrap();
        }
        let runner = Arc::new(RecordingRunner::new());
        let exec = ExecCtx::new(runner.clone(), Arc::new(MemorySink::default()), false);
        let base = StageContext::new(tmp.path(), SearchPath::new("/usr/bin"));
        (tmp, runner, exec, base)
    }

    #[test]
    fn toolchain_checks_out_branch_then_configures_and_makes() {
        let (tmp, runner, exec, base) = fixture();
        let stale = tmp.path().join(TOOLCHAIN_REPO).join(BUILD_DIR).join("Makefile");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, "old").unwrap();

        let install = tmp.path().join("inst/linux");
        build_toolchain(&exec, &base, VariantId::Linux.profile(), &install, 4).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].args, vec!["checkout", "riscv-gcc-12.1.0"]);
        assert_eq!(calls[0].cwd, tmp.path().join(TOOLCHAIN_REPO).join(GCC_SUBMODULE));
        assert!(calls[1].program.ends_with("riscv-gnu-toolchain/configure"));
        assert_eq!(calls[1].args, vec![format!("--prefix={}", install.display())]);
        assert_eq!(calls[2].args, vec!["linux", "-j4"]);
        assert!(!stale.exists());
    }

    #[test]
    fn kernel_configure_sees_install_bin_first() {
        let (tmp, runner, exec, base) = fixture();
        let install = tmp.path().join("inst/elf");
        let returned = build_kernel(&exec, &base, VariantId::Elf.profile(), &install, 2).unwrap();

        let calls = runner.calls();
        let configure = &calls[0];
        assert_eq!(configure.path_entries()[0], install.join("bin"));
        assert!(configure.args.contains(&"CC=riscv64-unknown-elf-gcc".to_string()));
        assert_eq!(calls[1].args, vec!["-j2"]);
        assert_eq!(calls[2].args, vec!["install"]);
        assert_eq!(returned.search_path().overlay(), &[install.join("bin")]);
        assert!(base.search_path().overlay().is_empty());
    }

    #[test]
    fn failing_make_install_is_an_install_error() {
        let (tmp, runner, exec, base) = fixture();
        runner.fail_when("make", "install");
        let err = build_simulator(&exec, &base, &tmp.path().join("inst/elf"), 1).unwrap_err();
        assert_eq!(err.kind(), "install");
    }

    #[test]
    fn llvm_restricts_targets_and_uses_selected_driver() {
        let (tmp, runner, exec, base) = fixture();
        let llvm = LlvmSettings {
            generator: LlvmGenerator::Make,
            install_dir: tmp.path().join("llvm-install"),
            c_compiler: "/opt/host/gcc".into(),
            cxx_compiler: "g++-that-does-not-exist".into(),
        };
        build_llvm(&exec, &base, &llvm, 16).unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].program, "cmake");
        assert_eq!(calls[0].args[0..2], ["-G".to_string(), "Unix Makefiles".to_string()]);
        assert!(calls[0].args.contains(&"-DLLVM_TARGETS_TO_BUILD=RISCV".to_string()));
        assert!(calls[0].args.contains(&"-DLLVM_ENABLE_PROJECTS=clang".to_string()));
        assert!(calls[0].args.contains(&"-DCMAKE_CXX_COMPILER=g++-that-does-not-exist".to_string()));
        assert!(calls[0].args.last().unwrap().ends_with("llvm-project/llvm"));
        assert_eq!(calls[0].cwd, tmp.path().join(INFRA_REPO).join(BUILD_DIR));
        assert_eq!((calls[1].program.as_str(), calls[1].args.clone()), ("make", vec!["-j16".to_string()]));
        assert_eq!(calls[2].args, vec!["install"]);
        assert!(calls.iter().all(|c| c.path_entries() == vec![PathBuf::from("/usr/bin")]));
    }
}
