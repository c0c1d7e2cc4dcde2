//! Rewrites the toolchain repository's `.gitmodules` to use mirrors.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::context::StageContext;
use crate::error::{Error, Result};
use crate::exec::{ExecCtx, Invocation, Step};

pub const MANIFEST_FILE: &str = ".gitmodules";

/// Removed from the toolchain rather than rewritten.
pub const EMULATOR_SUBMODULE: &str = "qemu";

pub const REWRITE_STAGE_ID: &str = "rewrite.riscv-gnu-toolchain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmoduleSpec {
    pub name: &'static str,
    pub path: &'static str,
    pub url: &'static str,
    pub branch: Option<&'static str>,
}

pub const TOOLCHAIN_SUBMODULES: &[SubmoduleSpec] = &[
    SubmoduleSpec {
        name: "riscv-binutils",
        path: "riscv-binutils",
        url: "https://github.91chi.fun/https://github.com/riscv-collab/riscv-binutils-gdb.git",
        branch: Some("riscv-binutils-2.38"),
    },
    SubmoduleSpec {
        name: "riscv-gcc",
        path: "riscv-gcc",
        url: "https://github.91chi.fun/https://github.com/riscv-collab/riscv-gcc.git",
        branch: Some("riscv-gcc-12.1.0"),
    },
    SubmoduleSpec {
        name: "glibc",
        path: "glibc",
        url: "https://gitee.com/mirrors_community_sourceware/glibc.git",
        branch: None,
    },
    SubmoduleSpec {
        name: "riscv-dejagnu",
        path: "riscv-dejagnu",
        url: "https://github.91chi.fun/https://github.com/riscv-collab/riscv-dejagnu.git",
        branch: Some("riscv-dejagnu-1.6"),
    },
    SubmoduleSpec {
        name: "newlib",
        path: "newlib",
        url: "https://gitee.com/mirrors_community_sourceware/newlib-cygwin_1.git",
        branch: Some("master"),
    },
    SubmoduleSpec {
        name: "riscv-gdb",
        path: "riscv-gdb",
        url: "https://github.91chi.fun/https://github.com/riscv-collab/riscv-binutils-gdb.git",
        branch: Some("fsf-gdb-10.1-with-sim"),
    },
    SubmoduleSpec {
        name: "musl",
        path: "musl",
        url: "https://gitee.com/mirrors_community_musl-libc/musl.git",
        branch: Some("master"),
    },
];

/// Renders the manifest in git's own layout (tab-indented keys). Output
/// depends only on `specs`.
pub fn render_manifest(specs: &[SubmoduleSpec]) -> String {
    let mut out = String::new();
    for s in specs {
        let _ = writeln!(out, "[submodule \"{}\"]", s.name);
        let _ = writeln!(out, "\tpath = {}", s.path);
        let _ = writeln!(out, "\turl = {}", s.url);
        if let Some(b) = s.branch {
            let _ = writeln!(out, "\tbranch = {b}");
        }
    }
    out
}

/// Points the toolchain's nested dependencies at the mirrors in `specs` and
/// re-initializes them. Every command runs with `repo_dir` as its working
/// directory; nothing about the calling process changes.
pub fn rewrite(exec: &ExecCtx, ctx: &StageContext, repo_dir: &Path, specs: &[SubmoduleSpec]) -> Result<()> {
    let repo = ctx.in_dir(repo_dir);
    let manifest = repo_dir.join(MANIFEST_FILE);

    if emulator_present(repo_dir, &manifest) {
        exec.log(&format!("removing {EMULATOR_SUBMODULE} submodule"));
        let rm = Invocation::new("git", &repo)?.args(["rm", "-r", "-f", "--quiet", EMULATOR_SUBMODULE]);
        exec.run_step(Step::Rewrite, &rm)?;
    } else {
        exec.log(&format!("{EMULATOR_SUBMODULE} submodule already absent"));
    }

    exec.write_file(&manifest, &render_manifest(specs))
        .map_err(|e| Error::Rewrite(e.to_string()))?;

    let sync = Invocation::new("git", &repo)?.args(["submodule", "sync", "--recursive"]);
    exec.run_step(Step::Rewrite, &sync)?;

    let update = Invocation::new("git", &repo)?.args(["submodule", "update", "--init", "--recursive"]);
    exec.run_step(Step::Rewrite, &update)?;
    Ok(())
}

fn emulator_present(repo_dir: &Path, manifest: &Path) -> bool {
    if repo_dir.join(EMULATOR_SUBMODULE).exists() {
        return true;
    }
    let needle = format!("[submodule \"{EMULATOR_SUBMODULE}\"]");
    fs::read_to_string(manifest)
        .map(|m| m.contains(&needle))
        .unwrap_or(false)
}
