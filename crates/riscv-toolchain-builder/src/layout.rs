use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::profile::VariantId;

fn default_install_root() -> String {
    "riscv_install".into()
}

fn default_sources_dir() -> String {
    ".".into()
}

fn default_logs_dir() -> String {
    "build/error-logs".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    #[serde(default = "default_install_root")]
    pub install_root: String,
    #[serde(default = "default_sources_dir")]
    pub sources_dir: String,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            install_root: default_install_root(),
            sources_dir: default_sources_dir(),
            logs_dir: default_logs_dir(),
        }
    }
}

/// Absolute directories for one run. Each variant installs into its own
/// subdirectory of `install_root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub install_root: PathBuf,
    pub sources_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Layout {
    pub fn resolve(base: &Path, cfg: &LayoutConfig) -> Result<Self> {
        Ok(Self {
            install_root: resolve_user_dir(base, &cfg.install_root)?,
            sources_dir: resolve_user_dir(base, &cfg.sources_dir)?,
            logs_dir: resolve_user_dir(base, &cfg.logs_dir)?,
        })
    }

    pub fn install_dir(&self, id: VariantId) -> PathBuf {
        self.install_root.join(id.as_str())
    }

    pub fn source_dir(&self, repo: &str) -> PathBuf {
        self.sources_dir.join(repo)
    }
}

fn resolve_user_dir(base: &Path, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config("empty directory in [layout]".into()));
    }
    let p = PathBuf::from(raw);
    if !p.is_absolute() && p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::Config(format!(
            "invalid directory '{raw}' (relative paths may not contain '..')"
        )));
    }
    Ok(if p.is_absolute() {
        p
    } else if raw == "." {
        base.to_path_buf()
    } else {
        base.join(p)
    })
}

/// Clean-slate precondition for an install directory: whatever a previous
/// run left at `dir` is deleted. The directory is not created; the wrapped
/// build system's install step does that.
pub fn prepare(install_root: &Path, dir: &Path) -> Result<()> {
    remove_dir_within(install_root, dir)
}

/// Removes `dir` if present. Refuses to touch anything that is not strictly
/// below `base`.
pub fn remove_dir_within(base: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let base_can = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if dir_can == base_can || !dir_can.starts_with(&base_can) {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not below '{}')",
            dir_can.display(),
            base_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

pub fn recreate_dir_within(base: &Path, dir: &Path) -> Result<()> {
    remove_dir_within(base, dir)?;
    fs::create_dir_all(dir)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", dir.display())))
}

/// Number of regular files below `dir`; 0 when it does not exist.
pub fn count_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}
