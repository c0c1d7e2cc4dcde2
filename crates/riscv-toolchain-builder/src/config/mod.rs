//! TOML configuration.
//!
//! A file may name a parent with `extends = "base.toml"` and pull fragments
//! in with `imports = ["repos.toml", ...]`. Tables merge recursively and the
//! including file wins. The merged document is then read into
//! [`BuilderConfig`] and resolved into [`Settings`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};
use crate::layout::{Layout, LayoutConfig};
use crate::progress::ToolchainFailurePolicy;
use crate::repos::{INFRA_REPO, ReposConfig};
use crate::stages::{LlvmConfig, LlvmSettings};

pub const ENV_INSTALL_ROOT: &str = "RVTB_INSTALL_ROOT";
pub const ENV_JOBS: &str = "RVTB_JOBS";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: Option<PathBuf>,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: None,
            value: Value::Table(Default::default()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            path: None,
            value: toml::from_str(text)?,
        })
    }

    pub fn builder_config(&self) -> Result<BuilderConfig> {
        self.value
            .clone()
            .try_into()
            .map_err(|e| Error::Config(format!("{}: {e}", self.describe())))
    }

    fn describe(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline config>".into())
    }
}

/// Overlays `child` onto `base`. Tables merge key by key; anything else in
/// `child` replaces what `base` had.
pub fn merge(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn relative_to(file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference.trim());
    if p.is_absolute() {
        p
    } else {
        file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn imports_of(path: &Path, tbl: &toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = tbl.get("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::Config(format!(
            "{}: imports must be an array of paths",
            path.display()
        )));
    };
    arr.iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                Error::Config(format!("{}: imports entries must be strings", path.display()))
            })
        })
        .filter(|s| s.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(true))
        .collect()
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(key.clone()) {
        return Err(Error::Config(format!(
            "config include cycle at {}",
            key.display()
        )));
    }

    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut own: Value = toml::from_str(&text)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

    let mut merged = Value::Table(Default::default());
    if let Value::Table(tbl) = &mut own {
        if let Some(parent) = tbl.remove("extends") {
            let Some(parent) = parent.as_str() else {
                return Err(Error::Config(format!(
                    "{}: extends must be a path",
                    path.display()
                )));
            };
            merged = load_value(&relative_to(path, parent), stack)?;
        }
        for imp in imports_of(path, tbl)? {
            let fragment = load_value(&relative_to(path, &imp), stack)?;
            merge(&mut merged, fragment);
        }
        tbl.remove("imports");
    }
    merge(&mut merged, own);

    stack.remove(&key);
    Ok(merged)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let value = load_value(path, &mut HashSet::new())?;
    Ok(ConfigDoc {
        path: Some(path.to_path_buf()),
        value,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Parallel jobs for make/ninja; 0 picks the CPU count.
    pub jobs: usize,
    pub on_toolchain_failure: ToolchainFailurePolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    pub layout: LayoutConfig,
    pub build: BuildConfig,
    pub repos: ReposConfig,
    pub llvm: LlvmConfig,
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub install_root: Option<String>,
    pub jobs: Option<usize>,
}

impl BuilderConfig {
    /// Applies `RVTB_*` variables read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = var(ENV_INSTALL_ROOT).filter(|v| !v.trim().is_empty()) {
            self.layout.install_root = root;
        }
        if let Some(raw) = var(ENV_JOBS).filter(|v| !v.trim().is_empty()) {
            self.build.jobs = raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_JOBS}='{raw}' is not a number")))?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(root) = &o.install_root {
            self.layout.install_root = root.clone();
        }
        if let Some(jobs) = o.jobs {
            self.build.jobs = jobs;
        }
    }

    /// Resolves relative directories against `base_dir`.
    pub fn resolve(&self, base_dir: &Path) -> Result<Settings> {
        let layout = Layout::resolve(base_dir, &self.layout)?;
        let jobs = match self.build.jobs {
            0 => num_cpus::get().max(1),
            n => n,
        };
        let install_dir = match self.llvm.install_dir.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => {
                let p = PathBuf::from(d);
                if p.is_absolute() { p } else { base_dir.join(p) }
            }
            _ => layout.source_dir(INFRA_REPO).join("install"),
        };
        Ok(Settings {
            layout,
            jobs,
            repos: self.repos.clone(),
            llvm: LlvmSettings {
                generator: self.llvm.generator,
                install_dir,
                c_compiler: self.llvm.c_compiler.clone(),
                cxx_compiler: self.llvm.cxx_compiler.clone(),
            },
            on_toolchain_failure: self.build.on_toolchain_failure,
        })
    }
}

/// Everything a run needs, with paths absolute and defaults filled in.
#[derive(Debug, Clone)]
pub struct Settings {
    pub layout: Layout,
    pub jobs: usize,
    pub repos: ReposConfig,
    pub llvm: LlvmSettings,
    pub on_toolchain_failure: ToolchainFailurePolicy,
}

impl Settings {
    /// Defaults rooted at `base_dir`; no config file involved.
    pub fn with_defaults(base_dir: &Path) -> Result<Self> {
        BuilderConfig::default().resolve(base_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::LlvmGenerator;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = ConfigDoc::empty().builder_config().unwrap();
        let s = cfg.resolve(Path::new("/work")).unwrap();
        assert_eq!(s.layout.install_root, PathBuf::from("/work/riscv_install"));
        assert_eq!(s.llvm.install_dir, PathBuf::from("/work/llvm-project/install"));
        assert_eq!(s.llvm.generator, LlvmGenerator::Ninja);
        assert!(s.jobs >= 1);
        assert_eq!(s.on_toolchain_failure, ToolchainFailurePolicy::SkipKernel);
    }

    #[test]
    fn extends_and_imports_merge_with_child_winning() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(
            tmp.path(),
            "base.toml",
            "[build]\njobs = 2\n[layout]\ninstall_root = \"base-install\"\n",
        );
        write(
            tmp.path(),
            "mirrors.toml",
            "[repos]\nriscv-pk = \"https://mirror.example/pk.git\"\n",
        );
        let top = write(
            tmp.path(),
            "site.toml",
            "extends = \"base.toml\"\nimports = [\"mirrors.toml\"]\n\
             [build]\njobs = 8\non_toolchain_failure = \"attempt-kernel\"\n",
        );

        let cfg = load(&top).unwrap().builder_config().unwrap();
        assert_eq!(cfg.build.jobs, 8);
        assert_eq!(cfg.build.on_toolchain_failure, ToolchainFailurePolicy::AttemptKernel);
        assert_eq!(cfg.layout.install_root, "base-install");
        assert_eq!(cfg.repos.riscv_pk, "https://mirror.example/pk.git");
        assert!(cfg.repos.riscv_isa_sim.ends_with("riscv-isa-sim"));
    }

    #[test]
    fn include_cycles_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write(tmp.path(), "a.toml", "extends = \"b.toml\"\n");
        let b = write(tmp.path(), "b.toml", "imports = [\"a.toml\"]\n");
        let err = load(&b).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn unknown_sections_are_config_errors() {
        let doc = ConfigDoc::parse("[toolchain]\nfoo = 1\n").unwrap();
        assert_eq!(doc.builder_config().unwrap_err().kind(), "config");
    }

    #[test]
    fn env_then_cli_precedence() {
        let mut cfg = ConfigDoc::parse("[build]\njobs = 3\n")
            .unwrap()
            .builder_config()
            .unwrap();
        cfg.apply_env(|k| match k {
            ENV_JOBS => Some("6".into()),
            ENV_INSTALL_ROOT => Some("/env/install".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.build.jobs, 6);
        assert_eq!(cfg.layout.install_root, "/env/install");

        cfg.apply_overrides(&Overrides {
            install_root: None,
            jobs: Some(12),
        });
        let s = cfg.resolve(Path::new("/work")).unwrap();
        assert_eq!(s.jobs, 12);
        assert_eq!(s.layout.install_root, PathBuf::from("/env/install"));
    }

    #[test]
    fn bad_jobs_env_is_reported() {
        let mut cfg = BuilderConfig::default();
        let err = cfg
            .apply_env(|k| (k == ENV_JOBS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_JOBS));
    }

    #[test]
    fn explicit_llvm_settings() {
        let cfg = ConfigDoc::parse(
            "[llvm]\ngenerator = \"make\"\ninstall_dir = \"/opt/llvm\"\ncxx_compiler = \"clang++\"\n",
        )
        .unwrap()
        .builder_config()
        .unwrap();
        let s = cfg.resolve(Path::new("/work")).unwrap();
        assert_eq!(s.llvm.generator, LlvmGenerator::Make);
        assert_eq!(s.llvm.install_dir, PathBuf::from("/opt/llvm"));
        assert_eq!(s.llvm.c_compiler, "gcc");
        assert_eq!(s.llvm.cxx_compiler, "clang++");
    }
}
