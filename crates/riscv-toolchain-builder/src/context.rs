//! Explicit per-stage execution context.
//!
//! Stages never change the process working directory or `PATH`. Each one is
//! handed a [`StageContext`] and derives narrower contexts from it; the
//! parent value is left untouched, so leaving a scope needs no cleanup.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directories prepended ahead of the `PATH` inherited at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    overlay: Vec<PathBuf>,
    inherited: OsString,
}

impl SearchPath {
    pub fn new(inherited: impl Into<OsString>) -> Self {
        Self {
            overlay: Vec::new(),
            inherited: inherited.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var_os("PATH").unwrap_or_default())
    }

    pub fn overlay(&self) -> &[PathBuf] {
        &self.overlay
    }

    pub fn inherited(&self) -> &OsString {
        &self.inherited
    }

    pub fn prepended(&self, dir: impl Into<PathBuf>) -> Self {
        let mut next = self.clone();
        next.overlay.insert(0, dir.into());
        next
    }

    /// Same inherited path, empty overlay.
    pub fn reset(&self) -> Self {
        Self::new(self.inherited.clone())
    }

    pub fn entries(&self) -> Vec<PathBuf> {
        self.overlay
            .iter()
            .cloned()
            .chain(std::env::split_paths(&self.inherited))
            .collect()
    }

    pub fn to_env(&self) -> Result<OsString> {
        std::env::join_paths(self.entries())
            .map_err(|e| Error::msg(format!("cannot build PATH from overlay: {e}")))
    }

    /// Resolves a bare program name the way a shell would.
    pub fn lookup(&self, program: &str) -> Option<PathBuf> {
        if program.contains(std::path::MAIN_SEPARATOR) {
            let p = PathBuf::from(program);
            return p.is_file().then_some(p);
        }
        self.entries()
            .into_iter()
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContext {
    working_dir: PathBuf,
    search_path: SearchPath,
}

impl StageContext {
    pub fn new(working_dir: impl Into<PathBuf>, search_path: SearchPath) -> Self {
        Self {
            working_dir: working_dir.into(),
            search_path,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn search_path(&self) -> &SearchPath {
        &self.search_path
    }

    pub fn in_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: dir.into(),
            search_path: self.search_path.clone(),
        }
    }

    pub fn with_bin(&self, bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: self.working_dir.clone(),
            search_path: self.search_path.prepended(bin_dir),
        }
    }

    pub fn with_fresh_overlay(&self) -> Self {
        Self {
            working_dir: self.working_dir.clone(),
            search_path: self.search_path.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_contexts_leave_parent_alone() {
        let base = StageContext::new("/work", SearchPath::new("/usr/bin:/bin"));
        let child = base.in_dir("/work/riscv-pk/build").with_bin("/inst/elf/bin");

        assert_eq!(base.working_dir(), Path::new("/work"));
        assert!(base.search_path().overlay().is_empty());
        assert_eq!(child.working_dir(), Path::new("/work/riscv-pk/build"));
        assert_eq!(
            child.search_path().entries(),
            vec![
                PathBuf::from("/inst/elf/bin"),
                PathBuf::from("/usr/bin"),
                PathBuf::from("/bin")
            ]
        );
    }

    #[test]
    fn newest_overlay_entry_wins() {
        let sp = SearchPath::new("/usr/bin")
            .prepended("/a/bin")
            .prepended("/b/bin");
        assert_eq!(sp.overlay()[0], PathBuf::from("/b/bin"));
        assert!(sp.reset().overlay().is_empty());
        assert_eq!(sp.reset().inherited(), &OsString::from("/usr/bin"));
    }

    #[test]
    fn lookup_scans_overlay_first() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let overlay = tmp.path().join("overlay");
        let system = tmp.path().join("system");
        std::fs::create_dir_all(&overlay).unwrap();
        std::fs::create_dir_all(&system).unwrap();
        std::fs::write(overlay.join("gcc"), "").unwrap();
        std::fs::write(system.join("gcc"), "").unwrap();
        std::fs::write(system.join("g++"), "").unwrap();

        let sp = SearchPath::new(system.as_os_str().to_owned()).prepended(&overlay);
        assert_eq!(sp.lookup("gcc"), Some(overlay.join("gcc")));
        assert_eq!(sp.lookup("g++"), Some(system.join("g++")));
        assert_eq!(sp.lookup("clang"), None);
    }
}
