use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariantId {
    Elf,
    ElfRvv,
    Linux,
}

impl VariantId {
    pub const ALL: [VariantId; 3] = [VariantId::Elf, VariantId::ElfRvv, VariantId::Linux];

    pub fn as_str(self) -> &'static str {
        match self {
            VariantId::Elf => "elf",
            VariantId::ElfRvv => "elf-rvv",
            VariantId::Linux => "linux",
        }
    }

    pub fn profile(self) -> &'static VariantProfile {
        match self {
            VariantId::Elf => &PROFILES[0],
            VariantId::ElfRvv => &PROFILES[1],
            VariantId::Linux => &PROFILES[2],
        }
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VariantId::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| Error::msg(format!("unknown variant '{s}'")))
    }
}

/// Build parameters for one variant.
#[derive(Debug, PartialEq, Eq)]
pub struct VariantProfile {
    pub id: VariantId,
    /// Branch checked out in the toolchain's `riscv-gcc` submodule.
    pub gcc_branch: &'static str,
    /// Extra toolchain configure flags, before `--prefix`.
    pub configure_flags: &'static [&'static str],
    /// `None` builds make's default goal.
    pub make_target: Option<&'static str>,
    pub host_triple: &'static str,
}

static PROFILES: [VariantProfile; 3] = [
    VariantProfile {
        id: VariantId::Elf,
        gcc_branch: "riscv-gcc-12.1.0",
        configure_flags: &[],
        make_target: None,
        host_triple: "riscv64-unknown-elf",
    },
    VariantProfile {
        id: VariantId::ElfRvv,
        gcc_branch: "riscv-gcc-rvv-next",
        configure_flags: &["--with-arch=rv64gcv", "--with-abi=lp64d"],
        make_target: None,
        host_triple: "riscv64-unknown-elf",
    },
    VariantProfile {
        id: VariantId::Linux,
        gcc_branch: "riscv-gcc-12.1.0",
        configure_flags: &[],
        make_target: Some("linux"),
        host_triple: "riscv64-unknown-linux-gnu",
    },
];

impl VariantProfile {
    pub fn cross_compiler(&self) -> String {
        format!("{}-gcc", self.host_triple)
    }

    pub fn toolchain_configure_args(&self, prefix: &Path) -> Vec<String> {
        let mut args: Vec<String> = self.configure_flags.iter().map(|f| f.to_string()).collect();
        args.push(prefix_arg(prefix));
        args
    }

    pub fn toolchain_make_args(&self, jobs: usize) -> Vec<String> {
        let mut args = Vec::with_capacity(2);
        if let Some(t) = self.make_target {
            args.push(t.to_string());
        }
        args.push(format!("-j{jobs}"));
        args
    }

    pub fn kernel_configure_args(&self, prefix: &Path) -> Vec<String> {
        vec![
            format!("--host={}", self.host_triple),
            format!("CC={}", self.cross_compiler()),
            prefix_arg(prefix),
        ]
    }
}

pub fn prefix_arg(prefix: &Path) -> String {
    format!("--prefix={}", prefix.display())
}
