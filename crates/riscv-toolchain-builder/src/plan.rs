//! Turns command-line tokens (or interactive answers) into an
//! [`ExecutionPlan`]. The orchestrator only ever sees the plan.

use std::io::{BufRead, Write};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::profile::VariantId;

pub const INFRA_TOKEN: &str = "llvm";
pub const AUTO_TOKEN: &str = "auto";
pub const ALL_TOKEN: &str = "all";

const REFETCH_RISCV_PROMPT: &str =
    "Re-clone riscv-gnu-toolchain, riscv-isa-sim (spike), riscv-pk? (y/[N]) >>> ";
const REFETCH_INFRA_PROMPT: &str = "Re-clone llvm-project repo? (y/[N]) >>> ";
const REWRITE_PROMPT: &str = "Update the submodules in riscv-gnu-toolchain? (y/[N]) >>> ";
const MENU_PROMPT: &str = "Choose the building targets: (1/2/3/4)
1. riscv64-linux-unknown-gnu, spike and pk
2. riscv64-unknown-elf, spike and pk
3. riscv64-unknown-elf with rvv, spike and pk
4. LLVM latest

>>> ";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// RISC-V variants, in build order, without duplicates.
    pub variants: Vec<VariantId>,
    /// Build the compiler-infrastructure (LLVM) track.
    pub infra: bool,
    /// Re-clone the RISC-V repositories before building.
    pub fetch: bool,
    /// Rewrite the toolchain's submodule manifest before building.
    pub rewrite: bool,
    /// Re-clone llvm-project before the infra build.
    pub fetch_infra: bool,
}

impl ExecutionPlan {
    /// Everything, re-fetched from scratch.
    pub fn everything() -> Self {
        Self {
            variants: VariantId::ALL.to_vec(),
            infra: true,
            fetch: true,
            rewrite: true,
            fetch_infra: true,
        }
    }

    /// Nothing to build and no fetch or rewrite asked for on its own.
    pub fn is_noop(&self) -> bool {
        self.variants.is_empty() && !self.infra && !self.fetch && !self.rewrite
    }

    /// Whether the shared RISC-V trees are fetched, rewritten or needed.
    pub fn touches_sources(&self) -> bool {
        self.fetch || self.rewrite || !self.variants.is_empty()
    }

    pub fn without_fetch(mut self) -> Self {
        self.fetch = false;
        self.rewrite = false;
        self.fetch_infra = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Variant(VariantId),
    Infra,
}

impl Target {
    pub fn parse(token: &str) -> Option<Self> {
        if token == INFRA_TOKEN {
            return Some(Target::Infra);
        }
        token.parse::<VariantId>().ok().map(Target::Variant)
    }
}

/// Known targets in the order given. Unknown tokens are dropped silently and
/// repeats collapse onto their first occurrence.
pub fn filter_targets<S: AsRef<str>>(tokens: &[S]) -> Vec<Target> {
    let mut out: Vec<Target> = Vec::new();
    for t in tokens.iter().filter_map(|t| Target::parse(t.as_ref().trim())) {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

pub trait Prompter {
    fn ask(&mut self, question: &str) -> Result<String>;

    fn confirm(&mut self, question: &str) -> Result<bool> {
        let answer = self.ask(question)?;
        Ok(matches!(answer.trim(), "y" | "Y"))
    }
}

/// Reads answers from a terminal.
pub struct StdioPrompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> StdioPrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Prompter for StdioPrompter<R, W> {
    fn ask(&mut self, question: &str) -> Result<String> {
        self.output.write_all(question.as_bytes())?;
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

/// Gives the same answer to every question (`--yes`, or tests).
pub struct FixedPrompter(pub String);

impl Prompter for FixedPrompter {
    fn ask(&mut self, _question: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Answers from a script, in order; running out is an error.
pub struct ScriptedPrompter {
    answers: std::collections::VecDeque<String>,
    pub asked: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str) -> Result<String> {
        self.asked.push(question.to_string());
        self.answers
            .pop_front()
            .ok_or_else(|| Error::msg(format!("no scripted answer for: {}", question.trim())))
    }
}

/// Resolves the command-line tokens into a plan, asking `prompter` whatever
/// the tokens leave open.
pub fn resolve<S: AsRef<str>>(tokens: &[S], prompter: &mut dyn Prompter) -> Result<ExecutionPlan> {
    if let [only] = tokens {
        if only.as_ref() == AUTO_TOKEN {
            return Ok(ExecutionPlan::everything());
        }
    }

    let targets = match tokens {
        [only] if only.as_ref() == ALL_TOKEN => {
            let mut all: Vec<Target> = VariantId::ALL.into_iter().map(Target::Variant).collect();
            all.push(Target::Infra);
            all
        }
        _ => filter_targets(tokens),
    };

    if targets.is_empty() {
        return resolve_interactive(prompter);
    }

    let mut plan = ExecutionPlan::default();
    for t in targets {
        match t {
            Target::Variant(v) => plan.variants.push(v),
            Target::Infra => plan.infra = true,
        }
    }
    if plan.infra {
        plan.fetch_infra = prompter.confirm(REFETCH_INFRA_PROMPT)?;
    }
    if !plan.variants.is_empty() {
        // A fresh clone always carries upstream submodule URLs, so re-fetching
        // implies rewriting.
        plan.fetch = prompter.confirm(REFETCH_RISCV_PROMPT)?;
        plan.rewrite = plan.fetch;
    }
    Ok(plan)
}

fn resolve_interactive(prompter: &mut dyn Prompter) -> Result<ExecutionPlan> {
    let choice = prompter.ask(MENU_PROMPT)?;
    let variant = match choice.trim() {
        "1" => VariantId::Linux,
        "2" => VariantId::Elf,
        "3" => VariantId::ElfRvv,
        "4" => {
            return Ok(ExecutionPlan {
                infra: true,
                fetch_infra: prompter.confirm(REFETCH_INFRA_PROMPT)?,
                ..ExecutionPlan::default()
            });
        }
        other => return Err(Error::PlanResolution(other.to_string())),
    };
    let fetch = prompter.confirm(REFETCH_RISCV_PROMPT)?;
    let rewrite = prompter.confirm(REWRITE_PROMPT)?;
    Ok(ExecutionPlan {
        variants: vec![variant],
        fetch,
        rewrite,
        ..ExecutionPlan::default()
    })
}
