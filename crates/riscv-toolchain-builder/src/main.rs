use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use riscv_toolchain_builder::config::{self, ConfigDoc, Overrides, Settings};
use riscv_toolchain_builder::exec::{SystemRunner, TracingSink};
use riscv_toolchain_builder::orchestrator::{Orchestrator, planned_stages};
use riscv_toolchain_builder::plan::{self, ExecutionPlan, FixedPrompter, Prompter, StdioPrompter};
use riscv_toolchain_builder::submodules::{TOOLCHAIN_SUBMODULES, render_manifest};
use riscv_toolchain_builder::{Result, telemetry};

#[derive(Debug, Parser)]
#[command(author, version, about = "Builds RISC-V GNU toolchains, pk, spike and LLVM")]
struct Args {
    /// Emit newline-delimited JSON logs
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, ClapArgs)]
struct PlanArgs {
    /// Targets: auto | all | any of elf, elf-rvv, linux, llvm (none = menu)
    targets: Vec<String>,
    /// Answer every re-clone question with yes
    #[arg(long, short = 'y')]
    yes: bool,
    /// Build from the existing source trees; never clone or rewrite
    #[arg(long)]
    no_fetch: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve targets and build them
    Run {
        #[command(flatten)]
        plan: PlanArgs,
        /// Build configuration TOML
        #[arg(long)]
        config: Option<PathBuf>,
        /// Root directory for the per-variant installs
        #[arg(long)]
        install_root: Option<String>,
        /// Parallel jobs for make/ninja (0 = CPU count)
        #[arg(long)]
        jobs: Option<usize>,
        /// Log every command and deletion without performing it
        #[arg(long)]
        dry_run: bool,
        /// Write a JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Resolve targets and print the stages that would run
    Plan {
        #[command(flatten)]
        plan: PlanArgs,
    },
    /// Print the fully-resolved configuration TOML (after imports/extends)
    Resolve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the submodule manifest written into riscv-gnu-toolchain
    Manifest,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    telemetry::init_tracing(args.json, tracing::Level::INFO);

    let res = match args.cmd {
        Command::Run {
            plan,
            config,
            install_root,
            jobs,
            dry_run,
            report,
        } => cmd_run(
            &plan,
            config.as_deref(),
            Overrides { install_root, jobs },
            dry_run,
            report.as_deref(),
        ),
        Command::Plan { plan } => cmd_plan(&plan).map(|_| ExitCode::SUCCESS),
        Command::Resolve { config } => cmd_resolve(config.as_deref()).map(|_| ExitCode::SUCCESS),
        Command::Manifest => {
            print!("{}", render_manifest(TOOLCHAIN_SUBMODULES));
            Ok(ExitCode::SUCCESS)
        }
    };

    match res {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(kind = e.kind(), "{e}");
            ExitCode::FAILURE
        }
    }
}

fn resolve_plan(args: &PlanArgs) -> Result<ExecutionPlan> {
    let mut prompter: Box<dyn Prompter> = if args.yes {
        Box::new(FixedPrompter("y".into()))
    } else {
        Box::new(StdioPrompter::new(std::io::stdin().lock(), std::io::stdout()))
    };
    let plan = plan::resolve(&args.targets, prompter.as_mut())?;
    Ok(if args.no_fetch { plan.without_fetch() } else { plan })
}

fn load_doc(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => config::load(p),
        None => Ok(ConfigDoc::empty()),
    }
}

fn load_settings(path: Option<&Path>, overrides: &Overrides) -> Result<Settings> {
    let mut cfg = load_doc(path)?.builder_config()?;
    cfg.apply_env(|k| std::env::var(k).ok())?;
    cfg.apply_overrides(overrides);
    cfg.resolve(&std::env::current_dir()?)
}

fn cmd_plan(args: &PlanArgs) -> Result<()> {
    let plan = resolve_plan(args)?;
    let stages = planned_stages(&plan);
    if stages.is_empty() {
        println!("nothing to build");
        return Ok(());
    }
    for (i, id) in stages.iter().enumerate() {
        println!("{:>2}. {id}", i + 1);
    }
    Ok(())
}

fn cmd_resolve(path: Option<&Path>) -> Result<()> {
    let doc = load_doc(path)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_run(
    args: &PlanArgs,
    config: Option<&Path>,
    overrides: Overrides,
    dry_run: bool,
    report_path: Option<&Path>,
) -> Result<ExitCode> {
    let settings = load_settings(config, &overrides)?;
    let plan = resolve_plan(args)?;
    tracing::info!(
        variants = ?plan.variants,
        infra = plan.infra,
        fetch = plan.fetch,
        rewrite = plan.rewrite,
        jobs = settings.jobs,
        "resolved plan"
    );

    let sink = Arc::new(TracingSink::new(&settings.layout.logs_dir));
    let orchestrator = Orchestrator::new(settings, Arc::new(SystemRunner), sink).dry_run(dry_run);
    let report = orchestrator.run(&plan);

    print!("{}", report.summary());
    if let Some(path) = report_path {
        report.write_json(path)?;
        tracing::info!(report = %path.display(), "run report written");
    }
    Ok(if report.ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
