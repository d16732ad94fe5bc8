use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ulid::Ulid;

use buildwarden::authority::{AuthorityEngine, MemoryHashChain, Role};
use buildwarden::config::EngineConfig;
use buildwarden::ledger::{format_integrity, AuthorityLedger, LedgerConfig};
use buildwarden::metrics::format_stats;
use buildwarden::orchestrator::{BuildOrchestrator, BuildOutcome};
use buildwarden::parallel::{AgentNode, DependencyGraphBuilder, DryRunExecutor};

#[derive(Debug, Parser)]
#[command(name = "buildwarden", version)]
#[command(about = "Dependency-aware parallel build execution behind a ledgered authorization gate")]
struct Cli {
    /// Engine configuration file (TOML). Environment overrides use BUILDWARDEN__SECTION__KEY.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve a plan file and print the execution plan as JSON.
    Plan(PlanArgs),
    /// Run a plan with the dry-run agent executor.
    Run(RunArgs),
    /// Inspect a file-backed ledger.
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Print the effective engine configuration as TOML.
    Config,
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// JSON file containing a list of agent nodes.
    file: PathBuf,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// JSON file containing a list of agent nodes.
    file: PathBuf,
    #[arg(long)]
    max_concurrency: Option<usize>,
    /// Retries per task after the first failed attempt.
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    circuit_breaker_threshold: Option<u32>,
    /// Directory for the JSON-lines ledger. Falls back to BUILDWARDEN_LEDGER_DIR.
    #[arg(long)]
    ledger_dir: Option<PathBuf>,
    /// Defaults to a fresh ULID.
    #[arg(long)]
    build_id: Option<String>,
    #[arg(long, default_value = "cli")]
    actor: String,
    #[arg(long, default_value = "operator")]
    role: String,
}

#[derive(Debug, Subcommand)]
enum LedgerCommands {
    /// List builds with ledger files.
    List(LedgerDirArgs),
    /// Print a build's export bundle as JSON.
    Show(LedgerBuildArgs),
    /// Check sequence contiguity; exits non-zero on gaps.
    Verify(LedgerBuildArgs),
}

#[derive(Debug, Args)]
struct LedgerDirArgs {
    #[arg(long)]
    ledger_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct LedgerBuildArgs {
    build_id: String,
    #[arg(long)]
    ledger_dir: Option<PathBuf>,
    /// Only entries after this sequence.
    #[arg(long)]
    since: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("buildwarden=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Plan(args) => cmd_plan(&args),
        Commands::Run(args) => cmd_run(config, args).await,
        Commands::Ledger { command } => cmd_ledger(&config, command),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config).context("rendering configuration")?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_plan(path: &Path) -> Result<Vec<AgentNode>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading plan {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing plan {}", path.display()))
}

fn cmd_plan(args: &PlanArgs) -> Result<ExitCode> {
    let graph = DependencyGraphBuilder::new()
        .build(read_plan(&args.file)?)
        .context("resolving plan")?;
    println!("{}", serde_json::to_string_pretty(&graph)?);
    Ok(ExitCode::SUCCESS)
}

/// CLI flag, then configuration, then `BUILDWARDEN_LEDGER_DIR`.
fn ledger_config(config: &EngineConfig, flag: Option<PathBuf>) -> LedgerConfig {
    let mut ledger = config.ledger.clone();
    if flag.is_some() {
        ledger.dir = flag;
    }
    ledger.or_dir(LedgerConfig::from_env().dir)
}

async fn cmd_run(mut config: EngineConfig, args: RunArgs) -> Result<ExitCode> {
    if let Some(max_concurrency) = args.max_concurrency {
        if max_concurrency == 0 {
            bail!("--max-concurrency must be at least 1");
        }
        config.executor.max_concurrency = max_concurrency;
    }
    if let Some(max_retries) = args.max_retries {
        config.executor.retry.max_retries = max_retries;
    }
    if let Some(threshold) = args.circuit_breaker_threshold {
        config.circuit.failure_threshold = threshold.max(1);
    }
    let role: Role = args.role.parse().map_err(|err: String| anyhow!(err))?;
    let nodes = read_plan(&args.file)?;
    let build_id = args.build_id.unwrap_or_else(|| Ulid::new().to_string());

    let ledger = AuthorityLedger::from_config(&ledger_config(&config, args.ledger_dir)).context("opening ledger")?;
    let authority = AuthorityEngine::new(Arc::new(ledger), config.authority.clone())
        .with_chain(Arc::new(MemoryHashChain::new()));
    let orchestrator = BuildOrchestrator::new(config, Arc::new(authority), Arc::new(DryRunExecutor::new()));

    let outcome = orchestrator.run_build(&build_id, nodes, &args.actor, role).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match &outcome {
        BuildOutcome::Denied(denial) => {
            eprintln!("build {build_id} denied: {}", denial.reason());
            for remedy in &denial.remedies {
                eprintln!("  remedy: {remedy}");
            }
        }
        BuildOutcome::Completed(run) | BuildOutcome::Failed(run) => {
            eprint!("{}", format_stats(&run.report.stats));
        }
    }
    orchestrator.finish_build(&build_id)?;

    Ok(if outcome.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_ledger(config: &EngineConfig, command: LedgerCommands) -> Result<ExitCode> {
    let open = |flag: Option<PathBuf>| -> Result<AuthorityLedger> {
        let ledger_config = ledger_config(config, flag);
        if ledger_config.dir.is_none() {
            bail!("no ledger directory: pass --ledger-dir or set BUILDWARDEN_LEDGER_DIR");
        }
        AuthorityLedger::from_config(&ledger_config).context("opening ledger")
    };

    match command {
        LedgerCommands::List(args) => {
            for build_id in open(args.ledger_dir)?.builds()? {
                println!("{build_id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        LedgerCommands::Show(args) => {
            let ledger = open(args.ledger_dir)?;
            match args.since {
                Some(since) => {
                    let entries = ledger.entries_since(&args.build_id, since)?;
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                }
                None => {
                    let export = ledger.export_build(&args.build_id)?;
                    println!("{}", serde_json::to_string_pretty(&export)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        LedgerCommands::Verify(args) => {
            let report = open(args.ledger_dir)?.verify_integrity(&args.build_id)?;
            print!("{}", format_integrity(&report));
            Ok(if report.is_valid() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
