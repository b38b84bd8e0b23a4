//! Curation Engine CLI
//!
//! Loads a rule catalog, resolves the requested rules and runs them, lists
//! their generated queries, or checks the catalog without running anything.
//!
//! Exit status: 0 when every rule completed, 1 when a rule failed or the run
//! was cancelled, 2 on configuration errors.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use console::style;
use curation_core::{Coordinates, DataStage, RuleId};
use curation_runtime::{
    CatalogFile, EngineConfig, EngineController, MemoryWarehouse, Report, RuleQueries, RunStatus,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "warn,curation_runtime=info,curation_cli=info";

#[derive(Parser)]
#[command(name = "curation")]
#[command(about = "Run cleaning rules against a warehouse dataset", long_about = None)]
struct Cli {
    #[command(flatten)]
    logging: LogOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LogOptions {
    /// Log file, appended to
    #[arg(long, global = true, default_value = "cleaning_rules.log")]
    log_file: PathBuf,
    /// Also log to stderr
    #[arg(long, global = true)]
    console_log: bool,
    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    json_log: bool,
}

#[derive(Args)]
struct Target {
    /// Rule catalog (TOML)
    #[arg(short, long)]
    catalog: PathBuf,
    /// Warehouse project
    #[arg(short, long)]
    project: String,
    /// Dataset to clean
    #[arg(short, long)]
    dataset: String,
    /// Sandbox dataset, defaults to `<dataset>_sandbox`
    #[arg(short, long)]
    sandbox_dataset: Option<String>,
    /// Data stage of the dataset
    #[arg(long)]
    stage: Option<DataStage>,
    /// Rules to run, with their dependencies; all when omitted
    #[arg(short, long = "rule")]
    rules: Vec<RuleId>,
    /// Engine configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct Overrides {
    /// Rules running at once
    #[arg(long)]
    max_parallel: Option<usize>,
    /// Resubmissions per statement after a transient failure
    #[arg(long)]
    max_retries: Option<u32>,
    /// Cancel the run after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run rules
    Run {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        overrides: Overrides,
        /// Write the JSON report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the queries each rule would submit
    ListQueries {
        #[command(flatten)]
        target: Target,
    },
    /// Load the catalog and print the execution order
    Check {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(&cli.logging)?;

    let code = match cli.command {
        Commands::Run {
            target,
            overrides,
            report,
        } => run(&target, &overrides, report.as_deref()).await,
        Commands::ListQueries { target } => list_queries(&target),
        Commands::Check { target } => check(&target),
    };
    Ok(code)
}

fn init_logging(opts: &LogOptions) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&opts.log_file)
        .wrap_err_with(|| format!("cannot open log file {}", opts.log_file.display()))?;
    let writer = Mutex::new(file);

    let file_layer = if opts.json_log {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_ansi(false).with_writer(writer).boxed()
    };
    let console_layer = opts
        .console_log
        .then(|| fmt::layer().compact().with_target(false).with_writer(std::io::stderr));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .wrap_err("cannot install log subscriber")
}

fn load_config(path: Option<&Path>, overrides: Option<&Overrides>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::new(),
    };
    if let Some(overrides) = overrides {
        if let Some(n) = overrides.max_parallel {
            config = config.with_max_parallel_rules(n);
        }
        if let Some(n) = overrides.max_retries {
            config.retry = config.retry.with_max_retries(n);
        }
        if let Some(secs) = overrides.timeout_secs {
            config = config.with_run_timeout(Some(Duration::from_secs(secs)));
        }
    }
    Ok(config)
}

fn coordinates(target: &Target) -> Result<Coordinates> {
    let sandbox = target
        .sandbox_dataset
        .clone()
        .unwrap_or_else(|| format!("{}_sandbox", target.dataset));
    let coords = Coordinates::new(&target.project, &target.dataset, sandbox)?;
    Ok(match target.stage {
        Some(stage) => coords.with_stage(stage),
        None => coords,
    })
}

fn prepare(target: &Target, overrides: Option<&Overrides>) -> Result<(EngineController, Coordinates)> {
    let catalog = CatalogFile::load(&target.catalog)
        .and_then(CatalogFile::into_catalog)
        .wrap_err_with(|| format!("cannot load catalog {}", target.catalog.display()))?;
    let config = load_config(target.config.as_deref(), overrides)?;
    let coords = coordinates(target)?;
    let engine = EngineController::new(catalog, Arc::new(MemoryWarehouse::new()), config)?;
    Ok((engine, coords))
}

fn config_error(err: &color_eyre::Report) -> ExitCode {
    eprintln!("{} {err:#}", style("configuration error:").red().bold());
    ExitCode::from(2)
}

async fn run(target: &Target, overrides: &Overrides, report_path: Option<&Path>) -> ExitCode {
    let (engine, coords) = match prepare(target, Some(overrides)) {
        Ok(prepared) => prepared,
        Err(err) => return config_error(&err),
    };

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            token.cancel();
        }
    });

    let report = match engine.execute(&target.rules, &coords).await {
        Ok(report) => report,
        Err(err) => return config_error(&err.into()),
    };

    if let Some(path) = report_path {
        if let Err(err) = write_report(&report, path) {
            eprintln!("{} {err:#}", style("warning:").yellow());
        } else {
            info!(path = %path.display(), "report written");
        }
    }
    print_report(&report);

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn write_report(report: &Report, path: &Path) -> Result<()> {
    let json = report.to_json()?;
    std::fs::write(path, json).wrap_err_with(|| format!("cannot write report {}", path.display()))
}

fn print_report(report: &Report) {
    let headline = match report.status {
        RunStatus::Succeeded => style("SUCCEEDED").green().bold(),
        RunStatus::Failed => style("FAILED").red().bold(),
        RunStatus::Cancelled { .. } => style("CANCELLED").yellow().bold(),
    };
    println!("{headline}");
    println!("{}", report.summary());
}

fn list_queries(target: &Target) -> ExitCode {
    let listing = match prepare(target, None)
        .and_then(|(engine, coords)| Ok(engine.list_queries(&target.rules, &coords)?))
    {
        Ok(listing) => listing,
        Err(err) => return config_error(&err),
    };

    let mut failed = false;
    for entry in &listing {
        failed |= entry.queries.is_err();
        print_rule_queries(entry);
    }
    if failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn print_rule_queries(entry: &RuleQueries) {
    let tags = if entry.identifiers.is_empty() {
        String::new()
    } else {
        format!(" [{}]", entry.identifiers.join(", "))
    };
    let applicability = if entry.applicable {
        String::new()
    } else {
        format!(" {}", style("(not applicable to this stage)").dim())
    };
    println!("{}{tags}{applicability}", style(&entry.rule).bold());

    match &entry.queries {
        Ok(queries) => {
            for (i, query) in queries.iter().enumerate() {
                let target = query
                    .destination
                    .as_ref()
                    .map(|d| format!(" -> {d} ({})", query.write_mode))
                    .unwrap_or_default();
                let mode = if query.is_blocking { "blocking" } else { "parallel" };
                println!("  {} {mode}{target}", style(format!("[{i}]")).cyan());
                println!("      {}", query.text);
            }
        }
        Err(failure) => println!("  {} {failure}", style("error:").red()),
    }
}

fn check(target: &Target) -> ExitCode {
    let order = match prepare(target, None)
        .and_then(|(engine, _)| Ok(engine.resolve(&target.rules)?))
    {
        Ok(order) => order,
        Err(err) => return config_error(&err),
    };

    println!("{} {} rule(s)", style("ok").green().bold(), order.len());
    for (i, rule) in order.iter().enumerate() {
        let deps = order.graph().dependencies(&rule.id);
        let after = if deps.is_empty() {
            String::new()
        } else {
            format!(
                " after {}",
                deps.iter().map(RuleId::as_str).collect::<Vec<_>>().join(", ")
            )
        };
        println!("  {:>3}. {}{after}", i + 1, rule.label());
    }
    ExitCode::SUCCESS
}
