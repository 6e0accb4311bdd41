use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use stepwise_engine::{
    CachedSource, DriverControl, DriverEvent, DriverStatus, Engine, EngineConfig, ErrorPolicy, PipelineDriver, PipelineError,
    ResolverRegistry, Step, UnknownKindPolicy, builtin_resolvers, check::is_clean, check_definition, parse_pipeline_file,
};
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, info, warn};

/// Run and check continuation-passing pipeline definitions.
#[derive(Parser, Debug)]
#[command(name = "stepwise", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline file and print its final value as JSON
    Run(RunArgs),
    /// Validate a pipeline file without running any handler
    Check {
        /// Path to a YAML or JSON pipeline file
        file: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to a YAML or JSON pipeline file
    file: PathBuf,

    /// JSON value handed to the first step, overriding the file's seed
    #[arg(long)]
    seed: Option<String>,

    /// Print the result on a single line
    #[arg(long)]
    compact: bool,

    /// Give up after this many re-runs
    #[arg(long, default_value_t = 64)]
    max_runs: u64,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Engine config file (defaults to STEPWISE_CONFIG_PATH or the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum nesting of dependency sub-pipelines
    #[arg(long)]
    max_depth: Option<usize>,

    /// Forward `previous` through steps whose kind has no resolver
    #[arg(long)]
    passthrough_unknown: bool,

    /// Merge dependency failures as error markers instead of aborting
    #[arg(long)]
    isolate_errors: bool,

    /// Per-request timeout for fetches, in seconds
    #[arg(long)]
    timeout_sec: Option<u64>,
}

impl EngineArgs {
    fn load_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load_from(path)?,
            None => EngineConfig::load()?,
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut EngineConfig) {
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if self.passthrough_unknown {
            config.unknown_kind = UnknownKindPolicy::Passthrough;
        }
        if self.isolate_errors {
            config.error_policy = ErrorPolicy::Isolate;
        }
        if let Some(timeout_sec) = self.timeout_sec {
            config.cache.request_timeout_sec = timeout_sec;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    match Cli::parse().command {
        Command::Run(args) => run_pipeline(args).await,
        Command::Check { file, engine } => check_pipeline(&file, &engine),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_definition(file: &Path) -> Result<(Vec<Step>, Value)> {
    let document = parse_pipeline_file(file)?;
    let definition = document
        .definition
        .ok_or_else(|| PipelineError::configuration("definition"))
        .with_context(|| format!("{} has no definition", file.display()))?;
    Ok((definition, document.seed))
}

fn parse_seed(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--seed is not valid JSON: {raw}"))
}

async fn run_pipeline(args: RunArgs) -> Result<()> {
    let config = args.engine.load_config()?;
    let (definition, file_seed) = load_definition(&args.file)?;
    let seed = match args.seed.as_deref() {
        Some(raw) => parse_seed(raw)?,
        None => file_seed,
    };

    let source = CachedSource::http(config.cache.clone(), Handle::current())?;
    let engine = Arc::new(Engine::new(builtin_resolvers(), config).with_source(source));
    info!(file = %args.file.display(), steps = definition.len(), "running pipeline file");

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let driver = PipelineDriver::new(engine, definition)
        .with_seed(seed)
        .with_max_runs(args.max_runs);
    let handle = tokio::spawn(driver.drive(control_rx, event_tx));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = control_tx.send(DriverControl::Cancel);
        }
    });

    let mut rendered = None;
    let mut failure = None;
    while let Some(event) = event_rx.recv().await {
        match event {
            DriverEvent::RunStarted { generation, .. } => debug!(generation, "run started"),
            DriverEvent::Suspended { generation, awaiting, .. } => {
                info!(generation, awaiting = ?awaiting, "waiting on async source")
            }
            DriverEvent::Rendered { value, .. } => rendered = Some(value),
            DriverEvent::Failed { error, .. } => failure = Some(error),
            DriverEvent::StaleDiscarded { generation, key } => debug!(generation, key = %key, "stale settlement ignored"),
            DriverEvent::Finished { .. } => break,
        }
    }

    match handle.await.context("pipeline driver task failed")? {
        DriverStatus::Completed => {
            let value = rendered.unwrap_or(Value::Null);
            let output = if args.compact {
                serde_json::to_string(&value)?
            } else {
                serde_json::to_string_pretty(&value)?
            };
            println!("{output}");
            Ok(())
        }
        DriverStatus::Canceled => {
            warn!("pipeline canceled");
            bail!("pipeline canceled")
        }
        DriverStatus::Failed => bail!("pipeline failed: {}", failure.unwrap_or_else(|| "no result".into())),
    }
}

fn check_pipeline(file: &Path, engine: &EngineArgs) -> Result<()> {
    let config = engine.load_config()?;
    let (definition, _) = load_definition(file)?;
    let registry = ResolverRegistry::new(builtin_resolvers()).with_unknown_kind(config.unknown_kind);

    let issues = check_definition(&definition, &registry, config.max_depth);
    for issue in &issues {
        println!("{issue}");
    }
    if !is_clean(&issues) {
        bail!("{} has problems", file.display());
    }
    println!("{}: ok ({} steps)", file.display(), definition.len());
    Ok(())
}
