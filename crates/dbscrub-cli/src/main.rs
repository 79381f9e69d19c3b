mod parallel;
mod registry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use dbscrub_core::{
    DEFAULT_OLDER_THAN_DAYS, Error as CoreError, ModelRegistry, Settings, parse_model_label,
    redact_database_url,
};
use dbscrub_engine::{ScrubError, ScrubOptions, ScrubOutcome, ScrubRunner};
use dbscrub_introspect::{IntrospectOptions, load_models_with_options};
use parallel::{ChildInvocation, discover_models, run_jobs, scrub_args, trim_args};
use registry::{LogFormat, RunContext, RunPaths, init_logging, start_run, write_report};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
enum CliError {
    #[error("registry error: {0}")]
    Registry(#[from] registry::RegistryError),
    #[error("core error: {0}")]
    Core(#[from] CoreError),
    #[error(transparent)]
    Scrub(#[from] ScrubError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid model list pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("model discovery failed: {0}")]
    Discovery(String),
}

#[derive(Parser, Debug)]
#[command(
    name = "dbscrub",
    version,
    about = "Scrub and trim PostgreSQL databases for non-production use"
)]
struct Cli {
    /// Settings file.
    #[arg(
        long,
        global = true,
        env = "DBSCRUB_CONFIG",
        default_value = "dbscrub.toml"
    )]
    config: PathBuf,
    /// Database connection string.
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        hide_env_values = true,
        value_name = "CONNECTION_STRING"
    )]
    database_url: Option<String>,
    /// Console log format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Record config.json, logs.ndjson and report.json under this directory.
    #[arg(long, global = true)]
    run_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Trim and scrub eligible models in place.
    Scrub(ScrubArgs),
    /// List text fields that have no scrub policy.
    Validate(ValidateArgs),
    /// Scrub every model, one subprocess per model.
    ScrubParallel(ScrubParallelArgs),
    /// Trim every model, one subprocess per model.
    TrimParallel(TrimParallelArgs),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Scrub(_) => "scrub",
            Command::Validate(_) => "validate",
            Command::ScrubParallel(_) => "scrub-parallel",
            Command::TrimParallel(_) => "trim-parallel",
        }
    }
}

#[derive(Args, Debug)]
struct ScrubArgs {
    /// Only scrub this model.
    #[arg(long, value_name = "APP_LABEL.MODEL")]
    model: Option<String>,
    /// Do not delete the sessions table afterwards.
    #[arg(long, default_value_t = false)]
    keep_sessions: bool,
    /// Delete the fake-data pool afterwards.
    #[arg(long, default_value_t = false)]
    remove_fake_data: bool,
    /// Trim window in days.
    #[arg(long, value_name = "DAYS", default_value_t = DEFAULT_OLDER_THAN_DAYS)]
    older_than: u32,
    /// Trim only, leave field values alone.
    #[arg(long, default_value_t = false)]
    trim_only: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Also list models that are fully covered.
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Args, Debug)]
struct ScrubParallelArgs {
    /// Concurrent subprocesses; defaults to the number of cores.
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct TrimParallelArgs {
    #[arg(long, default_value_t = 10)]
    workers: usize,
    #[arg(long, value_name = "DAYS", default_value_t = DEFAULT_OLDER_THAN_DAYS)]
    older_than: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let settings = Settings::load(&cli.config)?;

    let run_paths = match &cli.run_dir {
        Some(run_dir) => Some(start_run(&RunContext {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            command: cli.command.name().to_string(),
            run_dir: run_dir.clone(),
            config_path: cli.config.clone(),
            environment: settings.effective_environment(),
            connection: cli.database_url.as_deref().map(redact_database_url),
        })?),
        None => None,
    };
    init_logging(
        cli.log_format,
        run_paths.as_ref().map(|paths| paths.logs_path.as_path()),
    )?;

    let started = Instant::now();
    info!(event = "run_started", command = cli.command.name(), "run started");

    let code = match &cli.command {
        Command::Scrub(args) => run_scrub(&cli, &settings, args, run_paths.as_ref()).await?,
        Command::Validate(args) => run_validate(&cli, &settings, args, run_paths.as_ref()).await?,
        Command::ScrubParallel(args) => {
            let workers = args.workers.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|count| count.get())
                    .unwrap_or(1)
            });
            run_parallel(&cli, &settings, workers, scrub_args, run_paths.as_ref()).await?
        }
        Command::TrimParallel(args) => {
            let older_than = args.older_than;
            run_parallel(
                &cli,
                &settings,
                args.workers,
                move |model| trim_args(model, older_than),
                run_paths.as_ref(),
            )
            .await?
        }
    };

    info!(
        event = "run_finished",
        duration_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );
    Ok(code)
}

async fn connect(cli: &Cli, settings: &Settings) -> Result<PgPool, CliError> {
    let url = cli.database_url.as_deref().ok_or_else(|| {
        CliError::InvalidConfig(
            "connection string is required (--database-url or DATABASE_URL)".to_string(),
        )
    })?;
    let redacted = redact_database_url(url);
    info!(
        event = "connect",
        host = ?redacted.host,
        database = ?redacted.database,
        "connecting to database"
    );
    let pool = PgPoolOptions::new()
        .max_connections((settings.delete_workers() + 1) as u32)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await?;
    Ok(pool)
}

async fn load_registry(pool: &PgPool, settings: &Settings) -> Result<ModelRegistry, CliError> {
    let registry =
        load_models_with_options(pool, IntrospectOptions::for_settings(settings)).await?;
    info!(models = registry.len(), "model registry loaded");
    Ok(registry)
}

/// Refuse to touch a database outside the allowed environments.
fn environment_gate(settings: &Settings) -> bool {
    let environment = settings.effective_environment();
    if settings.environment_allowed(environment.as_deref()) {
        return true;
    }
    eprintln!(
        "Scrubbing only runs in {} environments (current: {}). Refusing to run against a live system.",
        settings.allowed_environments.join(", "),
        environment.as_deref().unwrap_or("unset")
    );
    false
}

async fn run_scrub(
    cli: &Cli,
    settings: &Settings,
    args: &ScrubArgs,
    run_paths: Option<&RunPaths>,
) -> Result<ExitCode, CliError> {
    if let Some(model) = &args.model {
        parse_model_label(model)?;
    }
    if !environment_gate(settings) {
        return Ok(ExitCode::FAILURE);
    }

    let pool = connect(cli, settings).await?;
    let registry = load_registry(&pool, settings).await?;
    let runner = ScrubRunner::new(pool, settings, &registry);
    let options = ScrubOptions {
        model: args.model.clone(),
        keep_sessions: args.keep_sessions,
        remove_fake_data: args.remove_fake_data,
        older_than_days: args.older_than,
        trim_only: args.trim_only,
    };

    match runner.run(&options).await? {
        ScrubOutcome::Completed(report) => {
            if let Some(paths) = run_paths {
                write_report(paths, &report)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        ScrubOutcome::EnvironmentRejected { .. } => {
            environment_gate(settings);
            Ok(ExitCode::FAILURE)
        }
        ScrubOutcome::StrictModeViolation(report) => {
            eprintln!("strict_mode requires a scrub policy for every text field. Missing:");
            eprint!("{}", report.render(false));
            if let Some(paths) = run_paths {
                write_report(paths, &report)?;
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_validate(
    cli: &Cli,
    settings: &Settings,
    args: &ValidateArgs,
    run_paths: Option<&RunPaths>,
) -> Result<ExitCode, CliError> {
    let pool = connect(cli, settings).await?;
    let registry = load_registry(&pool, settings).await?;
    let report = ScrubRunner::new(pool, settings, &registry).validate()?;

    print!("{}", report.render(args.all));
    if let Some(paths) = run_paths {
        write_report(paths, &report)?;
    }

    Ok(if report.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_parallel<F>(
    cli: &Cli,
    settings: &Settings,
    workers: usize,
    job_args: F,
    run_paths: Option<&RunPaths>,
) -> Result<ExitCode, CliError>
where
    F: Fn(&str) -> Vec<String>,
{
    if !environment_gate(settings) {
        return Ok(ExitCode::FAILURE);
    }

    let invocation = ChildInvocation {
        program: std::env::current_exe()?,
        global_args: child_global_args(cli),
        database_url: cli.database_url.clone(),
    };
    // Children only fill the pool; creating its table here keeps them from
    // racing on the DDL.
    let pool = connect(cli, settings).await?;
    let registry = ModelRegistry::default();
    let runner = ScrubRunner::new(pool, settings, &registry);
    runner.prepare_fake_data().await?;

    let models = discover_models(&invocation).await?;
    info!(models = models.len(), workers, "dispatching models");

    let mut report = run_jobs(&invocation, cli.command.name(), models, job_args, workers).await;

    // Children keep sessions and the pool; both are cleared once here so no
    // child deletes pool rows another child is still reading.
    report.cleanup = Some(runner.cleanup(false, true).await?);

    if let Some(paths) = run_paths {
        write_report(paths, &report)?;
    }

    if report.is_ok() {
        info!(jobs = report.jobs.len(), "all models finished");
        Ok(ExitCode::SUCCESS)
    } else {
        let failed: Vec<&str> = report.failed().map(|job| job.model.as_str()).collect();
        error!(failed = ?failed, "some models failed");
        Ok(ExitCode::FAILURE)
    }
}

fn child_global_args(cli: &Cli) -> Vec<String> {
    let mut args = vec![
        "--config".to_string(),
        cli.config.display().to_string(),
        "--log-format".to_string(),
        cli.log_format.as_str().to_string(),
    ];
    if let Some(run_dir) = &cli.run_dir {
        args.push("--run-dir".to_string());
        args.push(run_dir.display().to_string());
    }
    args
}
