use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use dbscrub_engine::CleanupReport;

use crate::CliError;

/// How child processes are started so they share config and database.
#[derive(Debug, Clone)]
pub struct ChildInvocation {
    pub program: PathBuf,
    /// Global flags placed before the child's own arguments.
    pub global_args: Vec<String>,
    /// Handed over as `DATABASE_URL`, never on the command line.
    pub database_url: Option<String>,
}

impl ChildInvocation {
    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.global_args).args(args).kill_on_drop(true);
        if let Some(url) = &self.database_url {
            command.env("DATABASE_URL", url);
        }
        command
    }
}

/// Exit status of one child.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobResult {
    pub model: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Aggregated outcome of a parallel command.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelReport {
    pub command: String,
    pub workers: usize,
    pub jobs: Vec<JobResult>,
    pub cleanup: Option<CleanupReport>,
}

impl ParallelReport {
    pub fn failed(&self) -> impl Iterator<Item = &JobResult> {
        self.jobs.iter().filter(|job| !job.success)
    }

    pub fn is_ok(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Model labels from `validate --all` output, in order of appearance.
pub fn parse_model_list(output: &str) -> Result<Vec<String>, regex::Error> {
    let re = Regex::new(r"(?m)^Model '([a-zA-Z0-9_.]+)'")?;
    let mut models: Vec<String> = Vec::new();
    for captures in re.captures_iter(output) {
        if let Some(label) = captures.get(1)
            && !models.iter().any(|model| model == label.as_str())
        {
            models.push(label.as_str().to_string());
        }
    }
    Ok(models)
}

/// Ask a child `validate --all` for every eligible model.
pub async fn discover_models(invocation: &ChildInvocation) -> Result<Vec<String>, CliError> {
    let output = invocation
        .command(&["validate".to_string(), "--all".to_string()])
        .stderr(Stdio::inherit())
        .output()
        .await?;
    let models = parse_model_list(&String::from_utf8_lossy(&output.stdout))?;
    if models.is_empty() && !output.status.success() {
        return Err(CliError::Discovery(format!(
            "validate exited with {}",
            output.status
        )));
    }
    Ok(models)
}

/// Run one child per model, at most `workers` at a time.
pub async fn run_jobs<F>(
    invocation: &ChildInvocation,
    command: &str,
    models: Vec<String>,
    job_args: F,
    workers: usize,
) -> ParallelReport
where
    F: Fn(&str) -> Vec<String>,
{
    let workers = workers.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    let invocation = Arc::new(invocation.clone());
    let mut tasks = JoinSet::new();

    for model in models {
        let args = job_args(&model);
        let semaphore = Arc::clone(&semaphore);
        let invocation = Arc::clone(&invocation);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let started = Instant::now();
            let status = invocation.command(&args).status().await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match status {
                Ok(status) => JobResult {
                    model,
                    success: status.success(),
                    exit_code: status.code(),
                    duration_ms,
                    error: None,
                },
                Err(err) => JobResult {
                    model,
                    success: false,
                    exit_code: None,
                    duration_ms,
                    error: Some(err.to_string()),
                },
            }
        });
    }

    let mut jobs = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(job) => {
                if job.success {
                    info!(model = %job.model, duration_ms = job.duration_ms, "finished {command}");
                } else {
                    warn!(
                        model = %job.model,
                        exit_code = ?job.exit_code,
                        error = ?job.error,
                        "{command} failed"
                    );
                }
                jobs.push(job);
            }
            Err(err) => warn!(error = %err, "{command} task panicked"),
        }
    }
    jobs.sort_by(|a, b| a.model.cmp(&b.model));

    ParallelReport {
        command: command.to_string(),
        workers,
        jobs,
        cleanup: None,
    }
}

/// Child arguments for scrubbing one model.
pub fn scrub_args(model: &str) -> Vec<String> {
    vec![
        "scrub".to_string(),
        "--model".to_string(),
        model.to_string(),
        "--keep-sessions".to_string(),
    ]
}

/// Child arguments for trimming one model.
pub fn trim_args(model: &str, older_than: u32) -> Vec<String> {
    vec![
        "scrub".to_string(),
        "--model".to_string(),
        model.to_string(),
        "--older-than".to_string(),
        older_than.to_string(),
        "--trim-only".to_string(),
        "--keep-sessions".to_string(),
    ]
}
