use std::fs::{OpenOptions, create_dir_all};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;

use dbscrub_core::RedactedUrl;

use super::{RegistryError, RegistryResult};

/// Metadata captured when a command starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub command: String,
    pub run_dir: PathBuf,
    pub config_path: PathBuf,
    pub environment: Option<String>,
    pub connection: Option<RedactedUrl>,
}

/// JSON config written to each run directory.
#[derive(Debug, Serialize)]
struct RunConfig {
    run_id: String,
    started_at: String,
    command: String,
    config_path: String,
    environment: Option<String>,
    connection: Option<RedactedUrl>,
    git: GitInfo,
}

#[derive(Debug, Serialize)]
struct GitInfo {
    commit: Option<String>,
    dirty: Option<bool>,
}

/// Artifact paths of one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub logs_path: PathBuf,
    pub report_path: PathBuf,
}

/// Create `<run_dir>/<timestamp>__<command>_<run_id>` with `config.json`
/// and an empty `logs.ndjson`.
pub fn start_run(ctx: &RunContext) -> RegistryResult<RunPaths> {
    let timestamp = ctx.started_at.format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let root = ctx
        .run_dir
        .join(format!("{timestamp}__{}_{}", ctx.command, ctx.run_id));
    create_dir_all(&root)?;

    let config = RunConfig {
        run_id: ctx.run_id.clone(),
        started_at: ctx.started_at.to_rfc3339(),
        command: ctx.command.clone(),
        config_path: ctx.config_path.display().to_string(),
        environment: ctx.environment.clone(),
        connection: ctx.connection.clone(),
        git: collect_git_info(),
    };
    write_json(&root.join("config.json"), &config)?;

    let logs_path = root.join("logs.ndjson");
    OpenOptions::new().create(true).append(true).open(&logs_path)?;

    Ok(RunPaths {
        report_path: root.join("report.json"),
        logs_path,
        root,
    })
}

pub fn write_report<T: Serialize>(paths: &RunPaths, report: &T) -> RegistryResult<()> {
    write_json(&paths.report_path, report)
}

fn collect_git_info() -> GitInfo {
    let commit = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|value| !value.is_empty());

    let dirty = Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| !output.stdout.is_empty());

    GitInfo { commit, dirty }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> RegistryResult<()> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    serde_json::to_writer_pretty(file, value).map_err(RegistryError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_directory_holds_config_and_report() {
        let run_dir = std::env::temp_dir().join(format!("dbscrub-run-{}", uuid::Uuid::new_v4()));
        let ctx = RunContext {
            run_id: "abc".to_string(),
            started_at: Utc::now(),
            command: "validate".to_string(),
            run_dir: run_dir.clone(),
            config_path: PathBuf::from("dbscrub.toml"),
            environment: Some("STAGING".to_string()),
            connection: Some(dbscrub_core::redact_database_url(
                "postgres://app:secret@db:5432/shop",
            )),
        };

        let paths = start_run(&ctx).unwrap();
        assert!(paths.logs_path.exists());
        write_report(&paths, &serde_json::json!({ "ok": true })).unwrap();

        let config = std::fs::read_to_string(paths.root.join("config.json")).unwrap();
        assert!(config.contains("\"environment\": \"STAGING\""));
        assert!(!config.contains("secret"));
        assert!(paths.report_path.exists());

        std::fs::remove_dir_all(run_dir).unwrap();
    }
}
