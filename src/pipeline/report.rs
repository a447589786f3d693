//! Run manifests under `<state_dir>/runs/<run_id>/run-manifest.json`.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use super::rollback::RollbackStep;
use super::{PipelineResult, StageReport};

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
pub const KEEP_RUNS: usize = 10;

static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Full record written for each install run.
#[derive(Debug, Serialize)]
pub struct RunManifest {
    pub run_id: String,
    pub status: String,
    pub method: String,
    pub os_family: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub stages: Vec<StageReport>,
    pub rollback: Vec<RollbackStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunManifest {
    pub fn started(run_id: &str, method: &str, os_family: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: "running".to_string(),
            method: method.to_string(),
            os_family: os_family.to_string(),
            created_at_utc: timestamp_utc(OffsetDateTime::now_utc()),
            finished_at_utc: None,
            stages: Vec::new(),
            rollback: Vec::new(),
            error: None,
        }
    }

    pub fn finish(&mut self, result: &PipelineResult) {
        self.status = if result.is_success() {
            "success".to_string()
        } else {
            "failed".to_string()
        };
        self.finished_at_utc = Some(timestamp_utc(OffsetDateTime::now_utc()));
        self.stages = result.stages.clone();
        self.rollback = result.rollback.clone();
        self.error = result
            .failure
            .as_ref()
            .map(|f| format!("{}: {}", f.stage, f.error));
    }
}

/// Subset of the manifest needed to list and prune runs.
#[derive(Debug, Deserialize, Clone)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: String,
    #[serde(default)]
    pub method: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
}

pub fn runs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("runs")
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

const RUN_ID_STAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");
const TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// `YYYYMMDD-HHMMSS-<pid>-<seq>`, sortable by start time within a host.
pub fn generate_run_id() -> String {
    let seq = RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = OffsetDateTime::now_utc();
    let stamp = now
        .format(RUN_ID_STAMP)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("{}-{}-{:04}", stamp, std::process::id(), seq)
}

/// Manifest timestamp, second precision so string order is time order.
pub fn timestamp_utc(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(TIMESTAMP)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub fn write_manifest(runs_dir: &Path, manifest: &RunManifest) -> Result<()> {
    let path = manifest_path(&runs_dir.join(&manifest.run_id));
    write_json_atomic(&path, manifest)
        .with_context(|| format!("writing run manifest '{}'", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn load_runs_metadata(runs_dir: &Path) -> Result<Vec<RunMetadata>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("reading runs directory '{}'", runs_dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("iterating runs directory '{}'", runs_dir.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
        let parsed: RunMetadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
        runs.push(parsed);
    }
    Ok(runs)
}

/// All recorded runs, newest first.
pub fn list_runs(runs_dir: &Path) -> Result<Vec<RunMetadata>> {
    let mut runs = load_runs_metadata(runs_dir)?;
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<()> {
    for run in list_runs(runs_dir)?.into_iter().skip(keep) {
        let path = runs_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
    }
    Ok(())
}

fn run_sort_key(run: &RunMetadata) -> (String, String) {
    (
        run.finished_at_utc
            .clone()
            .unwrap_or_else(|| run.created_at_utc.clone()),
        run.run_id.clone(),
    )
}
