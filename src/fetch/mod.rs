//! Network fetches with bounded retries across alternate sources.
//!
//! Sources are tried in order of preference. Each source gets
//! `max_retries` attempts with a constant backoff in between; the first
//! attempt that produces a verified artifact wins. Anything left at the
//! destination by a failed attempt is removed before the next one, so a
//! truncated download or half-finished clone is never reused.

pub mod archive;

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{InstallError, MutationError};
use crate::host::HostRoot;
use crate::runner::{CommandRunner, CommandSpec};

/// Backoff between attempts on the same source.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Transport used to materialize a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchKind {
    /// HTTP(S) download of a single file via `curl`.
    Download,
    /// Shallow `git clone` of a repository, optionally at a branch or tag.
    GitClone { branch: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    pub kind: FetchKind,
    /// Candidate locations, most preferred first.
    pub sources: Vec<String>,
    /// Host path of the resulting file or checkout.
    pub destination: PathBuf,
    /// Attempts per source. Zero is treated as one.
    pub max_retries: u32,
    pub timeout: Duration,
    /// Expected SHA-256 (hex) of a downloaded file.
    pub sha256: Option<String>,
}

impl FetchSpec {
    pub fn download(sources: Vec<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            kind: FetchKind::Download,
            sources,
            destination: destination.into(),
            max_retries: 3,
            timeout: Duration::from_secs(300),
            sha256: None,
        }
    }

    pub fn git_clone(
        sources: Vec<String>,
        branch: Option<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: FetchKind::GitClone { branch },
            sources,
            destination: destination.into(),
            max_retries: 3,
            timeout: Duration::from_secs(600),
            sha256: None,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into().to_ascii_lowercase());
        self
    }
}

/// One failed attempt against one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttempt {
    pub source: String,
    pub attempt: u32,
    pub reason: String,
}

impl fmt::Display for FetchAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (attempt {}): {}", self.source, self.attempt, self.reason)
    }
}

/// Every source exhausted its retries.
#[derive(Error, Debug, Clone)]
#[error(
    "fetching {} failed after {} attempts across {} sources; last error: {}",
    .destination.display(),
    .attempts.len(),
    .sources.len(),
    .attempts.last().map(|a| a.to_string()).unwrap_or_else(|| "no sources configured".to_string())
)]
pub struct FetchError {
    pub destination: PathBuf,
    pub sources: Vec<String>,
    pub attempts: Vec<FetchAttempt>,
}

/// Runs [`FetchSpec`]s through a [`CommandRunner`].
pub struct Fetcher<'a> {
    runner: &'a dyn CommandRunner,
    root: &'a HostRoot,
    backoff: Duration,
}

impl<'a> Fetcher<'a> {
    pub fn new(runner: &'a dyn CommandRunner, root: &'a HostRoot) -> Self {
        Self {
            runner,
            root,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fetch `spec`, returning the host path of the artifact.
    pub fn fetch(&self, spec: &FetchSpec) -> Result<PathBuf, InstallError> {
        let local = self.root.resolve(&spec.destination);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MutationError::io(parent, "creating fetch destination parent", e))?;
        }

        let retries = spec.max_retries.max(1);
        let mut attempts = Vec::new();

        for source in &spec.sources {
            for attempt in 1..=retries {
                discard_partial(&local)?;
                println!(
                    "  Fetching {} (attempt {}/{})",
                    source, attempt, retries
                );

                let outcome = self
                    .runner
                    .run(&transport_command(spec, source, &local))
                    .map_err(|e| e.to_string())
                    .and_then(|_| verify_artifact(spec, &local));

                match outcome {
                    Ok(()) => {
                        tracing::info!(source = %source, attempt, "fetch succeeded");
                        return Ok(spec.destination.clone());
                    }
                    Err(reason) => {
                        tracing::warn!(source = %source, attempt, %reason, "fetch attempt failed");
                        attempts.push(FetchAttempt {
                            source: source.clone(),
                            attempt,
                            reason,
                        });
                    }
                }

                if attempt < retries {
                    self.runner.pause(self.backoff);
                }
            }
            discard_partial(&local)?;
            println!("  Source exhausted: {}", source);
        }

        Err(FetchError {
            destination: spec.destination.clone(),
            sources: spec.sources.clone(),
            attempts,
        }
        .into())
    }
}

fn transport_command(spec: &FetchSpec, source: &str, local: &Path) -> CommandSpec {
    let dest = local.display().to_string();
    let cmd = match &spec.kind {
        FetchKind::Download => CommandSpec::new("curl")
            .args(["-fsSL", "--connect-timeout", "15", "--max-time"])
            .arg(spec.timeout.as_secs().max(1).to_string())
            .args(["-o", dest.as_str(), source]),
        FetchKind::GitClone { branch } => {
            let mut cmd = CommandSpec::new("git").args(["clone", "--depth", "1"]);
            if let Some(branch) = branch {
                cmd = cmd.args(["--branch", branch.as_str()]);
            }
            cmd.args([source, dest.as_str()])
        }
    };
    cmd.timeout(spec.timeout + Duration::from_secs(5))
}

fn verify_artifact(spec: &FetchSpec, local: &Path) -> Result<(), String> {
    match &spec.kind {
        FetchKind::Download => {
            let size = fs::metadata(local)
                .map(|m| m.len())
                .map_err(|_| format!("{} was not created", local.display()))?;
            if size == 0 {
                return Err(format!("{} is empty", local.display()));
            }
            if let Some(expected) = &spec.sha256 {
                let actual = sha256_file(local)
                    .map_err(|e| format!("hashing {}: {}", local.display(), e))?;
                if &actual != expected {
                    return Err(format!(
                        "checksum mismatch: expected {}, got {}",
                        expected, actual
                    ));
                }
            }
            Ok(())
        }
        FetchKind::GitClone { .. } => {
            if local.join(".git").exists() {
                Ok(())
            } else {
                Err(format!("{} is not a git checkout", local.display()))
            }
        }
    }
}

fn discard_partial(local: &Path) -> Result<(), MutationError> {
    crate::mutate::files::ensure_absent(local).map(|_| ())
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let f = File::open(path)?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
