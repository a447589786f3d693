//! Error taxonomy for installer runs.
//!
//! Every stage action returns [`InstallError`]. The executor decides from the
//! stage's criticality whether an error halts the run; the variant only says
//! what went wrong and where.

use std::path::PathBuf;

use thiserror::Error;

use crate::fetch::FetchError;
use crate::runner::CommandError;

/// A host tool required before the pipeline may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTool {
    pub tool: String,
    pub package: String,
}

/// A change to a host resource could not be applied.
#[derive(Error, Debug)]
#[error("cannot apply change to {}: {reason}", .resource.display())]
pub struct MutationError {
    pub resource: PathBuf,
    pub reason: String,
    #[source]
    pub source: Option<std::io::Error>,
}

impl MutationError {
    pub fn new(resource: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn io(resource: impl Into<PathBuf>, action: &str, err: std::io::Error) -> Self {
        Self {
            resource: resource.into(),
            reason: format!("{action}: {err}"),
            source: Some(err),
        }
    }
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("missing required host tools:\n{}", format_missing(.0))]
    ToolMissing(Vec<MissingTool>),

    #[error("insufficient privilege: {0}")]
    Privilege(String),

    #[error(transparent)]
    Network(#[from] FetchError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("verification failed for {subject}: {reason}")]
    Verification {
        subject: String,
        reason: String,
        hint: Option<String>,
    },

    #[error("installation aborted by operator")]
    UserAbort,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl InstallError {
    pub fn verification(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        InstallError::Verification {
            subject: subject.into(),
            reason: reason.into(),
            hint: None,
        }
    }

    /// Attach a diagnostic command to a verification failure.
    pub fn with_hint(self, hint: impl Into<String>) -> Self {
        match self {
            InstallError::Verification {
                subject, reason, ..
            } => InstallError::Verification {
                subject,
                reason,
                hint: Some(hint.into()),
            },
            other => other,
        }
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            InstallError::ToolMissing(_) => "tool-missing",
            InstallError::Privilege(_) => "privilege",
            InstallError::Network(_) => "network",
            InstallError::Mutation(_) => "mutation",
            InstallError::Command(_) => "command",
            InstallError::Verification { .. } => "verification",
            InstallError::UserAbort => "user-abort",
            InstallError::Config(_) => "config",
        }
    }

    /// Command the operator can run to investigate the failure.
    pub fn hint(&self) -> Option<String> {
        match self {
            InstallError::Verification { hint, .. } => hint.clone(),
            InstallError::ToolMissing(_) => {
                Some("install the listed packages and re-run the installer".to_string())
            }
            InstallError::Privilege(_) => Some("re-run the installer with sudo".to_string()),
            InstallError::Network(err) => Some(format!(
                "check connectivity to {}",
                err.sources.first().map(String::as_str).unwrap_or("the listed sources")
            )),
            InstallError::Command(err) if !err.stderr.trim().is_empty() => {
                Some(format!("inspect the output of `{}`", err.command))
            }
            _ => None,
        }
    }

    pub fn is_user_abort(&self) -> bool {
        matches!(self, InstallError::UserAbort)
    }
}

fn format_missing(missing: &[MissingTool]) -> String {
    missing
        .iter()
        .map(|m| format!("  {} (install: {})", m.tool, m.package))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_missing_lists_packages() {
        let err = InstallError::ToolMissing(vec![
            MissingTool {
                tool: "patchelf".into(),
                package: "patchelf".into(),
            },
            MissingTool {
                tool: "git".into(),
                package: "git".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("patchelf (install: patchelf)"));
        assert!(msg.contains("git (install: git)"));
        assert_eq!(err.kind(), "tool-missing");
    }

    #[test]
    fn verification_hint_survives() {
        let err = InstallError::verification("incus.service", "unit is not active")
            .with_hint("journalctl -u incus --no-pager");
        assert_eq!(err.hint().as_deref(), Some("journalctl -u incus --no-pager"));
        assert!(err.to_string().contains("incus.service"));
    }

    #[test]
    fn with_hint_leaves_other_kinds_alone() {
        let err = InstallError::Config("bad".into()).with_hint("ignored");
        assert!(err.hint().is_none());
    }

    #[test]
    fn mutation_error_names_resource() {
        let err = MutationError::new("/etc/subuid", "permission denied");
        assert_eq!(
            err.to_string(),
            "cannot apply change to /etc/subuid: permission denied"
        );
    }
}
