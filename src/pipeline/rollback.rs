//! Undo of resources created during the current run.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::Serialize;

use crate::host::HostRoot;
use crate::runner::{CommandRunner, CommandSpec};

/// A single reversible effect a stage had on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    StopService(String),
    DisableService(String),
    RemoveFile(PathBuf),
    RemoveDir(PathBuf),
    DaemonReload,
}

impl RollbackAction {
    pub fn describe(&self) -> String {
        match self {
            RollbackAction::StopService(unit) => format!("stop {}", unit),
            RollbackAction::DisableService(unit) => format!("disable {}", unit),
            RollbackAction::RemoveFile(path) => format!("remove {}", path.display()),
            RollbackAction::RemoveDir(path) => format!("remove {}/", path.display()),
            RollbackAction::DaemonReload => "systemctl daemon-reload".to_string(),
        }
    }
}

/// Effects recorded in the order they happened.
#[derive(Debug, Default, Clone)]
pub struct RollbackJournal {
    actions: Vec<RollbackAction>,
}

impl RollbackJournal {
    pub fn record(&mut self, action: RollbackAction) {
        tracing::debug!(action = %action.describe(), "journaled for rollback");
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[RollbackAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Outcome of one undo step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackStep {
    pub action: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Invoked by the pipeline after a fatal stage failure.
pub trait RollbackHandler {
    fn rollback(
        &self,
        journal: &RollbackJournal,
        runner: &dyn CommandRunner,
        root: &HostRoot,
    ) -> Vec<RollbackStep>;
}

/// Replays the journal newest first. A failing step is reported and the
/// remaining steps still run.
#[derive(Debug, Default, Clone, Copy)]
pub struct JournalRollback;

impl RollbackHandler for JournalRollback {
    fn rollback(
        &self,
        journal: &RollbackJournal,
        runner: &dyn CommandRunner,
        root: &HostRoot,
    ) -> Vec<RollbackStep> {
        journal
            .actions()
            .iter()
            .rev()
            .map(|action| {
                let result = undo(action, runner, root);
                let step = RollbackStep {
                    action: action.describe(),
                    ok: result.is_ok(),
                    detail: result.err(),
                };
                match &step.detail {
                    None => println!("  Rolled back: {}", step.action),
                    Some(detail) => {
                        tracing::warn!(action = %step.action, %detail, "rollback step failed");
                        println!("  Rollback step failed: {} ({})", step.action, detail);
                    }
                }
                step
            })
            .collect()
    }
}

fn undo(action: &RollbackAction, runner: &dyn CommandRunner, root: &HostRoot) -> Result<(), String> {
    match action {
        RollbackAction::StopService(unit) => systemctl(runner, &["stop", unit.as_str()]),
        RollbackAction::DisableService(unit) => systemctl(runner, &["disable", unit.as_str()]),
        RollbackAction::DaemonReload => systemctl(runner, &["daemon-reload"]),
        RollbackAction::RemoveFile(path) => {
            let full = root.resolve(path);
            match fs::remove_file(&full) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    Err(format!("removing {}: {}", full.display(), e))
                }
                _ => Ok(()),
            }
        }
        RollbackAction::RemoveDir(path) => {
            let full = root.resolve(path);
            match fs::remove_dir_all(&full) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    Err(format!("removing {}: {}", full.display(), e))
                }
                _ => Ok(()),
            }
        }
    }
}

fn systemctl(runner: &dyn CommandRunner, args: &[&str]) -> Result<(), String> {
    runner
        .run(&CommandSpec::new("systemctl").args(args.iter().copied()))
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::MockRunner;
    use tempfile::TempDir;

    #[test]
    fn test_replays_newest_first() {
        let temp = TempDir::new().unwrap();
        let root = HostRoot::new(temp.path());
        fs::create_dir_all(root.resolve("/etc/systemd/system")).unwrap();
        fs::write(root.resolve("/etc/systemd/system/incus.service"), "[Unit]\n").unwrap();

        let mut journal = RollbackJournal::default();
        journal.record(RollbackAction::DaemonReload);
        journal.record(RollbackAction::RemoveFile("/etc/systemd/system/incus.service".into()));
        journal.record(RollbackAction::DisableService("incus".into()));
        journal.record(RollbackAction::StopService("incus".into()));

        let runner = MockRunner::new();
        let steps = JournalRollback.rollback(&journal, &runner, &root);

        assert!(steps.iter().all(|s| s.ok));
        assert_eq!(
            runner.calls(),
            vec!["systemctl stop incus", "systemctl disable incus", "systemctl daemon-reload"]
        );
        assert!(!root.resolve("/etc/systemd/system/incus.service").exists());
        assert_eq!(steps[2].action, "remove /etc/systemd/system/incus.service");
    }

    #[test]
    fn test_failed_step_does_not_stop_rollback() {
        let temp = TempDir::new().unwrap();
        let root = HostRoot::new(temp.path());
        fs::create_dir_all(root.resolve("/usr/local/src/incus-build")).unwrap();

        let mut journal = RollbackJournal::default();
        journal.record(RollbackAction::RemoveDir("/usr/local/src/incus-build".into()));
        journal.record(RollbackAction::StopService("incus".into()));

        let runner = MockRunner::new();
        runner.fail("systemctl stop");
        let steps = JournalRollback.rollback(&journal, &runner, &root);

        assert!(!steps[0].ok);
        assert!(steps[1].ok);
        assert!(!root.resolve("/usr/local/src/incus-build").exists());
    }
}
