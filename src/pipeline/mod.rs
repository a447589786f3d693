//! Ordered stage execution.
//!
//! Stages run strictly in declared order, one at a time. Each stage moves
//! `Pending → Running → {Succeeded, Failed, Skipped}` exactly once per run.
//! A failed fatal stage triggers the rollback handler and ends the run; a
//! failed warning stage is recorded and the run continues.

pub mod report;
pub mod rollback;

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::InstallationConfig;
use crate::error::InstallError;
use crate::host::HostRoot;
use crate::runner::CommandRunner;
use crate::stage::{Criticality, Stage, StageContext};
use rollback::{RollbackHandler, RollbackJournal, RollbackStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub ordinal: usize,
    pub name: String,
    pub criticality: Criticality,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u128,
}

/// The first fatal failure of a run.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: String,
    pub ordinal: usize,
    pub error: InstallError,
}

#[derive(Debug)]
pub struct PipelineResult {
    pub stages: Vec<StageReport>,
    pub failure: Option<StageFailure>,
    pub rollback: Vec<RollbackStep>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn status_of(&self, name: &str) -> Option<StageStatus> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.status)
    }

    /// Warning stages that failed without halting the run.
    pub fn warnings(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed && s.criticality == Criticality::Warning)
    }
}

/// Named, ordered list of stages.
pub struct Pipeline {
    label: String,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, stage: impl Stage + 'static) {
        self.stages.push(Box::new(stage));
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(
        &self,
        config: &InstallationConfig,
        runner: &dyn CommandRunner,
        root: &HostRoot,
        rollback: &dyn RollbackHandler,
    ) -> PipelineResult {
        let total = self.stages.len();
        let mut journal = RollbackJournal::default();
        let mut reports: Vec<StageReport> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| StageReport {
                ordinal: i + 1,
                name: stage.name().to_string(),
                criticality: stage.criticality(),
                status: StageStatus::Pending,
                message: None,
                duration_ms: 0,
            })
            .collect();
        let mut failure = None;

        for (i, stage) in self.stages.iter().enumerate() {
            let prefix = format!("[{}:{}/{} {}]", self.label, i + 1, total, stage.name());
            println!("{} {}", prefix, stage.describe());
            tracing::info!(stage = stage.name(), ordinal = i + 1, "stage running");
            reports[i].status = StageStatus::Running;

            let started = Instant::now();
            let mut ctx = StageContext {
                config,
                runner,
                root,
                journal: &mut journal,
            };
            let outcome = execute_stage(stage.as_ref(), &mut ctx);
            reports[i].duration_ms = started.elapsed().as_millis();

            match outcome {
                Ok(StageStatus::Skipped) => {
                    println!("{} already satisfied, skipped", prefix);
                    reports[i].status = StageStatus::Skipped;
                }
                Ok(status) => {
                    println!("{} done ({})", prefix, format_duration(started.elapsed()));
                    reports[i].status = status;
                }
                Err(err) => {
                    reports[i].status = StageStatus::Failed;
                    reports[i].message = Some(err.to_string());
                    match stage.criticality() {
                        Criticality::Warning => {
                            println!("{} warning: {}", prefix, err);
                            tracing::warn!(stage = stage.name(), error = %err, "warning stage failed, continuing");
                        }
                        Criticality::Fatal => {
                            println!("{} FAILED: {}", prefix, err);
                            tracing::info!(stage = stage.name(), kind = err.kind(), "fatal stage failure");
                            failure = Some(StageFailure {
                                stage: stage.name().to_string(),
                                ordinal: i + 1,
                                error: err,
                            });
                            break;
                        }
                    }
                }
            }
        }

        let rollback_steps = if failure.is_some() && !journal.is_empty() {
            println!("[{}] rolling back changes made by this run", self.label);
            rollback.rollback(&journal, runner, root)
        } else {
            Vec::new()
        };

        PipelineResult {
            stages: reports,
            failure,
            rollback: rollback_steps,
        }
    }
}

/// Precondition, action, postcondition.
fn execute_stage(stage: &dyn Stage, ctx: &mut StageContext<'_>) -> Result<StageStatus, InstallError> {
    if stage.already_satisfied(ctx)? {
        return Ok(StageStatus::Skipped);
    }
    stage.action(ctx)?;
    stage.postcondition(ctx)?;
    Ok(StageStatus::Succeeded)
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 60 {
        format!("{}m{:02}s", d.as_secs() / 60, d.as_secs() % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OsFamily;
    use crate::pipeline::rollback::{JournalRollback, RollbackAction};
    use crate::runner::mock::MockRunner;
    use crate::runner::CommandSpec;
    use crate::stage::FnStage;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cmd_stage(name: &'static str) -> FnStage {
        FnStage::new(name, format!("run {}", name), move |ctx| {
            ctx.run(CommandSpec::new(name))?;
            Ok(())
        })
    }

    fn run(pipeline: &Pipeline, runner: &MockRunner) -> PipelineResult {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        pipeline.run(&config, runner, &root, &JournalRollback)
    }

    #[test]
    fn test_stages_run_in_declared_order() {
        let pipeline = Pipeline::new("install")
            .stage(cmd_stage("first"))
            .stage(cmd_stage("second"))
            .stage(cmd_stage("third"));
        let runner = MockRunner::new();
        let result = run(&pipeline, &runner);

        assert!(result.is_success());
        assert_eq!(runner.calls(), vec!["first", "second", "third"]);
        assert!(result
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Succeeded));
        assert_eq!(result.stages[2].ordinal, 3);
    }

    #[test]
    fn test_fatal_failure_halts_pipeline() {
        let pipeline = Pipeline::new("install")
            .stage(cmd_stage("first"))
            .stage(cmd_stage("second"))
            .stage(cmd_stage("third"));
        let runner = MockRunner::new();
        runner.fail("second");
        let result = run(&pipeline, &runner);

        assert!(!result.is_success());
        assert_eq!(runner.calls(), vec!["first", "second"]);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.stage, "second");
        assert_eq!(failure.error.kind(), "command");
        assert_eq!(result.status_of("third"), Some(StageStatus::Pending));
    }

    #[test]
    fn test_warning_failure_continues() {
        let pipeline = Pipeline::new("install")
            .stage(cmd_stage("optional").warning())
            .stage(cmd_stage("required"));
        let runner = MockRunner::new();
        runner.fail("optional");
        let result = run(&pipeline, &runner);

        assert!(result.is_success());
        assert_eq!(runner.calls(), vec!["optional", "required"]);
        assert_eq!(result.warnings().count(), 1);
        assert_eq!(result.status_of("required"), Some(StageStatus::Succeeded));
    }

    #[test]
    fn test_satisfied_precondition_skips_action() {
        let pipeline = Pipeline::new("install").stage(cmd_stage("noop").skip_if(|_| Ok(true)));
        let runner = MockRunner::new();
        let result = run(&pipeline, &runner);

        assert!(runner.calls().is_empty());
        assert_eq!(result.status_of("noop"), Some(StageStatus::Skipped));
    }

    #[test]
    fn test_postcondition_overrides_action_success() {
        let pipeline = Pipeline::new("install")
            .stage(cmd_stage("start").verify(|_| {
                Err(InstallError::verification("incus.service", "unit is not active"))
            }))
            .stage(cmd_stage("after"));
        let runner = MockRunner::new();
        let result = run(&pipeline, &runner);

        let failure = result.failure.unwrap();
        assert_eq!(failure.error.kind(), "verification");
        assert_eq!(runner.calls(), vec!["start"]);
    }

    #[test]
    fn test_rollback_only_after_fatal_failure() {
        let journaling = |name: &'static str| {
            FnStage::new(name, "journal", move |ctx| {
                ctx.record(RollbackAction::StopService(name.to_string()));
                Ok(())
            })
        };

        let runner = MockRunner::new();
        let ok = Pipeline::new("install").stage(journaling("a"));
        let result = run(&ok, &runner);
        assert!(result.rollback.is_empty());
        assert!(runner.calls().is_empty());

        let failing = Pipeline::new("install")
            .stage(journaling("a"))
            .stage(journaling("b"))
            .stage(cmd_stage("boom"));
        runner.fail("boom");
        let result = run(&failing, &runner);
        assert_eq!(result.rollback.len(), 2);
        assert_eq!(
            runner.calls(),
            vec!["boom", "systemctl stop b", "systemctl stop a"]
        );
    }

    #[test]
    fn test_custom_rollback_handler_receives_journal() {
        struct Recording(Rc<RefCell<usize>>);
        impl RollbackHandler for Recording {
            fn rollback(
                &self,
                journal: &RollbackJournal,
                _runner: &dyn CommandRunner,
                _root: &HostRoot,
            ) -> Vec<RollbackStep> {
                *self.0.borrow_mut() = journal.actions().len();
                Vec::new()
            }
        }

        let seen = Rc::new(RefCell::new(0));
        let pipeline = Pipeline::new("install")
            .stage(FnStage::new("unit", "write unit", |ctx| {
                ctx.record(RollbackAction::RemoveFile("/etc/systemd/system/incus.service".into()));
                Ok(())
            }))
            .stage(cmd_stage("boom"));
        let runner = MockRunner::new();
        runner.fail("boom");
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        let result = pipeline.run(&config, &runner, &root, &Recording(seen.clone()));

        assert!(!result.is_success());
        assert_eq!(*seen.borrow(), 1);
    }
}
