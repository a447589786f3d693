//! Stage abstraction.
//!
//! A stage is one ordered, checkable unit of installation work: a
//! precondition that may short-circuit it, an action, and a postcondition
//! checked after the action regardless of what the action reported.

use std::time::Duration;

use crate::config::InstallationConfig;
use crate::error::InstallError;
use crate::fetch::Fetcher;
use crate::host::HostRoot;
use crate::pipeline::rollback::{RollbackAction, RollbackJournal};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

/// Whether a failed stage halts the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Fatal,
    /// Failure is logged and the pipeline continues.
    Warning,
}

/// Everything a stage may touch.
///
/// The configuration is shared read-only; the journal is where a stage
/// records resources it created so a later fatal failure can undo them.
pub struct StageContext<'a> {
    pub config: &'a InstallationConfig,
    pub runner: &'a dyn CommandRunner,
    pub root: &'a HostRoot,
    pub journal: &'a mut RollbackJournal,
}

impl<'a> StageContext<'a> {
    /// Run a command, turning any failure into an [`InstallError`].
    pub fn run(&self, spec: CommandSpec) -> Result<CommandOutput, InstallError> {
        Ok(self.runner.run(&spec)?)
    }

    pub fn succeeds(&self, spec: CommandSpec) -> bool {
        self.runner.succeeds(&spec)
    }

    pub fn fetcher(&self) -> Fetcher<'_> {
        Fetcher::new(self.runner, self.root).with_backoff(self.config.fetch.backoff())
    }

    pub fn record(&mut self, action: RollbackAction) {
        self.journal.record(action);
    }

    pub fn pause(&self, duration: Duration) {
        self.runner.pause(duration);
    }
}

pub trait Stage {
    fn name(&self) -> &str;

    fn criticality(&self) -> Criticality {
        Criticality::Fatal
    }

    /// One-line statement of intent, printed before the stage acts.
    fn describe(&self) -> String;

    /// `Ok(true)` when the desired end state already holds and the action
    /// can be skipped. Must not change the host.
    fn already_satisfied(&self, _ctx: &StageContext<'_>) -> Result<bool, InstallError> {
        Ok(false)
    }

    fn action(&self, ctx: &mut StageContext<'_>) -> Result<(), InstallError>;

    /// Verification run after the action. An error marks the stage failed
    /// even if the action succeeded.
    fn postcondition(&self, _ctx: &StageContext<'_>) -> Result<(), InstallError> {
        Ok(())
    }
}

type CheckFn = Box<dyn Fn(&StageContext<'_>) -> Result<bool, InstallError>>;
type ActionFn = Box<dyn Fn(&mut StageContext<'_>) -> Result<(), InstallError>>;
type VerifyFn = Box<dyn Fn(&StageContext<'_>) -> Result<(), InstallError>>;

/// Stage assembled from closures.
pub struct FnStage {
    name: String,
    intent: String,
    criticality: Criticality,
    check: Option<CheckFn>,
    act: ActionFn,
    verify: Option<VerifyFn>,
}

impl FnStage {
    pub fn new<F>(name: impl Into<String>, intent: impl Into<String>, act: F) -> Self
    where
        F: Fn(&mut StageContext<'_>) -> Result<(), InstallError> + 'static,
    {
        Self {
            name: name.into(),
            intent: intent.into(),
            criticality: Criticality::Fatal,
            check: None,
            act: Box::new(act),
            verify: None,
        }
    }

    pub fn warning(mut self) -> Self {
        self.criticality = Criticality::Warning;
        self
    }

    pub fn skip_if<F>(mut self, check: F) -> Self
    where
        F: Fn(&StageContext<'_>) -> Result<bool, InstallError> + 'static,
    {
        self.check = Some(Box::new(check));
        self
    }

    pub fn verify<F>(mut self, verify: F) -> Self
    where
        F: Fn(&StageContext<'_>) -> Result<(), InstallError> + 'static,
    {
        self.verify = Some(Box::new(verify));
        self
    }
}

impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn criticality(&self) -> Criticality {
        self.criticality
    }

    fn describe(&self) -> String {
        self.intent.clone()
    }

    fn already_satisfied(&self, ctx: &StageContext<'_>) -> Result<bool, InstallError> {
        match &self.check {
            Some(check) => check(ctx),
            None => Ok(false),
        }
    }

    fn action(&self, ctx: &mut StageContext<'_>) -> Result<(), InstallError> {
        (self.act)(ctx)
    }

    fn postcondition(&self, ctx: &StageContext<'_>) -> Result<(), InstallError> {
        match &self.verify {
            Some(verify) => verify(ctx),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OsFamily;
    use crate::runner::mock::MockRunner;

    #[test]
    fn test_fn_stage_hooks() {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let runner = MockRunner::new();
        runner.reply("systemctl is-active", "active\n");
        let root = HostRoot::new("/nonexistent");
        let mut journal = RollbackJournal::default();
        let mut ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };

        let stage = FnStage::new("start", "Start the daemon", |ctx| {
            ctx.run(CommandSpec::new("systemctl").args(["start", "incus"]))?;
            ctx.record(RollbackAction::StopService("incus".into()));
            Ok(())
        })
        .warning()
        .skip_if(|_| Ok(false))
        .verify(|ctx| {
            if ctx.succeeds(
                CommandSpec::new("systemctl")
                    .args(["is-active", "incus"])
                    .expect_stdout("active"),
            ) {
                Ok(())
            } else {
                Err(InstallError::verification("incus", "not active"))
            }
        });

        assert_eq!(stage.criticality(), Criticality::Warning);
        assert!(!stage.already_satisfied(&ctx).unwrap());
        stage.action(&mut ctx).unwrap();
        stage.postcondition(&ctx).unwrap();
        assert_eq!(runner.calls(), vec!["systemctl start incus", "systemctl is-active incus"]);
        assert_eq!(journal.actions().len(), 1);
    }
}
