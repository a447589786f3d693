//! Final end-to-end check that the client reaches the daemon.

use crate::config::InstallMethod;
use crate::error::InstallError;
use crate::runner::CommandSpec;
use crate::stage::{FnStage, StageContext};

/// Client binary matching the install method.
fn client(ctx: &StageContext<'_>) -> String {
    match ctx.config.method {
        InstallMethod::Package => "incus".to_string(),
        InstallMethod::Source => ctx
            .root
            .resolve(ctx.config.source.bin_dir().join("incus"))
            .display()
            .to_string(),
    }
}

pub fn verify_installation() -> FnStage {
    FnStage::new(
        "verify",
        "Check that the client can talk to the daemon",
        |ctx| {
            let output = ctx.run(
                CommandSpec::new(client(ctx))
                    .arg("version")
                    .expect_stdout("Server version"),
            );
            match output {
                Ok(out) => {
                    for line in out.stdout.lines() {
                        println!("  {}", line.trim());
                    }
                    Ok(())
                }
                Err(e) => Err(InstallError::verification(
                    "incus daemon",
                    format!("client cannot reach the daemon: {}", e),
                )
                .with_hint(format!(
                    "journalctl -u {} --no-pager -n 50",
                    ctx.config.service.unit_name
                ))),
            }
        },
    )
    .verify(|ctx| {
        if ctx.succeeds(CommandSpec::new(client(ctx)).args(["list", "--format", "csv"])) {
            Ok(())
        } else {
            Err(InstallError::verification("incus list", "client request failed")
                .with_hint("incus list --debug"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallationConfig;
    use crate::host::{HostRoot, OsFamily};
    use crate::pipeline::rollback::RollbackJournal;
    use crate::runner::mock::MockRunner;
    use crate::stage::Stage;

    #[test]
    fn test_client_without_server_fails() {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        let runner = MockRunner::new();
        runner.reply("incus version", "Client version: 6.0.3\n");
        let mut journal = RollbackJournal::default();
        let mut ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };
        let err = verify_installation().action(&mut ctx).unwrap_err();
        assert_eq!(err.kind(), "verification");
    }

    #[test]
    fn test_server_version_passes() {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        let runner = MockRunner::new();
        runner.reply("incus version", "Client version: 6.0.3\nServer version: 6.0.3\n");
        let mut journal = RollbackJournal::default();
        let mut ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };
        let stage = verify_installation();
        stage.action(&mut ctx).unwrap();
        stage.postcondition(&ctx).unwrap();
    }
}
