//! First-time daemon configuration from the preseed document.

use crate::error::InstallError;
use crate::preseed::{self, POOL_NAME};
use crate::runner::CommandSpec;
use crate::stage::{FnStage, StageContext};

fn incus(args: &[&str]) -> CommandSpec {
    CommandSpec::new("incus").args(args.iter().copied())
}

fn pool_exists(ctx: &StageContext<'_>) -> bool {
    ctx.succeeds(incus(&["storage", "show", POOL_NAME]))
}

fn network_exists(ctx: &StageContext<'_>) -> bool {
    ctx.succeeds(incus(&["network", "show", ctx.config.bridge_name.as_str()]))
}

pub fn initialize() -> FnStage {
    FnStage::new(
        "initialize",
        "Apply the preseed configuration (storage pool, bridge, default profile)",
        |ctx| {
            let pool = pool_exists(ctx);
            let network = network_exists(ctx);
            if pool {
                println!("  Storage pool '{}' already exists; leaving it as is", POOL_NAME);
            }
            if network {
                println!(
                    "  Network '{}' already exists; leaving it as is",
                    ctx.config.bridge_name
                );
            }
            let document = preseed::generate(ctx.config).only_missing(pool, network);
            let yaml = document.to_yaml().map_err(|e| {
                InstallError::Config(format!("serializing preseed document: {}", e))
            })?;
            tracing::debug!(preseed = %yaml, "preseed document");
            ctx.run(incus(&["admin", "init", "--preseed"]).stdin(yaml))?;
            Ok(())
        },
    )
    .skip_if(|ctx| Ok(pool_exists(ctx) && network_exists(ctx)))
    .verify(|ctx| {
        if !pool_exists(ctx) {
            return Err(InstallError::verification(
                format!("storage pool '{}'", POOL_NAME),
                "missing after incus admin init",
            )
            .with_hint("incus storage list"));
        }
        if !network_exists(ctx) {
            return Err(InstallError::verification(
                format!("network '{}'", ctx.config.bridge_name),
                "missing after incus admin init",
            )
            .with_hint("incus network list"));
        }
        Ok(())
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
    fn test_preseed_is_piped_to_admin_init() {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        let runner = MockRunner::new();
        runner.fail("incus storage show");
        runner.fail("incus network show");
        let mut journal = RollbackJournal::default();
        let mut ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };

        let stage = initialize();
        assert!(!stage.already_satisfied(&ctx).unwrap());
        stage.action(&mut ctx).unwrap();

        let init = runner
            .specs()
            .into_iter()
            .find(|s| s.command_line() == "incus admin init --preseed")
            .unwrap();
        let stdin = init.stdin.unwrap();
        assert!(stdin.contains("name: incusbr0"));
        assert!(stdin.contains("source: /var/lib/incus/storage-pools/default"));
    }

    #[test]
    fn test_missing_pool_fails_verification() {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        let runner = MockRunner::new();
        runner.fail("incus storage show");
        let mut journal = RollbackJournal::default();
        let ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };
        let err = initialize().postcondition(&ctx).unwrap_err();
        assert_eq!(err.hint().as_deref(), Some("incus storage list"));
    }

    #[test]
    fn test_existing_pool_is_left_out_of_preseed() {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        let runner = MockRunner::new();
        runner.fail("incus network show");
        let mut journal = RollbackJournal::default();
        let mut ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };

        let stage = initialize();
        assert!(!stage.already_satisfied(&ctx).unwrap());
        stage.action(&mut ctx).unwrap();

        let init = runner
            .specs()
            .into_iter()
            .find(|s| s.command_line() == "incus admin init --preseed")
            .unwrap();
        let sent: preseed::PreseedDocument =
            serde_yaml::from_str(init.stdin.as_deref().unwrap()).unwrap();
        assert!(sent.storage_pools.is_empty());
        assert_eq!(sent.networks.len(), 1);
        assert_eq!(sent.networks[0].name, "incusbr0");
        assert_eq!(sent.profiles.len(), 1);
    }
}
