//! Host configuration shared by both install methods.

use crate::error::InstallError;
use crate::host::HostRoot;
use crate::mutate::{self, Mutation};
use crate::runner::CommandSpec;
use crate::stage::FnStage;

pub const SYSCTL_PATH: &str = "/etc/sysctl.d/99-incus.conf";
pub const ADMIN_GROUP: &str = "incus-admin";

/// Subordinate id range handed to root for unprivileged containers.
pub const ID_RANGE_START: u64 = 1_000_000;
pub const ID_RANGE_COUNT: u64 = 1_000_000_000;

/// Forwarding keys persisted in [`SYSCTL_PATH`].
pub fn sysctl_mutations() -> Vec<Mutation> {
    vec![
        mutate::sysctl(SYSCTL_PATH, "net.ipv4.ip_forward", "1"),
        mutate::sysctl(SYSCTL_PATH, "net.ipv6.conf.all.forwarding", "1"),
    ]
}

pub fn id_range_mutations() -> Vec<Mutation> {
    vec![
        mutate::id_range("/etc/subuid", "root", ID_RANGE_START, ID_RANGE_COUNT),
        mutate::id_range("/etc/subgid", "root", ID_RANGE_START, ID_RANGE_COUNT),
    ]
}

pub fn host_mutations() -> Vec<Mutation> {
    let mut mutations = vec![mutate::dir("/etc/sysctl.d")];
    mutations.extend(sysctl_mutations());
    mutations.extend(id_range_mutations());
    mutations
}

/// Apply the forwarding keys; true when the file changed and needs loading.
fn apply_sysctl(root: &HostRoot) -> Result<bool, InstallError> {
    mutate::ensure(root, &mutate::dir("/etc/sysctl.d"))?;
    let outcomes = mutate::ensure_all(root, &sysctl_mutations())?;
    Ok(outcomes.iter().any(|o| o.changed_anything()))
}

pub fn host_config() -> FnStage {
    FnStage::new(
        "host-config",
        "Enable IP forwarding and subordinate id ranges for root",
        |ctx| {
            if apply_sysctl(ctx.root)? {
                ctx.run(CommandSpec::new("sysctl").args(["-p", SYSCTL_PATH]))?;
            }
            mutate::ensure_all(ctx.root, &id_range_mutations())?;
            Ok(())
        },
    )
    .skip_if(|ctx| Ok(mutate::all_satisfied(ctx.root, &host_mutations())?))
    .verify(|ctx| {
        for mutation in host_mutations() {
            if !mutate::is_satisfied(ctx.root, &mutation)? {
                return Err(InstallError::verification(
                    mutation.resource().display().to_string(),
                    format!("{} not in place after applying it", mutation),
                ));
            }
        }
        Ok(())
    })
}

fn group_exists_cmd() -> CommandSpec {
    CommandSpec::new("getent").args(["group", ADMIN_GROUP])
}

pub fn admin_group() -> FnStage {
    FnStage::new(
        "admin-group",
        "Create the incus-admin group for daemon access",
        |ctx| {
            ctx.run(CommandSpec::new("groupadd").args(["--system", ADMIN_GROUP]))?;
            Ok(())
        },
    )
    .skip_if(|ctx| Ok(ctx.succeeds(group_exists_cmd())))
    .verify(|ctx| {
        if ctx.succeeds(group_exists_cmd()) {
            Ok(())
        } else {
            Err(InstallError::verification(ADMIN_GROUP, "group does not exist")
                .with_hint(format!("getent group {}", ADMIN_GROUP)))
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
    use crate::stage::{Stage, StageContext};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_host_config_applies_once() {
        let temp = TempDir::new().unwrap();
        let root = HostRoot::new(temp.path());
        fs::create_dir_all(root.resolve("/etc")).unwrap();
        fs::write(root.resolve("/etc/subuid"), "alice:100000:65536\n").unwrap();

        let config = InstallationConfig::defaults(OsFamily::Rhel);
        let runner = MockRunner::new();
        let mut journal = RollbackJournal::default();
        let mut ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };

        let stage = host_config();
        assert!(!stage.already_satisfied(&ctx).unwrap());
        stage.action(&mut ctx).unwrap();
        stage.postcondition(&ctx).unwrap();
        assert!(stage.already_satisfied(&ctx).unwrap());

        let subuid = fs::read_to_string(root.resolve("/etc/subuid")).unwrap();
        assert_eq!(subuid, "alice:100000:65536\nroot:1000000:1000000000\n");
        let sysctl = fs::read_to_string(root.resolve(SYSCTL_PATH)).unwrap();
        assert!(sysctl.contains("net.ipv4.ip_forward = 1"));
        assert!(sysctl.contains("net.ipv6.conf.all.forwarding = 1"));
        assert_eq!(runner.calls(), vec!["sysctl -p /etc/sysctl.d/99-incus.conf"]);

        // a second application changes nothing and reloads nothing
        stage.action(&mut ctx).unwrap();
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_sysctl_reload_follows_sysctl_changes_only() {
        let temp = TempDir::new().unwrap();
        let root = HostRoot::new(temp.path());
        fs::create_dir_all(root.resolve("/etc")).unwrap();

        assert!(apply_sysctl(&root).unwrap());
        assert!(!apply_sysctl(&root).unwrap());

        // id ranges missing while forwarding is in place: no reload
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let runner = MockRunner::new();
        let mut journal = RollbackJournal::default();
        let mut ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };
        host_config().action(&mut ctx).unwrap();
        assert!(runner.calls().is_empty());
        assert!(root.resolve("/etc/subgid").is_file());

        // a drifted key is rewritten and reloaded
        fs::write(root.resolve(SYSCTL_PATH), "net.ipv4.ip_forward = 0\n").unwrap();
        host_config().action(&mut ctx).unwrap();
        assert_eq!(runner.calls(), vec!["sysctl -p /etc/sysctl.d/99-incus.conf"]);
    }

    #[test]
    fn test_admin_group_skipped_when_present() {
        let config = InstallationConfig::defaults(OsFamily::Debian);
        let root = HostRoot::new("/nonexistent");
        let runner = MockRunner::new();
        runner.reply("getent group", "incus-admin:x:990:\n");
        let mut journal = RollbackJournal::default();
        let ctx = StageContext {
            config: &config,
            runner: &runner,
            root: &root,
            journal: &mut journal,
        };
        assert!(admin_group().already_satisfied(&ctx).unwrap());
    }
}
