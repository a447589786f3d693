//! systemd unit installation and activation of the Incus daemon.

use std::path::PathBuf;

use crate::config::InstallationConfig;
use crate::error::InstallError;
use crate::mutate::{self, MutationOutcome};
use crate::pipeline::rollback::RollbackAction;
use crate::runner::CommandSpec;
use crate::stage::{FnStage, StageContext};

use super::host::ADMIN_GROUP;

pub const UNIT_DIR: &str = "/etc/systemd/system";

pub fn unit_path(config: &InstallationConfig) -> PathBuf {
    PathBuf::from(UNIT_DIR).join(config.service.unit_file_name())
}

/// Unit for a daemon installed under the source prefix.
pub fn render_unit(config: &InstallationConfig) -> String {
    let incusd = config.source.bin_dir().join("incusd");
    format!(
        "[Unit]\n\
         Description=Incus - Daemon\n\
         Documentation=https://linuxcontainers.org/incus/docs/main/\n\
         After=network-online.target lxcfs.service\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={daemon} --group {group}\n\
         ExecStartPost={daemon} waitready --timeout=600\n\
         KillMode=process\n\
         Delegate=yes\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         TimeoutStartSec=600\n\
         TimeoutStopSec=30\n\
         LimitNOFILE=infinity\n\
         LimitNPROC=infinity\n\
         TasksMax=infinity\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        daemon = incusd.display(),
        group = ADMIN_GROUP,
    )
}

fn unit_mutation(config: &InstallationConfig) -> mutate::Mutation {
    mutate::file_mode(unit_path(config), render_unit(config), 0o644)
}

fn systemctl(args: &[&str]) -> CommandSpec {
    CommandSpec::new("systemctl").args(args.iter().copied())
}

pub fn install_unit() -> FnStage {
    FnStage::new("service-unit", "Install the incus systemd unit", |ctx| {
        mutate::ensure(ctx.root, &mutate::dir(UNIT_DIR))?;
        let outcome = mutate::ensure(ctx.root, &unit_mutation(ctx.config))?;
        if outcome == MutationOutcome::Created {
            ctx.record(RollbackAction::DaemonReload);
            ctx.record(RollbackAction::RemoveFile(unit_path(ctx.config)));
        }
        ctx.run(systemctl(&["daemon-reload"]))?;
        Ok(())
    })
    .skip_if(|ctx| Ok(mutate::is_satisfied(ctx.root, &unit_mutation(ctx.config))?))
}

fn is_active(ctx: &StageContext<'_>) -> bool {
    let unit = ctx.config.service.unit_name.as_str();
    ctx.succeeds(systemctl(&["is-active", unit]).expect_stdout("active"))
}

fn is_enabled(ctx: &StageContext<'_>) -> bool {
    let unit = ctx.config.service.unit_name.as_str();
    ctx.succeeds(systemctl(&["is-enabled", unit]))
}

pub fn activate() -> FnStage {
    FnStage::new(
        "activate-service",
        "Enable and start the incus service",
        |ctx| {
            let unit = ctx.config.service.unit_name.clone();
            // journal first: a failed start may leave the unit restarting
            if !is_enabled(ctx) {
                ctx.record(RollbackAction::DisableService(unit.clone()));
                ctx.run(systemctl(&["enable", unit.as_str()]))?;
            }
            if !is_active(ctx) {
                ctx.record(RollbackAction::StopService(unit.clone()));
                ctx.run(systemctl(&["start", unit.as_str()]))?;
            }
            println!(
                "  Waiting {}s for {} to settle",
                ctx.config.service.settle_secs, unit
            );
            ctx.pause(std::time::Duration::from_secs(ctx.config.service.settle_secs));
            Ok(())
        },
    )
    .skip_if(|ctx| Ok(is_enabled(ctx) && is_active(ctx)))
    .verify(|ctx| {
        if is_active(ctx) {
            return Ok(());
        }
        let unit = &ctx.config.service.unit_name;
        Err(
            InstallError::verification(format!("{}.service", unit), "unit is not active after start")
                .with_hint(format!("journalctl -u {} --no-pager -n 50", unit)),
        )
    })
}
