//! Third-party package repositories carrying Incus.
//!
//! Debian family: the Zabbly stable repository with its signing key.
//! RHEL family: EPEL plus the `neil/incus` COPR.

use std::fs;
use std::path::PathBuf;

use crate::error::InstallError;
use crate::fetch::FetchSpec;
use crate::mutate;
use crate::runner::CommandSpec;
use crate::stage::{FnStage, StageContext};

pub const ZABBLY_KEY_URL: &str = "https://pkgs.zabbly.com/key.asc";
pub const ZABBLY_KEY_PATH: &str = "/etc/apt/keyrings/zabbly.asc";
pub const ZABBLY_SOURCE_PATH: &str = "/etc/apt/sources.list.d/zabbly-incus-stable.sources";
pub const ZABBLY_URI: &str = "https://pkgs.zabbly.com/incus/stable";

pub const COPR_PROJECT: &str = "neil/incus";
pub const COPR_REPO_FILE: &str =
    "/etc/yum.repos.d/_copr:copr.fedorainfracloud.org:neil:incus.repo";

/// deb822 source entry for the Zabbly repository.
pub fn zabbly_source(codename: &str, arch: &str) -> String {
    format!(
        "Enabled: yes\n\
         Types: deb\n\
         URIs: {}\n\
         Suites: {}\n\
         Components: main\n\
         Architectures: {}\n\
         Signed-By: {}\n",
        ZABBLY_URI, codename, arch, ZABBLY_KEY_PATH
    )
}

fn key_present(ctx: &StageContext<'_>) -> bool {
    fs::metadata(ctx.root.resolve(ZABBLY_KEY_PATH))
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

pub fn zabbly_key() -> FnStage {
    FnStage::new("repository-key", "Install the Zabbly repository signing key", |ctx| {
        mutate::ensure(ctx.root, &mutate::dir_mode("/etc/apt/keyrings", 0o755))?;
        let spec = FetchSpec::download(vec![ZABBLY_KEY_URL.to_string()], ZABBLY_KEY_PATH)
            .with_retries(ctx.config.fetch.max_retries)
            .with_timeout(ctx.config.fetch.timeout());
        ctx.fetcher().fetch(&spec)?;
        Ok(())
    })
    .skip_if(|ctx| Ok(key_present(ctx)))
    .verify(|ctx| {
        let content = fs::read_to_string(ctx.root.resolve(ZABBLY_KEY_PATH)).unwrap_or_default();
        if content.contains("BEGIN PGP PUBLIC KEY BLOCK") {
            Ok(())
        } else {
            Err(InstallError::verification(
                ZABBLY_KEY_PATH,
                "downloaded key is not an ASCII-armored PGP public key",
            ))
        }
    })
}

fn zabbly_source_mutation(ctx: &StageContext<'_>) -> Result<mutate::Mutation, InstallError> {
    let codename = ctx.config.codename.as_deref().ok_or_else(|| {
        InstallError::Config("release codename is required for the Zabbly repository".into())
    })?;
    let arch = ctx
        .run(CommandSpec::new("dpkg").arg("--print-architecture"))?
        .stdout
        .trim()
        .to_string();
    Ok(mutate::file_mode(
        PathBuf::from(ZABBLY_SOURCE_PATH),
        zabbly_source(codename, &arch),
        0o644,
    ))
}

pub fn zabbly_source_entry() -> FnStage {
    FnStage::new("repository-source", "Register the Zabbly Incus repository", |ctx| {
        let mutation = zabbly_source_mutation(ctx)?;
        mutate::ensure(ctx.root, &mutate::dir("/etc/apt/sources.list.d"))?;
        mutate::ensure(ctx.root, &mutation)?;
        Ok(())
    })
    .skip_if(|ctx| Ok(mutate::is_satisfied(ctx.root, &zabbly_source_mutation(ctx)?)?))
}

pub fn epel() -> FnStage {
    FnStage::new("enable-epel", "Enable the EPEL repository", |ctx| {
        ctx.run(CommandSpec::new("dnf").args(["install", "-y", "epel-release"]))?;
        Ok(())
    })
    .skip_if(|ctx| Ok(ctx.succeeds(CommandSpec::new("rpm").args(["-q", "epel-release"]))))
}

/// CodeReady Builder carries some -devel packages EPEL depends on. Absent on
/// some rebuilds, so failure only warns.
pub fn crb() -> FnStage {
    FnStage::new("enable-crb", "Enable the CRB repository", |ctx| {
        ctx.run(CommandSpec::new("dnf").args(["config-manager", "--set-enabled", "crb"]))?;
        Ok(())
    })
    .warning()
}

pub fn copr() -> FnStage {
    FnStage::new("enable-copr", "Enable the neil/incus COPR repository", |ctx| {
        ctx.run(CommandSpec::new("dnf").args(["install", "-y", "dnf-plugins-core"]))?;
        ctx.run(CommandSpec::new("dnf").args(["copr", "enable", "-y", COPR_PROJECT]))?;
        Ok(())
    })
    .skip_if(|ctx| Ok(ctx.root.resolve(COPR_REPO_FILE).is_file()))
}
