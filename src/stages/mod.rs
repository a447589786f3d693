//! Install plans: the ordered stage lists for each method and family.
//!
//! Package method:
//!
//! ```text
//! repository setup → install-incus → host-config → admin-group
//!   → activate-service → initialize → verify
//! ```
//!
//! Source method:
//!
//! ```text
//! refresh-package-index → build-deps → optional-* → prepare-build-dir
//!   → go-toolchain → fetch-source → build-source → install-binaries
//!   → register-library-path → host-config → admin-group → service-unit
//!   → activate-service → initialize → verify → cleanup-build
//! ```
//!
//! `initialize` is present only when the operator asked for it, and
//! `cleanup-build` only when cleanup is configured. Cleanup comes after
//! verification. A failed run removes the build tree during rollback only
//! when that run created it; a pre-existing tree is left in place.

pub mod host;
pub mod init;
pub mod packages;
pub mod repository;
pub mod service;
pub mod source;
pub mod verify;

use crate::config::{InstallMethod, InstallationConfig};
use crate::host::OsFamily;
use crate::pipeline::Pipeline;

pub const PIPELINE_LABEL: &str = "install";

pub fn build_plan(config: &InstallationConfig) -> Pipeline {
    let mut pipeline = Pipeline::new(PIPELINE_LABEL);
    match config.method {
        InstallMethod::Package => push_package_stages(&mut pipeline, config.os_family),
        InstallMethod::Source => push_source_stages(&mut pipeline, config.os_family),
    }

    pipeline.push(host::host_config());
    pipeline.push(host::admin_group());
    if config.method == InstallMethod::Source {
        pipeline.push(service::install_unit());
    }
    pipeline.push(service::activate());
    if config.run_init {
        pipeline.push(init::initialize());
    }
    pipeline.push(verify::verify_installation());
    if config.method == InstallMethod::Source && config.cleanup_build {
        pipeline.push(source::cleanup_build());
    }
    pipeline
}

fn push_package_stages(pipeline: &mut Pipeline, family: OsFamily) {
    let incus_packages: Vec<String> = match family {
        OsFamily::Debian => {
            pipeline.push(repository::zabbly_key());
            pipeline.push(repository::zabbly_source_entry());
            pipeline.push(packages::refresh_index());
            vec!["incus".into()]
        }
        OsFamily::Rhel => {
            pipeline.push(repository::epel());
            pipeline.push(repository::crb());
            pipeline.push(repository::copr());
            vec!["incus".into(), "incus-tools".into()]
        }
    };
    pipeline.push(packages::install_packages(
        "install-incus",
        "Install Incus packages",
        incus_packages,
    ));
}

fn push_source_stages(pipeline: &mut Pipeline, family: OsFamily) {
    pipeline.push(packages::refresh_index());
    pipeline.push(packages::install_packages(
        "build-deps",
        "Install build dependencies",
        packages::build_deps(family)
            .iter()
            .map(|p| p.to_string())
            .collect(),
    ));
    for package in packages::optional_packages(family) {
        pipeline.push(packages::optional_package(package));
    }
    pipeline.push(source::prepare_build_dir());
    pipeline.push(source::go_toolchain());
    pipeline.push(source::fetch_source());
    pipeline.push(source::build_source());
    pipeline.push(source::install_binaries());
    pipeline.push(source::register_library_path());
}
