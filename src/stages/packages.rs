//! Distribution package manager stages.

use crate::host::OsFamily;
use crate::runner::CommandSpec;
use crate::stage::FnStage;

/// Native build dependencies of the Incus tree, `make deps` included.
pub const DEBIAN_BUILD_DEPS: &[&str] = &[
    "acl",
    "attr",
    "autoconf",
    "automake",
    "build-essential",
    "curl",
    "dnsmasq-base",
    "git",
    "libacl1-dev",
    "libcap-dev",
    "liblxc1",
    "liblxc-dev",
    "liblz4-dev",
    "libseccomp-dev",
    "libselinux1-dev",
    "libsqlite3-dev",
    "libtool",
    "libudev-dev",
    "libuv1-dev",
    "make",
    "patchelf",
    "pkg-config",
    "rsync",
    "squashfs-tools",
    "tar",
    "tcl",
    "xz-utils",
];

pub const RHEL_BUILD_DEPS: &[&str] = &[
    "autoconf",
    "automake",
    "curl",
    "dnsmasq",
    "gcc",
    "git",
    "libacl-devel",
    "libcap-devel",
    "libseccomp-devel",
    "libtool",
    "libuv-devel",
    "lxc-devel",
    "lz4-devel",
    "make",
    "patchelf",
    "pkgconf",
    "rsync",
    "sqlite-devel",
    "squashfs-tools",
    "systemd-devel",
    "tar",
    "tcl",
    "xz",
];

/// Storage and firewall backends. Not every release ships all of them.
pub const DEBIAN_OPTIONAL: &[&str] = &["btrfs-progs", "lvm2", "thin-provisioning-tools", "ebtables"];
pub const RHEL_OPTIONAL: &[&str] = &["btrfs-progs", "lvm2", "device-mapper-persistent-data", "ebtables"];

pub fn build_deps(family: OsFamily) -> &'static [&'static str] {
    match family {
        OsFamily::Debian => DEBIAN_BUILD_DEPS,
        OsFamily::Rhel => RHEL_BUILD_DEPS,
    }
}

pub fn optional_packages(family: OsFamily) -> &'static [&'static str] {
    match family {
        OsFamily::Debian => DEBIAN_OPTIONAL,
        OsFamily::Rhel => RHEL_OPTIONAL,
    }
}

pub fn install_command<S: AsRef<str>>(family: OsFamily, packages: &[S]) -> CommandSpec {
    let packages = packages.iter().map(|p| p.as_ref().to_string());
    match family {
        OsFamily::Debian => CommandSpec::new("apt-get")
            .args(["install", "-y", "--no-install-recommends"])
            .args(packages)
            .env("DEBIAN_FRONTEND", "noninteractive"),
        OsFamily::Rhel => CommandSpec::new("dnf").args(["install", "-y"]).args(packages),
    }
}

/// Succeeds only when every package is installed.
pub fn query_command<S: AsRef<str>>(family: OsFamily, packages: &[S]) -> CommandSpec {
    let packages = packages.iter().map(|p| p.as_ref().to_string());
    match family {
        OsFamily::Debian => CommandSpec::new("dpkg").arg("-s").args(packages),
        OsFamily::Rhel => CommandSpec::new("rpm").arg("-q").args(packages),
    }
}

pub fn refresh_command(family: OsFamily) -> CommandSpec {
    match family {
        OsFamily::Debian => CommandSpec::new("apt-get")
            .arg("update")
            .env("DEBIAN_FRONTEND", "noninteractive"),
        OsFamily::Rhel => CommandSpec::new("dnf").arg("makecache"),
    }
}

pub fn refresh_index() -> FnStage {
    FnStage::new("refresh-package-index", "Refresh the package index", |ctx| {
        ctx.run(refresh_command(ctx.config.os_family))?;
        Ok(())
    })
}

/// Fatal stage installing every package in `packages`.
pub fn install_packages(name: &str, intent: &str, packages: Vec<String>) -> FnStage {
    let check = packages.clone();
    let verify = packages.clone();
    let stage_name = name.to_string();
    FnStage::new(name, intent, move |ctx| {
        ctx.run(install_command(ctx.config.os_family, &packages))?;
        Ok(())
    })
    .skip_if(move |ctx| Ok(ctx.succeeds(query_command(ctx.config.os_family, &check))))
    .verify(move |ctx| {
        if ctx.succeeds(query_command(ctx.config.os_family, &verify)) {
            Ok(())
        } else {
            Err(crate::error::InstallError::verification(
                stage_name.clone(),
                format!("packages not installed after install: {}", verify.join(" ")),
            ))
        }
    })
}

/// Warning stage for a single package that may be unavailable.
pub fn optional_package(package: &str) -> FnStage {
    let pkg = package.to_string();
    let check = pkg.clone();
    FnStage::new(
        format!("optional-{}", package),
        format!("Install optional package {}", package),
        move |ctx| {
            ctx.run(install_command(ctx.config.os_family, &[pkg.as_str()]))?;
            Ok(())
        },
    )
    .warning()
    .skip_if(move |ctx| Ok(ctx.succeeds(query_command(ctx.config.os_family, &[check.as_str()]))))
}
