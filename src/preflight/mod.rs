//! Preflight checks run before any stage.
//!
//! Privilege is checked first, then the host tools the chosen plan needs
//! before it can install anything else. Build tools (`git`, `make`,
//! `patchelf`) are not listed here: the dependency stage installs them.

use crate::config::InstallMethod;
use crate::error::{InstallError, MissingTool};
use crate::host::OsFamily;
use crate::runner::CommandRunner;

/// Each tuple is (command_name, package_name).
const COMMON_TOOLS: &[(&str, &str)] = &[("systemctl", "systemd"), ("curl", "curl")];
const DEBIAN_TOOLS: &[(&str, &str)] = &[("apt-get", "apt"), ("dpkg", "dpkg")];
const RHEL_TOOLS: &[(&str, &str)] = &[("dnf", "dnf"), ("rpm", "rpm")];

/// Tools the installer needs for `method` on a `family` host.
pub fn required_tools(family: OsFamily, method: InstallMethod) -> Vec<(&'static str, &'static str)> {
    let mut tools: Vec<_> = COMMON_TOOLS.to_vec();
    match family {
        OsFamily::Debian => tools.extend_from_slice(DEBIAN_TOOLS),
        OsFamily::Rhel => tools.extend_from_slice(RHEL_TOOLS),
    }
    if method == InstallMethod::Source {
        let libc = match family {
            OsFamily::Debian => "libc-bin",
            OsFamily::Rhel => "glibc",
        };
        tools.push(("ldconfig", libc));
    }
    tools
}

/// Fail with [`InstallError::Privilege`] unless running as root.
pub fn check_privilege() -> Result<(), InstallError> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(InstallError::Privilege(format!(
            "the installer must run as root (effective uid is {})",
            euid
        )));
    }
    Ok(())
}

/// Check that specific tools are available.
pub fn check_required_tools(
    runner: &dyn CommandRunner,
    tools: &[(&str, &str)],
) -> Result<(), InstallError> {
    let missing: Vec<MissingTool> = tools
        .iter()
        .filter(|(tool, _)| !runner.tool_exists(tool))
        .map(|(tool, package)| MissingTool {
            tool: tool.to_string(),
            package: package.to_string(),
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(InstallError::ToolMissing(missing))
    }
}

pub fn check_host_tools(
    runner: &dyn CommandRunner,
    family: OsFamily,
    method: InstallMethod,
) -> Result<(), InstallError> {
    check_required_tools(runner, &required_tools(family, method))
}
