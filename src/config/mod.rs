//! Installation configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! command-line overrides, then interactive answers. The layers are merged
//! into a [`ConfigDraft`]; once the operator has answered every prompt and
//! the storage directory has been prepared, [`ConfigDraft::finish`] produces
//! the immutable [`InstallationConfig`] handed to every stage.

pub mod prompt;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::InstallError;
use crate::host::{OsFamily, OsRelease};
use prompt::Prompter;

pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/incus/storage-pools/default";
pub const DEFAULT_BRIDGE: &str = "incusbr0";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/incus-installer";
pub const DEFAULT_BUILD_DIR: &str = "/usr/local/src/incus-build";
pub const DEFAULT_PREFIX: &str = "/usr/local";
pub const DEFAULT_GO_VERSION: &str = "1.23.4";
pub const DEFAULT_REPOSITORY: &str = "https://github.com/lxc/incus";

/// Linux interface names are limited to 15 bytes.
const MAX_BRIDGE_NAME: usize = 15;

/// How Incus gets onto the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InstallMethod {
    /// Distribution packages from the Zabbly (Debian) or COPR (RHEL) repository.
    Package,
    /// Build from the upstream git repository.
    Source,
}

impl InstallMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallMethod::Package => "package",
            InstallMethod::Source => "source",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchSettings {
    pub max_retries: u32,
    pub backoff_secs: u64,
    pub timeout_secs: u64,
}

impl FetchSettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_secs: 2,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSettings {
    /// Git remotes for the Incus tree, most preferred first.
    pub repositories: Vec<String>,
    pub branch: Option<String>,
    pub build_dir: PathBuf,
    pub prefix: PathBuf,
    pub go_version: String,
    /// Base URLs serving `go<version>.linux-<arch>.tar.gz`.
    pub go_mirrors: Vec<String>,
    pub go_sha256: Option<String>,
}

impl SourceSettings {
    pub fn checkout_dir(&self) -> PathBuf {
        self.build_dir.join("incus")
    }

    pub fn gopath(&self) -> PathBuf {
        self.build_dir.join("go")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.build_dir.join("downloads")
    }

    /// Extraction target of the Go archive; the toolchain lands in `go/`.
    pub fn toolchain_dir(&self) -> PathBuf {
        self.build_dir.join("toolchain")
    }

    pub fn go_root(&self) -> PathBuf {
        self.toolchain_dir().join("go")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.prefix.join("lib/incus")
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            repositories: vec![DEFAULT_REPOSITORY.to_string()],
            branch: None,
            build_dir: PathBuf::from(DEFAULT_BUILD_DIR),
            prefix: PathBuf::from(DEFAULT_PREFIX),
            go_version: DEFAULT_GO_VERSION.to_string(),
            go_mirrors: vec![
                "https://go.dev/dl".to_string(),
                "https://dl.google.com/go".to_string(),
            ],
            go_sha256: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSettings {
    pub unit_name: String,
    /// Crude readiness wait after starting the daemon.
    pub settle_secs: u64,
}

impl ServiceSettings {
    pub fn unit_file_name(&self) -> String {
        format!("{}.service", self.unit_name)
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            unit_name: "incus".to_string(),
            settle_secs: 5,
        }
    }
}

/// Resolved parameters of one installer run. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallationConfig {
    pub os_family: OsFamily,
    pub codename: Option<String>,
    pub method: InstallMethod,
    pub storage_path: PathBuf,
    pub run_init: bool,
    pub bridge_name: String,
    pub cleanup_build: bool,
    pub state_dir: PathBuf,
    pub fetch: FetchSettings,
    pub source: SourceSettings,
    pub service: ServiceSettings,
}

impl InstallationConfig {
    /// Defaults for a host of `os_family`; mainly useful for tests and the
    /// `preseed` subcommand.
    pub fn defaults(os_family: OsFamily) -> Self {
        Self {
            os_family,
            codename: None,
            method: InstallMethod::Package,
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            run_init: true,
            bridge_name: DEFAULT_BRIDGE.to_string(),
            cleanup_build: false,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            fetch: FetchSettings::default(),
            source: SourceSettings::default(),
            service: ServiceSettings::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TOML file layer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub os_family: Option<String>,
    pub codename: Option<String>,
    pub method: Option<InstallMethod>,
    pub storage_path: Option<PathBuf>,
    pub run_init: Option<bool>,
    pub bridge_name: Option<String>,
    pub cleanup_build: Option<bool>,
    pub state_dir: Option<PathBuf>,
    pub fetch: Option<FetchToml>,
    pub source: Option<SourceToml>,
    pub service: Option<ServiceToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchToml {
    pub max_retries: Option<u32>,
    pub backoff_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceToml {
    pub repositories: Option<Vec<String>>,
    pub branch: Option<String>,
    pub build_dir: Option<PathBuf>,
    pub prefix: Option<PathBuf>,
    pub go_version: Option<String>,
    pub go_mirrors: Option<Vec<String>>,
    pub go_sha256: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceToml {
    pub unit_name: Option<String>,
    pub settle_secs: Option<u64>,
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading installer config '{}'", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("parsing installer config '{}'", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Command-line layer
// ─────────────────────────────────────────────────────────────────────────────

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub os_family: Option<OsFamily>,
    pub method: Option<InstallMethod>,
    pub storage_path: Option<PathBuf>,
    pub run_init: Option<bool>,
    pub bridge_name: Option<String>,
    pub cleanup_build: Option<bool>,
    pub state_dir: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Draft
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration under construction. Tracks which answers were given
/// explicitly so prompts only ask for the rest.
#[derive(Debug, Clone)]
pub struct ConfigDraft {
    pub os_family: Option<OsFamily>,
    pub codename: Option<String>,
    pub method: InstallMethod,
    pub storage_path: PathBuf,
    pub storage_path_explicit: bool,
    pub run_init: bool,
    pub run_init_explicit: bool,
    pub bridge_name: String,
    pub cleanup_build: bool,
    pub state_dir: PathBuf,
    pub fetch: FetchSettings,
    pub source: SourceSettings,
    pub service: ServiceSettings,
}

impl ConfigDraft {
    /// Built-in defaults, with OS family and codename taken from
    /// `/etc/os-release` when it could be read.
    pub fn new(release: Option<&OsRelease>) -> Self {
        Self {
            os_family: release.and_then(OsRelease::family),
            codename: release.and_then(|r| r.codename.clone()),
            method: InstallMethod::Package,
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            storage_path_explicit: false,
            run_init: true,
            run_init_explicit: false,
            bridge_name: DEFAULT_BRIDGE.to_string(),
            cleanup_build: false,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            fetch: FetchSettings::default(),
            source: SourceSettings::default(),
            service: ServiceSettings::default(),
        }
    }

    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), InstallError> {
        if let Some(family) = file.os_family {
            self.os_family = Some(OsFamily::parse(&family).ok_or_else(|| {
                InstallError::Config(format!("unsupported os_family '{}'", family))
            })?);
        }
        if let Some(codename) = file.codename {
            self.codename = Some(codename);
        }
        if let Some(method) = file.method {
            self.method = method;
        }
        if let Some(path) = file.storage_path {
            self.storage_path = path;
            self.storage_path_explicit = true;
        }
        if let Some(run_init) = file.run_init {
            self.run_init = run_init;
            self.run_init_explicit = true;
        }
        if let Some(bridge) = file.bridge_name {
            self.bridge_name = bridge;
        }
        if let Some(cleanup) = file.cleanup_build {
            self.cleanup_build = cleanup;
        }
        if let Some(state_dir) = file.state_dir {
            self.state_dir = state_dir;
        }
        if let Some(fetch) = file.fetch {
            if let Some(v) = fetch.max_retries {
                self.fetch.max_retries = v;
            }
            if let Some(v) = fetch.backoff_secs {
                self.fetch.backoff_secs = v;
            }
            if let Some(v) = fetch.timeout_secs {
                self.fetch.timeout_secs = v;
            }
        }
        if let Some(source) = file.source {
            if let Some(v) = source.repositories {
                self.source.repositories = v;
            }
            if source.branch.is_some() {
                self.source.branch = source.branch;
            }
            if let Some(v) = source.build_dir {
                self.source.build_dir = v;
            }
            if let Some(v) = source.prefix {
                self.source.prefix = v;
            }
            if let Some(v) = source.go_version {
                self.source.go_version = v;
            }
            if let Some(v) = source.go_mirrors {
                self.source.go_mirrors = v;
            }
            if source.go_sha256.is_some() {
                self.source.go_sha256 = source.go_sha256;
            }
        }
        if let Some(service) = file.service {
            if let Some(v) = service.unit_name {
                self.service.unit_name = v;
            }
            if let Some(v) = service.settle_secs {
                self.service.settle_secs = v;
            }
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(family) = overrides.os_family {
            self.os_family = Some(family);
        }
        if let Some(method) = overrides.method {
            self.method = method;
        }
        if let Some(path) = &overrides.storage_path {
            self.storage_path = path.clone();
            self.storage_path_explicit = true;
        }
        if let Some(run_init) = overrides.run_init {
            self.run_init = run_init;
            self.run_init_explicit = true;
        }
        if let Some(bridge) = &overrides.bridge_name {
            self.bridge_name = bridge.clone();
        }
        if let Some(cleanup) = overrides.cleanup_build {
            self.cleanup_build = cleanup;
        }
        if let Some(state_dir) = &overrides.state_dir {
            self.state_dir = state_dir.clone();
        }
    }

    /// Ask the operator for everything not given explicitly.
    ///
    /// The proceed question comes first; declining it returns
    /// [`InstallError::UserAbort`] before anything else happens.
    pub fn prompt(&mut self, prompter: &mut dyn Prompter) -> Result<(), InstallError> {
        let proceed = prompter.confirm(
            &format!(
                "Install Incus ({} method) on this {} host?",
                self.method.as_str(),
                self.os_family.map(OsFamily::as_str).unwrap_or("unknown")
            ),
            false,
        )?;
        if !proceed {
            return Err(InstallError::UserAbort);
        }

        if !self.run_init_explicit {
            self.run_init = prompter.confirm(
                "Run initial configuration (incus admin init) after installing?",
                true,
            )?;
        }

        if self.run_init && !self.storage_path_explicit {
            let answer = prompter.ask(
                "Directory for the default storage pool",
                &self.storage_path.display().to_string(),
            )?;
            self.storage_path = PathBuf::from(answer.trim());
        }
        Ok(())
    }

    /// Check the draft without touching the host.
    pub fn validate(&self) -> Result<OsFamily, InstallError> {
        let os_family = self.os_family.ok_or_else(|| {
            InstallError::Config(
                "could not determine the distribution family; pass --os-family debian|rhel"
                    .to_string(),
            )
        })?;
        if !self.storage_path.is_absolute() {
            return Err(InstallError::Config(format!(
                "storage path '{}' must be absolute",
                self.storage_path.display()
            )));
        }
        if self.bridge_name.is_empty()
            || self.bridge_name.len() > MAX_BRIDGE_NAME
            || self.bridge_name.contains(|c: char| c.is_whitespace() || c == '/')
        {
            return Err(InstallError::Config(format!(
                "bridge name '{}' is not a valid interface name",
                self.bridge_name
            )));
        }
        if self.fetch.max_retries == 0 {
            return Err(InstallError::Config(
                "fetch.max_retries must be at least 1".to_string(),
            ));
        }
        if os_family == OsFamily::Debian
            && self.method == InstallMethod::Package
            && self.codename.is_none()
        {
            return Err(InstallError::Config(
                "package installs on Debian-family hosts need the release codename \
                 (VERSION_CODENAME in /etc/os-release, or `codename` in the config file)"
                    .to_string(),
            ));
        }
        if self.method == InstallMethod::Source && self.source.repositories.is_empty() {
            return Err(InstallError::Config(
                "source.repositories must list at least one git remote".to_string(),
            ));
        }
        Ok(os_family)
    }

    /// Freeze the draft, using `storage_path` as prepared on the host.
    pub fn finish(self, storage_path: PathBuf) -> Result<InstallationConfig, InstallError> {
        let os_family = self.validate()?;
        Ok(InstallationConfig {
            os_family,
            codename: self.codename,
            method: self.method,
            storage_path,
            run_init: self.run_init,
            bridge_name: self.bridge_name,
            cleanup_build: self.cleanup_build,
            state_dir: self.state_dir,
            fetch: self.fetch,
            source: self.source,
            service: self.service,
        })
    }
}
