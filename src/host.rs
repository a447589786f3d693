//! Host filesystem root and distribution detection.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Directory that absolute host paths are resolved under.
///
/// `/` on a real install; a scratch directory in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoot {
    root: PathBuf,
}

impl HostRoot {
    pub fn system() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn is_system(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Map an absolute host path (e.g. `/etc/subuid`) to its location under
    /// this root.
    pub fn resolve(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let relative: PathBuf = host_path
            .as_ref()
            .components()
            .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect();
        self.root.join(relative)
    }
}

/// Package family of the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    Rhel,
}

impl OsFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            OsFamily::Debian => "debian",
            OsFamily::Rhel => "rhel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debian" | "ubuntu" => Some(OsFamily::Debian),
            "rhel" | "centos" | "rocky" | "almalinux" | "fedora" => Some(OsFamily::Rhel),
            _ => None,
        }
    }
}

/// Fields of `/etc/os-release` the installer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
    pub codename: Option<String>,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut release = OsRelease {
            id: String::new(),
            id_like: Vec::new(),
            version_id: None,
            codename: None,
        };
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
            match key.trim() {
                "ID" => release.id = value.to_ascii_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect()
                }
                "VERSION_ID" => release.version_id = Some(value),
                "VERSION_CODENAME" if !value.is_empty() => release.codename = Some(value),
                _ => {}
            }
        }
        release
    }

    pub fn read(root: &HostRoot) -> Result<Self> {
        let path = root.resolve("/etc/os-release");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// Family from `ID`, falling back to `ID_LIKE`.
    pub fn family(&self) -> Option<OsFamily> {
        std::iter::once(&self.id)
            .chain(self.id_like.iter())
            .find_map(|id| OsFamily::parse(id))
    }
}
