//! Idempotent mutation of host resources.
//!
//! A [`Mutation`] describes WHAT state a resource must reach; [`ensure`]
//! inspects the resource and writes only when the state does not already
//! hold. Applying the same mutation twice leaves the resource exactly as
//! applying it once did, and the second call reports
//! [`MutationOutcome::AlreadySatisfied`].
//!
//! All paths are absolute host paths, resolved under a [`HostRoot`].
//!
//! # Example
//!
//! ```rust,ignore
//! use incus_installer::mutate::{self, Mutation};
//!
//! let root = HostRoot::system();
//! mutate::ensure(&root, &mutate::sysctl("/etc/sysctl.d/99-incus.conf", "net.ipv4.ip_forward", "1"))?;
//! mutate::ensure(&root, &mutate::id_range("/etc/subuid", "root", 1_000_000, 1_000_000_000))?;
//! ```

pub mod files;
pub mod idmap;
pub mod sysctl;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::MutationError;
use crate::host::HostRoot;

/// Declarative change to a single host resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Directory exists (optionally with this mode).
    Dir { path: PathBuf, mode: Option<u32> },

    /// File has exactly this content (optionally with this mode).
    File {
        path: PathBuf,
        content: String,
        mode: Option<u32>,
    },

    /// File contains this line.
    Line { path: PathBuf, line: String },

    /// `key = value` assignment in a sysctl-style file.
    Sysctl {
        path: PathBuf,
        key: String,
        value: String,
    },

    /// `owner:start:count` entry in a subordinate id table.
    IdRange {
        path: PathBuf,
        owner: String,
        start: u64,
        count: u64,
    },

    /// Nothing exists at this path.
    Absent { path: PathBuf },
}

/// What [`ensure`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The resource did not exist and was created.
    Created,
    /// The resource existed and was modified.
    Changed,
    /// Nothing to do.
    AlreadySatisfied,
}

impl MutationOutcome {
    pub fn changed_anything(self) -> bool {
        !matches!(self, MutationOutcome::AlreadySatisfied)
    }
}

impl Mutation {
    /// Host path of the resource this mutation targets.
    pub fn resource(&self) -> &Path {
        match self {
            Mutation::Dir { path, .. }
            | Mutation::File { path, .. }
            | Mutation::Line { path, .. }
            | Mutation::Sysctl { path, .. }
            | Mutation::IdRange { path, .. }
            | Mutation::Absent { path } => path,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Dir { path, .. } => write!(f, "directory {}", path.display()),
            Mutation::File { path, .. } => write!(f, "file {}", path.display()),
            Mutation::Line { path, line } => write!(f, "line '{}' in {}", line, path.display()),
            Mutation::Sysctl { path, key, value } => {
                write!(f, "{} = {} in {}", key, value, path.display())
            }
            Mutation::IdRange {
                path,
                owner,
                start,
                count,
            } => write!(f, "{}:{}:{} in {}", owner, start, count, path.display()),
            Mutation::Absent { path } => write!(f, "absence of {}", path.display()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable mutation lists
// ─────────────────────────────────────────────────────────────────────────────

pub fn dir(path: impl Into<PathBuf>) -> Mutation {
    Mutation::Dir {
        path: path.into(),
        mode: None,
    }
}

pub fn dir_mode(path: impl Into<PathBuf>, mode: u32) -> Mutation {
    Mutation::Dir {
        path: path.into(),
        mode: Some(mode),
    }
}

pub fn file(path: impl Into<PathBuf>, content: impl Into<String>) -> Mutation {
    Mutation::File {
        path: path.into(),
        content: content.into(),
        mode: None,
    }
}

pub fn file_mode(path: impl Into<PathBuf>, content: impl Into<String>, mode: u32) -> Mutation {
    Mutation::File {
        path: path.into(),
        content: content.into(),
        mode: Some(mode),
    }
}

pub fn line(path: impl Into<PathBuf>, line: impl Into<String>) -> Mutation {
    Mutation::Line {
        path: path.into(),
        line: line.into(),
    }
}

pub fn sysctl(path: impl Into<PathBuf>, key: impl Into<String>, value: impl Into<String>) -> Mutation {
    Mutation::Sysctl {
        path: path.into(),
        key: key.into(),
        value: value.into(),
    }
}

pub fn id_range(path: impl Into<PathBuf>, owner: impl Into<String>, start: u64, count: u64) -> Mutation {
    Mutation::IdRange {
        path: path.into(),
        owner: owner.into(),
        start,
        count,
    }
}

pub fn absent(path: impl Into<PathBuf>) -> Mutation {
    Mutation::Absent { path: path.into() }
}

/// Bring the resource to the described state if it is not there already.
pub fn ensure(root: &HostRoot, mutation: &Mutation) -> Result<MutationOutcome, MutationError> {
    let outcome = match mutation {
        Mutation::Dir { path, mode } => files::ensure_dir(&root.resolve(path), *mode)?,
        Mutation::File {
            path,
            content,
            mode,
        } => files::ensure_file(&root.resolve(path), content, *mode)?,
        Mutation::Line { path, line } => files::ensure_line(&root.resolve(path), line)?,
        Mutation::Sysctl { path, key, value } => {
            sysctl::ensure_sysctl(&root.resolve(path), key, value)?
        }
        Mutation::IdRange {
            path,
            owner,
            start,
            count,
        } => idmap::ensure_id_range(&root.resolve(path), owner, *start, *count)?,
        Mutation::Absent { path } => files::ensure_absent(&root.resolve(path))?,
    };
    tracing::debug!(mutation = %mutation, ?outcome, "ensured");
    Ok(outcome)
}

/// Whether the resource already has the described state. Never writes.
pub fn is_satisfied(root: &HostRoot, mutation: &Mutation) -> Result<bool, MutationError> {
    match mutation {
        Mutation::Dir { path, mode } => files::dir_satisfied(&root.resolve(path), *mode),
        Mutation::File {
            path,
            content,
            mode,
        } => files::file_satisfied(&root.resolve(path), content, *mode),
        Mutation::Line { path, line } => files::line_satisfied(&root.resolve(path), line),
        Mutation::Sysctl { path, key, value } => {
            Ok(sysctl::read_sysctl(&root.resolve(path), key)?.as_deref() == Some(value.as_str()))
        }
        Mutation::IdRange {
            path,
            owner,
            start,
            count,
        } => Ok(idmap::read_id_ranges(&root.resolve(path), owner)?.contains(&(*start, *count))),
        Mutation::Absent { path } => {
            let full = root.resolve(path);
            Ok(!full.exists() && !full.is_symlink())
        }
    }
}

/// Apply a list of mutations in order, stopping at the first failure.
pub fn ensure_all(
    root: &HostRoot,
    mutations: &[Mutation],
) -> Result<Vec<MutationOutcome>, MutationError> {
    mutations.iter().map(|m| ensure(root, m)).collect()
}

pub fn all_satisfied(root: &HostRoot, mutations: &[Mutation]) -> Result<bool, MutationError> {
    for mutation in mutations {
        if !is_satisfied(root, mutation)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn temp_root() -> (TempDir, HostRoot) {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc/sysctl.d")).unwrap();
        let root = HostRoot::new(temp.path());
        (temp, root)
    }

    #[test]
    fn test_ensure_twice_is_noop() {
        let (_temp, root) = temp_root();
        let mutations = [
            dir("/var/lib/incus"),
            file("/etc/ld.so.conf.d/incus.conf", "/usr/local/lib/incus\n"),
            line("/etc/modules-load.d/incus.conf", "br_netfilter"),
            sysctl("/etc/sysctl.d/99-incus.conf", "net.ipv4.ip_forward", "1"),
            id_range("/etc/subuid", "root", 1_000_000, 1_000_000_000),
            absent("/etc/apt/sources.list.d/old-incus.list"),
        ];
        fs::create_dir_all(root.resolve("/etc/ld.so.conf.d")).unwrap();
        fs::create_dir_all(root.resolve("/etc/modules-load.d")).unwrap();

        ensure_all(&root, &mutations).unwrap();
        let snapshot: Vec<_> = ["/etc/ld.so.conf.d/incus.conf", "/etc/modules-load.d/incus.conf", "/etc/sysctl.d/99-incus.conf", "/etc/subuid"]
            .iter()
            .map(|p| fs::read_to_string(root.resolve(p)).unwrap())
            .collect();

        let second = ensure_all(&root, &mutations).unwrap();
        assert!(second.iter().all(|o| *o == MutationOutcome::AlreadySatisfied));

        let after: Vec<_> = ["/etc/ld.so.conf.d/incus.conf", "/etc/modules-load.d/incus.conf", "/etc/sysctl.d/99-incus.conf", "/etc/subuid"]
            .iter()
            .map(|p| fs::read_to_string(root.resolve(p)).unwrap())
            .collect();
        assert_eq!(snapshot, after);
        assert!(all_satisfied(&root, &mutations).unwrap());
    }

    #[test]
    fn test_is_satisfied_does_not_write() {
        let (_temp, root) = temp_root();
        let m = sysctl("/etc/sysctl.d/99-incus.conf", "net.ipv4.ip_forward", "1");
        assert!(!is_satisfied(&root, &m).unwrap());
        assert!(!root.resolve("/etc/sysctl.d/99-incus.conf").exists());
    }

    #[test]
    fn test_missing_parent_is_mutation_error() {
        let (_temp, root) = temp_root();
        let err = ensure(&root, &line("/no/such/dir/file.conf", "x")).unwrap_err();
        assert!(err.resource.ends_with("no/such/dir/file.conf"));
        assert!(err.reason.contains("parent"));
    }

    #[test]
    fn test_display_names_resource() {
        let m = id_range("/etc/subgid", "root", 1_000_000, 1_000_000_000);
        assert_eq!(m.to_string(), "root:1000000:1000000000 in /etc/subgid");
        assert_eq!(m.resource(), Path::new("/etc/subgid"));
    }
}
