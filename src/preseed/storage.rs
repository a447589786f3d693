//! Storage pool directory selection.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::MutationError;
use crate::host::HostRoot;
use crate::runner::{CommandRunner, CommandSpec};

use super::POOL_NAME;

/// Subdirectory used when the requested directory already holds data.
pub const DERIVED_SUBDIR: &str = "incus";

/// Source directory of the default pool when the daemon already has one.
///
/// `None` when Incus is not installed yet, the pool does not exist, or the
/// reported source is not an absolute path.
pub fn existing_pool_source(runner: &dyn CommandRunner) -> Option<PathBuf> {
    let spec = CommandSpec::new("incus").args(["storage", "get", POOL_NAME, "source"]);
    let output = runner.run(&spec).ok()?;
    let source = Path::new(output.stdout.trim());
    source.is_absolute().then(|| source.to_path_buf())
}

/// Make `path` usable as the `dir` pool source and return the host path to
/// put in the preseed document.
///
/// A missing directory is created. An empty directory is used as is. A
/// directory with contents is left untouched and `<path>/incus` is used
/// instead; a leftover `<path>/incus` from an earlier run is reused.
pub fn prepare_storage_dir(root: &HostRoot, path: &Path) -> Result<PathBuf, MutationError> {
    let full = root.resolve(path);

    if !full.exists() {
        fs::create_dir_all(&full).map_err(|e| MutationError::io(path, "creating directory", e))?;
        println!("  Created storage directory {}", path.display());
        return Ok(path.to_path_buf());
    }
    if !full.is_dir() {
        return Err(MutationError::new(path, "exists but is not a directory"));
    }
    if is_empty_dir(&full, path)? {
        return Ok(path.to_path_buf());
    }

    let derived = path.join(DERIVED_SUBDIR);
    let derived_full = root.resolve(&derived);
    println!(
        "  {} is not empty, using {} instead",
        path.display(),
        derived.display()
    );
    if derived_full.exists() {
        if !derived_full.is_dir() {
            return Err(MutationError::new(&derived, "exists but is not a directory"));
        }
        if !is_empty_dir(&derived_full, &derived)? {
            tracing::warn!(path = %derived.display(), "reusing non-empty storage directory");
        }
    } else {
        fs::create_dir(&derived_full)
            .map_err(|e| MutationError::io(&derived, "creating directory", e))?;
    }
    Ok(derived)
}

fn is_empty_dir(full: &Path, host_path: &Path) -> Result<bool, MutationError> {
    let mut entries =
        fs::read_dir(full).map_err(|e| MutationError::io(host_path, "listing directory", e))?;
    Ok(entries.next().is_none())
}
