//! File and directory mutations: Mutation::Dir, Mutation::File, Mutation::Line, Mutation::Absent
//!
//! Paths here are already resolved under the host root.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::MutationOutcome;
use crate::error::MutationError;

pub fn dir_satisfied(path: &Path, mode: Option<u32>) -> Result<bool, MutationError> {
    if !path.is_dir() {
        return Ok(false);
    }
    match mode {
        Some(mode) => Ok(current_mode(path)? == mode),
        None => Ok(true),
    }
}

/// Handle Mutation::Dir: create a directory (and parents), then fix its mode.
pub fn ensure_dir(path: &Path, mode: Option<u32>) -> Result<MutationOutcome, MutationError> {
    if dir_satisfied(path, mode)? {
        return Ok(MutationOutcome::AlreadySatisfied);
    }
    if path.exists() && !path.is_dir() {
        return Err(MutationError::new(path, "exists and is not a directory"));
    }

    let created = !path.exists();
    fs::create_dir_all(path).map_err(|e| MutationError::io(path, "creating directory", e))?;
    if let Some(mode) = mode {
        set_mode(path, mode)?;
    }
    Ok(if created {
        MutationOutcome::Created
    } else {
        MutationOutcome::Changed
    })
}

pub fn file_satisfied(path: &Path, content: &str, mode: Option<u32>) -> Result<bool, MutationError> {
    if !path.is_file() {
        return Ok(false);
    }
    let current = read(path)?;
    if current != content {
        return Ok(false);
    }
    match mode {
        Some(mode) => Ok(current_mode(path)? == mode),
        None => Ok(true),
    }
}

/// Handle Mutation::File: the file holds exactly `content`.
pub fn ensure_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<MutationOutcome, MutationError> {
    if file_satisfied(path, content, mode)? {
        return Ok(MutationOutcome::AlreadySatisfied);
    }
    let created = !path.exists();
    write_atomic(path, content)?;
    if let Some(mode) = mode {
        set_mode(path, mode)?;
    }
    Ok(if created {
        MutationOutcome::Created
    } else {
        MutationOutcome::Changed
    })
}

pub fn line_satisfied(path: &Path, line: &str) -> Result<bool, MutationError> {
    if !path.is_file() {
        return Ok(false);
    }
    let wanted = line.trim();
    Ok(read(path)?.lines().any(|l| l.trim() == wanted))
}

/// Handle Mutation::Line: append `line` unless an identical line exists.
pub fn ensure_line(path: &Path, line: &str) -> Result<MutationOutcome, MutationError> {
    if line_satisfied(path, line)? {
        return Ok(MutationOutcome::AlreadySatisfied);
    }
    let created = !path.exists();
    let mut content = if created { String::new() } else { read(path)? };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line.trim());
    content.push('\n');
    write_atomic(path, &content)?;
    Ok(if created {
        MutationOutcome::Created
    } else {
        MutationOutcome::Changed
    })
}

/// Handle Mutation::Absent: remove a file, symlink or directory tree.
pub fn ensure_absent(path: &Path) -> Result<MutationOutcome, MutationError> {
    if !path.exists() && !path.is_symlink() {
        return Ok(MutationOutcome::AlreadySatisfied);
    }
    let result = if path.is_dir() && !path.is_symlink() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| MutationError::io(path, "removing", e))?;
    Ok(MutationOutcome::Changed)
}

/// Replace `path` with `content` via a temp file and rename.
///
/// The parent directory must already exist. An existing file keeps its
/// permission bits.
pub fn write_atomic(path: &Path, content: &str) -> Result<(), MutationError> {
    let parent = path
        .parent()
        .ok_or_else(|| MutationError::new(path, "path has no parent directory"))?;
    if !parent.is_dir() {
        return Err(MutationError::new(
            path,
            format!("parent directory {} does not exist", parent.display()),
        ));
    }

    let previous_mode = path.is_file().then(|| current_mode(path)).transpose()?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, std::process::id()));

    fs::write(&tmp, content).map_err(|e| MutationError::io(path, "writing temp file", e))?;
    if let Some(mode) = previous_mode {
        set_mode(&tmp, mode)?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        MutationError::io(path, "replacing file", e)
    })
}

fn read(path: &Path) -> Result<String, MutationError> {
    fs::read_to_string(path).map_err(|e| MutationError::io(path, "reading", e))
}

fn current_mode(path: &Path) -> Result<u32, MutationError> {
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o7777)
        .map_err(|e| MutationError::io(path, "reading metadata", e))
}

fn set_mode(path: &Path, mode: u32) -> Result<(), MutationError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| MutationError::io(path, "setting permissions", e))
}
