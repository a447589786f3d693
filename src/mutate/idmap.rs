//! Mutation::IdRange: subordinate id tables (`/etc/subuid`, `/etc/subgid`).
//!
//! Each line is `owner:start:count`. An owner may hold several ranges; the
//! installer only ever adds the exact range it needs.

use std::fs;
use std::path::Path;

use super::files::write_atomic;
use super::MutationOutcome;
use crate::error::MutationError;

/// Read the ranges assigned to `owner`.
///
/// Returns:
/// - Ok(ranges) with every `(start, count)` pair for the owner
/// - Ok(empty) if the table doesn't exist
/// - Err if the table exists but has a malformed entry for the owner
pub fn read_id_ranges(path: &Path, owner: &str) -> Result<Vec<(u64, u64)>, MutationError> {
    // A missing table just means no ranges are assigned yet
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content =
        fs::read_to_string(path).map_err(|e| MutationError::io(path, "reading", e))?;

    let mut ranges = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.trim().split(':').collect();
        if parts.len() != 3 || parts[0] != owner {
            continue;
        }
        let start: u64 = parts[1].parse().map_err(|_| {
            MutationError::new(
                path,
                format!("corrupted entry: invalid start '{}' for '{}'", parts[1], owner),
            )
        })?;
        let count: u64 = parts[2].parse().map_err(|_| {
            MutationError::new(
                path,
                format!("corrupted entry: invalid count '{}' for '{}'", parts[2], owner),
            )
        })?;
        ranges.push((start, count));
    }
    Ok(ranges)
}

/// Ensure `owner:start:count` is present in the table.
pub fn ensure_id_range(
    path: &Path,
    owner: &str,
    start: u64,
    count: u64,
) -> Result<MutationOutcome, MutationError> {
    if read_id_ranges(path, owner)?.contains(&(start, count)) {
        return Ok(MutationOutcome::AlreadySatisfied);
    }

    // Missing table starts empty; an unreadable one must not be overwritten
    let created = !path.exists();
    let mut table = if created {
        String::new()
    } else {
        fs::read_to_string(path).map_err(|e| MutationError::io(path, "reading", e))?
    };

    if !table.is_empty() && !table.ends_with('\n') {
        table.push('\n');
    }
    table.push_str(&format!("{}:{}:{}\n", owner, start, count));
    write_atomic(path, &table)?;

    Ok(if created {
        MutationOutcome::Created
    } else {
        MutationOutcome::Changed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_id_ranges() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subuid");
        fs::write(&path, "alice:100000:65536\nroot:1000000:1000000000\n").unwrap();

        assert_eq!(
            read_id_ranges(&path, "root").unwrap(),
            vec![(1_000_000, 1_000_000_000)]
        );
        assert_eq!(read_id_ranges(&path, "alice").unwrap(), vec![(100_000, 65_536)]);
        assert!(read_id_ranges(&path, "bob").unwrap().is_empty());
    }

    #[test]
    fn test_read_id_ranges_missing_table() {
        let temp = TempDir::new().unwrap();
        assert!(read_id_ranges(&temp.path().join("subgid"), "root")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_read_id_ranges_corrupted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subuid");
        fs::write(&path, "root:abc:1000\n").unwrap();
        let err = read_id_ranges(&path, "root").unwrap_err();
        assert!(err.reason.contains("invalid start"));
    }

    #[test]
    fn test_ensure_id_range_keeps_other_entries() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subuid");
        fs::write(&path, "alice:100000:65536").unwrap();

        assert_eq!(
            ensure_id_range(&path, "root", 1_000_000, 1_000_000_000).unwrap(),
            MutationOutcome::Changed
        );
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "alice:100000:65536\nroot:1000000:1000000000\n"
        );
    }

    #[test]
    fn test_ensure_id_range_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subgid");

        ensure_id_range(&path, "root", 1_000_000, 1_000_000_000).unwrap();
        assert_eq!(
            ensure_id_range(&path, "root", 1_000_000, 1_000_000_000).unwrap(),
            MutationOutcome::AlreadySatisfied
        );

        let content = fs::read_to_string(&path).unwrap();
        let entry_count = content.lines().filter(|l| l.starts_with("root:")).count();
        assert_eq!(entry_count, 1, "Should only have one range for root");
    }
}
