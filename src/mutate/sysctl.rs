//! Mutation::Sysctl: `key = value` assignments in `/etc/sysctl.d` fragments.

use std::fs;
use std::path::Path;

use super::files::write_atomic;
use super::MutationOutcome;
use crate::error::MutationError;

fn parse_assignment(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    Some((key.trim().trim_start_matches('-'), value.trim()))
}

/// Read the last value assigned to `key` in the fragment, if any.
pub fn read_sysctl(path: &Path, key: &str) -> Result<Option<String>, MutationError> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).map_err(|e| MutationError::io(path, "reading", e))?;
    Ok(content
        .lines()
        .filter_map(parse_assignment)
        .filter(|(k, _)| *k == key)
        .last()
        .map(|(_, v)| v.to_string()))
}

/// Make `key` resolve to `value`, rewriting an existing assignment in place
/// and dropping duplicates of it.
pub fn ensure_sysctl(path: &Path, key: &str, value: &str) -> Result<MutationOutcome, MutationError> {
    if read_sysctl(path, key)?.as_deref() == Some(value) {
        let content =
            fs::read_to_string(path).map_err(|e| MutationError::io(path, "reading", e))?;
        let occurrences = content
            .lines()
            .filter_map(parse_assignment)
            .filter(|(k, _)| *k == key)
            .count();
        if occurrences == 1 {
            return Ok(MutationOutcome::AlreadySatisfied);
        }
    }

    let created = !path.exists();
    let existing = if created {
        String::new()
    } else {
        fs::read_to_string(path).map_err(|e| MutationError::io(path, "reading", e))?
    };

    let assignment = format!("{} = {}", key, value);
    let mut replaced = false;
    let mut lines = Vec::new();
    for line in existing.lines() {
        match parse_assignment(line) {
            Some((k, _)) if k == key => {
                if !replaced {
                    lines.push(assignment.clone());
                    replaced = true;
                }
            }
            _ => lines.push(line.to_string()),
        }
    }
    if !replaced {
        lines.push(assignment);
    }

    let mut content = lines.join("\n");
    content.push('\n');
    write_atomic(path, &content)?;

    Ok(if created {
        MutationOutcome::Created
    } else {
        MutationOutcome::Changed
    })
}
