//! Unpacking of downloaded `.tar.gz` archives.

use std::fs::{self, File};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::MutationError;

/// Unpack `archive` into `dest_dir`, replacing whatever was there.
///
/// Extraction happens in a sibling temp directory that is renamed into
/// place, so an interrupted unpack never leaves a half-populated `dest_dir`.
pub fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> Result<(), MutationError> {
    let parent = dest_dir
        .parent()
        .ok_or_else(|| MutationError::new(dest_dir, "destination has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| MutationError::io(parent, "creating directory", e))?;

    let tmp = parent.join(format!(
        ".extract-{}-{}",
        dest_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id()
    ));
    if tmp.exists() {
        fs::remove_dir_all(&tmp).map_err(|e| MutationError::io(&tmp, "removing stale temp dir", e))?;
    }
    fs::create_dir_all(&tmp).map_err(|e| MutationError::io(&tmp, "creating temp dir", e))?;

    let f = File::open(archive).map_err(|e| MutationError::io(archive, "opening archive", e))?;
    let mut unpacker = tar::Archive::new(GzDecoder::new(f));
    if let Err(e) = unpacker.unpack(&tmp) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(MutationError::io(archive, "unpacking archive", e));
    }

    if dest_dir.exists() {
        fs::remove_dir_all(dest_dir)
            .map_err(|e| MutationError::io(dest_dir, "removing previous contents", e))?;
    }
    fs::rename(&tmp, dest_dir).map_err(|e| MutationError::io(dest_dir, "moving extracted tree", e))
}
