//! Output files.
//!
//! Signed bytes go to a temporary file inside the destination and are renamed into place, so a
//! reader of the destination never sees a half-written PDF.

use crate::error::SignError;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Stem used when an input path has none.
const FALLBACK_STEM: &str = "document";

/// Check once that `destination` is a directory we can create files in.
pub fn check_destination_writable(destination: &Path) -> Result<(), SignError> {
    let unavailable = |reason: String| SignError::DestinationUnavailable {
        path: destination.to_path_buf(),
        reason,
    };
    if !destination.is_dir() {
        return Err(unavailable("not an existing directory".to_string()));
    }
    tempfile::Builder::new()
        .prefix(".pdf-batch-sign-check")
        .tempfile_in(destination)
        .map(drop)
        .map_err(|e| unavailable(format!("not writable: {}", e)))
}

/// `destination/<stem><suffix>.pdf`.
pub fn output_path(destination: &Path, source: &Path, suffix: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_STEM.to_string());
    destination.join(format!("{}{}.pdf", stem, suffix))
}

/// Output path per source, with later sources that collide with an earlier one flagged.
pub fn plan_outputs(destination: &Path, sources: &[PathBuf], suffix: &str) -> Vec<(PathBuf, bool)> {
    let mut seen = HashSet::new();
    sources
        .iter()
        .map(|source| {
            let output = output_path(destination, source, suffix);
            let duplicate = !seen.insert(output.clone());
            (output, duplicate)
        })
        .collect()
}

/// Write `bytes` to `target` through a temporary file in the same directory.
pub fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), SignError> {
    let failure = |e: std::io::Error| SignError::WriteFailure(format!("{}: {}", target.display(), e));
    let dir = target
        .parent()
        .ok_or_else(|| SignError::WriteFailure(format!("{} has no parent directory", target.display())))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".pdf-batch-sign")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(failure)?;
    temp.write_all(bytes).map_err(failure)?;
    temp.as_file().sync_all().map_err(failure)?;
    temp.persist(target).map_err(|e| failure(e.error))?;
    Ok(())
}
