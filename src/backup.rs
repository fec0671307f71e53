//! Backup naming for rotating deploys.
//!
//! `/srv/app.cfg` becomes `/srv/app_old.cfg`, then `/srv/app_old_old.cfg`,
//! and so on. Only the final path component is rewritten.

use crate::error::{DeployError, Result};
use std::path::{Path, PathBuf};

/// Marker inserted before the extension of each backup generation
pub const BACKUP_MARKER: &str = "_old";

/// Upper bound on probing before giving up
pub const MAX_BACKUP_GENERATIONS: usize = 1024;

/// Split a file name into stem and extension (extension includes the dot).
///
/// Leading dots never start an extension: `.env` has none, `.env.local`
/// has `.local`.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if name[..idx].chars().any(|c| c != '.') => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Next backup candidate for `path`, one generation deeper.
pub fn next_candidate(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| DeployError::InvalidPath(path.display().to_string()))?
        .to_str()
        .ok_or_else(|| DeployError::InvalidPath(path.to_string_lossy().to_string()))?;

    let (stem, ext) = split_extension(name);
    Ok(path.with_file_name(format!("{}{}{}", stem, BACKUP_MARKER, ext)))
}

/// Find the first backup candidate for `path` that `exists` reports as absent.
///
/// `exists` is queried once per candidate in generation order.
pub fn find_backup_name<F>(path: &Path, mut exists: F) -> Result<PathBuf>
where
    F: FnMut(&Path) -> Result<bool>,
{
    let mut candidate = next_candidate(path)?;
    for _ in 0..MAX_BACKUP_GENERATIONS {
        if !exists(&candidate)? {
            return Ok(candidate);
        }
        candidate = next_candidate(&candidate)?;
    }

    Err(DeployError::BackupExhausted {
        path: path.to_path_buf(),
        generations: MAX_BACKUP_GENERATIONS,
    })
}
