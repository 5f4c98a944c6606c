//! Archive discovery.
//!
//! Walks a root directory recursively and collects every CBZ/CBR file. Order is the
//! traversal order of the file system; processing order carries no meaning, so no
//! sorting is applied.

use std::path::{Path, PathBuf};

use tokio::fs::{ReadDir, read_dir};

use crate::error::{Error, Result};
use crate::path_utils::{has_extension, is_hidden_file};
use crate::types::{ARCHIVE_EXTENSIONS, ArchivePath};

/// What a walk produced.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryReport {
    /// Candidate archives in traversal order
    pub archives: Vec<ArchivePath>,
    /// Subdirectories that could not be read, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

/// Checks that `root` exists and is a directory.
pub fn validate_root(root: &Path) -> Result<()> {
    if root.as_os_str().is_empty() {
        return Err(Error::Discovery(
            root.to_path_buf(),
            "no directory given".to_string(),
        ));
    }
    if !root.exists() {
        return Err(Error::Discovery(
            root.to_path_buf(),
            "directory does not exist".to_string(),
        ));
    }
    if !root.is_dir() {
        return Err(Error::Discovery(
            root.to_path_buf(),
            "path is not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Recursively enumerates candidate archives under `root`.
///
/// # Arguments
///
/// * `root` - Directory to scan
///
/// # Returns
///
/// * `Ok(DiscoveryReport)` - Archives found plus unreadable subdirectories
/// * `Err(Error::Discovery)` - `root` is missing, not a directory, or unreadable
pub async fn discover(root: &Path) -> Result<DiscoveryReport> {
    validate_root(root)?;

    let mut report = DiscoveryReport::default();
    let mut pending_dirs = vec![root.to_path_buf()];

    while let Some(directory) = pending_dirs.pop() {
        let is_root = directory == root;
        let entries = match read_dir(&directory).await {
            Ok(entries) => entries,
            Err(e) if is_root => return Err(Error::Discovery(directory, e.to_string())),
            Err(e) => {
                report.skipped.push((directory, e.to_string()));
                continue;
            }
        };

        let subdirectories = match collect_directory(entries, &mut report.archives).await {
            Ok(subdirectories) => subdirectories,
            Err(e) if is_root => return Err(Error::Discovery(directory, e.to_string())),
            Err(e) => {
                report.skipped.push((directory, e.to_string()));
                continue;
            }
        };

        // Reversed so the stack pops subdirectories in listing order
        pending_dirs.extend(subdirectories.into_iter().rev());
    }

    Ok(report)
}

/// Reads one directory, appending archives to `archives` and returning its
/// subdirectories. Hidden entries are skipped.
async fn collect_directory(
    mut entries: ReadDir,
    archives: &mut Vec<ArchivePath>,
) -> std::io::Result<Vec<PathBuf>> {
    let mut subdirectories = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_hidden_file(&path) {
            continue;
        }

        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(e) => {
                log::debug!("Skipping {:?}: {}", path, e);
                continue;
            }
        };

        if file_type.is_dir() {
            subdirectories.push(path);
            continue;
        }

        // Symlinked files count, symlinked directories are not followed
        let is_file = if file_type.is_symlink() {
            tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
        } else {
            file_type.is_file()
        };

        if is_file && has_extension(&path, ARCHIVE_EXTENSIONS) {
            archives.push(ArchivePath::new(path));
        }
    }

    Ok(subdirectories)
}
