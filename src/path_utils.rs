//! Path utilities shared by discovery, extraction and repacking.
//!
//! This module provides helpers for lossy file-name handling, extension checks and the
//! naming scheme of per-job scratch arenas and temporary output files.

use std::path::{Path, PathBuf};

/// Marker embedded in arena directory names.
const ARENA_MARKER: &str = "_extracted_";

/// Marker embedded in temporary container names before the final rename.
const PARTIAL_MARKER: &str = ".partial-";

/// Gets the file name from a path with fallback to lossy conversion.
///
/// # Arguments
///
/// * `path` - The path to extract the file name from
///
/// # Returns
///
/// * `String` - The file name, using lossy conversion if necessary
pub fn get_file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Converts a path to a string with fallback to lossy conversion.
pub fn path_to_string_lossy(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Checks if a filename starts with a dot (hidden file) using safe conversion.
pub fn is_hidden_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Case-insensitive check of a path's extension against a list (without dots).
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| extensions.iter().any(|candidate| ext == *candidate))
        .unwrap_or(false)
}

/// Sanitizes a filename by replacing invalid characters with safe alternatives.
///
/// # Arguments
///
/// * `filename` - The filename to sanitize
///
/// # Returns
///
/// * `String` - The sanitized filename
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | '"' | '|' | '?' | '*' => '-',
            ':' => '-',
            '/' | '\\' => '-',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Name of the scratch arena for one job: hidden, derived from the archive's
/// basename and the job token assigned at admission.
pub fn arena_dir_name(archive: &Path, token: u64) -> String {
    format!(
        ".{}{}{:08x}-{:06x}",
        sanitize_filename(&get_file_name_lossy(archive)),
        ARENA_MARKER,
        std::process::id(),
        token
    )
}

/// Sibling path a container is written to before being renamed over `target`.
pub fn partial_output_path(target: &Path, token: u64) -> PathBuf {
    let mut name = get_file_name_lossy(target);
    name.push_str(&format!("{}{:06x}", PARTIAL_MARKER, token));
    target.with_file_name(format!(".{}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_get_file_name_lossy() {
        assert_eq!(get_file_name_lossy(Path::new("test/file.cbz")), "file.cbz");
        assert_eq!(get_file_name_lossy(Path::new("")), "unknown");
    }

    #[test]
    fn test_is_hidden_file() {
        assert!(is_hidden_file(Path::new(".hidden")));
        assert!(!is_hidden_file(Path::new("normal.cbz")));
    }

    #[test]
    fn test_has_extension_ignores_case() {
        assert!(has_extension(Path::new("a/B.CBZ"), &["cbz", "cbr"]));
        assert!(has_extension(Path::new("a/b.Cbr"), &["cbz", "cbr"]));
        assert!(!has_extension(Path::new("a/b.zip"), &["cbz", "cbr"]));
        assert!(!has_extension(Path::new("a/cbz"), &["cbz"]));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test<file>"), "test-file-");
        assert_eq!(sanitize_filename("test:file"), "test-file");
        assert_eq!(sanitize_filename("normal_file.cbz"), "normal_file.cbz");
    }

    #[test]
    fn test_arena_names_differ_per_token() {
        let archive = Path::new("/comics/issue 1.cbz");
        let first = arena_dir_name(archive, 1);
        let second = arena_dir_name(archive, 2);
        assert_ne!(first, second);
        assert!(first.starts_with(".issue 1.cbz_extracted_"));
    }

    #[test]
    fn test_partial_output_is_hidden_sibling() {
        let target = Path::new("/comics/issue.cbz");
        let partial = partial_output_path(target, 7);
        assert_eq!(partial.parent(), target.parent());
        assert!(is_hidden_file(&partial));
        assert_ne!(partial, target);
    }
}
