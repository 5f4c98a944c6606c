use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use memmap2::MmapOptions;
use tokio::task::spawn_blocking;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::archive::{ArchiveAccessor, ImageExtensions, image_entries};
use crate::error::{Error, Result};
use crate::path_utils::{get_file_name_lossy, path_to_string_lossy};
use crate::types::{AbortSignal, ImageEntry};

/// Accessor for zip-based containers (CBZ), backed by the `zip` crate.
///
/// This is also the only writer: every repacked archive is a CBZ, whatever the
/// input format was.
pub struct ZipAccessor {
    extensions: ImageExtensions,
    options: SimpleFileOptions,
}

impl ZipAccessor {
    pub fn new(extensions: ImageExtensions) -> Self {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        Self {
            extensions,
            options,
        }
    }

    fn open(archive: &Path) -> Result<ZipArchive<File>> {
        let file = File::open(archive).map_err(|e| Error::ArchiveOpen {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })?;
        ZipArchive::new(file).map_err(|e| Error::ArchiveOpen {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Files of `source_dir` ending in `.{suffix}`, sorted by file name.
    fn collect_members(source_dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
        let wanted = format!(".{}", suffix.to_lowercase());
        let mut members = Vec::new();

        for entry in std::fs::read_dir(source_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if get_file_name_lossy(&path).to_lowercase().ends_with(&wanted) {
                members.push(path);
            }
        }

        members.sort_by_key(|path| get_file_name_lossy(path));
        Ok(members)
    }

    /// Writes `members` into a new zip at `dest`, checking `abort` before each.
    fn write_members(
        dest: &Path,
        members: &[PathBuf],
        options: SimpleFileOptions,
        abort: &AbortSignal,
    ) -> Result<usize> {
        let mut zip = ZipWriter::new(File::create(dest)?);

        for member in members {
            abort.check()?;
            let file = File::open(member).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to open page '{}': {}",
                        path_to_string_lossy(member),
                        e
                    ),
                ))
            })?;

            zip.start_file(get_file_name_lossy(member), options)?;

            // Mapping an empty file fails on some platforms
            if file.metadata()?.len() > 0 {
                // Read-only map of a page this job owns exclusively
                let mmap = unsafe { MmapOptions::new().map(&file)? };
                zip.write_all(&mmap[..])?;
            }
        }

        zip.finish()?;
        Ok(members.len())
    }
}

#[async_trait]
impl ArchiveAccessor for ZipAccessor {
    fn name(&self) -> &str {
        "zip"
    }

    async fn list_images(&self, archive: &Path) -> Result<Vec<ImageEntry>> {
        let archive = archive.to_path_buf();
        let extensions = self.extensions.clone();

        spawn_blocking(move || {
            let zip = Self::open(&archive)?;
            Ok(image_entries(zip.file_names(), &extensions))
        })
        .await
        .map_err(|e| Error::Other(format!("Listing task failed: {}", e)))?
    }

    async fn extract_selected(
        &self,
        archive: &Path,
        entries: &[ImageEntry],
        dest: &Path,
        abort: &AbortSignal,
    ) -> Result<()> {
        let archive = archive.to_path_buf();
        let entries = entries.to_vec();
        let dest = dest.to_path_buf();
        let abort = abort.clone();

        spawn_blocking(move || {
            let mut zip = Self::open(&archive)?;

            for entry in &entries {
                abort.check()?;
                let output_path = dest.join(entry.relative_path()?);
                if let Some(parent) = output_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let mut member = zip
                    .by_name(entry.name())
                    .map_err(|e| Error::extract(&archive, format!("{}: {}", entry, e)))?;
                let mut output = File::create(&output_path).map_err(|e| {
                    Error::extract(
                        &archive,
                        format!(
                            "cannot create '{}': {}",
                            path_to_string_lossy(&output_path),
                            e
                        ),
                    )
                })?;
                std::io::copy(&mut member, &mut output)
                    .map_err(|e| Error::extract(&archive, format!("{}: {}", entry, e)))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("Extraction task failed: {}", e)))?
    }

    async fn write_archive(
        &self,
        dest: &Path,
        source_dir: &Path,
        suffix: &str,
        abort: &AbortSignal,
    ) -> Result<usize> {
        let dest = dest.to_path_buf();
        let source_dir = source_dir.to_path_buf();
        let suffix = suffix.to_string();
        let options = self.options;
        let abort = abort.clone();

        spawn_blocking(move || {
            abort.check()?;
            let members = Self::collect_members(&source_dir, &suffix)?;
            let written = Self::write_members(&dest, &members, options, &abort);
            if written.is_err() {
                let _ = std::fs::remove_file(&dest);
            }
            written
        })
        .await
        .map_err(|e| Error::Other(format!("Repack task failed: {}", e)))?
    }
}
