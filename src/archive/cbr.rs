use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::task::spawn_blocking;
use unrar::Archive;

use crate::archive::{ArchiveAccessor, ImageExtensions, image_entries};
use crate::error::{Error, Result};
use crate::types::{AbortSignal, ImageEntry};

/// Accessor for RAR-based containers (CBR), backed by the bundled unrar library.
///
/// RAR is read-only here; repacking always produces a CBZ.
pub struct RarAccessor {
    extensions: ImageExtensions,
}

impl RarAccessor {
    pub fn new(extensions: ImageExtensions) -> Self {
        Self { extensions }
    }

    fn open_error(archive: &Path, reason: impl ToString) -> Error {
        Error::ArchiveOpen {
            path: archive.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// RAR stores names with the host separator; members are compared with `/`.
fn member_name(filename: &Path) -> String {
    filename.to_string_lossy().replace('\\', "/")
}

#[async_trait]
impl ArchiveAccessor for RarAccessor {
    fn name(&self) -> &str {
        "rar"
    }

    async fn list_images(&self, archive: &Path) -> Result<Vec<ImageEntry>> {
        let archive = archive.to_path_buf();
        let extensions = self.extensions.clone();

        spawn_blocking(move || {
            let listing = Archive::new(&archive)
                .open_for_listing()
                .map_err(|e| Self::open_error(&archive, e))?;

            let mut names = Vec::new();
            for header in listing {
                let header = header.map_err(|e| Self::open_error(&archive, e))?;
                if header.is_file() {
                    names.push(member_name(&header.filename));
                }
            }
            Ok(image_entries(names, &extensions))
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
        let dest = dest.to_path_buf();
        let abort = abort.clone();
        let mut wanted: HashMap<String, PathBuf> = HashMap::with_capacity(entries.len());
        for entry in entries {
            wanted.insert(entry.name().to_string(), entry.relative_path()?);
        }

        spawn_blocking(move || {
            let mut cursor = Archive::new(&archive)
                .open_for_processing()
                .map_err(|e| Self::open_error(&archive, e))?;

            while let Some(header) = cursor
                .read_header()
                .map_err(|e| Error::extract(&archive, e))?
            {
                abort.check()?;
                let name = member_name(&header.entry().filename);
                let target = if header.entry().is_file() {
                    wanted.remove(&name)
                } else {
                    None
                };

                cursor = match target {
                    Some(relative) => {
                        let output_path = dest.join(relative);
                        if let Some(parent) = output_path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        header
                            .extract_to(&output_path)
                            .map_err(|e| Error::extract(&archive, format!("{}: {}", name, e)))?
                    }
                    None => header.skip().map_err(|e| Error::extract(&archive, e))?,
                };
            }

            if !wanted.is_empty() {
                let mut missing: Vec<String> = wanted.into_keys().collect();
                missing.sort();
                return Err(Error::extract(
                    &archive,
                    format!("members not found: {}", missing.join(", ")),
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("Extraction task failed: {}", e)))?
    }

    async fn write_archive(
        &self,
        _dest: &Path,
        _source_dir: &Path,
        _suffix: &str,
        _abort: &AbortSignal,
    ) -> Result<usize> {
        Err(Error::Unsupported(
            "writing RAR archives; repack to CBZ instead".to_string(),
        ))
    }
}
