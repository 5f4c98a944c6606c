//! Archive module provides the capability interface over comic containers.
//!
//! This module contains the common [`ArchiveAccessor`] trait, the zip and RAR
//! implementations, and a fallback decorator that retries failed reads through
//! external command-line tools.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::types::{AbortSignal, ArchiveKind, ImageEntry};

pub mod cbr;
pub mod cbz;
pub mod fallback;

pub use fallback::{ExternalTool, FallbackAccessor};
pub use cbr::RarAccessor;
pub use cbz::ZipAccessor;

/// Uniform read/list/extract/write capability over one container format.
///
/// Every method performs blocking I/O on a blocking thread, so callers can await
/// them from any task without stalling the runtime. Extraction and writing stop
/// between members once their [`AbortSignal`] is raised and return
/// `Error::Aborted`.
#[async_trait]
pub trait ArchiveAccessor: Send + Sync {
    /// Short name used in log lines and error reports (e.g. `zip`, `unrar`).
    fn name(&self) -> &str;

    /// Lists the image members of `archive` without extracting anything.
    ///
    /// # Returns
    /// * `Ok(Vec<ImageEntry>)` - Image members sorted by member name
    /// * `Err(Error::ArchiveOpen)` - The container could not be read
    async fn list_images(&self, archive: &Path) -> Result<Vec<ImageEntry>>;

    /// Extracts exactly `entries` from `archive` into `dest`, keeping their
    /// relative member paths.
    async fn extract_selected(
        &self,
        archive: &Path,
        entries: &[ImageEntry],
        dest: &Path,
        abort: &AbortSignal,
    ) -> Result<()>;

    /// Writes every file of `source_dir` ending in `.{suffix}` into a fresh
    /// container at `dest`, sorted by file name. An aborted write leaves no file
    /// at `dest`.
    ///
    /// # Returns
    /// * `Ok(usize)` - Number of members written
    async fn write_archive(
        &self,
        dest: &Path,
        source_dir: &Path,
        suffix: &str,
        abort: &AbortSignal,
    ) -> Result<usize>;
}

/// Which members count as pages.
pub type ImageExtensions = Arc<Vec<String>>;

/// Filters raw member names down to sorted image entries.
pub(crate) fn image_entries<I, S>(names: I, extensions: &[String]) -> Vec<ImageEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut entries: Vec<ImageEntry> = names
        .into_iter()
        .filter(|name| {
            let name = name.as_ref();
            !name.ends_with('/') && ImageEntry::has_image_extension(name, extensions)
        })
        .map(|name| ImageEntry::new(name.as_ref()))
        .collect();
    entries.sort();
    entries.dedup();
    entries
}

/// Picks the accessor for `archive` by extension, wrapped in the fallback chain
/// of its format when `use_fallback_tools` is set. Failed attempts of the chain
/// are reported on `events` when given.
pub fn accessor_for(
    archive: &Path,
    extensions: ImageExtensions,
    use_fallback_tools: bool,
    events: Option<EventSender>,
) -> Result<Box<dyn ArchiveAccessor>> {
    let kind = ArchiveKind::from_path(archive).ok_or_else(|| {
        Error::Unsupported(format!("archive type of {:?}", archive.file_name()))
    })?;

    let primary: Box<dyn ArchiveAccessor> = match kind {
        ArchiveKind::Zip => Box::new(ZipAccessor::new(Arc::clone(&extensions))),
        ArchiveKind::Rar => Box::new(RarAccessor::new(Arc::clone(&extensions))),
    };

    if !use_fallback_tools {
        return Ok(primary);
    }

    let fallback = FallbackAccessor::new(
        primary,
        ExternalTool::chain_for(kind).to_vec(),
        extensions,
    );
    Ok(Box::new(match events {
        Some(events) => fallback.with_events(events),
        None => fallback,
    }))
}
