//! The per-archive conversion pipeline.
//!
//! A [`ConversionWorker`] takes one [`Job`] through
//! `Precheck → Extracting → Transcoding → Repacking → Replacing → Cleanup` and
//! always ends with a [`ConversionResult`], never an error. Pages are handled one
//! after another; parallelism only exists across archives.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::task::spawn_blocking;

use crate::archive::{ArchiveAccessor, ImageExtensions, ZipAccessor, accessor_for};
use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::path_utils::{arena_dir_name, partial_output_path, path_to_string_lossy};
use crate::transcoder::ImageTranscoder;
use crate::types::{
    AbortSignal, ArchivePath, ConversionResult, ImageEntry, Job, JobOutcome,
    TARGET_IMAGE_EXTENSION,
};

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Precheck,
    Extracting,
    Transcoding,
    Repacking,
    Replacing,
    Cleanup,
    Done,
    Failed,
}

/// Everything a worker needs besides its job. Shared by all jobs of a submission.
pub struct WorkerContext {
    pub config: Arc<EngineConfig>,
    pub extensions: ImageExtensions,
    pub transcoder: Arc<dyn ImageTranscoder>,
    pub quality: u8,
    pub events: EventSender,
}

/// Per-job scratch directory, exclusively owned by one worker.
///
/// Holds `extracted/` (original pages) and `pages/` (transcoded pages). It is
/// removed by [`ScratchArena::cleanup`] on every exit path, and by `Drop` as a
/// last resort if a job is torn down before cleanup ran.
#[derive(Debug)]
pub struct ScratchArena {
    root: PathBuf,
    created: bool,
}

impl ScratchArena {
    pub fn new(archive: &ArchivePath, token: u64, scratch_root: Option<&Path>) -> Self {
        let base = scratch_root
            .map(Path::to_path_buf)
            .or_else(|| archive.as_path().parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: base.join(arena_dir_name(archive.as_path(), token)),
            created: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join("extracted")
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.root.join("pages")
    }

    pub async fn create(&mut self) -> Result<()> {
        self.created = true;
        fs::create_dir_all(self.extracted_dir()).await?;
        fs::create_dir_all(self.pages_dir()).await?;
        Ok(())
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        if !self.created {
            return Ok(());
        }
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                self.created = false;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.created = false;
                Ok(())
            }
            Err(e) => Err(Error::cleanup(&self.root, e)),
        }
    }
}

impl Drop for ScratchArena {
    fn drop(&mut self) {
        if self.created {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}

/// True when both paths name the same file, including on case-insensitive
/// file systems where `a.CBZ` and `a.cbz` are one file.
async fn is_same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Rounded share of finished pages, 0..=100.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total);
    ((done * 100 + total / 2) / total) as u8
}

/// File names of the transcoded pages, one per entry.
///
/// Pages keep their original base name with the target extension. When two
/// members share a base name (same file in different folders), the later one
/// is prefixed with its page number, then suffixed with a counter until the
/// name is unused. Names are unique ignoring case.
pub fn page_file_names(entries: &[ImageEntry]) -> Vec<String> {
    let mut used = HashSet::with_capacity(entries.len());
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let stem = entry.stem();
            let mut name = format!("{}.{}", stem, TARGET_IMAGE_EXTENSION);
            let mut attempt = 1;
            while used.contains(&name.to_lowercase()) {
                name = if attempt == 1 {
                    format!("{:04}_{}.{}", index + 1, stem, TARGET_IMAGE_EXTENSION)
                } else {
                    format!(
                        "{:04}_{}_{}.{}",
                        index + 1,
                        stem,
                        attempt,
                        TARGET_IMAGE_EXTENSION
                    )
                };
                attempt += 1;
            }
            used.insert(name.to_lowercase());
            name
        })
        .collect()
}

/// Runs one archive through the whole pipeline.
pub struct ConversionWorker {
    job: Job,
    token: u64,
    context: Arc<WorkerContext>,
    stage: Stage,
    original_size: u64,
    partial_output: Option<PathBuf>,
    abort: AbortSignal,
}

impl ConversionWorker {
    pub fn new(job: Job, token: u64, context: Arc<WorkerContext>) -> Self {
        Self {
            job,
            token,
            context,
            stage: Stage::Created,
            original_size: 0,
            partial_output: None,
            abort: AbortSignal::new(),
        }
    }

    pub fn archive(&self) -> &ArchivePath {
        &self.job.archive
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        log::debug!(
            "{} [{}]: {:?} -> {:?}",
            self.job.archive.file_name(),
            self.token,
            self.stage,
            stage
        );
        self.stage = stage;
    }

    /// Processes the job to a terminal state. Errors are reported through the
    /// event channel and folded into the returned result.
    pub async fn run(mut self) -> ConversionResult {
        let archive = self.job.archive.clone();
        let events = self.context.events.clone();
        let mut arena = ScratchArena::new(
            &archive,
            self.token,
            self.context.config.scratch_root.as_deref(),
        );

        let processed = match self.context.config.job_deadline {
            Some(limit) => self.process_within(limit, &mut arena).await,
            None => self.process(&mut arena).await,
        };
        let failed_stage = self.stage;

        self.enter(Stage::Cleanup);
        if let Some(partial) = self.partial_output.take() {
            let _ = fs::remove_file(&partial).await;
        }
        if let Err(e) = arena.cleanup().await {
            events.warn(e.to_string());
        }

        match processed {
            Ok(result) => {
                self.enter(Stage::Done);
                result
            }
            Err(e) => {
                self.enter(Stage::Failed);
                events.warn(format!(
                    "Error {} ({:?}): {}",
                    archive.file_name(),
                    failed_stage,
                    e
                ));
                ConversionResult::failed(archive, self.original_size, &e)
            }
        }
    }

    /// Runs [`Self::process`] under a deadline. When it expires the job is
    /// aborted and still awaited, so no blocking step touches the disk after
    /// cleanup started.
    async fn process_within(
        &mut self,
        limit: Duration,
        arena: &mut ScratchArena,
    ) -> Result<ConversionResult> {
        let abort = self.abort.clone();
        let process = self.process(arena);
        tokio::pin!(process);

        tokio::select! {
            processed = &mut process => return processed,
            _ = tokio::time::sleep(limit) => {}
        }

        abort.abort();
        match process.await {
            // Finished its last step before noticing the abort
            Ok(result) => Ok(result),
            Err(e) => {
                log::debug!("Aborted after deadline of {:?}: {}", limit, e);
                Err(Error::Deadline(limit))
            }
        }
    }

    async fn process(&mut self, arena: &mut ScratchArena) -> Result<ConversionResult> {
        let archive = self.job.archive.clone();
        let name = archive.file_name();
        let context = Arc::clone(&self.context);
        let events = &context.events;

        self.enter(Stage::Precheck);
        self.original_size = fs::metadata(archive.as_path()).await?.len();

        let accessor = accessor_for(
            archive.as_path(),
            Arc::clone(&context.extensions),
            context.config.use_fallback_tools,
            Some(events.clone()),
        )?;
        let entries = accessor.list_images(archive.as_path()).await?;

        if entries.is_empty() {
            events.info(format!("No images found in {}", name));
            return Ok(ConversionResult {
                original_size: self.original_size,
                ..ConversionResult::new(archive, JobOutcome::NoImages)
            });
        }

        self.enter(Stage::Extracting);
        self.abort.check()?;
        arena.create().await?;
        accessor
            .extract_selected(
                archive.as_path(),
                &entries,
                &arena.extracted_dir(),
                &self.abort,
            )
            .await?;

        self.enter(Stage::Transcoding);
        self.emit_thumbnail(&entries[0], arena).await;
        let converted = self.transcode_pages(&entries, arena).await?;
        let failed = entries.len() - converted;

        let base_result = ConversionResult {
            original_size: self.original_size,
            pages_total: entries.len(),
            pages_converted: converted,
            ..ConversionResult::new(archive.clone(), JobOutcome::KeptOriginal)
        };

        if converted == 0 {
            return Err(Error::repack(
                archive.as_path(),
                "no page could be transcoded, original kept",
            ));
        }

        if failed > 0 && !context.config.replace_partial {
            events.warn(format!(
                "{}: {} of {} pages failed to convert, original kept",
                name,
                failed,
                entries.len()
            ));
            return Ok(base_result);
        }

        self.enter(Stage::Repacking);
        let replaces_original = is_same_file(&archive.output_path(), archive.as_path()).await;
        let output = self.repack(arena, replaces_original, converted).await?;

        self.enter(Stage::Replacing);
        let new_size = fs::metadata(&output)
            .await
            .map_err(|e| Error::repack(&output, e))?
            .len();

        if !replaces_original {
            if let Err(e) = fs::remove_file(archive.as_path()).await {
                events.warn(format!(
                    "Converted {} but could not delete the original: {}",
                    name, e
                ));
            }
        }

        let saved_kb = (self.original_size as f64 - new_size as f64) / 1024.0;
        events.info(format!("Finished {} | Size reduced: {:.2} KB", name, saved_kb));

        Ok(ConversionResult {
            outcome: JobOutcome::Converted,
            new_size: Some(new_size),
            output: Some(output),
            ..base_result
        })
    }

    async fn emit_thumbnail(&self, first: &ImageEntry, arena: &ScratchArena) {
        let events = &self.context.events;
        let archive = &self.job.archive;

        let source = match first.relative_path() {
            Ok(relative) => arena.extracted_dir().join(relative),
            Err(e) => {
                events.warn(format!("Thumbnail error for {}: {}", archive.file_name(), e));
                return;
            }
        };
        let transcoder = Arc::clone(&self.context.transcoder);
        let (max_width, max_height) = self.context.config.thumbnail_size;

        match spawn_blocking(move || transcoder.thumbnail(&source, max_width, max_height)).await {
            Ok(Ok(image)) => events.thumbnail(archive, image),
            Ok(Err(e)) => {
                events.warn(format!("Thumbnail error for {}: {}", archive.file_name(), e))
            }
            Err(e) => {
                events.warn(format!("Thumbnail error for {}: {}", archive.file_name(), e))
            }
        }
    }

    /// Transcodes every page in order. Returns how many succeeded.
    async fn transcode_pages(&self, entries: &[ImageEntry], arena: &ScratchArena) -> Result<usize> {
        let events = &self.context.events;
        let archive = &self.job.archive;
        let extracted_dir = arena.extracted_dir();
        let pages_dir = arena.pages_dir();
        let total = entries.len();
        let mut converted = 0;

        for ((index, entry), file_name) in entries.iter().enumerate().zip(page_file_names(entries))
        {
            self.abort.check()?;
            let source = extracted_dir.join(entry.relative_path()?);
            let dest = pages_dir.join(file_name);
            let transcoder = Arc::clone(&self.context.transcoder);
            let quality = self.context.quality;

            let job_source = source.clone();
            let outcome =
                spawn_blocking(move || transcoder.transcode(&job_source, &dest, quality)).await;

            match outcome {
                Ok(Ok(_)) => {
                    if let Err(e) = fs::remove_file(&source).await {
                        log::debug!("Could not delete {:?}: {}", source, e);
                    }
                    converted += 1;
                    events.progress(archive, percent(index + 1, total));
                }
                Ok(Err(e)) => events.warn(format!("Error converting {}: {}", entry, e)),
                Err(e) => events.warn(format!("Error converting {}: {}", entry, e)),
            }
        }

        Ok(converted)
    }

    /// Writes the transcoded pages to a temporary sibling and renames it over
    /// the final `.cbz` path. Fails unless exactly `converted` pages were packed.
    async fn repack(
        &mut self,
        arena: &ScratchArena,
        replaces_original: bool,
        converted: usize,
    ) -> Result<PathBuf> {
        let output = self.job.archive.output_path();

        if !replaces_original && fs::try_exists(&output).await.unwrap_or(true) {
            return Err(Error::repack(
                &output,
                format!(
                    "refusing to overwrite existing '{}'",
                    path_to_string_lossy(&output)
                ),
            ));
        }

        let partial = partial_output_path(&output, self.token);
        self.partial_output = Some(partial.clone());

        let writer = ZipAccessor::new(Arc::clone(&self.context.extensions));
        let written = writer
            .write_archive(
                &partial,
                &arena.pages_dir(),
                TARGET_IMAGE_EXTENSION,
                &self.abort,
            )
            .await
            .map_err(|e| match e {
                Error::Aborted => Error::Aborted,
                e => Error::repack(&output, e),
            })?;
        if written != converted {
            return Err(Error::repack(
                &output,
                format!("packed {} of {} converted pages", written, converted),
            ));
        }

        self.abort.check()?;
        fs::rename(&partial, &output)
            .await
            .map_err(|e| Error::repack(&output, e))?;
        self.partial_output = None;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_rounds() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(1, 2), 50);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn test_percent_is_monotonic() {
        for total in 1..50 {
            let values: Vec<u8> = (1..=total).map(|done| percent(done, total)).collect();
            assert!(values.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(values.last(), Some(&100));
        }
    }

    #[test]
    fn test_page_file_names_keep_basenames() {
        let entries = vec![
            ImageEntry::new("001.jpg"),
            ImageEntry::new("002.PNG"),
            ImageEntry::new("extra/cover.jpeg"),
        ];
        assert_eq!(
            page_file_names(&entries),
            vec!["001.webp", "002.webp", "cover.webp"]
        );
    }

    #[test]
    fn test_page_file_names_disambiguate_collisions() {
        let entries = vec![
            ImageEntry::new("a/001.jpg"),
            ImageEntry::new("b/001.jpg"),
            ImageEntry::new("b/001.png"),
        ];
        let names = page_file_names(&entries);
        assert_eq!(names[0], "001.webp");
        assert_eq!(names[1], "0002_001.webp");
        assert_eq!(names[2], "0003_001.webp");
    }

    #[test]
    fn test_page_file_names_never_reuse_a_prefixed_name() {
        // The third page's prefixed name is already taken by the first page
        let entries = vec![
            ImageEntry::new("0003_001.jpg"),
            ImageEntry::new("x/001.jpg"),
            ImageEntry::new("y/001.jpg"),
        ];
        let names = page_file_names(&entries);
        assert_eq!(names, vec!["0003_001.webp", "001.webp", "0003_001_2.webp"]);

        let unique: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
        assert_eq!(unique.len(), entries.len());
    }

    #[test]
    fn test_page_file_names_unique_for_many_duplicates() {
        // Page 4 collides with both of the first two names, ignoring case
        let mut entries = vec![ImageEntry::new("0004_P.jpg"), ImageEntry::new("0004_p_2.png")];
        entries.extend((0..6).map(|i| ImageEntry::new(format!("dir{}/p.jpg", i))));

        let names = page_file_names(&entries);
        assert_eq!(names[3], "0004_p_3.webp");
        let unique: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
        assert_eq!(unique.len(), entries.len());
    }

    #[test]
    fn test_arena_beside_archive_by_default() {
        let archive = ArchivePath::new("/comics/series/issue.cbz");
        let arena = ScratchArena::new(&archive, 3, None);
        assert_eq!(arena.root().parent(), Some(Path::new("/comics/series")));
        assert!(arena.extracted_dir().starts_with(arena.root()));
        assert_ne!(arena.extracted_dir(), arena.pages_dir());

        let elsewhere = ScratchArena::new(&archive, 3, Some(Path::new("/tmp/scratch")));
        assert_eq!(elsewhere.root().parent(), Some(Path::new("/tmp/scratch")));
    }
}
