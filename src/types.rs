//! Core data types for the Shukusho conversion pipeline.
//!
//! This module defines the fundamental data structures shared by every stage:
//! - Identifiers (`ArchivePath`, `ImageEntry`, `Job`)
//! - Enumerations for settings (`ArchiveKind`, `ConcurrencyMode`)
//! - Per-job outcome reporting (`ConversionResult`, `JobOutcome`)
//! - Engine observation (`EngineSnapshot`)

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tokio::sync::Notify;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path_utils::{get_file_name_lossy, has_extension};

/// Extensions of the container formats picked up by discovery.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["cbz", "cbr"];
/// Image members worth transcoding.
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
/// Extension of the transcoded pages.
pub const TARGET_IMAGE_EXTENSION: &str = "webp";
/// Extension of every repacked container.
pub const OUTPUT_ARCHIVE_EXTENSION: &str = "cbz";

/// The two container families the engine understands.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ArchiveKind {
    Zip,
    Rar,
}

impl ArchiveKind {
    /// Picks the container family from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        if has_extension(path, &["cbz", "zip"]) {
            Some(ArchiveKind::Zip)
        } else if has_extension(path, &["cbr", "rar"]) {
            Some(ArchiveKind::Rar)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveKind::Zip => write!(f, "zip"),
            ArchiveKind::Rar => write!(f, "rar"),
        }
    }
}

/// Identifier of one input archive. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ArchivePath(PathBuf);

impl ArchivePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// File name for log lines, lossy on non UTF-8 names.
    pub fn file_name(&self) -> String {
        get_file_name_lossy(&self.0)
    }

    pub fn kind(&self) -> Option<ArchiveKind> {
        ArchiveKind::from_path(&self.0)
    }

    /// Where the repacked container ends up: same directory and stem, `.cbz`.
    pub fn output_path(&self) -> PathBuf {
        self.0.with_extension(OUTPUT_ARCHIVE_EXTENSION)
    }
}

impl AsRef<Path> for ArchivePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A member of an archive whose name carries an image extension.
///
/// Entries order lexicographically by member name, which is the page order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageEntry {
    name: String,
}

impl ImageEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Member name exactly as stored in the archive.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Relative path of the member once extracted.
    ///
    /// Names that are absolute or climb out of the destination with `..`
    /// are rejected so extraction can never write outside its arena.
    pub fn relative_path(&self) -> Result<PathBuf> {
        let normalized = self.name.replace('\\', "/");
        let mut relative = PathBuf::new();
        for component in Path::new(&normalized).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::extract(
                        &self.name,
                        "member name escapes the extraction directory",
                    ));
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(Error::extract(&self.name, "empty member name"));
        }
        Ok(relative)
    }

    /// Base name of the member without its extension.
    pub fn stem(&self) -> String {
        let normalized = self.name.replace('\\', "/");
        Path::new(&normalized)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "page".to_string())
    }

    pub fn has_image_extension(name: &str, extensions: &[String]) -> bool {
        let lower = name.to_lowercase();
        extensions
            .iter()
            .any(|ext| lower.ends_with(&format!(".{}", ext.to_lowercase())))
    }
}

impl fmt::Display for ImageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One unit of work: an archive found by discovery.
#[derive(Debug, Clone)]
pub struct Job {
    pub archive: ArchivePath,
    pub discovered_at: SystemTime,
}

impl Job {
    pub fn new(archive: ArchivePath) -> Self {
        Self {
            archive,
            discovered_at: SystemTime::now(),
        }
    }
}

/// Cooperative stop signal shared by a job and its blocking steps.
///
/// Blocking loops poll [`AbortSignal::check`] between members; async code can
/// wait on [`AbortSignal::aborted`]. Once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortState>,
}

#[derive(Debug, Default)]
struct AbortState {
    raised: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// `Err(Error::Aborted)` once the signal was raised.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal is raised.
    pub async fn aborted(&self) {
        loop {
            // Registered before the check so a concurrent abort is not missed
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// How many workers a submission may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConcurrencyMode {
    /// One worker per logical core
    #[default]
    Full,
    /// Half of the logical cores, at least one
    Half,
    /// An explicit worker count, at least one
    Fixed(usize),
}

impl ConcurrencyMode {
    /// Resolves the mode to a worker count. Evaluated once per submission.
    pub fn limit(&self) -> usize {
        match self {
            ConcurrencyMode::Full => num_cpus::get().max(1),
            ConcurrencyMode::Half => (num_cpus::get() / 2).max(1),
            ConcurrencyMode::Fixed(n) => (*n).max(1),
        }
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JobOutcome {
    /// A new container replaced the original
    Converted,
    /// The archive holds no images; nothing was touched
    NoImages,
    /// Some pages failed, so the original was kept
    KeptOriginal,
    /// The pipeline stopped with an error; the original was kept
    Failed,
}

/// Per-job result carried by the `Done` event.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConversionResult {
    pub archive: ArchivePath,
    pub outcome: JobOutcome,
    pub original_size: u64,
    pub new_size: Option<u64>,
    pub output: Option<PathBuf>,
    pub pages_total: usize,
    pub pages_converted: usize,
    pub error: Option<String>,
}

impl ConversionResult {
    pub(crate) fn new(archive: ArchivePath, outcome: JobOutcome) -> Self {
        Self {
            archive,
            outcome,
            original_size: 0,
            new_size: None,
            output: None,
            pages_total: 0,
            pages_converted: 0,
            error: None,
        }
    }

    pub(crate) fn failed(archive: ArchivePath, original_size: u64, error: &Error) -> Self {
        Self {
            original_size,
            error: Some(error.to_string()),
            ..Self::new(archive, JobOutcome::Failed)
        }
    }

    /// Bytes saved by the conversion, negative when the output grew.
    pub fn size_delta(&self) -> Option<i64> {
        self.new_size
            .map(|new_size| self.original_size as i64 - new_size as i64)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Converted | JobOutcome::NoImages)
    }
}

/// Point-in-time view of the scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineSnapshot {
    pub running: bool,
    pub cancelled: bool,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub total: usize,
    pub limit: usize,
    pub peak_active: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_kind_from_extension() {
        assert_eq!(ArchiveKind::from_path(Path::new("a.CBZ")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_path(Path::new("a.cbr")), Some(ArchiveKind::Rar));
        assert_eq!(ArchiveKind::from_path(Path::new("a.pdf")), None);
    }

    #[test]
    fn test_output_path_swaps_extension() {
        let archive = ArchivePath::new("/comics/Vol 1.cbr");
        assert_eq!(archive.output_path(), PathBuf::from("/comics/Vol 1.cbz"));
        assert_eq!(archive.file_name(), "Vol 1.cbr");
    }

    #[test]
    fn test_relative_path_rejects_escapes() {
        assert_eq!(
            ImageEntry::new("ch1\\001.jpg").relative_path().unwrap(),
            PathBuf::from("ch1").join("001.jpg")
        );
        assert_eq!(
            ImageEntry::new("./pages/002.png").relative_path().unwrap(),
            PathBuf::from("pages").join("002.png")
        );
        assert!(ImageEntry::new("../../etc/passwd.jpg").relative_path().is_err());
        assert!(ImageEntry::new("/abs/page.jpg").relative_path().is_err());
        assert!(ImageEntry::new("./").relative_path().is_err());
    }

    #[test]
    fn test_entries_order_by_name() {
        let mut entries = vec![
            ImageEntry::new("010.jpg"),
            ImageEntry::new("002.jpg"),
            ImageEntry::new("001.jpg"),
        ];
        entries.sort();
        let names: Vec<&str> = entries.iter().map(ImageEntry::name).collect();
        assert_eq!(names, vec!["001.jpg", "002.jpg", "010.jpg"]);
        assert_eq!(entries[0].stem(), "001");
    }

    #[test]
    fn test_concurrency_limits() {
        assert_eq!(ConcurrencyMode::Fixed(0).limit(), 1);
        assert_eq!(ConcurrencyMode::Fixed(3).limit(), 3);
        assert!(ConcurrencyMode::Half.limit() >= 1);
        assert!(ConcurrencyMode::Full.limit() >= ConcurrencyMode::Half.limit());
    }

    #[tokio::test]
    async fn test_abort_signal_wakes_waiters() {
        let signal = AbortSignal::new();
        assert!(signal.check().is_ok());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.aborted().await })
        };
        tokio::task::yield_now().await;
        signal.abort();

        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
        assert!(matches!(signal.check(), Err(Error::Aborted)));
        // Already raised: resolves immediately
        signal.aborted().await;
    }

    #[test]
    fn test_size_delta() {
        let mut result = ConversionResult::new(ArchivePath::new("a.cbz"), JobOutcome::Converted);
        result.original_size = 1000;
        assert_eq!(result.size_delta(), None);
        result.new_size = Some(400);
        assert_eq!(result.size_delta(), Some(600));
        result.new_size = Some(1500);
        assert_eq!(result.size_delta(), Some(-500));
        assert!(result.is_success());
    }
}
