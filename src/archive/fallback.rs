use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;

use crate::archive::{ArchiveAccessor, ImageExtensions, image_entries};
use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::path_utils::get_file_name_lossy;
use crate::types::{AbortSignal, ArchiveKind, ImageEntry};

lazy_static! {
    /// `Path = <member>` line of a `7z l -slt` listing.
    static ref SEVEN_ZIP_PATH: Regex = Regex::new(r"^Path = (.+)$").unwrap();
    /// `Folder = +` marks directories in a `7z l -slt` listing.
    static ref SEVEN_ZIP_FOLDER: Regex = Regex::new(r"^Folder = (\+|-)$").unwrap();
}

static UNRAR_BINARY: OnceLock<Option<PathBuf>> = OnceLock::new();
static SEVEN_ZIP_BINARY: OnceLock<Option<PathBuf>> = OnceLock::new();

/// External archivers tried when a built-in codec cannot read an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalTool {
    Unrar,
    SevenZip,
}

impl ExternalTool {
    pub const ALL: [ExternalTool; 2] = [ExternalTool::Unrar, ExternalTool::SevenZip];

    /// Ordered fallback chain for a container family.
    pub fn chain_for(kind: ArchiveKind) -> &'static [ExternalTool] {
        match kind {
            ArchiveKind::Rar => &[ExternalTool::Unrar, ExternalTool::SevenZip],
            ArchiveKind::Zip => &[ExternalTool::SevenZip],
        }
    }

    fn candidates(&self) -> &'static [&'static str] {
        match self {
            ExternalTool::Unrar => &["unrar"],
            ExternalTool::SevenZip => &["7z", "7zz", "7za"],
        }
    }

    /// Resolved executable, looked up once per process.
    pub fn binary(&self) -> Option<&'static Path> {
        let cell = match self {
            ExternalTool::Unrar => &UNRAR_BINARY,
            ExternalTool::SevenZip => &SEVEN_ZIP_BINARY,
        };
        cell.get_or_init(|| {
            self.candidates()
                .iter()
                .find_map(|candidate| which::which(candidate).ok())
        })
        .as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.binary().is_some()
    }

    /// Tools of [`ExternalTool::ALL`] that are not installed.
    pub fn missing() -> Vec<ExternalTool> {
        Self::ALL
            .iter()
            .copied()
            .filter(|tool| !tool.is_available())
            .collect()
    }

    /// Runs the tool to completion. Raising `abort` kills the process.
    async fn run(&self, args: Vec<std::ffi::OsString>, abort: &AbortSignal) -> Result<String> {
        let binary = self
            .binary()
            .ok_or_else(|| Error::NotInstalled(self.to_string()))?;
        abort.check()?;

        let child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the pending wait drops the child, which kills it
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = abort.aborted() => return Err(Error::Aborted),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().lines().last().unwrap_or("").to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Other(format!(
                "{} exited with {}: {}",
                self, output.status, detail
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Raw member names of `archive`.
    pub async fn list(&self, archive: &Path) -> Result<Vec<String>> {
        // Listing is short and happens before a job owns anything on disk
        let never = AbortSignal::new();
        match self {
            ExternalTool::Unrar => {
                let stdout = self
                    .run(vec!["lb".into(), "-p-".into(), archive.into()], &never)
                    .await?;
                Ok(parse_unrar_bare_listing(&stdout))
            }
            ExternalTool::SevenZip => {
                let stdout = self
                    .run(vec!["l".into(), "-slt".into(), archive.into()], &never)
                    .await?;
                Ok(parse_seven_zip_listing(&stdout))
            }
        }
    }

    /// Extracts the named members of `archive` below `dest`, keeping their paths.
    pub async fn extract(
        &self,
        archive: &Path,
        names: &[&str],
        dest: &Path,
        abort: &AbortSignal,
    ) -> Result<()> {
        let mut args: Vec<std::ffi::OsString> = match self {
            ExternalTool::Unrar => vec![
                "x".into(),
                "-o+".into(),
                "-p-".into(),
                "-y".into(),
                archive.into(),
            ],
            ExternalTool::SevenZip => {
                let mut output_switch = std::ffi::OsString::from("-o");
                output_switch.push(dest);
                vec!["x".into(), "-y".into(), output_switch, archive.into()]
            }
        };
        args.extend(names.iter().map(|name| std::ffi::OsString::from(*name)));

        if *self == ExternalTool::Unrar {
            // unrar needs a trailing separator to treat the last argument as a directory
            let mut destination = dest.as_os_str().to_owned();
            destination.push(std::path::MAIN_SEPARATOR_STR);
            args.push(destination);
        }

        self.run(args, abort).await.map(|_| ())
    }
}

impl fmt::Display for ExternalTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalTool::Unrar => write!(f, "unrar"),
            ExternalTool::SevenZip => write!(f, "7z"),
        }
    }
}

/// Parses `unrar lb`: one member name per line.
pub fn parse_unrar_bare_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| line.replace('\\', "/"))
        .collect()
}

/// Parses `7z l -slt`: member blocks follow the `----------` separator, each
/// with a `Path =` line and, for directories, `Folder = +`.
pub fn parse_seven_zip_listing(stdout: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_members = false;
    let mut current: Option<String> = None;
    let mut current_is_folder = false;

    let mut flush = |current: &mut Option<String>, is_folder: &mut bool| {
        if let Some(name) = current.take() {
            if !*is_folder {
                names.push(name.replace('\\', "/"));
            }
        }
        *is_folder = false;
    };

    for line in stdout.lines() {
        let line = line.trim_end();
        if !in_members {
            in_members = line.starts_with("----------");
            continue;
        }
        if line.is_empty() {
            flush(&mut current, &mut current_is_folder);
            continue;
        }
        if let Some(captures) = SEVEN_ZIP_PATH.captures(line) {
            flush(&mut current, &mut current_is_folder);
            current = captures.get(1).map(|m| m.as_str().to_string());
        } else if let Some(captures) = SEVEN_ZIP_FOLDER.captures(line) {
            current_is_folder = captures.get(1).map(|m| m.as_str()) == Some("+");
        }
    }
    flush(&mut current, &mut current_is_folder);

    names
}

/// Decorates a primary accessor with an ordered chain of external tools.
///
/// Reads go to the primary codec first. When it fails, each tool is tried in
/// order and every failure is reported with its own error, as a separate log
/// event when an [`EventSender`] is attached. Only when the whole chain failed
/// is an error returned, listing every attempt. Writes always go to the primary
/// accessor.
pub struct FallbackAccessor {
    primary: Box<dyn ArchiveAccessor>,
    tools: Vec<ExternalTool>,
    extensions: ImageExtensions,
    events: Option<EventSender>,
}

impl FallbackAccessor {
    pub fn new(
        primary: Box<dyn ArchiveAccessor>,
        tools: Vec<ExternalTool>,
        extensions: ImageExtensions,
    ) -> Self {
        Self {
            primary,
            tools,
            extensions,
            events: None,
        }
    }

    /// Reports every failed attempt on `events` as its own log line.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    fn record(&self, attempts: &mut Vec<String>, archive: &Path, who: &str, error: &Error) {
        let message = format!("{} failed on {}: {}", who, get_file_name_lossy(archive), error);
        match &self.events {
            Some(events) => events.warn(message),
            None => log::warn!("{}", message),
        }
        attempts.push(format!("{}: {}", who, error));
    }
}

#[async_trait]
impl ArchiveAccessor for FallbackAccessor {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn list_images(&self, archive: &Path) -> Result<Vec<ImageEntry>> {
        let primary_error = match self.primary.list_images(archive).await {
            Ok(entries) => return Ok(entries),
            Err(e) => e,
        };

        let mut attempts = Vec::new();
        self.record(&mut attempts, archive, self.primary.name(), &primary_error);

        for tool in &self.tools {
            log::debug!("Listing {:?} with {}", archive.file_name(), tool);
            match tool.list(archive).await {
                Ok(names) => return Ok(image_entries(names, &self.extensions)),
                Err(e) => self.record(&mut attempts, archive, &tool.to_string(), &e),
            }
        }

        Err(Error::ArchiveOpen {
            path: archive.to_path_buf(),
            reason: attempts.join("; "),
        })
    }

    async fn extract_selected(
        &self,
        archive: &Path,
        entries: &[ImageEntry],
        dest: &Path,
        abort: &AbortSignal,
    ) -> Result<()> {
        // Unsafe member names never reach a fallback tool
        for entry in entries {
            entry.relative_path()?;
        }

        let primary_error = match self
            .primary
            .extract_selected(archive, entries, dest, abort)
            .await
        {
            Ok(()) => return Ok(()),
            Err(Error::Aborted) => return Err(Error::Aborted),
            Err(e) => e,
        };

        let mut attempts = Vec::new();
        self.record(&mut attempts, archive, self.primary.name(), &primary_error);

        let names: Vec<&str> = entries.iter().map(|entry| entry.name()).collect();
        for tool in &self.tools {
            log::debug!("Extracting {:?} with {}", archive.file_name(), tool);
            match tool.extract(archive, &names, dest, abort).await {
                Ok(()) => return Ok(()),
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => self.record(&mut attempts, archive, &tool.to_string(), &e),
            }
        }

        Err(Error::extract(archive, attempts.join("; ")))
    }

    async fn write_archive(
        &self,
        dest: &Path,
        source_dir: &Path,
        suffix: &str,
        abort: &AbortSignal,
    ) -> Result<usize> {
        self.primary
            .write_archive(dest, source_dir, suffix, abort)
            .await
    }
}
