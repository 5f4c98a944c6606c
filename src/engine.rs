//! The conversion engine: configuration, the public handle and the coordinator.
//!
//! [`Engine::start`] spawns a single coordinator task that owns the
//! [`EngineState`]. The [`Engine`] handle talks to it through a command
//! channel, and workers report back through an event channel. The coordinator
//! is the only place where admission decisions are made, so the concurrency
//! limit holds no matter how slowly the consumer drains its events.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::spawn_blocking;

use crate::archive::{ExternalTool, ImageExtensions};
use crate::discovery::discover;
use crate::error::{Error, Result};
use crate::events::{self, EventReceiver, EventSender, ProgressEvent};
use crate::scheduler::EngineState;
use crate::transcoder::{ImageTranscoder, WebpTranscoder, validate_quality};
use crate::types::{
    ConcurrencyMode, ConversionResult, DEFAULT_IMAGE_EXTENSIONS, EngineSnapshot, Job,
};
use crate::worker::{ConversionWorker, WorkerContext};

/// Engine-wide settings, built declaratively using the builder pattern.
///
/// Everything has a sensible default, so `EngineConfig::builder().build()` is a
/// valid configuration. Per-batch parameters (root, quality, concurrency) are
/// arguments of [`Engine::submit`] instead.
///
/// ```rust,no_run
/// # use shukusho::prelude::*;
/// # use std::time::Duration;
/// let config = EngineConfig::builder()
///     .thumbnail_size((200, 300))
///     .job_deadline(Duration::from_secs(600))
///     .replace_partial(true)
///     .build()
///     .expect("Invalid configuration");
/// ```
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EngineConfig {
    /// Bounding box of the preview emitted for the first page of each archive.
    #[builder(default = "(100, 150)")]
    pub thumbnail_size: (u32, u32),

    /// Cadence of [`EventReceiver::next_batch`].
    #[builder(default = "Duration::from_millis(100)")]
    pub poll_interval: Duration,

    /// Upper bound on one archive's whole pipeline. `None` disables it.
    ///
    /// A job that hits the deadline is reported as failed and its original is
    /// left untouched.
    #[builder(default = "Some(Duration::from_secs(30 * 60))")]
    pub job_deadline: Option<Duration>,

    /// Repack an archive even when some of its pages failed to transcode.
    ///
    /// Off by default: any failed page keeps the original archive.
    #[builder(default = "false")]
    pub replace_partial: bool,

    /// Retry failed reads through `unrar` / `7z` when they are installed.
    #[builder(default = "true")]
    pub use_fallback_tools: bool,

    /// Where scratch arenas are created. Defaults to the archive's own folder.
    #[builder(setter(into, strip_option), default)]
    pub scratch_root: Option<PathBuf>,

    /// Member extensions treated as pages, compared case-insensitively.
    #[builder(default = "DEFAULT_IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect()")]
    pub image_extensions: Vec<String>,
}

impl EngineConfig {
    /// Creates a new builder for configuring `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: (100, 150),
            poll_interval: Duration::from_millis(100),
            job_deadline: Some(Duration::from_secs(30 * 60)),
            replace_partial: false,
            use_fallback_tools: true,
            scratch_root: None,
            image_extensions: DEFAULT_IMAGE_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

impl EngineConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some((width, height)) = self.thumbnail_size {
            if width == 0 || height == 0 {
                return Err("Thumbnail bounds must be greater than zero.".to_string());
            }
        }
        if let Some(interval) = self.poll_interval {
            if interval.is_zero() {
                return Err("Poll interval must be greater than zero.".to_string());
            }
        }
        if let Some(Some(deadline)) = self.job_deadline {
            if deadline.is_zero() {
                return Err("Job deadline must be greater than zero.".to_string());
            }
        }
        if let Some(extensions) = &self.image_extensions {
            if extensions.iter().all(|e| e.trim().is_empty()) {
                return Err("At least one image extension is required.".to_string());
            }
        }
        Ok(())
    }
}

/// What [`Engine::submit`] accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SubmitReport {
    /// Archives found below the root
    pub discovered: usize,
    /// Jobs started right away
    pub admitted: usize,
    /// Concurrency limit of this batch
    pub limit: usize,
}

enum Command {
    Submit {
        root: PathBuf,
        quality: u8,
        mode: ConcurrencyMode,
        reply: oneshot::Sender<Result<SubmitReport>>,
    },
    Cancel {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
}

/// Handle to a running engine. Cheap to clone.
///
/// The coordinator task stops once every handle is dropped and the current
/// batch, if any, has drained.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    config: Arc<EngineConfig>,
}

impl Engine {
    /// Starts an engine with the WebP transcoder.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: EngineConfig) -> (Engine, EventReceiver) {
        Self::with_transcoder(config, Arc::new(WebpTranscoder))
    }

    /// Starts an engine with a custom page transcoder.
    pub fn with_transcoder(
        config: EngineConfig,
        transcoder: Arc<dyn ImageTranscoder>,
    ) -> (Engine, EventReceiver) {
        let config = Arc::new(config);
        let (events, receiver) = events::channel(config.poll_interval);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let (coordinator, worker_rx) = Coordinator::new(Arc::clone(&config), transcoder, events);
        tokio::spawn(coordinator.run(command_rx, worker_rx));

        (Engine { commands, config }, receiver)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Scans `root` and starts converting every archive found below it.
    ///
    /// # Returns
    /// * `Ok(SubmitReport)` - The batch was accepted (possibly with zero jobs)
    /// * `Err(Error::Busy)` - A batch is still running or draining
    /// * `Err(Error::InvalidQuality)` - `quality` is outside `1..=100`
    /// * `Err(Error::Discovery)` - `root` is missing or unreadable
    pub async fn submit(
        &self,
        root: impl Into<PathBuf>,
        quality: u8,
        mode: ConcurrencyMode,
    ) -> Result<SubmitReport> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Submit {
            root: root.into(),
            quality,
            mode,
            reply,
        })?;
        response.await.map_err(|_| Error::EngineStopped)?
    }

    /// Drops every pending job. Jobs already running finish normally.
    ///
    /// Returns how many pending jobs were dropped.
    pub async fn cancel(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Cancel { reply })?;
        response.await.map_err(|_| Error::EngineStopped)
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        response.await.map_err(|_| Error::EngineStopped)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::EngineStopped)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("stopped", &self.commands.is_closed())
            .finish()
    }
}

/// Owns the scheduler state. Runs as one task per engine.
struct Coordinator {
    config: Arc<EngineConfig>,
    extensions: ImageExtensions,
    transcoder: Arc<dyn ImageTranscoder>,
    state: EngineState,
    /// Consumer-facing channel
    events: EventSender,
    /// Handed to workers; read back by the coordinator
    worker_events: EventSender,
    context: Option<Arc<WorkerContext>>,
    next_token: u64,
}

impl Coordinator {
    fn new(
        config: Arc<EngineConfig>,
        transcoder: Arc<dyn ImageTranscoder>,
        events: EventSender,
    ) -> (Self, EventReceiver) {
        let extensions: ImageExtensions = Arc::new(
            config
                .image_extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        );
        let (worker_events, worker_rx) = events::channel(config.poll_interval);

        let coordinator = Self {
            config,
            extensions,
            transcoder,
            state: EngineState::new(),
            events,
            worker_events,
            context: None,
            next_token: 0,
        };
        (coordinator, worker_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut worker_rx: EventReceiver,
    ) {
        self.report_missing_tools().await;
        let mut accepting = true;

        loop {
            tokio::select! {
                biased;
                command = commands.recv(), if accepting => match command {
                    Some(command) => self.handle(command).await,
                    None => accepting = false,
                },
                Some(event) = worker_rx.recv() => self.on_worker_event(event),
            }

            if !accepting && !self.state.is_running() {
                log::debug!("All engine handles dropped, coordinator exiting");
                break;
            }
        }
    }

    async fn report_missing_tools(&self) {
        if !self.config.use_fallback_tools {
            return;
        }
        let missing = spawn_blocking(ExternalTool::missing)
            .await
            .unwrap_or_default();
        if missing.len() == ExternalTool::ALL.len() {
            self.events.warn(
                "Neither unrar nor 7z was found; archives the built-in codecs cannot read will fail.",
            );
        } else {
            for tool in missing {
                log::info!("Fallback tool {} is not installed", tool);
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit {
                root,
                quality,
                mode,
                reply,
            } => {
                let accepted = self.submit(root, quality, mode).await;
                let _ = reply.send(accepted);
            }
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }

    async fn submit(
        &mut self,
        root: PathBuf,
        quality: u8,
        mode: ConcurrencyMode,
    ) -> Result<SubmitReport> {
        if self.state.is_running() {
            self.events
                .warn("Already converting, please wait or cancel first.");
            return Err(Error::Busy);
        }
        if let Err(e) = validate_quality(quality) {
            self.events.warn(e.to_string());
            return Err(e);
        }

        let report = match discover(&root).await {
            Ok(report) => report,
            Err(e) => {
                self.events.warn(e.to_string());
                return Err(e);
            }
        };
        for (dir, reason) in &report.skipped {
            self.events
                .warn(format!("Skipping unreadable folder {:?}: {}", dir, reason));
        }

        let limit = mode.limit();
        if report.archives.is_empty() {
            self.events.info("No CBR/CBZ comics found.");
            self.events.send(ProgressEvent::Idle {
                completed: 0,
                total: 0,
            });
            return Ok(SubmitReport {
                discovered: 0,
                admitted: 0,
                limit,
            });
        }

        self.context = Some(Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            extensions: Arc::clone(&self.extensions),
            transcoder: Arc::clone(&self.transcoder),
            quality,
            events: self.worker_events.clone(),
        }));

        let discovered = report.archives.len();
        let jobs: Vec<Job> = report.archives.into_iter().map(Job::new).collect();
        self.state.begin(jobs, limit);

        self.events.info(format!(
            "Found {} comics. Starting conversion with {} workers...",
            discovered, limit
        ));
        self.send_counters();
        let admitted = self.admit();

        Ok(SubmitReport {
            discovered,
            admitted,
            limit,
        })
    }

    fn cancel(&mut self) -> usize {
        if !self.state.is_running() {
            log::debug!("Cancel requested while idle");
            return 0;
        }
        let dropped = self.state.cancel();
        self.events.info(format!(
            "Conversion stopped by user. {} pending comics dropped.",
            dropped
        ));
        if self.state.is_drained() {
            self.finish();
        }
        dropped
    }

    fn on_worker_event(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Done(result) => {
                self.state.complete();
                self.events.done(result);
                self.send_counters();
                self.admit();
                if self.state.is_drained() {
                    self.finish();
                }
            }
            other => self.events.send(other),
        }
    }

    /// Starts as many pending jobs as the limit allows.
    fn admit(&mut self) -> usize {
        let Some(context) = self.context.clone() else {
            return 0;
        };
        let jobs = self.state.admit_available();
        let admitted = jobs.len();
        for job in jobs {
            self.next_token += 1;
            spawn_worker(
                ConversionWorker::new(job, self.next_token, Arc::clone(&context)),
                self.worker_events.clone(),
            );
        }
        admitted
    }

    fn send_counters(&self) {
        let (completed, total) = self.state.counters();
        self.events
            .send(ProgressEvent::Counters { completed, total });
    }

    fn finish(&mut self) {
        let cancelled = self.state.snapshot().cancelled;
        let (completed, total) = self.state.finish();
        self.context = None;

        if cancelled {
            self.events.info(format!(
                "Conversion stopped after {} of {} comics.",
                completed, total
            ));
        } else {
            self.events.info("All conversions finished");
        }
        self.events
            .send(ProgressEvent::Idle { completed, total });
    }
}

/// Runs one worker and guarantees exactly one `Done`, even if it panics.
fn spawn_worker(worker: ConversionWorker, events: EventSender) {
    tokio::spawn(async move {
        let archive = worker.archive().clone();
        let result = match AssertUnwindSafe(worker.run()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                events.warn(format!(
                    "Worker for {} panicked: {}",
                    archive.file_name(),
                    reason
                ));
                ConversionResult::failed(archive, 0, &Error::Other(reason))
            }
        };
        events.done(result);
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
