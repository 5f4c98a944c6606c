//! Event channel between workers, the coordinator and the consumer.
//!
//! Workers and the coordinator hold cheap [`EventSender`] clones; a single
//! [`EventReceiver`] is handed to the consumer. The channel is unbounded so a slow
//! consumer never stalls transcoding.

use std::time::Duration;

use chrono::{DateTime, Local};
use image::RgbaImage;
use log::Level;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::types::{ArchivePath, ConversionResult};

/// One line of the user-facing log.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub level: Level,
    pub message: String,
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Everything the consumer can observe.
///
/// Events of one archive arrive in order: `Progress` percentages never decrease
/// and `Done` is the last event for that archive. Events of different archives
/// interleave freely.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Log(LogLine),
    Progress { archive: ArchivePath, percent: u8 },
    /// Bounded preview of the first page of an archive
    Thumbnail { archive: ArchivePath, image: RgbaImage },
    Done(ConversionResult),
    /// Aggregate counters, refreshed at batch start and after every completion
    Counters { completed: usize, total: usize },
    /// The engine went back to idle and accepts a new submission
    Idle { completed: usize, total: usize },
}

impl ProgressEvent {
    /// The archive this event belongs to, if any.
    pub fn archive(&self) -> Option<&ArchivePath> {
        match self {
            ProgressEvent::Progress { archive, .. } | ProgressEvent::Thumbnail { archive, .. } => {
                Some(archive)
            }
            ProgressEvent::Done(result) => Some(&result.archive),
            _ => None,
        }
    }
}

/// Creates a connected sender/receiver pair.
pub fn channel(poll_interval: Duration) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender { tx },
        EventReceiver {
            rx,
            poll_interval,
        },
    )
}

/// Producer half. Sending never blocks; events sent after the consumer went
/// away are dropped silently.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: UnboundedSender<ProgressEvent>,
}

impl EventSender {
    pub fn send(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    /// Emits a user-facing log line and mirrors it to the `log` facade.
    pub fn log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{}", message);
        self.send(ProgressEvent::Log(LogLine {
            at: Local::now(),
            level,
            message,
        }));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn progress(&self, archive: &ArchivePath, percent: u8) {
        self.send(ProgressEvent::Progress {
            archive: archive.clone(),
            percent: percent.min(100),
        });
    }

    pub fn thumbnail(&self, archive: &ArchivePath, image: RgbaImage) {
        self.send(ProgressEvent::Thumbnail {
            archive: archive.clone(),
            image,
        });
    }

    pub fn done(&self, result: ConversionResult) {
        self.send(ProgressEvent::Done(result));
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct EventReceiver {
    rx: UnboundedReceiver<ProgressEvent>,
    poll_interval: Duration,
}

impl EventReceiver {
    /// Waits for the next event. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Takes everything currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Sleeps one poll interval, then drains. Meant for consumers that refresh
    /// on a fixed cadence rather than per event.
    pub async fn next_batch(&mut self) -> Vec<ProgressEvent> {
        tokio::time::sleep(self.poll_interval).await;
        self.drain()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
