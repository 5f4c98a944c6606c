//! Shukusho - Comic Archive Recompression Library
//!
//! This crate finds every CBZ/CBR archive below a folder and rewrites each one as
//! a CBZ whose pages are lossy WebP, deleting the original once the new archive is
//! in place. Archives are processed concurrently, pages within one archive
//! sequentially, and progress is reported through an event channel.
//!
//! # Getting Started
//!
//! Start an [`Engine`] with an [`EngineConfig`], submit a folder, then consume
//! events until the engine reports it is idle again.
//!
//! ```rust,no_run
//! use shukusho::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> shukusho::error::Result<()> {
//!     // 1. Configure the engine (every field has a default)
//!     let config = EngineConfig::builder()
//!         .thumbnail_size((120, 180))
//!         .build()?;
//!
//!     // 2. Start it and submit a library folder at quality 80
//!     let (engine, mut events) = Engine::start(config);
//!     let report = engine
//!         .submit("./my_comics", 80, ConcurrencyMode::Half)
//!         .await?;
//!     println!("Converting {} comics", report.discovered);
//!
//!     // 3. Follow progress until the batch drains
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ProgressEvent::Log(line) => println!("{}", line),
//!             ProgressEvent::Progress { archive, percent } => {
//!                 println!("{}: {}%", archive.file_name(), percent)
//!             }
//!             ProgressEvent::Done(result) => println!("{:?}", result.outcome),
//!             ProgressEvent::Idle { .. } => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The library logs through the `log` facade and never installs a logger itself.

pub mod archive;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod path_utils;
pub mod scheduler;
pub mod transcoder;
pub mod types;
pub mod worker;

pub use engine::{Engine, EngineConfig, EngineConfigBuilder, SubmitReport};
pub use events::{EventReceiver, EventSender, LogLine, ProgressEvent};
pub use transcoder::{ImageTranscoder, WebpTranscoder};

// Re-export core types for direct access
pub use types::{
    AbortSignal, ArchiveKind, ArchivePath, ConcurrencyMode, ConversionResult, EngineSnapshot, ImageEntry, Job,
    JobOutcome,
};

/// Prelude module for convenient imports.
///
/// Brings in everything needed to start an engine and consume its events with a
/// single `use shukusho::prelude::*;` statement.
pub mod prelude {
    pub use super::{
        ArchivePath, ConcurrencyMode, ConversionResult, Engine, EngineConfig,
        EngineConfigBuilder, EngineSnapshot, EventReceiver, JobOutcome, LogLine, ProgressEvent,
        SubmitReport, error, types,
    };
    pub use crate::archive::{ArchiveAccessor, ExternalTool};
    pub use std::path::{Path, PathBuf};
    pub use std::sync::Arc;
}
