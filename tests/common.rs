//! Common test utilities and constants for the Shukusho crate.
//!
//! Provides per-test library folders, JPEG page and CBZ fixture builders, a
//! scriptable transcoder and an event collector.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng, distributions::Alphanumeric};
use shukusho::error::{Error, Result};
use shukusho::prelude::*;
use shukusho::transcoder::{ImageTranscoder, TranscodeStats, WebpTranscoder};
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::time::timeout;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

#[allow(dead_code)]
pub const TEST_TMP_DIR: &str = "tests/tmp";
#[allow(dead_code)]
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
#[allow(dead_code)]
pub const LONG_TEST_TIMEOUT: Duration = Duration::from_secs(120); // Full batches on slow CI runners

#[allow(dead_code)]
pub struct TestDirs {
    pub base: PathBuf,
    pub library: PathBuf,
}

/// Creates a fresh, uniquely named test directory with a `library` folder inside.
#[allow(dead_code)]
pub async fn setup_test_dirs(sub_path: &str) -> TestDirs {
    let rand_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let base = PathBuf::from(TEST_TMP_DIR).join(format!("{}-{}", sub_path, rand_string));
    if base.exists() {
        fs::remove_dir_all(&base).await.unwrap();
    }
    let library = base.join("library");
    fs::create_dir_all(&library).await.unwrap();

    TestDirs { base, library }
}

/// Encodes a noisy gradient as JPEG. The noise keeps quality differences visible
/// in the encoded size.
#[allow(dead_code)]
pub fn jpeg_page(width: u32, height: u32, seed: u64) -> Result<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let img = RgbImage::from_fn(width, height, |x, y| {
        let noise: u8 = rng.gen_range(0..64);
        Rgb([
            ((x * 255 / width.max(1)) as u8).saturating_add(noise),
            ((y * 255 / height.max(1)) as u8).saturating_add(noise / 2),
            noise.wrapping_mul(3),
        ])
    });

    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
    Ok(bytes)
}

/// Writes a JPEG page to disk.
#[allow(dead_code)]
pub async fn create_page_image(path: &Path, width: u32, height: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, jpeg_page(width, height, 7)?).await?;
    Ok(())
}

/// Writes a zip container with the given members.
#[allow(dead_code)]
pub fn write_cbz(path: &Path, members: &[(&str, Vec<u8>)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut zip = ZipWriter::new(std::fs::File::create(path)?);
    let options = SimpleFileOptions::default();
    for (name, bytes) in members {
        if name.ends_with('/') {
            zip.add_directory(*name, options)?;
        } else {
            zip.start_file(*name, options)?;
            zip.write_all(bytes)?;
        }
    }
    zip.finish()?;
    Ok(())
}

/// Bitwise CRC-32 (IEEE), as used by RAR headers and member checksums.
#[allow(dead_code)]
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for byte in bytes {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// RAR 4 block: the low half of the CRC-32 over everything after the CRC field.
#[allow(dead_code)]
fn rar_block(body: &[u8]) -> Vec<u8> {
    let mut block = ((crc32(body) & 0xFFFF) as u16).to_le_bytes().to_vec();
    block.extend_from_slice(body);
    block
}

/// Writes a RAR 4 container with the given members stored uncompressed.
#[allow(dead_code)]
pub fn write_cbr(path: &Path, members: &[(&str, Vec<u8>)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = b"Rar!\x1a\x07\x00".to_vec();

    // Main header: no flags, two reserved fields
    let mut main = vec![0x73, 0x00, 0x00];
    main.extend_from_slice(&13u16.to_le_bytes());
    main.extend_from_slice(&[0u8; 6]);
    bytes.extend(rar_block(&main));

    for (name, data) in members {
        let name = name.as_bytes();
        let mut header = vec![0x74];
        header.extend_from_slice(&0x8000u16.to_le_bytes());
        header.extend_from_slice(&(32 + name.len() as u16).to_le_bytes());
        header.extend_from_slice(&(data.len() as u32).to_le_bytes()); // packed size
        header.extend_from_slice(&(data.len() as u32).to_le_bytes()); // unpacked size
        header.push(0); // MS-DOS host
        header.extend_from_slice(&crc32(data).to_le_bytes());
        header.extend_from_slice(&0x5221_0000u32.to_le_bytes()); // 2021-01-01 00:00
        header.push(20); // version needed to extract
        header.push(0x30); // stored
        header.extend_from_slice(&(name.len() as u16).to_le_bytes());
        header.extend_from_slice(&0x20u32.to_le_bytes()); // archive attribute
        header.extend_from_slice(name);
        bytes.extend(rar_block(&header));
        bytes.extend_from_slice(data);
    }

    // End of archive
    bytes.extend_from_slice(&[0xC4, 0x3D, 0x7B, 0x00, 0x40, 0x07, 0x00]);
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Writes a CBZ holding `count` JPEG pages named `001.jpg`, `002.jpg`, ...
#[allow(dead_code)]
pub fn create_comic(path: &Path, count: usize) -> Result<()> {
    let mut members = Vec::with_capacity(count);
    let names: Vec<String> = (1..=count).map(|i| format!("{:03}.jpg", i)).collect();
    for (i, name) in names.iter().enumerate() {
        members.push((name.as_str(), jpeg_page(320, 480, i as u64)?));
    }
    write_cbz(path, &members)
}

/// Sorted member names of a zip container.
#[allow(dead_code)]
pub fn zip_member_names(path: &Path) -> Result<Vec<String>> {
    let zip = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    let mut names: Vec<String> = zip.file_names().map(str::to_string).collect();
    names.sort();
    Ok(names)
}

/// Reads one member of a zip container.
#[allow(dead_code)]
pub fn zip_member_bytes(path: &Path, name: &str) -> Result<Vec<u8>> {
    let mut zip = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    let mut member = zip.by_name(name)?;
    let mut bytes = Vec::new();
    member.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Names of hidden entries directly inside `dir` (leftover arenas or partial files).
#[allow(dead_code)]
pub fn hidden_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .filter(|name| name.starts_with('.'))
                .collect()
        })
        .unwrap_or_default()
}

/// Engine configuration for tests: no external tools, so results do not depend
/// on what the host has installed.
#[allow(dead_code)]
pub fn test_config() -> EngineConfigBuilder {
    let mut builder = EngineConfig::builder();
    builder.use_fallback_tools(false);
    builder
}

/// Receives events until the engine reports `Idle`.
#[allow(dead_code)]
pub async fn collect_until_idle(events: &mut EventReceiver) -> Vec<ProgressEvent> {
    let mut collected = Vec::new();
    timeout(LONG_TEST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            let idle = matches!(event, ProgressEvent::Idle { .. });
            collected.push(event);
            if idle {
                break;
            }
        }
    })
    .await
    .expect("Timed out waiting for the engine to go idle");
    collected
}

#[allow(dead_code)]
pub fn done_results(events: &[ProgressEvent]) -> Vec<&ConversionResult> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Done(result) => Some(result),
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn progress_of(events: &[ProgressEvent], archive: &Path) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Progress { archive: a, percent } if a.as_path() == archive => {
                Some(*percent)
            }
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn log_messages(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Log(line) => Some(line.message.clone()),
            _ => None,
        })
        .collect()
}

/// Wraps [`WebpTranscoder`] with an artificial delay, scripted failures and a
/// record of how many transcodes ran at the same time.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedTranscoder {
    inner: WebpTranscoder,
    delay: Duration,
    fail_marker: Option<String>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedTranscoder {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Pages whose file name contains `marker` fail to transcode.
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ImageTranscoder for ScriptedTranscoder {
    fn transcode(&self, source: &Path, dest: &Path, quality: u8) -> Result<TranscodeStats> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);

        let scripted_failure = self.fail_marker.as_deref().is_some_and(|marker| {
            source
                .file_name()
                .is_some_and(|name| name.to_string_lossy().contains(marker))
        });
        let result = if scripted_failure {
            Err(Error::Transcode {
                path: source.to_path_buf(),
                reason: "scripted failure".to_string(),
            })
        } else {
            self.inner.transcode(source, dest, quality)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn thumbnail(&self, source: &Path, max_width: u32, max_height: u32) -> Result<RgbaImage> {
        self.inner.thumbnail(source, max_width, max_height)
    }
}
