//! Persisted capture artifacts.
//!
//! Snapshots are JPEG stills; clips are Motion-JPEG video in an AVI container
//! with the recording frame rate in its stream header. Both are named from the trigger identifier: `motion_<YYYYmmdd_HHMMSS>.<ext>`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::frame::Frame;
use crate::geometry::Resolution;

pub const ARTIFACT_PREFIX: &str = "motion";
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Trigger identifier derived from a timestamp, in local time.
pub fn trigger_id(timestamp: SystemTime) -> String {
    DateTime::<Local>::from(timestamp)
        .format("%Y%m%d_%H%M%S")
        .to_string()
}

/// Where snapshots and clips go.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    image_dir: PathBuf,
    video_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(image_dir: impl Into<PathBuf>, video_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            video_dir: video_dir.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn video_dir(&self) -> &Path {
        &self.video_dir
    }

    /// Create both directories if they do not exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.image_dir, &self.video_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create artifact directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn snapshot_path(&self, id: &str, extension: &str) -> PathBuf {
        self.image_dir
            .join(format!("{}_{}.{}", ARTIFACT_PREFIX, id, extension))
    }

    pub fn clip_path(&self, id: &str, extension: &str) -> PathBuf {
        self.video_dir
            .join(format!("{}_{}.{}", ARTIFACT_PREFIX, id, extension))
    }
}

/// Writes still images.
pub trait ImageWriter: Send + Sync {
    /// File extension without the dot.
    fn extension(&self) -> &str;

    fn write_image(&self, path: &Path, frame: &Frame) -> Result<()>;
}

/// Receives the frames of one clip.
pub trait VideoWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. Returns the number of frames written.
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Opens `VideoWriter`s.
pub trait VideoWriterFactory: Send + Sync {
    /// File extension without the dot.
    fn extension(&self) -> &str;

    fn create(&self, path: &Path, size: Resolution, fps: f64) -> Result<Box<dyn VideoWriter>>;
}

/// JPEG snapshot writer.
#[derive(Clone, Debug)]
pub struct JpegImageWriter {
    quality: u8,
}

impl JpegImageWriter {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegImageWriter {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl ImageWriter for JpegImageWriter {
    fn extension(&self) -> &str {
        "jpg"
    }

    fn write_image(&self, path: &Path, frame: &Frame) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("create snapshot {}", path.display()))?;
        let mut out = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(frame.image())
            .with_context(|| format!("encode snapshot {}", path.display()))?;
        out.flush()
            .with_context(|| format!("flush snapshot {}", path.display()))?;
        Ok(())
    }
}

/// Motion-JPEG clips in an AVI (RIFF) container.
#[derive(Clone, Debug)]
pub struct AviWriterFactory {
    quality: u8,
}

impl AviWriterFactory {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for AviWriterFactory {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl VideoWriterFactory for AviWriterFactory {
    fn extension(&self) -> &str {
        "avi"
    }

    fn create(&self, path: &Path, size: Resolution, fps: f64) -> Result<Box<dyn VideoWriter>> {
        if size.is_empty() {
            return Err(anyhow!("clip size {} is empty", size));
        }
        if size.width > i16::MAX as u32 || size.height > i16::MAX as u32 {
            return Err(anyhow!("clip size {} is too large for AVI", size));
        }
        if !fps.is_finite() || fps <= 0.0 {
            return Err(anyhow!("clip frame rate must be positive, got {}", fps));
        }
        let partial = partial_path(path);
        let file = File::create(&partial)
            .with_context(|| format!("create clip {}", partial.display()))?;
        let mut out = BufWriter::new(file);
        // Placeholder header, rewritten with the final counts by `finish`.
        out.write_all(&avi_header(size, fps, 0, 0, 4))
            .with_context(|| format!("write clip header {}", partial.display()))?;
        log::debug!("recording {} at {} ({} fps)", path.display(), size, fps);
        Ok(Box::new(AviWriter {
            path: path.to_path_buf(),
            partial,
            out,
            size,
            fps,
            quality: self.quality,
            index: Vec::new(),
            movi_len: 4,
            encoded: Vec::new(),
        }))
    }
}

/// Offset of each frame chunk relative to the `movi` fourcc, and its payload size.
struct IndexEntry {
    offset: u32,
    size: u32,
}

/// Frames go to `<path>.part` until `finish` writes the index, fills in the
/// header and renames the file into place.
struct AviWriter {
    path: PathBuf,
    partial: PathBuf,
    out: BufWriter<File>,
    size: Resolution,
    fps: f64,
    quality: u8,
    index: Vec<IndexEntry>,
    /// Bytes in the `movi` list, including its fourcc.
    movi_len: u32,
    encoded: Vec<u8>,
}

impl VideoWriter for AviWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        // Every frame of a clip has the size the clip was opened with.
        let frame = if frame.resolution() == self.size {
            std::borrow::Cow::Borrowed(frame)
        } else {
            std::borrow::Cow::Owned(frame.resized(self.size))
        };
        self.encoded.clear();
        JpegEncoder::new_with_quality(&mut self.encoded, self.quality)
            .encode_image(frame.image())
            .with_context(|| format!("encode clip frame {}", self.index.len()))?;

        let size = u32::try_from(self.encoded.len()).context("clip frame too large")?;
        let padded = size + (size & 1);
        let movi_len = self
            .movi_len
            .checked_add(8 + padded)
            .ok_or_else(|| anyhow!("clip {} exceeds the AVI size limit", self.path.display()))?;

        self.out.write_all(FRAME_CHUNK)?;
        self.out.write_all(&size.to_le_bytes())?;
        self.out.write_all(&self.encoded)?;
        if size & 1 == 1 {
            self.out.write_all(&[0])?;
        }
        self.index.push(IndexEntry {
            offset: self.movi_len,
            size,
        });
        self.movi_len = movi_len;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64> {
        let frames = self.index.len() as u32;
        let mut idx1 = Vec::with_capacity(8 + self.index.len() * 16);
        idx1.extend_from_slice(b"idx1");
        idx1.extend_from_slice(&(frames * 16).to_le_bytes());
        for entry in &self.index {
            idx1.extend_from_slice(FRAME_CHUNK);
            idx1.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
            idx1.extend_from_slice(&entry.offset.to_le_bytes());
            idx1.extend_from_slice(&entry.size.to_le_bytes());
        }
        let largest = self.index.iter().map(|e| e.size).max().unwrap_or(0);
        let header = avi_header(self.size, self.fps, frames, largest, self.movi_len);

        let partial = self.partial.clone();
        let write = |out: &mut BufWriter<File>| -> std::io::Result<()> {
            out.write_all(&idx1)?;
            out.seek(SeekFrom::Start(0))?;
            out.write_all(&header)?;
            out.flush()
        };
        write(&mut self.out).with_context(|| format!("finish clip {}", partial.display()))?;

        std::fs::rename(&self.partial, &self.path).with_context(|| {
            format!(
                "move clip {} to {}",
                self.partial.display(),
                self.path.display()
            )
        })?;
        Ok(u64::from(frames))
    }
}

const FRAME_CHUNK: &[u8; 4] = b"00dc";
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
/// `strh` stores the rate as `rate / scale`.
const AVI_RATE_SCALE: u32 = 1000;
/// Bytes before the first frame chunk: RIFF, hdrl and the `movi` list header.
const AVI_HEADER_LEN: usize = 224;

/// RIFF header through the `movi` fourcc for a single MJPEG video stream.
fn avi_header(size: Resolution, fps: f64, frames: u32, largest: u32, movi_len: u32) -> Vec<u8> {
    fn chunk(out: &mut Vec<u8>, id: &[u8; 4], len: u32) {
        out.extend_from_slice(id);
        out.extend_from_slice(&len.to_le_bytes());
    }
    fn u32le(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }
    fn u16le(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    let micros_per_frame = (1_000_000.0 / fps).round() as u32;
    let rate = (fps * AVI_RATE_SCALE as f64).round() as u32;
    let index_len = 8 + frames * 16;
    // Everything after "RIFF" + size: "AVI ", hdrl list, movi list, idx1.
    let riff_len = 4 + (8 + 192) + (8 + movi_len) + index_len;
    let max_bytes_per_sec = (largest as f64 * fps).round() as u32;

    let mut h = Vec::with_capacity(AVI_HEADER_LEN);
    chunk(&mut h, b"RIFF", riff_len);
    h.extend_from_slice(b"AVI ");
    chunk(&mut h, b"LIST", 192);
    h.extend_from_slice(b"hdrl");

    chunk(&mut h, b"avih", 56);
    u32le(&mut h, micros_per_frame);
    u32le(&mut h, max_bytes_per_sec);
    u32le(&mut h, 0);
    u32le(&mut h, AVIF_HASINDEX);
    u32le(&mut h, frames);
    u32le(&mut h, 0);
    u32le(&mut h, 1);
    u32le(&mut h, largest);
    u32le(&mut h, size.width);
    u32le(&mut h, size.height);
    h.extend_from_slice(&[0; 16]);

    chunk(&mut h, b"LIST", 116);
    h.extend_from_slice(b"strl");
    chunk(&mut h, b"strh", 56);
    h.extend_from_slice(b"vids");
    h.extend_from_slice(b"MJPG");
    u32le(&mut h, 0);
    u16le(&mut h, 0);
    u16le(&mut h, 0);
    u32le(&mut h, 0);
    u32le(&mut h, AVI_RATE_SCALE);
    u32le(&mut h, rate);
    u32le(&mut h, 0);
    u32le(&mut h, frames);
    u32le(&mut h, largest);
    u32le(&mut h, u32::MAX);
    u32le(&mut h, 0);
    u16le(&mut h, 0);
    u16le(&mut h, 0);
    u16le(&mut h, size.width as u16);
    u16le(&mut h, size.height as u16);

    chunk(&mut h, b"strf", 40);
    u32le(&mut h, 40);
    u32le(&mut h, size.width);
    u32le(&mut h, size.height);
    u16le(&mut h, 1);
    u16le(&mut h, 24);
    h.extend_from_slice(b"MJPG");
    u32le(&mut h, size.width * size.height * 3);
    h.extend_from_slice(&[0; 16]);

    chunk(&mut h, b"LIST", movi_len);
    h.extend_from_slice(b"movi");
    debug_assert_eq!(h.len(), AVI_HEADER_LEN);
    h
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
