use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::ingest::{redact_locator, FrameSource, SourceOpener};
use crate::storage::{VideoWriter, VideoWriterFactory};

/// Record `duration` worth of frames from a fresh connection to `locator`.
///
/// The writer is sized from the first frame read. Recording stops early at end
/// of stream or on a read error after at least one frame; a clip with no frames
/// is an error and leaves no file behind. Returns the number of frames written.
pub fn record_clip(
    opener: &dyn SourceOpener,
    locator: &str,
    factory: &dyn VideoWriterFactory,
    path: &Path,
    duration: Duration,
    fps: f64,
) -> Result<u64> {
    let mut source = opener
        .open(locator)
        .with_context(|| format!("open clip source {}", redact_locator(locator)))?;
    let recorded = record_from(&mut *source, factory, path, duration, fps);
    source.close();
    recorded
}

fn record_from(
    source: &mut dyn FrameSource,
    factory: &dyn VideoWriterFactory,
    path: &Path,
    duration: Duration,
    fps: f64,
) -> Result<u64> {
    let started = Instant::now();
    let mut writer: Option<Box<dyn VideoWriter>> = None;

    while started.elapsed() < duration {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("clip source ended after {:?}", started.elapsed());
                break;
            }
            Err(e) if writer.is_some() => {
                log::warn!("clip source read failed, keeping partial clip: {:#}", e);
                break;
            }
            Err(e) => return Err(e.context("read first clip frame")),
        };
        if writer.is_none() {
            writer = Some(factory.create(path, frame.resolution(), fps)?);
        }
        if let Some(out) = writer.as_mut() {
            out.write_frame(&frame)?;
        }
    }

    let writer = writer.ok_or_else(|| anyhow!("no frames recorded for {}", path.display()))?;
    writer.finish()
}
