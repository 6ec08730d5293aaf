//! Stream frame source.
//!
//! `RtspSource` decodes network camera streams with GStreamer (feature
//! `rtsp-gstreamer`). Locators starting with `stub://` get a synthetic scene
//! instead, so the whole pipeline runs without a camera:
//! a flat background in which a bright square drifts across the frame during the
//! second half of every `motion_period` frames.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
use anyhow::Result;
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant, SystemTime};

use super::{redact_locator, FrameSource, SourceOpener};
use crate::frame::Frame;

/// Configuration for a stream source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Stream locator (e.g. "rtsp://192.168.1.100:554/stream"). May carry credentials.
    pub url: String,
    /// Target frame rate. Synthetic sources are paced to it; 0 disables pacing.
    pub target_fps: u32,
    /// Frame width for synthetic frames.
    pub width: u32,
    /// Frame height for synthetic frames.
    pub height: u32,
    /// Synthetic scene cycle length in frames.
    pub motion_period: u64,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
            motion_period: 100,
        }
    }
}

/// Stream frame source.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "stream {} requires the rtsp-gstreamer feature",
                    redact_locator(&config.url)
                )
            }
        }
    }

    /// Connect to the stream.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }
}

impl FrameSource for RtspSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(_) => true,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }
}

/// Opens fresh `RtspSource` connections, e.g. for clip recording.
#[derive(Clone, Debug)]
pub struct StreamOpener {
    template: RtspConfig,
}

impl StreamOpener {
    /// `template` supplies everything except the locator.
    pub fn new(template: RtspConfig) -> Self {
        Self { template }
    }

    pub fn open_source(&self, locator: &str) -> Result<RtspSource> {
        let config = RtspConfig {
            url: locator.to_string(),
            ..self.template.clone()
        };
        let mut source = RtspSource::new(config)?;
        source.connect()?;
        Ok(source)
    }
}

impl SourceOpener for StreamOpener {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(self.open_source(locator)?))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

const BACKGROUND: Rgb<u8> = Rgb([48, 52, 56]);
const SUBJECT: Rgb<u8> = Rgb([235, 235, 235]);

struct SyntheticSource {
    config: RtspConfig,
    frame_count: u64,
    next_deadline: Option<Instant>,
}

impl SyntheticSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            next_deadline: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        log::info!(
            "RtspSource: connected to {} (synthetic)",
            redact_locator(&self.config.url)
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.pace();
        let image = self.render();
        self.frame_count += 1;
        Ok(Some(Frame::new(image, SystemTime::now())))
    }

    /// Sleep until the next frame is due at `target_fps`.
    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let period = Duration::from_secs(1) / self.config.target_fps;
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + period);
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.config.width.max(1), self.config.height.max(1));
        let mut image = RgbImage::from_pixel(w, h, BACKGROUND);

        let period = self.config.motion_period.max(2);
        let phase = self.frame_count % period;
        if phase < period / 2 {
            return image;
        }

        let side = (w.min(h) / 6).max(1);
        let travel = w.saturating_sub(side).max(1) as u64;
        let step = (phase - period / 2) * 4;
        let x0 = (step % travel) as u32;
        let y0 = (h - side.min(h)) / 2;
        for y in y0..(y0 + side).min(h) {
            for x in x0..(x0 + side).min(w) {
                image.put_pixel(x, y, SUBJECT);
            }
        }
        image
    }

    fn close(&mut self) {
        log::debug!(
            "RtspSource: closed {} after {} frames",
            redact_locator(&self.config.url),
            self.frame_count
        );
    }
}

// ----------------------------------------------------------------------------
// GStreamer source
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    /// Build `uridecodebin ! videoconvert ! appsink` producing packed RGB.
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "uridecodebin uri=\"{}\" ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        self.connected_at = Some(Instant::now());
        log::info!(
            "RtspSource: connected to {}",
            redact_locator(&self.config.url)
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            anyhow::bail!("{}", err);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Ok(None);
            }
            anyhow::bail!("stream {} stalled", redact_locator(&self.config.url));
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::from_rgb(pixels, width, height, SystemTime::now()).map(Some)
    }

    fn close(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop stream pipeline: {}", e);
        }
        log::debug!(
            "RtspSource: closed {} after {} frames",
            redact_locator(&self.config.url),
            self.frame_count
        );
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        match self.last_frame_at {
            Some(last) => last.elapsed() <= self.health_grace(),
            None => connected_at.elapsed() <= Duration::from_secs(5),
        }
    }

    fn frame_timeout(&self) -> Duration {
        let per_frame_ms = match self.config.target_fps {
            0 => 500,
            fps => (1000 / fps).saturating_mul(4),
        };
        Duration::from_millis(per_frame_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let per_frame_ms = match self.config.target_fps {
            0 => 2_000,
            fps => (1000 / fps).saturating_mul(6),
        };
        Duration::from_millis(per_frame_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            if let MessageView::Error(err) = message.view() {
                self.last_error = Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("stream buffer is shorter than its caps")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("stream buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
