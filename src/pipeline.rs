//! Single-threaded detection loop.
//!
//! read → resize → (first frame: map ROI, seed state) → smooth ROI → diff
//! against the previous buffer → debounce → dispatch on fire → rotate state →
//! overlay for the observer → stop checks.

use anyhow::{anyhow, Result};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::debounce::{DebounceGate, GateDecision};
use crate::detect::{DetectionConfig, DetectionResult, MotionDetector, MotionState};
use crate::dispatch::{DetectionEvent, EventHandler};
use crate::frame::{Frame, ProcessingSize};
use crate::geometry::Rect;
use crate::ingest::FrameSource;
use crate::overlay;
use crate::roi::{RoiConfig, RoiMapping};

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub processing: ProcessingSize,
    /// `None` watches the whole frame.
    pub roi: Option<RoiConfig>,
    pub detection: DetectionConfig,
    /// Stop after this many frames have been read.
    pub max_frames: Option<u64>,
    /// Draw the ROI and boxes onto the frame handed to the dispatcher.
    pub annotate_snapshots: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            processing: ProcessingSize::Native,
            roi: None,
            detection: DetectionConfig::default(),
            max_frames: None,
            annotate_snapshots: false,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        self.detection.validate()?;
        match self.processing {
            ProcessingSize::Fixed(size) if size.is_empty() => {
                return Err(anyhow!("processing resolution {} is empty", size));
            }
            ProcessingSize::Scale(factor) if !(factor.is_finite() && factor > 0.0) => {
                return Err(anyhow!("processing scale must be positive, got {}", factor));
            }
            _ => {}
        }
        if let Some(reference) = self.roi.and_then(|roi| roi.reference) {
            if reference.is_empty() {
                return Err(anyhow!("ROI reference resolution {} is empty", reference));
            }
        }
        Ok(())
    }
}

/// Cloneable stop flag, checked once per loop iteration.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sees every analysed frame with the overlay drawn on it.
pub trait FrameObserver: Send {
    /// Return `ControlFlow::Break(())` to end the run.
    fn observe(&mut self, annotated: &Frame, result: &DetectionResult) -> ControlFlow<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    ReadFailed,
    /// The ROI could not be extracted from a frame.
    RoiUnavailable,
    StopRequested,
    ObserverClosed,
    FrameLimit,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StopReason::EndOfStream => "end of stream",
            StopReason::ReadFailed => "stream read failed",
            StopReason::RoiUnavailable => "region of interest unavailable",
            StopReason::StopRequested => "stop requested",
            StopReason::ObserverClosed => "observer closed",
            StopReason::FrameLimit => "frame limit reached",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_read: u64,
    /// Frames compared against a previous buffer.
    pub frames_analysed: u64,
    /// Analysed frames with at least one surviving region.
    pub motion_frames: u64,
    pub triggers: u64,
    /// Effective ROI in processing coordinates, once mapped.
    pub roi: Option<Rect>,
    pub stop_reason: StopReason,
}

pub struct Pipeline<S: FrameSource, H: EventHandler> {
    source: S,
    handler: H,
    settings: PipelineSettings,
    stop: StopHandle,
    observer: Option<Box<dyn FrameObserver>>,
    health_interval: Duration,
}

struct Active {
    detector: MotionDetector,
    state: MotionState,
}

impl<S: FrameSource, H: EventHandler> Pipeline<S, H> {
    pub fn new(source: S, handler: H, settings: PipelineSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            source,
            handler,
            settings,
            stop: StopHandle::new(),
            observer: None,
            health_interval: HEALTH_INTERVAL,
        })
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn FrameObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// How often the health line (counters plus source health) is logged.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Run until the stream ends, fails, or a stop is requested. Closes the source.
    pub fn run(&mut self) -> RunSummary {
        let mut summary = RunSummary {
            frames_read: 0,
            frames_analysed: 0,
            motion_frames: 0,
            triggers: 0,
            roi: None,
            stop_reason: StopReason::EndOfStream,
        };
        let mut gate = DebounceGate::new(self.settings.detection.debounce);
        let mut active: Option<Active> = None;
        let mut last_health = Instant::now();

        summary.stop_reason = loop {
            if self.stop.is_stop_requested() {
                break StopReason::StopRequested;
            }
            if matches!(self.settings.max_frames, Some(max) if summary.frames_read >= max) {
                break StopReason::FrameLimit;
            }

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::info!("stream ended after {} frames", summary.frames_read);
                    break StopReason::EndOfStream;
                }
                Err(e) => {
                    log::warn!("stream read failed: {:#}", e);
                    break StopReason::ReadFailed;
                }
            };
            summary.frames_read += 1;
            let frame = self.settings.processing.apply(&frame);

            let Some(current) = active.as_mut() else {
                match self.initialise(&frame) {
                    Ok(initial) => {
                        summary.roi = Some(initial.detector.roi());
                        active = Some(initial);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("cannot start detection: {:#}", e);
                        break StopReason::RoiUnavailable;
                    }
                }
            };

            let result = match analyse(current, &frame) {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("frame {} rejected: {:#}", summary.frames_read, e);
                    break StopReason::RoiUnavailable;
                }
            };
            summary.frames_analysed += 1;
            if result.motion_detected {
                summary.motion_frames += 1;
            }

            let roi = current.detector.roi();
            if gate.observe(result.motion_detected, Instant::now()) == GateDecision::Fire {
                summary.triggers += 1;
                log::info!(
                    "motion confirmed: {} region(s), largest {:.0} px",
                    result.boxes.len(),
                    result.largest_area
                );
                let copy = if self.settings.annotate_snapshots {
                    overlay::annotate(&frame, roi, &result.boxes)
                } else {
                    frame.clone()
                };
                self.handler.handle(DetectionEvent {
                    timestamp: frame.captured_at(),
                    boxes: result.boxes.clone(),
                    frame: copy,
                });
            }

            if let Some(observer) = self.observer.as_mut() {
                let annotated = overlay::annotate(&frame, roi, &result.boxes);
                if observer.observe(&annotated, &result).is_break() {
                    break StopReason::ObserverClosed;
                }
            }

            if last_health.elapsed() >= self.health_interval {
                let healthy = self.source.is_healthy();
                log::info!(
                    "health: {} frames read, {} with motion, {} triggers, source {}",
                    summary.frames_read,
                    summary.motion_frames,
                    summary.triggers,
                    if healthy { "ok" } else { "stalled" }
                );
                if !healthy {
                    log::warn!("stream source reports unhealthy; frames may be stale");
                }
                last_health = Instant::now();
            }
        };

        self.source.close();
        log::info!(
            "detection stopped ({}): {} frames read, {} analysed, {} triggers",
            summary.stop_reason,
            summary.frames_read,
            summary.frames_analysed,
            summary.triggers
        );
        summary
    }

    fn initialise(&self, frame: &Frame) -> Result<Active> {
        let target = frame.resolution();
        let mapping = match &self.settings.roi {
            Some(roi) => roi.resolve(frame.source_resolution(), target)?,
            None => RoiMapping::full_frame(target),
        };
        let detector = MotionDetector::new(&self.settings.detection, mapping.rect, target);
        let state = MotionState::new(detector.smooth_roi(frame)?);
        log::info!(
            "watching ROI {} of {} frames (min area {:.1} px)",
            mapping.rect,
            target,
            detector.min_area()
        );
        Ok(Active { detector, state })
    }
}

fn analyse(active: &mut Active, frame: &Frame) -> Result<DetectionResult> {
    let current = active.detector.smooth_roi(frame)?;
    let result = active.detector.detect(active.state.previous(), &current)?;
    active.state.advance(current);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::time::SystemTime;

    struct Script(VecDeque<Result<Option<Frame>>>);

    impl FrameSource for Script {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    #[derive(Default)]
    struct Collect(Vec<DetectionEvent>);

    impl EventHandler for Collect {
        fn handle(&mut self, event: DetectionEvent) {
            self.0.push(event);
        }
    }

    fn flat(width: u32, height: u32) -> Frame {
        Frame::new(
            RgbImage::from_pixel(width, height, Rgb([20, 20, 20])),
            SystemTime::now(),
        )
    }

    fn with_square(width: u32, height: u32, x: u32, y: u32, side: u32) -> Frame {
        let mut image = RgbImage::from_pixel(width, height, Rgb([20, 20, 20]));
        for py in y..y + side {
            for px in x..x + side {
                image.put_pixel(px, py, Rgb([240, 240, 240]));
            }
        }
        Frame::new(image, SystemTime::now())
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            detection: DetectionConfig {
                min_area_full_frame: 100.0,
                blur_kernel: 5,
                ..DetectionConfig::default()
            },
            ..PipelineSettings::default()
        }
    }

    #[test]
    fn first_frame_only_initialises() {
        let source = Script(VecDeque::from(vec![Ok(Some(flat(64, 48)))]));
        let mut pipeline = Pipeline::new(source, Collect::default(), settings()).unwrap();
        let summary = pipeline.run();
        assert_eq!(summary.frames_read, 1);
        assert_eq!(summary.frames_analysed, 0);
        assert_eq!(summary.roi, Some(Rect::new(0, 0, 64, 48)));
        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
    }

    #[test]
    fn read_error_ends_the_run() {
        let source = Script(VecDeque::from(vec![
            Ok(Some(flat(64, 48))),
            Err(anyhow!("connection reset")),
            Ok(Some(flat(64, 48))),
        ]));
        let mut pipeline = Pipeline::new(source, Collect::default(), settings()).unwrap();
        let summary = pipeline.run();
        assert_eq!(summary.stop_reason, StopReason::ReadFailed);
        assert_eq!(summary.frames_read, 1);
    }

    #[test]
    fn resolution_change_mid_stream_stops_with_roi_unavailable() {
        let source = Script(VecDeque::from(vec![
            Ok(Some(flat(64, 48))),
            Ok(Some(flat(32, 24))),
        ]));
        let mut pipeline = Pipeline::new(source, Collect::default(), settings()).unwrap();
        assert_eq!(pipeline.run().stop_reason, StopReason::RoiUnavailable);
    }

    #[test]
    fn motion_is_debounced_across_frames() {
        let frames = vec![
            Ok(Some(flat(64, 48))),
            Ok(Some(with_square(64, 48, 10, 10, 16))),
            Ok(Some(with_square(64, 48, 30, 20, 16))),
            Ok(Some(with_square(64, 48, 10, 10, 16))),
        ];
        let mut pipeline =
            Pipeline::new(Script(VecDeque::from(frames)), Collect::default(), settings()).unwrap();
        let summary = pipeline.run();
        assert_eq!(summary.frames_analysed, 3);
        assert_eq!(summary.motion_frames, 3);
        assert_eq!(summary.triggers, 1);
        assert_eq!(pipeline.handler().0.len(), 1);
    }

    #[test]
    fn frame_limit_and_stop_handle() {
        let frames: VecDeque<_> = (0..10).map(|_| Ok(Some(flat(16, 16)))).collect();
        let mut pipeline = Pipeline::new(
            Script(frames),
            Collect::default(),
            PipelineSettings {
                max_frames: Some(4),
                ..settings()
            },
        )
        .unwrap();
        let summary = pipeline.run();
        assert_eq!(summary.frames_read, 4);
        assert_eq!(summary.stop_reason, StopReason::FrameLimit);

        let stop = StopHandle::new();
        stop.request_stop();
        let frames: VecDeque<_> = (0..10).map(|_| Ok(Some(flat(16, 16)))).collect();
        let mut pipeline = Pipeline::new(Script(frames), Collect::default(), settings())
            .unwrap()
            .with_stop_handle(stop);
        let summary = pipeline.run();
        assert_eq!(summary.frames_read, 0);
        assert_eq!(summary.stop_reason, StopReason::StopRequested);
    }

    #[test]
    fn observer_can_close_the_run() {
        struct CloseAfter(u32);
        impl FrameObserver for CloseAfter {
            fn observe(&mut self, _: &Frame, _: &DetectionResult) -> ControlFlow<()> {
                self.0 -= 1;
                if self.0 == 0 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        }

        let frames: VecDeque<_> = (0..10).map(|_| Ok(Some(flat(16, 16)))).collect();
        let mut pipeline = Pipeline::new(Script(frames), Collect::default(), settings())
            .unwrap()
            .with_observer(Box::new(CloseAfter(2)));
        let summary = pipeline.run();
        assert_eq!(summary.stop_reason, StopReason::ObserverClosed);
        assert_eq!(summary.frames_read, 3);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let bad = PipelineSettings {
            processing: ProcessingSize::Scale(0.0),
            ..PipelineSettings::default()
        };
        let source = Script(VecDeque::new());
        assert!(Pipeline::new(source, Collect::default(), bad).is_err());
    }

    #[test]
    fn health_line_consults_the_source() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Stalling {
            frames: VecDeque<Frame>,
            checks: Arc<AtomicUsize>,
        }

        impl FrameSource for Stalling {
            fn next_frame(&mut self) -> Result<Option<Frame>> {
                Ok(self.frames.pop_front())
            }

            fn is_healthy(&self) -> bool {
                self.checks.fetch_add(1, Ordering::SeqCst);
                false
            }
        }

        let checks = Arc::new(AtomicUsize::new(0));
        let source = Stalling {
            frames: (0..3).map(|_| flat(16, 16)).collect(),
            checks: Arc::clone(&checks),
        };
        let mut pipeline = Pipeline::new(source, Collect::default(), settings())
            .unwrap()
            .with_health_interval(Duration::ZERO);
        let summary = pipeline.run();
        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
        assert_eq!(checks.load(Ordering::SeqCst), 2);
    }
}
