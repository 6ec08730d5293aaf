//! Motion Sentry
//!
//! ROI-restricted motion detection for fleet cameras. Frames are read from a
//! stream, differenced against the previous smoothed frame inside a region of
//! interest, and confirmed motion that clears a debounce window fans out into
//! a snapshot, a short clip recorded from an independent connection, and a
//! pub/sub notification.
//!
//! # Module Structure
//!
//! - `geometry`, `frame`: pixel rectangles, owned RGB frames, resize/crop/grayscale
//! - `roi`: mapping an ROI from its reference resolution into the processing resolution
//! - `detect`: blur, difference, threshold, dilate, outer contours, area filter
//! - `debounce`: at most one trigger per interval
//! - `dispatch`: snapshot / clip / notify jobs on their own threads
//! - `ingest`: frame sources (GStreamer RTSP, synthetic `stub://`)
//! - `storage`, `notify`: artifact writers and the MQTT notifier
//! - `pipeline`: the single-threaded detection loop
//! - `config`: file + environment configuration for the daemon

pub mod config;
pub mod debounce;
pub mod detect;
pub mod dispatch;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod notify;
pub mod overlay;
pub mod pipeline;
pub mod roi;
pub mod storage;

pub use debounce::{DebounceGate, GateDecision};
pub use detect::{DetectionConfig, DetectionResult, MotionDetector, MotionState};
pub use dispatch::{
    CaptureBackends, CaptureJob, DetectionEvent, DispatchSettings, EventDispatcher, EventHandler,
    JobKind, JobReport,
};
pub use frame::{Frame, ProcessingSize};
pub use geometry::{Point, Rect, Resolution};
pub use ingest::{FrameSource, RtspConfig, RtspSource, SourceOpener, StreamOpener};
pub use notify::{LogNotifier, MqttNotifier, Notifier};
pub use pipeline::{
    FrameObserver, Pipeline, PipelineSettings, RunSummary, StopHandle, StopReason,
};
pub use roi::{map_roi, RoiConfig, RoiMapping, RoiSpec, ScaleFactors};
