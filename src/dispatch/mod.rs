//! Fan-out of confirmed triggers into capture and notification jobs.
//!
//! Each trigger becomes three `CaptureJob`s (snapshot, clip, notify), built
//! synchronously and then executed on their own named threads. The caller is
//! never blocked: a job failure is logged and reported through its
//! `JobReport`, and never reaches the detection loop or the sibling jobs.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::frame::Frame;
use crate::geometry::Rect;
use crate::ingest::SourceOpener;
use crate::notify::{MessageContext, MessageTemplate, Notifier};
use crate::storage::{trigger_id, ArtifactStore, ImageWriter, VideoWriterFactory};

mod clip;

pub use clip::record_clip;

pub const DEFAULT_CLIP_SECS: u64 = 5;
pub const DEFAULT_CLIP_FPS: f64 = 20.0;

/// A trigger that passed the debounce gate.
#[derive(Clone, Debug)]
pub struct DetectionEvent {
    pub timestamp: SystemTime,
    /// Full-frame coordinates.
    pub boxes: Vec<Rect>,
    /// Owned copy of the triggering frame.
    pub frame: Frame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Snapshot,
    Clip,
    Notify,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Snapshot => "snapshot",
            JobKind::Clip => "clip",
            JobKind::Notify => "notify",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job works on. Every payload is owned by its job.
#[derive(Clone, Debug)]
pub enum JobPayload {
    Snapshot { frame: Frame, path: PathBuf },
    Clip {
        locator: String,
        path: PathBuf,
        duration: Duration,
        fps: f64,
    },
    Notify { message: String },
}

/// One side effect of a trigger. Executed once; never retried.
#[derive(Clone, Debug)]
pub struct CaptureJob {
    pub id: String,
    pub payload: JobPayload,
}

impl CaptureJob {
    pub fn kind(&self) -> JobKind {
        match self.payload {
            JobPayload::Snapshot { .. } => JobKind::Snapshot,
            JobPayload::Clip { .. } => JobKind::Clip,
            JobPayload::Notify { .. } => JobKind::Notify,
        }
    }
}

/// Outcome of one job.
#[derive(Clone, Debug)]
pub struct JobReport {
    pub kind: JobKind,
    pub id: String,
    /// File written by the job, if any.
    pub artifact: Option<PathBuf>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl JobReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(kind: JobKind, id: &str, error: String, elapsed: Duration) -> Self {
        Self {
            kind,
            id: id.to_string(),
            artifact: None,
            error: Some(error),
            elapsed,
        }
    }
}

/// Receives confirmed triggers from the pipeline.
pub trait EventHandler: Send {
    fn handle(&mut self, event: DetectionEvent);
}

/// Handles for the jobs of one trigger. Dropping it detaches the jobs.
#[derive(Debug)]
pub struct DispatchTicket {
    id: String,
    running: Vec<(JobKind, JoinHandle<JobReport>)>,
    finished: Vec<JobReport>,
}

impl DispatchTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True once every job of the trigger has returned.
    pub fn is_finished(&self) -> bool {
        self.running.iter().all(|(_, handle)| handle.is_finished())
    }

    /// Block until every job has finished.
    pub fn wait(self) -> Vec<JobReport> {
        let mut reports = self.finished;
        for (kind, handle) in self.running {
            let report = handle.join().unwrap_or_else(|_| {
                log::error!("{} job {} panicked", kind, self.id);
                JobReport::failed(kind, &self.id, "job panicked".to_string(), Duration::ZERO)
            });
            reports.push(report);
        }
        reports
    }
}

/// Per-deployment dispatch parameters.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub camera_id: String,
    /// Locator clip jobs connect to, independently of the live loop.
    pub locator: String,
    pub clip_duration: Duration,
    pub clip_fps: f64,
    pub message: MessageTemplate,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            camera_id: "camera".to_string(),
            locator: String::new(),
            clip_duration: Duration::from_secs(DEFAULT_CLIP_SECS),
            clip_fps: DEFAULT_CLIP_FPS,
            message: MessageTemplate::default(),
        }
    }
}

/// Collaborators that carry out the jobs.
#[derive(Clone)]
pub struct CaptureBackends {
    pub images: Arc<dyn ImageWriter>,
    pub videos: Arc<dyn VideoWriterFactory>,
    pub opener: Arc<dyn SourceOpener>,
    pub notifier: Arc<dyn Notifier>,
}

/// Starts the jobs of each trigger and keeps track of the ones still running.
pub struct EventDispatcher {
    settings: DispatchSettings,
    store: ArtifactStore,
    backends: CaptureBackends,
    in_flight: Vec<DispatchTicket>,
}

impl EventDispatcher {
    /// Creates the artifact directories up front.
    pub fn new(
        settings: DispatchSettings,
        store: ArtifactStore,
        backends: CaptureBackends,
    ) -> Result<Self> {
        store.ensure_dirs()?;
        Ok(Self {
            settings,
            store,
            backends,
            in_flight: Vec::new(),
        })
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// The three jobs for `event`, in snapshot, clip, notify order.
    pub fn jobs_for(&self, event: DetectionEvent) -> Vec<CaptureJob> {
        let id = trigger_id(event.timestamp);
        let message = self.settings.message.render(&MessageContext {
            camera: &self.settings.camera_id,
            timestamp: event.timestamp,
            boxes: event.boxes.len(),
            id: &id,
        });
        vec![
            CaptureJob {
                id: id.clone(),
                payload: JobPayload::Snapshot {
                    path: self
                        .store
                        .snapshot_path(&id, self.backends.images.extension()),
                    frame: event.frame,
                },
            },
            CaptureJob {
                id: id.clone(),
                payload: JobPayload::Clip {
                    locator: self.settings.locator.clone(),
                    path: self.store.clip_path(&id, self.backends.videos.extension()),
                    duration: self.settings.clip_duration,
                    fps: self.settings.clip_fps,
                },
            },
            CaptureJob {
                id,
                payload: JobPayload::Notify { message },
            },
        ]
    }

    /// Start the jobs for `event` and return without waiting for them.
    pub fn dispatch(&self, event: DetectionEvent) -> DispatchTicket {
        let id = trigger_id(event.timestamp);
        let mut ticket = DispatchTicket {
            id,
            running: Vec::with_capacity(3),
            finished: Vec::new(),
        };
        for job in self.jobs_for(event) {
            let kind = job.kind();
            let job_id = job.id.clone();
            let backends = self.backends.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", kind, job_id))
                .spawn(move || run_job(&backends, job));
            match spawned {
                Ok(handle) => ticket.running.push((kind, handle)),
                Err(e) => {
                    log::error!("could not start {} job {}: {}", kind, job_id, e);
                    ticket.finished.push(JobReport::failed(
                        kind,
                        &job_id,
                        format!("spawn failed: {}", e),
                        Duration::ZERO,
                    ));
                }
            }
        }
        ticket
    }

    /// Triggers whose jobs have not all finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().filter(|t| !t.is_finished()).count()
    }

    /// Wait for every job started through `handle`. Nothing is cancelled;
    /// a clip still recording runs to the end of its duration.
    pub fn drain(&mut self) -> Vec<JobReport> {
        let pending = std::mem::take(&mut self.in_flight);
        let waiting = pending.iter().filter(|t| !t.is_finished()).count();
        if waiting > 0 {
            log::info!("waiting for capture jobs of {} trigger(s)", waiting);
        }
        pending.into_iter().flat_map(DispatchTicket::wait).collect()
    }
}

impl EventHandler for EventDispatcher {
    fn handle(&mut self, event: DetectionEvent) {
        self.in_flight.retain(|t| !t.is_finished());
        let ticket = self.dispatch(event);
        log::debug!("dispatched jobs for trigger {}", ticket.id());
        self.in_flight.push(ticket);
    }
}

/// Execute one job, catching its failure at the job boundary.
pub fn run_job(backends: &CaptureBackends, job: CaptureJob) -> JobReport {
    let started = Instant::now();
    let kind = job.kind();
    let CaptureJob { id, payload } = job;
    let outcome = execute(backends, payload);
    let elapsed = started.elapsed();
    match outcome {
        Ok(artifact) => {
            match &artifact {
                Some(path) => log::info!(
                    "{} job {} finished in {:?}: {}",
                    kind,
                    id,
                    elapsed,
                    path.display()
                ),
                None => log::info!("{} job {} finished in {:?}", kind, id, elapsed),
            }
            JobReport {
                kind,
                id,
                artifact,
                error: None,
                elapsed,
            }
        }
        Err(e) => {
            log::error!("{} job {} failed: {:#}", kind, id, e);
            JobReport::failed(kind, &id, format!("{:#}", e), elapsed)
        }
    }
}

fn execute(backends: &CaptureBackends, payload: JobPayload) -> Result<Option<PathBuf>> {
    match payload {
        JobPayload::Snapshot { frame, path } => {
            backends.images.write_image(&path, &frame)?;
            Ok(Some(path))
        }
        JobPayload::Clip {
            locator,
            path,
            duration,
            fps,
        } => {
            let frames = record_clip(
                backends.opener.as_ref(),
                &locator,
                backends.videos.as_ref(),
                &path,
                duration,
                fps,
            )?;
            log::debug!("clip {} holds {} frames", path.display(), frames);
            Ok(Some(path))
        }
        JobPayload::Notify { message } => {
            backends
                .notifier
                .publish(&message)
                .context("publish notification")?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Resolution;
    use crate::ingest::FrameSource;
    use crate::storage::{AviWriterFactory, JpegImageWriter, VideoWriter};
    use anyhow::anyhow;
    use image::RgbImage;
    use std::path::Path;
    use std::sync::Mutex;

    struct NoSource;

    impl SourceOpener for NoSource {
        fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>> {
            Err(anyhow!("cannot open {}", locator))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl Notifier for Recording {
        fn publish(&self, message: &str) -> Result<()> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct BrokenVideo;

    impl VideoWriterFactory for BrokenVideo {
        fn extension(&self) -> &str {
            "avi"
        }

        fn create(&self, _: &Path, _: Resolution, _: f64) -> Result<Box<dyn VideoWriter>> {
            Err(anyhow!("codec unavailable"))
        }
    }

    fn event() -> DetectionEvent {
        DetectionEvent {
            timestamp: SystemTime::now(),
            boxes: vec![Rect::new(1, 1, 4, 4)],
            frame: Frame::new(RgbImage::new(16, 16), SystemTime::now()),
        }
    }

    #[test]
    fn jobs_are_built_in_order_with_shared_id() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = EventDispatcher::new(
            DispatchSettings {
                camera_id: "gate".to_string(),
                locator: "stub://gate".to_string(),
                message: MessageTemplate::new("{camera}:{boxes}"),
                ..DispatchSettings::default()
            },
            ArtifactStore::new(dir.path().join("i"), dir.path().join("v")),
            CaptureBackends {
                images: Arc::new(JpegImageWriter::default()),
                videos: Arc::new(AviWriterFactory::default()),
                opener: Arc::new(NoSource),
                notifier: Arc::new(Recording::default()),
            },
        )
        .unwrap();

        let jobs = dispatcher.jobs_for(event());
        let kinds: Vec<_> = jobs.iter().map(CaptureJob::kind).collect();
        assert_eq!(kinds, vec![JobKind::Snapshot, JobKind::Clip, JobKind::Notify]);
        assert!(jobs.iter().all(|job| job.id == jobs[0].id));
        match &jobs[1].payload {
            JobPayload::Clip { locator, path, .. } => {
                assert_eq!(locator, "stub://gate");
                assert!(path.to_string_lossy().ends_with(".avi"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        match &jobs[2].payload {
            JobPayload::Notify { message } => assert_eq!(message, "gate:1"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn failed_job_does_not_affect_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(Recording::default());
        let dispatcher = EventDispatcher::new(
            DispatchSettings {
                locator: "stub://gate".to_string(),
                ..DispatchSettings::default()
            },
            ArtifactStore::new(dir.path().join("i"), dir.path().join("v")),
            CaptureBackends {
                images: Arc::new(JpegImageWriter::default()),
                videos: Arc::new(BrokenVideo),
                opener: Arc::new(NoSource),
                notifier: notifier.clone(),
            },
        )
        .unwrap();

        let reports = dispatcher.dispatch(event()).wait();
        assert_eq!(reports.len(), 3);
        let by_kind = |kind| reports.iter().find(|r| r.kind == kind).unwrap();
        assert!(by_kind(JobKind::Snapshot).is_ok());
        assert!(by_kind(JobKind::Snapshot).artifact.as_ref().unwrap().exists());
        assert!(!by_kind(JobKind::Clip).is_ok());
        assert!(by_kind(JobKind::Notify).is_ok());
        assert_eq!(notifier.0.lock().unwrap().as_slice(), ["Motion detected!"]);
    }

    #[test]
    fn job_threads_are_named_after_trigger() {
        let (tx, rx) = std::sync::mpsc::channel();
        struct NameProbe(Mutex<std::sync::mpsc::Sender<String>>);
        impl Notifier for NameProbe {
            fn publish(&self, _: &str) -> Result<()> {
                let name = std::thread::current().name().unwrap_or("").to_string();
                self.0.lock().unwrap().send(name).unwrap();
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let dispatcher = EventDispatcher::new(
            DispatchSettings::default(),
            ArtifactStore::new(dir.path().join("i"), dir.path().join("v")),
            CaptureBackends {
                images: Arc::new(JpegImageWriter::default()),
                videos: Arc::new(AviWriterFactory::default()),
                opener: Arc::new(NoSource),
                notifier: Arc::new(NameProbe(Mutex::new(tx))),
            },
        )
        .unwrap();
        let ticket = dispatcher.dispatch(event());
        let id = ticket.id().to_string();
        ticket.wait();
        assert_eq!(rx.recv().unwrap(), format!("notify-{}", id));
    }

    /// Endless source that takes `delay` per frame, like a live camera.
    struct PacedSource {
        delay: Duration,
    }

    impl FrameSource for PacedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            std::thread::sleep(self.delay);
            Ok(Some(Frame::new(RgbImage::new(16, 16), SystemTime::now())))
        }
    }

    struct PacedOpener;

    impl SourceOpener for PacedOpener {
        fn open(&self, _locator: &str) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(PacedSource {
                delay: Duration::from_millis(40),
            }))
        }
    }

    #[test]
    fn handle_does_not_wait_for_clip_and_drain_does() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = EventDispatcher::new(
            DispatchSettings {
                locator: "stub://gate".to_string(),
                clip_duration: Duration::from_secs(1),
                ..DispatchSettings::default()
            },
            ArtifactStore::new(dir.path().join("i"), dir.path().join("v")),
            CaptureBackends {
                images: Arc::new(JpegImageWriter::default()),
                videos: Arc::new(AviWriterFactory::default()),
                opener: Arc::new(PacedOpener),
                notifier: Arc::new(Recording::default()),
            },
        )
        .unwrap();

        let started = Instant::now();
        dispatcher.handle(event());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(dispatcher.in_flight(), 1);

        let reports = dispatcher.drain();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(JobReport::is_ok), "{:?}", reports);
        let clip = reports.iter().find(|r| r.kind == JobKind::Clip).unwrap();
        assert!(clip.artifact.as_ref().unwrap().exists());
        assert!(dispatcher.drain().is_empty());
    }
}
