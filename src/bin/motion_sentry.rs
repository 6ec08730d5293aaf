//! motion_sentry - ROI motion detection daemon
//!
//! This daemon:
//! 1. Reads frames from one camera stream (RTSP, or `stub://` for a synthetic scene)
//! 2. Watches a region of interest for frame-to-frame change
//! 3. On a confirmed, debounced trigger saves a snapshot, records a short clip
//!    from a second connection, and publishes an MQTT alert
//! 4. Stops on Ctrl-C, end of stream, or read failure, then waits for capture
//!    jobs still running before disconnecting from the broker

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use motion_sentry::{
    config::SentryConfig,
    dispatch::{CaptureBackends, EventDispatcher},
    ingest::{redact_locator, StreamOpener},
    notify::{LogNotifier, MqttNotifier, Notifier},
    pipeline::{Pipeline, StopHandle},
    storage::{JpegImageWriter, AviWriterFactory},
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "ROI motion detection with snapshot, clip and MQTT alerting")]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "SENTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Stream locator (overrides the config file).
    #[arg(long)]
    stream_url: Option<String>,

    /// Camera identifier used in alerts and the MQTT client id.
    #[arg(long)]
    camera_id: Option<String>,

    /// Stop after reading this many frames.
    #[arg(long)]
    max_frames: Option<u64>,

    /// Startup progress style.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto)]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = SentryConfig::load(args.config.as_deref())?;
        if let Some(url) = args.stream_url {
            cfg.stream.url = url;
        }
        if let Some(camera_id) = args.camera_id {
            cfg.camera_id = camera_id;
        }
        if args.max_frames.is_some() {
            cfg.pipeline.max_frames = args.max_frames;
        }
        cfg.validate()?;
        cfg
    };

    let notifier: Arc<dyn Notifier> = {
        let _stage = ui.stage("Connect to notifier");
        match cfg.mqtt_settings()? {
            Some(settings) => Arc::new(MqttNotifier::start(settings)?),
            None => {
                log::warn!("no MQTT broker configured; alerts go to the log only");
                Arc::new(LogNotifier::new(cfg.mqtt.topic.clone()))
            }
        }
    };

    let opener = Arc::new(StreamOpener::new(cfg.stream.clone()));
    let source = {
        let _stage = ui.stage("Connect to stream");
        opener
            .open_source(&cfg.stream.url)
            .with_context(|| format!("connect to {}", redact_locator(&cfg.stream.url)))?
    };

    let dispatcher = EventDispatcher::new(
        cfg.dispatch_settings(),
        cfg.artifact_store(),
        CaptureBackends {
            images: Arc::new(JpegImageWriter::default()),
            videos: Arc::new(AviWriterFactory::default()),
            opener,
            notifier: Arc::clone(&notifier),
        },
    )?;

    let stop = StopHandle::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received, stopping detection...");
            stop.request_stop();
        })
        .context("error setting Ctrl-C handler")?;
    }

    log::info!(
        "motion_sentry {} watching {} as camera {}",
        env!("CARGO_PKG_VERSION"),
        redact_locator(&cfg.stream.url),
        cfg.camera_id
    );
    log::info!(
        "snapshots in {}, clips in {}",
        cfg.capture.image_dir.display(),
        cfg.capture.video_dir.display()
    );

    let mut pipeline =
        Pipeline::new(source, dispatcher, cfg.pipeline.clone())?.with_stop_handle(stop);
    let summary = pipeline.run();
    log::info!(
        "run finished: {} ({} frames, {} with motion, {} triggers)",
        summary.stop_reason,
        summary.frames_read,
        summary.motion_frames,
        summary.triggers
    );

    let mut dispatcher = pipeline.into_handler();
    let reports = dispatcher.drain();
    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        log::warn!("{} of {} capture jobs failed", failed, reports.len());
    }

    notifier.stop()?;
    Ok(())
}
