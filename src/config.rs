use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectionConfig;
use crate::dispatch::{DispatchSettings, DEFAULT_CLIP_FPS, DEFAULT_CLIP_SECS};
use crate::frame::ProcessingSize;
use crate::geometry::{Point, Resolution};
use crate::ingest::RtspConfig;
use crate::notify::{
    parse_mqtt_endpoint, MessageTemplate, MqttSettings, TlsPaths, DEFAULT_MESSAGE, DEFAULT_TOPIC,
};
use crate::pipeline::PipelineSettings;
use crate::roi::{RoiConfig, RoiSpec};
use crate::storage::ArtifactStore;

pub const CONFIG_ENV: &str = "SENTRY_CONFIG";

const DEFAULT_CAMERA_ID: &str = "camera";
const DEFAULT_STREAM_URL: &str = "stub://camera";
const DEFAULT_STREAM_FPS: u32 = 10;
const DEFAULT_STUB_WIDTH: u32 = 1280;
const DEFAULT_STUB_HEIGHT: u32 = 720;
const DEFAULT_STUB_MOTION_PERIOD: u64 = 100;
const DEFAULT_PROCESSING_WIDTH: u32 = 800;
const DEFAULT_PROCESSING_HEIGHT: u32 = 600;
const DEFAULT_IMAGE_DIR: &str = "images";
const DEFAULT_VIDEO_DIR: &str = "videos";

#[derive(Debug, Deserialize, Default)]
struct SentryConfigFile {
    camera_id: Option<String>,
    stream: Option<StreamConfigFile>,
    processing: Option<ProcessingConfigFile>,
    roi: Option<RoiConfigFile>,
    detection: Option<DetectionConfigFile>,
    capture: Option<CaptureConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    motion_period: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessingConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    scale: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RoiConfigFile {
    top_left: Option<[i64; 2]>,
    bottom_right: Option<[i64; 2]>,
    x: Option<i64>,
    y: Option<i64>,
    width: Option<i64>,
    height: Option<i64>,
    reference_width: Option<u32>,
    reference_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    threshold: Option<u32>,
    min_area_full_frame: Option<f64>,
    reference_area: Option<u64>,
    debounce_secs: Option<u64>,
    blur_kernel: Option<u32>,
    dilate_iterations: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    image_dir: Option<PathBuf>,
    video_dir: Option<PathBuf>,
    clip_secs: Option<f64>,
    clip_fps: Option<f64>,
    annotate_snapshots: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    message: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    availability_topic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub camera_id: String,
    pub stream: RtspConfig,
    pub pipeline: PipelineSettings,
    pub capture: CaptureSettings,
    pub mqtt: NotifierSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub image_dir: PathBuf,
    pub video_dir: PathBuf,
    pub clip_duration: Duration,
    pub clip_fps: f64,
}

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    /// No broker means notifications only go to the log.
    pub broker: Option<String>,
    pub topic: String,
    /// Defaults to `motion-sentry-<camera_id>`.
    pub client_id: Option<String>,
    pub message: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls: TlsPaths,
    pub availability_topic: Option<String>,
}

impl SentryConfig {
    /// Load from `path`, else from `$SENTRY_CONFIG`, else defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.or(env_path.as_deref()) {
            Some(path) => read_config_file(path)?,
            None => SentryConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentryConfigFile) -> Result<Self> {
        let camera_id = file
            .camera_id
            .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string());

        let stream_file = file.stream.unwrap_or_default();
        let stream = RtspConfig {
            url: stream_file
                .url
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            target_fps: stream_file.target_fps.unwrap_or(DEFAULT_STREAM_FPS),
            width: stream_file.width.unwrap_or(DEFAULT_STUB_WIDTH),
            height: stream_file.height.unwrap_or(DEFAULT_STUB_HEIGHT),
            motion_period: stream_file
                .motion_period
                .unwrap_or(DEFAULT_STUB_MOTION_PERIOD),
        };

        let processing = match file.processing {
            None => ProcessingSize::Fixed(Resolution::new(
                DEFAULT_PROCESSING_WIDTH,
                DEFAULT_PROCESSING_HEIGHT,
            )),
            Some(processing) => processing_size(processing)?,
        };
        let roi = file.roi.map(roi_config).transpose()?;

        let detection_file = file.detection.unwrap_or_default();
        let defaults = DetectionConfig::default();
        let threshold = match detection_file.threshold {
            Some(value) => u8::try_from(value)
                .map_err(|_| anyhow!("detection threshold must be 0-255, got {}", value))?,
            None => defaults.threshold,
        };
        let detection = DetectionConfig {
            threshold,
            min_area_full_frame: detection_file
                .min_area_full_frame
                .unwrap_or(defaults.min_area_full_frame),
            reference_area: detection_file.reference_area.or(defaults.reference_area),
            debounce: detection_file
                .debounce_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.debounce),
            blur_kernel: detection_file.blur_kernel.unwrap_or(defaults.blur_kernel),
            dilate_iterations: detection_file
                .dilate_iterations
                .unwrap_or(defaults.dilate_iterations),
        };

        let capture_file = file.capture.unwrap_or_default();
        let clip_secs = capture_file.clip_secs.unwrap_or(DEFAULT_CLIP_SECS as f64);
        let clip_duration = Duration::try_from_secs_f64(clip_secs)
            .map_err(|_| anyhow!("clip_secs must be a positive number, got {}", clip_secs))?;
        let capture = CaptureSettings {
            image_dir: capture_file
                .image_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_DIR)),
            video_dir: capture_file
                .video_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEO_DIR)),
            clip_duration,
            clip_fps: capture_file.clip_fps.unwrap_or(DEFAULT_CLIP_FPS),
        };

        let pipeline = PipelineSettings {
            processing,
            roi,
            detection,
            max_frames: None,
            annotate_snapshots: capture_file.annotate_snapshots.unwrap_or(false),
        };

        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = NotifierSettings {
            broker: mqtt_file.broker.filter(|broker| !broker.trim().is_empty()),
            topic: mqtt_file
                .topic
                .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            client_id: mqtt_file.client_id,
            message: mqtt_file
                .message
                .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            username: mqtt_file.username,
            password: mqtt_file.password,
            use_tls: mqtt_file.use_tls.unwrap_or(false),
            tls: TlsPaths {
                ca_path: mqtt_file.ca_path,
                client_cert_path: mqtt_file.client_cert_path,
                client_key_path: mqtt_file.client_key_path,
            },
            availability_topic: mqtt_file.availability_topic,
        };

        Ok(Self {
            camera_id,
            stream,
            pipeline,
            capture,
            mqtt,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_value("SENTRY_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(camera_id) = env_value("SENTRY_CAMERA_ID") {
            self.camera_id = camera_id;
        }
        if let Some(broker) = env_value("SENTRY_MQTT_BROKER") {
            self.mqtt.broker = Some(broker);
        }
        if let Some(topic) = env_value("SENTRY_MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Some(debounce) = env_value("SENTRY_DEBOUNCE_SECS") {
            let seconds: u64 = debounce.parse().map_err(|_| {
                anyhow!("SENTRY_DEBOUNCE_SECS must be an integer number of seconds")
            })?;
            self.pipeline.detection.debounce = Duration::from_secs(seconds);
        }
        if let Some(dir) = env_value("SENTRY_IMAGE_DIR") {
            self.capture.image_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_value("SENTRY_VIDEO_DIR") {
            self.capture.video_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera_id.trim().is_empty() {
            bail!("camera_id must not be empty");
        }
        if self.stream.url.trim().is_empty() {
            bail!("stream url must not be empty");
        }
        if self.stream.target_fps == 0 {
            bail!("stream target_fps must be greater than zero");
        }
        self.pipeline.validate()?;
        if self.capture.clip_duration.is_zero() {
            bail!("clip duration must be greater than zero");
        }
        if !(self.capture.clip_fps.is_finite() && self.capture.clip_fps > 0.0) {
            bail!("clip fps must be greater than zero");
        }
        validate_topic(&self.mqtt.topic, "mqtt topic")?;
        if let Some(topic) = &self.mqtt.availability_topic {
            validate_topic(topic, "mqtt availability_topic")?;
        }
        if let Some(broker) = &self.mqtt.broker {
            parse_mqtt_endpoint(broker, self.mqtt.use_tls)?;
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            bail!("mqtt password given without username");
        }
        Ok(())
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.capture.image_dir, &self.capture.video_dir)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            camera_id: self.camera_id.clone(),
            locator: self.stream.url.clone(),
            clip_duration: self.capture.clip_duration,
            clip_fps: self.capture.clip_fps,
            message: MessageTemplate::new(self.mqtt.message.clone()),
        }
    }

    /// Broker session settings, or `None` when no broker is configured.
    /// Reads the TLS files.
    pub fn mqtt_settings(&self) -> Result<Option<MqttSettings>> {
        let Some(broker) = &self.mqtt.broker else {
            return Ok(None);
        };
        let endpoint = parse_mqtt_endpoint(broker, self.mqtt.use_tls)?;
        let client_id = self
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("motion-sentry-{}", self.camera_id));
        Ok(Some(MqttSettings {
            endpoint,
            client_id,
            topic: self.mqtt.topic.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            tls: self.mqtt.tls.load()?,
            availability_topic: self.mqtt.availability_topic.clone(),
        }))
    }
}

fn processing_size(file: ProcessingConfigFile) -> Result<ProcessingSize> {
    match (file.width, file.height, file.scale) {
        (None, None, None) => Ok(ProcessingSize::Native),
        (Some(width), Some(height), None) => {
            Ok(ProcessingSize::Fixed(Resolution::new(width, height)))
        }
        (None, None, Some(scale)) => Ok(ProcessingSize::Scale(scale)),
        (_, _, Some(_)) => bail!("processing: give either width/height or scale, not both"),
        _ => bail!("processing: width and height must be given together"),
    }
}

fn roi_config(file: RoiConfigFile) -> Result<RoiConfig> {
    let corners = (file.top_left, file.bottom_right);
    let region = (file.x, file.y, file.width, file.height);
    let spec = match (corners, region) {
        ((Some(tl), Some(br)), (None, None, None, None)) => RoiSpec::Corners {
            top_left: Point::new(tl[0], tl[1]),
            bottom_right: Point::new(br[0], br[1]),
        },
        ((None, None), (Some(x), Some(y), Some(width), Some(height))) => RoiSpec::Region {
            x,
            y,
            width,
            height,
        },
        ((None, None), (None, None, None, None)) => {
            bail!("roi: give top_left/bottom_right or x/y/width/height")
        }
        ((Some(_), Some(_)), _) => {
            bail!("roi: corners and x/y/width/height are mutually exclusive")
        }
        ((None, None), _) => bail!("roi: x, y, width and height must all be given"),
        _ => bail!("roi: top_left and bottom_right must be given together"),
    };
    let reference = match (file.reference_width, file.reference_height) {
        (Some(width), Some(height)) => Some(Resolution::new(width, height)),
        (None, None) => None,
        _ => bail!("roi: reference_width and reference_height must be given together"),
    };
    Ok(RoiConfig { spec, reference })
}

fn validate_topic(topic: &str, what: &str) -> Result<()> {
    if topic.is_empty() {
        bail!("{} must not be empty", what);
    }
    if topic.contains(['#', '+']) {
        bail!("{} must not contain wildcards: {}", what, topic);
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SentryConfig {
        SentryConfig::from_file(SentryConfigFile::default()).unwrap()
    }

    #[test]
    fn defaults_resolve() {
        let cfg = defaults();
        assert_eq!(cfg.stream.url, DEFAULT_STREAM_URL);
        assert_eq!(
            cfg.pipeline.processing,
            ProcessingSize::Fixed(Resolution::new(800, 600))
        );
        assert_eq!(cfg.pipeline.detection, DetectionConfig::default());
        assert_eq!(cfg.capture.clip_duration, Duration::from_secs(5));
        assert_eq!(cfg.mqtt.topic, "motion/detection");
        assert!(cfg.mqtt.broker.is_none());
        assert!(cfg.validate().is_ok());
        assert!(cfg.mqtt_settings().unwrap().is_none());
    }

    #[test]
    fn empty_processing_section_means_native() {
        let file = SentryConfigFile {
            processing: Some(ProcessingConfigFile::default()),
            ..SentryConfigFile::default()
        };
        let cfg = SentryConfig::from_file(file).unwrap();
        assert_eq!(cfg.pipeline.processing, ProcessingSize::Native);
    }

    #[test]
    fn roi_forms_are_exclusive() {
        let both = RoiConfigFile {
            top_left: Some([0, 0]),
            bottom_right: Some([10, 10]),
            x: Some(0),
            ..RoiConfigFile::default()
        };
        assert!(roi_config(both).is_err());

        let region = RoiConfigFile {
            x: Some(5),
            y: Some(6),
            width: Some(10),
            height: Some(20),
            reference_width: Some(1920),
            reference_height: Some(1080),
            ..RoiConfigFile::default()
        };
        let roi = roi_config(region).unwrap();
        assert_eq!(roi.spec.corners(), (Point::new(5, 6), Point::new(15, 26)));
        assert_eq!(roi.reference, Some(Resolution::new(1920, 1080)));

        let half_reference = RoiConfigFile {
            top_left: Some([0, 0]),
            bottom_right: Some([10, 10]),
            reference_width: Some(1920),
            ..RoiConfigFile::default()
        };
        assert!(roi_config(half_reference).is_err());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let file = SentryConfigFile {
            detection: Some(DetectionConfigFile {
                threshold: Some(300),
                ..DetectionConfigFile::default()
            }),
            ..SentryConfigFile::default()
        };
        assert!(SentryConfig::from_file(file).is_err());
    }

    #[test]
    fn wildcard_topics_are_rejected() {
        let mut cfg = defaults();
        cfg.mqtt.topic = "motion/#".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn client_id_defaults_to_camera() {
        let mut cfg = defaults();
        cfg.camera_id = "dock-3".to_string();
        cfg.mqtt.broker = Some("mqtt://127.0.0.1:1883".to_string());
        let settings = cfg.mqtt_settings().unwrap().unwrap();
        assert_eq!(settings.client_id, "motion-sentry-dock-3");
        assert_eq!(settings.endpoint.port, 1883);
    }
}
