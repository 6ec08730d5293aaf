//! Outbound notifications.
//!
//! The dispatcher only needs `publish(message)`. Connection management lives
//! behind the `Notifier` implementation and has an explicit lifecycle: the
//! binary starts it before the pipeline and stops it after.

use anyhow::Result;
use chrono::{DateTime, Local, SecondsFormat};
use std::time::SystemTime;

pub mod endpoint;
pub mod mqtt;

pub use endpoint::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials, TlsPaths};
pub use mqtt::{MqttNotifier, MqttSettings};

pub const DEFAULT_TOPIC: &str = "motion/detection";
pub const DEFAULT_MESSAGE: &str = "Motion detected!";

/// Publishes plain-text alerts to a fixed channel.
pub trait Notifier: Send + Sync {
    fn publish(&self, message: &str) -> Result<()>;

    /// Release the connection. Further publishes may fail.
    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Notifier used when no broker is configured.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {
    channel: String,
}

impl LogNotifier {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl Notifier for LogNotifier {
    fn publish(&self, message: &str) -> Result<()> {
        log::info!("notification [{}]: {}", self.channel, message);
        Ok(())
    }
}

/// Values available to a message template.
#[derive(Clone, Debug)]
pub struct MessageContext<'a> {
    pub camera: &'a str,
    pub timestamp: SystemTime,
    pub boxes: usize,
    pub id: &'a str,
}

/// Alert text with `{camera}`, `{timestamp}`, `{boxes}` and `{id}` placeholders.
///
/// A template without placeholders is sent verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageTemplate {
    template: String,
}

impl MessageTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn render(&self, ctx: &MessageContext<'_>) -> String {
        if !self.template.contains('{') {
            return self.template.clone();
        }
        let timestamp =
            DateTime::<Local>::from(ctx.timestamp).to_rfc3339_opts(SecondsFormat::Secs, false);
        self.template
            .replace("{camera}", ctx.camera)
            .replace("{timestamp}", &timestamp)
            .replace("{boxes}", &ctx.boxes.to_string())
            .replace("{id}", ctx.id)
    }
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE)
    }
}
