//! MQTT v5 notifier.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::endpoint::{MqttEndpoint, TlsMaterials};
use super::Notifier;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 10;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsMaterials,
    /// Retained `online`/`offline` status topic, with `offline` as last will.
    pub availability_topic: Option<String>,
}

/// Publishes alerts to one topic over a long-lived broker session.
///
/// A background thread drives the rumqttc event loop (and with it the
/// reconnects); `publish` only enqueues, so a slow or absent broker never
/// blocks the caller.
pub struct MqttNotifier {
    client: Client,
    topic: String,
    availability_topic: Option<String>,
    stopping: Arc<AtomicBool>,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    pub fn start(settings: MqttSettings) -> Result<Self> {
        let endpoint = &settings.endpoint;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        if let Some(topic) = &settings.availability_topic {
            options.set_last_will(LastWill::new(
                topic,
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
                None,
            ));
        }
        options.set_transport(settings.tls.transport_for(endpoint)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = {
            let stopping = Arc::clone(&stopping);
            let label = endpoint.to_string();
            std::thread::Builder::new()
                .name("mqtt-connection".to_string())
                .spawn(move || drive_connection(connection, &label, &stopping))
                .context("spawn MQTT connection thread")?
        };

        if let Some(topic) = &settings.availability_topic {
            client
                .try_publish(
                    topic.as_str(),
                    QoS::AtLeastOnce,
                    true,
                    PAYLOAD_ONLINE.as_bytes().to_vec(),
                )
                .map_err(|e| anyhow!("queue availability message: {}", e))?;
        }
        log::info!(
            "MQTT notifier started for {} (topic {}, auth: {})",
            endpoint,
            settings.topic,
            settings.username.is_some()
        );

        Ok(Self {
            client,
            topic: settings.topic,
            availability_topic: settings.availability_topic,
            stopping,
            connection: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Notifier for MqttNotifier {
    fn publish(&self, message: &str) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(anyhow!("MQTT notifier is stopped"));
        }
        self.client
            .try_publish(
                self.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                message.as_bytes().to_vec(),
            )
            .map_err(|e| anyhow!("queue MQTT message on {}: {}", self.topic, e))
    }

    fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(topic) = &self.availability_topic {
            if let Err(e) = self.client.try_publish(
                topic.as_str(),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
            ) {
                log::warn!("could not queue MQTT offline status: {}", e);
            }
        }
        if let Err(e) = self.client.try_disconnect() {
            log::warn!("could not queue MQTT disconnect: {}", e);
        }
        let handle = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("MQTT connection thread panicked"))?;
        }
        log::info!("MQTT notifier stopped");
        Ok(())
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("MQTT notifier shutdown: {}", e);
        }
    }
}

fn drive_connection(mut connection: Connection, label: &str, stopping: &AtomicBool) {
    let mut connected = false;
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !connected {
                    log::info!("MQTT connected to {}", label);
                }
                connected = true;
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                log::warn!("MQTT broker {} closed the session", label);
                connected = false;
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                if connected {
                    log::warn!("MQTT connection to {} lost: {}", label, e);
                } else {
                    log::warn!("MQTT connection to {} failed: {}", label, e);
                }
                connected = false;
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }
    log::debug!("MQTT connection loop for {} finished", label);
}
