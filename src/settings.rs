//! Configuration loading and persistence.
//!
//! Two settings groups: [`UdsSettings`] for the Unix-domain-socket transport
//! and [`MessagingSettings`] for routing, MQTT and publication behavior.
//! Both serialize to JSON files and fill every missing key with its default,
//! so a partial (or absent) settings file is always a legal configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::error::JoynrError;

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/joynr/cluster-controller.sock")
}

fn default_connect_sleep_time_ms() -> u64 {
    500
}

fn default_sending_queue_size() -> usize {
    1024
}

fn default_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// Settings for the UDS transport (`uds/*` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsSettings {
    /// UDS socket file path (`uds/socket-path`).
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Delay between failed connect attempts (`uds/connect-sleep-time-ms`).
    #[serde(default = "default_connect_sleep_time_ms")]
    pub connect_sleep_time_ms: u64,

    /// Per-connection send-queue cap (`uds/sending-queue-size`).
    ///
    /// Zero is legal and causes send failures whenever a write is already in
    /// flight.
    #[serde(default = "default_sending_queue_size")]
    pub sending_queue_size: usize,

    /// Unique identifier carried in the init frame (`uds/client-id`).
    /// A random UUID if absent.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for UdsSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_sleep_time_ms: default_connect_sleep_time_ms(),
            sending_queue_size: default_sending_queue_size(),
            client_id: default_client_id(),
        }
    }
}

impl UdsSettings {
    pub fn connect_sleep_time(&self) -> Duration {
        Duration::from_millis(self.connect_sleep_time_ms)
    }

    /// The address a client built from these settings announces in its
    /// init frame.
    pub fn create_client_messaging_address(&self) -> Address {
        Address::uds_client(self.client_id.clone())
    }
}

fn default_mqtt_keep_alive_time_seconds() -> u64 {
    60
}

fn default_mqtt_reconnect_delay_seconds() -> u64 {
    1
}

fn default_mqtt_reconnect_max_delay_seconds() -> u64 {
    60
}

fn default_ttl_uplift_ms() -> i64 {
    0
}

fn default_send_retry_interval_ms() -> u64 {
    500
}

fn default_message_queue_limit() -> usize {
    1000
}

fn default_subscription_persistence_filename() -> PathBuf {
    PathBuf::from("SubscriptionRequests.persist")
}

fn default_multicast_persistence_filename() -> PathBuf {
    PathBuf::from("MulticastReceiverDirectory.persist")
}

/// Settings for routing, publications and the MQTT binding
/// (`messaging/*` and `cluster-controller/*` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingSettings {
    /// MQTT keepalive (`messaging/mqtt-keep-alive-time-seconds`).
    #[serde(default = "default_mqtt_keep_alive_time_seconds")]
    pub mqtt_keep_alive_time_seconds: u64,

    /// Base reconnect delay (`messaging/mqtt-reconnect-delay-seconds`).
    #[serde(default = "default_mqtt_reconnect_delay_seconds")]
    pub mqtt_reconnect_delay_seconds: u64,

    /// Reconnect delay cap (`messaging/mqtt-reconnect-max-delay-seconds`).
    #[serde(default = "default_mqtt_reconnect_max_delay_seconds")]
    pub mqtt_reconnect_max_delay_seconds: u64,

    /// Whether the reconnect delay doubles per attempt
    /// (`messaging/mqtt-exponential-backoff-enabled`).
    #[serde(default)]
    pub mqtt_exponential_backoff_enabled: bool,

    /// Publication TTL uplift (`messaging/ttl-uplift-ms`).
    #[serde(default = "default_ttl_uplift_ms")]
    pub ttl_uplift_ms: i64,

    /// Base delay before a failed send is rescheduled
    /// (`messaging/send-msg-retry-interval-ms`).
    #[serde(default = "default_send_retry_interval_ms")]
    pub send_msg_retry_interval_ms: u64,

    /// Global cap on messages parked for unknown recipients
    /// (`messaging/max-message-queue-size`).
    #[serde(default = "default_message_queue_limit")]
    pub message_queue_limit: usize,

    /// Subscription-request persistence file
    /// (`cluster-controller/subscription-request-persistence-filename`).
    #[serde(default = "default_subscription_persistence_filename")]
    pub subscription_request_persistence_filename: PathBuf,

    /// Multicast receiver directory persistence file
    /// (`cluster-controller/multicast-receiver-directory-persistence-filename`).
    #[serde(default = "default_multicast_persistence_filename")]
    pub multicast_receiver_directory_persistence_filename: PathBuf,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            mqtt_keep_alive_time_seconds: default_mqtt_keep_alive_time_seconds(),
            mqtt_reconnect_delay_seconds: default_mqtt_reconnect_delay_seconds(),
            mqtt_reconnect_max_delay_seconds: default_mqtt_reconnect_max_delay_seconds(),
            mqtt_exponential_backoff_enabled: false,
            ttl_uplift_ms: default_ttl_uplift_ms(),
            send_msg_retry_interval_ms: default_send_retry_interval_ms(),
            message_queue_limit: default_message_queue_limit(),
            subscription_request_persistence_filename:
                default_subscription_persistence_filename(),
            multicast_receiver_directory_persistence_filename:
                default_multicast_persistence_filename(),
        }
    }
}

/// Combined daemon settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub uds: UdsSettings,
    #[serde(default)]
    pub messaging: MessagingSettings,
}

impl Settings {
    /// Load settings from a JSON file, filling missing keys with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`JoynrError::Settings`] if the file exists but cannot be read
    /// or parsed. A missing file yields full defaults.
    pub fn load(path: &Path) -> Result<Self, JoynrError> {
        if !path.exists() {
            log::info!(
                "[Settings] No settings file at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| JoynrError::Settings(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| JoynrError::Settings(format!("parse {}: {e}", path.display())))
    }

    /// Persist settings as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), JoynrError> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| JoynrError::Settings(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| JoynrError::Settings(format!("mkdir {}: {e}", parent.display())))?;
        }
        fs::write(path, raw)
            .map_err(|e| JoynrError::Settings(format!("write {}: {e}", path.display())))
    }
}
