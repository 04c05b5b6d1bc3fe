//! MQTT binding contract.
//!
//! The actual broker client lives outside this crate; the core programs
//! against [`MqttConnection`] only. This module fixes the topic layout
//! (`{gbid}/{channelId}/low` unicast, `{gbid}/mcast/{topic}` multicast), the
//! reconnect backoff policy, and the [`MqttSender`] stub the router uses for
//! MQTT-addressed hops.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::address::Address;
use crate::error::{FailureCallback, JoynrError};
use crate::message::ImmutableMessage;
use crate::routing::router::MessagingStub;
use crate::settings::MessagingSettings;

/// Contract the external MQTT client must satisfy.
pub trait MqttConnection: Send + Sync {
    fn publish(&self, topic: &str, qos_level: u8, payload: &[u8]) -> Result<(), JoynrError>;
    fn subscribe(&self, topic: &str, qos_level: u8) -> Result<(), JoynrError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), JoynrError>;
    /// Callback for inbound publications: `(topic, payload)`.
    fn register_receive_callback(&self, callback: Box<dyn Fn(&str, Bytes) + Send + Sync>);
    /// Callback invoked when the connection's readiness changes.
    fn register_ready_to_send_changed_callback(&self, callback: Box<dyn Fn(bool) + Send + Sync>);
}

/// Unicast topic for a channel on a broker group.
pub fn unicast_topic(gbid: &str, channel_id: &str) -> String {
    format!("{gbid}/{channel_id}/low")
}

/// Multicast topic on a broker group.
pub fn multicast_topic(gbid: &str, topic: &str) -> String {
    format!("{gbid}/mcast/{topic}")
}

/// Reconnect delay policy: fixed, or doubling per attempt up to a cap.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    exponential: bool,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn from_settings(settings: &MessagingSettings) -> Self {
        Self {
            base: Duration::from_secs(settings.mqtt_reconnect_delay_seconds),
            max: Duration::from_secs(settings.mqtt_reconnect_max_delay_seconds),
            exponential: settings.mqtt_exponential_backoff_enabled,
            attempt: 0,
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.exponential {
            let factor = 1u64 << self.attempt.min(16);
            (self.base * u32::try_from(factor).unwrap_or(u32::MAX)).min(self.max)
        } else {
            self.base
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Messaging stub publishing to one unicast topic.
pub struct MqttSender {
    connection: Arc<dyn MqttConnection>,
    topic: String,
    qos_level: u8,
}

impl std::fmt::Debug for MqttSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSender").field("topic", &self.topic).finish()
    }
}

impl MqttSender {
    /// Stub for an MQTT-addressed participant.
    ///
    /// Returns `None` for non-MQTT addresses.
    pub fn for_address(
        connection: Arc<dyn MqttConnection>,
        address: &Address,
        qos_level: u8,
    ) -> Option<Self> {
        match address {
            Address::Mqtt { gbid, channel_id } => Some(Self {
                connection,
                topic: unicast_topic(gbid, channel_id),
                qos_level,
            }),
            Address::MulticastTopic { topic } => Some(Self {
                connection,
                // The gbid prefix is already part of stored multicast topics.
                topic: topic.clone(),
                qos_level,
            }),
            _ => None,
        }
    }
}

impl MessagingStub for MqttSender {
    fn transmit(&self, message: &Arc<ImmutableMessage>, on_failure: FailureCallback) {
        let raw = match message.serialize() {
            Ok(raw) => raw,
            Err(error) => {
                on_failure(error);
                return;
            }
        };
        if let Err(error) = self.connection.publish(&self.topic, self.qos_level, &raw) {
            // Broker trouble is transient; the router reschedules.
            on_failure(JoynrError::DelayMessage(format!(
                "publish to {} failed: {error}",
                self.topic
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, MutableMessage};
    use std::sync::Mutex;

    #[test]
    fn test_topic_layout() {
        assert_eq!(unicast_topic("gbid1", "channel-7"), "gbid1/channel-7/low");
        assert_eq!(multicast_topic("gbid1", "prov/event/p0"), "gbid1/mcast/prov/event/p0");
    }

    #[test]
    fn test_fixed_backoff() {
        let mut settings = MessagingSettings::default();
        settings.mqtt_reconnect_delay_seconds = 2;
        settings.mqtt_exponential_backoff_enabled = false;
        let mut backoff = ReconnectBackoff::from_settings(&settings);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let mut settings = MessagingSettings::default();
        settings.mqtt_reconnect_delay_seconds = 1;
        settings.mqtt_reconnect_max_delay_seconds = 5;
        settings.mqtt_exponential_backoff_enabled = true;
        let mut backoff = ReconnectBackoff::from_settings(&settings);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5), "capped");
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[derive(Default)]
    struct MockConnection {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl MqttConnection for MockConnection {
        fn publish(&self, topic: &str, _qos: u8, payload: &[u8]) -> Result<(), JoynrError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(JoynrError::Transport("broker gone".into()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_owned(), payload.to_vec()));
            Ok(())
        }
        fn subscribe(&self, _topic: &str, _qos: u8) -> Result<(), JoynrError> {
            Ok(())
        }
        fn unsubscribe(&self, _topic: &str) -> Result<(), JoynrError> {
            Ok(())
        }
        fn register_receive_callback(&self, _callback: Box<dyn Fn(&str, Bytes) + Send + Sync>) {}
        fn register_ready_to_send_changed_callback(
            &self,
            _callback: Box<dyn Fn(bool) + Send + Sync>,
        ) {
        }
    }

    fn sample_message() -> Arc<ImmutableMessage> {
        let mut builder = MutableMessage::new();
        builder
            .set_sender("proxy")
            .set_recipient("provider")
            .set_type(MessageType::Request)
            .set_ttl_ms(10_000);
        builder.immutable().unwrap()
    }

    #[test]
    fn test_sender_publishes_serialized_message_to_unicast_topic() {
        let connection = Arc::new(MockConnection::default());
        let sender = MqttSender::for_address(
            Arc::clone(&connection) as Arc<dyn MqttConnection>,
            &Address::mqtt("gbid1", "chan"),
            1,
        )
        .unwrap();

        let message = sample_message();
        sender.transmit(&message, Box::new(|_| panic!("no failure expected")));

        let published = connection.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "gbid1/chan/low");
        let parsed = ImmutableMessage::deserialize(&published[0].1).unwrap();
        assert_eq!(parsed.id(), message.id());
    }

    #[test]
    fn test_publish_failure_is_transient() {
        let connection = Arc::new(MockConnection::default());
        connection
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let sender = MqttSender::for_address(
            Arc::clone(&connection) as Arc<dyn MqttConnection>,
            &Address::mqtt("gbid1", "chan"),
            1,
        )
        .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        sender.transmit(
            &sample_message(),
            Box::new(move |error| {
                let _ = tx.send(error);
            }),
        );
        let error = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(error.is_transient());
    }

    #[test]
    fn test_for_address_rejects_non_mqtt() {
        let connection = Arc::new(MockConnection::default());
        assert!(MqttSender::for_address(
            connection as Arc<dyn MqttConnection>,
            &Address::uds_client("c"),
            1
        )
        .is_none());
    }
}
