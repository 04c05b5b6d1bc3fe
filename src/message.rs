//! Message model: mutable builder, immutable wire message, TTL helpers.
//!
//! A [`MutableMessage`] is assembled by the sending side and frozen into an
//! [`ImmutableMessage`] for routing. Immutable messages are shared by
//! reference ([`Arc`]) between the router, the message queue and the transport
//! send paths; the payload is a [`Bytes`] handle and is never copied or
//! mutated after construction.
//!
//! The envelope byte codec here is JSON. The production serialized-message
//! format is produced by an external library and plugs in behind the same
//! byte-array interface.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JoynrError;

/// Sentinel expiry meaning "effectively infinite".
pub const NO_EXPIRY: i64 = i64::MAX;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Add an uplift to an absolute expiry, saturating at [`NO_EXPIRY`].
///
/// [`NO_EXPIRY`] is a fixed point: an infinite expiry stays infinite.
pub fn uplift_expiry(expiry_date_ms: i64, uplift_ms: i64) -> i64 {
    if expiry_date_ms == NO_EXPIRY {
        return NO_EXPIRY;
    }
    expiry_date_ms.saturating_add(uplift_ms)
}

/// Message type tag carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "reply")]
    Reply,
    #[serde(rename = "oneWayRequest")]
    OneWayRequest,
    #[serde(rename = "subscriptionRequest")]
    SubscriptionRequest,
    #[serde(rename = "subscriptionReply")]
    SubscriptionReply,
    #[serde(rename = "subscriptionStop")]
    SubscriptionStop,
    #[serde(rename = "subscriptionPublication")]
    SubscriptionPublication,
    #[serde(rename = "multicast")]
    Multicast,
}

/// Delivery effort requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageEffort {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "bestEffort")]
    BestEffort,
}

mod payload_bytes {
    //! Serde adapter for the opaque payload (`Bytes` <-> byte sequence).
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(payload)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        Ok(Bytes::from(raw))
    }
}

/// Builder for outbound messages.
///
/// All fields default to empty; the freeze step fills in the message id and
/// creation timestamp and validates the expiry invariant.
#[derive(Debug, Clone, Default)]
pub struct MutableMessage {
    sender: String,
    recipient: String,
    message_type: Option<MessageType>,
    expiry_date_ms: i64,
    effort: Option<MessageEffort>,
    compressed: bool,
    custom_headers: HashMap<String, String>,
    payload: Bytes,
}

impl MutableMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) -> &mut Self {
        self.sender = sender.into();
        self
    }

    pub fn set_recipient(&mut self, recipient: impl Into<String>) -> &mut Self {
        self.recipient = recipient.into();
        self
    }

    pub fn set_type(&mut self, message_type: MessageType) -> &mut Self {
        self.message_type = Some(message_type);
        self
    }

    /// Absolute expiry in epoch milliseconds.
    pub fn set_expiry_date_ms(&mut self, expiry_date_ms: i64) -> &mut Self {
        self.expiry_date_ms = expiry_date_ms;
        self
    }

    /// Convenience: expiry = now + ttl, saturating for [`NO_EXPIRY`].
    pub fn set_ttl_ms(&mut self, ttl_ms: i64) -> &mut Self {
        self.expiry_date_ms = if ttl_ms == NO_EXPIRY {
            NO_EXPIRY
        } else {
            now_ms().saturating_add(ttl_ms)
        };
        self
    }

    pub fn set_effort(&mut self, effort: MessageEffort) -> &mut Self {
        self.effort = Some(effort);
        self
    }

    pub fn set_compressed(&mut self, compressed: bool) -> &mut Self {
        self.compressed = compressed;
        self
    }

    pub fn put_custom_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) -> &mut Self {
        self.payload = payload.into();
        self
    }

    /// Freeze into an [`ImmutableMessage`], assigning id and creation time.
    ///
    /// # Errors
    ///
    /// Returns [`JoynrError::InvalidArgument`] if no message type was set or
    /// the expiry predates the creation timestamp.
    pub fn immutable(&self) -> Result<Arc<ImmutableMessage>, JoynrError> {
        let message_type = self
            .message_type
            .ok_or_else(|| JoynrError::InvalidArgument("message type not set".into()))?;
        let creation_date_ms = now_ms();
        if self.expiry_date_ms < creation_date_ms {
            return Err(JoynrError::InvalidArgument(format!(
                "expiry {} predates creation {}",
                self.expiry_date_ms, creation_date_ms
            )));
        }
        Ok(Arc::new(ImmutableMessage {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            creation_date_ms,
            expiry_date_ms: self.expiry_date_ms,
            effort: self.effort,
            compressed: self.compressed,
            custom_headers: self.custom_headers.clone(),
            payload: self.payload.clone(),
        }))
    }
}

/// A frozen message as it travels through the router and the transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmutableMessage {
    id: String,
    #[serde(rename = "type")]
    message_type: MessageType,
    sender: String,
    recipient: String,
    creation_date_ms: i64,
    expiry_date_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    effort: Option<MessageEffort>,
    #[serde(default)]
    compressed: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    custom_headers: HashMap<String, String>,
    #[serde(with = "payload_bytes")]
    payload: Bytes,
}

impl ImmutableMessage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Recipient participant id, or the multicast id for multicast messages.
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn creation_date_ms(&self) -> i64 {
        self.creation_date_ms
    }

    pub fn expiry_date_ms(&self) -> i64 {
        self.expiry_date_ms
    }

    pub fn effort(&self) -> Option<MessageEffort> {
        self.effort
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn custom_headers(&self) -> &HashMap<String, String> {
        &self.custom_headers
    }

    /// Shared handle to the payload; cloning is reference counting.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Whether the message is discardable at `now` (epoch ms).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry_date_ms != NO_EXPIRY && now >= self.expiry_date_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Remaining TTL at `now`, clamped to zero.
    pub fn remaining_ttl_ms(&self, now: i64) -> i64 {
        if self.expiry_date_ms == NO_EXPIRY {
            NO_EXPIRY
        } else {
            (self.expiry_date_ms - now).max(0)
        }
    }

    /// Encode the envelope to bytes.
    pub fn serialize(&self) -> Result<Bytes, JoynrError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| JoynrError::Serialization(e.to_string()))
    }

    /// Decode an envelope from bytes.
    pub fn deserialize(raw: &[u8]) -> Result<ImmutableMessage, JoynrError> {
        serde_json::from_slice(raw).map_err(|e| JoynrError::Serialization(e.to_string()))
    }
}
