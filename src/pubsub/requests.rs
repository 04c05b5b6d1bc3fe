//! Subscription control payloads carried inside messages.
//!
//! These are the bodies of `subscriptionRequest`, `subscriptionReply`,
//! `subscriptionStop` and `subscriptionPublication` messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::qos::SubscriptionQos;

fn new_subscription_id() -> String {
    Uuid::new_v4().to_string()
}

/// Request for an attribute subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    #[serde(default = "new_subscription_id")]
    pub subscription_id: String,
    /// Attribute name on the provider's interface.
    pub subscribe_to_name: String,
    pub qos: SubscriptionQos,
}

impl SubscriptionRequest {
    pub fn new(subscribe_to_name: impl Into<String>, qos: SubscriptionQos) -> Self {
        Self {
            subscription_id: new_subscription_id(),
            subscribe_to_name: subscribe_to_name.into(),
            qos,
        }
    }
}

/// Request for a selective-broadcast subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSubscriptionRequest {
    #[serde(default = "new_subscription_id")]
    pub subscription_id: String,
    /// Broadcast (event) name on the provider's interface.
    pub subscribe_to_name: String,
    /// Filter parameters captured at subscription time, handed to every
    /// registered filter on each fire.
    #[serde(default)]
    pub filter_parameters: HashMap<String, String>,
    pub qos: SubscriptionQos,
}

impl BroadcastSubscriptionRequest {
    pub fn new(subscribe_to_name: impl Into<String>, qos: SubscriptionQos) -> Self {
        Self {
            subscription_id: new_subscription_id(),
            subscribe_to_name: subscribe_to_name.into(),
            filter_parameters: HashMap::new(),
            qos,
        }
    }
}

/// Request for a (non-selective) multicast subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticastSubscriptionRequest {
    #[serde(default = "new_subscription_id")]
    pub subscription_id: String,
    pub subscribe_to_name: String,
    /// Full multicast id (`provider/name[/partition...]`).
    pub multicast_id: String,
    /// Partition pattern; may contain `+` and a trailing `*`.
    #[serde(default)]
    pub partitions: Vec<String>,
    pub qos: SubscriptionQos,
}

/// Tagged union of subscription-request payloads, for wire dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum SubscriptionControl {
    #[serde(rename = "joynr.SubscriptionRequest")]
    Attribute(SubscriptionRequest),
    #[serde(rename = "joynr.BroadcastSubscriptionRequest")]
    Broadcast(BroadcastSubscriptionRequest),
    #[serde(rename = "joynr.MulticastSubscriptionRequest")]
    Multicast(MulticastSubscriptionRequest),
}

/// Answer to any subscription request; sent exactly once per successful add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionReply {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubscriptionReply {
    pub fn success(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            error: None,
        }
    }

    pub fn failure(subscription_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            error: Some(error.into()),
        }
    }
}

/// Consumer-initiated unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStop {
    pub subscription_id: String,
}

/// One publication: a value or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPublication {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubscriptionPublication {
    pub fn value(subscription_id: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            response: Some(response),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let qos = SubscriptionQos::on_change(1_000, 500, 0);
        let a = SubscriptionRequest::new("location", qos.clone());
        let b = SubscriptionRequest::new("location", qos);
        assert_ne!(a.subscription_id, b.subscription_id);
    }

    #[test]
    fn test_request_round_trip() {
        let mut request =
            BroadcastSubscriptionRequest::new("locationUpdated", SubscriptionQos::on_change(1_000, 500, 0));
        request
            .filter_parameters
            .insert("country".into(), "de".into());
        let json = serde_json::to_string(&request).unwrap();
        let parsed: BroadcastSubscriptionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request, parsed);
    }

    #[test]
    fn test_missing_subscription_id_is_generated() {
        let json = r#"{
            "subscribeToName": "location",
            "qos": {"_typeName": "joynr.OnChangeSubscriptionQos",
                    "expiryDateMs": 0, "publicationTtlMs": 1000, "minIntervalMs": 0}
        }"#;
        let parsed: SubscriptionRequest = serde_json::from_str(json).unwrap();
        assert!(!parsed.subscription_id.is_empty());
    }

    #[test]
    fn test_control_envelope_dispatches_by_type_name() {
        let request = SubscriptionRequest::new("location", SubscriptionQos::on_change(1_000, 500, 0));
        let control = SubscriptionControl::Attribute(request.clone());
        let json = serde_json::to_string(&control).unwrap();
        assert!(json.contains(r#""_typeName":"joynr.SubscriptionRequest""#));
        match serde_json::from_str::<SubscriptionControl>(&json).unwrap() {
            SubscriptionControl::Attribute(parsed) => assert_eq!(parsed, request),
            other => panic!("expected attribute request, got {other:?}"),
        }
    }

    #[test]
    fn test_publication_skips_absent_fields() {
        let publication = SubscriptionPublication::value("sub-1", serde_json::json!(42));
        let json = serde_json::to_string(&publication).unwrap();
        assert!(!json.contains("error"));
    }
}
