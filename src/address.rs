//! Participant addresses.
//!
//! An [`Address`] names where a participant can be reached. Equality is
//! value-based, so addresses can key routing-table refcounts. The serde
//! representation uses the `_typeName` discriminator the wire contract
//! requires: the UDS init frame body is exactly the JSON serialization of a
//! [`Address::UdsClient`] value.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a participant can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum Address {
    /// A participant living in this process; dispatch goes through the local
    /// dispatcher, which resolves the recipient participant id itself.
    #[serde(rename = "joynr.system.RoutingTypes.InProcessAddress")]
    InProcess,

    /// A client connected over the Unix domain socket.
    #[serde(rename = "joynr.system.RoutingTypes.UdsClientAddress")]
    UdsClient { id: String },

    /// A remote participant reachable through an MQTT broker group.
    #[serde(rename = "joynr.system.RoutingTypes.MqttAddress")]
    Mqtt {
        gbid: String,
        #[serde(rename = "topic")]
        channel_id: String,
    },

    /// A multicast topic pattern subscribers share.
    #[serde(rename = "joynr.system.RoutingTypes.MqttMulticastAddress")]
    MulticastTopic { topic: String },
}

impl Address {
    pub fn uds_client(id: impl Into<String>) -> Self {
        Address::UdsClient { id: id.into() }
    }

    /// Fresh UDS client address with a random id.
    pub fn random_uds_client() -> Self {
        Address::UdsClient {
            id: Uuid::new_v4().to_string(),
        }
    }

    pub fn mqtt(gbid: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Address::Mqtt {
            gbid: gbid.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::InProcess => write!(f, "in-process"),
            Address::UdsClient { id } => write!(f, "uds:{id}"),
            Address::Mqtt { gbid, channel_id } => write!(f, "mqtt:{gbid}/{channel_id}"),
            Address::MulticastTopic { topic } => write!(f, "mcast:{topic}"),
        }
    }
}
