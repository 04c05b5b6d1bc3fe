//! Cluster-controller messaging core.
//!
//! A cluster controller multiplexes many in-process consumers and providers
//! onto shared transports: a Unix domain socket for local clients and MQTT
//! towards a global broker. This crate implements the delivery core —
//! length-prefixed UDS framing with bounded send queues, per-recipient
//! message queueing with TTL-prioritized eviction, multicast partition
//! matching, the publication manager for attribute/broadcast subscriptions,
//! and the timer/delayed-scheduler machinery behind all of it.

pub mod address;
pub mod error;
pub mod message;
pub mod mqtt;
pub mod persistence;
pub mod pubsub;
pub mod routing;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod timer;
pub mod uds;

// Re-export commonly used types
pub use address::Address;
pub use error::{FailureCallback, JoynrError};
pub use message::{ImmutableMessage, MessageType, MutableMessage, NO_EXPIRY};
pub use pubsub::{PublicationManager, PublicationSender, RequestCaller, SubscriptionQos};
pub use routing::{MessageRouter, MessagingStub, StubFactory};
pub use runtime::{ClusterControllerRuntime, LocalDispatcher, MessageListener};
pub use scheduler::DelayedScheduler;
pub use settings::{MessagingSettings, Settings, UdsSettings};
pub use timer::Timer;
pub use uds::{UdsClient, UdsClientEvent, UdsSenderHandle, UdsServer, UdsServerEvent};
