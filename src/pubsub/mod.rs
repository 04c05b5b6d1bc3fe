//! Publish/subscribe: subscription state, QoS, filters, publication driving.

pub mod filters;
pub mod manager;
pub mod qos;
pub mod requests;
pub mod store;

pub use filters::BroadcastFilter;
pub use manager::{PublicationManager, PublicationSender, RequestCaller};
pub use qos::SubscriptionQos;
pub use requests::{
    BroadcastSubscriptionRequest, MulticastSubscriptionRequest, SubscriptionControl,
    SubscriptionPublication, SubscriptionReply, SubscriptionRequest, SubscriptionStop,
};
pub use store::{SubscriptionKind, SubscriptionRecord, SubscriptionStore};
