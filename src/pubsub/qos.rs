//! Subscription quality-of-service variants.
//!
//! All durations are milliseconds and non-negative. Expiry dates are
//! absolute epoch milliseconds with [`NO_EXPIRY`] as the "effectively
//! infinite" sentinel.

use serde::{Deserialize, Serialize};

use crate::error::JoynrError;
use crate::message::{now_ms, NO_EXPIRY};

/// QoS attached to a subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum SubscriptionQos {
    /// Publish on every change, rate-limited by `min_interval_ms`.
    #[serde(rename = "joynr.OnChangeSubscriptionQos")]
    OnChange {
        #[serde(rename = "expiryDateMs")]
        expiry_date_ms: i64,
        #[serde(rename = "publicationTtlMs")]
        publication_ttl_ms: i64,
        #[serde(rename = "minIntervalMs")]
        min_interval_ms: i64,
    },

    /// On-change plus a keep-alive publication every `max_interval_ms`.
    #[serde(rename = "joynr.OnChangeWithKeepAliveSubscriptionQos")]
    OnChangeWithKeepAlive {
        #[serde(rename = "expiryDateMs")]
        expiry_date_ms: i64,
        #[serde(rename = "publicationTtlMs")]
        publication_ttl_ms: i64,
        #[serde(rename = "minIntervalMs")]
        min_interval_ms: i64,
        #[serde(rename = "maxIntervalMs")]
        max_interval_ms: i64,
        #[serde(rename = "alertAfterIntervalMs")]
        alert_after_interval_ms: i64,
    },

    /// Multicast subscription; only validity and publication TTL apply.
    #[serde(rename = "joynr.MulticastSubscriptionQos")]
    Multicast {
        #[serde(rename = "expiryDateMs")]
        expiry_date_ms: i64,
        #[serde(rename = "publicationTtlMs")]
        publication_ttl_ms: i64,
    },
}

impl SubscriptionQos {
    /// On-change QoS expiring `validity_ms` from now.
    pub fn on_change(validity_ms: i64, publication_ttl_ms: i64, min_interval_ms: i64) -> Self {
        SubscriptionQos::OnChange {
            expiry_date_ms: expiry_from_validity(validity_ms),
            publication_ttl_ms,
            min_interval_ms,
        }
    }

    pub fn on_change_with_keep_alive(
        validity_ms: i64,
        publication_ttl_ms: i64,
        min_interval_ms: i64,
        max_interval_ms: i64,
        alert_after_interval_ms: i64,
    ) -> Self {
        SubscriptionQos::OnChangeWithKeepAlive {
            expiry_date_ms: expiry_from_validity(validity_ms),
            publication_ttl_ms,
            min_interval_ms,
            max_interval_ms,
            alert_after_interval_ms,
        }
    }

    pub fn multicast(validity_ms: i64, publication_ttl_ms: i64) -> Self {
        SubscriptionQos::Multicast {
            expiry_date_ms: expiry_from_validity(validity_ms),
            publication_ttl_ms,
        }
    }

    pub fn expiry_date_ms(&self) -> i64 {
        match *self {
            SubscriptionQos::OnChange { expiry_date_ms, .. }
            | SubscriptionQos::OnChangeWithKeepAlive { expiry_date_ms, .. }
            | SubscriptionQos::Multicast { expiry_date_ms, .. } => expiry_date_ms,
        }
    }

    pub fn set_expiry_date_ms(&mut self, value: i64) {
        match self {
            SubscriptionQos::OnChange { expiry_date_ms, .. }
            | SubscriptionQos::OnChangeWithKeepAlive { expiry_date_ms, .. }
            | SubscriptionQos::Multicast { expiry_date_ms, .. } => *expiry_date_ms = value,
        }
    }

    pub fn publication_ttl_ms(&self) -> i64 {
        match *self {
            SubscriptionQos::OnChange {
                publication_ttl_ms, ..
            }
            | SubscriptionQos::OnChangeWithKeepAlive {
                publication_ttl_ms, ..
            }
            | SubscriptionQos::Multicast {
                publication_ttl_ms, ..
            } => publication_ttl_ms,
        }
    }

    /// Minimum spacing between publications; zero when not applicable.
    pub fn min_interval_ms(&self) -> i64 {
        match *self {
            SubscriptionQos::OnChange {
                min_interval_ms, ..
            }
            | SubscriptionQos::OnChangeWithKeepAlive {
                min_interval_ms, ..
            } => min_interval_ms,
            SubscriptionQos::Multicast { .. } => 0,
        }
    }

    /// Keep-alive interval, if this QoS carries one.
    pub fn max_interval_ms(&self) -> Option<i64> {
        match *self {
            SubscriptionQos::OnChangeWithKeepAlive {
                max_interval_ms, ..
            } => Some(max_interval_ms),
            _ => None,
        }
    }

    /// Validate the duration invariants.
    ///
    /// # Errors
    ///
    /// Returns [`JoynrError::Subscription`] on a negative duration or a
    /// keep-alive interval smaller than the min interval.
    pub fn validate(&self) -> Result<(), JoynrError> {
        if self.publication_ttl_ms() < 0 {
            return Err(JoynrError::Subscription(
                "publication TTL must be non-negative".into(),
            ));
        }
        if self.min_interval_ms() < 0 {
            return Err(JoynrError::Subscription(
                "min interval must be non-negative".into(),
            ));
        }
        if let SubscriptionQos::OnChangeWithKeepAlive {
            min_interval_ms,
            max_interval_ms,
            alert_after_interval_ms,
            ..
        } = *self
        {
            if max_interval_ms < min_interval_ms {
                return Err(JoynrError::Subscription(format!(
                    "max interval {max_interval_ms} below min interval {min_interval_ms}"
                )));
            }
            if alert_after_interval_ms < 0 {
                return Err(JoynrError::Subscription(
                    "alert-after interval must be non-negative".into(),
                ));
            }
        }
        Ok(())
    }
}

fn expiry_from_validity(validity_ms: i64) -> i64 {
    if validity_ms == NO_EXPIRY {
        NO_EXPIRY
    } else {
        now_ms().saturating_add(validity_ms)
    }
}
