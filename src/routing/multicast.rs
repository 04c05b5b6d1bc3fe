//! Multicast partition matching and the receiver directory.
//!
//! Multicast ids are `providerParticipantId/broadcastName[/partition...]`.
//! Subscription patterns may use `+` for exactly one partition and `*` for
//! one or more partitions in the final position. Publishing with wildcard
//! tokens is rejected.

use std::collections::{HashMap, HashSet};

use crate::error::JoynrError;

/// Single-partition wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Trailing one-or-more-partitions wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "*";

/// Whether `pattern` matches the `fired` partition list.
///
/// Every pattern token must match positionally: `+` matches any single
/// partition, `*` (legal only as last token) matches one or more remaining
/// partitions, anything else matches literally. An empty pattern matches
/// only an empty fire.
pub fn matches_partitions(pattern: &[String], fired: &[String]) -> bool {
    let mut fired_iter = fired.iter();
    for (position, token) in pattern.iter().enumerate() {
        if token == MULTI_LEVEL_WILDCARD {
            // Only valid as the final token; consumes one or more partitions.
            return position + 1 == pattern.len() && fired_iter.next().is_some();
        }
        match fired_iter.next() {
            None => return false,
            Some(partition) => {
                if token != SINGLE_LEVEL_WILDCARD && token != partition {
                    return false;
                }
            }
        }
    }
    fired_iter.next().is_none()
}

/// Reject wildcard tokens in a publish partition list.
///
/// # Errors
///
/// Returns [`JoynrError::InvalidArgument`] if any partition contains `+` or
/// `*`.
pub fn validate_fired_partitions(partitions: &[String]) -> Result<(), JoynrError> {
    for partition in partitions {
        if partition.contains('+') || partition.contains('*') {
            return Err(JoynrError::InvalidArgument(format!(
                "wildcard token '{partition}' is illegal in a multicast publish"
            )));
        }
    }
    Ok(())
}

/// Build a multicast id from its components.
pub fn multicast_id(provider_participant_id: &str, name: &str, partitions: &[String]) -> String {
    let mut id = format!("{provider_participant_id}/{name}");
    for partition in partitions {
        id.push('/');
        id.push_str(partition);
    }
    id
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    provider_participant_id: String,
    name: String,
    pattern: Vec<String>,
    subscriber_participant_id: String,
}

/// Directory of multicast subscriptions, queried on every fan-out.
#[derive(Debug, Default)]
pub struct MulticastReceiverDirectory {
    registrations: Vec<Registration>,
}

impl MulticastReceiverDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `(provider, name)` with a partition pattern.
    pub fn register(
        &mut self,
        provider_participant_id: &str,
        name: &str,
        pattern: Vec<String>,
        subscriber_participant_id: &str,
    ) {
        let registration = Registration {
            provider_participant_id: provider_participant_id.to_owned(),
            name: name.to_owned(),
            pattern,
            subscriber_participant_id: subscriber_participant_id.to_owned(),
        };
        if !self.registrations.contains(&registration) {
            self.registrations.push(registration);
        }
    }

    /// Remove one subscriber's registration.
    pub fn unregister(
        &mut self,
        provider_participant_id: &str,
        name: &str,
        pattern: &[String],
        subscriber_participant_id: &str,
    ) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| {
            !(r.provider_participant_id == provider_participant_id
                && r.name == name
                && r.pattern == pattern
                && r.subscriber_participant_id == subscriber_participant_id)
        });
        before != self.registrations.len()
    }

    /// Subscribers whose pattern matches a fire of `(provider, name)` with
    /// `fired` partitions.
    pub fn receivers(
        &self,
        provider_participant_id: &str,
        name: &str,
        fired: &[String],
    ) -> HashSet<String> {
        self.registrations
            .iter()
            .filter(|r| {
                r.provider_participant_id == provider_participant_id
                    && r.name == name
                    && matches_partitions(&r.pattern, fired)
            })
            .map(|r| r.subscriber_participant_id.clone())
            .collect()
    }

    /// All registrations grouped by subscriber, for persistence.
    pub fn snapshot(&self) -> HashMap<String, Vec<(String, String, Vec<String>)>> {
        let mut grouped: HashMap<String, Vec<(String, String, Vec<String>)>> = HashMap::new();
        for r in &self.registrations {
            grouped
                .entry(r.subscriber_participant_id.clone())
                .or_default()
                .push((
                    r.provider_participant_id.clone(),
                    r.name.clone(),
                    r.pattern.clone(),
                ));
        }
        grouped
    }
}
