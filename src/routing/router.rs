//! Message router: next-hop resolution, queueing, retries, multicast fan-out.
//!
//! The router never talks to a transport directly; a [`StubFactory`] turns a
//! resolved [`Address`] into a [`MessagingStub`] per send. Transient transmit
//! failures are rescheduled with exponential backoff until the message's TTL
//! is exhausted; messages without a known hop are parked in the bounded
//! [`MessageQueue`] and drained when the hop registers.
//!
//! Per-send failure callbacks travel with the message through the retry
//! chain, so each send observes at most one failure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::address::Address;
use crate::error::{FailureCallback, JoynrError};
use crate::message::{now_ms, ImmutableMessage, MessageType, NO_EXPIRY};
use crate::routing::message_queue::MessageQueue;
use crate::routing::multicast::MulticastReceiverDirectory;
use crate::routing::table::RoutingTable;
use crate::scheduler::DelayedScheduler;

/// One-way handoff of a message to a transport.
///
/// A successful handoff makes no callback; failures invoke `on_failure`
/// exactly once with a transient or terminal error.
pub trait MessagingStub: Send + Sync {
    fn transmit(&self, message: &Arc<ImmutableMessage>, on_failure: FailureCallback);
}

/// Creates transport stubs for resolved addresses.
pub trait StubFactory: Send + Sync {
    /// `None` when no transport is currently available for `address`.
    fn create(&self, address: &Address) -> Option<Arc<dyn MessagingStub>>;
}

/// Routes messages between participants.
pub struct MessageRouter {
    table: Mutex<RoutingTable>,
    queue: Mutex<MessageQueue>,
    multicast_receivers: Mutex<MulticastReceiverDirectory>,
    /// Failure callbacks of parked messages, keyed by message id.
    parked_callbacks: Mutex<std::collections::HashMap<String, FailureCallback>>,
    stub_factory: Arc<dyn StubFactory>,
    scheduler: Arc<DelayedScheduler>,
    retry_interval: Duration,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("known_hops", &self.table.lock().expect("table lock").len())
            .field("queued", &self.queue.lock().expect("queue lock").len())
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    pub fn new(
        stub_factory: Arc<dyn StubFactory>,
        scheduler: Arc<DelayedScheduler>,
        message_queue_limit: usize,
        retry_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(RoutingTable::new()),
            queue: Mutex::new(MessageQueue::new(message_queue_limit)),
            multicast_receivers: Mutex::new(MulticastReceiverDirectory::new()),
            parked_callbacks: Mutex::new(std::collections::HashMap::new()),
            stub_factory,
            scheduler,
            retry_interval,
        })
    }

    /// Route a message without a per-send failure callback.
    pub fn route(self: &Arc<Self>, message: Arc<ImmutableMessage>) {
        self.route_with_callback(message, None);
    }

    /// Route a message; `on_failure` fires at most once across every retry,
    /// eviction and TTL-expiry path.
    pub fn route_with_callback(
        self: &Arc<Self>,
        message: Arc<ImmutableMessage>,
        on_failure: Option<FailureCallback>,
    ) {
        if message.is_expired() {
            // Already dead at enqueue time: one deterministic failure signal.
            log::warn!(
                "[MessageRouter] message {} expired before routing",
                message.id()
            );
            if let Some(callback) = on_failure {
                callback(JoynrError::Expired(format!(
                    "message {} expired before routing",
                    message.id()
                )));
            }
            return;
        }

        if message.message_type() == MessageType::Multicast {
            self.fan_out_multicast(&message);
            return;
        }

        let recipient = message.recipient().to_owned();
        self.transmit_to(recipient, message, 0, on_failure);
    }

    /// Register the next hop for a participant and drain its parked messages.
    pub fn add_next_hop(
        self: &Arc<Self>,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
    ) {
        self.table
            .lock()
            .expect("table lock")
            .add(participant_id, address, is_globally_visible);
        log::debug!("[MessageRouter] next hop added for {participant_id}");
        self.drain_queued(participant_id);
    }

    /// Remove a participant's next hop.
    ///
    /// Messages already parked for the participant stay queued until their
    /// TTL expires.
    pub fn remove_next_hop(&self, participant_id: &str) {
        self.table.lock().expect("table lock").remove(participant_id);
    }

    /// Whether a next hop is known locally.
    pub fn resolve_next_hop(&self, participant_id: &str) -> bool {
        self.table.lock().expect("table lock").contains(participant_id)
    }

    /// Register a multicast subscriber.
    ///
    /// Bumps the subscriber's routing-entry refcount when the hop is already
    /// known, so shared addresses survive single unsubscribes.
    pub fn add_multicast_receiver(
        &self,
        provider_participant_id: &str,
        name: &str,
        partitions: Vec<String>,
        subscriber_participant_id: &str,
    ) {
        let mut table = self.table.lock().expect("table lock");
        if let Some(entry) = table.lookup(subscriber_participant_id).cloned() {
            table.add(
                subscriber_participant_id,
                entry.address,
                entry.is_globally_visible,
            );
        }
        drop(table);
        self.multicast_receivers
            .lock()
            .expect("multicast lock")
            .register(
                provider_participant_id,
                name,
                partitions,
                subscriber_participant_id,
            );
    }

    /// Remove a multicast subscriber registration.
    pub fn remove_multicast_receiver(
        &self,
        provider_participant_id: &str,
        name: &str,
        partitions: &[String],
        subscriber_participant_id: &str,
    ) {
        let removed = self
            .multicast_receivers
            .lock()
            .expect("multicast lock")
            .unregister(
                provider_participant_id,
                name,
                partitions,
                subscriber_participant_id,
            );
        if removed {
            self.table
                .lock()
                .expect("table lock")
                .remove(subscriber_participant_id);
        }
    }

    fn fan_out_multicast(self: &Arc<Self>, message: &Arc<ImmutableMessage>) {
        // Multicast id layout: provider/name[/partition...]
        let recipient = message.recipient();
        let mut segments = recipient.split('/');
        let (Some(provider), Some(name)) = (segments.next(), segments.next()) else {
            log::error!("[MessageRouter] malformed multicast id: {recipient}");
            return;
        };
        let partitions: Vec<String> = segments.map(str::to_owned).collect();

        let receivers = self
            .multicast_receivers
            .lock()
            .expect("multicast lock")
            .receivers(provider, name, &partitions);
        if receivers.is_empty() {
            log::debug!("[MessageRouter] no receivers for multicast {recipient}");
            return;
        }
        for receiver in receivers {
            // One copy per subscriber; the payload is shared by reference.
            self.transmit_to(receiver, Arc::clone(message), 0, None);
        }
    }

    /// Resolve `route_to` and hand the message to its transport, parking or
    /// retrying as needed. `route_to` is the recipient participant for
    /// unicast and the subscriber participant for multicast fan-out.
    fn transmit_to(
        self: &Arc<Self>,
        route_to: String,
        message: Arc<ImmutableMessage>,
        retry_count: u32,
        on_failure: Option<FailureCallback>,
    ) {
        let entry = self
            .table
            .lock()
            .expect("table lock")
            .lookup(&route_to)
            .cloned();
        let Some(entry) = entry else {
            self.park(route_to, message, on_failure);
            return;
        };

        let Some(stub) = self.stub_factory.create(&entry.address) else {
            // Transport not ready; same treatment as a transient failure.
            log::debug!(
                "[MessageRouter] no stub for {}, rescheduling message {}",
                entry.address,
                message.id()
            );
            self.schedule_retry(route_to, message, retry_count + 1, on_failure);
            return;
        };

        let router = Arc::clone(self);
        let retry_message = Arc::clone(&message);
        stub.transmit(
            &message,
            Box::new(move |error| {
                if error.is_transient() {
                    router.schedule_retry(
                        route_to,
                        retry_message,
                        retry_count + 1,
                        on_failure,
                    );
                } else {
                    log::error!(
                        "[MessageRouter] permanent send failure for message {}: {error}",
                        retry_message.id()
                    );
                    if let Some(callback) = on_failure {
                        callback(error);
                    }
                }
            }),
        );
    }

    fn schedule_retry(
        self: &Arc<Self>,
        route_to: String,
        message: Arc<ImmutableMessage>,
        retry_count: u32,
        on_failure: Option<FailureCallback>,
    ) {
        let now = now_ms();
        let remaining = message.remaining_ttl_ms(now);
        if remaining <= 0 {
            if let Some(callback) = on_failure {
                callback(JoynrError::Expired(format!(
                    "message {} expired after {retry_count} send attempts",
                    message.id()
                )));
            }
            return;
        }

        // Exponential backoff, capped by the remaining TTL.
        let exponent = retry_count.saturating_sub(1).min(16);
        let backoff_ms = self
            .retry_interval
            .as_millis()
            .saturating_mul(1u128 << exponent) as u64;
        let delay_ms = if remaining == NO_EXPIRY {
            backoff_ms
        } else {
            backoff_ms.min(remaining as u64)
        };
        log::debug!(
            "[MessageRouter] retry {retry_count} for message {} in {delay_ms}ms",
            message.id()
        );

        let router = Arc::clone(self);
        self.scheduler.schedule(
            Box::new(move || {
                router.transmit_to(route_to, message, retry_count, on_failure);
            }),
            Duration::from_millis(delay_ms),
        );
    }

    fn park(
        self: &Arc<Self>,
        route_to: String,
        message: Arc<ImmutableMessage>,
        on_failure: Option<FailureCallback>,
    ) {
        log::debug!(
            "[MessageRouter] no next hop for {route_to}, queueing message {}",
            message.id()
        );
        let message_id = message.id().to_owned();
        let expiry = message.expiry_date_ms();

        let evicted = self
            .queue
            .lock()
            .expect("queue lock")
            .queue_message(&route_to, Arc::clone(&message));
        if let Some(callback) = on_failure {
            self.parked_callbacks
                .lock()
                .expect("callbacks lock")
                .insert(message_id.clone(), callback);
        }
        if let Some(evicted) = evicted {
            self.fail_parked(
                evicted.id(),
                JoynrError::DelayMessage("message queue limit reached".into()),
            );
        }

        // Watcher drops the message and reports the failure when the TTL
        // runs out while still parked.
        if expiry != NO_EXPIRY {
            let delay = Duration::from_millis(message.remaining_ttl_ms(now_ms()).max(0) as u64);
            let router = Arc::clone(self);
            self.scheduler.schedule(
                Box::new(move || {
                    let still_parked = router
                        .queue
                        .lock()
                        .expect("queue lock")
                        .remove_message(&route_to, &message_id)
                        .is_some();
                    if still_parked {
                        router.fail_parked(
                            &message_id,
                            JoynrError::Expired(format!(
                                "message {message_id} expired while waiting for a next hop"
                            )),
                        );
                    }
                }),
                delay,
            );
        }
    }

    fn fail_parked(&self, message_id: &str, error: JoynrError) {
        let callback = self
            .parked_callbacks
            .lock()
            .expect("callbacks lock")
            .remove(message_id);
        if let Some(callback) = callback {
            callback(error);
        } else {
            log::debug!("[MessageRouter] dropped message {message_id}: {error}");
        }
    }

    fn drain_queued(self: &Arc<Self>, participant_id: &str) {
        loop {
            let next = self
                .queue
                .lock()
                .expect("queue lock")
                .get_next_message_for(participant_id);
            let Some(message) = next else { break };
            let callback = self
                .parked_callbacks
                .lock()
                .expect("callbacks lock")
                .remove(message.id());
            self.transmit_to(participant_id.to_owned(), message, 0, callback);
        }
    }
}
