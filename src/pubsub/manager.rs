//! Publication manager: drives every active publication on this process.
//!
//! Each subscription runs a small state machine
//! (`PENDING_REGISTRATION → ACTIVE → STOPPED | EXPIRED`). Attribute
//! subscriptions emit an initial publication synchronously, rate-limit
//! changes by `min_interval_ms` (coalescing to the latest value), keep alive
//! via `max_interval_ms`, and end at the (uplifted) expiry date. Selective
//! broadcasts run their filter chain per fire; multicasts fan out by
//! partition match.
//!
//! TTL uplift: the process-wide `ttl_uplift_ms` is added, saturating, to
//! every publication TTL, to the subscription reply TTL and to the validity
//! window. [`NO_EXPIRY`] is a fixed point of the uplift.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::filters::{BroadcastFilter, BroadcastFilterChain};
use super::qos::SubscriptionQos;
use super::requests::{
    BroadcastSubscriptionRequest, MulticastSubscriptionRequest, SubscriptionPublication,
    SubscriptionReply, SubscriptionRequest,
};
use super::store::{SubscriptionKind, SubscriptionRecord, SubscriptionStore};
use crate::error::JoynrError;
use crate::message::{now_ms, uplift_expiry, NO_EXPIRY};
use crate::persistence::KeyValueStore;
use crate::routing::multicast::{matches_partitions, validate_fired_partitions};
use crate::scheduler::{DelayedScheduler, DelayedTaskId};

/// Outbound path for publications and subscription replies.
///
/// `ttl_ms` is relative; [`NO_EXPIRY`] means the message never expires.
pub trait PublicationSender: Send + Sync {
    fn send_subscription_publication(
        &self,
        from_participant_id: &str,
        to_participant_id: &str,
        ttl_ms: i64,
        publication: SubscriptionPublication,
    );

    fn send_subscription_reply(
        &self,
        from_participant_id: &str,
        to_participant_id: &str,
        ttl_ms: i64,
        reply: SubscriptionReply,
    );
}

/// Provider-side attribute access for initial and keep-alive publications.
pub trait RequestCaller: Send + Sync {
    fn get_attribute(&self, name: &str) -> Result<Value, JoynrError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    PendingRegistration,
    Active,
    Stopped,
    Expired,
}

struct Publication {
    record: SubscriptionRecord,
    state: SubscriptionState,
    sender: Arc<dyn PublicationSender>,
    caller: Option<Arc<dyn RequestCaller>>,
    last_publication_ms: i64,
    /// Latest coalesced value waiting for the min interval to elapse.
    pending_value: Option<Value>,
    deferred_task: Option<DelayedTaskId>,
    max_interval_task: Option<DelayedTaskId>,
    end_of_validity_task: Option<DelayedTaskId>,
}

/// Owns the lifecycle of every active publication producer on this process.
pub struct PublicationManager {
    publications: Mutex<HashMap<String, Arc<Mutex<Publication>>>>,
    store: Mutex<SubscriptionStore>,
    filters: Mutex<HashMap<String, BroadcastFilterChain>>,
    scheduler: Arc<DelayedScheduler>,
    ttl_uplift_ms: i64,
}

impl std::fmt::Debug for PublicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicationManager")
            .field(
                "active",
                &self.publications.lock().expect("publications lock").len(),
            )
            .field("ttl_uplift_ms", &self.ttl_uplift_ms)
            .finish()
    }
}

impl PublicationManager {
    pub fn new(
        scheduler: Arc<DelayedScheduler>,
        ttl_uplift_ms: i64,
        persistence: Option<Arc<dyn KeyValueStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            publications: Mutex::new(HashMap::new()),
            store: Mutex::new(SubscriptionStore::new(persistence)),
            filters: Mutex::new(HashMap::new()),
            scheduler,
            ttl_uplift_ms,
        })
    }

    /// Register a filter for a selective broadcast; filters run in
    /// registration order.
    pub fn add_broadcast_filter(&self, broadcast_name: &str, filter: Arc<dyn BroadcastFilter>) {
        self.filters
            .lock()
            .expect("filters lock")
            .entry(broadcast_name.to_owned())
            .or_default()
            .push(filter);
    }

    /// Whether a subscription is currently active.
    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        self.publications
            .lock()
            .expect("publications lock")
            .contains_key(subscription_id)
    }

    // ── Subscription add ────────────────────────────────────────────────────

    /// Add (or update) an attribute subscription.
    ///
    /// On success the reply goes out once, the initial publication is emitted
    /// synchronously, and the keep-alive and end-of-validity timers are
    /// armed. Validation failures answer with an error reply and schedule
    /// nothing.
    pub fn add_attribute_subscription(
        self: &Arc<Self>,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        caller: Arc<dyn RequestCaller>,
        request: SubscriptionRequest,
        sender: Arc<dyn PublicationSender>,
    ) {
        let subscription_id = request.subscription_id.clone();
        let reply_ttl = self.reply_ttl_ms(request.qos.expiry_date_ms());

        let initial_value = self
            .validate(&request.qos)
            .and_then(|()| caller.get_attribute(&request.subscribe_to_name));
        let initial_value = match initial_value {
            Err(error) => {
                log::warn!(
                    "[PublicationManager] rejecting subscription {subscription_id}: {error}"
                );
                sender.send_subscription_reply(
                    provider_participant_id,
                    proxy_participant_id,
                    reply_ttl,
                    SubscriptionReply::failure(&subscription_id, error.to_string()),
                );
                return;
            }
            Ok(value) => value,
        };

        let record = SubscriptionRecord {
            subscription_id: subscription_id.clone(),
            kind: SubscriptionKind::Attribute,
            subscriber_participant_id: proxy_participant_id.to_owned(),
            provider_participant_id: provider_participant_id.to_owned(),
            name: request.subscribe_to_name.clone(),
            qos: request.qos.clone(),
            filter_parameters: HashMap::new(),
            partitions: Vec::new(),
        };
        let publication = self.activate(record, sender, Some(caller), reply_ttl);

        // Initial publication, synchronously on the add path.
        self.emit(&publication, initial_value);
    }

    /// Add (or update) a selective-broadcast subscription.
    pub fn add_broadcast_subscription(
        self: &Arc<Self>,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: BroadcastSubscriptionRequest,
        sender: Arc<dyn PublicationSender>,
    ) {
        let subscription_id = request.subscription_id.clone();
        let reply_ttl = self.reply_ttl_ms(request.qos.expiry_date_ms());
        if let Err(error) = self.validate(&request.qos) {
            log::warn!("[PublicationManager] rejecting subscription {subscription_id}: {error}");
            sender.send_subscription_reply(
                provider_participant_id,
                proxy_participant_id,
                reply_ttl,
                SubscriptionReply::failure(&subscription_id, error.to_string()),
            );
            return;
        }
        let record = SubscriptionRecord {
            subscription_id,
            kind: SubscriptionKind::SelectiveBroadcast,
            subscriber_participant_id: proxy_participant_id.to_owned(),
            provider_participant_id: provider_participant_id.to_owned(),
            name: request.subscribe_to_name.clone(),
            qos: request.qos.clone(),
            filter_parameters: request.filter_parameters.clone(),
            partitions: Vec::new(),
        };
        self.activate(record, sender, None, reply_ttl);
    }

    /// Add (or update) a multicast subscription.
    pub fn add_multicast_subscription(
        self: &Arc<Self>,
        proxy_participant_id: &str,
        provider_participant_id: &str,
        request: MulticastSubscriptionRequest,
        sender: Arc<dyn PublicationSender>,
    ) {
        let subscription_id = request.subscription_id.clone();
        let reply_ttl = self.reply_ttl_ms(request.qos.expiry_date_ms());
        if let Err(error) = self.validate(&request.qos) {
            log::warn!("[PublicationManager] rejecting subscription {subscription_id}: {error}");
            sender.send_subscription_reply(
                provider_participant_id,
                proxy_participant_id,
                reply_ttl,
                SubscriptionReply::failure(&subscription_id, error.to_string()),
            );
            return;
        }
        let record = SubscriptionRecord {
            subscription_id,
            kind: SubscriptionKind::Multicast,
            subscriber_participant_id: proxy_participant_id.to_owned(),
            provider_participant_id: provider_participant_id.to_owned(),
            name: request.subscribe_to_name.clone(),
            qos: request.qos.clone(),
            filter_parameters: HashMap::new(),
            partitions: request.partitions.clone(),
        };
        self.activate(record, sender, None, reply_ttl);
    }

    // ── Provider-side fires ─────────────────────────────────────────────────

    /// An attribute changed on the provider.
    ///
    /// Emits immediately when the min interval has elapsed; otherwise the
    /// value is parked (latest wins) and a deferred emit fires at
    /// `last publication + min interval`.
    pub fn attribute_value_changed(self: &Arc<Self>, subscription_id: &str, value: Value) {
        let Some(publication) = self.publication(subscription_id) else {
            log::warn!(
                "[PublicationManager] attribute change for unknown subscription {subscription_id}"
            );
            return;
        };
        let mut guard = publication.lock().expect("publication lock");
        if guard.state != SubscriptionState::Active {
            return;
        }
        let min_interval = guard.record.qos.min_interval_ms();
        let elapsed = now_ms() - guard.last_publication_ms;
        if elapsed >= min_interval {
            drop(guard);
            self.emit(&publication, value);
            return;
        }
        guard.pending_value = Some(value);
        if guard.deferred_task.is_none() {
            let delay = (min_interval - elapsed).max(0);
            let manager = Arc::clone(self);
            let id = subscription_id.to_owned();
            guard.deferred_task = Some(self.scheduler.schedule(
                Box::new(move || manager.deferred_fire(&id)),
                Duration::from_millis(delay as u64),
            ));
        }
    }

    /// A selective broadcast fired on the provider.
    ///
    /// The registered filter chain for the broadcast runs against the payload
    /// and the subscription's captured filter parameters; fires inside the
    /// min interval are dropped, not coalesced.
    pub fn broadcast_occurred(self: &Arc<Self>, subscription_id: &str, payload: Value) {
        let Some(publication) = self.publication(subscription_id) else {
            log::warn!(
                "[PublicationManager] broadcast for unknown subscription {subscription_id}"
            );
            return;
        };
        let (name, filter_parameters) = {
            let guard = publication.lock().expect("publication lock");
            if guard.state != SubscriptionState::Active {
                return;
            }
            (guard.record.name.clone(), guard.record.filter_parameters.clone())
        };

        // Filters are user code; run them without any internal lock held.
        let chain = self
            .filters
            .lock()
            .expect("filters lock")
            .get(&name)
            .cloned()
            .unwrap_or_default();
        if !chain.passes(&payload, &filter_parameters) {
            log::debug!(
                "[PublicationManager] publication for {subscription_id} dropped by filter chain"
            );
            return;
        }

        {
            let guard = publication.lock().expect("publication lock");
            if guard.state != SubscriptionState::Active {
                return;
            }
            let elapsed = now_ms() - guard.last_publication_ms;
            if elapsed < guard.record.qos.min_interval_ms() {
                log::debug!(
                    "[PublicationManager] broadcast for {subscription_id} inside min interval, dropped"
                );
                return;
            }
        }
        self.emit(&publication, payload);
    }

    /// A multicast fired on the provider.
    ///
    /// # Errors
    ///
    /// Returns [`JoynrError::InvalidArgument`] when a fired partition
    /// contains a wildcard token.
    pub fn multicast_occurred(
        self: &Arc<Self>,
        provider_participant_id: &str,
        name: &str,
        partitions: &[String],
        payload: &Value,
    ) -> Result<(), JoynrError> {
        validate_fired_partitions(partitions)?;
        let ids = self
            .store
            .lock()
            .expect("store lock")
            .ids_for_provider_event(provider_participant_id, name);
        for subscription_id in ids {
            let Some(publication) = self.publication(&subscription_id) else {
                continue;
            };
            let matched = {
                let guard = publication.lock().expect("publication lock");
                guard.state == SubscriptionState::Active
                    && guard.record.kind == SubscriptionKind::Multicast
                    && matches_partitions(&guard.record.partitions, partitions)
            };
            if matched {
                self.emit(&publication, payload.clone());
            }
        }
        Ok(())
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Consumer-initiated stop.
    pub fn stop_subscription(&self, subscription_id: &str) {
        self.terminate(subscription_id, SubscriptionState::Stopped);
    }

    /// Cascaded removal when a provider unregisters.
    pub fn remove_all_subscriptions(&self, provider_participant_id: &str) {
        let ids = self
            .store
            .lock()
            .expect("store lock")
            .ids_for_provider(provider_participant_id);
        for subscription_id in ids {
            self.terminate(&subscription_id, SubscriptionState::Stopped);
        }
    }

    /// Stop every subscription; used on runtime shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self
            .publications
            .lock()
            .expect("publications lock")
            .keys()
            .cloned()
            .collect();
        for subscription_id in ids {
            self.terminate(&subscription_id, SubscriptionState::Stopped);
        }
    }

    // ── Internal ────────────────────────────────────────────────────────────

    fn validate(&self, qos: &SubscriptionQos) -> Result<(), JoynrError> {
        qos.validate()?;
        let expiry = qos.expiry_date_ms();
        if expiry != NO_EXPIRY && expiry <= now_ms() {
            return Err(JoynrError::Subscription(
                "subscription already expired".into(),
            ));
        }
        Ok(())
    }

    /// Messaging TTL for the subscription reply: the (uplifted) remaining
    /// validity, or [`NO_EXPIRY`] for a never-expiring subscription.
    fn reply_ttl_ms(&self, expiry_date_ms: i64) -> i64 {
        if expiry_date_ms == NO_EXPIRY {
            return NO_EXPIRY;
        }
        (uplift_expiry(expiry_date_ms, self.ttl_uplift_ms) - now_ms()).max(0)
    }

    /// Messaging TTL for a publication: the QoS publication TTL plus the
    /// process uplift, saturating.
    fn publication_ttl_ms(&self, qos: &SubscriptionQos) -> i64 {
        uplift_expiry(qos.publication_ttl_ms(), self.ttl_uplift_ms)
    }

    /// Create (or replace) the runtime state for a validated record, send
    /// the reply, and arm the end-of-validity timer.
    fn activate(
        self: &Arc<Self>,
        record: SubscriptionRecord,
        sender: Arc<dyn PublicationSender>,
        caller: Option<Arc<dyn RequestCaller>>,
        reply_ttl: i64,
    ) -> Arc<Mutex<Publication>> {
        let subscription_id = record.subscription_id.clone();

        // Re-registration under an existing id: tear the old state down
        // first; the id survives, timers and QoS start fresh.
        if self.has_subscription(&subscription_id) {
            log::info!(
                "[PublicationManager] updating existing subscription {subscription_id}"
            );
            self.terminate(&subscription_id, SubscriptionState::Stopped);
        }

        let expiry_date_ms = record.qos.expiry_date_ms();
        let provider = record.provider_participant_id.clone();
        let proxy = record.subscriber_participant_id.clone();
        self.store.lock().expect("store lock").insert(record.clone());

        let publication = Arc::new(Mutex::new(Publication {
            record,
            state: SubscriptionState::PendingRegistration,
            sender: Arc::clone(&sender),
            caller,
            last_publication_ms: 0,
            pending_value: None,
            deferred_task: None,
            max_interval_task: None,
            end_of_validity_task: None,
        }));
        self.publications
            .lock()
            .expect("publications lock")
            .insert(subscription_id.clone(), Arc::clone(&publication));

        sender.send_subscription_reply(
            &provider,
            &proxy,
            reply_ttl,
            SubscriptionReply::success(&subscription_id),
        );

        let mut guard = publication.lock().expect("publication lock");
        guard.state = SubscriptionState::Active;
        if expiry_date_ms != NO_EXPIRY {
            let uplifted = uplift_expiry(expiry_date_ms, self.ttl_uplift_ms);
            let delay = (uplifted - now_ms()).max(0);
            let manager = Arc::clone(self);
            let id = subscription_id.clone();
            guard.end_of_validity_task = Some(self.scheduler.schedule(
                Box::new(move || manager.expire(&id)),
                Duration::from_millis(delay as u64),
            ));
        }
        drop(guard);
        publication
    }

    fn publication(&self, subscription_id: &str) -> Option<Arc<Mutex<Publication>>> {
        self.publications
            .lock()
            .expect("publications lock")
            .get(subscription_id)
            .cloned()
    }

    /// Send one publication and restart the keep-alive clock.
    ///
    /// Bookkeeping happens under the publication lock; the send itself runs
    /// with no internal lock held, so a synchronous local delivery may
    /// re-enter the manager.
    fn emit(self: &Arc<Self>, publication: &Arc<Mutex<Publication>>, value: Value) {
        let (sender, from, to, ttl, outbound) = {
            let mut guard = publication.lock().expect("publication lock");
            if guard.state != SubscriptionState::Active {
                return;
            }
            let ttl = self.publication_ttl_ms(&guard.record.qos);
            guard.last_publication_ms = now_ms();
            guard.pending_value = None;
            self.reschedule_max_interval(&mut guard);
            (
                Arc::clone(&guard.sender),
                guard.record.provider_participant_id.clone(),
                guard.record.subscriber_participant_id.clone(),
                ttl,
                SubscriptionPublication::value(&guard.record.subscription_id, value),
            )
        };
        sender.send_subscription_publication(&from, &to, ttl, outbound);
    }

    fn reschedule_max_interval(self: &Arc<Self>, publication: &mut Publication) {
        if let Some(task) = publication.max_interval_task.take() {
            self.scheduler.unschedule(task);
        }
        let Some(max_interval) = publication.record.qos.max_interval_ms() else {
            return;
        };
        let manager = Arc::clone(self);
        let id = publication.record.subscription_id.clone();
        publication.max_interval_task = Some(self.scheduler.schedule(
            Box::new(move || manager.keep_alive_fire(&id)),
            Duration::from_millis(max_interval.max(0) as u64),
        ));
    }

    /// Max-interval timer fired: publish the current value even without a
    /// change.
    fn keep_alive_fire(self: &Arc<Self>, subscription_id: &str) {
        let Some(publication) = self.publication(subscription_id) else {
            return;
        };
        let (caller, name) = {
            let guard = publication.lock().expect("publication lock");
            if guard.state != SubscriptionState::Active {
                return;
            }
            (guard.caller.clone(), guard.record.name.clone())
        };
        let Some(caller) = caller else { return };
        // The getter is user code; call it without the publication lock.
        match caller.get_attribute(&name) {
            Ok(value) => self.emit(&publication, value),
            Err(error) => {
                log::error!(
                    "[PublicationManager] keep-alive read for {subscription_id} failed: {error}"
                );
                let mut guard = publication.lock().expect("publication lock");
                self.reschedule_max_interval(&mut guard);
            }
        }
    }

    /// Deferred min-interval emit: publish the latest parked value.
    fn deferred_fire(self: &Arc<Self>, subscription_id: &str) {
        let Some(publication) = self.publication(subscription_id) else {
            return;
        };
        let pending = {
            let mut guard = publication.lock().expect("publication lock");
            guard.deferred_task = None;
            if guard.state != SubscriptionState::Active {
                return;
            }
            guard.pending_value.take()
        };
        if let Some(value) = pending {
            self.emit(&publication, value);
        }
    }

    fn expire(&self, subscription_id: &str) {
        log::info!("[PublicationManager] subscription {subscription_id} expired");
        self.terminate(subscription_id, SubscriptionState::Expired);
    }

    /// Move a subscription into a terminal state: cancel timers, drop state,
    /// remove the stored record.
    fn terminate(&self, subscription_id: &str, terminal_state: SubscriptionState) {
        let publication = self
            .publications
            .lock()
            .expect("publications lock")
            .remove(subscription_id);
        let Some(publication) = publication else {
            return;
        };
        {
            let mut guard = publication.lock().expect("publication lock");
            guard.state = terminal_state;
            guard.pending_value = None;
            for task in [
                guard.deferred_task.take(),
                guard.max_interval_task.take(),
                guard.end_of_validity_task.take(),
            ]
            .into_iter()
            .flatten()
            {
                self.scheduler.unschedule(task);
            }
        }
        self.store.lock().expect("store lock").remove(subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Records every reply and publication with its TTL and timestamp.
    #[derive(Default)]
    struct MockSender {
        replies: Mutex<Vec<(String, i64, SubscriptionReply)>>,
        publications: Mutex<Vec<(String, i64, SubscriptionPublication, i64)>>,
    }

    impl PublicationSender for MockSender {
        fn send_subscription_publication(
            &self,
            _from: &str,
            to: &str,
            ttl_ms: i64,
            publication: SubscriptionPublication,
        ) {
            self.publications.lock().unwrap().push((
                to.to_owned(),
                ttl_ms,
                publication,
                now_ms(),
            ));
        }

        fn send_subscription_reply(
            &self,
            _from: &str,
            to: &str,
            ttl_ms: i64,
            reply: SubscriptionReply,
        ) {
            self.replies
                .lock()
                .unwrap()
                .push((to.to_owned(), ttl_ms, reply));
        }
    }

    impl MockSender {
        fn publication_count(&self) -> usize {
            self.publications.lock().unwrap().len()
        }

        fn wait_for_publications(&self, count: usize, timeout: Duration) -> bool {
            let deadline = std::time::Instant::now() + timeout;
            while std::time::Instant::now() < deadline {
                if self.publication_count() >= count {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            self.publication_count() >= count
        }
    }

    struct FixedCaller {
        value: AtomicI64,
    }

    impl FixedCaller {
        fn new(value: i64) -> Arc<Self> {
            Arc::new(Self {
                value: AtomicI64::new(value),
            })
        }
    }

    impl RequestCaller for FixedCaller {
        fn get_attribute(&self, _name: &str) -> Result<Value, JoynrError> {
            Ok(Value::from(self.value.load(Ordering::SeqCst)))
        }
    }

    struct FailingCaller;
    impl RequestCaller for FailingCaller {
        fn get_attribute(&self, name: &str) -> Result<Value, JoynrError> {
            Err(JoynrError::Subscription(format!("unknown attribute {name}")))
        }
    }

    fn manager_with_uplift(uplift: i64) -> Arc<PublicationManager> {
        let scheduler = Arc::new(DelayedScheduler::single_threaded(Duration::from_millis(5)));
        PublicationManager::new(scheduler, uplift, None)
    }

    #[test]
    fn test_add_sends_reply_once_and_initial_publication() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request =
            SubscriptionRequest::new("location", SubscriptionQos::on_change(10_000, 1_000, 0));
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(7),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );

        let replies = sender.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].2, SubscriptionReply::success(&subscription_id));
        drop(replies);

        let publications = sender.publications.lock().unwrap();
        assert_eq!(publications.len(), 1, "initial publication is synchronous");
        assert_eq!(publications[0].2.response, Some(Value::from(7)));
        assert!(manager.has_subscription(&subscription_id));
        manager.shutdown();
    }

    #[test]
    fn test_validation_error_sends_error_reply_and_no_state() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request =
            SubscriptionRequest::new("location", SubscriptionQos::on_change(10_000, -1, 0));
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(1),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );

        let replies = sender.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].2.error.is_some());
        assert_eq!(sender.publication_count(), 0);
        assert!(!manager.has_subscription(&subscription_id));
        manager.shutdown();
    }

    #[test]
    fn test_unknown_attribute_rejected_via_getter() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request =
            SubscriptionRequest::new("bogus", SubscriptionQos::on_change(10_000, 1_000, 0));

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            Arc::new(FailingCaller),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        assert!(sender.replies.lock().unwrap()[0].2.error.is_some());
        manager.shutdown();
    }

    #[test]
    fn test_min_interval_coalesces_to_latest_value() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request = SubscriptionRequest::new(
            "location",
            SubscriptionQos::on_change_with_keep_alive(60_000, 1_000, 200, 2_000, 0),
        );
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        assert_eq!(sender.publication_count(), 1); // initial

        // Two changes inside the min interval: no emit yet, latest wins.
        std::thread::sleep(Duration::from_millis(50));
        manager.attribute_value_changed(&subscription_id, Value::from(1));
        std::thread::sleep(Duration::from_millis(100));
        manager.attribute_value_changed(&subscription_id, Value::from(2));
        assert_eq!(sender.publication_count(), 1, "still inside min interval");

        assert!(sender.wait_for_publications(2, Duration::from_secs(1)));
        let publications = sender.publications.lock().unwrap();
        assert_eq!(publications[1].2.response, Some(Value::from(2)));
        // The deferred emit lands at roughly initial + min interval.
        let spacing = publications[1].3 - publications[0].3;
        assert!(
            (150..=400).contains(&spacing),
            "deferred emit spacing was {spacing}ms"
        );
        manager.shutdown();
    }

    #[test]
    fn test_change_after_min_interval_emits_immediately() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request =
            SubscriptionRequest::new("location", SubscriptionQos::on_change(60_000, 1_000, 20));
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        std::thread::sleep(Duration::from_millis(40));
        manager.attribute_value_changed(&subscription_id, Value::from(5));
        assert_eq!(sender.publication_count(), 2);
        manager.shutdown();
    }

    #[test]
    fn test_keep_alive_publishes_without_change() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request = SubscriptionRequest::new(
            "location",
            SubscriptionQos::on_change_with_keep_alive(60_000, 1_000, 0, 60, 0),
        );

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(3),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        assert!(
            sender.wait_for_publications(3, Duration::from_secs(2)),
            "keep-alive publications missing"
        );
        manager.shutdown();
    }

    #[test]
    fn test_subscription_expires_at_end_of_validity() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request =
            SubscriptionRequest::new("location", SubscriptionQos::on_change(100, 1_000, 0));
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        assert!(manager.has_subscription(&subscription_id));

        std::thread::sleep(Duration::from_millis(250));
        assert!(!manager.has_subscription(&subscription_id));

        // Fires after expiry do nothing.
        manager.attribute_value_changed(&subscription_id, Value::from(1));
        assert_eq!(sender.publication_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_ttl_uplift_extends_validity_window() {
        let uplift = 300;
        let manager = manager_with_uplift(uplift);
        let sender = Arc::new(MockSender::default());
        let request =
            SubscriptionRequest::new("location", SubscriptionQos::on_change(150, 1_000, 0));
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );

        // Past the unlifted validity but inside the uplift window.
        std::thread::sleep(Duration::from_millis(250));
        manager.attribute_value_changed(&subscription_id, Value::from(1));
        assert_eq!(sender.publication_count(), 2, "uplift window still active");

        // Past validity + uplift.
        std::thread::sleep(Duration::from_millis(350));
        manager.attribute_value_changed(&subscription_id, Value::from(2));
        assert_eq!(sender.publication_count(), 2);
        manager.shutdown();
    }

    #[test]
    fn test_ttl_uplift_applies_to_reply_and_publication_ttls() {
        let uplift = 300;
        let validity = 300;
        let publication_ttl = 1_024;
        let manager = manager_with_uplift(uplift);
        let sender = Arc::new(MockSender::default());
        let request = SubscriptionRequest::new(
            "location",
            SubscriptionQos::on_change(validity, publication_ttl, 0),
        );

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );

        let reply_ttl = sender.replies.lock().unwrap()[0].1;
        let expected_reply_ttl = validity + uplift;
        assert!(
            (expected_reply_ttl - 60..=expected_reply_ttl).contains(&reply_ttl),
            "reply TTL {reply_ttl} not within tolerance of {expected_reply_ttl}"
        );

        let publication_ttl_seen = sender.publications.lock().unwrap()[0].1;
        assert_eq!(publication_ttl_seen, publication_ttl + uplift);
        manager.shutdown();
    }

    #[test]
    fn test_no_expiry_is_fixed_point_of_uplift() {
        let manager = manager_with_uplift(300);
        let sender = Arc::new(MockSender::default());
        let request = SubscriptionRequest::new(
            "location",
            SubscriptionQos::on_change(NO_EXPIRY, 1_000, 0),
        );
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        assert_eq!(sender.replies.lock().unwrap()[0].1, NO_EXPIRY);
        assert!(manager.has_subscription(&subscription_id));
        manager.shutdown();
    }

    #[test]
    fn test_large_expiry_saturates_instead_of_overflowing() {
        let manager = manager_with_uplift(300);
        let sender = Arc::new(MockSender::default());
        let mut qos = SubscriptionQos::on_change(1_000, 1_000, 0);
        qos.set_expiry_date_ms(i64::MAX - 100);
        let request = SubscriptionRequest::new("location", qos);

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        let reply_ttl = sender.replies.lock().unwrap()[0].1;
        assert!(reply_ttl > 0, "saturating arithmetic must not wrap");
        manager.shutdown();
    }

    #[test]
    fn test_broadcast_filter_chain_short_circuits() {
        struct AcceptIf {
            key: &'static str,
        }
        impl BroadcastFilter for AcceptIf {
            fn filter(&self, payload: &Value, params: &HashMap<String, String>) -> bool {
                params
                    .get(self.key)
                    .is_some_and(|want| payload[self.key] == want.as_str())
            }
        }

        let manager = manager_with_uplift(0);
        manager.add_broadcast_filter("locationUpdated", Arc::new(AcceptIf { key: "country" }));
        let sender = Arc::new(MockSender::default());

        let mut request = BroadcastSubscriptionRequest::new(
            "locationUpdated",
            SubscriptionQos::on_change(60_000, 1_000, 0),
        );
        request
            .filter_parameters
            .insert("country".into(), "de".into());
        let subscription_id = request.subscription_id.clone();

        manager.add_broadcast_subscription(
            "proxy",
            "provider",
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        assert_eq!(sender.publication_count(), 0, "broadcasts have no initial publication");

        manager.broadcast_occurred(&subscription_id, serde_json::json!({"country": "de"}));
        assert_eq!(sender.publication_count(), 1);

        manager.broadcast_occurred(&subscription_id, serde_json::json!({"country": "fr"}));
        assert_eq!(sender.publication_count(), 1, "filtered out");
        manager.shutdown();
    }

    #[test]
    fn test_multicast_partition_matching() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request = MulticastSubscriptionRequest {
            subscription_id: "sub-mc".into(),
            subscribe_to_name: "positionChanged".into(),
            multicast_id: "provider/positionChanged/partition0/+/partition2".into(),
            partitions: vec!["partition0".into(), "+".into(), "partition2".into()],
            qos: SubscriptionQos::multicast(60_000, 1_000),
        };
        manager.add_multicast_subscription(
            "proxy",
            "provider",
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );

        let fired: Vec<String> = ["partition0", "partition1", "partition2"]
            .iter()
            .map(|&p| p.to_owned())
            .collect();
        manager
            .multicast_occurred("provider", "positionChanged", &fired, &serde_json::json!(1))
            .unwrap();
        assert_eq!(sender.publication_count(), 1);

        let miss: Vec<String> = ["partition0", "partition1", "partitionX"]
            .iter()
            .map(|&p| p.to_owned())
            .collect();
        manager
            .multicast_occurred("provider", "positionChanged", &miss, &serde_json::json!(2))
            .unwrap();
        assert_eq!(sender.publication_count(), 1);
        manager.shutdown();
    }

    #[test]
    fn test_multicast_publish_with_wildcard_rejected() {
        let manager = manager_with_uplift(0);
        let fired = vec!["partition0".to_owned(), "+".to_owned()];
        let result =
            manager.multicast_occurred("provider", "event", &fired, &serde_json::json!(1));
        assert!(matches!(result, Err(JoynrError::InvalidArgument(_))));
        manager.shutdown();
    }

    #[test]
    fn test_stop_subscription_cancels_everything() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let request = SubscriptionRequest::new(
            "location",
            SubscriptionQos::on_change_with_keep_alive(60_000, 1_000, 0, 50, 0),
        );
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );
        manager.stop_subscription(&subscription_id);
        assert!(!manager.has_subscription(&subscription_id));

        let count = sender.publication_count();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(
            sender.publication_count(),
            count,
            "keep-alive must stop with the subscription"
        );
        manager.shutdown();
    }

    #[test]
    fn test_provider_unregister_cascades() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let first =
            SubscriptionRequest::new("location", SubscriptionQos::on_change(60_000, 1_000, 0));
        let second =
            SubscriptionRequest::new("speed", SubscriptionQos::on_change(60_000, 1_000, 0));
        let first_id = first.subscription_id.clone();
        let second_id = second.subscription_id.clone();

        for request in [first, second] {
            manager.add_attribute_subscription(
                "proxy",
                "provider",
                FixedCaller::new(0),
                request,
                Arc::clone(&sender) as Arc<dyn PublicationSender>,
            );
        }
        manager.remove_all_subscriptions("provider");
        assert!(!manager.has_subscription(&first_id));
        assert!(!manager.has_subscription(&second_id));
        manager.shutdown();
    }

    #[test]
    fn test_readd_same_id_resets_qos_and_sends_new_reply() {
        let manager = manager_with_uplift(0);
        let sender = Arc::new(MockSender::default());
        let mut request =
            SubscriptionRequest::new("location", SubscriptionQos::on_change(60_000, 1_000, 500));
        let subscription_id = request.subscription_id.clone();

        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(0),
            request.clone(),
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );

        // Update: same id, min interval dropped to zero.
        request.qos = SubscriptionQos::on_change(60_000, 1_000, 0);
        manager.add_attribute_subscription(
            "proxy",
            "provider",
            FixedCaller::new(1),
            request,
            Arc::clone(&sender) as Arc<dyn PublicationSender>,
        );

        assert_eq!(sender.replies.lock().unwrap().len(), 2);
        assert!(manager.has_subscription(&subscription_id));

        // Under the new QoS an immediate change publishes immediately.
        let count = sender.publication_count();
        manager.attribute_value_changed(&subscription_id, Value::from(9));
        assert_eq!(sender.publication_count(), count + 1);
        manager.shutdown();
    }
}
