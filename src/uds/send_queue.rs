//! Size-limited FIFO of outbound frames with an in-flight slot.
//!
//! The entry currently being written to the socket is held outside the FIFO
//! so its buffer stays alive until the write completes, even when the rest of
//! the queue is drained. The boolean returns tell the owning connection
//! whether to kick its write loop.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::JoynrError;

/// One-shot callback invoked when a queued frame will not be sent.
pub type SendFailed = Box<dyn FnOnce(JoynrError) + Send>;

struct Entry {
    frame: Bytes,
    on_failure: Option<SendFailed>,
}

impl Entry {
    fn fail(&mut self, error: &JoynrError) {
        if let Some(callback) = self.on_failure.take() {
            callback(error.clone());
        }
    }
}

/// Bounded FIFO of (frame, failure-callback) pairs.
pub struct UdsSendQueue {
    buffer: VecDeque<Entry>,
    max_size: usize,
    in_flight: Option<Entry>,
}

impl std::fmt::Debug for UdsSendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsSendQueue")
            .field("queued", &self.buffer.len())
            .field("max_size", &self.max_size)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}

impl UdsSendQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_size,
            in_flight: None,
        }
    }

    /// Append a frame.
    ///
    /// If the queue is at its limit, every queued entry is drained first and
    /// its failure callback invoked with a rescheduling error; the entry in
    /// flight is untouched because its write may still succeed.
    ///
    /// Returns `true` iff the queue was empty and no write is outstanding,
    /// i.e. the caller should start a write.
    pub fn push_back(&mut self, frame: Bytes, on_failure: Option<SendFailed>) -> bool {
        let previous_size = self.buffer.len();
        if previous_size >= self.max_size {
            let error = JoynrError::DelayMessage(format!(
                "Sending queue size {} exceeded. Rescheduling all queued messages.",
                self.max_size
            ));
            log::warn!("[UdsSendQueue] {error}");
            for mut entry in self.buffer.drain(..) {
                entry.fail(&error);
            }
        }
        self.buffer.push_back(Entry { frame, on_failure });
        previous_size == 0 && self.in_flight.is_none()
    }

    /// View of the frame to write next.
    ///
    /// Promotes the FIFO head into the in-flight slot if nothing is in
    /// flight. The returned handle shares the entry's buffer, so the bytes
    /// stay valid for the duration of the write regardless of queue churn.
    pub fn show_front(&mut self) -> Option<Bytes> {
        if self.in_flight.is_none() {
            self.in_flight = self.buffer.pop_front();
        }
        self.in_flight.as_ref().map(|entry| entry.frame.clone())
    }

    /// Clear the in-flight slot after a completed write.
    ///
    /// Returns `true` iff the write succeeded and more frames are pending,
    /// i.e. the caller should write again.
    pub fn pop_front_on_success(&mut self, write_failed: bool) -> bool {
        if self.in_flight.is_none() || write_failed {
            return false;
        }
        self.in_flight = None;
        !self.buffer.is_empty()
    }

    /// Fail every queued entry, and the in-flight entry's callback too.
    ///
    /// The in-flight frame itself is kept: the socket writer may still hold a
    /// view of it. Its callback is detached so it cannot fire twice.
    pub fn empty_queue_and_notify(&mut self, error_message: &str) {
        let error = JoynrError::DelayMessage(error_message.to_owned());
        if let Some(entry) = self.in_flight.as_mut() {
            // The write has failed or will fail; only the callback is
            // consumed, the buffer stays alive for the writer.
            entry.fail(&error);
        }
        for mut entry in self.buffer.drain(..) {
            entry.fail(&error);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.in_flight.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    fn recording(
        log: &Arc<Mutex<Vec<String>>>,
        tag: &str,
    ) -> Option<SendFailed> {
        let log = Arc::clone(log);
        let tag = tag.to_owned();
        Some(Box::new(move |error| {
            log.lock().unwrap().push(format!("{tag}: {error}"));
        }))
    }

    #[test]
    fn test_first_push_requests_write() {
        let mut queue = UdsSendQueue::new(8);
        assert!(queue.push_back(frame(1), None));
        assert!(!queue.push_back(frame(2), None));
    }

    #[test]
    fn test_push_with_in_flight_does_not_request_write() {
        let mut queue = UdsSendQueue::new(8);
        queue.push_back(frame(1), None);
        let _front = queue.show_front().unwrap();
        // Queue is empty again but a write is outstanding.
        assert!(!queue.push_back(frame(2), None));
    }

    #[test]
    fn test_show_front_is_stable_until_pop() {
        let mut queue = UdsSendQueue::new(8);
        queue.push_back(frame(1), None);
        queue.push_back(frame(2), None);
        assert_eq!(queue.show_front().unwrap()[0], 1);
        // Repeated calls keep returning the in-flight entry.
        assert_eq!(queue.show_front().unwrap()[0], 1);
        assert!(queue.pop_front_on_success(false));
        assert_eq!(queue.show_front().unwrap()[0], 2);
        assert!(!queue.pop_front_on_success(false));
    }

    #[test]
    fn test_pop_on_failure_keeps_in_flight() {
        let mut queue = UdsSendQueue::new(8);
        queue.push_back(frame(1), None);
        let _ = queue.show_front();
        assert!(!queue.pop_front_on_success(true));
        // The failed entry is still in flight.
        assert_eq!(queue.show_front().unwrap()[0], 1);
    }

    #[test]
    fn test_pop_without_in_flight_is_false() {
        let mut queue = UdsSendQueue::new(8);
        assert!(!queue.pop_front_on_success(false));
    }

    #[test]
    fn test_overflow_evicts_all_queued_with_reschedule_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = UdsSendQueue::new(3);
        queue.push_back(frame(1), recording(&log, "a"));
        queue.push_back(frame(2), recording(&log, "b"));
        queue.push_back(frame(3), recording(&log, "c"));
        assert_eq!(queue.len(), 3);

        queue.push_back(frame(4), recording(&log, "d"));
        assert_eq!(queue.len(), 1, "only the newest entry survives");

        let entries = log.lock().unwrap();
        assert_eq!(entries.len(), 3);
        for entry in entries.iter() {
            assert!(
                entry.contains("Sending queue size 3 exceeded"),
                "unexpected failure message: {entry}"
            );
        }
    }

    #[test]
    fn test_zero_capacity_fails_previous_entry_on_every_push() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut queue = UdsSendQueue::new(0);
        let counter_a = Arc::clone(&counter);
        assert!(queue.push_back(
            frame(1),
            Some(Box::new(move |_| {
                counter_a.fetch_add(1, Ordering::SeqCst);
            }))
        ));
        let counter_b = Arc::clone(&counter);
        queue.push_back(
            frame(2),
            Some(Box::new(move |_| {
                counter_b.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_queue_and_notify_hits_in_flight_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut queue = UdsSendQueue::new(8);
        let counter_cb = Arc::clone(&counter);
        queue.push_back(
            frame(1),
            Some(Box::new(move |_| {
                counter_cb.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let _front = queue.show_front();

        queue.empty_queue_and_notify("Connection closed.");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The callback is detached: a second drain must not fire it again.
        queue.empty_queue_and_notify("Connection closed.");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The frame itself is still held for the writer.
        assert!(queue.show_front().is_some());
    }

    #[test]
    fn test_overflow_then_success_callback_at_most_once() {
        // An entry evicted on overflow must not fire again on drain.
        let counter = Arc::new(AtomicUsize::new(0));
        let mut queue = UdsSendQueue::new(1);
        let counter_cb = Arc::clone(&counter);
        queue.push_back(
            frame(1),
            Some(Box::new(move |_| {
                counter_cb.fetch_add(1, Ordering::SeqCst);
            })),
        );
        queue.push_back(frame(2), None); // evicts frame 1
        queue.empty_queue_and_notify("Connection closed.");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
