//! UDS client: dials the cluster controller and keeps the frame stream alive.
//!
//! State machine: `START → CONNECTED → STOP`, with a terminal `FAILED` for
//! unrecoverable errors. While in `START` the worker retries the connect
//! every `connect_sleep_time`; once connected, the init frame (seeded into
//! the send queue at construction) goes out first, followed by whatever
//! `send` queued in the meantime. Loss of an established connection is
//! unrecoverable and surfaces as a single
//! [`UdsClientEvent::FatalError`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::framing::{self, FrameDecoder, UdsFrame};
use super::send_queue::{SendFailed, UdsSendQueue};
use crate::address::Address;
use crate::error::JoynrError;
use crate::settings::UdsSettings;

/// Lifecycle and traffic events delivered to the client's owner.
#[derive(Debug)]
pub enum UdsClientEvent {
    /// The connection is established and the init frame is on its way.
    Connected,
    /// The worker stopped; final event unless `FatalError` precedes it.
    Disconnected,
    /// One message frame arrived.
    Received(Bytes),
    /// Unrecoverable error; the client is permanently down. Sent once.
    FatalError(JoynrError),
}

const STATE_START: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_STOP: u8 = 2;
const STATE_FAILED: u8 = 3;

struct ClientShared {
    queue: Mutex<UdsSendQueue>,
    writable: Notify,
    state: AtomicU8,
    events: UnboundedSender<UdsClientEvent>,
    token: CancellationToken,
    client_id: String,
}

impl ClientShared {
    /// Transition to FAILED and emit the fatal event, exactly once.
    fn handle_fatal(&self, error: JoynrError) {
        if self.state.swap(STATE_FAILED, Ordering::SeqCst) == STATE_FAILED {
            log::error!("[UdsClient] {} nested fatal error: {error}", self.client_id);
            return;
        }
        log::error!(
            "[UdsClient] {} fatal runtime error, stopping all communication via UDS permanently: {error}",
            self.client_id
        );
        self.queue
            .lock()
            .expect("send queue lock")
            .empty_queue_and_notify("Connection closed.");
        let _ = self.events.send(UdsClientEvent::FatalError(error));
        self.token.cancel();
    }
}

/// Client endpoint of the UDS transport.
pub struct UdsClient {
    address: Address,
    socket_path: std::path::PathBuf,
    connect_sleep_time: Duration,
    shared: Arc<ClientShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsClient")
            .field("address", &self.address)
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl UdsClient {
    /// Build a client from settings.
    ///
    /// The init frame is constructed here and becomes the first entry of the
    /// send queue, so it is guaranteed to precede every queued message.
    ///
    /// # Errors
    ///
    /// Returns an error if the init frame cannot be constructed.
    pub fn new(
        settings: &UdsSettings,
    ) -> Result<(Self, UnboundedReceiver<UdsClientEvent>), JoynrError> {
        let address = settings.create_client_messaging_address();
        let init_frame = framing::encode_init_frame(&address)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut queue = UdsSendQueue::new(settings.sending_queue_size);
        // The queue is empty here, so even a zero-sized queue accepts the
        // init frame without evicting anything.
        queue.push_back(init_frame, None);

        let client_id = match &address {
            Address::UdsClient { id } => id.clone(),
            _ => unreachable!("settings always produce a UDS client address"),
        };

        Ok((
            Self {
                address,
                socket_path: settings.socket_path.clone(),
                connect_sleep_time: settings.connect_sleep_time(),
                shared: Arc::new(ClientShared {
                    queue: Mutex::new(queue),
                    writable: Notify::new(),
                    state: AtomicU8::new(STATE_STOP),
                    events: events_tx,
                    token: CancellationToken::new(),
                    client_id,
                }),
                worker: Mutex::new(None),
            },
            events_rx,
        ))
    }

    /// Address announced in the init frame.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Spawn the worker task. Must be called inside a tokio runtime.
    ///
    /// Calling `start` twice is an error that is logged and ignored.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("worker lock");
        if worker.is_some() {
            log::error!(
                "[UdsClient] {} ({}) already started",
                self.shared.client_id,
                self.socket_path.display()
            );
            return;
        }
        self.shared.state.store(STATE_START, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let socket_path = self.socket_path.clone();
        let connect_sleep_time = self.connect_sleep_time;
        *worker = Some(tokio::spawn(Self::run(
            shared,
            socket_path,
            connect_sleep_time,
        )));
    }

    /// Queue one serialized message for sending.
    ///
    /// `on_failure` fires at most once, if the message is evicted, the queue
    /// is drained on close, or the client is not running.
    pub fn send(&self, payload: Bytes, on_failure: SendFailed) {
        let state = self.shared.state.load(Ordering::SeqCst);
        if state == STATE_STOP || state == STATE_FAILED {
            on_failure(JoynrError::Transport("UDS client is not running".into()));
            return;
        }
        match framing::encode_message_frame(&payload) {
            Err(error) => {
                on_failure(error.clone());
                self.shared.handle_fatal(error);
            }
            Ok(frame) => {
                let start_write = self
                    .shared
                    .queue
                    .lock()
                    .expect("send queue lock")
                    .push_back(frame, Some(on_failure));
                if start_write {
                    self.shared.writable.notify_one();
                }
            }
        }
    }

    /// Stop the worker and drain the send queue.
    ///
    /// Idempotent and safe to call concurrently.
    pub async fn shutdown(&self) {
        let _ = self.shared.state.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |state| (state != STATE_FAILED).then_some(STATE_STOP),
        );
        self.shared.token.cancel();
        let worker = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = worker {
            if handle.await.is_err() {
                log::error!(
                    "[UdsClient] {} worker ended abnormally",
                    self.shared.client_id
                );
            }
        }
    }

    async fn run(
        shared: Arc<ClientShared>,
        socket_path: std::path::PathBuf,
        connect_sleep_time: Duration,
    ) {
        let mut was_connected = false;
        let end: Result<(), JoynrError> = loop {
            if shared.state.load(Ordering::SeqCst) != STATE_START {
                break Ok(());
            }
            let stream = tokio::select! {
                () = shared.token.cancelled() => break Ok(()),
                connected = UnixStream::connect(&socket_path) => connected,
            };
            match stream {
                Err(error) => {
                    log::error!(
                        "[UdsClient] {} ({}) failed to connect: {error}. Retry in {}ms.",
                        shared.client_id,
                        socket_path.display(),
                        connect_sleep_time.as_millis()
                    );
                    tokio::select! {
                        () = shared.token.cancelled() => break Ok(()),
                        () = tokio::time::sleep(connect_sleep_time) => {}
                    }
                }
                Ok(stream) => {
                    if shared
                        .state
                        .compare_exchange(
                            STATE_START,
                            STATE_CONNECTED,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_err()
                    {
                        break Ok(());
                    }
                    was_connected = true;
                    log::info!(
                        "[UdsClient] {} connected to {}",
                        shared.client_id,
                        socket_path.display()
                    );
                    let _ = shared.events.send(UdsClientEvent::Connected);

                    let (read_half, write_half) = stream.into_split();
                    break tokio::select! {
                        () = shared.token.cancelled() => Ok(()),
                        result = Self::read_loop(&shared, read_half) => result,
                        result = Self::write_loop(&shared, write_half) => result,
                    };
                }
            }
        };

        match end {
            Err(error) => shared.handle_fatal(error),
            Ok(()) => {
                // Orderly stop: every queued send fails with a close notice.
                shared
                    .queue
                    .lock()
                    .expect("send queue lock")
                    .empty_queue_and_notify("Connection closed.");
            }
        }
        if was_connected {
            let _ = shared.events.send(UdsClientEvent::Disconnected);
        }
    }

    async fn read_loop(
        shared: &Arc<ClientShared>,
        mut reader: tokio::net::unix::OwnedReadHalf,
    ) -> Result<(), JoynrError> {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| JoynrError::FatalTransport(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(JoynrError::FatalTransport(
                    "connection closed by peer".into(),
                ));
            }
            let frames = decoder.feed(&buf[..n]).map_err(JoynrError::from)?;
            for frame in frames {
                match frame {
                    UdsFrame::Message(body) => {
                        let _ = shared.events.send(UdsClientEvent::Received(body));
                    }
                    UdsFrame::Init(_) => {
                        return Err(JoynrError::FatalTransport(
                            "server sent an init frame".into(),
                        ));
                    }
                }
            }
        }
    }

    async fn write_loop(
        shared: &Arc<ClientShared>,
        mut writer: tokio::net::unix::OwnedWriteHalf,
    ) -> Result<(), JoynrError> {
        loop {
            let front = shared.queue.lock().expect("send queue lock").show_front();
            match front {
                None => shared.writable.notified().await,
                Some(frame) => {
                    let result = writer.write_all(&frame).await;
                    let write_failed = result.is_err();
                    shared
                        .queue
                        .lock()
                        .expect("send queue lock")
                        .pop_front_on_success(write_failed);
                    if let Err(error) = result {
                        return Err(JoynrError::FatalTransport(format!(
                            "write failed: {error}"
                        )));
                    }
                }
            }
        }
    }
}

impl Drop for UdsClient {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}
