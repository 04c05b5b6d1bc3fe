//! UDS server: accepts client connections for the cluster controller.
//!
//! Each accepted connection captures the peer's credentials, reads the init
//! frame, and only then surfaces as [`UdsServerEvent::Connected`] together
//! with a [`UdsSenderHandle`]. A connection whose first frame is not a valid
//! `MJI1` init frame is closed before any event is emitted.
//!
//! Sender handles hold only a weak reference to the connection, so they can
//! outlive server shutdown safely: a send against a gone connection fails
//! through its callback instead of keeping the connection alive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::framing::{self, FrameDecoder, UdsFrame};
use super::send_queue::{SendFailed, UdsSendQueue};
use crate::address::Address;
use crate::error::JoynrError;
use crate::settings::UdsSettings;

/// `sun_path` is 104 bytes on macOS, 108 on Linux; use the conservative one.
const MAX_SOCKET_PATH: usize = 104;

/// Events delivered to the server's owner.
#[derive(Debug)]
pub enum UdsServerEvent {
    /// A client completed its init handshake.
    Connected {
        address: Address,
        sender: UdsSenderHandle,
        username: String,
    },
    /// A previously connected client went away. Emitted once per connection.
    Disconnected { address: Address },
    /// One message frame arrived from a connected client.
    Received {
        address: Address,
        message: Bytes,
        username: String,
    },
}

struct ConnShared {
    queue: Mutex<UdsSendQueue>,
    writable: Notify,
    closed: AtomicBool,
    token: CancellationToken,
    index: u64,
}

/// Handle for sending frames to one connected client.
///
/// Cloneable and safe to keep after the connection or the whole server is
/// gone; sends then fail through the callback.
#[derive(Clone)]
pub struct UdsSenderHandle {
    inner: Weak<ConnShared>,
}

impl std::fmt::Debug for UdsSenderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsSenderHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl UdsSenderHandle {
    /// Queue one serialized message for this client.
    ///
    /// `on_failure` fires at most once: eviction, connection close, or an
    /// already-gone connection.
    pub fn send(&self, payload: Bytes, on_failure: SendFailed) {
        let Some(conn) = self.inner.upgrade() else {
            on_failure(JoynrError::Transport("connection already closed".into()));
            return;
        };
        if conn.closed.load(Ordering::SeqCst) {
            on_failure(JoynrError::Transport("connection already closed".into()));
            return;
        }
        match framing::encode_message_frame(&payload) {
            Err(error) => {
                on_failure(error);
                conn.token.cancel();
            }
            Ok(frame) => {
                let start_write = conn
                    .queue
                    .lock()
                    .expect("send queue lock")
                    .push_back(frame, Some(on_failure));
                if start_write {
                    conn.writable.notify_one();
                }
            }
        }
    }
}

/// Server endpoint of the UDS transport.
pub struct UdsServer {
    socket_path: PathBuf,
    token: CancellationToken,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl std::fmt::Debug for UdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsServer")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl UdsServer {
    /// Bind the socket path and start accepting. Must run inside tokio.
    ///
    /// An existing socket file is replaced (with a warning), supporting
    /// server restart over the same path. File permissions deny access to
    /// "others".
    ///
    /// # Errors
    ///
    /// Returns an error if the path is too long for `sun_path` or the
    /// listener cannot be bound.
    pub fn start(
        settings: &UdsSettings,
    ) -> Result<(Self, UnboundedReceiver<UdsServerEvent>), JoynrError> {
        let socket_path = settings.socket_path.clone();
        let path_len = socket_path.as_os_str().len();
        if path_len >= MAX_SOCKET_PATH {
            return Err(JoynrError::Settings(format!(
                "socket path too long ({path_len} bytes, max {}): {}",
                MAX_SOCKET_PATH - 1,
                socket_path.display()
            )));
        }

        if socket_path.exists() {
            log::warn!(
                "[UdsServer] Path {} already exists. Replacing existing path.",
                socket_path.display()
            );
            std::fs::remove_file(&socket_path).map_err(|e| {
                JoynrError::Settings(format!(
                    "failed to remove stale socket {}: {e}",
                    socket_path.display()
                ))
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                JoynrError::Settings(format!("mkdir {}: {e}", parent.display()))
            })?;
        }

        let listener = std::os::unix::net::UnixListener::bind(&socket_path).map_err(|e| {
            JoynrError::Transport(format!("failed to bind {}: {e}", socket_path.display()))
        })?;

        // No access for others, no execute bits.
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o660);
            std::fs::set_permissions(&socket_path, perms)
                .map_err(|e| JoynrError::Settings(format!("socket permissions: {e}")))?;
        }

        listener
            .set_nonblocking(true)
            .map_err(|e| JoynrError::Transport(format!("set_nonblocking: {e}")))?;
        let listener = UnixListener::from_std(listener)
            .map_err(|e| JoynrError::Transport(format!("tokio listener: {e}")))?;

        log::info!(
            "[UdsServer] Waiting for connections on path {}.",
            socket_path.display()
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let connections: Arc<Mutex<HashMap<u64, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            events_tx,
            token.clone(),
            Arc::clone(&connections),
            settings.sending_queue_size,
        ));

        Ok((
            Self {
                socket_path,
                token,
                accept_handle: Mutex::new(Some(accept_handle)),
                connections,
            },
            events_rx,
        ))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, close every connection, and remove the socket file.
    ///
    /// Waits for each connection task to finish; the registry lock is not
    /// held while waiting.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let accept = self.accept_handle.lock().expect("accept lock").take();
        if let Some(handle) = accept {
            let _ = handle.await;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut connections = self.connections.lock().expect("registry lock");
            connections.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    async fn accept_loop(
        listener: UnixListener,
        events: UnboundedSender<UdsServerEvent>,
        token: CancellationToken,
        connections: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
        sending_queue_size: usize,
    ) {
        let mut connection_index: u64 = 0;
        loop {
            let accepted = tokio::select! {
                () = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    connection_index += 1;
                    log::info!(
                        "[UdsServer] Connection index {connection_index} request received from new client."
                    );
                    let handle = tokio::spawn(Connection::run(
                        stream,
                        connection_index,
                        sending_queue_size,
                        events.clone(),
                        token.child_token(),
                        Arc::clone(&connections),
                    ));
                    connections
                        .lock()
                        .expect("registry lock")
                        .insert(connection_index, handle);
                }
                Err(error) => {
                    log::error!("[UdsServer] Accept error: {error}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Drop for UdsServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Connection;

impl Connection {
    async fn run(
        stream: UnixStream,
        index: u64,
        sending_queue_size: usize,
        events: UnboundedSender<UdsServerEvent>,
        token: CancellationToken,
        registry: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    ) {
        let username = peer_username(&stream, index);
        let shared = Arc::new(ConnShared {
            queue: Mutex::new(UdsSendQueue::new(sending_queue_size)),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            token: token.clone(),
            index,
        });

        let (read_half, write_half) = stream.into_split();

        // The address slot is filled by the read loop once the init frame
        // arrived; the close path needs it for the Disconnected event.
        let address: Mutex<Option<Address>> = Mutex::new(None);

        let result = tokio::select! {
            () = token.cancelled() => Ok(()),
            result = Self::read_loop(read_half, &shared, &events, &address, &username) => result,
            result = Self::write_loop(write_half, &shared) => result,
        };

        if let Err(error) = &result {
            let client = address
                .lock()
                .expect("address lock")
                .as_ref()
                .map_or_else(|| "[unknown ID]".to_owned(), ToString::to_string);
            log::error!("[UdsServer] Connection index {index} to {client} corrupted: {error}");
        }

        if !shared.closed.swap(true, Ordering::SeqCst) {
            if let Some(address) = address.lock().expect("address lock").take() {
                let _ = events.send(UdsServerEvent::Disconnected { address });
            }
            shared
                .queue
                .lock()
                .expect("send queue lock")
                .empty_queue_and_notify("Connection closed.");
        }
        registry.lock().expect("registry lock").remove(&index);
    }

    async fn read_loop(
        mut reader: tokio::net::unix::OwnedReadHalf,
        shared: &Arc<ConnShared>,
        events: &UnboundedSender<UdsServerEvent>,
        address_slot: &Mutex<Option<Address>>,
        username: &str,
    ) -> Result<(), JoynrError> {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 64 * 1024];
        let mut client_address: Option<Address> = None;

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| JoynrError::Transport(format!("read failed: {e}")))?;
            if n == 0 {
                return if client_address.is_some() {
                    Ok(()) // orderly disconnect after handshake
                } else {
                    Err(JoynrError::FatalTransport(
                        "connection closed before init frame".into(),
                    ))
                };
            }
            let frames = decoder.feed(&buf[..n]).map_err(JoynrError::from)?;
            for frame in frames {
                match (client_address.is_some(), frame) {
                    (false, UdsFrame::Init(address)) => {
                        log::info!(
                            "[UdsServer] Initialize connection index {} for client with User / ID: {} / {}",
                            shared.index,
                            username,
                            address
                        );
                        client_address = Some(address.clone());
                        *address_slot.lock().expect("address lock") = Some(address.clone());
                        let _ = events.send(UdsServerEvent::Connected {
                            address,
                            sender: UdsSenderHandle {
                                inner: Arc::downgrade(shared),
                            },
                            username: username.to_owned(),
                        });
                    }
                    (false, UdsFrame::Message(_)) => {
                        return Err(JoynrError::FatalTransport(
                            "first frame was not an init frame".into(),
                        ));
                    }
                    (true, UdsFrame::Init(_)) => {
                        return Err(JoynrError::FatalTransport(
                            "client sent a second init frame".into(),
                        ));
                    }
                    (true, UdsFrame::Message(message)) => {
                        let address = client_address.clone().expect("handshake done");
                        let _ = events.send(UdsServerEvent::Received {
                            address,
                            message,
                            username: username.to_owned(),
                        });
                    }
                }
            }
        }
    }

    async fn write_loop(
        mut writer: tokio::net::unix::OwnedWriteHalf,
        shared: &Arc<ConnShared>,
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
                        return Err(JoynrError::Transport(format!("write failed: {error}")));
                    }
                }
            }
        }
    }
}

/// Resolve the connecting peer's username via `SO_PEERCRED`.
///
/// Falls back to the numeric uid when no passwd entry exists, and to
/// `"anonymous"` when the credentials cannot be read at all.
#[cfg(target_os = "linux")]
fn peer_username(stream: &UnixStream, index: u64) -> String {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: fd is a valid open socket for the lifetime of `stream`; ucred
    // and len are properly sized out-parameters living on this stack frame.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        let errno = std::io::Error::last_os_error();
        log::error!(
            "[UdsServer] Connection index {index} could not obtain peer credentials from socket: {errno}"
        );
        return "anonymous".to_owned();
    }
    username_for_uid(ucred.uid)
}

#[cfg(not(target_os = "linux"))]
fn peer_username(_stream: &UnixStream, _index: u64) -> String {
    "anonymous".to_owned()
}

#[cfg(target_os = "linux")]
fn username_for_uid(uid: libc::uid_t) -> String {
    // SAFETY: passwd is plain-old-data; all-zero is a valid initial value.
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = [0 as libc::c_char; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: passwd, buf and result are valid for the duration of the call;
    // getpwuid_r writes the entry strings into buf.
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut passwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc == 0 && !result.is_null() {
        // SAFETY: pw_name points into buf and is NUL-terminated by libc.
        let name = unsafe { std::ffi::CStr::from_ptr(passwd.pw_name) };
        let name = name.to_string_lossy();
        if !name.is_empty() {
            return name.into_owned();
        }
    } else if rc == 0 {
        log::info!("[UdsServer] Could not find username for uid {uid}");
    } else {
        log::error!("[UdsServer] Could not find username for uid {uid}, errno {rc}");
    }
    uid.to_string()
}
