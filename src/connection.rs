//! Connection state machine: handshake, read loop, command/reply correlation

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::command::{encode_auth, encode_raw, Command, CommandKind, Reply};
use crate::constants::{HEADER_CONTENT_DISPOSITION, HEADER_HANGUP_CAUSE, OUTBOUND_CONNECT};
use crate::error::{EslError, EslResult};
use crate::inbound::Inbound;
use crate::message::{Message, PooledMessage};
use crate::protocol::{ContentType, FrameReader};

pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type Reader = FrameReader<BoxReader>;

/// Callback receiving decoded events (or raw `log/data` frames).
pub type EventCallback = Arc<dyn Fn(PooledMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked after every reconnect attempt with its outcome.
pub type ReconnectCallback =
    Arc<dyn Fn(Inbound, Option<EslError>) -> BoxFuture<'static, ()> + Send + Sync>;

/// User callbacks attached to a connection.
#[derive(Clone, Default)]
pub struct Applications {
    pub(crate) on_event: Option<EventCallback>,
    pub(crate) on_log: Option<EventCallback>,
    pub(crate) on_reconnect: Option<ReconnectCallback>,
}

impl Applications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `text/event-plain` frames. The message passed in has already
    /// been payload-decoded. Each call runs on its own task.
    pub fn on_event<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PooledMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_event = Some(Arc::new(move |msg| f(msg).boxed()));
        self
    }

    /// Handle `log/data` frames, delivered raw.
    pub fn on_log<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PooledMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_log = Some(Arc::new(move |msg| f(msg).boxed()));
        self
    }

    /// Called after each inbound reconnect attempt; `None` means the attempt
    /// succeeded. Typical use is re-subscribing to events.
    pub fn on_reconnect<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Inbound, Option<EslError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_reconnect = Some(Arc::new(move |inbound, err| f(inbound, err).boxed()));
        self
    }
}

impl fmt::Debug for Applications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Applications")
            .field(
                "on_event",
                &self
                    .on_event
                    .is_some(),
            )
            .field(
                "on_log",
                &self
                    .on_log
                    .is_some(),
            )
            .field(
                "on_reconnect",
                &self
                    .on_reconnect
                    .is_some(),
            )
            .finish()
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// We dialed the switch and authenticated.
    Inbound,
    /// The switch dialed us for one call leg.
    Outbound,
}

/// Reason a connection reached [`ConnectionState::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Server sent a text/disconnect-notice without `linger` disposition
    ServerNotice,
    /// Socket or framing failure (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Clean EOF on the socket
    ConnectionClosed,
    /// `close()` was called
    ClientRequested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Lifecycle of one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    Handshaking,
    Ready,
    Closed(DisconnectReason),
}

/// Single reply slot shared by the command path and the read loop.
enum Slot {
    Idle,
    Waiting(oneshot::Sender<PooledMessage>),
    Closed,
}

struct Inner {
    mode: ConnectionMode,
    writer: Mutex<Option<BoxWriter>>,
    pending: StdMutex<Slot>,
    state: watch::Sender<ConnectionState>,
    channel_data: OnceLock<PooledMessage>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    apps: Applications,
}

/// One ESL socket.
///
/// Cheap to clone; clones share the socket. Commands are serialized: the
/// writer lock is held from the write until the matching reply arrives, so
/// at most one command is in flight. Dropping a command future after its
/// write has gone out leaves the switch's reply unclaimed; impose timeouts
/// around whole sessions rather than single commands.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field(
                "mode",
                &self
                    .inner
                    .mode,
            )
            .field("state", &self.state())
            .finish()
    }
}

/// Establish a TCP connection with a timeout.
pub(crate) async fn tcp_connect_with_timeout(
    addr: &str,
    dial_timeout: Duration,
) -> EslResult<TcpStream> {
    let timeout_ms = dial_timeout.as_millis() as u64;
    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established to {}", addr);
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect to {} failed: {}", addr, e);
            Err(EslError::Io(e))
        }
        Err(_) => {
            warn!("[CONNECT] TCP connect timed out after {}ms", timeout_ms);
            Err(EslError::Timeout { timeout_ms })
        }
    }
}

/// Split a TCP stream into the boxed halves a [`Connection`] runs on.
pub(crate) fn split_tcp(stream: TcpStream) -> (Reader, BoxWriter) {
    let (read_half, write_half) = stream.into_split();
    let read_half: BoxReader = Box::new(read_half);
    (FrameReader::new(read_half), Box::new(write_half))
}

impl Connection {
    pub(crate) fn new(mode: ConnectionMode, writer: BoxWriter, apps: Applications) -> Self {
        let (state, _) = watch::channel(ConnectionState::Handshaking);
        Self {
            inner: Arc::new(Inner {
                mode,
                writer: Mutex::new(Some(writer)),
                pending: StdMutex::new(Slot::Idle),
                state,
                channel_data: OnceLock::new(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                apps,
            }),
        }
    }

    /// Accept one switch-initiated connection on `listener`, send `connect`
    /// and start its read loop.
    pub async fn accept_outbound(listener: &TcpListener, apps: Applications) -> EslResult<Self> {
        let (stream, addr) = listener
            .accept()
            .await?;
        info!("[ACCEPT] Outbound connection from {}", addr);
        let (mut reader, writer) = split_tcp(stream);
        let conn = Connection::new(ConnectionMode::Outbound, writer, apps);
        conn.connect_session(&mut reader)
            .await?;
        conn.spawn_reader(reader);
        Ok(conn)
    }

    /// Inbound handshake: wait for `auth/request`, answer with the password,
    /// require `+OK`. The whole exchange is bounded by `auth_timeout`.
    pub(crate) async fn authenticate(
        &self,
        reader: &mut Reader,
        password: &str,
        auth_timeout: Duration,
    ) -> EslResult<()> {
        let handshake = async {
            debug!("[AUTH] Waiting for auth request");
            let msg = reader
                .read_message()
                .await?;
            match msg.kind() {
                Some(ContentType::AuthRequest) => {}
                Some(ContentType::RudeRejection) => {
                    warn!("[AUTH] Rejected by switch ACL");
                    return Err(EslError::AccessDenied);
                }
                _ => {
                    return Err(EslError::UnexpectedContentType {
                        content_type: msg
                            .content_type()
                            .unwrap_or_default()
                            .to_string(),
                    })
                }
            }
            drop(msg);

            debug!("[AUTH] Sending command: auth [REDACTED]");
            self.write_raw(&encode_auth(password)?)
                .await?;

            let reply = Reply::new(
                reader
                    .read_message()
                    .await?,
            );
            if !reply.is_success() {
                return Err(EslError::auth_failed(
                    reply
                        .reply_text()
                        .unwrap_or("authentication failed"),
                ));
            }
            Ok(())
        };

        match timeout(auth_timeout, handshake).await {
            Ok(Ok(())) => {
                debug!("[AUTH] Authentication successful");
                self.set_ready();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EslError::Timeout {
                timeout_ms: auth_timeout.as_millis() as u64,
            }),
        }
    }

    /// Outbound handshake: send `connect` and keep the first frame as channel
    /// data.
    pub(crate) async fn connect_session(&self, reader: &mut Reader) -> EslResult<()> {
        self.write_raw(OUTBOUND_CONNECT.as_bytes())
            .await?;
        let msg = reader
            .read_message()
            .await?;
        debug!(
            "[CONNECT] Channel data received ({} headers)",
            msg.headers()
                .len()
        );
        let _ = self
            .inner
            .channel_data
            .set(msg);
        self.set_ready();
        Ok(())
    }

    /// Run the read loop on its own task. The handle resolves once the
    /// connection is closed.
    pub(crate) fn spawn_reader(&self, reader: Reader) -> tokio::task::JoinHandle<DisconnectReason> {
        let conn = self.clone();
        tokio::spawn(async move {
            conn.run_reader(reader)
                .await
        })
    }

    pub(crate) async fn run_reader(&self, mut reader: Reader) -> DisconnectReason {
        let result = AssertUnwindSafe(self.read_loop(&mut reader))
            .catch_unwind()
            .await;
        let reason = result.unwrap_or_else(|_| {
            error!("[READER] reader task panicked");
            DisconnectReason::IoError("reader task panicked".to_string())
        });
        self.teardown(reason.clone())
            .await;
        reason
    }

    async fn read_loop(&self, reader: &mut Reader) -> DisconnectReason {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => {
                    debug!("[READER] Shutdown requested");
                    return DisconnectReason::ClientRequested;
                }
                result = reader.read_message() => result,
            };
            let msg = match result {
                Ok(msg) => msg,
                Err(EslError::ConnectionClosed) => {
                    info!("[READER] Connection closed (EOF)");
                    return DisconnectReason::ConnectionClosed;
                }
                Err(e) => {
                    warn!("[READER] Unable to parse message: {}", e);
                    return DisconnectReason::IoError(e.to_string());
                }
            };

            match msg.kind() {
                Some(ContentType::CommandReply | ContentType::ApiResponse) => {
                    self.deliver_reply(msg)
                }
                Some(ContentType::EventPlain) => self.dispatch_event(msg),
                Some(ContentType::LogData) => self.dispatch_log(msg),
                Some(ContentType::DisconnectNotice) => {
                    if msg.header(HEADER_CONTENT_DISPOSITION) == Some("linger") {
                        debug!("[READER] Disconnect notice with linger disposition, ignoring");
                        continue;
                    }
                    info!("[READER] Received disconnect notice");
                    return DisconnectReason::ServerNotice;
                }
                _ => debug!("[READER] Unhandled content type: {:?}", msg.content_type()),
            }
        }
    }

    fn deliver_reply(&self, msg: PooledMessage) {
        let mut slot = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Waiting(tx) => {
                let _ = tx.send(msg);
            }
            Slot::Idle => warn!(
                "[READER] Received {:?} but no pending command",
                msg.content_type()
            ),
            Slot::Closed => *slot = Slot::Closed,
        }
    }

    fn dispatch_event(&self, mut msg: PooledMessage) {
        let Some(on_event) = self
            .inner
            .apps
            .on_event
            .clone()
        else {
            trace!("[READER] No event handler, dropping event");
            return;
        };
        msg.decode_payload();
        self.inner
            .tasks
            .spawn(on_event(msg));
    }

    fn dispatch_log(&self, msg: PooledMessage) {
        let Some(on_log) = self
            .inner
            .apps
            .on_log
            .clone()
        else {
            return;
        };
        self.inner
            .tasks
            .spawn(on_log(msg));
    }

    fn set_ready(&self) {
        self.inner
            .state
            .send_if_modified(|state| {
                if *state == ConnectionState::Handshaking {
                    *state = ConnectionState::Ready;
                    true
                } else {
                    false
                }
            });
    }

    fn mark_closed(&self, reason: DisconnectReason) {
        self.inner
            .state
            .send_if_modified(|state| {
                if matches!(state, ConnectionState::Closed(_)) {
                    false
                } else {
                    *state = ConnectionState::Closed(reason);
                    true
                }
            });
        // dropping a waiting sender wakes its caller with ConnectionClosed
        *self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Slot::Closed;
        self.inner
            .shutdown
            .cancel();
        self.inner
            .tasks
            .close();
    }

    async fn teardown(&self, reason: DisconnectReason) {
        self.mark_closed(reason);
        let writer = self
            .inner
            .writer
            .lock()
            .await
            .take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer
                .shutdown()
                .await
            {
                trace!("[READER] Writer shutdown failed: {}", e);
            }
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> EslResult<()> {
        let mut writer = self
            .inner
            .writer
            .lock()
            .await;
        let writer = writer
            .as_mut()
            .ok_or(EslError::NotConnected)?;
        writer
            .write_all(bytes)
            .await?;
        writer
            .flush()
            .await?;
        Ok(())
    }

    /// Write `bytes` and wait for the next reply frame.
    async fn round_trip(&self, bytes: &[u8]) -> Reply {
        let mut writer = self
            .inner
            .writer
            .lock()
            .await;
        if !self.is_ready() {
            return Reply::from_error(EslError::NotConnected);
        }
        let Some(w) = writer.as_mut() else {
            return Reply::from_error(EslError::NotConnected);
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if matches!(*slot, Slot::Closed) {
                return Reply::from_error(EslError::NotConnected);
            }
            *slot = Slot::Waiting(tx);
        }

        let written = async {
            w.write_all(bytes)
                .await?;
            w.flush()
                .await
        }
        .await;
        if let Err(e) = written {
            warn!("[SEND] Write failed: {}", e);
            let mut slot = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if matches!(*slot, Slot::Waiting(_)) {
                *slot = Slot::Idle;
            }
            return Reply::from_error(EslError::Io(e));
        }

        let reply = match rx.await {
            Ok(msg) => Reply::new(msg),
            Err(_) => Reply::from_error(EslError::ConnectionClosed),
        };
        drop(writer);
        trace!("[SEND] Reply received: status={:?}", reply.status());
        reply
    }

    /// Send a prepared command and wait for its reply.
    pub async fn command(&self, cmd: &mut Command) -> Reply {
        match cmd.bytes() {
            Ok(bytes) => {
                debug!(
                    "[SEND] Sending command: {}",
                    String::from_utf8_lossy(bytes).trim_end()
                );
                self.round_trip(bytes)
                    .await
            }
            Err(e) => Reply::from_error(e),
        }
    }

    /// `sendmsg` + `call-command: execute` on this connection's call leg.
    pub async fn execute(&self, app: &str, arg: &str) -> Reply {
        let mut cmd = Command::acquire(CommandKind::Message);
        cmd.set_command("execute")
            .set_app(app)
            .set_arg(arg);
        self.command(&mut cmd)
            .await
    }

    /// Like [`execute`](Self::execute) but addressed to the call leg `uuid`,
    /// as needed on inbound connections.
    pub async fn execute_uuid(&self, uuid: &str, app: &str, arg: &str) -> Reply {
        let mut cmd = Command::acquire(CommandKind::Message);
        cmd.set_uuid(uuid)
            .set_command("execute")
            .set_app(app)
            .set_arg(arg);
        self.command(&mut cmd)
            .await
    }

    /// Blocking API command; the result is in the reply body.
    pub async fn api(&self, app: &str, arg: &str) -> Reply {
        let mut cmd = Command::acquire(CommandKind::Api);
        cmd.set_app(app)
            .set_arg(arg);
        self.command(&mut cmd)
            .await
    }

    /// Background API command; see [`Reply::job_uuid`].
    pub async fn bgapi(&self, app: &str, arg: &str) -> Reply {
        let mut cmd = Command::acquire(CommandKind::Bgapi);
        cmd.set_app(app)
            .set_arg(arg);
        self.command(&mut cmd)
            .await
    }

    /// Event subscription, e.g. `event("plain ALL")`.
    pub async fn event(&self, arg: &str) -> Reply {
        let mut cmd = Command::acquire(CommandKind::Event);
        cmd.set_arg(arg);
        self.command(&mut cmd)
            .await
    }

    /// Hang up this connection's call leg. An empty `cause` lets the switch
    /// pick its default.
    pub async fn hangup(&self, cause: &str) -> Reply {
        self.hangup_uuid("", cause)
            .await
    }

    /// Like [`hangup`](Self::hangup) but addressed to the call leg `uuid`.
    pub async fn hangup_uuid(&self, uuid: &str, cause: &str) -> Reply {
        let mut cmd = Command::acquire(CommandKind::Message);
        cmd.set_uuid(uuid)
            .set_command("hangup");
        if !cause.is_empty() {
            cmd.set_header(HEADER_HANGUP_CAUSE, cause);
        }
        self.command(&mut cmd)
            .await
    }

    /// Any other single-line command (`myevents`, `linger`, `filter ...`).
    pub async fn send_raw(&self, line: &str) -> Reply {
        let bytes = match encode_raw(line) {
            Ok(bytes) => bytes,
            Err(e) => return Reply::from_error(e),
        };
        if line.starts_with("auth ") || line.starts_with("userauth ") {
            debug!("[SEND] Sending command: auth [REDACTED]");
        } else {
            debug!("[SEND] Sending command: {}", line);
        }
        self.round_trip(&bytes)
            .await
    }

    /// Channel data captured by the outbound handshake.
    pub fn info(&self) -> Option<&Message> {
        self.inner
            .channel_data
            .get()
            .map(|msg| &**msg)
    }

    pub fn mode(&self) -> ConnectionMode {
        self.inner
            .mode
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .state
            .borrow()
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            *self
                .inner
                .state
                .borrow(),
            ConnectionState::Ready
        )
    }

    /// Close the connection. Idempotent. A command waiting for its reply is
    /// woken with [`EslError::ConnectionClosed`].
    pub fn close(&self) {
        if !matches!(self.state(), ConnectionState::Closed(_)) {
            info!("[CLOSE] Client requested disconnect");
        }
        self.mark_closed(DisconnectReason::ClientRequested);
    }

    /// Resolve once the connection is closed, with the reason.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self
            .inner
            .state
            .subscribe();
        let result = rx
            .wait_for(|state| matches!(state, ConnectionState::Closed(_)))
            .await;
        match result.as_deref() {
            Ok(ConnectionState::Closed(reason)) => reason.clone(),
            _ => DisconnectReason::ConnectionClosed,
        }
    }

    /// Resolve once the connection is closed and every event callback it
    /// spawned has returned.
    pub async fn wait_events(&self) {
        self.inner
            .tasks
            .wait()
            .await
    }
}
