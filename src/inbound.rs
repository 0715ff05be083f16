//! Inbound role: dial, authenticate, reconnect

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{Command, Reply};
use crate::connection::{
    split_tcp, tcp_connect_with_timeout, Applications, Connection, ConnectionMode,
    DisconnectReason, Reader,
};
use crate::constants::{
    DEFAULT_AUTH_TIMEOUT_MS, DEFAULT_INBOUND_ADDR, DEFAULT_PASSWORD, DEFAULT_RECONNECT_DELAY_MS,
    DEFAULT_TIMEOUT_MS,
};
use crate::error::{EslError, EslResult};

/// Settings for [`Inbound::run`].
#[derive(Clone)]
pub struct InboundConfig {
    /// `host:port` of the switch's event socket.
    pub address: String,
    pub password: String,
    /// Bound on the TCP connect.
    pub dial_timeout: Duration,
    /// Bound on the `auth/request` exchange.
    pub auth_timeout: Duration,
    /// Reconnect attempts after a lost connection; 0 means unlimited.
    pub max_reconnect: u32,
    /// Pause between two failed reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_INBOUND_ADDR.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            dial_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            auth_timeout: Duration::from_millis(DEFAULT_AUTH_TIMEOUT_MS),
            max_reconnect: 0,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }
}

impl fmt::Debug for InboundConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundConfig")
            .field("address", &self.address)
            .field("password", &"[REDACTED]")
            .field("dial_timeout", &self.dial_timeout)
            .field("auth_timeout", &self.auth_timeout)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}

impl InboundConfig {
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_auth_timeout(mut self, auth_timeout: Duration) -> Self {
        self.auth_timeout = auth_timeout;
        self
    }

    pub fn with_max_reconnect(mut self, max_reconnect: u32) -> Self {
        self.max_reconnect = max_reconnect;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Closed,
    MaxRetries(u32),
}

struct InboundInner {
    config: InboundConfig,
    apps: Applications,
    connection: RwLock<Connection>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    exit: watch::Sender<Option<Exit>>,
}

/// Client connection to a switch, kept alive across disconnects.
///
/// The initial dial happens in [`run`](Self::run). After that a background
/// supervisor waits for the read loop to end and redials until it succeeds,
/// the reconnect budget runs out, or [`close`](Self::close) is called. The
/// supervisor keeps the instance alive, so always close it when done.
#[derive(Clone)]
pub struct Inbound {
    inner: Arc<InboundInner>,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("config", &self.inner.config)
            .field("connection", &self.connection())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn dial(config: &InboundConfig, apps: &Applications) -> EslResult<(Connection, Reader)> {
    info!("[CONNECT] Connecting to {}", config.address);
    let stream = tcp_connect_with_timeout(&config.address, config.dial_timeout).await?;
    let (mut reader, writer) = split_tcp(stream);
    let conn = Connection::new(ConnectionMode::Inbound, writer, apps.clone());
    conn.authenticate(&mut reader, &config.password, config.auth_timeout)
        .await?;
    info!("[CONNECT] Connected and authenticated to {}", config.address);
    Ok((conn, reader))
}

/// Publishes an exit when the supervisor unwinds before reporting one, so
/// [`Inbound::wait`] always resolves.
struct ExitGuard(Inbound);

impl ExitGuard {
    fn finish(self, exit: Exit) {
        self.0
            .inner
            .exit
            .send_replace(Some(exit));
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0
            .inner
            .exit
            .send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(Exit::Closed);
                true
            });
    }
}

impl Inbound {
    /// Dial and authenticate, then start the read loop and the reconnect
    /// supervisor. Handshake failures are returned here and never retried.
    pub async fn run(config: InboundConfig, apps: Applications) -> EslResult<Self> {
        let (conn, reader) = dial(&config, &apps).await?;
        let handle = conn.spawn_reader(reader);
        let (exit, _) = watch::channel(None);
        let inbound = Inbound {
            inner: Arc::new(InboundInner {
                config,
                apps,
                connection: RwLock::new(conn),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                exit,
            }),
        };
        tokio::spawn(
            inbound
                .clone()
                .supervise(handle),
        );
        Ok(inbound)
    }

    async fn supervise(self, mut handle: JoinHandle<DisconnectReason>) {
        let guard = ExitGuard(self.clone());
        let exit = loop {
            let reason = match handle.await {
                Ok(reason) => reason,
                Err(e) => DisconnectReason::IoError(e.to_string()),
            };
            if self.is_closed() {
                break Exit::Closed;
            }
            warn!("[RECONNECT] Connection lost: {}", reason);
            match self
                .reconnect()
                .await
            {
                Ok(Some(next)) => handle = next,
                Ok(None) => break Exit::Closed,
                Err(attempts) => {
                    warn!(
                        "[RECONNECT] Giving up after {} failed attempts",
                        attempts
                    );
                    break Exit::MaxRetries(attempts);
                }
            }
        };
        guard.finish(exit);
    }

    /// Redial until success. `Ok(None)` when closed meanwhile, `Err(n)` when
    /// `n` bounded attempts all failed.
    async fn reconnect(&self) -> Result<Option<JoinHandle<DisconnectReason>>, u32> {
        let config = &self.inner.config;
        let max = config.max_reconnect;
        let mut attempt: u32 = 0;
        while max == 0 || attempt < max {
            if self.is_closed() {
                return Ok(None);
            }
            attempt = attempt.saturating_add(1);
            debug!("[RECONNECT] Attempt {}", attempt);

            match dial(config, &self.inner.apps).await {
                Ok((conn, reader)) => {
                    let handle = conn.spawn_reader(reader);
                    *self
                        .inner
                        .connection
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = conn.clone();
                    // close() sets the flag before reading the slot
                    if self.is_closed() {
                        conn.close();
                        return Ok(Some(handle));
                    }
                    info!("[RECONNECT] Reconnected after {} attempt(s)", attempt);
                    self.notify_reconnect(None)
                        .await;
                    return Ok(Some(handle));
                }
                Err(e) => {
                    warn!("[RECONNECT] Attempt {} failed: {}", attempt, e);
                    self.notify_reconnect(Some(e))
                        .await;
                }
            }

            if max == 0 || attempt < max {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                }
            }
        }
        Err(attempt)
    }

    async fn notify_reconnect(&self, err: Option<EslError>) {
        let Some(on_reconnect) = self
            .inner
            .apps
            .on_reconnect
            .clone()
        else {
            return;
        };
        let notify = async { on_reconnect(self.clone(), err).await };
        if AssertUnwindSafe(notify)
            .catch_unwind()
            .await
            .is_err()
        {
            error!("[RECONNECT] on_reconnect callback panicked");
        }
    }

    /// Resolve when the supervisor stops: `Ok(())` after [`close`](Self::close),
    /// [`EslError::MaxRetries`] when the reconnect budget was exhausted.
    pub async fn wait(&self) -> EslResult<()> {
        let mut rx = self
            .inner
            .exit
            .subscribe();
        let exit = match rx
            .wait_for(Option::is_some)
            .await
        {
            Ok(exit) => *exit,
            Err(_) => Some(Exit::Closed),
        };
        match exit {
            Some(Exit::MaxRetries(attempts)) => Err(EslError::MaxRetries { attempts }),
            _ => Ok(()),
        }
    }

    /// Close the current connection and stop reconnecting. Idempotent.
    pub fn close(&self) {
        if self
            .inner
            .closed
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!(
            "[CLOSE] Closing inbound connection to {}",
            self.inner.config.address
        );
        self.inner
            .shutdown
            .cancel();
        self.connection()
            .close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .closed
            .load(Ordering::SeqCst)
    }

    /// The live connection. Replaced on every successful reconnect, so do
    /// not hold on to it across disconnects.
    pub fn connection(&self) -> Connection {
        self.inner
            .connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &InboundConfig {
        &self.inner.config
    }

    pub async fn command(&self, cmd: &mut Command) -> Reply {
        self.connection()
            .command(cmd)
            .await
    }

    pub async fn api(&self, app: &str, arg: &str) -> Reply {
        self.connection()
            .api(app, arg)
            .await
    }

    pub async fn bgapi(&self, app: &str, arg: &str) -> Reply {
        self.connection()
            .bgapi(app, arg)
            .await
    }

    pub async fn event(&self, arg: &str) -> Reply {
        self.connection()
            .event(arg)
            .await
    }

    /// Run a dialplan application on the call leg `uuid`.
    pub async fn execute(&self, uuid: &str, app: &str, arg: &str) -> Reply {
        self.connection()
            .execute_uuid(uuid, app, arg)
            .await
    }

    /// Hang up the call leg `uuid`. An empty `cause` lets the switch pick
    /// its default.
    pub async fn hangup(&self, uuid: &str, cause: &str) -> Reply {
        self.connection()
            .hangup_uuid(uuid, cause)
            .await
    }

    pub async fn send_raw(&self, line: &str) -> Reply {
        self.connection()
            .send_raw(line)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = InboundConfig::default();
        assert_eq!(config.address, "127.0.0.1:8021");
        assert_eq!(config.password, "ClueCon");
        assert_eq!(config.dial_timeout, Duration::from_secs(2));
        assert_eq!(config.auth_timeout, Duration::from_secs(3));
        assert_eq!(config.max_reconnect, 0);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_config_builders() {
        let config = InboundConfig::new("10.0.0.1:8021", "secret")
            .with_max_reconnect(5)
            .with_reconnect_delay(Duration::from_millis(10))
            .with_dial_timeout(Duration::from_millis(500))
            .with_auth_timeout(Duration::from_secs(1));
        assert_eq!(config.address, "10.0.0.1:8021");
        assert_eq!(config.max_reconnect, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(10));
        assert_eq!(config.dial_timeout, Duration::from_millis(500));
        assert_eq!(config.auth_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let config = InboundConfig::new("10.0.0.1:8021", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_run_fails_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener
            .local_addr()
            .unwrap();
        drop(listener);

        let config = InboundConfig::new(addr.to_string(), "ClueCon");
        let err = Inbound::run(config, Applications::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Io(_)));
    }
}
