//! Outbound role: accept switch-initiated sessions

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::connection::{split_tcp, Applications, Connection, ConnectionMode};
use crate::constants::DEFAULT_OUTBOUND_ADDR;
use crate::error::{EslError, EslResult};

/// Per-session handler. Runs concurrently with the session's read loop.
pub type OutboundHandler = Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Settings for [`Outbound`].
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Bind address for the listener.
    pub local_addr: String,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            local_addr: DEFAULT_OUTBOUND_ADDR.to_string(),
        }
    }
}

impl OutboundConfig {
    pub fn with_local_addr(mut self, local_addr: impl Into<String>) -> Self {
        self.local_addr = local_addr.into();
        self
    }
}

/// Server for `socket` dialplan connections, one TCP session per call leg.
///
/// ```no_run
/// use freeswitch_esl_engine::{Outbound, OutboundConfig};
///
/// # async fn example() -> Result<(), freeswitch_esl_engine::EslError> {
/// Outbound::new(OutboundConfig::default().with_local_addr("0.0.0.0:9090"))
///     .handler(|conn| async move {
///         let _ = conn.execute("answer", "").await;
///         let _ = conn.execute("playback", "ivr/ivr-welcome.wav").await;
///         let _ = conn.hangup("").await;
///     })
///     .serve()
///     .await
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Outbound {
    config: OutboundConfig,
    apps: Applications,
    handler: Option<OutboundHandler>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("config", &self.config)
            .field("apps", &self.apps)
            .field(
                "handler",
                &self
                    .handler
                    .is_some(),
            )
            .finish()
    }
}

impl Outbound {
    pub fn new(config: OutboundConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Event and log callbacks attached to every accepted session.
    pub fn apps(mut self, apps: Applications) -> Self {
        self.apps = apps;
        self
    }

    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |conn| f(conn).boxed()));
        self
    }

    /// Bind the configured address and accept sessions forever.
    pub async fn serve(&self) -> EslResult<()> {
        if self
            .handler
            .is_none()
        {
            return Err(EslError::MissingHandler);
        }
        let listener = TcpListener::bind(&self.config.local_addr).await?;
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept sessions on `listener` until `shutdown` resolves. Sessions
    /// already running are left to finish on their own.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> EslResult<()> {
        let handler = self
            .handler
            .clone()
            .ok_or(EslError::MissingHandler)?;
        info!("[OUTBOUND] Listening on {}", listener.local_addr()?);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("[OUTBOUND] Shutdown requested, no longer accepting");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_one(
                            stream,
                            addr,
                            self.apps.clone(),
                            handler.clone(),
                        ));
                    }
                    Err(e) => warn!("[OUTBOUND] Unable to accept new connection: {}", e),
                },
            }
        }
    }
}

async fn handle_one(
    stream: TcpStream,
    addr: SocketAddr,
    apps: Applications,
    handler: OutboundHandler,
) {
    debug!("[OUTBOUND] Accepted connection from {}", addr);
    let (mut reader, writer) = split_tcp(stream);
    let conn = Connection::new(ConnectionMode::Outbound, writer, apps);
    if let Err(e) = conn
        .connect_session(&mut reader)
        .await
    {
        warn!("[OUTBOUND] Handshake with {} failed: {}", addr, e);
        return;
    }
    tokio::spawn(handler(conn.clone()));
    let reason = conn
        .run_reader(reader)
        .await;
    debug!("[OUTBOUND] Session from {} ended: {}", addr, reason);
}
