//! FreeSWITCH Event Socket (ESL) protocol engine for Rust
//!
//! This crate implements both sides of FreeSWITCH's event socket over tokio:
//! an inbound client that dials the switch, authenticates and survives
//! disconnects, and an outbound server that the switch dials once per call leg.
//!
//! # Architecture
//!
//! - [`FrameReader`] splits the byte stream into [`Message`]s using the
//!   `Content-Length` header; event bodies carry a second header block that
//!   [`Message::decode_payload`] unpacks.
//! - [`Connection`] (Clone + Send) owns one socket. Its read loop routes
//!   replies to the single pending command and events to your callbacks.
//! - [`Inbound`] and [`Outbound`] own connection lifecycles.
//!
//! Messages and commands are drawn from process-wide pools and handed out as
//! guards ([`PooledMessage`], [`PooledCommand`]) that return them on drop.
//!
//! Diagnostics are emitted through `tracing`; install a subscriber to see
//! them.
//!
//! # Examples
//!
//! ## Inbound Connection
//!
//! ```rust,no_run
//! use freeswitch_esl_engine::{Applications, EslError, Inbound, InboundConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     let apps = Applications::new()
//!         .on_event(|msg| async move {
//!             println!("event: {}", msg.header("Event-Name").unwrap_or("?"));
//!         })
//!         .on_reconnect(|inbound, err| async move {
//!             if err.is_none() {
//!                 let _ = inbound.event("plain ALL").await;
//!             }
//!         });
//!
//!     let inbound = Inbound::run(InboundConfig::new("127.0.0.1:8021", "ClueCon"), apps).await?;
//!     inbound.event("plain ALL").await.into_result()?;
//!
//!     let status = inbound.api("status", "").await;
//!     println!("{}", status.reply_text().unwrap_or_default());
//!
//!     inbound.close();
//!     inbound.wait().await
//! }
//! ```
//!
//! ## Outbound Mode
//!
//! Configure FreeSWITCH to connect to your app:
//! ```xml
//! <action application="socket" data="127.0.0.1:9090 async full"/>
//! ```
//!
//! ```rust,no_run
//! use freeswitch_esl_engine::{EslError, Outbound, OutboundConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EslError> {
//!     Outbound::new(OutboundConfig::default())
//!         .handler(|conn| async move {
//!             if let Some(info) = conn.info() {
//!                 println!("call from {}", info.header("Caller-Caller-ID-Number").unwrap_or("?"));
//!             }
//!             let _ = conn.execute("answer", "").await;
//!             let _ = conn.execute("playback", "ivr/ivr-welcome.wav").await;
//!             let _ = conn.hangup("NORMAL_CLEARING").await;
//!         })
//!         .serve()
//!         .await
//! }
//! ```

#[macro_use]
mod macros;

pub mod command;
pub mod connection;
pub mod constants;
pub mod error;
pub mod headers;
pub mod inbound;
pub mod message;
pub mod outbound;
pub mod pool;
pub mod protocol;

pub use command::{Command, CommandKind, PooledCommand, Reply, ReplyStatus};
pub use connection::{
    Applications, Connection, ConnectionMode, ConnectionState, DisconnectReason, EventCallback,
    ReconnectCallback,
};
pub use constants::DEFAULT_ESL_PORT;
pub use error::{EslError, EslResult};
pub use headers::HeaderStore;
pub use inbound::{Inbound, InboundConfig};
pub use message::{Message, PooledMessage};
pub use outbound::{Outbound, OutboundConfig, OutboundHandler};
pub use pool::{Pool, Pooled, Recycle};
pub use protocol::{encode_frame, ContentType, FrameReader};
