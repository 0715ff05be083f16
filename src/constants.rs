//! Protocol constants and configuration values

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Default inbound address (`event_socket.conf.xml` ships with this listener)
pub const DEFAULT_INBOUND_ADDR: &str = "127.0.0.1:8021";

/// Default inbound password
pub const DEFAULT_PASSWORD: &str = "ClueCon";

/// Default bind address for the outbound server
pub const DEFAULT_OUTBOUND_ADDR: &str = "0.0.0.0:9090";

/// Socket buffer size for reading from TCP stream (64KB) - standard TCP receive window
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum single message size (8MB) - validates Content-Length header
/// No legitimate ESL message should exceed this (largest is sofia status ~1-2MB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Blank line ending a header block
pub const HEADER_TERMINATOR: &str = "\n\n";

/// Content-Type header values
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";
/// Sent instead of `auth/request` when the peer address is rejected by the ACL.
pub const CONTENT_TYPE_RUDE_REJECTION: &str = "text/rude-rejection";
pub const CONTENT_TYPE_LOG_DATA: &str = "log/data";

/// Protocol framing header names.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";
/// Disconnect notice disposition (`linger` keeps the socket open).
pub const HEADER_CONTENT_DISPOSITION: &str = "Content-Disposition";
/// Background job correlation id returned by `bgapi`.
pub const HEADER_JOB_UUID: &str = "Job-UUID";

/// `sendmsg` argument header names
pub const HEADER_CALL_COMMAND: &str = "call-command";
pub const HEADER_EXECUTE_APP_NAME: &str = "execute-app-name";
pub const HEADER_EXECUTE_APP_ARG: &str = "execute-app-arg";
pub const HEADER_LOOPS: &str = "loops";
pub const HEADER_HANGUP_CAUSE: &str = "hangup-cause";

/// Reply-Text success / failure tokens
pub const REPLY_OK: &str = "+OK";
pub const REPLY_ERR: &str = "-ERR";

/// First command written on an accepted outbound socket
pub const OUTBOUND_CONNECT: &str = "connect\n\n";

/// Connection timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Bound on the inbound authentication handshake in milliseconds
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 3000;

/// Fixed delay between two reconnect attempts in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

/// Idle instances kept by the message and command pools
pub const MESSAGE_POOL_CAPACITY: usize = 256;
pub const COMMAND_POOL_CAPACITY: usize = 64;
