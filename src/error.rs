//! Error types for the ESL engine

/// Errors produced by framing, handshakes, command issuance and the
/// reconnect supervisor.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EslError {
    /// Socket read/write failure, including a body truncated before its
    /// declared length.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream cleanly between two frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// A command was issued on a connection that is not (or no longer) ready.
    #[error("not connected")]
    NotConnected,

    /// Dial or authentication handshake did not complete in time.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The switch answered with `text/rude-rejection` (ACL rejected our address).
    #[error("access denied, please check acl config")]
    AccessDenied,

    /// The `auth` command was answered with anything but `+OK`.
    #[error("authentication failed: {reply_text}")]
    AuthFailed { reply_text: String },

    /// A handshake frame carried an unexpected content type.
    #[error("unexpected content type during handshake: {content_type:?}")]
    UnexpectedContentType { content_type: String },

    /// A header value could not be coerced to an integer.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// The declared body length exceeds the framing guard.
    #[error("message too large: Content-Length {size} exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// The command could not be serialized (missing argument, embedded newline).
    #[error("invalid command: {reason}")]
    InvalidCommand { reason: String },

    /// The switch replied `-ERR ...` (or an unrecognized reply) to a command.
    #[error("esl: failed to execute command: {reply_text}")]
    CommandFailed { reply_text: String },

    /// Every attempt of a bounded reconnect budget failed.
    #[error("a series of reconnect attempts have failed ({attempts} attempts)")]
    MaxRetries { attempts: u32 },

    /// `Outbound` was served without a connection handler.
    #[error("outbound handler is not set")]
    MissingHandler,
}

/// Result alias used throughout the crate.
pub type EslResult<T> = Result<T, EslError>;

impl EslError {
    pub(crate) fn auth_failed(reply_text: impl Into<String>) -> Self {
        EslError::AuthFailed {
            reply_text: reply_text.into(),
        }
    }

    pub(crate) fn invalid_command(reason: impl Into<String>) -> Self {
        EslError::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// `true` for failures of the socket itself, which end the current
    /// connection and trigger reconnect (inbound) or teardown (outbound).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EslError::Io(_) | EslError::ConnectionClosed | EslError::NotConnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = EslError::CommandFailed {
            reply_text: "-ERR event Command not found!".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "esl: failed to execute command: -ERR event Command not found!"
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(EslError::ConnectionClosed.is_transport());
        let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(EslError::from(broken).is_transport());
        assert!(!EslError::AccessDenied.is_transport());
        assert!(!EslError::auth_failed("-ERR invalid").is_transport());
    }

    #[test]
    fn test_max_retries_display() {
        let err = EslError::MaxRetries { attempts: 3 };
        assert!(err
            .to_string()
            .contains("3 attempts"));
    }
}
