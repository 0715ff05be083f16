//! Frame reader: splits a byte stream into header blocks and bodies.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{trace, warn};

use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
    CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_LOG_DATA, CONTENT_TYPE_RUDE_REJECTION,
    CONTENT_TYPE_TEXT_EVENT_PLAIN, MAX_MESSAGE_SIZE, SOCKET_BUF_SIZE,
};
use crate::error::{EslError, EslResult};
use crate::headers::HeaderStore;
use crate::message::{Message, PooledMessage};

/// Error returned when parsing an unrecognized Content-Type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseContentTypeError(pub String);

impl std::fmt::Display for ParseContentTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown content type: {}", self.0)
    }
}

impl std::error::Error for ParseContentTypeError {}

define_wire_enum! {
    error_type: ParseContentTypeError,
    /// Frame classification by `Content-Type`.
    pub enum ContentType {
        AuthRequest => CONTENT_TYPE_AUTH_REQUEST,
        CommandReply => CONTENT_TYPE_COMMAND_REPLY,
        ApiResponse => CONTENT_TYPE_API_RESPONSE,
        EventPlain => CONTENT_TYPE_TEXT_EVENT_PLAIN,
        DisconnectNotice => CONTENT_TYPE_DISCONNECT_NOTICE,
        RudeRejection => CONTENT_TYPE_RUDE_REJECTION,
        LogData => CONTENT_TYPE_LOG_DATA,
    }
}

impl ContentType {
    /// `true` for frames that answer a command.
    pub fn is_reply(&self) -> bool {
        matches!(self, ContentType::CommandReply | ContentType::ApiResponse)
    }
}

/// Split one header line (terminator already stripped) into key and value.
///
/// The key is everything before the first colon. One space after the colon
/// is skipped. Returns `None` for lines without a colon.
pub(crate) fn split_header_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line
        .iter()
        .position(|&b| b == b':')?;
    let key = &line[..colon];
    let rest = &line[colon + 1..];
    let value = rest
        .strip_prefix(b" ")
        .unwrap_or(rest);
    Some((key, value))
}

/// Serialize a frame: the header block followed by `body`.
///
/// The caller is responsible for a matching `Content-Length` header.
pub fn encode_frame(headers: &HeaderStore, body: &[u8], dst: &mut Vec<u8>) {
    headers.append_bytes(dst);
    dst.extend_from_slice(body);
}

/// Reads frames from a buffered stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(SOCKET_BUF_SIZE, inner),
            line: Vec::with_capacity(256),
        }
    }

    /// Read the next frame into a pooled message.
    ///
    /// End of stream before the first byte of a frame yields
    /// [`EslError::ConnectionClosed`]; end of stream inside a frame is an I/O
    /// error.
    pub async fn read_message(&mut self) -> EslResult<PooledMessage> {
        let mut msg = Message::acquire();
        self.read_into(&mut msg)
            .await?;
        Ok(msg)
    }

    /// Read the next frame into `msg`, which is expected to be reset.
    pub async fn read_into(&mut self, msg: &mut Message) -> EslResult<()> {
        let mut started = false;
        loop {
            self.line
                .clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.line)
                .await?;
            if n == 0 {
                if started {
                    return Err(truncated());
                }
                return Err(EslError::ConnectionClosed);
            }
            started = true;
            let Some(line) = self
                .line
                .strip_suffix(b"\n")
            else {
                return Err(truncated());
            };

            match split_header_line(line) {
                Some((key, value)) => msg
                    .headers_mut()
                    .add(key, value),
                None => trace!(
                    "[FRAME] skipping header line without colon: {:?}",
                    String::from_utf8_lossy(line)
                ),
            }

            let peek = self
                .reader
                .fill_buf()
                .await?;
            if peek.first() == Some(&b'\n') {
                self.reader
                    .consume(1);
                break;
            }
        }

        let length = match msg
            .headers_mut()
            .content_length()
        {
            Ok(length) => length,
            Err(e) => {
                warn!("[FRAME] {}, reading no body", e);
                0
            }
        };
        if length > MAX_MESSAGE_SIZE {
            return Err(EslError::MessageTooLarge {
                size: length,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        if length > 0 {
            let body = msg.body_mut();
            body.clear();
            body.resize(length, 0);
            self.reader
                .read_exact(&mut body[..])
                .await?;
        }
        Ok(())
    }

    /// Release the underlying stream.
    pub fn into_inner(self) -> R {
        self.reader
            .into_inner()
    }
}

fn truncated() -> EslError {
    EslError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "stream ended inside a frame",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn parse(input: &[u8]) -> EslResult<PooledMessage> {
        FrameReader::new(input)
            .read_message()
            .await
    }

    #[test]
    fn test_content_type_parse() {
        assert_eq!(
            "command/reply"
                .parse::<ContentType>()
                .unwrap(),
            ContentType::CommandReply
        );
        assert_eq!(
            "text/rude-rejection"
                .parse::<ContentType>()
                .unwrap(),
            ContentType::RudeRejection
        );
        assert!("Command/Reply"
            .parse::<ContentType>()
            .is_err());
        assert_eq!(ContentType::EventPlain.to_string(), "text/event-plain");
        assert!(ContentType::ApiResponse.is_reply());
        assert!(!ContentType::LogData.is_reply());
    }

    #[test]
    fn test_content_type_from_wire() {
        for kind in ContentType::ALL {
            assert_eq!(ContentType::from_wire(kind.as_str().as_bytes()), Some(*kind));
        }
        assert_eq!(ContentType::ALL.len(), 7);
        assert_eq!(ContentType::from_wire(b"text/event-json"), None);
        assert_eq!(ContentType::from_wire(b""), None);
    }

    #[test]
    fn test_split_header_line() {
        assert_eq!(
            split_header_line(b"Reply-Text: +OK accepted"),
            Some((&b"Reply-Text"[..], &b"+OK accepted"[..]))
        );
        assert_eq!(
            split_header_line(b"User-Data: "),
            Some((&b"User-Data"[..], &b""[..]))
        );
        assert_eq!(
            split_header_line(b"Event-Date-GMT: Sun, 20 Dec 2020 04:58:17 GMT"),
            Some((&b"Event-Date-GMT"[..], &b"Sun, 20 Dec 2020 04:58:17 GMT"[..]))
        );
        assert_eq!(split_header_line(b"no delimiter here"), None);
    }

    #[tokio::test]
    async fn test_parse_command_reply() {
        let msg = parse(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
            .await
            .unwrap();
        assert_eq!(msg.content_type(), Some("command/reply"));
        assert_eq!(msg.header("Reply-Text"), Some("+OK accepted"));
        assert!(msg
            .body()
            .is_empty());
    }

    #[tokio::test]
    async fn test_parse_log_data() {
        let input = b"Content-Type: log/data\nContent-Length: 57\nLog-Level: 7\nUser-Data: \n\n2020-11-08 09:57:16.712466 [DEBUG] mod_commands.c:6391 2\n";
        let msg = parse(input)
            .await
            .unwrap();

        let mut expected = HeaderStore::new();
        expected.add("Content-Type", "log/data");
        expected.add("Content-Length", "57");
        expected.add("Log-Level", "7");
        expected.add("User-Data", "");
        assert_eq!(msg.headers(), &expected);
        assert_eq!(
            msg.body(),
            b"2020-11-08 09:57:16.712466 [DEBUG] mod_commands.c:6391 2\n"
        );
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let input: &[u8] = b"Content-Type: auth/request\n\nContent-Type: api/response\nContent-Length: 3\n\nabcContent-Type: text/disconnect-notice\n\n";
        let mut reader = FrameReader::new(input);

        let first = reader
            .read_message()
            .await
            .unwrap();
        assert_eq!(first.content_type(), Some("auth/request"));

        let second = reader
            .read_message()
            .await
            .unwrap();
        assert_eq!(second.content_type(), Some("api/response"));
        assert_eq!(second.body(), b"abc");

        let third = reader
            .read_message()
            .await
            .unwrap();
        assert_eq!(third.content_type(), Some("text/disconnect-notice"));

        assert!(matches!(
            reader
                .read_message()
                .await,
            Err(EslError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_line_without_colon_is_skipped() {
        let msg = parse(b"Content-Type: command/reply\nthis line is malformed\nReply-Text: +OK\n\n")
            .await
            .unwrap();
        assert_eq!(
            msg.headers()
                .len(),
            2
        );
        assert_eq!(msg.header("Reply-Text"), Some("+OK"));
    }

    #[tokio::test]
    async fn test_invalid_content_length_reads_no_body() {
        let input: &[u8] =
            b"Content-Type: api/response\nContent-Length: lots\n\nContent-Type: command/reply\n\n";
        let mut reader = FrameReader::new(input);

        let first = reader
            .read_message()
            .await
            .unwrap();
        assert!(first
            .body()
            .is_empty());
        let second = reader
            .read_message()
            .await
            .unwrap();
        assert_eq!(second.content_type(), Some("command/reply"));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let err = parse(b"Content-Type: api/response\nContent-Length: 10\n\nshort")
            .await
            .unwrap_err();
        match err {
            EslError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_inside_header_block() {
        let err = parse(b"Content-Type: command/reply\nReply-Te")
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Io(_)));

        let err = parse(b"Content-Type: command/reply\n")
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Io(_)));
    }

    #[tokio::test]
    async fn test_clean_eof() {
        assert!(matches!(
            parse(b"").await,
            Err(EslError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_content_length_rejected() {
        let input = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_MESSAGE_SIZE + 1
        );
        let err = parse(input.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_round_trip_over_split_writes() {
        let body = b"+OK 3 bytes of \x00binary\xff data\n";
        let mut headers = HeaderStore::new();
        headers.add("Content-Type", "api/response");
        headers.add("Content-Length", body.len().to_string());
        headers.add("X-Dup", "one");
        headers.add("X-Dup", "two");
        let mut wire = Vec::new();
        encode_frame(&headers, body, &mut wire);

        let (mut tx, rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            for chunk in wire.chunks(5) {
                tx.write_all(chunk)
                    .await
                    .unwrap();
            }
        });

        let mut reader = FrameReader::new(rx);
        let msg = reader
            .read_message()
            .await
            .unwrap();
        writer
            .await
            .unwrap();

        assert_eq!(msg.headers(), &headers);
        assert_eq!(msg.body(), body);
    }
}
