//! Parsed protocol frames and nested event payloads.

use crate::constants::{HEADER_CONTENT_TYPE, MESSAGE_POOL_CAPACITY};
use crate::headers::HeaderStore;
use crate::pool::{Pool, Pooled, Recycle};
use crate::protocol::{split_header_line, ContentType};

static MESSAGE_POOL: Pool<Message> = Pool::new(MESSAGE_POOL_CAPACITY);

/// Message on loan from the process-wide pool.
pub type PooledMessage = Pooled<Message>;

/// One frame: headers, raw body, and the start of the inner body once the
/// payload has been decoded.
#[derive(Debug, Default, Clone)]
pub struct Message {
    headers: HeaderStore,
    body: Vec<u8>,
    body_start: usize,
}

impl Recycle for Message {
    fn recycle(&mut self) {
        self.headers
            .reset();
        self.body
            .clear();
        self.body_start = 0;
    }
}

impl Message {
    /// Borrow a reset message from the pool.
    pub fn acquire() -> PooledMessage {
        MESSAGE_POOL.acquire()
    }

    pub fn headers(&self) -> &HeaderStore {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderStore {
        &mut self.headers
    }

    /// Shorthand for `headers().get(key)`.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(HEADER_CONTENT_TYPE)
    }

    /// Recognized content type, `None` when absent or unknown.
    pub fn kind(&self) -> Option<ContentType> {
        self.headers
            .get_bytes(HEADER_CONTENT_TYPE)
            .and_then(ContentType::from_wire)
    }

    /// Raw body bytes as read from the wire.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    /// Offset of the inner body inside [`body`](Self::body). Zero until
    /// [`decode_payload`](Self::decode_payload) has run.
    pub fn body_start(&self) -> usize {
        self.body_start
    }

    /// Inner body of a decoded payload.
    ///
    /// Bounded by the inner `Content-Length` when one was declared, otherwise
    /// everything after the inner header block.
    pub fn inner_body(&self) -> &[u8] {
        let start = self
            .body_start
            .min(
                self.body
                    .len(),
            );
        let rest = &self.body[start..];
        match self
            .headers
            .get("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            Some(length) if length > 0 => &rest[..length.min(rest.len())],
            _ => rest,
        }
    }

    /// Replace the headers with the header block at the front of the body.
    ///
    /// Lines are split exactly as the frame reader splits them and lines
    /// without a colon are skipped. Scanning stops at the first blank line;
    /// [`body_start`](Self::body_start) is set just past it, or to the body
    /// length when the body holds only headers.
    pub fn decode_payload(&mut self) {
        self.headers
            .reset();
        let body = &self.body;
        let mut offset = 0;
        let mut body_start = body.len();
        while offset < body.len() {
            let end = body[offset..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(body.len(), |pos| offset + pos);
            let line = &body[offset..end];
            let next = (end + 1).min(body.len());
            if line.is_empty() {
                body_start = next;
                break;
            }
            if let Some((key, value)) = split_header_line(line) {
                self.headers
                    .add(key, value);
            }
            offset = next;
        }
        self.body_start = body_start;
    }
}
