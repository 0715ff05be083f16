//! Command encoding and reply classification

use std::fmt;

use crate::constants::{
    COMMAND_POOL_CAPACITY, HEADER_CALL_COMMAND, HEADER_EXECUTE_APP_ARG, HEADER_EXECUTE_APP_NAME,
    HEADER_JOB_UUID, HEADER_LOOPS, HEADER_REPLY_TEXT, HEADER_TERMINATOR, REPLY_ERR, REPLY_OK,
};
use crate::error::{EslError, EslResult};
use crate::headers::HeaderStore;
use crate::message::PooledMessage;
use crate::pool::{Pool, Pooled, Recycle};

static COMMAND_POOL: Pool<Command> = Pool::new(COMMAND_POOL_CAPACITY);

/// Command on loan from the process-wide pool.
pub type PooledCommand = Pooled<Command>;

/// Error returned when parsing an unrecognized command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCommandKindError(pub String);

impl fmt::Display for ParseCommandKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command kind: {}", self.0)
    }
}

impl std::error::Error for ParseCommandKindError {}

define_wire_enum! {
    error_type: ParseCommandKindError,
    /// Which wire form a [`Command`] serializes to.
    pub enum CommandKind {
        /// `sendmsg[ <uuid>]` followed by the argument headers.
        Message => "message",
        /// `api <app> <arg>`
        Api => "api",
        /// `bgapi <app> <arg>`
        Bgapi => "bgapi",
        /// `event <arg>`
        Event => "event",
    }
}

fn validate_no_newlines(s: &[u8], context: &str) -> EslResult<()> {
    if s.contains(&b'\n') || s.contains(&b'\r') {
        return Err(EslError::invalid_command(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// A typed request to the switch.
///
/// Built through chained setters and serialized with [`bytes`](Self::bytes):
///
/// ```
/// use freeswitch_esl_engine::{Command, CommandKind};
///
/// let mut cmd = Command::acquire(CommandKind::Message);
/// cmd.set_uuid("46ca9b34-2bd2-464f-ad0c-082914d264a8")
///     .set_command("execute")
///     .set_app("playback")
///     .set_arg("foo.wav");
/// assert!(cmd.bytes().unwrap().starts_with(b"sendmsg 46ca9b34"));
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    kind: CommandKind,
    uuid: String,
    args: HeaderStore,
    buf: Vec<u8>,
}

impl Default for Command {
    fn default() -> Self {
        Self::new(CommandKind::Message)
    }
}

impl Recycle for Command {
    fn recycle(&mut self) {
        self.kind = CommandKind::Message;
        self.uuid
            .clear();
        self.args
            .reset();
        self.buf
            .clear();
    }
}

impl Command {
    /// Unpooled command, mostly useful in tests.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            uuid: String::new(),
            args: HeaderStore::new(),
            buf: Vec::new(),
        }
    }

    /// Borrow a reset command of the given kind from the pool.
    pub fn acquire(kind: CommandKind) -> PooledCommand {
        let mut cmd = COMMAND_POOL.acquire();
        cmd.kind = kind;
        cmd
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Argument headers (`call-command`, `execute-app-name`, ...).
    pub fn args(&self) -> &HeaderStore {
        &self.args
    }

    /// Address a specific call leg. Outbound sessions leave this unset.
    pub fn set_uuid(&mut self, uuid: &str) -> &mut Self {
        self.uuid
            .clear();
        self.uuid
            .push_str(uuid);
        self
    }

    /// `call-command`: `execute`, `hangup`, `unicast`, `nomedia`, ...
    pub fn set_command(&mut self, command: &str) -> &mut Self {
        self.args
            .add(HEADER_CALL_COMMAND, command);
        self
    }

    /// Dialplan application (or API name for api/bgapi).
    pub fn set_app(&mut self, app: &str) -> &mut Self {
        self.args
            .add(HEADER_EXECUTE_APP_NAME, app);
        self
    }

    /// Application argument. Empty arguments are not sent.
    pub fn set_arg(&mut self, arg: &str) -> &mut Self {
        if !arg.is_empty() {
            self.args
                .add(HEADER_EXECUTE_APP_ARG, arg);
        }
        self
    }

    /// Number of times to run the application.
    pub fn set_loops(&mut self, loops: u32) -> &mut Self {
        self.args
            .add(HEADER_LOOPS, loops.to_string());
        self
    }

    /// Any other header.
    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.args
            .add(key, value);
        self
    }

    /// Serialize into the command's reusable buffer.
    ///
    /// Fails with [`EslError::InvalidCommand`] when a required argument is
    /// missing or any value carries a newline.
    pub fn bytes(&mut self) -> EslResult<&[u8]> {
        validate_no_newlines(
            self.uuid
                .as_bytes(),
            "uuid",
        )?;
        for (key, value) in self
            .args
            .iter()
        {
            validate_no_newlines(key, "header name")?;
            validate_no_newlines(value, "header value")?;
        }

        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let result = self.encode(&mut buf);
        self.buf = buf;
        result?;
        Ok(&self.buf)
    }

    fn encode(&self, dst: &mut Vec<u8>) -> EslResult<()> {
        match self.kind {
            CommandKind::Api | CommandKind::Bgapi => {
                let app = self
                    .args
                    .get_bytes(HEADER_EXECUTE_APP_NAME)
                    .filter(|app| !app.is_empty())
                    .ok_or_else(|| {
                        EslError::invalid_command(format!("{} requires an application", self.kind))
                    })?;
                dst.extend_from_slice(
                    self.kind
                        .as_str()
                        .as_bytes(),
                );
                dst.push(b' ');
                dst.extend_from_slice(app);
                if let Some(arg) = self
                    .args
                    .get_bytes(HEADER_EXECUTE_APP_ARG)
                {
                    dst.push(b' ');
                    dst.extend_from_slice(arg);
                }
                dst.extend_from_slice(HEADER_TERMINATOR.as_bytes());
            }
            CommandKind::Event => {
                let arg = self
                    .args
                    .get_bytes(HEADER_EXECUTE_APP_ARG)
                    .ok_or_else(|| EslError::invalid_command("event requires an argument"))?;
                dst.extend_from_slice(b"event ");
                dst.extend_from_slice(arg);
                dst.extend_from_slice(HEADER_TERMINATOR.as_bytes());
            }
            CommandKind::Message => {
                dst.extend_from_slice(b"sendmsg");
                if !self
                    .uuid
                    .is_empty()
                {
                    dst.push(b' ');
                    dst.extend_from_slice(
                        self.uuid
                            .as_bytes(),
                    );
                }
                dst.push(b'\n');
                self.args
                    .append_bytes(dst);
            }
        }
        Ok(())
    }
}

/// `auth <password>\n\n`
pub(crate) fn encode_auth(password: &str) -> EslResult<Vec<u8>> {
    validate_no_newlines(password.as_bytes(), "password")?;
    Ok(format!("auth {}{}", password, HEADER_TERMINATOR).into_bytes())
}

/// Any single-line command, terminated with a blank line.
pub(crate) fn encode_raw(line: &str) -> EslResult<Vec<u8>> {
    validate_no_newlines(line.as_bytes(), "command")?;
    if line.is_empty() {
        return Err(EslError::invalid_command("command must not be empty"));
    }
    Ok(format!("{}{}", line, HEADER_TERMINATOR).into_bytes())
}

/// Classification of a reply's leading token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// First word is `+OK`.
    Ok,
    /// First word is `-ERR`.
    Err,
    /// Anything else, including an empty reply. Counts as failure.
    Other,
    /// No reply arrived: the command failed at the transport layer.
    Unavailable,
}

impl ReplyStatus {
    fn classify(text: &str) -> Self {
        match text
            .split_whitespace()
            .next()
        {
            Some(REPLY_OK) => ReplyStatus::Ok,
            Some(REPLY_ERR) => ReplyStatus::Err,
            _ => ReplyStatus::Other,
        }
    }
}

/// Result of one command: the reply frame, or the transport error that
/// prevented it.
#[derive(Debug)]
pub struct Reply {
    result: Result<PooledMessage, EslError>,
}

impl Reply {
    pub fn new(message: PooledMessage) -> Self {
        Self {
            result: Ok(message),
        }
    }

    pub fn from_error(error: EslError) -> Self {
        Self { result: Err(error) }
    }

    /// Reply frame, absent on transport failure.
    pub fn message(&self) -> Option<&PooledMessage> {
        self.result
            .as_ref()
            .ok()
    }

    /// Transport or construction error that replaced the reply.
    pub fn transport_error(&self) -> Option<&EslError> {
        self.result
            .as_ref()
            .err()
    }

    /// `Reply-Text`, or the trimmed body when the header is absent
    /// (`api/response` frames carry their result in the body).
    pub fn reply_text(&self) -> Option<&str> {
        let msg = self.message()?;
        if let Some(text) = msg.header(HEADER_REPLY_TEXT) {
            return Some(text.trim());
        }
        std::str::from_utf8(msg.body())
            .ok()
            .map(str::trim)
    }

    pub fn status(&self) -> ReplyStatus {
        match self.reply_text() {
            Some(text) => ReplyStatus::classify(text),
            None if self
                .message()
                .is_some() =>
            {
                ReplyStatus::Other
            }
            None => ReplyStatus::Unavailable,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == ReplyStatus::Ok
    }

    /// Background job id of a `bgapi` reply.
    ///
    /// Read from the `Job-UUID` header, falling back to the
    /// `+OK Job-UUID: <uuid>` reply text.
    pub fn job_uuid(&self) -> Option<&str> {
        let msg = self.message()?;
        if let Some(uuid) = msg.header(HEADER_JOB_UUID) {
            return Some(uuid);
        }
        self.reply_text()?
            .strip_prefix(REPLY_OK)?
            .trim_start()
            .strip_prefix("Job-UUID:")
            .map(str::trim)
    }

    /// `Ok(message)` on `+OK`; the transport error, or
    /// [`EslError::CommandFailed`] with the trimmed reply text, otherwise.
    pub fn into_result(self) -> EslResult<PooledMessage> {
        let status = self.status();
        let reply_text = self
            .reply_text()
            .unwrap_or_default()
            .to_string();
        match (self.result, status) {
            (Err(e), _) => Err(e),
            (Ok(msg), ReplyStatus::Ok) => Ok(msg),
            (Ok(_), _) => Err(EslError::CommandFailed { reply_text }),
        }
    }

    /// The reply frame regardless of its status.
    pub fn into_message(self) -> EslResult<PooledMessage> {
        self.result
    }
}
