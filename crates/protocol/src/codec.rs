//! The frame codec itself (§4.A).

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Header-value escape mapping used on the wire: `:` -> `\c`, `\` -> `\\`,
/// CR -> `\r`, LF -> `\n` (the two-character escape sequences, not the raw
/// control bytes).
fn escape_header_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ':' => out.push_str("\\c"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header_value(value: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            _ => return Err(ProtocolError::InvalidEscape),
        }
    }
    Ok(out)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid escape sequence in header value")]
    InvalidEscape,

    #[error("unparseable header line: {0}")]
    MalformedHeader(String),

    #[error("command name is not valid UTF-8")]
    InvalidCommandEncoding,

    #[error("body terminator disagrees with content-length header")]
    ContentLengthMismatch,

    #[error("frame is missing its command line")]
    MissingCommand,
}

/// A parsed wire frame, or a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A single bare `\n` between frames.
    Heartbeat,
    Command(CommandFrame),
}

/// A command frame: verb, headers (order preserved for encode, first value
/// wins on duplicate keys per §4.A), and an optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CommandFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `key`, per the "first value wins" duplicate-header
    /// rule (§4.A).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn push_header_raw(&mut self, key: String, value: String) {
        if self.headers.iter().any(|(k, _)| k == &key) {
            // Duplicate key: first value is retained, later ones ignored,
            // but parsing does not fail (§4.A).
            return;
        }
        self.headers.push((key, value));
    }
}

/// Encodes a frame to its wire representation.
///
/// If the frame carries a body, a `content-length` header is added (unless
/// already present) so the receiver can use binary-safe framing instead of
/// scanning for the NUL terminator.
pub fn encode(frame: &CommandFrame) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(frame.command.as_bytes());
    out.push(b'\n');

    let needs_content_length = !frame.body.is_empty() && frame.header("content-length").is_none();
    if needs_content_length {
        out.extend_from_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
    }
    for (k, v) in &frame.headers {
        out.extend_from_slice(escape_header_value(k).as_bytes());
        out.push(b':');
        out.extend_from_slice(escape_header_value(v).as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    out.extend_from_slice(&frame.body);
    out.push(0);
    out
}

pub fn encode_heartbeat() -> Vec<u8> {
    vec![b'\n']
}

#[derive(Debug, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the command line, skipping leading heartbeat `\n`s.
    Command,
    Headers {
        command: String,
        headers: Vec<(String, String)>,
    },
    Body {
        command: String,
        headers: Vec<(String, String)>,
        content_length: Option<usize>,
    },
}

/// Stateful incremental parser. Feed it arbitrary chunks with [`Self::push`]
/// and drain completed frames with [`Self::next_frame`] until it returns
/// `Ok(None)`.
pub struct FrameDecoder {
    buf: BytesMut,
    state: ParseState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ParseState::Command,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete frame out of the buffer, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match &mut self.state {
                ParseState::Command => {
                    let Some(line_end) = find_byte(&self.buf, b'\n') else {
                        return Ok(None);
                    };
                    let line = self.buf.split_to(line_end);
                    self.buf.advance(1); // consume the \n
                    if line.is_empty() {
                        // Bare \n between frames: heartbeat.
                        return Ok(Some(Frame::Heartbeat));
                    }
                    let command = std::str::from_utf8(&line)
                        .map_err(|_| ProtocolError::InvalidCommandEncoding)?
                        .to_string();
                    self.state = ParseState::Headers {
                        command,
                        headers: Vec::new(),
                    };
                }
                ParseState::Headers { .. } => {
                    let Some(line_end) = find_byte(&self.buf, b'\n') else {
                        return Ok(None);
                    };
                    let line = self.buf.split_to(line_end);
                    self.buf.advance(1);

                    let ParseState::Headers { command, headers } =
                        std::mem::replace(&mut self.state, ParseState::Command)
                    else {
                        unreachable!()
                    };

                    if line.is_empty() {
                        let content_length = headers
                            .iter()
                            .find(|(k, _)| k == "content-length")
                            .map(|(_, v)| {
                                v.parse::<usize>()
                                    .map_err(|_| ProtocolError::MalformedHeader(v.clone()))
                            })
                            .transpose()?;
                        self.state = ParseState::Body {
                            command,
                            headers,
                            content_length,
                        };
                    } else {
                        let text = std::str::from_utf8(&line)
                            .map_err(|_| ProtocolError::InvalidCommandEncoding)?;
                        let mut frame = CommandFrame {
                            command,
                            headers,
                            body: Vec::new(),
                        };
                        let (key, value) = split_header(text)?;
                        frame.push_header_raw(key, value);
                        self.state = ParseState::Headers {
                            command: frame.command,
                            headers: frame.headers,
                        };
                    }
                }
                ParseState::Body {
                    content_length: Some(len),
                    ..
                } => {
                    let len = *len;
                    if self.buf.len() < len + 1 {
                        return Ok(None);
                    }
                    let body = self.buf.split_to(len).to_vec();
                    if self.buf[0] != 0 {
                        return Err(ProtocolError::ContentLengthMismatch);
                    }
                    self.buf.advance(1);
                    let ParseState::Body { command, headers, .. } =
                        std::mem::replace(&mut self.state, ParseState::Command)
                    else {
                        unreachable!()
                    };
                    return Ok(Some(Frame::Command(CommandFrame {
                        command,
                        headers,
                        body,
                    })));
                }
                ParseState::Body {
                    content_length: None,
                    ..
                } => {
                    let Some(nul_pos) = find_byte(&self.buf, 0) else {
                        return Ok(None);
                    };
                    let body = self.buf.split_to(nul_pos).to_vec();
                    self.buf.advance(1);
                    let ParseState::Body { command, headers, .. } =
                        std::mem::replace(&mut self.state, ParseState::Command)
                    else {
                        unreachable!()
                    };
                    return Ok(Some(Frame::Command(CommandFrame {
                        command,
                        headers,
                        body,
                    })));
                }
            }
        }
    }
}

fn find_byte(buf: &BytesMut, needle: u8) -> Option<usize> {
    buf.iter().position(|&b| b == needle)
}

fn split_header(line: &str) -> Result<(String, String), ProtocolError> {
    // The key cannot contain an escaped `:`, so the first unescaped colon
    // is the separator.
    let mut chars = line.char_indices().peekable();
    let mut escaped = false;
    let mut split_at = None;
    for (i, c) in chars.by_ref() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            ':' => {
                split_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    let Some(idx) = split_at else {
        return Err(ProtocolError::MalformedHeader(line.to_string()));
    };
    let key = unescape_header_value(&line[..idx])?;
    let value = unescape_header_value(&line[idx + 1..])?;
    Ok((key, value))
}
