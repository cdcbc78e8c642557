//! HTTP/1.1 header processor
//!
//! Incremental parser for the header section of a request or response.
//! Bytes are fed in whatever pieces the transport delivers them; the
//! processor buffers partial lines and reports completion once the blank
//! line ending the header section has been seen. Output does not depend on
//! how the input was split.
//!
//! Lines are decoded as Latin-1 when fields are extracted, so any byte
//! sequence survives the round trip to the forwarded header.

use super::error::{MitmError, Result};
use bytes::{Bytes, BytesMut};

/// Default bound on the size of one header section
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Whether a processor parses request or response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// `METHOD RESOURCE PROTOCOL`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub resource: String,
    pub protocol: String,
}

impl RequestLine {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// `PROTOCOL CODE [REASON]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub protocol: String,
    pub status_code: u16,
    pub reason: String,
}

impl StatusLine {
    /// 1xx, 204 and 304 responses never carry a body
    pub fn forbids_body(&self) -> bool {
        (100..200).contains(&self.status_code)
            || self.status_code == 204
            || self.status_code == 304
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request(RequestLine),
    Status(StatusLine),
}

/// Ordered multimap of header fields
///
/// Values are grouped under their name in the order the name was first seen;
/// within a name they keep arrival order. Names keep their received spelling,
/// so `Host` and `host` are separate groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    groups: Vec<(String, Vec<String>)>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.groups.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value.into()),
            None => self.groups.push((name, vec![value.into()])),
        }
    }

    /// Values stored under exactly `name`
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Values stored under any ASCII-case spelling of `name`
    pub fn get_ignore_case(&self, name: &str) -> Vec<&str> {
        self.groups
            .iter()
            .filter(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    /// Every `(name, value)` pair in multimap order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.groups.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Distinct names, first-seen order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(name, _)| name.as_str())
    }

    /// Number of field lines
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, values)| values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The value when `name` (any case) occurs exactly once
    fn single(&self, name: &str) -> Option<&str> {
        match self.get_ignore_case(name).as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }
}

/// A fully parsed header section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMessage {
    pub start_line: StartLine,
    pub fields: HeaderFields,
    /// Set when Content-Length occurs once and is an unsigned integer
    pub content_length: Option<u64>,
    /// Set when Transfer-Encoding occurs once with value `chunked`
    pub chunked: bool,
    /// Set when Connection or Proxy-Connection occurs once with value `keep-alive`
    pub keep_alive: bool,
    /// Bytes that arrived after the blank line
    pub body_prefix: Bytes,
}

impl HeaderMessage {
    pub fn request_line(&self) -> Option<&RequestLine> {
        match &self.start_line {
            StartLine::Request(line) => Some(line),
            StartLine::Status(_) => None,
        }
    }

    pub fn status_line(&self) -> Option<&StatusLine> {
        match &self.start_line {
            StartLine::Status(line) => Some(line),
            StartLine::Request(_) => None,
        }
    }
}

/// Incremental header section parser
#[derive(Debug)]
pub struct HeaderProcessor {
    kind: MessageKind,
    max_header_bytes: usize,
    /// Bytes not yet split into lines
    pending: BytesMut,
    /// Header bytes already split into lines
    consumed: usize,
    seen_line: bool,
    start_line: Option<StartLine>,
    fields: HeaderFields,
    message: Option<HeaderMessage>,
}

impl HeaderProcessor {
    pub fn new(kind: MessageKind) -> Self {
        Self::with_limit(kind, DEFAULT_MAX_HEADER_BYTES)
    }

    pub fn with_limit(kind: MessageKind, max_header_bytes: usize) -> Self {
        Self {
            kind,
            max_header_bytes,
            pending: BytesMut::new(),
            consumed: 0,
            seen_line: false,
            start_line: None,
            fields: HeaderFields::new(),
            message: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Feed the next bytes of the stream
    ///
    /// Returns `Ok(true)` once the header section is complete. Bytes fed
    /// after completion are appended to the leading body bytes.
    pub fn feed(&mut self, data: &[u8]) -> Result<bool> {
        if let Some(message) = self.message.as_mut() {
            let mut body = BytesMut::from(&message.body_prefix[..]);
            body.extend_from_slice(data);
            message.body_prefix = body.freeze();
            return Ok(true);
        }

        self.pending.extend_from_slice(data);

        loop {
            let Some(end) = find_crlf(&self.pending) else {
                if self.consumed + self.pending.len() > self.max_header_bytes {
                    return Err(self.oversized());
                }
                return Ok(false);
            };

            let line = self.pending.split_to(end + CRLF.len());
            self.consumed += line.len();
            if self.consumed > self.max_header_bytes {
                return Err(self.oversized());
            }

            let line = &line[..end];
            let first_line = !self.seen_line;
            self.seen_line = true;

            if line.is_empty() {
                // One leading CRLF is tolerated
                if first_line {
                    continue;
                }
                self.finish()?;
                return Ok(true);
            }

            let text = latin1(line);
            match self.start_line {
                None => self.start_line = Some(self.parse_start_line(&text)?),
                Some(_) => self.parse_field(&text)?,
            }
        }
    }

    /// Whether the header section is complete
    pub fn is_complete(&self) -> bool {
        self.message.is_some()
    }

    pub fn message(&self) -> Option<&HeaderMessage> {
        self.message.as_ref()
    }

    pub fn into_message(self) -> Option<HeaderMessage> {
        self.message
    }

    fn finish(&mut self) -> Result<()> {
        let start_line = self
            .start_line
            .take()
            .ok_or_else(|| MitmError::protocol("header section ended before a start line"))?;

        let fields = std::mem::take(&mut self.fields);

        let content_length = fields
            .single("Content-Length")
            .and_then(|value| value.parse::<u64>().ok());
        let chunked = fields
            .single("Transfer-Encoding")
            .is_some_and(|value| value.eq_ignore_ascii_case("chunked"));
        let keep_alive = ["Connection", "Proxy-Connection"].iter().any(|name| {
            fields
                .single(name)
                .is_some_and(|value| value.eq_ignore_ascii_case("keep-alive"))
        });

        self.message = Some(HeaderMessage {
            start_line,
            fields,
            content_length,
            chunked,
            keep_alive,
            body_prefix: self.pending.split().freeze(),
        });

        Ok(())
    }

    fn parse_start_line(&self, line: &str) -> Result<StartLine> {
        match self.kind {
            MessageKind::Request => parse_request_line(line).map(StartLine::Request),
            MessageKind::Response => parse_status_line(line).map(StartLine::Status),
        }
    }

    fn parse_field(&mut self, line: &str) -> Result<()> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MitmError::protocol(format!("header line without colon: {:?}", line)))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(MitmError::protocol(format!(
                "header line with empty name: {:?}",
                line
            )));
        }

        self.fields.append(name, value.trim());
        Ok(())
    }

    fn oversized(&self) -> MitmError {
        MitmError::protocol(format!(
            "header section exceeds {} bytes",
            self.max_header_bytes
        ))
    }
}

/// Split at the first and last space
pub fn parse_request_line(line: &str) -> Result<RequestLine> {
    let malformed = || MitmError::protocol(format!("malformed request line: {:?}", line));

    let first = line.find(' ').ok_or_else(malformed)?;
    let last = line.rfind(' ').ok_or_else(malformed)?;
    if first == 0 || first == last {
        return Err(malformed());
    }

    Ok(RequestLine {
        method: line[..first].to_string(),
        resource: line[first + 1..last].to_string(),
        protocol: line[last + 1..].to_string(),
    })
}

/// `protocol SP code SP reason`, reason may be empty but its separator is required
pub fn parse_status_line(line: &str) -> Result<StatusLine> {
    let malformed = || MitmError::protocol(format!("malformed status line: {:?}", line));

    let mut parts = line.splitn(3, ' ');
    let protocol = parts.next().filter(|p| !p.is_empty()).ok_or_else(malformed)?;
    let status_code = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(malformed)?;
    let reason = parts.next().ok_or_else(malformed)?;

    Ok(StatusLine {
        protocol: protocol.to_string(),
        status_code,
        reason: reason.to_string(),
    })
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(CRLF.len()).position(|window| window == CRLF)
}

/// Every byte maps to the code point of the same value
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`latin1`]; characters above U+00FF become `?`
pub fn latin1_bytes(text: &str) -> impl Iterator<Item = u8> + '_ {
    text.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
}
