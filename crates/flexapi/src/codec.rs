//! SmartSDR TCP line encoding and decoding.
//!
//! The SmartSDR text protocol uses newline-terminated ASCII lines. Commands
//! flow from client to radio; replies, status broadcasts, messages and the
//! handle/version banner flow from radio to client.
//!
//! # Line formats
//!
//! ```text
//! Command:   C[D]<seq>|<command_text>\n
//! Reply:     R<seq>|<hex_code>|<text>[|<debug>]\n
//! Status:    S<hex_handle>|<keyword> <key>=<value> ...\n
//! Message:   M<hex_code>|<text>\n
//! Version:   V<major>.<minor>.<patch>.<build>\n
//! Handle:    H<hex_handle>\n
//! ```
//!
//! Decoding is split in two steps. [`decode_line`] only classifies a line by
//! its leading tag and never fails. The sub-parsers ([`parse_reply`],
//! [`parse_status`], ...) then validate the payload; their errors are
//! logged and the line dropped by the dispatcher. Nothing here performs I/O.

use flexapi_core::{Error, ProtocolVersion, Property, Result};

// ---------------------------------------------------------------------------
// Command encoding
// ---------------------------------------------------------------------------

/// Encode a command with the given sequence number.
///
/// Format: `C<seq>|<command>\n`, or `CD<seq>|<command>\n` for the
/// diagnostic form.
pub fn encode_command(seq: u32, command: &str, diagnostic: bool) -> Vec<u8> {
    let tag = if diagnostic { "CD" } else { "C" };
    format!("{tag}{seq}|{command}\n").into_bytes()
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

/// An inbound line classified by its leading tag. Each variant carries the
/// line with the tag removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Handle(String),
    Message(String),
    Reply(String),
    Status(String),
    Version(String),
    /// Empty lines and unknown tags; carries the whole line.
    Unknown(String),
}

/// Classify one raw line. Trailing `\r`/`\n` are stripped.
pub fn decode_line(raw: &[u8]) -> Line {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\n', '\r']);

    let mut chars = text.chars();
    let Some(tag) = chars.next() else {
        return Line::Unknown(String::new());
    };
    let payload = chars.as_str().to_string();

    match tag {
        'H' => Line::Handle(payload),
        'M' => Line::Message(payload),
        'R' => Line::Reply(payload),
        'S' => Line::Status(payload),
        'V' => Line::Version(payload),
        _ => Line::Unknown(text.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// A reply to a previously sent command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Sequence number of the originating command.
    pub sequence: u32,
    /// Response code exactly as sent (hex digits, `"0"` on success).
    pub code: String,
    /// Numeric value of `code`.
    pub error_code: u32,
    /// Reply text; may be empty.
    pub text: String,
    /// Optional debug text after a fourth `|`.
    pub debug: Option<String>,
}

impl ReplyLine {
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

/// A status broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    /// Handle of the client whose action produced this status.
    pub handle: u32,
    /// First word after the pipe, e.g. `slice`, `client`, `stream`.
    pub keyword: String,
    /// Everything after the keyword.
    pub remainder: String,
    /// `remainder` split into key/value pairs.
    pub properties: Vec<Property>,
    /// `false` when the line carries a removal marker.
    pub in_use: bool,
}

/// An asynchronous message from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLine {
    pub code: u32,
    pub text: String,
}

impl MessageLine {
    pub fn severity(&self) -> Severity {
        Severity::from_code(self.code)
    }
}

/// Severity carried in bits 28-29 of reply and message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn from_code(code: u32) -> Self {
        match (code >> 28) & 0x3 {
            0 => Severity::Info,
            1 => Severity::Warning,
            2 => Severity::Error,
            _ => Severity::Fatal,
        }
    }
}

/// A fully parsed inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Handle(u32),
    Message(MessageLine),
    Reply(ReplyLine),
    Status(StatusLine),
    Version {
        raw: String,
        parsed: Option<ProtocolVersion>,
    },
}

// ---------------------------------------------------------------------------
// Sub-parsers
// ---------------------------------------------------------------------------

/// Parse a line into its typed form.
pub fn parse_line(raw: &[u8]) -> Result<Inbound> {
    match decode_line(raw) {
        Line::Handle(p) => parse_handle(&p).map(Inbound::Handle),
        Line::Message(p) => Ok(Inbound::Message(parse_message(&p))),
        Line::Reply(p) => parse_reply(&p).map(Inbound::Reply),
        Line::Status(p) => parse_status(&p).map(Inbound::Status),
        Line::Version(p) => {
            let (raw, parsed) = parse_version(&p);
            Ok(Inbound::Version { raw, parsed })
        }
        Line::Unknown(line) => Err(Error::Protocol(format!("unrecognized line: {line}"))),
    }
}

/// Parse a handle payload: hex digits, optionally `0x`-prefixed.
pub fn parse_handle(payload: &str) -> Result<u32> {
    parse_hex_u32(payload.trim())
        .ok_or_else(|| Error::Protocol(format!("invalid hex handle: {payload}")))
}

/// Parse a reply payload: `<seq>|<code>|<text>[|<debug>]`.
pub fn parse_reply(payload: &str) -> Result<ReplyLine> {
    let parts: Vec<&str> = payload.splitn(4, '|').collect();
    if parts.len() < 2 {
        return Err(Error::Protocol(format!(
            "malformed reply (need at least seq|code): {payload}"
        )));
    }

    let sequence = parts[0]
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("invalid reply sequence number: {}", parts[0])))?;

    let code = parts[1].trim().to_string();
    let error_code = parse_hex_u32(&code)
        .ok_or_else(|| Error::Protocol(format!("invalid reply code: {code}")))?;

    Ok(ReplyLine {
        sequence,
        code,
        error_code,
        text: parts.get(2).map(|s| s.to_string()).unwrap_or_default(),
        debug: parts.get(3).map(|s| s.to_string()),
    })
}

/// Parse a status payload: `<handle>|<keyword> <remainder>`.
pub fn parse_status(payload: &str) -> Result<StatusLine> {
    let parts: Vec<&str> = payload.splitn(2, '|').collect();
    if parts.len() < 2 {
        return Err(Error::Protocol(format!("malformed status (no pipe): {payload}")));
    }

    let handle = parse_hex_u32(parts[0].trim())
        .ok_or_else(|| Error::Protocol(format!("invalid status handle: {}", parts[0])))?;

    let (keyword, remainder) = parts[1]
        .split_once(' ')
        .ok_or_else(|| Error::Protocol(format!("status without keyword separator: {payload}")))?;
    if keyword.is_empty() {
        return Err(Error::Protocol(format!("status with empty keyword: {payload}")));
    }

    let properties = tokenize_properties(remainder);
    let in_use = is_in_use(remainder, &properties);

    Ok(StatusLine {
        handle,
        keyword: keyword.to_string(),
        remainder: remainder.to_string(),
        properties,
        in_use,
    })
}

/// Parse a message payload: `<code>|<text>`. Never fails; a payload without
/// a valid code is kept whole with code 0.
pub fn parse_message(payload: &str) -> MessageLine {
    match payload.split_once('|') {
        Some((code, text)) => match parse_hex_u32(code.trim()) {
            Some(code) => MessageLine {
                code,
                text: text.to_string(),
            },
            None => MessageLine {
                code: 0,
                text: payload.to_string(),
            },
        },
        None => MessageLine {
            code: 0,
            text: payload.to_string(),
        },
    }
}

/// Parse a version payload. The raw text is always kept.
pub fn parse_version(payload: &str) -> (String, Option<ProtocolVersion>) {
    let raw = payload.trim().to_string();
    let parsed = raw.parse().ok();
    (raw, parsed)
}

/// Split a status remainder into key/value pairs on whitespace.
///
/// A token without `=` becomes `(token, "")`.
pub fn tokenize_properties(text: &str) -> Vec<Property> {
    text.split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (token.to_string(), String::new()),
        })
        .collect()
}

/// `false` when a status remainder marks its object as gone: `in_use=0` or
/// a bare `removed` token.
pub fn is_in_use(remainder: &str, properties: &[Property]) -> bool {
    if remainder.contains("in_use=0") {
        return false;
    }
    !properties
        .iter()
        .any(|(k, v)| v.is_empty() && k.eq_ignore_ascii_case("removed"))
}

/// Parse a hex number with an optional `0x` prefix.
pub fn parse_hex_u32(s: &str) -> Option<u32> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
