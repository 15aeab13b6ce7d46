//! Incremental decoder for transactional endpoint response bodies.
//!
//! The body is scanned byte by byte with a stack of open containers. Only
//! the subtrees that become events (column lists, rows, errors, the expiry
//! notice, and the commit location) are buffered, and each buffer is
//! released as soon as its event is emitted. Everything else is skipped
//! without being retained, so memory stays proportional to the largest
//! single row.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Number, Value};

use cypherstream_core::{EngineError, ResponseEvent};

/// Which member of a `data` entry carries the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowFormat {
    /// Plain values (`"row"`).
    #[default]
    Row,
    /// Values with identity/label envelopes (`"rest"`).
    Rest,
}

impl RowFormat {
    pub fn for_metadata(metadata: bool) -> Self {
        if metadata {
            Self::Rest
        } else {
            Self::Row
        }
    }

    /// Both the `data` member name and the `resultDataContents` entry.
    pub fn key(self) -> &'static str {
        match self {
            Self::Row => "row",
            Self::Rest => "rest",
        }
    }
}

/// Extract the transaction id from a resource location such as
/// `http://host/db/data/transaction/42` or `.../transaction/42/commit`.
pub fn transaction_id_from_location(location: &str) -> Option<String> {
    let path = location.trim_end_matches('/');
    let path = path.strip_suffix("/commit").unwrap_or(path);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_owned)
}

#[derive(Debug)]
enum Frame {
    Object { key: Option<String> },
    Array { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Value,
    ArrayStart,
    ObjectStart,
    Key,
    InKey { escaped: bool },
    Colon,
    InString { escaped: bool },
    Literal,
    AfterValue,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Result(usize),
    Commit,
    Expires,
    Error,
    Columns,
    Row(usize),
}

#[derive(Debug)]
struct Capture {
    target: Target,
    depth: usize,
    buf: Vec<u8>,
}

#[derive(Deserialize)]
struct ServerError {
    code: String,
    message: String,
}

/// Push parser turning response bytes into [`ResponseEvent`]s.
#[derive(Debug)]
pub struct ResponseParser {
    formats: Vec<RowFormat>,
    stack: Vec<Frame>,
    lex: Lex,
    key: Vec<u8>,
    literal: Vec<u8>,
    capture: Option<Capture>,
    failed: bool,
}

impl ResponseParser {
    /// `formats[i]` is the row format requested for statement `i`.
    pub fn new(formats: Vec<RowFormat>) -> Self {
        Self {
            formats,
            stack: Vec::new(),
            lex: Lex::Value,
            key: Vec::new(),
            literal: Vec::new(),
            capture: None,
            failed: false,
        }
    }

    /// Consume the next chunk and return the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ResponseEvent>, EngineError> {
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < chunk.len() {
            if self.step(chunk[offset], &mut events)? {
                offset += 1;
            }
        }
        Ok(events)
    }

    /// Signal end of body. Yields `Done` if the document was complete.
    pub fn finish(&mut self) -> Result<Vec<ResponseEvent>, EngineError> {
        match self.lex {
            Lex::End => Ok(vec![ResponseEvent::Done]),
            Lex::Value if self.stack.is_empty() => Err(EngineError::protocol("empty response body")),
            _ => Err(EngineError::protocol(
                "response body ended before the document was complete",
            )),
        }
    }

    /// Returns whether `byte` was consumed; a literal's terminator is not.
    fn step(&mut self, byte: u8, events: &mut Vec<ResponseEvent>) -> Result<bool, EngineError> {
        match self.lex {
            Lex::InString { escaped } => {
                self.record(byte);
                if escaped {
                    self.lex = Lex::InString { escaped: false };
                } else if byte == b'\\' {
                    self.lex = Lex::InString { escaped: true };
                } else if byte == b'"' {
                    self.complete_value(events)?;
                }
                Ok(true)
            }
            Lex::InKey { escaped } => {
                self.record(byte);
                if escaped {
                    self.key.push(byte);
                    self.lex = Lex::InKey { escaped: false };
                } else if byte == b'\\' {
                    self.key.push(byte);
                    self.lex = Lex::InKey { escaped: true };
                } else if byte == b'"' {
                    self.finish_key()?;
                    self.lex = Lex::Colon;
                } else {
                    self.key.push(byte);
                }
                Ok(true)
            }
            Lex::Literal => {
                if matches!(byte, b',' | b'}' | b']') || byte.is_ascii_whitespace() {
                    check_literal(&self.literal)?;
                    self.complete_value(events)?;
                    Ok(false)
                } else {
                    self.record(byte);
                    self.literal.push(byte);
                    Ok(true)
                }
            }
            _ if byte.is_ascii_whitespace() => {
                self.record(byte);
                Ok(true)
            }
            Lex::Value => {
                self.begin_value(byte, events)?;
                Ok(true)
            }
            Lex::ArrayStart => {
                if byte == b']' {
                    self.record(byte);
                    self.close(byte, events)?;
                } else {
                    self.begin_value(byte, events)?;
                }
                Ok(true)
            }
            Lex::ObjectStart | Lex::Key => {
                if byte == b'"' {
                    self.record(byte);
                    self.key.clear();
                    self.lex = Lex::InKey { escaped: false };
                } else if byte == b'}' && self.lex == Lex::ObjectStart {
                    self.record(byte);
                    self.close(byte, events)?;
                } else {
                    return Err(unexpected(byte, "an object key"));
                }
                Ok(true)
            }
            Lex::Colon => {
                if byte != b':' {
                    return Err(unexpected(byte, "':'"));
                }
                self.record(byte);
                self.lex = Lex::Value;
                Ok(true)
            }
            Lex::AfterValue => {
                match byte {
                    b',' => {
                        self.record(byte);
                        match self.stack.last_mut() {
                            Some(Frame::Object { .. }) => self.lex = Lex::Key,
                            Some(Frame::Array { index }) => {
                                *index += 1;
                                self.lex = Lex::Value;
                            }
                            None => return Err(unexpected(byte, "end of document")),
                        }
                    }
                    b'}' | b']' => {
                        self.record(byte);
                        self.close(byte, events)?;
                    }
                    _ => return Err(unexpected(byte, "',' or a closing bracket")),
                }
                Ok(true)
            }
            Lex::End => Err(EngineError::protocol(
                "unexpected data after the response document",
            )),
        }
    }

    fn record(&mut self, byte: u8) {
        if let Some(capture) = &mut self.capture {
            capture.buf.push(byte);
        }
    }

    fn begin_value(&mut self, byte: u8, events: &mut Vec<ResponseEvent>) -> Result<(), EngineError> {
        if self.stack.is_empty() {
            if byte != b'{' {
                return Err(EngineError::protocol("response body is not a JSON object"));
            }
        } else if self.capture.is_none() {
            self.check_shape(byte)?;
            match self.target() {
                Some(Target::Result(index)) => {
                    if !self.failed {
                        events.push(ResponseEvent::ResultBoundary(index));
                    }
                }
                Some(target) => {
                    self.capture = Some(Capture {
                        target,
                        depth: self.stack.len(),
                        buf: Vec::new(),
                    });
                }
                None => {}
            }
        }

        self.record(byte);
        match byte {
            b'{' => {
                self.stack.push(Frame::Object { key: None });
                self.lex = Lex::ObjectStart;
            }
            b'[' => {
                self.stack.push(Frame::Array { index: 0 });
                self.lex = Lex::ArrayStart;
            }
            b'"' => self.lex = Lex::InString { escaped: false },
            b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => {
                self.literal.clear();
                self.literal.push(byte);
                self.lex = Lex::Literal;
            }
            _ => return Err(unexpected(byte, "a JSON value")),
        }
        Ok(())
    }

    fn check_shape(&self, byte: u8) -> Result<(), EngineError> {
        use Frame::{Array, Object};

        match self.stack.as_slice() {
            [Object { key: Some(k) }] if (k == "results" || k == "errors") && byte != b'[' => {
                Err(EngineError::protocol(format!("`{k}` must be an array")))
            }
            [Object { key: Some(k) }, Array { .. }] if k == "results" && byte != b'{' => {
                Err(EngineError::protocol("result entries must be objects"))
            }
            [Object { key: Some(k) }, Array { .. }, Object { key: Some(d) }]
                if k == "results" && d == "data" && byte != b'[' =>
            {
                Err(EngineError::protocol("`data` must be an array"))
            }
            [Object { key: Some(k) }, Array { .. }, Object { key: Some(d) }, Array { .. }]
                if k == "results" && d == "data" && byte != b'{' =>
            {
                Err(EngineError::protocol("data entries must be objects"))
            }
            _ => Ok(()),
        }
    }

    /// What the value starting at the current position means, judged from
    /// the path of enclosing containers.
    fn target(&self) -> Option<Target> {
        use Frame::{Array, Object};

        match self.stack.as_slice() {
            [Object { key: Some(k) }] if k == "commit" => Some(Target::Commit),
            [Object { key: Some(k) }, Array { .. }] if k == "errors" => Some(Target::Error),
            [Object { key: Some(k) }, Array { index }] if k == "results" => {
                Some(Target::Result(*index))
            }
            [Object { key: Some(k) }, Object { key: Some(e) }] if k == "transaction" && e == "expires" => {
                Some(Target::Expires)
            }
            [Object { key: Some(k) }, Array { .. }, Object { key: Some(c) }] if k == "results" && c == "columns" => {
                Some(Target::Columns)
            }
            [Object { key: Some(k) }, Array { index }, Object { key: Some(d) }, Array { .. }, Object { key: Some(r) }]
                if k == "results" && d == "data" && r == self.row_key(*index) =>
            {
                Some(Target::Row(*index))
            }
            _ => None,
        }
    }

    fn row_key(&self, result: usize) -> &'static str {
        self.formats.get(result).copied().unwrap_or_default().key()
    }

    fn finish_key(&mut self) -> Result<(), EngineError> {
        // Paths inside a captured subtree are never consulted.
        let key = if self.capture.is_some() {
            None
        } else {
            Some(decode_key(&self.key)?)
        };
        if let Some(Frame::Object { key: slot }) = self.stack.last_mut() {
            *slot = key;
        }
        self.key.clear();
        Ok(())
    }

    fn close(&mut self, byte: u8, events: &mut Vec<ResponseEvent>) -> Result<(), EngineError> {
        match (self.stack.pop(), byte) {
            (Some(Frame::Object { .. }), b'}') | (Some(Frame::Array { .. }), b']') => {
                self.complete_value(events)
            }
            _ => Err(EngineError::protocol("mismatched closing bracket")),
        }
    }

    fn complete_value(&mut self, events: &mut Vec<ResponseEvent>) -> Result<(), EngineError> {
        let depth = self.stack.len();
        if self.capture.as_ref().is_some_and(|c| c.depth == depth) {
            if let Some(capture) = self.capture.take() {
                self.emit(capture, events)?;
            }
        }
        self.lex = if self.stack.is_empty() {
            Lex::End
        } else {
            Lex::AfterValue
        };
        Ok(())
    }

    fn emit(&mut self, capture: Capture, events: &mut Vec<ResponseEvent>) -> Result<(), EngineError> {
        let buf = capture.buf;
        match capture.target {
            Target::Commit => {
                let location: String = parse(&buf, "commit location")?;
                if let Some(id) = transaction_id_from_location(&location) {
                    events.push(ResponseEvent::TransactionLocation(id));
                }
            }
            Target::Expires => {
                let raw: String = parse(&buf, "transaction expiry")?;
                match parse_expiry(&raw) {
                    Some(deadline) => events.push(ResponseEvent::ExpiryNotice(deadline)),
                    None => tracing::warn!(expires = %raw, "Ignoring unparseable transaction expiry"),
                }
            }
            Target::Error => {
                let error: ServerError = parse(&buf, "error entry")?;
                if self.failed {
                    tracing::debug!(code = %error.code, "Suppressing additional statement error");
                } else {
                    self.failed = true;
                    events.push(ResponseEvent::StatementError {
                        code: error.code,
                        message: error.message,
                    });
                }
            }
            Target::Columns => {
                let columns: Vec<String> = parse(&buf, "column list")?;
                if !self.failed {
                    events.push(ResponseEvent::ColumnList(columns));
                }
            }
            Target::Row(result) => {
                let Value::Array(values) = decode_tree(&buf)? else {
                    return Err(EngineError::protocol("malformed row: not an array"));
                };
                if !self.failed {
                    events.push(ResponseEvent::RowData { result, values });
                }
            }
            Target::Result(_) => {}
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(buf: &[u8], what: &str) -> Result<T, EngineError> {
    serde_json::from_slice(buf).map_err(|e| EngineError::protocol(format!("malformed {what}: {e}")))
}

/// Rebuild a captured subtree with an explicit stack, so row nesting is
/// bounded by memory rather than the decoder's recursion limit. The scanner
/// has already matched brackets and checked literals.
fn decode_tree(buf: &[u8]) -> Result<Value, EngineError> {
    enum Open {
        Array(Vec<Value>),
        Object(Map<String, Value>, Option<String>),
    }

    let mut stack: Vec<Open> = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let byte = buf[pos];
        let value = match byte {
            b'[' => {
                stack.push(Open::Array(Vec::new()));
                pos += 1;
                continue;
            }
            b'{' => {
                stack.push(Open::Object(Map::new(), None));
                pos += 1;
                continue;
            }
            b']' | b'}' => {
                pos += 1;
                match stack.pop() {
                    Some(Open::Array(items)) => Value::Array(items),
                    Some(Open::Object(members, _)) => Value::Object(members),
                    None => return Err(EngineError::protocol("malformed row: unbalanced brackets")),
                }
            }
            b'"' => {
                let end = string_end(buf, pos)?;
                let text: String = parse(&buf[pos..end], "string")?;
                pos = end;
                if let Some(Open::Object(_, key)) = stack.last_mut() {
                    if key.is_none() {
                        *key = Some(text);
                        continue;
                    }
                }
                Value::String(text)
            }
            b',' | b':' => {
                pos += 1;
                continue;
            }
            _ if byte.is_ascii_whitespace() => {
                pos += 1;
                continue;
            }
            _ => {
                let end = buf[pos..]
                    .iter()
                    .position(|b| matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace())
                    .map_or(buf.len(), |len| pos + len);
                let literal: Value = parse(&buf[pos..end], "literal")?;
                pos = end;
                literal
            }
        };

        match stack.last_mut() {
            Some(Open::Array(items)) => items.push(value),
            Some(Open::Object(members, key)) => match key.take() {
                Some(key) => {
                    members.insert(key, value);
                }
                None => return Err(EngineError::protocol("malformed row: member without a key")),
            },
            None => return Ok(value),
        }
    }
    Err(EngineError::protocol("malformed row: value ended early"))
}

/// Index just past the quote closing the string that opens at `start`.
fn string_end(buf: &[u8], start: usize) -> Result<usize, EngineError> {
    let mut escaped = false;
    for (offset, &byte) in buf[start + 1..].iter().enumerate() {
        if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            return Ok(start + offset + 2);
        }
    }
    Err(EngineError::protocol("malformed row: unterminated string"))
}

fn check_literal(raw: &[u8]) -> Result<(), EngineError> {
    let valid = match raw {
        b"true" | b"false" | b"null" => true,
        [b'-' | b'0'..=b'9', ..] => serde_json::from_slice::<Number>(raw).is_ok(),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::protocol(format!(
            "invalid literal `{}` in response body",
            String::from_utf8_lossy(raw)
        )))
    }
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|deadline| deadline.with_timezone(&Utc))
}

fn decode_key(raw: &[u8]) -> Result<String, EngineError> {
    if !raw.contains(&b'\\') {
        return String::from_utf8(raw.to_vec())
            .map_err(|_| EngineError::protocol("object key is not valid UTF-8"));
    }
    let mut quoted = Vec::with_capacity(raw.len() + 2);
    quoted.push(b'"');
    quoted.extend_from_slice(raw);
    quoted.push(b'"');
    parse(&quoted, "object key")
}

fn unexpected(byte: u8, expected: &str) -> EngineError {
    EngineError::protocol(format!(
        "unexpected {:?} in response body, expected {expected}",
        char::from(byte)
    ))
}
