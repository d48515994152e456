//! Incremental session document parser.
//!
//! Bytes are pushed in with [`SessionEventParser::feed`] as they arrive and
//! structural events are pulled out with [`SessionEventParser::next_event`].
//! Only the bytes of the value currently being scanned are buffered; each
//! chapter's raw bytes are dropped as soon as its event is produced, so memory
//! tracks the largest chapter rather than the whole document.

use std::io::Read;

use serde_json::{Map, Value};

use crate::error::ImportError;
use crate::formats::{SessionMetadata, is_supported_format};

const READ_CHUNK_BYTES: usize = 64 * 1024;
const SHRINK_ABOVE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Metadata(SessionMetadata),
    Chapter { index: usize, value: Value },
    /// Top-level members other than `metadata` and `chapters`.
    Done { trailing: Map<String, Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Root,
    FirstKey,
    NextKey,
    Key,
    AfterKey,
    MemberValue,
    AfterMember,
    FirstChapter,
    Chapter,
    AfterChapter,
    Trailer,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Container,
    String,
    Scalar,
}

/// Resumable position inside a value whose end has not been seen yet.
#[derive(Debug, Clone, Copy)]
struct ValueScan {
    kind: ScanKind,
    cursor: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

#[derive(Debug)]
pub struct SessionEventParser {
    buf: Vec<u8>,
    pos: usize,
    discarded: u64,
    scan: Option<ValueScan>,
    state: State,
    eof: bool,
    key: Option<String>,
    metadata_seen: bool,
    chapter_index: usize,
    trailing: Map<String, Value>,
    peak_buffered: usize,
}

impl Default for SessionEventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            discarded: 0,
            scan: None,
            state: State::Root,
            eof: false,
            key: None,
            metadata_seen: false,
            chapter_index: 0,
            trailing: Map::new(),
            peak_buffered: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(chunk);
        self.peak_buffered = self.peak_buffered.max(self.buf.len());
    }

    /// Marks the end of input; incomplete values become parse errors.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished | State::Failed)
    }

    /// Bytes currently held, including the partially scanned value.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn peak_buffered(&self) -> usize {
        self.peak_buffered
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.discarded
    }

    /// Returns the next event, or `Ok(None)` when more input is needed or the
    /// document is finished (see [`Self::is_finished`]).
    pub fn next_event(&mut self) -> Result<Option<SessionEvent>, ImportError> {
        if self.state == State::Failed {
            return Err(ImportError::Parse {
                offset: self.offset(self.pos),
                detail: "parser stopped after an earlier error".to_owned(),
            });
        }
        let result = self.advance();
        if result.is_err() {
            self.state = State::Failed;
            self.buf = Vec::new();
            self.pos = 0;
            self.scan = None;
        }
        result
    }

    fn advance(&mut self) -> Result<Option<SessionEvent>, ImportError> {
        loop {
            match self.state {
                State::Finished | State::Failed => return Ok(None),
                State::Root => {
                    let Some(byte) = self.peek_significant()? else {
                        return Ok(None);
                    };
                    if byte != b'{' {
                        return Err(self.syntax_error("session document must be a JSON object"));
                    }
                    self.pos += 1;
                    self.state = State::FirstKey;
                }
                State::FirstKey | State::NextKey => {
                    let Some(byte) = self.peek_significant()? else {
                        return Ok(None);
                    };
                    match byte {
                        b'"' => self.state = State::Key,
                        b'}' if self.state == State::FirstKey => {
                            self.pos += 1;
                            self.state = State::Trailer;
                        }
                        _ => return Err(self.syntax_error("expected an object key")),
                    }
                }
                State::Key => {
                    let Some((start, end)) = self.scan_value()? else {
                        return Ok(None);
                    };
                    let key: String = serde_json::from_slice(&self.buf[start..end])
                        .map_err(|err| self.json_error(start, &err))?;
                    self.key = Some(key);
                    self.state = State::AfterKey;
                }
                State::AfterKey => {
                    let Some(byte) = self.peek_significant()? else {
                        return Ok(None);
                    };
                    if byte != b':' {
                        return Err(self.syntax_error("expected ':' after object key"));
                    }
                    self.pos += 1;
                    self.state = State::MemberValue;
                }
                State::MemberValue => {
                    let Some(byte) = self.peek_significant()? else {
                        return Ok(None);
                    };
                    if byte == b'[' && self.scan.is_none() && self.key.as_deref() == Some("chapters")
                    {
                        self.pos += 1;
                        self.key = None;
                        self.state = State::FirstChapter;
                        continue;
                    }
                    let Some((start, end)) = self.scan_value()? else {
                        return Ok(None);
                    };
                    let value: Value = serde_json::from_slice(&self.buf[start..end])
                        .map_err(|err| self.json_error(start, &err))?;
                    let key = self.key.take().unwrap_or_default();
                    self.state = State::AfterMember;
                    if let Some(event) = self.on_member(key, value, start)? {
                        return Ok(Some(event));
                    }
                }
                State::AfterMember => {
                    let Some(byte) = self.peek_significant()? else {
                        return Ok(None);
                    };
                    match byte {
                        b',' => {
                            self.pos += 1;
                            self.state = State::NextKey;
                        }
                        b'}' => {
                            self.pos += 1;
                            self.state = State::Trailer;
                        }
                        _ => return Err(self.syntax_error("expected ',' or '}' after member")),
                    }
                }
                State::FirstChapter => {
                    let Some(byte) = self.peek_significant()? else {
                        return Ok(None);
                    };
                    if byte == b']' {
                        self.pos += 1;
                        self.state = State::AfterMember;
                    } else {
                        self.state = State::Chapter;
                    }
                }
                State::Chapter => {
                    if self.peek_significant()?.is_none() {
                        return Ok(None);
                    }
                    let Some((start, end)) = self.scan_value()? else {
                        return Ok(None);
                    };
                    let value: Value = serde_json::from_slice(&self.buf[start..end])
                        .map_err(|err| self.json_error(start, &err))?;
                    let index = self.chapter_index;
                    self.chapter_index += 1;
                    self.state = State::AfterChapter;
                    self.compact();
                    return Ok(Some(SessionEvent::Chapter { index, value }));
                }
                State::AfterChapter => {
                    let Some(byte) = self.peek_significant()? else {
                        return Ok(None);
                    };
                    match byte {
                        b',' => {
                            self.pos += 1;
                            self.state = State::Chapter;
                        }
                        b']' => {
                            self.pos += 1;
                            self.state = State::AfterMember;
                        }
                        _ => return Err(self.syntax_error("expected ',' or ']' between chapters")),
                    }
                }
                State::Trailer => {
                    self.skip_whitespace();
                    if self.pos < self.buf.len() {
                        return Err(self.syntax_error("unexpected data after session document"));
                    }
                    if !self.eof {
                        return Ok(None);
                    }
                    if !self.metadata_seen {
                        return Err(ImportError::MissingMetadata);
                    }
                    self.state = State::Finished;
                    self.compact();
                    let trailing = std::mem::take(&mut self.trailing);
                    return Ok(Some(SessionEvent::Done { trailing }));
                }
            }
        }
    }

    fn on_member(
        &mut self,
        key: String,
        value: Value,
        start: usize,
    ) -> Result<Option<SessionEvent>, ImportError> {
        match key.as_str() {
            "metadata" => {
                if self.metadata_seen {
                    tracing::debug!("ignoring duplicate metadata member");
                    return Ok(None);
                }
                let metadata = metadata_from_value(&value)?;
                self.metadata_seen = true;
                Ok(Some(SessionEvent::Metadata(metadata)))
            }
            "chapters" if value.is_null() => Ok(None),
            "chapters" => Err(ImportError::Parse {
                offset: self.offset(start),
                detail: "`chapters` must be an array".to_owned(),
            }),
            _ => {
                self.trailing.insert(key, value);
                Ok(None)
            }
        }
    }

    /// Skips whitespace and returns the next byte without consuming it.
    fn peek_significant(&mut self) -> Result<Option<u8>, ImportError> {
        if self.scan.is_none() {
            self.skip_whitespace();
        }
        match self.buf.get(self.pos) {
            Some(byte) => Ok(Some(*byte)),
            None if self.eof => Err(self.syntax_error("unexpected end of session document")),
            None => Ok(None),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(byte) = self.buf.get(self.pos) {
            if !matches!(byte, b' ' | b'\n' | b'\r' | b'\t') {
                break;
            }
            self.pos += 1;
        }
    }

    /// Finds the end of the value starting at `pos`, resuming an earlier
    /// partial scan. On completion `pos` moves past the value.
    fn scan_value(&mut self) -> Result<Option<(usize, usize)>, ImportError> {
        let start = self.pos;
        let mut scan = match self.scan.take() {
            Some(scan) => scan,
            None => {
                let Some(&first) = self.buf.get(start) else {
                    return Ok(None);
                };
                match first {
                    b'{' | b'[' => ValueScan {
                        kind: ScanKind::Container,
                        cursor: start + 1,
                        depth: 1,
                        in_string: false,
                        escaped: false,
                    },
                    b'"' => ValueScan {
                        kind: ScanKind::String,
                        cursor: start + 1,
                        depth: 0,
                        in_string: true,
                        escaped: false,
                    },
                    _ => ValueScan {
                        kind: ScanKind::Scalar,
                        cursor: start,
                        depth: 0,
                        in_string: false,
                        escaped: false,
                    },
                }
            }
        };

        let end = match scan.kind {
            ScanKind::Scalar => {
                let mut end = None;
                while let Some(&byte) = self.buf.get(scan.cursor) {
                    if matches!(byte, b',' | b'}' | b']' | b' ' | b'\n' | b'\r' | b'\t') {
                        end = Some(scan.cursor);
                        break;
                    }
                    scan.cursor += 1;
                }
                match end {
                    Some(end) => Some(end),
                    None if self.eof => Some(scan.cursor),
                    None => None,
                }
            }
            ScanKind::Container | ScanKind::String => {
                let mut end = None;
                while let Some(&byte) = self.buf.get(scan.cursor) {
                    scan.cursor += 1;
                    if scan.in_string {
                        if scan.escaped {
                            scan.escaped = false;
                        } else if byte == b'\\' {
                            scan.escaped = true;
                        } else if byte == b'"' {
                            scan.in_string = false;
                            if scan.kind == ScanKind::String {
                                end = Some(scan.cursor);
                                break;
                            }
                        }
                        continue;
                    }
                    match byte {
                        b'"' => scan.in_string = true,
                        b'{' | b'[' => scan.depth += 1,
                        b'}' | b']' => {
                            scan.depth -= 1;
                            if scan.depth == 0 {
                                end = Some(scan.cursor);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                end
            }
        };

        match end {
            Some(end) => {
                self.pos = end;
                Ok(Some((start, end)))
            }
            None if self.eof => Err(self.syntax_error("unexpected end of session document")),
            None => {
                self.scan = Some(scan);
                Ok(None)
            }
        }
    }

    /// Drops bytes that are already consumed.
    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.discarded += self.pos as u64;
            if let Some(scan) = self.scan.as_mut() {
                scan.cursor -= self.pos;
            }
            self.pos = 0;
        }
        if self.buf.capacity() > SHRINK_ABOVE_BYTES && self.buf.len() < self.buf.capacity() / 4 {
            self.buf.shrink_to(self.buf.len().max(READ_CHUNK_BYTES));
        }
    }

    fn offset(&self, index: usize) -> u64 {
        self.discarded + index as u64
    }

    fn syntax_error(&self, detail: &str) -> ImportError {
        ImportError::Parse {
            offset: self.offset(self.pos),
            detail: detail.to_owned(),
        }
    }

    fn json_error(&self, start: usize, err: &serde_json::Error) -> ImportError {
        ImportError::Parse {
            offset: self.offset(start),
            detail: err.to_string(),
        }
    }
}

/// Validates and decodes a `metadata` object.
pub fn metadata_from_value(value: &Value) -> Result<SessionMetadata, ImportError> {
    let Some(format) = value.get("format").and_then(Value::as_str) else {
        return Err(ImportError::InvalidFormat {
            found: String::new(),
        });
    };
    if !is_supported_format(format) {
        return Err(ImportError::InvalidFormat {
            found: format.to_owned(),
        });
    }
    serde_json::from_value(value.clone()).map_err(|err| ImportError::Parse {
        offset: 0,
        detail: format!("metadata: {err}"),
    })
}

/// Pull-based event sequence over a blocking reader.
pub struct SessionEvents<R> {
    reader: R,
    parser: SessionEventParser,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> SessionEvents<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: SessionEventParser::new(),
            chunk: vec![0; READ_CHUNK_BYTES],
            done: false,
        }
    }

    pub fn parser(&self) -> &SessionEventParser {
        &self.parser
    }
}

impl<R: Read> Iterator for SessionEvents<R> {
    type Item = Result<SessionEvent, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.parser.next_event() {
                Ok(Some(event)) => {
                    if matches!(event, SessionEvent::Done { .. }) {
                        self.done = true;
                    }
                    return Some(Ok(event));
                }
                Ok(None) if self.parser.is_finished() => {
                    self.done = true;
                    return None;
                }
                Ok(None) => match self.reader.read(&mut self.chunk) {
                    Ok(0) => self.parser.finish(),
                    Ok(n) => self.parser.feed(&self.chunk[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(source) => {
                        self.done = true;
                        return Some(Err(ImportError::Io {
                            what: "session stream".to_owned(),
                            source,
                        }));
                    }
                },
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
