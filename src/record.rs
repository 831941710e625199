//! Capture log record grammar and a lazy tokenizer over it.
//!
//! A capture is a sequence of records. Fields are separated by a horizontal
//! tab and every record ends with a line feed:
//!
//! ```text
//! start\t<source url>\n
//! msg\t<timestamp>\t<channel>\t<payload>\n
//! state\t<channel>\t<payload>\n
//! end\t<timestamp>\n
//! ```
//!
//! Any other leading tag is skipped through the next line feed. The
//! [`Tokenizer`] reads a record in two steps, [`Tokenizer::next_head`] then
//! [`Tokenizer::read_body`], so a caller can stop after seeing a timestamp
//! without consuming the rest of the record. Every byte read (delimiters
//! included) is added to [`Tokenizer::scanned`].
//!
//! Channel and payload of a [`LogRecord`] borrow the tokenizer's buffers and
//! are only valid until the next read; copy them to retain them.
use std::io::{self, BufRead};

use crate::error::ParseError;

pub const FIELD_SEP: u8 = b'\t';
pub const RECORD_END: u8 = b'\n';

pub const TAG_START: &[u8] = b"start";
pub const TAG_MESSAGE: &[u8] = b"msg";
pub const TAG_STATE: &[u8] = b"state";
pub const TAG_END: &[u8] = b"end";

/// What is known about a record after reading its leading fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHead {
    Start,
    /// Tag and timestamp consumed; channel and payload still pending.
    Message { timestamp: i64 },
    State,
    /// Fully consumed.
    End { timestamp: i64 },
    /// Fully consumed (skipped through the line feed).
    Unknown,
}

impl RecordHead {
    /// Timestamp carried by the record, if the grammar has one.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            RecordHead::Message { timestamp } | RecordHead::End { timestamp } => Some(*timestamp),
            _ => None,
        }
    }

    fn has_body(&self) -> bool {
        matches!(self, RecordHead::Start | RecordHead::Message { .. } | RecordHead::State)
    }
}

/// One parsed record. Borrowed fields live until the next tokenizer call.
#[derive(Debug, PartialEq, Eq)]
pub enum LogRecord<'a> {
    Start { source_url: &'a str },
    Message { timestamp: i64, channel: &'a str, payload: &'a [u8] },
    State { channel: &'a str, payload: &'a [u8] },
    End { timestamp: i64 },
    Unknown { raw: &'a [u8] },
}

pub struct Tokenizer<R> {
    reader: R,
    scanned: u64,
    head: Option<RecordHead>,
    body_pending: bool,
    field: Vec<u8>,
    payload: Vec<u8>,
}

impl<R: BufRead> Tokenizer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            scanned: 0,
            head: None,
            body_pending: false,
            field: Vec::with_capacity(64),
            payload: Vec::with_capacity(4096),
        }
    }

    /// Bytes consumed so far, delimiters included.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Read the tag (and timestamp, where the grammar has one) of the next
    /// record. Returns `None` when the stream ends on a record boundary.
    ///
    /// If the body of the previous record was never read it is skipped first.
    pub fn next_head(&mut self) -> Result<Option<RecordHead>, ParseError> {
        if self.body_pending {
            self.skip_line("record")?;
        }
        self.head = None;
        self.body_pending = false;

        self.field.clear();
        let (read, term) = self.read_token(FIELD_SEP, Buf::Field)?;
        let head = match term {
            None if read == 0 => return Ok(None),
            None => return Err(ParseError::Truncated { field: "tag" }),
            // a line without any field separator
            Some(RECORD_END) => RecordHead::Unknown,
            Some(_) => match Tag::of(trim_delim(&self.field)) {
                Tag::Start => RecordHead::Start,
                Tag::State => RecordHead::State,
                Tag::Message => {
                    let timestamp = self.read_timestamp("msg", FIELD_SEP)?;
                    RecordHead::Message { timestamp }
                }
                Tag::End => {
                    let timestamp = self.read_timestamp("end", RECORD_END)?;
                    RecordHead::End { timestamp }
                }
                Tag::Other => {
                    self.skip_line("unknown")?;
                    RecordHead::Unknown
                }
            },
        };
        self.body_pending = head.has_body();
        self.head = Some(head);
        Ok(Some(head))
    }

    /// Read the remaining fields of the record returned by the last
    /// [`next_head`](Self::next_head) call.
    pub fn read_body(&mut self) -> Result<LogRecord<'_>, ParseError> {
        let head = self.head.take().ok_or(ParseError::NoPendingRecord)?;
        self.body_pending = false;
        match head {
            RecordHead::Start => {
                self.field.clear();
                self.read_last_field(Buf::Field, "source url")?;
                let url = trim_delim(&self.field);
                let source_url = std::str::from_utf8(url).map_err(|_| ParseError::Utf8 { field: "source url" })?;
                Ok(LogRecord::Start { source_url })
            }
            RecordHead::Message { timestamp } => {
                self.read_channel_and_payload("msg")?;
                let (channel, payload) = self.channel_and_payload()?;
                Ok(LogRecord::Message { timestamp, channel, payload })
            }
            RecordHead::State => {
                self.read_channel_and_payload("state")?;
                let (channel, payload) = self.channel_and_payload()?;
                Ok(LogRecord::State { channel, payload })
            }
            RecordHead::End { timestamp } => Ok(LogRecord::End { timestamp }),
            RecordHead::Unknown => Ok(LogRecord::Unknown { raw: trim_delim(&self.field) }),
        }
    }

    /// Read one complete record.
    pub fn next_record(&mut self) -> Result<Option<LogRecord<'_>>, ParseError> {
        match self.next_head()? {
            None => Ok(None),
            Some(_) => self.read_body().map(Some),
        }
    }

    fn read_timestamp(&mut self, tag: &'static str, delim: u8) -> Result<i64, ParseError> {
        self.field.clear();
        let (_, term) = self.read_token(delim, Buf::Field)?;
        match term {
            None => return Err(ParseError::Truncated { field: "timestamp" }),
            Some(t) if t != delim => {
                return Err(ParseError::Malformed { tag, reason: "record ends after timestamp" });
            }
            Some(_) => {}
        }
        let digits = trim_delim(&self.field);
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| ParseError::Timestamp(String::from_utf8_lossy(digits).into_owned()))
    }

    fn read_channel_and_payload(&mut self, tag: &'static str) -> Result<(), ParseError> {
        self.field.clear();
        let (_, term) = self.read_token(FIELD_SEP, Buf::Field)?;
        match term {
            None => return Err(ParseError::Truncated { field: "channel" }),
            Some(RECORD_END) => return Err(ParseError::Malformed { tag, reason: "missing payload" }),
            Some(_) => {}
        }
        self.payload.clear();
        self.read_last_field(Buf::Payload, "payload")
    }

    fn channel_and_payload(&self) -> Result<(&str, &[u8]), ParseError> {
        let channel = std::str::from_utf8(trim_delim(&self.field)).map_err(|_| ParseError::Utf8 { field: "channel" })?;
        Ok((channel, trim_delim(&self.payload)))
    }

    fn read_last_field(&mut self, buf: Buf, field: &'static str) -> Result<(), ParseError> {
        match self.read_token(RECORD_END, buf)? {
            (_, Some(_)) => Ok(()),
            (_, None) => Err(ParseError::Truncated { field }),
        }
    }

    fn skip_line(&mut self, field: &'static str) -> Result<(), ParseError> {
        // keep the tag in `field` so an unknown record can expose its raw line
        self.read_last_field(Buf::Field, field)
    }

    /// Append bytes up to and including `delim` or a line feed, whichever
    /// comes first. Returns the byte count and the terminator (`None` at EOF).
    fn read_token(&mut self, delim: u8, buf: Buf) -> Result<(usize, Option<u8>), ParseError> {
        let out = match buf {
            Buf::Field => &mut self.field,
            Buf::Payload => &mut self.payload,
        };
        let mut read = 0usize;
        loop {
            let (used, term) = {
                let available = match self.reader.fill_buf() {
                    Ok(b) => b,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ParseError::Read(e)),
                };
                if available.is_empty() {
                    break;
                }
                match available.iter().position(|&b| b == delim || b == RECORD_END) {
                    Some(i) => {
                        out.extend_from_slice(&available[..=i]);
                        (i + 1, Some(available[i]))
                    }
                    None => {
                        out.extend_from_slice(available);
                        (available.len(), None)
                    }
                }
            };
            self.reader.consume(used);
            read += used;
            self.scanned += used as u64;
            if term.is_some() {
                return Ok((read, term));
            }
        }
        Ok((read, None))
    }
}

#[derive(Clone, Copy)]
enum Tag {
    Start,
    Message,
    State,
    End,
    Other,
}

impl Tag {
    fn of(tag: &[u8]) -> Tag {
        match tag {
            TAG_START => Tag::Start,
            TAG_MESSAGE => Tag::Message,
            TAG_STATE => Tag::State,
            TAG_END => Tag::End,
            _ => Tag::Other,
        }
    }
}

#[derive(Clone, Copy)]
enum Buf {
    Field,
    Payload,
}

fn trim_delim(bytes: &[u8]) -> &[u8] {
    match bytes.last() {
        Some(&FIELD_SEP) | Some(&RECORD_END) => &bytes[..bytes.len() - 1],
        _ => bytes,
    }
}
