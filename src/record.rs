//! Elastic binary encoding of a key's lifecycle record.
//!
//! Every entry starts with the 32-byte key and a one-byte type tag. What
//! follows depends only on the tag:
//!
//! | class     | types           | body                                   | total |
//! |-----------|-----------------|----------------------------------------|-------|
//! | `Bare`    | Nothing, Known  | -                                      | 33    |
//! | `Stamped` | Error*          | time (7)                               | 40    |
//! | `Located` | File*, Redirect | time (7), position (8), length (4), hash (32) | 84 |
//!
//! All integers are little endian. Time is seconds since the epoch truncated
//! to 56 bits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::key::{Key, KEY_LEN};

pub const TIME_BYTES: usize = 7;
pub const TIME_MASK: u64 = (1 << (TIME_BYTES * 8)) - 1;
pub const HEADER_LEN: usize = KEY_LEN + 1;
/// Shortest possible entry. Anything shorter at the tail is an unfinished append.
pub const MIN_RECORD_LEN: usize = HEADER_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Corrupt record log at byte {offset}: {reason}")]
    CorruptLog { offset: usize, reason: String },
}

/// Closed set of record tags. File tags live in `0x10..=0x7f`, error tags in `0x80..=0xff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    Nothing = 0x00,
    Known = 0x01,
    Redirect = 0x02,
    FileRobots = 0x10,
    FileHtml = 0x11,
    FileRss = 0x12,
    FileSitemap = 0x13,
    FileFavicon = 0x14,
    ErrorNetwork = 0xf0,
    ErrorParsing = 0xf1,
    ErrorFilterUrl = 0xf2,
    ErrorFilterPage = 0xf3,
}

impl RecordType {
    pub const ALL: [RecordType; 12] = [
        RecordType::Nothing,
        RecordType::Known,
        RecordType::Redirect,
        RecordType::FileRobots,
        RecordType::FileHtml,
        RecordType::FileRss,
        RecordType::FileSitemap,
        RecordType::FileFavicon,
        RecordType::ErrorNetwork,
        RecordType::ErrorParsing,
        RecordType::ErrorFilterUrl,
        RecordType::ErrorFilterPage,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }

    pub const fn length_class(self) -> LengthClass {
        match self {
            RecordType::Nothing | RecordType::Known => LengthClass::Bare,
            RecordType::ErrorNetwork
            | RecordType::ErrorParsing
            | RecordType::ErrorFilterUrl
            | RecordType::ErrorFilterPage => LengthClass::Stamped,
            RecordType::Redirect
            | RecordType::FileRobots
            | RecordType::FileHtml
            | RecordType::FileRss
            | RecordType::FileSitemap
            | RecordType::FileFavicon => LengthClass::Located,
        }
    }

    pub const fn is_file(self) -> bool {
        matches!(self.tag(), 0x10..=0x7f)
    }

    pub const fn is_error(self) -> bool {
        self.tag() >= 0x80
    }

    pub const fn name(self) -> &'static str {
        match self {
            RecordType::Nothing => "nothing",
            RecordType::Known => "known",
            RecordType::Redirect => "redirect",
            RecordType::FileRobots => "file-robots",
            RecordType::FileHtml => "file-html",
            RecordType::FileRss => "file-rss",
            RecordType::FileSitemap => "file-sitemap",
            RecordType::FileFavicon => "file-favicon",
            RecordType::ErrorNetwork => "error-network",
            RecordType::ErrorParsing => "error-parsing",
            RecordType::ErrorFilterUrl => "error-filter-url",
            RecordType::ErrorFilterPage => "error-filter-page",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// On-disk size family of a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthClass {
    Bare,
    Stamped,
    Located,
}

impl LengthClass {
    /// Bytes following the key and tag.
    pub const fn body_len(self) -> usize {
        match self {
            LengthClass::Bare => 0,
            LengthClass::Stamped => TIME_BYTES,
            LengthClass::Located => TIME_BYTES + 8 + 4 + KEY_LEN,
        }
    }

    pub const fn encoded_len(self) -> usize {
        HEADER_LEN + self.body_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Robots,
    Html,
    Rss,
    Sitemap,
    Favicon,
}

impl FileKind {
    const fn record_type(self) -> RecordType {
        match self {
            FileKind::Robots => RecordType::FileRobots,
            FileKind::Html => RecordType::FileHtml,
            FileKind::Rss => RecordType::FileRss,
            FileKind::Sitemap => RecordType::FileSitemap,
            FileKind::Favicon => RecordType::FileFavicon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Parsing,
    FilterUrl,
    FilterPage,
}

impl ErrorKind {
    const fn record_type(self) -> RecordType {
        match self {
            ErrorKind::Network => RecordType::ErrorNetwork,
            ErrorKind::Parsing => RecordType::ErrorParsing,
            ErrorKind::FilterUrl => RecordType::ErrorFilterUrl,
            ErrorKind::FilterPage => RecordType::ErrorFilterPage,
        }
    }
}

/// Lifecycle state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// Tombstone. Replaying it removes the key.
    Nothing,
    /// Discovered and queued, outcome not yet known.
    Known,
    Redirect { time: u64, target: Key },
    File {
        kind: FileKind,
        time: u64,
        position: u64,
        length: u32,
        hash: Key,
    },
    Error { kind: ErrorKind, time: u64 },
}

impl Record {
    pub fn redirect(target: Key) -> Self {
        Record::Redirect { time: now_time(), target }
    }

    pub fn file(kind: FileKind, position: u64, length: u32, hash: Key) -> Self {
        Record::File {
            kind,
            time: now_time(),
            position,
            length,
            hash,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Record::Error { kind, time: now_time() }
    }

    pub const fn record_type(&self) -> RecordType {
        match self {
            Record::Nothing => RecordType::Nothing,
            Record::Known => RecordType::Known,
            Record::Redirect { .. } => RecordType::Redirect,
            Record::File { kind, .. } => kind.record_type(),
            Record::Error { kind, .. } => kind.record_type(),
        }
    }

    pub const fn time(&self) -> Option<u64> {
        match self {
            Record::Nothing | Record::Known => None,
            Record::Redirect { time, .. }
            | Record::File { time, .. }
            | Record::Error { time, .. } => Some(*time),
        }
    }

    /// True once the key reached a final outcome and must not be fetched again.
    pub const fn is_resolved(&self) -> bool {
        !matches!(self, Record::Nothing | Record::Known)
    }

    pub const fn encoded_len(&self) -> usize {
        self.record_type().length_class().encoded_len()
    }
}

/// Current time in seconds, truncated to the on-disk width.
pub fn now_time() -> u64 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    secs & TIME_MASK
}

pub fn encode(key: &Key, record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record.encoded_len());
    encode_into(&mut buf, key, record);
    buf
}

pub fn encode_into(buf: &mut Vec<u8>, key: &Key, record: &Record) {
    buf.extend_from_slice(key.as_bytes());
    buf.push(record.record_type().tag());
    match record {
        Record::Nothing | Record::Known => {}
        Record::Error { time, .. } => put_time(buf, *time),
        // Redirects have no payload; position and length stay zero.
        Record::Redirect { time, target } => {
            put_time(buf, *time);
            buf.extend_from_slice(&0u64.to_le_bytes());
            buf.extend_from_slice(&0u32.to_le_bytes());
            buf.extend_from_slice(target.as_bytes());
        }
        Record::File {
            time,
            position,
            length,
            hash,
            ..
        } => {
            put_time(buf, *time);
            buf.extend_from_slice(&position.to_le_bytes());
            buf.extend_from_slice(&length.to_le_bytes());
            buf.extend_from_slice(hash.as_bytes());
        }
    }
}

fn put_time(buf: &mut Vec<u8>, time: u64) {
    buf.extend_from_slice(&(time & TIME_MASK).to_le_bytes()[..TIME_BYTES]);
}

/// Decode a single entry from the front of `buf`, returning it and its length.
pub fn decode_one(buf: &[u8]) -> Result<(Key, Record, usize), CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(corrupt(0, format!("{} bytes is shorter than a record header", buf.len())));
    }

    let mut raw_key = [0u8; KEY_LEN];
    raw_key.copy_from_slice(&buf[..KEY_LEN]);
    let key = Key::from_raw(raw_key);

    let tag = buf[KEY_LEN];
    let record_type =
        RecordType::from_tag(tag).ok_or_else(|| corrupt(KEY_LEN, format!("unknown type tag {:#04x}", tag)))?;
    let class = record_type.length_class();
    let total = class.encoded_len();
    if buf.len() < total {
        return Err(corrupt(
            0,
            format!("{} record needs {} bytes, {} available", record_type, total, buf.len()),
        ));
    }

    let body = &buf[HEADER_LEN..total];
    let record = match record_type {
        RecordType::Nothing => Record::Nothing,
        RecordType::Known => Record::Known,
        RecordType::Redirect => {
            let located = Located::read(body);
            Record::Redirect {
                time: located.time,
                target: located.hash,
            }
        }
        RecordType::FileRobots => Located::read(body).into_file(FileKind::Robots),
        RecordType::FileHtml => Located::read(body).into_file(FileKind::Html),
        RecordType::FileRss => Located::read(body).into_file(FileKind::Rss),
        RecordType::FileSitemap => Located::read(body).into_file(FileKind::Sitemap),
        RecordType::FileFavicon => Located::read(body).into_file(FileKind::Favicon),
        RecordType::ErrorNetwork => stamped_error(ErrorKind::Network, body),
        RecordType::ErrorParsing => stamped_error(ErrorKind::Parsing, body),
        RecordType::ErrorFilterUrl => stamped_error(ErrorKind::FilterUrl, body),
        RecordType::ErrorFilterPage => stamped_error(ErrorKind::FilterPage, body),
    };

    Ok((key, record, total))
}

/// Body of a `Located` record: time, position, length, hash.
struct Located {
    time: u64,
    position: u64,
    length: u32,
    hash: Key,
}

impl Located {
    fn read(body: &[u8]) -> Self {
        let mut position = [0u8; 8];
        position.copy_from_slice(&body[TIME_BYTES..TIME_BYTES + 8]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&body[TIME_BYTES + 8..TIME_BYTES + 12]);
        let mut hash = [0u8; KEY_LEN];
        hash.copy_from_slice(&body[TIME_BYTES + 12..TIME_BYTES + 12 + KEY_LEN]);
        Self {
            time: read_time(body),
            position: u64::from_le_bytes(position),
            length: u32::from_le_bytes(length),
            hash: Key::from_raw(hash),
        }
    }

    fn into_file(self, kind: FileKind) -> Record {
        Record::File {
            kind,
            time: self.time,
            position: self.position,
            length: self.length,
            hash: self.hash,
        }
    }
}

fn stamped_error(kind: ErrorKind, body: &[u8]) -> Record {
    Record::Error {
        kind,
        time: read_time(body),
    }
}

fn read_time(body: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..TIME_BYTES].copy_from_slice(&body[..TIME_BYTES]);
    u64::from_le_bytes(bytes)
}

fn corrupt(offset: usize, reason: String) -> CodecError {
    CodecError::CorruptLog { offset, reason }
}

/// Sequential reader over a record stream. Stops quietly on a short tail.
pub struct RecordReader<'a> {
    blob: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> RecordReader<'a> {
    pub fn new(blob: &'a [u8]) -> Self {
        Self {
            blob,
            offset: 0,
            failed: false,
        }
    }

    /// Bytes decoded cleanly so far.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Result<(Key, Record), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let rest = &self.blob[self.offset..];
        if rest.len() < MIN_RECORD_LEN {
            return None;
        }
        match decode_one(rest) {
            Ok((key, record, used)) => {
                self.offset += used;
                Some(Ok((key, record)))
            }
            Err(CodecError::CorruptLog { offset, reason }) => {
                self.failed = true;
                Some(Err(corrupt(self.offset + offset, reason)))
            }
        }
    }
}

/// Result of replaying a whole log.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: HashMap<Key, Record>,
    /// Length of the cleanly decoded prefix.
    pub consumed: usize,
    pub corrupt: Option<CodecError>,
}

/// Replay a log in file order: later entries win, `Nothing` deletes.
pub fn decode_all(blob: &[u8]) -> Replay {
    let mut replay = Replay::default();
    let mut reader = RecordReader::new(blob);

    for item in reader.by_ref() {
        match item {
            Ok((key, Record::Nothing)) => {
                replay.records.remove(&key);
            }
            Ok((key, record)) => {
                replay.records.insert(key, record);
            }
            Err(e) => {
                replay.corrupt = Some(e);
                break;
            }
        }
    }

    replay.consumed = reader.offset();
    replay
}
