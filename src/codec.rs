//! Record encoding: the two on-disk formats a data file's first byte selects
//! between, plus the boundary between them (format detection).

use std::io::{BufRead, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A record decoded off disk, with the exact byte span it occupied.
///
/// `record_size` is the number of bytes `read_record` consumed, counted from
/// the position it was called at; recovery uses it to compute the next
/// record's offset without re-deriving it from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub record_size: u64,
    pub is_tombstone: bool,
}

/// The record codec chosen for a data file, identified by file byte 0.
///
/// A closed set of tagged variants rather than an open class hierarchy,
/// since no third format is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// `0x01`: big-endian length-prefixed bincode payload.
    Compact,
    /// `0x02`: one JSON object per line, base64-encoded key/value for
    /// binary-safety.
    Readable,
}

impl Codec {
    pub const COMPACT_ID: u8 = 0x01;
    pub const READABLE_ID: u8 = 0x02;

    pub fn identifier(&self) -> u8 {
        match self {
            Codec::Compact => Self::COMPACT_ID,
            Codec::Readable => Self::READABLE_ID,
        }
    }

    /// Selects a codec from a data file's first byte. Returns `None` for an
    /// identifier the engine doesn't recognize.
    pub fn from_identifier(id: u8) -> Option<Codec> {
        match id {
            Self::COMPACT_ID => Some(Codec::Compact),
            Self::READABLE_ID => Some(Codec::Readable),
            _ => None,
        }
    }

    pub fn encode_record(&self, key: &[u8], value: &[u8], timestamp: u64) -> Vec<u8> {
        self.encode(key, value, timestamp, false)
    }

    pub fn encode_tombstone(&self, key: &[u8], timestamp: u64) -> Vec<u8> {
        self.encode(key, &[], timestamp, true)
    }

    fn encode(&self, key: &[u8], value: &[u8], timestamp: u64, deleted: bool) -> Vec<u8> {
        match self {
            Codec::Compact => encode_compact(key, value, timestamp, deleted),
            Codec::Readable => encode_readable(key, value, timestamp, deleted),
        }
    }

    /// Reads one record starting at the reader's current position. Returns
    /// `Ok(None)` on a clean end-of-file: a well-defined "no more records"
    /// signal without error.
    pub fn read_record(&self, reader: &mut impl BufRead) -> Result<Option<DecodedRecord>> {
        match self {
            Codec::Compact => read_compact(reader),
            Codec::Readable => read_readable(reader),
        }
    }
}

/// The wire shape of a compact-codec record payload (everything after the
/// 4-byte length prefix).
#[derive(Debug, Serialize, Deserialize)]
struct CompactPayload {
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
    timestamp: u64,
    deleted: bool,
}

fn encode_compact(key: &[u8], value: &[u8], timestamp: u64, deleted: bool) -> Vec<u8> {
    let payload = CompactPayload { key: key.to_vec(), value: value.to_vec(), timestamp, deleted };
    let body = bincode::serialize(&payload).expect("payload serialization is infallible");
    let len = body.len() as u32;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn read_compact(reader: &mut impl BufRead) -> Result<Option<DecodedRecord>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|_| Error::Decode("truncated compact record body".to_string()))?;
    let payload: CompactPayload = bincode::deserialize(&body)?;
    Ok(Some(DecodedRecord {
        key: payload.key,
        value: payload.value,
        timestamp: payload.timestamp,
        record_size: 4 + len as u64,
        is_tombstone: payload.deleted,
    }))
}

/// Reads into `buf`, returning `Ok(false)` only if zero bytes were available
/// before any were read (a clean EOF at a record boundary); a partial read
/// is a decode error, since it means a record started but was never finished.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..])? {
            0 if read == 0 => return Ok(false),
            0 => return Err(Error::Decode("truncated record header".to_string())),
            n => read += n,
        }
    }
    Ok(true)
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadableRecord {
    key: String,
    value: String,
    timestamp: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    deleted: bool,
}

fn encode_readable(key: &[u8], value: &[u8], timestamp: u64, deleted: bool) -> Vec<u8> {
    use base64::Engine as _;
    let record = ReadableRecord {
        key: base64::engine::general_purpose::STANDARD.encode(key),
        value: base64::engine::general_purpose::STANDARD.encode(value),
        timestamp,
        deleted,
    };
    let mut line = serde_json::to_vec(&record).expect("readable record is representable as JSON");
    line.push(b'\n');
    line
}

fn read_readable(reader: &mut impl BufRead) -> Result<Option<DecodedRecord>> {
    use base64::Engine as _;
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Ok(None);
    }
    let record_size = line.len() as u64;
    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
    let record: ReadableRecord = serde_json::from_slice(trimmed)?;
    let key = base64::engine::general_purpose::STANDARD
        .decode(record.key)
        .map_err(|err| Error::Decode(format!("invalid base64 key: {err}")))?;
    let value = base64::engine::general_purpose::STANDARD
        .decode(record.value)
        .map_err(|err| Error::Decode(format!("invalid base64 value: {err}")))?;
    Ok(Some(DecodedRecord { key, value, timestamp: record.timestamp, record_size, is_tombstone: record.deleted }))
}

/// Writes `bytes` and flushes, the single entry point data files append
/// through so every appended byte is accounted for by a codec.
pub fn write_all_and_flush(writer: &mut impl Write, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}
