//! Tick record codec
//!
//! Partitions are flat sequences of length-prefixed, checksummed records.
//!
//! # Binary Format (per record)
//! ```text
//! [body_len:   u32]
//! [timestamp:  i64]
//! [bid:        f64]
//! [ask:        f64]
//! [has_volume: u8 ][volume: f64]
//! [symbol_len: u16][symbol: bytes]
//! [source_len: u16][source: bytes]
//! [checksum:   u32]  // CRC32C over every body byte before it
//! ```
//!
//! All integers little endian. A bad record with nothing but zero fill after
//! it is a torn tail (crash mid-append); a bad record followed by more data is
//! corruption in the middle of the file and is never truncated away.

use std::io::{self, Read};

use crc32c::crc32c;
use market_types::ids::Symbol;
use market_types::tick::Tick;
use thiserror::Error;

/// Fixed-size body fields plus checksum: ts, bid, ask, has_volume, volume,
/// two length prefixes and the CRC.
const MIN_BODY_LEN: usize = 8 + 8 + 8 + 1 + 8 + 2 + 2 + 4;

/// Upper bound for a sane record body.
const MAX_BODY_LEN: usize = 64 * 1024;

/// Longest source label stored verbatim.
pub const MAX_SOURCE_LEN: usize = 255;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("record at offset {offset} truncated")]
    Truncated { offset: u64 },

    #[error("record at offset {offset} corrupt: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("checksum mismatch at offset {offset}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { offset: u64, stored: u32, computed: u32 },
}

/// Serialize one tick into its framed, checksummed form.
pub fn encode(tick: &Tick) -> Vec<u8> {
    let symbol = tick.symbol.as_str().as_bytes();
    let source = truncate_utf8(&tick.source, MAX_SOURCE_LEN).as_bytes();

    let body_len = MIN_BODY_LEN + symbol.len() + source.len();
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&tick.timestamp.to_le_bytes());
    buf.extend_from_slice(&tick.bid.to_le_bytes());
    buf.extend_from_slice(&tick.ask.to_le_bytes());
    match tick.volume {
        Some(volume) => {
            buf.push(1);
            buf.extend_from_slice(&volume.to_le_bytes());
        }
        None => {
            buf.push(0);
            buf.extend_from_slice(&0f64.to_le_bytes());
        }
    }
    buf.extend_from_slice(&(symbol.len() as u16).to_le_bytes());
    buf.extend_from_slice(symbol);
    buf.extend_from_slice(&(source.len() as u16).to_le_bytes());
    buf.extend_from_slice(source);

    let checksum = crc32c(&buf[4..]);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

/// Decode one record body (without its length prefix).
fn decode_body(body: &[u8], offset: u64) -> Result<Tick, RecordError> {
    let corrupt = |reason: &str| RecordError::Corrupt {
        offset,
        reason: reason.to_string(),
    };

    let (payload, crc_bytes) = body.split_at(body.len() - 4);
    let stored = u32::from_le_bytes(array(crc_bytes).ok_or_else(|| corrupt("short checksum"))?);
    let computed = crc32c(payload);
    if stored != computed {
        return Err(RecordError::ChecksumMismatch {
            offset,
            stored,
            computed,
        });
    }

    let mut cursor = Cursor { data: payload, pos: 0 };
    let timestamp = i64::from_le_bytes(cursor.fixed().ok_or_else(|| corrupt("timestamp"))?);
    let bid = f64::from_le_bytes(cursor.fixed().ok_or_else(|| corrupt("bid"))?);
    let ask = f64::from_le_bytes(cursor.fixed().ok_or_else(|| corrupt("ask"))?);
    let [has_volume] = cursor.fixed::<1>().ok_or_else(|| corrupt("volume flag"))?;
    let volume = f64::from_le_bytes(cursor.fixed().ok_or_else(|| corrupt("volume"))?);

    let symbol_len = u16::from_le_bytes(cursor.fixed().ok_or_else(|| corrupt("symbol length"))?);
    let symbol = cursor
        .bytes(symbol_len as usize)
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| Symbol::try_new(s))
        .ok_or_else(|| corrupt("symbol"))?;

    let source_len = u16::from_le_bytes(cursor.fixed().ok_or_else(|| corrupt("source length"))?);
    let source = cursor
        .bytes(source_len as usize)
        .and_then(|b| std::str::from_utf8(b).ok())
        .ok_or_else(|| corrupt("source"))?
        .to_string();

    if cursor.pos != payload.len() {
        return Err(corrupt("trailing bytes in body"));
    }

    Ok(Tick {
        symbol,
        bid,
        ask,
        timestamp,
        volume: (has_volume != 0).then_some(volume),
        source,
    })
}

/// Decode the first record in `data`, returning the tick and bytes consumed.
pub fn decode(data: &[u8]) -> Result<(Tick, usize), RecordError> {
    let header = data
        .get(..4)
        .and_then(array::<4>)
        .ok_or(RecordError::Truncated { offset: 0 })?;
    let body_len = u32::from_le_bytes(header) as usize;
    check_body_len(body_len, 0)?;

    let body = data
        .get(4..4 + body_len)
        .ok_or(RecordError::Truncated { offset: 0 })?;
    let tick = decode_body(body, 0)?;
    Ok((tick, 4 + body_len))
}

fn check_body_len(body_len: usize, offset: u64) -> Result<(), RecordError> {
    if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
        return Err(RecordError::Corrupt {
            offset,
            reason: format!("implausible body length {body_len}"),
        });
    }
    Ok(())
}

// ── Streaming Reader ────────────────────────────────────────────────

/// Streams records out of any byte source (plain file or decompressor).
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            done: false,
        }
    }

    /// Byte offset just past the last record returned successfully.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    fn next_record(&mut self) -> Result<Option<Tick>, RecordError> {
        let mut header = [0u8; 4];
        match read_full(&mut self.inner, &mut header)? {
            0 => return Ok(None),
            4 => {}
            _ => return Err(RecordError::Truncated { offset: self.offset }),
        }

        let body_len = u32::from_le_bytes(header) as usize;
        check_body_len(body_len, self.offset)?;

        let mut body = vec![0u8; body_len];
        if read_full(&mut self.inner, &mut body)? != body_len {
            return Err(RecordError::Truncated { offset: self.offset });
        }

        let tick = decode_body(&body, self.offset)?;
        self.offset += 4 + body_len as u64;
        Ok(Some(tick))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Tick, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(tick)) => Some(Ok(tick)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Outcome of scanning a partition that may end in a torn record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    /// Complete, checksum-valid records.
    pub records: u64,
    /// Length of the valid prefix in bytes.
    pub valid_len: u64,
    /// The scan stopped at an incomplete or invalid record with nothing but
    /// zero fill after it. Safe to truncate at `valid_len`.
    pub torn: bool,
    /// Offset of an invalid record followed by further data. Truncating
    /// here would discard whatever follows.
    pub corrupt_at: Option<u64>,
}

/// Count valid records, stopping at the first incomplete or invalid one.
pub fn scan<R: Read>(source: R) -> Result<ScanSummary, RecordError> {
    let mut reader = RecordReader::new(source);
    let mut records = 0u64;
    let mut failure = None;
    for item in reader.by_ref() {
        match item {
            Ok(_) => records += 1,
            Err(RecordError::Io(e)) => return Err(RecordError::Io(e)),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let valid_len = reader.valid_len();
    let (torn, corrupt_at) = match failure {
        None => (false, None),
        Some(RecordError::Truncated { .. }) => (true, None),
        Some(_) => {
            if only_zeros(&mut reader.inner)? {
                (true, None)
            } else {
                (false, Some(valid_len))
            }
        }
    };
    Ok(ScanSummary {
        records,
        valid_len,
        torn,
        corrupt_at,
    })
}

/// Verify every record in `source`; any defect is an error.
pub fn verify<R: Read>(source: R) -> Result<u64, RecordError> {
    let mut records = 0u64;
    for item in RecordReader::new(source) {
        item?;
        records += 1;
    }
    Ok(records)
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Read until `buf` is full or EOF; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Drain `reader`, reporting whether every remaining byte is zero.
fn only_zeros<R: Read>(reader: &mut R) -> io::Result<bool> {
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if buf[..n].iter().any(|&b| b != 0) {
            return Ok(false);
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(out)
    }

    fn fixed<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N).and_then(array::<N>)
    }
}
