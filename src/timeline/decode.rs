//! Record-timer stream decoding.
//!
//! The device appends one record per record-timer op:
//!
//! ```text
//! word 0: id
//! word 1: timer high 32 bits
//! word 2: timer low 32 bits
//! ```
//!
//! An all-zero record ends the stream; anything after it is stale.

use serde::Serialize;

/// Words per record.
pub const RECORD_WORDS: usize = 3;
/// Bytes per record.
pub const RECORD_BYTES: usize = RECORD_WORDS * 4;

/// One decoded timer sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerRecord {
    pub id: u32,
    pub cycle: u64,
}

impl TimerRecord {
    pub fn from_words(id: u32, high: u32, low: u32) -> Self {
        Self {
            id,
            cycle: ((high as u64) << 32) | low as u64,
        }
    }

    /// The end-of-stream marker.
    pub fn is_sentinel(&self) -> bool {
        self.id == 0 && self.cycle == 0
    }
}

/// Decoded records, with an explicit empty case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSet {
    Empty,
    Records(Vec<TimerRecord>),
}

impl RecordSet {
    pub fn from_records(records: Vec<TimerRecord>) -> Self {
        if records.is_empty() {
            RecordSet::Empty
        } else {
            RecordSet::Records(records)
        }
    }

    pub fn records(&self) -> &[TimerRecord] {
        match self {
            RecordSet::Empty => &[],
            RecordSet::Records(records) => records,
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RecordSet::Empty)
    }
}

/// Maximum number of records a buffer of `size_bytes` holds.
pub fn capacity(size_bytes: usize) -> usize {
    size_bytes / RECORD_BYTES
}

/// Bounds-checked walk over a record buffer.
///
/// Yields at most `capacity` records and stops for good at the first sentinel.
#[derive(Debug, Clone)]
pub struct RecordCursor<'a> {
    words: &'a [u32],
    index: usize,
    capacity: usize,
    ended: bool,
}

impl<'a> RecordCursor<'a> {
    pub fn new(words: &'a [u32], capacity: usize) -> Self {
        Self {
            words,
            index: 0,
            capacity: capacity.min(words.len() / RECORD_WORDS),
            ended: false,
        }
    }

    /// Records consumed so far, sentinel excluded.
    pub fn position(&self) -> usize {
        self.index
    }

    /// Whether the cursor stopped on a sentinel rather than at capacity.
    pub fn hit_sentinel(&self) -> bool {
        self.ended
    }
}

impl Iterator for RecordCursor<'_> {
    type Item = TimerRecord;

    fn next(&mut self) -> Option<TimerRecord> {
        if self.ended || self.index >= self.capacity {
            return None;
        }
        let start = self.index * RECORD_WORDS;
        let words = self.words.get(start..start + RECORD_WORDS)?;
        let record = TimerRecord::from_words(words[0], words[1], words[2]);
        if record.is_sentinel() {
            self.ended = true;
            return None;
        }
        self.index += 1;
        Some(record)
    }
}

/// Decode a whole result buffer of `size_bytes`.
pub fn decode_records(words: &[u32], size_bytes: usize) -> RecordSet {
    let max = capacity(size_bytes);
    log::debug!(
        "A maximum of {} records fit in a buffer of 0x{:x} bytes",
        max, size_bytes
    );

    let mut cursor = RecordCursor::new(words, max);
    let records: Vec<TimerRecord> = cursor.by_ref().collect();
    if cursor.hit_sentinel() {
        log::debug!("Got {} records in buffer", records.len());
    } else {
        log::debug!("No end marker, buffer full with {} records", records.len());
    }
    RecordSet::from_records(records)
}

/// Cycle values of the first `n` records, ids discarded and no sentinel check.
pub fn timestamps(words: &[u32], n: usize) -> Vec<u64> {
    words
        .chunks_exact(RECORD_WORDS)
        .take(n)
        .map(|w| TimerRecord::from_words(w[0], w[1], w[2]).cycle)
        .collect()
}
