// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Per-log compression of writer keys into small integer codes.
//!
//! Repeating a 32-byte [`WriterId`] for every clock entry of every block
//! would dominate the wire format, so each log carries its own cumulative
//! code table: the first time a writer appears in a clock stored to a log,
//! the batch-first entry's key fragment introduces it and it is assigned
//! the next dense integer code. Codes are valid for the introducing entry
//! and all later entries of the same log, and are never reassigned, so
//! previously encoded blocks remain decodable forever.
//!
//! The table itself is not persisted separately: it is exactly the
//! concatenation of the key fragments stored in the log, so a
//! [`KeyCompressor`] rebuilds it by scanning blocks in order, caching a
//! watermark of how far it has read. [`KeyCompressor::compress`] computes
//! against that table without committing anything — the fragment written
//! into the log is the durable allocation, which keeps the table consistent
//! with the log even if an append fails between compression and the write.

use crate::clock::{Clock, WriterId};
use crate::codec::{self, CompressedClock, DecodeError};
use crate::store::LogStore;
use ahash::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default)]
struct Table {
    /// Code → (writer, seq of the entry that introduced it), in allocation
    /// order. The introduction position matters: a code is only valid for
    /// the introducing entry and later ones, even once the table has been
    /// scanned further ahead.
    codes: Vec<(WriterId, u64)>,
    /// Writer → code, lookup mirror of `codes`.
    by_writer: HashMap<WriterId, u64>,
    /// Number of leading blocks whose key fragments have been ingested.
    scanned: u64,
}

impl Table {
    fn ingest(&mut self, fragment: Vec<WriterId>, seq: u64) {
        for writer in fragment {
            if !self.by_writer.contains_key(&writer) {
                self.by_writer.insert(writer, self.codes.len() as u64);
                self.codes.push((writer, seq));
            }
        }
    }
}

/// The cumulative writer-key code table of a single log.
pub struct KeyCompressor<S> {
    store: Arc<S>,
    table: Mutex<Table>,
}

impl<S: LogStore> KeyCompressor<S> {
    /// Creates a compressor over `store` with an empty watermark; the table
    /// is filled in lazily from the log's own key fragments.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            table: Mutex::new(Table::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ingests key fragments from all blocks up to and including
    /// `through_seq`.
    fn scan(&self, table: &mut Table, through_seq: u64, wait: bool) -> Result<(), DecodeError> {
        while table.scanned <= through_seq {
            let seq = table.scanned;
            let block = self
                .store
                .get(seq, wait)
                .ok()
                .flatten()
                .ok_or(DecodeError::MissingKeyBlock { seq })?;
            let wire = codec::decode_block(&block)?;
            table.ingest(wire.keys, seq);
            table.scanned += 1;
        }
        Ok(())
    }

    /// Maps every writer in `clock` to its small per-log code, assigning
    /// codes for writers the log has not stored before.
    ///
    /// `seq` is the position the resulting entry will be stored at (the
    /// current log length). Returns the compressed clock together with the
    /// key fragment that must be written with the batch-first entry: the
    /// newly introduced writers, in allocation order. Nothing is committed
    /// to the table here; the table learns the allocation when the written
    /// fragment is later scanned back.
    pub fn compress(
        &self,
        clock: &Clock,
        seq: u64,
        wait: bool,
    ) -> Result<(CompressedClock, Vec<WriterId>), DecodeError> {
        let mut table = self.lock();
        if seq > 0 {
            self.scan(&mut table, seq - 1, wait)?;
        }

        let mut compressed = Vec::with_capacity(clock.len());
        let mut fresh = Vec::new();
        for (writer, seen) in clock.iter() {
            let code = match table.by_writer.get(writer) {
                Some(code) => *code,
                None => {
                    let code = table.codes.len() as u64 + fresh.len() as u64;
                    fresh.push(*writer);
                    code
                }
            };
            compressed.push((code, seen));
        }
        Ok((compressed, fresh))
    }

    /// Resolves a compressed clock against the code table as it stood after
    /// processing entries up to `seq`.
    ///
    /// A code with no assignment at or before `seq` means the block is
    /// corrupt; decoding of the surrounding entry must be aborted rather
    /// than silently substituting.
    pub fn decompress(
        &self,
        compressed: &[(u64, u64)],
        seq: u64,
        wait: bool,
    ) -> Result<Clock, DecodeError> {
        let mut table = self.lock();
        self.scan(&mut table, seq, wait)?;

        let mut clock = Clock::new();
        for &(code, seen) in compressed {
            let writer = usize::try_from(code)
                .ok()
                .and_then(|code| table.codes.get(code))
                .and_then(|&(writer, introduced_at)| (introduced_at <= seq).then_some(writer))
                .ok_or(DecodeError::UnknownKeyCode { code, seq })?;
            clock.set(writer, seen);
        }
        Ok(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireEntry;
    use crate::store::MemoryLog;

    fn writer(n: u8) -> WriterId {
        WriterId::from_bytes([n; WriterId::SIZE])
    }

    /// Stores `fragment` and `clock` the way an appended batch-first,
    /// batch-terminal (singleton) entry would.
    fn store_entry(log: &MemoryLog, fragment: Vec<WriterId>, clock: CompressedClock) {
        let block = codec::encode_block(&WireEntry {
            header: None,
            batch: None,
            keys: fragment,
            clock: Some(clock),
            value: None,
        })
        .unwrap();
        log.append(vec![block]).unwrap();
    }

    #[test]
    fn allocates_codes_in_clock_order() {
        let log = Arc::new(MemoryLog::new());
        let compressor = KeyCompressor::new(Arc::clone(&log));

        let clock: Clock = [(writer(3), 9), (writer(1), 2)].into_iter().collect();
        let (compressed, fresh) = compressor.compress(&clock, 0, false).unwrap();

        // Clock iteration is writer-sorted, so writer 1 gets code 0.
        assert_eq!(fresh, vec![writer(1), writer(3)]);
        assert_eq!(compressed, vec![(0, 2), (1, 9)]);
    }

    #[test]
    fn compression_is_not_committed_until_written() {
        let log = Arc::new(MemoryLog::new());
        let compressor = KeyCompressor::new(Arc::clone(&log));
        let clock: Clock = [(writer(5), 0)].into_iter().collect();

        let first = compressor.compress(&clock, 0, false).unwrap();
        let second = compressor.compress(&clock, 0, false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn codes_accumulate_across_entries() {
        let log = Arc::new(MemoryLog::new());
        let compressor = KeyCompressor::new(Arc::clone(&log));

        let clock_a: Clock = [(writer(1), 0)].into_iter().collect();
        let (compressed_a, fresh_a) = compressor.compress(&clock_a, 0, false).unwrap();
        store_entry(&log, fresh_a, compressed_a.clone());

        // A later entry referencing both an old and a new writer reuses the
        // old code and extends the table.
        let clock_b: Clock = [(writer(1), 3), (writer(2), 0)].into_iter().collect();
        let (compressed_b, fresh_b) = compressor.compress(&clock_b, 1, false).unwrap();
        assert_eq!(fresh_b, vec![writer(2)]);
        assert_eq!(compressed_b, vec![(0, 3), (1, 0)]);
        store_entry(&log, fresh_b, compressed_b.clone());

        assert_eq!(compressor.decompress(&compressed_a, 0, false).unwrap(), clock_a);
        assert_eq!(compressor.decompress(&compressed_b, 1, false).unwrap(), clock_b);

        // A fresh compressor rebuilds the same table from the log alone.
        let rebuilt = KeyCompressor::new(Arc::clone(&log));
        assert_eq!(rebuilt.decompress(&compressed_b, 1, false).unwrap(), clock_b);
    }

    #[test]
    fn unknown_code_is_corruption() {
        let log = Arc::new(MemoryLog::new());
        let compressor = KeyCompressor::new(Arc::clone(&log));
        store_entry(&log, vec![writer(1)], vec![(0, 0)]);

        let err = compressor.decompress(&[(7, 0)], 0, false).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKeyCode { code: 7, seq: 0 }));
    }

    #[test]
    fn codes_introduced_later_are_invalid_earlier() {
        let log = Arc::new(MemoryLog::new());
        store_entry(&log, vec![], vec![]);
        store_entry(&log, vec![writer(1)], vec![(0, 0)]);

        let compressor = KeyCompressor::new(Arc::clone(&log));
        assert!(compressor.decompress(&[(0, 0)], 1, false).is_ok());
        // Code 0 was introduced at seq 1, so it must stay invalid at seq 0
        // even though the table has already been scanned past it.
        assert!(matches!(
            compressor.decompress(&[(0, 0)], 0, false),
            Err(DecodeError::UnknownKeyCode { code: 0, seq: 0 })
        ));
    }

    #[quickcheck]
    fn compress_round_trips(clock: Clock) -> bool {
        let log = Arc::new(MemoryLog::new());
        let compressor = KeyCompressor::new(Arc::clone(&log));

        let (compressed, fresh) = compressor.compress(&clock, 0, false).unwrap();
        store_entry(&log, fresh, compressed.clone());
        compressor.decompress(&compressed, 0, false).unwrap() == clock
    }
}
