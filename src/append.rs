// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Appending values to the local writer's log.

use crate::clock::Clock;
use crate::codec::{self, DecodeError, EncodeError, WireEntry, WireHeader};
use crate::entry::LogRole;
use crate::reader::ReadOptions;
use crate::store::{LogStore, StoreError};
use crate::{PreconditionError, Weft};
use std::fmt;
use std::sync::PoisonError;

/// Failure of a local append.
#[derive(Debug)]
pub enum AppendError {
    /// API misuse, e.g. appending without being a registered writer.
    Precondition(PreconditionError),
    /// The local log store failed.
    Store(StoreError),
    /// The local log could not be read back while preparing the append.
    Codec(DecodeError),
    /// The batch could not be serialized.
    Encode(EncodeError),
    /// The local log grew underneath an in-flight append. The append gate
    /// makes this impossible for appends going through this instance, so
    /// observing it means some other actor wrote to the local log; the
    /// snapshot this append was built on is no longer causal truth.
    ConcurrentAppend,
}

impl fmt::Display for AppendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendError::Precondition(err) => write!(f, "{err}"),
            AppendError::Store(err) => write!(f, "{err}"),
            AppendError::Codec(err) => write!(f, "failed to read local log: {err}"),
            AppendError::Encode(err) => write!(f, "{err}"),
            AppendError::ConcurrentAppend => {
                write!(f, "local log was appended to concurrently")
            }
        }
    }
}

impl std::error::Error for AppendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppendError::Precondition(err) => Some(err),
            AppendError::Store(err) => Some(err),
            AppendError::Codec(err) => Some(err),
            AppendError::Encode(err) => Some(err),
            AppendError::ConcurrentAppend => None,
        }
    }
}

impl From<PreconditionError> for AppendError {
    fn from(err: PreconditionError) -> Self {
        AppendError::Precondition(err)
    }
}

impl From<StoreError> for AppendError {
    fn from(err: StoreError) -> Self {
        AppendError::Store(err)
    }
}

impl From<DecodeError> for AppendError {
    fn from(err: DecodeError) -> Self {
        AppendError::Codec(err)
    }
}

impl From<EncodeError> for AppendError {
    fn from(err: EncodeError) -> Self {
        AppendError::Encode(err)
    }
}

impl<S: LogStore> Weft<S> {
    /// Appends `values` to the local writer's log as one atomic causal
    /// unit, and returns the log's new length.
    ///
    /// The entries share a single causal snapshot: `clock` if given,
    /// otherwise the current [`latest`](Weft::latest) clock. Dependencies
    /// recorded by the previous local head that the snapshot no longer
    /// mentions are carried forward unchanged, so causal history about a
    /// writer that has since left the writer set is never silently lost.
    ///
    /// Appends on one instance are serialized by an internal gate: the
    /// snapshot is read and written back under mutual exclusion, because
    /// two unsynchronized appends could both snapshot the same pre-append
    /// clock and diverge from causal truth.
    pub fn append(&self, values: Vec<Vec<u8>>, clock: Option<Clock>) -> Result<u64, AppendError> {
        let _gate = self
            .append_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let store = self
            .store_of(&self.local_id())
            .ok_or(PreconditionError::NotAWriter)?;
        if values.is_empty() {
            return Ok(store.len());
        }

        let mut clock = match clock {
            Some(clock) => clock,
            None => self.latest()?,
        };
        let len = store.len();

        if len > 0 {
            let head = self.entry_from(
                &store,
                self.local_id(),
                len - 1,
                ReadOptions {
                    wait: true,
                    load_batch_clock: true,
                },
            )?;
            if let Some(head_clock) = head.and_then(|head| head.clock) {
                for (id, seq) in head_clock.iter() {
                    if *id == self.local_id() || clock.contains(id) {
                        continue;
                    }
                    clock.set(*id, seq);
                }
            }
        }

        let compressor = self
            .compressor_for(&self.local_id())
            .ok_or(PreconditionError::NotAWriter)?;
        let (compressed, fresh) = compressor.compress(&clock, len, true)?;

        // Only the first entry of the batch stores the key fragment (and,
        // on a brand-new log, the protocol header); only the last stores
        // the clock.
        let count = values.len();
        let mut blocks = Vec::with_capacity(count);
        for (i, value) in values.into_iter().enumerate() {
            let wire = WireEntry {
                header: (len == 0 && i == 0).then(|| WireHeader::for_role(LogRole::Writer)),
                batch: (count != 1).then(|| (i as u64, (count - 1 - i) as u64)),
                keys: if i == 0 { fresh.clone() } else { Vec::new() },
                clock: (i == count - 1).then(|| compressed.clone()),
                value: Some(serde_bytes::ByteBuf::from(value)),
            };
            blocks.push(codec::encode_block(&wire)?);
        }

        if store.len() != len {
            return Err(AppendError::ConcurrentAppend);
        }
        let new_len = store.append(blocks)?;
        tracing::debug!(writer = ?self.local_id(), count, new_len, "appended batch");
        Ok(new_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WriterId;
    use crate::entry::BatchPosition;
    use crate::store::MemoryLog;
    use crate::{LogRole, log_role};
    use std::sync::Arc;

    fn writer(n: u8) -> WriterId {
        WriterId::from_bytes([n; WriterId::SIZE])
    }

    fn instance(local: WriterId) -> (Weft<MemoryLog>, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let weft = Weft::new(local);
        weft.add_writer(local, Arc::clone(&log));
        (weft, log)
    }

    #[test]
    fn append_requires_registration() {
        let weft: Weft<MemoryLog> = Weft::new(writer(1));
        assert!(matches!(
            weft.append(vec![b"x".to_vec()], None),
            Err(AppendError::Precondition(PreconditionError::NotAWriter))
        ));
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let (weft, log) = instance(writer(1));
        assert_eq!(weft.append(vec![], None).unwrap(), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn first_entry_carries_the_protocol_header() {
        let (weft, log) = instance(writer(1));
        weft.append(vec![b"a".to_vec()], None).unwrap();
        weft.append(vec![b"b".to_vec()], None).unwrap();
        assert_eq!(log_role(log.as_ref()), Some(LogRole::Writer));

        let first = weft
            .entry(&writer(1), 0, ReadOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(first.header.map(|h| h.role), Some(LogRole::Writer));
        let second = weft
            .entry(&writer(1), 1, ReadOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(second.header, None);
    }

    #[test]
    fn batch_markers_key_fragment_and_clock_placement() {
        let w = writer(1);
        let (weft, _log) = instance(w);
        weft.append(
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            Some(Clock::new()),
        )
        .unwrap();

        let positions: Vec<BatchPosition> = (0..3)
            .map(|seq| {
                weft.entry(&w, seq, ReadOptions::default())
                    .unwrap()
                    .unwrap()
                    .batch
            })
            .collect();
        assert_eq!(
            positions,
            vec![
                BatchPosition { from_start: 0, from_end: 2 },
                BatchPosition { from_start: 1, from_end: 1 },
                BatchPosition { from_start: 2, from_end: 0 },
            ]
        );

        // All three share the terminal's clock, normalized per entry.
        let terminal = weft.entry(&w, 2, ReadOptions::default()).unwrap().unwrap();
        let expected: Clock = [(w, 1)].into_iter().collect();
        assert_eq!(terminal.clock, Some(expected));
    }

    #[test]
    fn singleton_append_has_no_batch_marker() {
        let w = writer(1);
        let (weft, _log) = instance(w);
        weft.append(vec![b"only".to_vec()], None).unwrap();
        let entry = weft.entry(&w, 0, ReadOptions::default()).unwrap().unwrap();
        assert_eq!(entry.batch, BatchPosition::default());
        assert_eq!(entry.value.as_deref(), Some(&b"only"[..]));
    }

    #[test]
    fn implicit_clock_snapshots_other_writers() {
        let w1 = writer(1);
        let w2 = writer(2);
        let (weft1, log1) = instance(w1);
        weft1.append(vec![b"from w1".to_vec()], None).unwrap();

        let (weft2, _log2) = instance(w2);
        weft2.add_writer(w1, Arc::clone(&log1));
        weft2.append(vec![b"from w2".to_vec()], None).unwrap();

        let entry = weft2.entry(&w2, 0, ReadOptions::default()).unwrap().unwrap();
        let expected: Clock = [(w1, 0)].into_iter().collect();
        assert_eq!(entry.clock, Some(expected));
    }

    #[test]
    fn carries_forward_dropped_writers() {
        let w1 = writer(1);
        let w = writer(9);
        let (weft1, log1) = instance(w1);
        for _ in 0..5 {
            weft1.append(vec![b"w1".to_vec()], None).unwrap();
        }

        let (weft, _log) = instance(w);
        weft.add_writer(w1, Arc::clone(&log1));
        weft.append(vec![b"saw w1".to_vec()], None).unwrap();

        // W1 leaves the writer set; the next append's resolved clock no
        // longer mentions it, but the dependency must survive.
        weft.remove_writer(w1);
        weft.append(vec![b"after removal".to_vec()], None).unwrap();

        let head = weft.entry(&w, 1, ReadOptions::default()).unwrap().unwrap();
        let clock = head.clock.unwrap();
        assert_eq!(clock.get(&w1), Some(4));
    }
}
