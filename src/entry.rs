// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The decoded form of one logged unit, and the causal relations over it.
//!
//! An [`Entry`] is what an encoded log block decodes to: the payload, the
//! entry's position inside its atomic batch, the causal clock (for entries
//! that carry one), and, on a log's very first entry, the protocol-role
//! header that classifies the log.

use crate::clock::{Clock, WriterId};

/// Protocol role of a log, as tagged by its first entry.
///
/// Writer logs are sources of original entries and participate in the
/// causal merge; output logs are derived materializations owned by the
/// external view layer and are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRole {
    /// An append-only source log owned by one participant.
    Writer,
    /// A derived log materializing a linearized view.
    Output,
}

/// Structured prefix carried only by the first entry ever written to a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// What kind of log this is.
    pub role: LogRole,
}

/// Position of an entry within its atomic append.
///
/// `from_start` counts entries before this one in the same batch and
/// `from_end` counts entries after it. A singleton append is `(0, 0)`.
/// Only the terminal entry (`from_end == 0`) carries a valid causal clock,
/// and only the first (`from_start == 0`) carries a key-table fragment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchPosition {
    /// Entries before this one in the same atomic append.
    pub from_start: u64,
    /// Entries after this one in the same atomic append.
    pub from_end: u64,
}

impl BatchPosition {
    /// Whether this is the first entry of its batch.
    pub fn is_first(&self) -> bool {
        self.from_start == 0
    }

    /// Whether this is the terminal entry of its batch, the only one whose
    /// stored clock is valid for the whole batch.
    pub fn is_terminal(&self) -> bool {
        self.from_end == 0
    }
}

/// One decoded log entry.
///
/// Entries are created once at append time, immutable thereafter, and read
/// back by sequence number; logs are append-only so an entry is never
/// deleted or rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The log this entry belongs to.
    pub writer: WriterId,
    /// Zero-based position within that writer's log.
    pub seq: u64,
    /// Payload bytes; `None` for a no-op entry.
    pub value: Option<Vec<u8>>,
    /// Position within the atomic append this entry was part of.
    pub batch: BatchPosition,
    /// Everything causally known at append time, normalized so that the
    /// entry's own writer points at the immediately preceding entry (or is
    /// absent for `seq == 0`). `None` when the entry is mid-batch and the
    /// shared clock was not loaded.
    pub clock: Option<Clock>,
    /// Present only on the very first entry of a log.
    pub header: Option<Header>,
}

impl Entry {
    /// Causal domination: whether this entry is at or before `other`.
    ///
    /// True when both entries belong to the same writer and this one is not
    /// later, or when `other`'s clock records having seen this entry's
    /// position of this writer. An entry whose clock was not loaded
    /// dominates nothing.
    pub fn happened_at_or_before(&self, other: &Entry) -> bool {
        if self.writer == other.writer {
            return self.seq <= other.seq;
        }
        other
            .clock
            .as_ref()
            .is_some_and(|clock| clock.covers(&self.writer, self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(writer: u8, seq: u64, clock: Option<Clock>) -> Entry {
        Entry {
            writer: WriterId::from_bytes([writer; WriterId::SIZE]),
            seq,
            value: None,
            batch: BatchPosition::default(),
            clock,
            header: None,
        }
    }

    #[test]
    fn same_writer_orders_by_seq() {
        let a = entry(1, 2, None);
        let b = entry(1, 5, None);
        assert!(a.happened_at_or_before(&b));
        assert!(a.happened_at_or_before(&a));
        assert!(!b.happened_at_or_before(&a));
    }

    #[test]
    fn cross_writer_orders_via_clock() {
        let a = entry(1, 3, None);

        let mut seen = Clock::new();
        seen.set(a.writer, 3);
        let b = entry(2, 0, Some(seen));
        assert!(a.happened_at_or_before(&b));
        assert!(!b.happened_at_or_before(&a));

        let mut stale = Clock::new();
        stale.set(a.writer, 2);
        let c = entry(3, 0, Some(stale));
        assert!(!a.happened_at_or_before(&c));

        // A missing clock cannot witness domination.
        let d = entry(4, 0, None);
        assert!(!a.happened_at_or_before(&d));
    }

    #[test]
    fn batch_position_roles() {
        let singleton = BatchPosition::default();
        assert!(singleton.is_first() && singleton.is_terminal());

        let first = BatchPosition {
            from_start: 0,
            from_end: 2,
        };
        assert!(first.is_first() && !first.is_terminal());

        let terminal = BatchPosition {
            from_start: 2,
            from_end: 0,
        };
        assert!(!terminal.is_first() && terminal.is_terminal());
    }
}
