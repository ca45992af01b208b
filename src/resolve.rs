// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Resolving the "latest" causal clock over the tracked writer set.
//!
//! Two modes, per the instance's [`Options`](crate::Options):
//!
//! - **Sparse**: every locally present entry is trusted as a causal
//!   frontier; the clock is simply `length - 1` per non-empty log. Cheap,
//!   and appropriate when partial replication is acceptable.
//! - **Non-sparse**: the clock must be internally consistent. A frontier
//!   must be a batch-terminal entry (mid-batch entries carry no valid
//!   clock), and every dependency it records must itself be covered by the
//!   resolved clock. Heads that fail are stepped back one batch at a time;
//!   a writer whose entire local state fails is dropped from the result
//!   rather than failing the resolution (its state cannot safely be
//!   claimed as frontier yet).

use crate::clock::{Clock, WriterId};
use crate::reader::ReadOptions;
use crate::store::{LogStore, StoreError};
use crate::{PreconditionError, Weft};

/// Fail-fast, clock-less reads: resolution only needs batch geometry and
/// the clocks that terminal entries carry themselves.
const RESOLVE_READS: ReadOptions = ReadOptions {
    wait: false,
    load_batch_clock: false,
};

impl<S: LogStore> Weft<S> {
    /// The current latest clock, resolved sparsely or non-sparsely per the
    /// instance's [`Options`](crate::Options).
    pub fn latest(&self) -> Result<Clock, StoreError> {
        let sparse = self.latest_sparse();
        if self.sparse() {
            Ok(sparse)
        } else {
            self.non_sparse_from(sparse)
        }
    }

    /// The optimistic latest clock: `length - 1` for every tracked writer
    /// whose log is non-empty.
    pub fn latest_sparse(&self) -> Clock {
        let state = self.state();
        let mut clock = Clock::new();
        for (id, store) in &state.writers {
            let len = store.len();
            if len > 0 {
                clock.set(*id, len - 1);
            }
        }
        clock
    }

    /// Like [`latest_sparse`](Weft::latest_sparse), but restricted to the
    /// given logs, which must all be recognized writers.
    pub fn sparse_clock_of(&self, writers: &[WriterId]) -> Result<Clock, PreconditionError> {
        let state = self.state();
        let mut clock = Clock::new();
        for id in writers {
            let store = state
                .writers
                .get(id)
                .ok_or(PreconditionError::NotAKnownWriter(*id))?;
            let len = store.len();
            if len > 0 {
                clock.set(*id, len - 1);
            }
        }
        Ok(clock)
    }

    /// The fully satisfiable latest clock: never claims a mid-batch entry
    /// as frontier, and never claims a frontier whose recorded
    /// dependencies are not covered by the rest of the clock.
    pub fn latest_non_sparse(&self) -> Result<Clock, StoreError> {
        let sparse = self.latest_sparse();
        self.non_sparse_from(sparse)
    }

    fn non_sparse_from(&self, sparse: Clock) -> Result<Clock, StoreError> {
        let mut available = sparse;

        // Step unsatisfied heads back (one batch at a time) until every
        // remaining head is a terminal entry whose dependencies the clock
        // covers. Each step strictly decreases some writer's position or
        // drops a writer, so a pass that changes nothing is a fixed point.
        loop {
            let mut changed = false;
            let snapshot = available.clone();
            for (id, seq) in snapshot.iter() {
                let Some(node) = self.entry(id, seq, RESOLVE_READS)? else {
                    tracing::debug!(?id, seq, "head unavailable, dropped from resolved clock");
                    available.remove(id);
                    changed = true;
                    continue;
                };

                // A mid-batch head cannot be a frontier; back out of the
                // batch entirely.
                let stepped_back = node.seq.checked_sub(node.batch.from_start + 1);
                if !node.batch.is_terminal() {
                    match stepped_back {
                        Some(prev) => available.set(*id, prev),
                        None => {
                            available.remove(id);
                        }
                    }
                    changed = true;
                    continue;
                }

                let Some(clock) = node.clock.as_ref() else {
                    available.remove(id);
                    changed = true;
                    continue;
                };
                let satisfied = clock
                    .iter()
                    .all(|(dep, dep_seq)| available.covers(dep, dep_seq));
                if !satisfied {
                    match stepped_back {
                        Some(prev) => available.set(*id, prev),
                        None => {
                            tracing::debug!(
                                ?id,
                                seq,
                                "dependencies unsatisfiable, writer dropped from resolved clock"
                            );
                            available.remove(id);
                        }
                    }
                    changed = true;
                }
            }
            if !changed {
                return Ok(available);
            }
        }
    }
}
