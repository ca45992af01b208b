// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The causal merge traversal.
//!
//! Given the current head entry of every tracked writer, [`CausalStream`]
//! deterministically selects one entry per step, walking every log
//! backward until all writers are exhausted. The traversal is pull-based
//! and lazy: nothing is read ahead of what the consumer asks for, and
//! dropping the iterator cancels it with no cleanup obligation.
//!
//! Each step either continues an in-progress batch walk (the siblings of
//! an already-selected batch, emitted without re-running fork detection,
//! sharing the batch's single clock) or computes the current *fork set*:
//! the heads not causally dominated by any other head. Among forks, the
//! one with the smallest *exclusive contribution* is selected — the number
//! of operations its clock covers that no other head's clock covers — with
//! exact ties broken by the lexicographically smallest writer key. Both
//! quantities depend only on the entries themselves, never on arrival
//! order or wall clocks, which is what makes every replica compute the
//! identical sequence.

use crate::clock::{Clock, WriterId};
use crate::entry::Entry;
use crate::reader::ReadOptions;
use crate::store::{LogStore, StoreError};
use crate::Weft;
use ahash::{HashMap, HashMapExt};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// One emission of the causal stream.
///
/// The clock is the merge-time frontier (one entry per writer still active
/// in the traversal at selection time), not the entry's own stored clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNode {
    /// The writer whose entry this is.
    pub writer: WriterId,
    /// The entry's position in its writer's log.
    pub seq: u64,
    /// The entry's payload, if any.
    pub value: Option<Vec<u8>>,
    /// The merge frontier at selection time.
    pub clock: Clock,
    /// Total causal progress at this point:
    /// [`operations`](Clock::operations) of `clock`.
    pub operations: u64,
}

/// Configuration for [`Weft::causal_stream`].
#[derive(Debug, Clone, Default)]
pub struct CausalStreamOptions {
    /// Traverse from this snapshot instead of the current latest clock,
    /// scoping the traversal to entries at or before it (and making an
    /// earlier traversal resumable by recording where it started).
    pub clock: Option<Clock>,
    /// Whether reads during the traversal may block for entries that have
    /// not arrived locally. Without it, a writer whose next entry is
    /// unavailable is dropped from the traversal.
    pub wait: bool,
}

struct BatchWalk {
    writer: WriterId,
    clock: Clock,
}

/// A lazy backward walk over all tracked logs in deterministic causal
/// merge order.
///
/// Obtained from [`Weft::causal_stream`]; see the [crate docs](crate) for
/// the emission order and the step protocol.
pub struct CausalStream<'a, S> {
    base: &'a Weft<S>,
    heads: BTreeMap<WriterId, Entry>,
    batch: Option<BatchWalk>,
    wait: bool,
    error: Option<StoreError>,
    done: bool,
}

impl<S: LogStore> Weft<S> {
    /// The current head entries, one per writer in `clock` (or in the
    /// latest clock), with batch clocks loaded.
    ///
    /// Mirrors the traversal's seeding: a clock referencing an unrecognized
    /// writer yields no heads at all, and heads that cannot be read are
    /// omitted.
    pub fn heads(
        &self,
        clock: Option<&Clock>,
        options: ReadOptions,
    ) -> Result<Vec<Entry>, StoreError> {
        let resolved;
        let clock = match clock {
            Some(clock) => clock,
            None => {
                resolved = self.latest()?;
                &resolved
            }
        };
        Ok(self.seed_heads(clock, options.wait)?.into_values().collect())
    }

    fn seed_heads(
        &self,
        clock: &Clock,
        wait: bool,
    ) -> Result<BTreeMap<WriterId, Entry>, StoreError> {
        let options = ReadOptions {
            wait,
            load_batch_clock: true,
        };
        let mut heads = BTreeMap::new();
        for (id, seq) in clock.iter() {
            if self.store_of(id).is_none() {
                tracing::debug!(?id, "clock references an untracked writer; no heads");
                return Ok(BTreeMap::new());
            }
            match self.entry(id, seq, options)? {
                Some(head) => {
                    heads.insert(*id, head);
                }
                None => {
                    tracing::debug!(?id, seq, "head unavailable, writer left out of traversal");
                }
            }
        }
        Ok(heads)
    }

    /// Opens a causal merge traversal over the tracked logs.
    ///
    /// The stream emits newest-first (see the [crate docs](crate)); collect
    /// and reverse for oldest-first causal order. It is not restartable in
    /// place, but an equivalent traversal can always be re-opened from a
    /// recorded clock snapshot via [`CausalStreamOptions::clock`].
    pub fn causal_stream(
        &self,
        options: CausalStreamOptions,
    ) -> Result<CausalStream<'_, S>, StoreError> {
        let clock = match options.clock {
            Some(clock) => clock,
            None => self.latest()?,
        };
        let heads = self.seed_heads(&clock, options.wait)?;
        Ok(CausalStream {
            base: self,
            heads,
            batch: None,
            wait: options.wait,
            error: None,
            done: false,
        })
    }
}

impl<S: LogStore> Iterator for CausalStream<'_, S> {
    type Item = Result<OutputNode, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.error.take() {
            self.done = true;
            return Some(Err(err));
        }

        // Either continue an in-progress batch walk, or select the next
        // fork. The walk reuses the batch's shared clock and skips fork
        // detection entirely.
        let (node, clock) = match self.batch.take() {
            Some(walk) if self.heads.contains_key(&walk.writer) => {
                let node = self.heads[&walk.writer].clone();
                if !node.batch.is_first() {
                    // More siblings to come.
                    self.batch = Some(BatchWalk {
                        writer: walk.writer,
                        clock: walk.clock.clone(),
                    });
                }
                (node, walk.clock)
            }
            _ => {
                let info = fork_info(&self.heads);
                let chosen = info
                    .forks
                    .iter()
                    .copied()
                    .min_by_key(|fork| (fork_size(fork, &self.heads), fork.writer))
                    .cloned();
                match chosen {
                    Some(node) => (node, info.frontier),
                    None => {
                        self.done = true;
                        return None;
                    }
                }
            }
        };

        // Selecting the terminal of a multi-entry batch starts a walk over
        // its siblings.
        if node.batch.is_terminal() && !node.batch.is_first() {
            self.batch = Some(BatchWalk {
                writer: node.writer,
                clock: clock.clone(),
            });
        }

        let operations = clock.operations();
        let out = OutputNode {
            writer: node.writer,
            seq: node.seq,
            value: node.value.clone(),
            clock,
            operations,
        };

        // Advance: an emitted first entry exhausts its writer; otherwise
        // the head steps to the previous entry. Within a batch the clock
        // is shared, so it is not loaded again.
        if node.seq == 0 {
            self.heads.remove(&node.writer);
        } else {
            let options = ReadOptions {
                wait: self.wait,
                load_batch_clock: false,
            };
            match self.base.entry(&node.writer, node.seq - 1, options) {
                Ok(Some(prev)) => {
                    self.heads.insert(node.writer, prev);
                }
                Ok(None) => {
                    tracing::debug!(
                        writer = ?node.writer,
                        seq = node.seq - 1,
                        "next entry unavailable, writer dropped from traversal"
                    );
                    self.heads.remove(&node.writer);
                }
                // The node selected this step is still delivered; the
                // error surfaces on the next pull.
                Err(err) => self.error = Some(err),
            }
        }

        Some(Ok(out))
    }
}

struct ForkInfo<'e> {
    forks: SmallVec<[&'e Entry; 4]>,
    frontier: Clock,
}

/// The fork set (heads not dominated by any other head) and the merged
/// frontier clock over all heads.
fn fork_info(heads: &BTreeMap<WriterId, Entry>) -> ForkInfo<'_> {
    let mut forks = SmallVec::new();
    let mut frontier = Clock::new();
    for head in heads.values() {
        if is_fork(head, heads) {
            forks.push(head);
        }
        frontier.set(head.writer, head.seq);
    }
    ForkInfo { forks, frontier }
}

fn is_fork(head: &Entry, heads: &BTreeMap<WriterId, Entry>) -> bool {
    !heads
        .values()
        .any(|other| other.writer != head.writer && head.happened_at_or_before(other))
}

/// The candidate's exclusive contribution: how many operations its clock
/// covers beyond the highest position any *other* head's clock records for
/// the same writer.
fn fork_size(node: &Entry, heads: &BTreeMap<WriterId, Entry>) -> u64 {
    let mut high: HashMap<WriterId, u64> = HashMap::new();
    for other in heads.values() {
        if other.writer == node.writer {
            continue;
        }
        let Some(clock) = other.clock.as_ref() else {
            continue;
        };
        for (id, seq) in clock.iter() {
            let known = seq + 1;
            high.entry(*id)
                .and_modify(|have| *have = (*have).max(known))
                .or_insert(known);
        }
    }

    let Some(clock) = node.clock.as_ref() else {
        return 0;
    };
    clock
        .iter()
        .map(|(id, seq)| (seq + 1).saturating_sub(high.get(id).copied().unwrap_or(0)))
        .sum()
}
