// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Writer-set membership and change notification.
//!
//! The set of writers (and of derived output logs) is versioned, and its
//! only mutator is [`MemberBatch::commit`]: changes are queued on the batch
//! and applied as one atomic unit under a single write lock, bumping the
//! version and emitting exactly one [`Event::WritersChanged`]. Individual
//! changes are idempotent — adding a writer that is already tracked, or
//! removing one that is not, is a no-op.

use crate::clock::WriterId;
use crate::store::LogStore;
use crate::{PreconditionError, Weft};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A synchronous "dirty" notification to the external view layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A tracked log grew.
    Appended,
    /// The writer or output set changed.
    WritersChanged,
}

/// The external view materializer's side of the notification contract.
///
/// The core performs no scheduling: it only emits events synchronously on
/// append and on membership change, and it is up to the observer to
/// debounce and re-synchronize however it sees fit.
pub trait ViewObserver: Send + Sync {
    /// Called synchronously whenever downstream state may be stale.
    fn on_update(&self, event: Event);
}

impl<F> ViewObserver for F
where
    F: Fn(Event) + Send + Sync,
{
    fn on_update(&self, event: Event) {
        self(event)
    }
}

/// Holder of the at-most-one attached [`ViewObserver`].
pub(crate) struct Notifier {
    view: Mutex<Option<Arc<dyn ViewObserver>>>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            view: Mutex::new(None),
        }
    }

    pub(crate) fn attach(&self, view: Arc<dyn ViewObserver>) -> Result<(), PreconditionError> {
        let mut slot = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(PreconditionError::AlreadyStarted);
        }
        *slot = Some(view);
        Ok(())
    }

    pub(crate) fn emit(&self, event: Event) {
        // The slot lock is released before the call so an observer may
        // re-enter the instance (read entries, resolve clocks) from inside
        // the notification.
        let view = {
            let slot = self.view.lock().unwrap_or_else(PoisonError::into_inner);
            slot.clone()
        };
        if let Some(view) = view {
            view.on_update(event);
        }
    }
}

/// The versioned writer/output set of one [`Weft`] instance.
pub(crate) struct WriterSet<S> {
    /// Bumped once per committed member batch that changed anything.
    pub version: u64,
    pub writers: BTreeMap<WriterId, Arc<S>>,
    pub outputs: BTreeMap<WriterId, Arc<S>>,
}

impl<S> Default for WriterSet<S> {
    fn default() -> Self {
        Self {
            version: 0,
            writers: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

enum MemberChange<S> {
    AddWriter(WriterId, Arc<S>),
    RemoveWriter(WriterId),
    AddOutput(WriterId, Arc<S>),
    RemoveOutput(WriterId),
}

/// An atomic set of membership changes.
///
/// Queue any number of changes, then [`commit`](MemberBatch::commit) them
/// as a unit; nothing is visible to readers, streams, or clock resolution
/// until the commit, and dependents observe a single
/// [`Event::WritersChanged`].
#[must_use = "a member batch does nothing until committed"]
pub struct MemberBatch<'a, S: LogStore> {
    base: &'a Weft<S>,
    changes: Vec<MemberChange<S>>,
}

impl<'a, S: LogStore> MemberBatch<'a, S> {
    pub(crate) fn new(base: &'a Weft<S>) -> Self {
        Self {
            base,
            changes: Vec::new(),
        }
    }

    /// Queues tracking `store` as the writer log owned by `id`.
    pub fn add_writer(&mut self, id: WriterId, store: Arc<S>) -> &mut Self {
        self.changes.push(MemberChange::AddWriter(id, store));
        self
    }

    /// Queues untracking the writer log owned by `id`.
    pub fn remove_writer(&mut self, id: WriterId) -> &mut Self {
        self.changes.push(MemberChange::RemoveWriter(id));
        self
    }

    /// Queues tracking `store` as a derived output log.
    pub fn add_output(&mut self, id: WriterId, store: Arc<S>) -> &mut Self {
        self.changes.push(MemberChange::AddOutput(id, store));
        self
    }

    /// Queues untracking the derived output log owned by `id`.
    pub fn remove_output(&mut self, id: WriterId) -> &mut Self {
        self.changes.push(MemberChange::RemoveOutput(id));
        self
    }

    /// Applies all queued changes as one atomic unit.
    pub fn commit(self) {
        let mut changed = false;
        {
            let mut set = self.base.state_mut();
            for change in self.changes {
                match change {
                    MemberChange::AddWriter(id, store) => {
                        if set.writers.contains_key(&id) {
                            continue;
                        }
                        store.on_append(self.base.append_listener());
                        set.writers.insert(id, store);
                        self.base.drop_compressor(&id);
                        changed = true;
                    }
                    MemberChange::RemoveWriter(id) => {
                        if set.writers.remove(&id).is_some() {
                            self.base.drop_compressor(&id);
                            changed = true;
                        }
                    }
                    MemberChange::AddOutput(id, store) => {
                        if set.outputs.contains_key(&id) {
                            continue;
                        }
                        set.outputs.insert(id, store);
                        changed = true;
                    }
                    MemberChange::RemoveOutput(id) => {
                        if set.outputs.remove(&id).is_some() {
                            changed = true;
                        }
                    }
                }
            }
            if changed {
                set.version += 1;
                tracing::debug!(version = set.version, "writer set changed");
            }
        }
        if changed {
            self.base.notifier().emit(Event::WritersChanged);
        }
    }
}
