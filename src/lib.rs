// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Weft: deterministic causal merge of independent append-only logs
//!
//! This crate merges many independently growing append-only logs — one per
//! participant, each identified by a public key — into a single totally
//! ordered stream that every replica computes identically, without any
//! coordination, leader, or shared wall clock.
//!
//! Every entry a writer appends records what its author had already seen
//! from the other writers, as a causal [`Clock`] (writer → highest included
//! sequence number). Given the same set of entries, the merge traversal
//! ([`CausalStream`]) derives the same global order on every replica:
//!
//! - **Causality is respected**: an entry is never ordered before anything
//!   its clock says it has seen.
//! - **Concurrency is deterministic**: entries with no causal relation
//!   ("forks") are ordered by an arrival-independent tie-break — smallest
//!   exclusive contribution first, then lexicographically smallest writer
//!   key — so the result depends only on content, never on network timing.
//! - **The traversal is incremental**: it is a lazy, pull-based iterator
//!   that can be stopped at any point and re-seeded from any recorded
//!   clock snapshot.
//!
//! ## Core concepts
//!
//! - [`WriterId`]: the opaque public-key identity of one log.
//! - [`Clock`]: a causal frontier, writer → highest included seq.
//! - [`Entry`]: one decoded log unit, carrying its payload, its position
//!   inside an atomic batch, and (on batch terminals) its causal clock.
//! - [`Weft`]: one participant's instance — the tracked writer set, the
//!   append protocol for the local log, clock resolution, and the causal
//!   merge.
//! - [`LogStore`]: the storage collaborator contract; [`MemoryLog`] is the
//!   in-process reference implementation.
//!
//! ## Stream order
//!
//! [`Weft::causal_stream`] walks from the current heads *backward*, so it
//! yields the newest entries first; within a batch, entries come out in
//! descending sequence order, sharing one clock. Consumers that want
//! oldest-first causal order (for example to materialize a view) collect
//! and reverse. The [`OutputNode::operations`] count grows monotonically
//! along the reversed order and can serve as a logical timestamp.
//!
//! ## Example
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use weft::{MemoryLog, Weft, WriterId};
//!
//! // Two participants, each owning one append-only log. Sharing the logs
//! // directly stands in for replication here; in a real deployment each
//! // replica holds its own (eventually consistent) copy.
//! let alice = WriterId::from_bytes([1; 32]);
//! let bob = WriterId::from_bytes([2; 32]);
//! let alice_log = Arc::new(MemoryLog::new());
//! let bob_log = Arc::new(MemoryLog::new());
//!
//! let a = Weft::new(alice);
//! a.add_writer(alice, Arc::clone(&alice_log));
//! a.add_writer(bob, Arc::clone(&bob_log));
//!
//! let b = Weft::new(bob);
//! b.add_writer(alice, Arc::clone(&alice_log));
//! b.add_writer(bob, Arc::clone(&bob_log));
//!
//! // Alice writes first; Bob appends after having seen Alice's entry, so
//! // his entry's clock records hers.
//! a.append(vec![b"hello".to_vec()], None)?;
//! b.append(vec![b"world".to_vec()], None)?;
//!
//! // Both replicas compute the identical merged stream.
//! let from_a: Vec<_> = a.causal_stream(Default::default())?.collect::<Result<_, _>>()?;
//! let from_b: Vec<_> = b.causal_stream(Default::default())?.collect::<Result<_, _>>()?;
//! assert_eq!(from_a, from_b);
//!
//! // Heads-first emission: reverse for causal (oldest-first) order.
//! let causal: Vec<_> = from_a.into_iter().rev().collect();
//! assert_eq!(causal[0].writer, alice);
//! assert_eq!(causal[1].writer, bob);
//! # Ok(())
//! # }
//! ```
//!
//! ## Scope of this crate
//!
//! This is the merge core only. Durable storage and replication of the
//! logs, the view layer that consumes the merged stream to materialize an
//! application-visible index, and the network transport are collaborator
//! contracts (see [`LogStore`] and [`ViewObserver`]), not implementations.
//! The crate establishes a deterministic total order over causally related
//! events; resolving application-level conflicts within that order is the
//! view layer's concern.
//!
//! ## Features
//!
//! - `arbitrary`: Implements `quickcheck::Arbitrary` for core types,
//!   useful for property-based testing.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod clock;
pub use clock::{Clock, WriterId};
pub mod entry;
pub use entry::{BatchPosition, Entry, Header, LogRole};
pub mod codec;
pub use codec::{DecodeError, EncodeError, OUTPUT_PROTOCOL, WRITER_PROTOCOL, decode_header_only};
pub mod compressor;
pub use compressor::KeyCompressor;
pub mod store;
pub use store::{AppendListener, LogStore, MemoryLog, StoreError};
pub mod members;
pub use members::{Event, MemberBatch, ViewObserver};
mod reader;
pub use reader::ReadOptions;
mod resolve;
mod append;
pub use append::AppendError;
mod stream;
pub use stream::{CausalStream, CausalStreamOptions, OutputNode};

use compressor::KeyCompressor as Compressor;
use members::{Notifier, WriterSet};

/// User-visible misuse of the API; fatal to the calling operation and
/// reported synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionError {
    /// The local identity is not a registered writer.
    NotAWriter,
    /// A log reference does not belong to a recognized writer.
    NotAKnownWriter(WriterId),
    /// The view layer was started a second time.
    AlreadyStarted,
}

impl fmt::Display for PreconditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionError::NotAWriter => {
                write!(f, "the local identity is not a registered writer")
            }
            PreconditionError::NotAKnownWriter(writer) => {
                write!(f, "{writer:?} is not a recognized writer")
            }
            PreconditionError::AlreadyStarted => write!(f, "start must only be called once"),
        }
    }
}

impl std::error::Error for PreconditionError {}

/// Instance configuration.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Whether clock resolution may trust every locally present entry as a
    /// causal frontier (`latest` resolves sparsely). With partial
    /// replication this admits frontiers whose dependencies are not locally
    /// satisfiable; disable it to resolve fully satisfiable clocks instead.
    pub sparse: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self { sparse: true }
    }
}

/// One participant's handle on the merged system: the tracked writer set,
/// the local append protocol, clock resolution, and the causal merge.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Local appends
/// are serialized by an internal gate (see [`Weft::append`]); reads and
/// stream traversal run concurrently with appends.
pub struct Weft<S> {
    local: WriterId,
    options: Options,
    state: RwLock<WriterSet<S>>,
    compressors: Mutex<ahash::HashMap<WriterId, Arc<Compressor<S>>>>,
    pub(crate) append_gate: Mutex<()>,
    notifier: Arc<Notifier>,
}

impl<S: LogStore> Weft<S> {
    /// Creates an instance for the participant identified by `local`, with
    /// default [`Options`].
    ///
    /// The instance starts with an empty writer set; the local writer's own
    /// log is registered through a [`MemberBatch`] like any other.
    pub fn new(local: WriterId) -> Self {
        Self::with_options(local, Options::default())
    }

    /// Creates an instance with explicit [`Options`].
    pub fn with_options(local: WriterId, options: Options) -> Self {
        Self {
            local,
            options,
            state: RwLock::new(WriterSet::default()),
            compressors: Mutex::new(ahash::HashMap::default()),
            append_gate: Mutex::new(()),
            notifier: Arc::new(Notifier::new()),
        }
    }

    /// The local participant's identity.
    pub fn local_id(&self) -> WriterId {
        self.local
    }

    /// Whether the local identity is currently a registered writer (and may
    /// therefore append).
    pub fn is_writer(&self) -> bool {
        self.state().writers.contains_key(&self.local)
    }

    /// The currently tracked writers, in key order.
    pub fn writers(&self) -> Vec<WriterId> {
        self.state().writers.keys().copied().collect()
    }

    /// The currently tracked output logs, in key order.
    pub fn outputs(&self) -> Vec<WriterId> {
        self.state().outputs.keys().copied().collect()
    }

    /// Version of the writer set; bumped once per committed change batch.
    pub fn writer_set_version(&self) -> u64 {
        self.state().version
    }

    /// Starts a batch of membership changes; nothing applies until
    /// [`MemberBatch::commit`].
    pub fn member_batch(&self) -> MemberBatch<'_, S> {
        MemberBatch::new(self)
    }

    /// Adds one writer log. Shorthand for a single-change [`MemberBatch`].
    pub fn add_writer(&self, id: WriterId, store: Arc<S>) {
        let mut batch = self.member_batch();
        batch.add_writer(id, store);
        batch.commit();
    }

    /// Removes one writer log. Shorthand for a single-change [`MemberBatch`].
    pub fn remove_writer(&self, id: WriterId) {
        let mut batch = self.member_batch();
        batch.remove_writer(id);
        batch.commit();
    }

    /// Adds one output log. Shorthand for a single-change [`MemberBatch`].
    pub fn add_output(&self, id: WriterId, store: Arc<S>) {
        let mut batch = self.member_batch();
        batch.add_output(id, store);
        batch.commit();
    }

    /// Removes one output log. Shorthand for a single-change [`MemberBatch`].
    pub fn remove_output(&self, id: WriterId) {
        let mut batch = self.member_batch();
        batch.remove_output(id);
        batch.commit();
    }

    /// Attaches the external view materializer, which from now on receives
    /// every [`Event`] synchronously.
    ///
    /// Fails with [`PreconditionError::AlreadyStarted`] if a view was
    /// already attached.
    pub fn start<V>(&self, view: V) -> Result<(), PreconditionError>
    where
        V: ViewObserver + 'static,
    {
        self.notifier.attach(Arc::new(view))
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, WriterSet<S>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, WriterSet<S>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// A listener forwarding a log's append notifications to the attached
    /// view; holds only a weak reference so a dropped instance goes quiet
    /// instead of keeping the notifier alive.
    pub(crate) fn append_listener(&self) -> AppendListener {
        let notifier = Arc::downgrade(&self.notifier);
        Arc::new(move || {
            if let Some(notifier) = notifier.upgrade() {
                notifier.emit(Event::Appended);
            }
        })
    }

    pub(crate) fn store_of(&self, id: &WriterId) -> Option<Arc<S>> {
        self.state().writers.get(id).cloned()
    }

    /// The key compressor for `id`'s log, created on first use.
    pub(crate) fn compressor_for(&self, id: &WriterId) -> Option<Arc<Compressor<S>>> {
        let store = self.store_of(id)?;
        let mut compressors = self
            .compressors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Some(Arc::clone(
            compressors
                .entry(*id)
                .or_insert_with(|| Arc::new(Compressor::new(store))),
        ))
    }

    /// Forgets the cached compressor for `id`; called when the writer set
    /// changes so a re-added writer rebuilds from its (possibly different)
    /// log.
    pub(crate) fn drop_compressor(&self, id: &WriterId) {
        self.compressors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub(crate) fn sparse(&self) -> bool {
        self.options.sparse
    }
}

/// Classifies a log by the protocol header of its first entry.
///
/// Empty logs, logs whose first block is not locally available, and corrupt
/// or foreign first blocks all classify as `None`; this never fails.
pub fn log_role<S: LogStore>(store: &S) -> Option<LogRole> {
    if store.is_empty() {
        return None;
    }
    let block = store.get(0, false).ok().flatten()?;
    decode_header_only(&block).map(|header| header.role)
}
