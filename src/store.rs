// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The log-store collaborator contract.
//!
//! Durable storage and replication of the logs themselves are not this
//! crate's concern: the core only ever talks to a [`LogStore`], which is a
//! thin surface over "an append-only sequence of opaque blocks". A real
//! implementation would be backed by disk or a replication protocol and may
//! genuinely block in [`LogStore::get`] when asked to `wait` for an entry
//! that has not arrived yet.
//!
//! [`MemoryLog`] is the reference implementation used by tests and doc
//! examples.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Listener invoked after blocks were appended to a log.
pub type AppendListener = Arc<dyn Fn() + Send + Sync>;

/// An I/O failure in a log store.
///
/// This is the only error read paths propagate; everything recoverable
/// (malformed or missing entries) is absorbed into "unavailable".
#[derive(Debug)]
pub struct StoreError(Box<dyn std::error::Error + Send + Sync>);

impl StoreError {
    /// Wraps an arbitrary error from a store implementation.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(err.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// An append-only sequence of opaque blocks, owned by one writer.
///
/// Implementations must be append-only: blocks are never mutated, reordered
/// or deleted, and `len` never shrinks. Reads may run concurrently with an
/// in-flight append and must tolerate the log growing underneath them.
pub trait LogStore {
    /// Number of blocks in the log.
    fn len(&self) -> u64;

    /// Whether the log has no blocks yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `blocks` as a single indivisible write and returns the new
    /// length.
    fn append(&self, blocks: Vec<Vec<u8>>) -> Result<u64, StoreError>;

    /// The block at `seq`, or `None` if it is not available.
    ///
    /// With `wait` set, an implementation that replicates lazily should
    /// block until the block arrives rather than return `None`; without it,
    /// it must fail fast. Either way, `Ok(None)` means "not here (yet)" and
    /// is not an error.
    fn get(&self, seq: u64, wait: bool) -> Result<Option<Vec<u8>>, StoreError>;

    /// Registers a listener to be invoked after every append.
    ///
    /// The core subscribes to every tracked writer log so it can eagerly
    /// re-evaluate downstream state when a log grows. Stores that cannot
    /// observe remote appends may deliver only local ones.
    fn on_append(&self, listener: AppendListener);
}

#[derive(Default)]
struct MemoryLogInner {
    blocks: Vec<Vec<u8>>,
    listeners: Vec<AppendListener>,
}

/// An in-process, heap-backed [`LogStore`].
///
/// Since all blocks live in this process, `wait` cannot make more data
/// appear and behaves exactly like a fail-fast read.
#[derive(Default)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

impl MemoryLog {
    /// Constructs an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LogStore for MemoryLog {
    fn len(&self) -> u64 {
        self.lock().blocks.len() as u64
    }

    fn append(&self, blocks: Vec<Vec<u8>>) -> Result<u64, StoreError> {
        let (len, listeners) = {
            let mut inner = self.lock();
            inner.blocks.extend(blocks);
            (inner.blocks.len() as u64, inner.listeners.clone())
        };
        for listener in listeners {
            listener();
        }
        Ok(len)
    }

    fn get(&self, seq: u64, _wait: bool) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.lock();
        let seq = usize::try_from(seq).map_err(StoreError::new)?;
        Ok(inner.blocks.get(seq).cloned())
    }

    fn on_append(&self, listener: AppendListener) {
        self.lock().listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn append_get_len() {
        let log = MemoryLog::new();
        assert!(log.is_empty());
        assert_eq!(log.append(vec![b"a".to_vec(), b"b".to_vec()]).unwrap(), 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(0, false).unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(log.get(1, true).unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(log.get(2, false).unwrap(), None);
    }

    #[test]
    fn append_notifies_listeners() {
        let log = MemoryLog::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        log.on_append(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        log.append(vec![b"x".to_vec()]).unwrap();
        log.append(vec![b"y".to_vec(), b"z".to_vec()]).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
