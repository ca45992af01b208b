// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Reading entries back out of tracked logs.
//!
//! All read-path failures short of store I/O errors are absorbed: an
//! unknown writer, an unavailable block, a malformed block, or an
//! unresolvable clock all surface as "entry unavailable" (`Ok(None)`), with
//! a `tracing` diagnostic. This is what lets log classification and clock
//! resolution give partial answers over partially replicated or damaged
//! data instead of failing outright.

use crate::clock::WriterId;
use crate::codec;
use crate::entry::{BatchPosition, Entry, Header};
use crate::store::{LogStore, StoreError};
use crate::Weft;
use std::sync::Arc;

/// Per-read behavior, threaded through every entry fetch.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Whether the underlying [`LogStore::get`] may block until the entry
    /// is available, instead of failing fast with "unavailable".
    pub wait: bool,
    /// Whether reading a mid-batch entry should fetch the batch-terminal
    /// entry to resolve the clock shared by the whole batch. Disabled on
    /// hot paths that do not need the clock.
    pub load_batch_clock: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            wait: false,
            load_batch_clock: true,
        }
    }
}

impl<S: LogStore> Weft<S> {
    /// Reads and decodes the entry at `seq` of `writer`'s log.
    ///
    /// Returns `Ok(None)` when the writer is not tracked, the entry is not
    /// available (yet), or its bytes cannot be decoded; only store I/O
    /// failures are errors. The returned entry's clock, when loaded, is
    /// fully decompressed and normalized so that the entry's own writer
    /// maps to `seq - 1` (or is absent for `seq == 0`).
    pub fn entry(
        &self,
        writer: &WriterId,
        seq: u64,
        options: ReadOptions,
    ) -> Result<Option<Entry>, StoreError> {
        let Some(store) = self.store_of(writer) else {
            return Ok(None);
        };
        self.entry_from(&store, *writer, seq, options)
    }

    pub(crate) fn entry_from(
        &self,
        store: &Arc<S>,
        writer: WriterId,
        seq: u64,
        options: ReadOptions,
    ) -> Result<Option<Entry>, StoreError> {
        let Some(block) = store.get(seq, options.wait)? else {
            return Ok(None);
        };
        let wire = match codec::decode_block(&block) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::debug!(?writer, seq, %err, "undecodable entry treated as unavailable");
                return Ok(None);
            }
        };

        let batch = wire
            .batch
            .map(|(from_start, from_end)| BatchPosition {
                from_start,
                from_end,
            })
            .unwrap_or_default();
        let header = wire
            .header
            .as_ref()
            .and_then(codec::WireHeader::role)
            .map(|role| Header { role });

        let clock = if !batch.is_terminal() {
            if options.load_batch_clock {
                // The whole batch shares the terminal entry's clock.
                let terminal_seq = seq + batch.from_end;
                let Some(terminal) = self.entry_from(store, writer, terminal_seq, options)? else {
                    tracing::debug!(
                        ?writer,
                        seq,
                        terminal_seq,
                        "batch terminal unavailable, entry treated as unavailable"
                    );
                    return Ok(None);
                };
                match terminal.clock {
                    Some(clock) => Some(clock),
                    None => {
                        tracing::debug!(?writer, terminal_seq, "batch terminal carries no clock");
                        return Ok(None);
                    }
                }
            } else {
                None
            }
        } else {
            let Some(compressed) = wire.clock else {
                tracing::debug!(?writer, seq, "batch-terminal entry carries no clock");
                return Ok(None);
            };
            let Some(compressor) = self.compressor_for(&writer) else {
                return Ok(None);
            };
            match compressor.decompress(&compressed, seq, options.wait) {
                Ok(clock) => Some(clock),
                Err(err) => {
                    tracing::debug!(?writer, seq, %err, "clock decompression failed");
                    return Ok(None);
                }
            }
        };

        let clock = clock.map(|mut clock| {
            // The stored clock models "what I knew before writing this";
            // normalize the self-reference to the immediately preceding
            // entry of this log.
            if seq > 0 {
                clock.set(writer, seq - 1);
            } else {
                clock.remove(&writer);
            }
            clock
        });

        Ok(Some(Entry {
            writer,
            seq,
            value: wire.value.map(serde_bytes::ByteBuf::into_vec),
            batch,
            clock,
            header,
        }))
    }
}
