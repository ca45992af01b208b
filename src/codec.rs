// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Binary encoding of log entries.
//!
//! Every log block is a postcard-encoded [`WireEntry`]. The header field
//! comes first so that a log can be classified by decoding only the leading
//! bytes of its first block ([`decode_header_only`]), without touching the
//! rest of the record and without ever failing on foreign or corrupt data.
//!
//! Clocks are stored compressed: instead of repeating 32-byte writer keys,
//! the clock is a list of `(code, seq)` pairs, where codes are small
//! per-log integers assigned by the key compressor. The key-table fragment
//! that introduces new codes travels in the `keys` field of the first entry
//! of each batch (see [`crate::compressor`]).

use crate::clock::WriterId;
use crate::entry::{Header, LogRole};
use std::fmt;

/// Protocol tag for writer logs.
pub const WRITER_PROTOCOL: &str = "weft/writer/v1";
/// Protocol tag for derived output logs.
pub const OUTPUT_PROTOCOL: &str = "weft/output/v1";

/// A compressed causal clock: `(code, seq)` pairs in writer order.
pub(crate) type CompressedClock = Vec<(u64, u64)>;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct WireHeader {
    pub protocol: String,
}

impl WireHeader {
    pub(crate) fn for_role(role: LogRole) -> Self {
        let protocol = match role {
            LogRole::Writer => WRITER_PROTOCOL,
            LogRole::Output => OUTPUT_PROTOCOL,
        };
        Self {
            protocol: protocol.to_owned(),
        }
    }

    pub(crate) fn role(&self) -> Option<LogRole> {
        match self.protocol.as_str() {
            WRITER_PROTOCOL => Some(LogRole::Writer),
            OUTPUT_PROTOCOL => Some(LogRole::Output),
            _ => None,
        }
    }
}

/// The stored form of one entry. Field order is part of the format: the
/// header must stay first for [`decode_header_only`].
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct WireEntry {
    /// Present only on a log's first block.
    pub header: Option<WireHeader>,
    /// `(from_start, from_end)`; absent for a singleton append.
    pub batch: Option<(u64, u64)>,
    /// Key-table fragment: writers newly introduced by this batch, in code
    /// allocation order. Non-empty only on batch-first entries.
    pub keys: Vec<WriterId>,
    /// Compressed causal clock; present only on batch-terminal entries.
    /// `Some(vec![])` is a valid clock with no dependencies, distinct from
    /// a mid-batch entry carrying no clock at all.
    pub clock: Option<CompressedClock>,
    /// Payload bytes, if any.
    pub value: Option<serde_bytes::ByteBuf>,
}

/// Malformed or unresolvable entry bytes.
///
/// Decode failures are recoverable: read paths treat the affected entry as
/// unavailable rather than failing the surrounding operation.
#[derive(Debug)]
pub enum DecodeError {
    /// The block is not a valid entry record.
    Malformed(postcard::Error),
    /// The compressed clock references a key code with no assignment at or
    /// before the given position. This is data corruption.
    UnknownKeyCode {
        /// The unresolvable code.
        code: u64,
        /// The position the clock was being resolved for.
        seq: u64,
    },
    /// A block needed to rebuild the key table was not available locally.
    MissingKeyBlock {
        /// The position of the missing block.
        seq: u64,
    },
    /// A batch-terminal entry carried no clock.
    MissingClock {
        /// The position of the offending entry.
        seq: u64,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(err) => write!(f, "malformed entry block: {err}"),
            DecodeError::UnknownKeyCode { code, seq } => {
                write!(f, "unknown key code {code} at seq {seq}")
            }
            DecodeError::MissingKeyBlock { seq } => {
                write!(f, "key-table block at seq {seq} is not available")
            }
            DecodeError::MissingClock { seq } => {
                write!(f, "batch-terminal entry at seq {seq} carries no clock")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Malformed(err) => Some(err),
            _ => None,
        }
    }
}

/// Failure to serialize an entry block.
#[derive(Debug)]
pub struct EncodeError(postcard::Error);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to encode entry block: {}", self.0)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

pub(crate) fn encode_block(entry: &WireEntry) -> Result<Vec<u8>, EncodeError> {
    postcard::to_allocvec(entry).map_err(EncodeError)
}

pub(crate) fn decode_block(block: &[u8]) -> Result<WireEntry, DecodeError> {
    postcard::from_bytes(block).map_err(DecodeError::Malformed)
}

/// Decodes only the protocol header of a block, if it has one.
///
/// Used to classify a log as a writer log or an output log without decoding
/// the whole first entry. Garbage, foreign data, and unknown protocol tags
/// all yield `None`; this function never fails.
pub fn decode_header_only(block: &[u8]) -> Option<Header> {
    let (header, _rest) = postcard::take_from_bytes::<Option<WireHeader>>(block).ok()?;
    let role = header?.role()?;
    Some(Header { role })
}
