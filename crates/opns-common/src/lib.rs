// SPDX-License-Identifier: MIT

//! Shared primitives for the OpNS overlay.
//!
//! Everything here is used by at least two of the higher-level crates: the
//! canonical [`Outpoint`] form that identifies outputs across storage and the
//! event index, the score scalar that orders topic memberships and event sets,
//! and a small error-conversion macro.

pub mod macros;

use core::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use serde::Deserialize;
use serde::Serialize;

/// Orders outputs within a topic and events within an event set.
///
/// Confirmed entries use [`block_score`]; unconfirmed ones use
/// [`unconfirmed_score`]. Both fit comfortably in a `u64`, so scores sort
/// correctly when encoded as big-endian bytes.
pub type Score = u64;

/// Score of a confirmed transaction: `height * 10^9 + index_in_block`.
pub fn block_score(height: u32, block_idx: u64) -> Score {
    height as u64 * 1_000_000_000 + block_idx
}

/// Score of an unconfirmed transaction: wall-clock nanoseconds.
///
/// Strictly increasing within one process, so two unconfirmed entries scored
/// by the same node never collide even if the clock stalls or steps back.
pub fn unconfirmed_score() -> Score {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0);

    let mut candidate = now;
    let _ = LAST.fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
        candidate = now.max(last + 1);
        Some(candidate)
    });
    candidate
}

/// A 36-byte transaction output identifier.
///
/// The byte form is the txid in little-endian wire order followed by the
/// output index as a little-endian `u32`, matching the outpoint encoding
/// inside a transaction. The canonical text form is `<hex-txid>_<index>`,
/// which is what goes into event sets and topic memberships.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Outpoint {
    pub txid: Txid,
    pub vout: u32,
}

impl Default for Outpoint {
    fn default() -> Self {
        Outpoint {
            txid: Txid::from_byte_array([0u8; 32]),
            vout: 0,
        }
    }
}

impl Outpoint {
    /// Length of the serialized form.
    pub const SIZE: usize = 36;

    pub fn new(txid: Txid, vout: u32) -> Self {
        Outpoint { txid, vout }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..32].copy_from_slice(&self.txid.to_byte_array());
        bytes[32..].copy_from_slice(&self.vout.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[..32]);
        let mut vout = [0u8; 4];
        vout.copy_from_slice(&bytes[32..]);
        Outpoint {
            txid: Txid::from_byte_array(txid),
            vout: u32::from_le_bytes(vout),
        }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.txid, self.vout)
    }
}

impl From<bitcoin::OutPoint> for Outpoint {
    fn from(outpoint: bitcoin::OutPoint) -> Self {
        Outpoint {
            txid: outpoint.txid,
            vout: outpoint.vout,
        }
    }
}

impl From<Outpoint> for bitcoin::OutPoint {
    fn from(outpoint: Outpoint) -> Self {
        bitcoin::OutPoint {
            txid: outpoint.txid,
            vout: outpoint.vout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutpointParseError {
    /// The `_` between txid and index is missing.
    MissingSeparator,
    InvalidTxid(bitcoin::hashes::hex::HexToArrayError),
    InvalidIndex(std::num::ParseIntError),
}

impl fmt::Display for OutpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutpointParseError::MissingSeparator => {
                write!(f, "expected <txid>_<vout>")
            }
            OutpointParseError::InvalidTxid(e) => write!(f, "invalid txid: {e}"),
            OutpointParseError::InvalidIndex(e) => write!(f, "invalid output index: {e}"),
        }
    }
}

impl std::error::Error for OutpointParseError {}

impl FromStr for Outpoint {
    type Err = OutpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .split_once('_')
            .ok_or(OutpointParseError::MissingSeparator)?;
        Ok(Outpoint {
            txid: Txid::from_str(txid).map_err(OutpointParseError::InvalidTxid)?,
            vout: vout.parse().map_err(OutpointParseError::InvalidIndex)?,
        })
    }
}
