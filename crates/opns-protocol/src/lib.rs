// SPDX-License-Identifier: MIT

//! The OpNS protocol engine.
//!
//! OpNS registers domain names on chain, one character at a time. A single
//! genesis output anchors a tree of frontier outputs; spending a frontier
//! mines the next character of a name by solving a proof-of-work puzzle tied
//! to the previous output, and forks the chain state into a restatement of
//! the old frontier, a new frontier for the extended prefix, and an
//! inscription recording the claimed name under its owner's script.
//!
//! This crate holds everything that interprets or produces those
//! transactions: the locking-script codec ([`script`]), the miner ([`pow`]),
//! the unlock-transaction builder ([`unlock`]), the topic admission rules
//! ([`admission`]) and the BEEF transaction envelopes ([`beef`]) the overlay
//! exchanges.

pub mod admission;
pub mod beef;
pub mod pow;
pub mod script;
pub mod sighash;
pub mod unlock;

use std::str::FromStr;
use std::sync::OnceLock;

use opns_common::Outpoint;

/// Required number of leading zero bits in the little-endian interpretation
/// of a mined hash.
pub const DIFFICULTY: u32 = 22;

/// The outpoint anchoring the whole name tree. Every frontier script carries
/// these 36 bytes in its state, and every inscription envelope commits to
/// them.
pub fn genesis() -> &'static Outpoint {
    static GENESIS: OnceLock<Outpoint> = OnceLock::new();
    GENESIS.get_or_init(|| {
        Outpoint::from_str("58b7558ea379f24266c7e2f5fe321992ad9a724fd7a87423ba412677179ccb25_0")
            .expect("hardcoded genesis outpoint")
    })
}
