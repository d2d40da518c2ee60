//! Proof-of-work search for the next character of a name.
//!
//! A solution is a 32-byte nonce such that
//! `SHA256d(prev_pow ‖ char ‖ nonce)`, reversed into little-endian order and
//! read as a 256-bit integer, starts with at least [`DIFFICULTY`] zero bits.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;

use crate::DIFFICULTY;

/// A found solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pow {
    pub nonce: Vec<u8>,
    pub hash: Vec<u8>,
    /// Attempts made by the winning worker. Informational.
    pub hashes: u64,
}

/// Mines a character extension off `prev_pow` at the protocol difficulty.
pub fn mine(prev_pow: &[u8], ch: u8) -> Pow {
    search(prev_pow, ch, DIFFICULTY)
}

/// Mines at an explicit difficulty. One worker per hardware thread; each
/// draws fresh nonces from the OS RNG until one of them wins, which stops
/// the rest.
pub fn search(prev_pow: &[u8], ch: u8, difficulty: u32) -> Pow {
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let stop = Arc::new(AtomicBool::new(false));
    let (solution_tx, solution_rx) = mpsc::sync_channel(1);

    thread::scope(|scope| {
        for _ in 0..workers {
            let stop = stop.clone();
            let solution_tx = solution_tx.clone();
            scope.spawn(move || {
                let mut preimage = Vec::with_capacity(prev_pow.len() + 1 + 32);
                preimage.extend_from_slice(prev_pow);
                preimage.push(ch);
                let base = preimage.len();

                let mut nonce = [0u8; 32];
                let mut attempts = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    OsRng.fill_bytes(&mut nonce);
                    preimage.truncate(base);
                    preimage.extend_from_slice(&nonce);
                    attempts += 1;

                    let hash = sha256d::Hash::hash(&preimage);
                    if meets_difficulty(&hash.to_byte_array(), difficulty) {
                        // First winner claims the flag; everyone else just
                        // sees it and exits.
                        if !stop.swap(true, Ordering::Relaxed) {
                            let _ = solution_tx.send(Pow {
                                nonce: nonce.to_vec(),
                                hash: hash.to_byte_array().to_vec(),
                                hashes: attempts,
                            });
                        }
                        return;
                    }
                }
            });
        }
        drop(solution_tx);
        solution_rx.recv().expect("a worker always reports before stopping")
    })
}

/// Whether the little-endian reversal of `hash` has at least `difficulty`
/// leading zero bits.
pub fn meets_difficulty(hash: &[u8; 32], difficulty: u32) -> bool {
    let mut remaining = difficulty;
    for byte in hash.iter().rev() {
        if remaining == 0 {
            return true;
        }
        let zeros = byte.leading_zeros();
        if remaining <= 8 {
            return zeros >= remaining;
        }
        if zeros < 8 {
            return false;
        }
        remaining -= 8;
    }
    remaining == 0
}

/// Recomputes the puzzle hash for a claimed solution.
pub fn solution_hash(prev_pow: &[u8], ch: u8, nonce: &[u8]) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(prev_pow.len() + 1 + nonce.len());
    preimage.extend_from_slice(prev_pow);
    preimage.push(ch);
    preimage.extend_from_slice(nonce);
    sha256d::Hash::hash(&preimage).to_byte_array()
}
