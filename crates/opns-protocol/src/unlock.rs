//! Builds the transaction that spends a frontier output and mines one more
//! character of a name.
//!
//! The spend always produces three protocol outputs: a restatement of the
//! frontier with the new character's bit set, a fresh frontier for the
//! extended prefix, and an inscription claiming the extended prefix under
//! the owner's script. Anything the caller appends after those three is
//! committed to by the witness.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::Amount;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Witness;
use opns_common::impl_error_from;
use opns_common::Outpoint;

use crate::pow;
use crate::pow::Pow;
use crate::script::build_inscription;
use crate::script::set_claimed_bit;
use crate::script::Opns;
use crate::sighash;
use crate::sighash::SighashError;
use crate::DIFFICULTY;

#[derive(Debug)]
pub enum UnlockError {
    /// The character must keep the domain valid UTF-8 (in practice,
    /// printable ASCII).
    InvalidCharacter(u8),
    Sighash(SighashError),
}

impl core::fmt::Display for UnlockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UnlockError::InvalidCharacter(ch) => {
                write!(f, "character {ch:#04x} cannot extend a domain")
            }
            UnlockError::Sighash(e) => write!(f, "sighash: {e}"),
        }
    }
}

impl std::error::Error for UnlockError {}

impl_error_from!(UnlockError, SighashError, Sighash);

/// Witness builder for one frontier spend. Holds the mined solution so
/// [`OpnsUnlocker::sign`] stays deterministic.
#[derive(Debug, Clone)]
pub struct OpnsUnlocker {
    opns: Opns,
    ch: u8,
    owner_script: ScriptBuf,
    solution: Pow,
}

impl Opns {
    /// Mines `ch` at the protocol difficulty and builds the spending
    /// transaction. Expensive: blocks until the puzzle is solved.
    pub fn build_unlock_tx(
        &self,
        outpoint: &Outpoint,
        ch: u8,
        owner_script: &ScriptBuf,
    ) -> Result<(Transaction, OpnsUnlocker), UnlockError> {
        self.build_unlock_tx_at(outpoint, ch, owner_script, DIFFICULTY)
    }

    /// Same as [`Opns::build_unlock_tx`] with an explicit difficulty.
    pub fn build_unlock_tx_at(
        &self,
        outpoint: &Outpoint,
        ch: u8,
        owner_script: &ScriptBuf,
        difficulty: u32,
    ) -> Result<(Transaction, OpnsUnlocker), UnlockError> {
        let mut domain_bytes = self.domain.clone().into_bytes();
        domain_bytes.push(ch);
        let new_domain =
            String::from_utf8(domain_bytes).map_err(|_| UnlockError::InvalidCharacter(ch))?;

        let solution = pow::search(&self.pow, ch, difficulty);

        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: (*outpoint).into(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: Vec::with_capacity(3),
        };

        // Restatement: same prefix, bit `ch` now claimed.
        let claimed = set_claimed_bit(&self.claimed, ch);
        tx.output.push(TxOut {
            value: Amount::from_sat(1),
            script_pubkey: Opns::lock(&claimed, &self.domain, &solution.hash),
        });
        // Extension: fresh frontier for the longer prefix.
        tx.output.push(TxOut {
            value: Amount::from_sat(1),
            script_pubkey: Opns::lock(&[0x00], &new_domain, &solution.hash),
        });
        // Inscription: the claim itself, spendable by the owner.
        tx.output.push(TxOut {
            value: Amount::from_sat(1),
            script_pubkey: build_inscription(&new_domain, owner_script),
        });

        let unlocker = OpnsUnlocker {
            opns: self.clone(),
            ch,
            owner_script: owner_script.clone(),
            solution,
        };
        Ok((tx, unlocker))
    }
}

impl OpnsUnlocker {
    pub fn solution(&self) -> &Pow {
        &self.solution
    }

    /// Builds the unlocking script for input `input_index` of `tx`: the
    /// character, the nonce, the owner script, the serialized trailing
    /// outputs (index 3 onwards) and the sighash preimage, in push order.
    pub fn sign(&self, tx: &Transaction, input_index: usize) -> Result<ScriptBuf, UnlockError> {
        let mut unlock = Vec::new();
        crate::script::append_push(&mut unlock, &[self.ch]);
        crate::script::append_push(&mut unlock, &self.solution.nonce);
        crate::script::append_push(&mut unlock, self.owner_script.as_bytes());

        let mut trailing = Vec::new();
        if tx.output.len() > 3 {
            for output in &tx.output[3..] {
                trailing.extend_from_slice(&bitcoin::consensus::serialize(output));
            }
        }
        crate::script::append_push(&mut unlock, &trailing);

        let preimage = sighash::input_preimage(
            tx,
            input_index,
            &self.opns.locking_script,
            1,
            sighash::SIGHASH_ALL_ANYONECANPAY_FORKID,
        )?;
        crate::script::append_push(&mut unlock, &preimage);

        Ok(ScriptBuf::from_bytes(unlock))
    }

    /// Size of the unlocking script [`OpnsUnlocker::sign`] will produce.
    pub fn estimate_length(&self, tx: &Transaction, input_index: usize) -> Result<usize, UnlockError> {
        Ok(self.sign(tx, input_index)?.len())
    }
}
