//! FORKID transaction digests.
//!
//! The name contract validates a full sighash preimage on the stack, so the
//! unlock builder needs the exact BIP143-style digest layout used by forkid
//! chains rather than a finished signature hash.

use bitcoin::consensus::serialize;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::Script;
use bitcoin::Transaction;

use crate::beef::write_varint;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// `ALL | ANYONECANPAY | FORKID`, the mode every frontier spend signs with.
pub const SIGHASH_ALL_ANYONECANPAY_FORKID: u32 =
    SIGHASH_ALL | SIGHASH_ANYONECANPAY | SIGHASH_FORKID;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SighashError {
    InputOutOfRange(usize),
}

impl core::fmt::Display for SighashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SighashError::InputOutOfRange(index) => {
                write!(f, "input index {index} out of range")
            }
        }
    }
}

impl std::error::Error for SighashError {}

/// Computes the preimage committing `tx`'s input at `input_index` to the
/// coin it spends (`prev_script`, `prev_value`) under `flags`.
pub fn input_preimage(
    tx: &Transaction,
    input_index: usize,
    prev_script: &Script,
    prev_value: u64,
    flags: u32,
) -> Result<Vec<u8>, SighashError> {
    let input = tx
        .input
        .get(input_index)
        .ok_or(SighashError::InputOutOfRange(input_index))?;
    let base = flags & 0x1f;
    let anyone_can_pay = flags & SIGHASH_ANYONECANPAY != 0;

    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut prevouts = Vec::with_capacity(tx.input.len() * 36);
        for txin in &tx.input {
            prevouts.extend_from_slice(&txin.previous_output.txid.to_byte_array());
            prevouts.extend_from_slice(&txin.previous_output.vout.to_le_bytes());
        }
        sha256d::Hash::hash(&prevouts).to_byte_array()
    };

    let hash_sequence = if anyone_can_pay || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        [0u8; 32]
    } else {
        let mut sequences = Vec::with_capacity(tx.input.len() * 4);
        for txin in &tx.input {
            sequences.extend_from_slice(&txin.sequence.0.to_le_bytes());
        }
        sha256d::Hash::hash(&sequences).to_byte_array()
    };

    let hash_outputs = match base {
        SIGHASH_NONE => [0u8; 32],
        SIGHASH_SINGLE => match tx.output.get(input_index) {
            Some(output) => sha256d::Hash::hash(&serialize(output)).to_byte_array(),
            None => [0u8; 32],
        },
        _ => {
            let mut outputs = Vec::new();
            for output in &tx.output {
                outputs.extend_from_slice(&serialize(output));
            }
            sha256d::Hash::hash(&outputs).to_byte_array()
        }
    };

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.version.0.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(&input.previous_output.txid.to_byte_array());
    preimage.extend_from_slice(&input.previous_output.vout.to_le_bytes());
    write_varint(&mut preimage, prev_script.len() as u64);
    preimage.extend_from_slice(prev_script.as_bytes());
    preimage.extend_from_slice(&prev_value.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.0.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend_from_slice(&flags.to_le_bytes());
    Ok(preimage)
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::Amount;
    use bitcoin::OutPoint;
    use bitcoin::ScriptBuf;
    use bitcoin::Sequence;
    use bitcoin::TxIn;
    use bitcoin::TxOut;
    use bitcoin::Witness;

    use super::*;

    fn test_tx() -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        }
    }

    #[test]
    fn test_preimage_layout() {
        let tx = test_tx();
        let script = ScriptBuf::from_bytes(vec![0xac]);
        let preimage = input_preimage(
            &tx,
            0,
            &script,
            1,
            SIGHASH_ALL_ANYONECANPAY_FORKID,
        )
        .unwrap();

        // version + prevouts + sequences + outpoint + varint + script +
        // value + sequence + outputs + locktime + flags
        assert_eq!(preimage.len(), 4 + 32 + 32 + 36 + 1 + 1 + 8 + 4 + 32 + 4 + 4);
        // ANYONECANPAY blanks the prevouts and sequence digests.
        assert_eq!(&preimage[4..36], &[0u8; 32]);
        assert_eq!(&preimage[36..68], &[0u8; 32]);
        // The trailing flag word is little-endian.
        assert_eq!(&preimage[preimage.len() - 4..], &[0xc1, 0, 0, 0]);
    }

    #[test]
    fn test_preimage_commits_to_outputs() {
        let tx = test_tx();
        let mut other = tx.clone();
        other.output[0].value = Amount::from_sat(2);

        let script = ScriptBuf::from_bytes(vec![0xac]);
        let flags = SIGHASH_ALL_ANYONECANPAY_FORKID;
        let a = input_preimage(&tx, 0, &script, 1, flags).unwrap();
        let b = input_preimage(&other, 0, &script, 1, flags).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_preimage_input_out_of_range() {
        let tx = test_tx();
        let script = ScriptBuf::new();
        assert_eq!(
            input_preimage(&tx, 1, &script, 1, SIGHASH_ALL).unwrap_err(),
            SighashError::InputOutOfRange(1)
        );
    }
}
