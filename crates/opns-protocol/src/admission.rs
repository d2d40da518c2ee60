//! Topic admission: which outputs of a submitted transaction belong to the
//! OpNS overlay.
//!
//! Admission is purely syntactic. It decides membership from the envelope
//! and the caller-supplied set of inputs that already belong to the topic;
//! whether the contract itself accepts the spend is the chain's business.

use opns_common::Outpoint;

use crate::beef::parse_beef;
use crate::beef::BeefError;
use crate::genesis;
use crate::script::Opns;

/// What a topic admits from one transaction: output indices to take in and
/// which of the caller's input coins stay in the topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmittanceInstructions {
    pub outputs_to_admit: Vec<u32>,
    pub coins_to_retain: Vec<u32>,
}

#[derive(Debug)]
pub enum AdmissionError {
    Beef(BeefError),
    /// The envelope carries no transactions.
    EmptyEnvelope,
    /// `previous_coins` named an input the transaction doesn't have.
    MissingInput(u32),
    /// An input's source transaction is absent from the envelope.
    MissingSource(u32),
}

impl core::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AdmissionError::Beef(e) => write!(f, "envelope: {e}"),
            AdmissionError::EmptyEnvelope => write!(f, "envelope carries no transactions"),
            AdmissionError::MissingInput(vin) => {
                write!(f, "previous coin {vin} is not an input of the transaction")
            }
            AdmissionError::MissingSource(vin) => {
                write!(f, "source transaction for input {vin} missing from envelope")
            }
        }
    }
}

impl std::error::Error for AdmissionError {}

opns_common::impl_error_from!(AdmissionError, BeefError, Beef);

/// The OpNS topic's admission rules over a BEEF envelope.
#[derive(Debug, Clone)]
pub struct OpnsTopicManager {
    genesis: Outpoint,
}

impl Default for OpnsTopicManager {
    fn default() -> Self {
        OpnsTopicManager::new()
    }
}

impl OpnsTopicManager {
    /// Rules anchored at the well-known genesis outpoint.
    pub fn new() -> Self {
        OpnsTopicManager {
            genesis: *genesis(),
        }
    }

    /// Rules anchored at a custom genesis. For private deployments and
    /// tests.
    pub fn with_genesis(genesis: Outpoint) -> Self {
        OpnsTopicManager { genesis }
    }

    /// Decides the admitted output set for the envelope's subject
    /// transaction.
    ///
    /// - The genesis transaction admits exactly output 0.
    /// - A transaction spending a decodable frontier (or referencing the
    ///   genesis txid directly) admits outputs 0, 1 and 2 and retains every
    ///   previous coin.
    /// - A transaction consuming a 1-sat topic coin carries it forward to
    ///   the output at the matching cumulative-satoshi position, admitted
    ///   only if that output holds exactly 1 satoshi. Zero-sat outputs at
    ///   the position are skipped without advancing it.
    pub fn identify_admissable_outputs(
        &self,
        beef_bytes: &[u8],
        previous_coins: &[u32],
    ) -> Result<AdmittanceInstructions, AdmissionError> {
        let (beef, subject) = parse_beef(beef_bytes)?;
        let txid = subject
            .or_else(|| beef.last_txid())
            .ok_or(AdmissionError::EmptyEnvelope)?;
        let tx = beef
            .find_transaction(&txid)
            .ok_or(AdmissionError::EmptyEnvelope)?;

        let mut admit = AdmittanceInstructions::default();
        if txid == self.genesis.txid {
            admit.outputs_to_admit.push(0);
            return Ok(admit);
        }
        if previous_coins.is_empty() {
            return Ok(admit);
        }

        for &vin in previous_coins {
            let input = tx
                .input
                .get(vin as usize)
                .ok_or(AdmissionError::MissingInput(vin))?;

            // Backstop for the first generation: the genesis coin itself
            // counts as a frontier even without its source transaction.
            let spends_frontier = if input.previous_output.txid == self.genesis.txid {
                true
            } else {
                let source = beef
                    .source_output(tx, vin as usize)
                    .ok_or(AdmissionError::MissingSource(vin))?;
                Opns::decode(&source.script_pubkey).is_some()
            };

            if spends_frontier {
                admit.coins_to_retain = previous_coins.to_vec();
                admit.outputs_to_admit = vec![0, 1, 2];
                return Ok(admit);
            }

            let source = beef
                .source_output(tx, vin as usize)
                .ok_or(AdmissionError::MissingSource(vin))?;
            if source.value.to_sat() != 1 {
                continue;
            }

            // Ordinal carry: the 1-sat payload travels to the output at the
            // same cumulative-satoshi position.
            let mut sats_in = 0u64;
            for prior in 0..vin as usize {
                let source = beef
                    .source_output(tx, prior)
                    .ok_or(AdmissionError::MissingSource(prior as u32))?;
                sats_in += source.value.to_sat();
            }

            let mut sats_out = 0u64;
            for (vout, output) in tx.output.iter().enumerate() {
                if sats_out < sats_in {
                    sats_out += output.value.to_sat();
                    continue;
                }
                if sats_out == sats_in {
                    let sats = output.value.to_sat();
                    if sats == 0 {
                        // Skipped without advancing the position.
                        continue;
                    }
                    if sats == 1 && !admit.outputs_to_admit.contains(&(vout as u32)) {
                        admit.coins_to_retain = previous_coins.to_vec();
                        admit.outputs_to_admit.push(vout as u32);
                    }
                }
                break;
            }
        }

        Ok(admit)
    }

    /// The engine never demands ancestry beyond what the caller supplied.
    pub fn identify_needed_inputs(&self, _beef_bytes: &[u8]) -> Result<Vec<Outpoint>, AdmissionError> {
        Ok(Vec::new())
    }
}
