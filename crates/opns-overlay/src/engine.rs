//! The submission pipeline and its sibling entry points.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use bitcoin::Txid;
use log::debug;
use log::info;
use opns_common::Outpoint;
use opns_common::Score;
use opns_protocol::beef::parse_beef;
use opns_protocol::beef::MerklePath;
use opns_storage::Output;
use opns_storage::OverlayStore;

use crate::EngineError;
use crate::LookupAnswer;
use crate::LookupQuestion;
use crate::LookupService;
use crate::Steak;
use crate::SubmitMode;
use crate::SyncUtxo;
use crate::TaggedBeef;
use crate::TopicManager;

/// The process-wide overlay engine. One per node; storage and lookup
/// services are injected once at construction and shared by every request.
pub struct Engine<S: OverlayStore> {
    storage: Arc<S>,
    managers: HashMap<String, Box<dyn TopicManager>>,
    lookup_services: HashMap<String, Arc<dyn LookupService>>,
    /// Serialises submissions: each one holds storage and the indexes
    /// exclusively while its state transitions run.
    submission: Mutex<()>,
}

impl<S: OverlayStore> Engine<S> {
    pub fn new(storage: Arc<S>) -> Engine<S> {
        Engine {
            storage,
            managers: HashMap::new(),
            lookup_services: HashMap::new(),
            submission: Mutex::new(()),
        }
    }

    pub fn with_manager(mut self, topic: &str, manager: Box<dyn TopicManager>) -> Self {
        self.managers.insert(topic.to_string(), manager);
        self
    }

    pub fn with_lookup_service(mut self, name: &str, service: Arc<dyn LookupService>) -> Self {
        self.lookup_services.insert(name.to_string(), service);
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Runs admission for every tagged topic and persists the results.
    ///
    /// Idempotent per (transaction, topic): a transaction already recorded
    /// as applied yields empty instructions for that topic. The applied
    /// marker is written only after every other write of the pipeline, so a
    /// crash mid-submission replays cleanly.
    pub fn submit(
        &self,
        tagged: &TaggedBeef,
        mode: SubmitMode,
        on_steak_ready: Option<&dyn Fn(&Steak)>,
    ) -> Result<Steak, EngineError> {
        let _guard = self.submission.lock().expect("poisoned submission lock");

        let (beef, subject) = parse_beef(&tagged.beef)?;
        let txid = subject
            .or_else(|| beef.last_txid())
            .ok_or(EngineError::Beef(
                opns_protocol::beef::BeefError::UnexpectedEof,
            ))?;
        let tx = beef
            .find_transaction(&txid)
            .ok_or(EngineError::Beef(
                opns_protocol::beef::BeefError::UnknownSubject(txid),
            ))?
            .clone();

        // Confirmation position from the subject's merkle path, if it has
        // one yet.
        let (block_height, block_idx) = beef
            .bump_for(&txid)
            .and_then(|bump| {
                bump.block_index_of(&txid)
                    .map(|idx| (bump.block_height, idx))
            })
            .unwrap_or((0, 0));

        let ancillary_txids: Vec<Txid> = {
            let mut txids: Vec<Txid> = Vec::new();
            for input in &tx.input {
                let source = input.previous_output.txid;
                if source != txid && !txids.contains(&source) {
                    txids.push(source);
                }
            }
            txids
        };

        let mut steak = Steak::new();
        for topic in &tagged.topics {
            let manager = self
                .managers
                .get(topic)
                .ok_or_else(|| EngineError::UnknownTopic(topic.clone()))?;

            if self
                .storage
                .does_applied_transaction_exist(topic, &txid)
                .map_err(EngineError::storage)?
            {
                debug!("{txid} already applied to {topic}, skipping");
                steak.insert(topic.clone(), Default::default());
                continue;
            }

            // Which of the inputs spend coins we admitted earlier.
            let mut previous_coins = Vec::new();
            for (vin, input) in tx.input.iter().enumerate() {
                let outpoint = Outpoint::from(input.previous_output);
                if self
                    .storage
                    .find_output(&outpoint, Some(topic), None, false)
                    .map_err(EngineError::storage)?
                    .is_some()
                {
                    previous_coins.push(vin as u32);
                }
            }

            let admit = manager.identify_admissable_outputs(&tagged.beef, &previous_coins)?;

            // Every consumed topic coin is marked spent; spent coins stay
            // around until an explicit purge.
            let consumed: Vec<Outpoint> = previous_coins
                .iter()
                .map(|vin| Outpoint::from(tx.input[*vin as usize].previous_output))
                .collect();
            if !consumed.is_empty() {
                self.storage
                    .mark_utxos_as_spent(&consumed, topic)
                    .map_err(EngineError::storage)?;
                for service in self.lookup_services.values() {
                    service.outputs_spent(&consumed, topic)?;
                }
            }

            let admitted: Vec<Outpoint> = admit
                .outputs_to_admit
                .iter()
                .map(|vout| Outpoint::new(txid, *vout))
                .collect();

            for &vout in &admit.outputs_to_admit {
                let txout = tx
                    .output
                    .get(vout as usize)
                    .ok_or(EngineError::MissingOutput(vout))?;
                let output = Output {
                    outpoint: Outpoint::new(txid, vout),
                    topic: topic.clone(),
                    satoshis: txout.value.to_sat(),
                    script: txout.script_pubkey.clone(),
                    spent: false,
                    outputs_consumed: consumed.clone(),
                    consumed_by: Vec::new(),
                    ancillary_txids: ancillary_txids.clone(),
                    ancillary_beef: Vec::new(),
                    block_height,
                    block_idx,
                    beef: tagged.beef.clone(),
                };
                self.storage
                    .insert_output(&output)
                    .map_err(EngineError::storage)?;
                for service in self.lookup_services.values() {
                    service.output_added(
                        &output.outpoint,
                        &txout.script_pubkey,
                        topic,
                        block_height,
                        block_idx,
                    )?;
                }
            }

            // Back-links from the consumed coins to their consumers.
            for outpoint in &consumed {
                if let Some(existing) = self
                    .storage
                    .find_output(outpoint, Some(topic), None, false)
                    .map_err(EngineError::storage)?
                {
                    let mut consumed_by = existing.consumed_by;
                    for admitted_outpoint in &admitted {
                        if !consumed_by.contains(admitted_outpoint) {
                            consumed_by.push(*admitted_outpoint);
                        }
                    }
                    self.storage
                        .update_consumed_by(outpoint, topic, &consumed_by)
                        .map_err(EngineError::storage)?;
                }
            }

            // Last write: the idempotence marker.
            self.storage
                .insert_applied_transaction(topic, &txid)
                .map_err(EngineError::storage)?;
            info!(
                "applied {txid} to {topic} ({mode:?}): admitted {:?}",
                admit.outputs_to_admit
            );
            steak.insert(topic.clone(), admit);
        }

        if let Some(hook) = on_steak_ready {
            hook(&steak);
        }
        Ok(steak)
    }

    /// Routes a query to the named lookup service.
    pub fn lookup(&self, question: &LookupQuestion) -> Result<LookupAnswer, EngineError> {
        let service = self
            .lookup_services
            .get(&question.service)
            .ok_or_else(|| EngineError::UnknownService(question.service.clone()))?;
        service.lookup(question)
    }

    /// Applies a freshly learned merkle path to every record of `txid` and
    /// re-scores the affected index entries.
    pub fn handle_new_merkle_proof(
        &self,
        txid: &Txid,
        proof: &MerklePath,
    ) -> Result<(), EngineError> {
        let _guard = self.submission.lock().expect("poisoned submission lock");

        let block_idx = proof.block_index_of(txid).ok_or(EngineError::Beef(
            opns_protocol::beef::BeefError::TxidNotInPath(*txid),
        ))?;

        let outputs = self
            .storage
            .find_outputs_for_transaction(txid, false)
            .map_err(EngineError::storage)?;
        if outputs.is_empty() {
            return Err(EngineError::OutputNotFound(Outpoint::new(*txid, 0)));
        }
        for output in outputs {
            self.storage
                .update_output_block_height(
                    &output.outpoint,
                    &output.topic,
                    proof.block_height,
                    block_idx,
                    &output.ancillary_beef,
                )
                .map_err(EngineError::storage)?;
            for service in self.lookup_services.values() {
                service.output_block_height_updated(
                    &output.outpoint,
                    proof.block_height,
                    block_idx,
                )?;
            }
        }
        Ok(())
    }

    /// Initial sync handshake: the topic membership from `since` onwards.
    pub fn provide_foreign_sync_response(
        &self,
        topic: &str,
        since: Score,
    ) -> Result<Vec<SyncUtxo>, EngineError> {
        let outputs = self
            .storage
            .find_utxos_for_topic(topic, since, false)
            .map_err(EngineError::storage)?;
        Ok(outputs
            .iter()
            .map(|output| SyncUtxo {
                outpoint: output.outpoint,
                score: output.score(),
            })
            .collect())
    }

    /// Node-by-node sync pull: the atomic envelope for one outpoint.
    pub fn provide_foreign_gasp_node(&self, outpoint: &Outpoint) -> Result<Vec<u8>, EngineError> {
        let output = self
            .storage
            .find_output(outpoint, None, None, true)
            .map_err(EngineError::storage)?
            .ok_or(EngineError::OutputNotFound(*outpoint))?;
        let (mut beef, _) = parse_beef(&output.beef)?;
        if !output.ancillary_beef.is_empty() {
            beef.merge_beef_bytes(&output.ancillary_beef)?;
        }
        Ok(beef.to_atomic_bytes(&outpoint.txid)?)
    }
}
