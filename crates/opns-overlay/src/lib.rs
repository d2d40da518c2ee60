// SPDX-License-Identifier: MIT

//! The overlay engine.
//!
//! An [`engine::Engine`] owns the process-wide storage handle and a set of
//! topic managers and lookup services. Submitting a transaction envelope
//! runs per-topic admission, persists the admitted outputs, and feeds the
//! lookup services in admission order; everything downstream (event
//! indexing, notifications) hangs off the [`LookupService`] seam.

pub mod engine;

use std::collections::HashMap;

use bitcoin::Script;
use opns_common::Outpoint;
use opns_protocol::admission::AdmissionError;
use opns_protocol::admission::AdmittanceInstructions;
use opns_protocol::admission::OpnsTopicManager;
use opns_protocol::beef::BeefError;
use opns_storage::StoreError;
use serde::Serialize;

pub use engine::Engine;

/// An envelope tagged with the topics it should be considered for.
#[derive(Debug, Clone)]
pub struct TaggedBeef {
    pub topics: Vec<String>,
    pub beef: Vec<u8>,
}

/// How a submission reached us. Historical submissions come from the
/// ingestion driver replaying the chain; current ones arrive live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Current,
    Historical,
}

/// Per-topic admittance results of one submission.
pub type Steak = HashMap<String, AdmittanceInstructions>;

/// A query addressed to a named lookup service.
#[derive(Debug, Clone)]
pub struct LookupQuestion {
    pub service: String,
    /// Service-specific JSON query.
    pub query: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputListItem {
    #[serde(rename = "outputIndex")]
    pub output_index: u32,
    /// Atomic envelope committing to the outpoint's transaction.
    pub beef: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupAnswer {
    #[serde(rename = "type")]
    pub answer_type: String,
    pub outputs: Vec<OutputListItem>,
}

impl LookupAnswer {
    pub fn output_list(outputs: Vec<OutputListItem>) -> LookupAnswer {
        LookupAnswer {
            answer_type: "output-list".to_string(),
            outputs,
        }
    }
}

/// A topic membership entry, as exchanged during sync handshakes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncUtxo {
    pub outpoint: Outpoint,
    pub score: opns_common::Score,
}

#[derive(Debug)]
pub enum EngineError {
    Storage(Box<dyn StoreError>),
    Beef(BeefError),
    Admission(AdmissionError),
    UnknownTopic(String),
    UnknownService(String),
    /// Admission named an output index the transaction doesn't have.
    MissingOutput(u32),
    OutputNotFound(Outpoint),
    InvalidQuery(serde_json::Error),
    /// An event-index failure surfaced through a lookup service.
    Index(String),
}

impl core::fmt::Display for EngineError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EngineError::Storage(e) => write!(f, "storage: {e:?}"),
            EngineError::Beef(e) => write!(f, "envelope: {e}"),
            EngineError::Admission(e) => write!(f, "admission: {e}"),
            EngineError::UnknownTopic(topic) => write!(f, "no manager for topic {topic}"),
            EngineError::UnknownService(service) => {
                write!(f, "no lookup service named {service}")
            }
            EngineError::MissingOutput(vout) => {
                write!(f, "admitted output {vout} not present in transaction")
            }
            EngineError::OutputNotFound(outpoint) => write!(f, "output {outpoint} not found"),
            EngineError::InvalidQuery(e) => write!(f, "invalid query: {e}"),
            EngineError::Index(e) => write!(f, "event index: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Wraps a store's error. A blanket `From` would conflict with the
    /// conversions below, so storage call sites use
    /// `.map_err(EngineError::storage)` instead.
    pub fn storage<E: StoreError>(e: E) -> EngineError {
        EngineError::Storage(Box::new(e))
    }
}

opns_common::impl_error_from!(EngineError, BeefError, Beef);
opns_common::impl_error_from!(EngineError, AdmissionError, Admission);

/// Decides topic membership for submitted envelopes.
pub trait TopicManager: Send + Sync {
    fn identify_admissable_outputs(
        &self,
        beef: &[u8],
        previous_coins: &[u32],
    ) -> Result<AdmittanceInstructions, EngineError>;

    /// Outpoints the manager needs resolved beyond what the envelope
    /// carries.
    fn identify_needed_inputs(&self, beef: &[u8]) -> Result<Vec<Outpoint>, EngineError>;
}

impl TopicManager for OpnsTopicManager {
    fn identify_admissable_outputs(
        &self,
        beef: &[u8],
        previous_coins: &[u32],
    ) -> Result<AdmittanceInstructions, EngineError> {
        Ok(OpnsTopicManager::identify_admissable_outputs(self, beef, previous_coins)?)
    }

    fn identify_needed_inputs(&self, beef: &[u8]) -> Result<Vec<Outpoint>, EngineError> {
        Ok(OpnsTopicManager::identify_needed_inputs(self, beef)?)
    }
}

/// Downstream consumer of admission results: the event index in this
/// system, but anything implementing the seam can ride along.
pub trait LookupService: Send + Sync {
    /// A new output was admitted to `topic`. Called in admission order.
    fn output_added(
        &self,
        outpoint: &Outpoint,
        script: &Script,
        topic: &str,
        block_height: u32,
        block_idx: u64,
    ) -> Result<(), EngineError>;

    fn output_spent(&self, outpoint: &Outpoint, topic: &str) -> Result<(), EngineError>;

    fn outputs_spent(&self, outpoints: &[Outpoint], topic: &str) -> Result<(), EngineError> {
        for outpoint in outpoints {
            self.output_spent(outpoint, topic)?;
        }
        Ok(())
    }

    fn output_deleted(&self, outpoint: &Outpoint, topic: &str) -> Result<(), EngineError>;

    fn output_block_height_updated(
        &self,
        outpoint: &Outpoint,
        block_height: u32,
        block_idx: u64,
    ) -> Result<(), EngineError>;

    fn lookup(&self, question: &LookupQuestion) -> Result<LookupAnswer, EngineError>;
}
