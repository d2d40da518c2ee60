// SPDX-License-Identifier: MIT

//! Durable state of the overlay: one record per admitted output and topic,
//! score-ordered topic memberships, content-addressed BEEF blobs and the
//! per-topic applied-transaction set that makes submission idempotent.
//!
//! The [`OverlayStore`] trait is the seam the engine and the event index
//! talk through. [`kv_store::KvOverlayStore`] is the production
//! implementation; an in-memory one backs unit tests behind the
//! `memory-store` feature.

use core::fmt::Debug;

use bitcoin::ScriptBuf;
use bitcoin::Txid;
use opns_common::block_score;
use opns_common::Outpoint;
use opns_common::Score;

pub mod kv_store;
#[cfg(any(test, feature = "memory-store"))]
pub mod memory_store;

/// Marker for errors an [`OverlayStore`] implementation can produce. Lets
/// callers wrap any store's error uniformly.
pub trait StoreError: Debug + Send + Sync + 'static {}

/// One output admitted to one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub outpoint: Outpoint,
    pub topic: String,
    pub satoshis: u64,
    pub script: ScriptBuf,
    pub spent: bool,
    /// Topic coins the producing transaction consumed.
    pub outputs_consumed: Vec<Outpoint>,
    /// Topic outputs that later consumed this one.
    pub consumed_by: Vec<Outpoint>,
    /// Transactions needed beyond the primary envelope to reconstruct the
    /// full SPV chain for this output.
    pub ancillary_txids: Vec<Txid>,
    /// Envelope bytes extending the primary BEEF when needed.
    pub ancillary_beef: Vec<u8>,
    /// Zero while unconfirmed.
    pub block_height: u32,
    pub block_idx: u64,
    /// The producing transaction's envelope; populated only when a read
    /// asks for it.
    pub beef: Vec<u8>,
}

impl Output {
    /// Position of this output in the topic's membership ordering.
    pub fn score(&self) -> Score {
        block_score(self.block_height, self.block_idx)
    }
}

/// Storage contract of the overlay. Writes are idempotent per
/// `(outpoint, topic)`; the BEEF blob keyed by a txid is written at most
/// once.
pub trait OverlayStore: Send + Sync {
    type Error: StoreError;

    /// Persists an output: its per-topic record, the shared record, the
    /// producing transaction's envelope (first writer wins) and its topic
    /// membership at the block score.
    fn insert_output(&self, output: &Output) -> Result<(), Self::Error>;

    /// Reads one output. A `topic` narrows to that topic's record; `spent`
    /// additionally filters on the stored flag.
    fn find_output(
        &self,
        outpoint: &Outpoint,
        topic: Option<&str>,
        spent: Option<bool>,
        include_beef: bool,
    ) -> Result<Option<Output>, Self::Error>;

    fn find_outputs(
        &self,
        outpoints: &[Outpoint],
        topic: Option<&str>,
        spent: Option<bool>,
        include_beef: bool,
    ) -> Result<Vec<Option<Output>>, Self::Error> {
        outpoints
            .iter()
            .map(|outpoint| self.find_output(outpoint, topic, spent, include_beef))
            .collect()
    }

    /// Every (topic, output) record produced by `txid`.
    fn find_outputs_for_transaction(
        &self,
        txid: &Txid,
        include_beef: bool,
    ) -> Result<Vec<Output>, Self::Error>;

    /// Topic membership scan, ascending by score, from `since` onwards.
    fn find_utxos_for_topic(
        &self,
        topic: &str,
        since: Score,
        include_beef: bool,
    ) -> Result<Vec<Output>, Self::Error>;

    /// Removes the per-topic record and membership entry. When the last
    /// topic-scoped record of the outpoint goes, the shared record goes
    /// with it. Envelopes are content-addressed and retained.
    fn delete_output(&self, outpoint: &Outpoint, topic: &str) -> Result<(), Self::Error>;

    fn delete_outputs(&self, outpoints: &[Outpoint], topic: &str) -> Result<(), Self::Error> {
        for outpoint in outpoints {
            self.delete_output(outpoint, topic)?;
        }
        Ok(())
    }

    fn mark_utxo_as_spent(&self, outpoint: &Outpoint, topic: &str) -> Result<(), Self::Error>;

    fn mark_utxos_as_spent(
        &self,
        outpoints: &[Outpoint],
        topic: &str,
    ) -> Result<(), Self::Error> {
        for outpoint in outpoints {
            self.mark_utxo_as_spent(outpoint, topic)?;
        }
        Ok(())
    }

    fn update_consumed_by(
        &self,
        outpoint: &Outpoint,
        topic: &str,
        consumed_by: &[Outpoint],
    ) -> Result<(), Self::Error>;

    /// Re-scores an output after confirmation, moving its membership entry
    /// and replacing its ancillary envelope bytes.
    fn update_output_block_height(
        &self,
        outpoint: &Outpoint,
        topic: &str,
        block_height: u32,
        block_idx: u64,
        ancillary_beef: &[u8],
    ) -> Result<(), Self::Error>;

    /// Write-if-absent for the envelope of `txid`.
    fn update_transaction_beef(&self, txid: &Txid, beef: &[u8]) -> Result<(), Self::Error>;

    fn insert_applied_transaction(&self, topic: &str, txid: &Txid) -> Result<(), Self::Error>;

    fn does_applied_transaction_exist(
        &self,
        topic: &str,
        txid: &Txid,
    ) -> Result<bool, Self::Error>;
}
