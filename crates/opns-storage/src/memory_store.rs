//! A volatile [`OverlayStore`] for tests. Same visible semantics as the
//! kv-backed store, nothing survives the process.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use bitcoin::Txid;
use opns_common::block_score;
use opns_common::Outpoint;
use opns_common::Score;

use crate::Output;
use crate::OverlayStore;
use crate::StoreError;

#[derive(Debug)]
pub enum MemoryStoreError {
    PoisonedLock,
}

impl core::fmt::Display for MemoryStoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryStoreError::PoisonedLock => write!(f, "poisoned lock"),
        }
    }
}

impl std::error::Error for MemoryStoreError {}

impl StoreError for MemoryStoreError {}

type Result<T> = std::result::Result<T, MemoryStoreError>;

#[derive(Debug, Clone, Default)]
struct SharedRecord {
    block_height: u32,
    block_idx: u64,
    satoshis: u64,
    script: bitcoin::ScriptBuf,
}

#[derive(Debug, Clone, Default)]
struct TopicRecord {
    spent: bool,
    outputs_consumed: Vec<Outpoint>,
    consumed_by: Vec<Outpoint>,
    ancillary_txids: Vec<Txid>,
    ancillary_beef: Vec<u8>,
    block_height: u32,
    block_idx: u64,
}

#[derive(Debug, Default)]
struct Inner {
    outputs: HashMap<Outpoint, SharedRecord>,
    topics: HashMap<(Outpoint, String), TopicRecord>,
    memberships: BTreeMap<(String, Score, Outpoint), ()>,
    beef: HashMap<Txid, Vec<u8>>,
    applied: HashSet<(String, Txid)>,
}

#[derive(Debug, Default)]
pub struct MemoryOverlayStore {
    inner: RwLock<Inner>,
}

impl MemoryOverlayStore {
    pub fn new() -> MemoryOverlayStore {
        MemoryOverlayStore::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| MemoryStoreError::PoisonedLock)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| MemoryStoreError::PoisonedLock)
    }
}

impl OverlayStore for MemoryOverlayStore {
    type Error = MemoryStoreError;

    fn insert_output(&self, output: &Output) -> Result<()> {
        let mut inner = self.write()?;
        inner.outputs.insert(
            output.outpoint,
            SharedRecord {
                block_height: output.block_height,
                block_idx: output.block_idx,
                satoshis: output.satoshis,
                script: output.script.clone(),
            },
        );
        inner.topics.insert(
            (output.outpoint, output.topic.clone()),
            TopicRecord {
                spent: output.spent,
                outputs_consumed: output.outputs_consumed.clone(),
                consumed_by: output.consumed_by.clone(),
                ancillary_txids: output.ancillary_txids.clone(),
                ancillary_beef: output.ancillary_beef.clone(),
                block_height: output.block_height,
                block_idx: output.block_idx,
            },
        );
        inner
            .memberships
            .insert((output.topic.clone(), output.score(), output.outpoint), ());
        if !output.beef.is_empty() {
            inner
                .beef
                .entry(output.outpoint.txid)
                .or_insert_with(|| output.beef.clone());
        }
        Ok(())
    }

    fn find_output(
        &self,
        outpoint: &Outpoint,
        topic: Option<&str>,
        spent: Option<bool>,
        include_beef: bool,
    ) -> Result<Option<Output>> {
        let inner = self.read()?;
        let mut output = Output {
            outpoint: *outpoint,
            ..Default::default()
        };

        if let Some(topic) = topic {
            let Some(record) = inner.topics.get(&(*outpoint, topic.to_string())) else {
                return Ok(None);
            };
            if let Some(spent) = spent {
                if record.spent != spent {
                    return Ok(None);
                }
            }
            output.topic = topic.to_string();
            output.spent = record.spent;
            output.outputs_consumed = record.outputs_consumed.clone();
            output.consumed_by = record.consumed_by.clone();
            output.ancillary_txids = record.ancillary_txids.clone();
            output.ancillary_beef = record.ancillary_beef.clone();
        }

        let Some(shared) = inner.outputs.get(outpoint) else {
            return Ok(None);
        };
        output.block_height = shared.block_height;
        output.block_idx = shared.block_idx;
        output.satoshis = shared.satoshis;
        output.script = shared.script.clone();

        if include_beef {
            output.beef = inner.beef.get(&outpoint.txid).cloned().unwrap_or_default();
        }
        Ok(Some(output))
    }

    fn find_outputs_for_transaction(
        &self,
        txid: &Txid,
        include_beef: bool,
    ) -> Result<Vec<Output>> {
        let keys: Vec<(Outpoint, String)> = {
            let inner = self.read()?;
            inner
                .topics
                .keys()
                .filter(|(outpoint, _)| outpoint.txid == *txid)
                .cloned()
                .collect()
        };
        let mut outputs = Vec::new();
        for (outpoint, topic) in keys {
            if let Some(output) = self.find_output(&outpoint, Some(&topic), None, include_beef)? {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    fn find_utxos_for_topic(
        &self,
        topic: &str,
        since: Score,
        include_beef: bool,
    ) -> Result<Vec<Output>> {
        let members: Vec<Outpoint> = {
            let inner = self.read()?;
            inner
                .memberships
                .range(
                    (topic.to_string(), since, Outpoint::from_bytes([0; 36]))
                        ..(format!("{topic}\x01"), 0, Outpoint::from_bytes([0; 36])),
                )
                .map(|((_, _, outpoint), _)| *outpoint)
                .collect()
        };
        let mut outputs = Vec::new();
        for outpoint in members {
            if let Some(output) = self.find_output(&outpoint, Some(topic), None, include_beef)? {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    fn delete_output(&self, outpoint: &Outpoint, topic: &str) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(record) = inner.topics.remove(&(*outpoint, topic.to_string())) {
            let score = block_score(record.block_height, record.block_idx);
            inner
                .memberships
                .remove(&(topic.to_string(), score, *outpoint));
        }
        let still_referenced = inner
            .topics
            .keys()
            .any(|(other, _)| other == outpoint);
        if !still_referenced {
            inner.outputs.remove(outpoint);
        }
        Ok(())
    }

    fn mark_utxo_as_spent(&self, outpoint: &Outpoint, topic: &str) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(record) = inner.topics.get_mut(&(*outpoint, topic.to_string())) {
            record.spent = true;
        }
        Ok(())
    }

    fn update_consumed_by(
        &self,
        outpoint: &Outpoint,
        topic: &str,
        consumed_by: &[Outpoint],
    ) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(record) = inner.topics.get_mut(&(*outpoint, topic.to_string())) {
            record.consumed_by = consumed_by.to_vec();
        }
        Ok(())
    }

    fn update_output_block_height(
        &self,
        outpoint: &Outpoint,
        topic: &str,
        block_height: u32,
        block_idx: u64,
        ancillary_beef: &[u8],
    ) -> Result<()> {
        let mut inner = self.write()?;
        let key = (*outpoint, topic.to_string());
        let Some(record) = inner.topics.get(&key).cloned() else {
            return Ok(());
        };
        let old_score = block_score(record.block_height, record.block_idx);
        inner
            .memberships
            .remove(&(topic.to_string(), old_score, *outpoint));
        inner.memberships.insert(
            (topic.to_string(), block_score(block_height, block_idx), *outpoint),
            (),
        );
        if let Some(record) = inner.topics.get_mut(&key) {
            record.block_height = block_height;
            record.block_idx = block_idx;
            record.ancillary_beef = ancillary_beef.to_vec();
        }
        if let Some(shared) = inner.outputs.get_mut(outpoint) {
            shared.block_height = block_height;
            shared.block_idx = block_idx;
        }
        Ok(())
    }

    fn update_transaction_beef(&self, txid: &Txid, beef: &[u8]) -> Result<()> {
        let mut inner = self.write()?;
        inner.beef.entry(*txid).or_insert_with(|| beef.to_vec());
        Ok(())
    }

    fn insert_applied_transaction(&self, topic: &str, txid: &Txid) -> Result<()> {
        self.write()?.applied.insert((topic.to_string(), *txid));
        Ok(())
    }

    fn does_applied_transaction_exist(&self, topic: &str, txid: &Txid) -> Result<bool> {
        Ok(self.read()?.applied.contains(&(topic.to_string(), *txid)))
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;
    use bitcoin::Txid;

    use super::*;

    const TOPIC: &str = "tm_OpNS";

    fn test_output(tag: u8, height: u32) -> Output {
        Output {
            outpoint: Outpoint::new(Txid::from_byte_array([tag; 32]), 0),
            topic: TOPIC.to_string(),
            satoshis: 1,
            script: ScriptBuf::from_bytes(vec![tag]),
            block_height: height,
            block_idx: 0,
            beef: vec![tag],
            ..Default::default()
        }
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryOverlayStore::new();
        let output = test_output(1, 10);
        store.insert_output(&output).unwrap();

        let found = store
            .find_output(&output.outpoint, Some(TOPIC), None, true)
            .unwrap()
            .unwrap();
        assert_eq!(found.script, output.script);
        assert_eq!(found.beef, output.beef);

        store.mark_utxo_as_spent(&output.outpoint, TOPIC).unwrap();
        assert!(store
            .find_output(&output.outpoint, Some(TOPIC), Some(false), false)
            .unwrap()
            .is_none());

        store.delete_output(&output.outpoint, TOPIC).unwrap();
        assert!(store
            .find_output(&output.outpoint, None, None, false)
            .unwrap()
            .is_none());
        store.delete_output(&output.outpoint, TOPIC).unwrap();
    }

    #[test]
    fn test_memory_store_topic_scan_order() {
        let store = MemoryOverlayStore::new();
        store.insert_output(&test_output(2, 30)).unwrap();
        store.insert_output(&test_output(3, 10)).unwrap();
        store.insert_output(&test_output(4, 20)).unwrap();

        let utxos = store.find_utxos_for_topic(TOPIC, 0, false).unwrap();
        let heights: Vec<_> = utxos.iter().map(|o| o.block_height).collect();
        assert_eq!(heights, vec![10, 20, 30]);

        let later = store
            .find_utxos_for_topic(TOPIC, block_score(20, 0), false)
            .unwrap();
        assert_eq!(later.len(), 2);
    }
}
