//! Key-value backed [`OverlayStore`].
//!
//! Bucket layout, all values JSON unless noted:
//!
//! - `outputs`: `<outpoint>` → shared record (height, index, satoshis,
//!   script)
//! - `output_topics`: `<outpoint>:<topic>` → per-topic record (spent flag,
//!   consumed links, ancillary envelope data)
//! - `memberships`: `<topic> 0x00 <score:020> <outpoint>` → outpoint; the
//!   zero-padded decimal score makes a prefix scan walk a topic in score
//!   order
//! - `beef`: `<txid>` → raw envelope bytes, first writer wins
//! - `applied`: `<topic>:<txid>` → marker

use bitcoin::ScriptBuf;
use bitcoin::Txid;
use kv::Bucket;
use kv::Config;
use kv::Store;
use opns_common::impl_error_from;
use opns_common::Outpoint;
use opns_common::OutpointParseError;
use opns_common::Score;
use serde::Deserialize;
use serde::Serialize;

use crate::Output;
use crate::OverlayStore;
use crate::StoreError;

pub struct KvOverlayStore {
    store: Store,
    outputs: Bucket<'static, String, Vec<u8>>,
}

#[derive(Debug)]
pub enum KvStoreError {
    Kv(kv::Error),
    Serde(serde_json::Error),
    BadOutpoint(OutpointParseError),
    /// A bucket key did not have the expected shape.
    CorruptKey(String),
}

impl core::fmt::Display for KvStoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KvStoreError::Kv(e) => write!(f, "kv: {e}"),
            KvStoreError::Serde(e) => write!(f, "record encoding: {e}"),
            KvStoreError::BadOutpoint(e) => write!(f, "outpoint key: {e}"),
            KvStoreError::CorruptKey(key) => write!(f, "corrupt bucket key: {key}"),
        }
    }
}

impl std::error::Error for KvStoreError {}

impl_error_from!(KvStoreError, kv::Error, Kv);
impl_error_from!(KvStoreError, serde_json::Error, Serde);
impl_error_from!(KvStoreError, OutpointParseError, BadOutpoint);

impl StoreError for KvStoreError {}

type Result<T> = std::result::Result<T, KvStoreError>;

/// Shared part of an output record, one per outpoint.
#[derive(Debug, Serialize, Deserialize)]
struct OutputRecord {
    h: u32,
    i: u64,
    st: u64,
    sc: ScriptBuf,
}

/// Per-topic part of an output record.
#[derive(Debug, Serialize, Deserialize)]
struct TopicRecord {
    t: String,
    sp: bool,
    #[serde(default)]
    c: Vec<Outpoint>,
    #[serde(default)]
    cb: Vec<Outpoint>,
    #[serde(default)]
    at: Vec<Txid>,
    #[serde(default)]
    ab: Vec<u8>,
    h: u32,
    i: u64,
}

fn topic_key(outpoint: &Outpoint, topic: &str) -> String {
    format!("{outpoint}:{topic}")
}

fn applied_key(topic: &str, txid: &Txid) -> String {
    format!("{topic}:{txid}")
}

fn membership_prefix(topic: &str) -> String {
    format!("{topic}\x00")
}

fn membership_key(topic: &str, score: Score, outpoint: &str) -> String {
    format!("{topic}\x00{score:020}{outpoint}")
}

impl KvOverlayStore {
    /// Opens (or creates) the store under `path`.
    pub fn open(path: &str) -> Result<KvOverlayStore> {
        let store = Store::new(Config::new(path))?;
        Self::with_store(store)
    }

    /// Wraps an already opened [`Store`], so the overlay and the event
    /// index can share one database.
    pub fn with_store(store: Store) -> Result<KvOverlayStore> {
        let outputs = store.bucket::<String, Vec<u8>>(Some("outputs"))?;
        Ok(KvOverlayStore { store, outputs })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn topics(&self) -> Result<Bucket<'static, String, Vec<u8>>> {
        self.store
            .bucket(Some("output_topics"))
            .map_err(KvStoreError::Kv)
    }

    fn beef(&self) -> Result<Bucket<'static, String, Vec<u8>>> {
        self.store.bucket(Some("beef")).map_err(KvStoreError::Kv)
    }

    fn memberships(&self) -> Result<Bucket<'static, String, Vec<u8>>> {
        self.store
            .bucket(Some("memberships"))
            .map_err(KvStoreError::Kv)
    }

    fn applied(&self) -> Result<Bucket<'static, String, Vec<u8>>> {
        self.store.bucket(Some("applied")).map_err(KvStoreError::Kv)
    }

    fn read_topic_record(&self, outpoint: &Outpoint, topic: &str) -> Result<Option<TopicRecord>> {
        let raw = self.topics()?.get(&topic_key(outpoint, topic))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_topic_record(
        &self,
        outpoint: &Outpoint,
        topic: &str,
        record: &TopicRecord,
    ) -> Result<()> {
        let topics = self.topics()?;
        topics.set(&topic_key(outpoint, topic), &serde_json::to_vec(record)?)?;
        topics.flush()?;
        Ok(())
    }
}

impl OverlayStore for KvOverlayStore {
    type Error = KvStoreError;

    fn insert_output(&self, output: &Output) -> Result<()> {
        let outpoint = output.outpoint.to_string();

        self.outputs.set(
            &outpoint,
            &serde_json::to_vec(&OutputRecord {
                h: output.block_height,
                i: output.block_idx,
                st: output.satoshis,
                sc: output.script.clone(),
            })?,
        )?;

        self.write_topic_record(
            &output.outpoint,
            &output.topic,
            &TopicRecord {
                t: output.topic.clone(),
                sp: output.spent,
                c: output.outputs_consumed.clone(),
                cb: output.consumed_by.clone(),
                at: output.ancillary_txids.clone(),
                ab: output.ancillary_beef.clone(),
                h: output.block_height,
                i: output.block_idx,
            },
        )?;

        if !output.beef.is_empty() {
            self.update_transaction_beef(&output.outpoint.txid, &output.beef)?;
        }

        let memberships = self.memberships()?;
        memberships.set(
            &membership_key(&output.topic, output.score(), &outpoint),
            &outpoint.clone().into_bytes(),
        )?;
        memberships.flush()?;
        self.outputs.flush()?;
        Ok(())
    }

    fn find_output(
        &self,
        outpoint: &Outpoint,
        topic: Option<&str>,
        spent: Option<bool>,
        include_beef: bool,
    ) -> Result<Option<Output>> {
        let mut output = Output {
            outpoint: *outpoint,
            ..Default::default()
        };

        if let Some(topic) = topic {
            let Some(record) = self.read_topic_record(outpoint, topic)? else {
                return Ok(None);
            };
            if let Some(spent) = spent {
                if record.sp != spent {
                    return Ok(None);
                }
            }
            output.topic = record.t;
            output.spent = record.sp;
            output.outputs_consumed = record.c;
            output.consumed_by = record.cb;
            output.ancillary_txids = record.at;
            output.ancillary_beef = record.ab;
        }

        let Some(raw) = self.outputs.get(&outpoint.to_string())? else {
            return Ok(None);
        };
        let record: OutputRecord = serde_json::from_slice(&raw)?;
        output.block_height = record.h;
        output.block_idx = record.i;
        output.satoshis = record.st;
        output.script = record.sc;

        if include_beef {
            output.beef = self
                .beef()?
                .get(&outpoint.txid.to_string())?
                .unwrap_or_default();
        }
        Ok(Some(output))
    }

    fn find_outputs_for_transaction(
        &self,
        txid: &Txid,
        include_beef: bool,
    ) -> Result<Vec<Output>> {
        let topics = self.topics()?;
        let mut outputs = Vec::new();
        for item in topics.iter_prefix(&txid.to_string())? {
            let item = item?;
            let key = item.key::<String>()?;
            let (outpoint, topic) = key
                .split_once(':')
                .ok_or_else(|| KvStoreError::CorruptKey(key.clone()))?;
            let outpoint: Outpoint = outpoint.parse()?;
            if let Some(output) = self.find_output(&outpoint, Some(topic), None, include_beef)? {
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
        let memberships = self.memberships()?;
        let prefix = membership_prefix(topic);
        let mut outputs = Vec::new();
        for item in memberships.iter_prefix(&prefix)? {
            let item = item?;
            let key = item.key::<String>()?;
            let score: Score = key
                .get(prefix.len()..prefix.len() + 20)
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| KvStoreError::CorruptKey(key.clone()))?;
            if score < since {
                continue;
            }
            let outpoint = String::from_utf8(item.value::<Vec<u8>>()?)
                .map_err(|e| KvStoreError::CorruptKey(e.to_string()))?;
            let outpoint: Outpoint = outpoint.parse()?;
            if let Some(output) = self.find_output(&outpoint, Some(topic), None, include_beef)? {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    fn delete_output(&self, outpoint: &Outpoint, topic: &str) -> Result<()> {
        let key = outpoint.to_string();
        let topics = self.topics()?;

        if let Some(record) = self.read_topic_record(outpoint, topic)? {
            let memberships = self.memberships()?;
            let score = opns_common::block_score(record.h, record.i);
            memberships.remove(&membership_key(topic, score, &key))?;
            memberships.flush()?;
        }
        topics.remove(&topic_key(outpoint, topic))?;

        // Drop the shared record once no topic references the outpoint.
        let mut prefix = key.clone();
        prefix.push(':');
        if topics.iter_prefix(&prefix)?.next().is_none() {
            self.outputs.remove(&key)?;
            self.outputs.flush()?;
        }
        topics.flush()?;
        Ok(())
    }

    fn mark_utxo_as_spent(&self, outpoint: &Outpoint, topic: &str) -> Result<()> {
        if let Some(mut record) = self.read_topic_record(outpoint, topic)? {
            record.sp = true;
            self.write_topic_record(outpoint, topic, &record)?;
        }
        Ok(())
    }

    fn update_consumed_by(
        &self,
        outpoint: &Outpoint,
        topic: &str,
        consumed_by: &[Outpoint],
    ) -> Result<()> {
        if let Some(mut record) = self.read_topic_record(outpoint, topic)? {
            record.cb = consumed_by.to_vec();
            self.write_topic_record(outpoint, topic, &record)?;
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
        let key = outpoint.to_string();
        let Some(mut record) = self.read_topic_record(outpoint, topic)? else {
            return Ok(());
        };

        let memberships = self.memberships()?;
        let old_score = opns_common::block_score(record.h, record.i);
        memberships.remove(&membership_key(topic, old_score, &key))?;

        record.h = block_height;
        record.i = block_idx;
        record.ab = ancillary_beef.to_vec();
        self.write_topic_record(outpoint, topic, &record)?;

        let new_score = opns_common::block_score(block_height, block_idx);
        memberships.set(&membership_key(topic, new_score, &key), &key.clone().into_bytes())?;
        memberships.flush()?;

        if let Some(raw) = self.outputs.get(&key)? {
            let mut shared: OutputRecord = serde_json::from_slice(&raw)?;
            shared.h = block_height;
            shared.i = block_idx;
            self.outputs.set(&key, &serde_json::to_vec(&shared)?)?;
            self.outputs.flush()?;
        }
        Ok(())
    }

    fn update_transaction_beef(&self, txid: &Txid, beef: &[u8]) -> Result<()> {
        let bucket = self.beef()?;
        let key = txid.to_string();
        if bucket.get(&key)?.is_none() {
            bucket.set(&key, &beef.to_vec())?;
            bucket.flush()?;
        }
        Ok(())
    }

    fn insert_applied_transaction(&self, topic: &str, txid: &Txid) -> Result<()> {
        let applied = self.applied()?;
        applied.set(&applied_key(topic, txid), &vec![1u8])?;
        applied.flush()?;
        Ok(())
    }

    fn does_applied_transaction_exist(&self, topic: &str, txid: &Txid) -> Result<bool> {
        Ok(self.applied()?.get(&applied_key(topic, txid))?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;
    use bitcoin::Txid;
    use opns_common::block_score;

    use super::*;

    const TOPIC: &str = "tm_OpNS";

    fn get_test_store() -> KvOverlayStore {
        let test_id = rand::random::<u32>();
        KvOverlayStore::open(&format!("./tmp-db/{test_id}.opns/")).unwrap()
    }

    fn test_outpoint(tag: u8, vout: u32) -> Outpoint {
        Outpoint::new(Txid::from_byte_array([tag; 32]), vout)
    }

    fn test_output(tag: u8, vout: u32, height: u32, idx: u64) -> Output {
        Output {
            outpoint: test_outpoint(tag, vout),
            topic: TOPIC.to_string(),
            satoshis: 1,
            script: ScriptBuf::from_bytes(vec![0x51, tag]),
            block_height: height,
            block_idx: idx,
            beef: vec![0xbe, 0xef, tag],
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_find() {
        let store = get_test_store();
        let output = test_output(1, 0, 100, 2);
        store.insert_output(&output).unwrap();

        let found = store
            .find_output(&output.outpoint, Some(TOPIC), None, true)
            .unwrap()
            .unwrap();
        assert_eq!(found.satoshis, 1);
        assert_eq!(found.script, output.script);
        assert_eq!(found.block_height, 100);
        assert_eq!(found.block_idx, 2);
        assert_eq!(found.beef, output.beef);
        assert!(!found.spent);

        // Unknown topic yields nothing; no topic filter still resolves.
        assert!(store
            .find_output(&output.outpoint, Some("tm_other"), None, false)
            .unwrap()
            .is_none());
        assert!(store
            .find_output(&output.outpoint, None, None, false)
            .unwrap()
            .is_some());

        // Insertion is idempotent for the same (outpoint, topic).
        store.insert_output(&output).unwrap();
        assert_eq!(store.find_outputs_for_transaction(&output.outpoint.txid, false).unwrap().len(), 1);
    }

    #[test]
    fn test_beef_is_write_once() {
        let store = get_test_store();
        let output = test_output(2, 0, 1, 1);
        store.insert_output(&output).unwrap();

        store
            .update_transaction_beef(&output.outpoint.txid, &[0xff])
            .unwrap();
        let found = store
            .find_output(&output.outpoint, Some(TOPIC), None, true)
            .unwrap()
            .unwrap();
        assert_eq!(found.beef, output.beef);
    }

    #[test]
    fn test_spent_filter() {
        let store = get_test_store();
        let output = test_output(3, 0, 1, 1);
        store.insert_output(&output).unwrap();

        assert!(store
            .find_output(&output.outpoint, Some(TOPIC), Some(true), false)
            .unwrap()
            .is_none());

        store.mark_utxo_as_spent(&output.outpoint, TOPIC).unwrap();
        assert!(store
            .find_output(&output.outpoint, Some(TOPIC), Some(true), false)
            .unwrap()
            .is_some());
        assert!(store
            .find_output(&output.outpoint, Some(TOPIC), Some(false), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_membership_order_and_since() {
        let store = get_test_store();
        store.insert_output(&test_output(4, 0, 10, 0)).unwrap();
        store.insert_output(&test_output(5, 0, 5, 3)).unwrap();
        store.insert_output(&test_output(6, 0, 20, 1)).unwrap();

        let all = store.find_utxos_for_topic(TOPIC, 0, false).unwrap();
        let scores: Vec<_> = all.iter().map(Output::score).collect();
        assert_eq!(
            scores,
            vec![block_score(5, 3), block_score(10, 0), block_score(20, 1)]
        );

        let since = store
            .find_utxos_for_topic(TOPIC, block_score(10, 0), false)
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[test]
    fn test_delete_output() {
        let store = get_test_store();
        let output = test_output(7, 0, 1, 1);
        store.insert_output(&output).unwrap();

        let mut second = output.clone();
        second.topic = "tm_other".to_string();
        store.insert_output(&second).unwrap();

        store.delete_output(&output.outpoint, TOPIC).unwrap();
        assert!(store
            .find_output(&output.outpoint, Some(TOPIC), None, false)
            .unwrap()
            .is_none());
        // The shared record survives while another topic references it.
        assert!(store
            .find_output(&output.outpoint, None, None, false)
            .unwrap()
            .is_some());

        store.delete_output(&output.outpoint, "tm_other").unwrap();
        assert!(store
            .find_output(&output.outpoint, None, None, false)
            .unwrap()
            .is_none());
        assert!(store.find_utxos_for_topic(TOPIC, 0, false).unwrap().is_empty());

        // Deleting again is a no-op.
        store.delete_output(&output.outpoint, TOPIC).unwrap();
    }

    #[test]
    fn test_update_block_height_moves_membership() {
        let store = get_test_store();
        let output = test_output(8, 0, 0, 0);
        store.insert_output(&output).unwrap();

        store
            .update_output_block_height(&output.outpoint, TOPIC, 500, 7, &[0xaa])
            .unwrap();

        let found = store
            .find_output(&output.outpoint, Some(TOPIC), None, false)
            .unwrap()
            .unwrap();
        assert_eq!(found.block_height, 500);
        assert_eq!(found.block_idx, 7);
        assert_eq!(found.ancillary_beef, vec![0xaa]);

        let utxos = store
            .find_utxos_for_topic(TOPIC, block_score(499, 0), false)
            .unwrap();
        assert_eq!(utxos.len(), 1);
    }

    #[test]
    fn test_consumed_by_round_trip() {
        let store = get_test_store();
        let output = test_output(9, 0, 1, 1);
        store.insert_output(&output).unwrap();

        let consumer = test_outpoint(10, 2);
        store
            .update_consumed_by(&output.outpoint, TOPIC, &[consumer])
            .unwrap();
        let found = store
            .find_output(&output.outpoint, Some(TOPIC), None, false)
            .unwrap()
            .unwrap();
        assert_eq!(found.consumed_by, vec![consumer]);
    }

    #[test]
    fn test_applied_transactions() {
        let store = get_test_store();
        let txid = Txid::from_byte_array([11; 32]);
        assert!(!store.does_applied_transaction_exist(TOPIC, &txid).unwrap());
        store.insert_applied_transaction(TOPIC, &txid).unwrap();
        assert!(store.does_applied_transaction_exist(TOPIC, &txid).unwrap());
        // Scoped per topic.
        assert!(!store
            .does_applied_transaction_exist("tm_other", &txid)
            .unwrap());
    }

    #[test]
    fn test_find_outputs_for_transaction() {
        let store = get_test_store();
        let txid = Txid::from_str(
            "aa00000000000000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        for vout in 0..3 {
            let mut output = test_output(12, vout, 1, vout as u64);
            output.outpoint = Outpoint::new(txid, vout);
            store.insert_output(&output).unwrap();
        }

        let outputs = store.find_outputs_for_transaction(&txid, false).unwrap();
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|o| o.outpoint.txid == txid));
    }
}
