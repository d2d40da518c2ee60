//! Transaction retrieval with a content-addressed cache.
//!
//! Raw transactions are cached by txid in the node's key-value store, so
//! ancestry walks hit the network once per transaction ever. Network reads
//! go through a semaphore to bound concurrent fetches.

use std::sync::Arc;

use bitcoin::consensus::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::Transaction;
use bitcoin::Txid;
use kv::Bucket;
use kv::Store;
use log::debug;
use tokio::sync::Semaphore;

use crate::error::NodeError;

pub struct TxFetcher {
    cache: Bucket<'static, String, Vec<u8>>,
    client: reqwest::Client,
    base_url: String,
    limiter: Arc<Semaphore>,
}

impl TxFetcher {
    pub fn new(store: &Store, base_url: &str, concurrency: usize) -> Result<TxFetcher, NodeError> {
        Ok(TxFetcher {
            cache: store.bucket(Some("raw_transactions"))?,
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    /// Loads a transaction, consulting the cache before the network. The
    /// fetched body must hash back to the requested txid.
    pub async fn load_tx(&self, txid: &Txid) -> Result<Transaction, NodeError> {
        let key = txid.to_string();
        if let Some(raw) = self.cache.get(&key)? {
            return Ok(deserialize(&raw)?);
        }

        let permit = self
            .limiter
            .acquire()
            .await
            .expect("fetch semaphore never closes");
        let url = format!("{}/v1/transaction/get/{key}/bin", self.base_url);
        debug!("fetching {url}");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let raw = response.bytes().await?.to_vec();
        drop(permit);

        let tx: Transaction = deserialize(&raw)?;
        if tx.compute_txid() != *txid {
            return Err(NodeError::TxidMismatch(*txid));
        }
        self.cache.set(&key, &raw)?;
        self.cache.flush()?;
        Ok(tx)
    }

    /// Asks the indexer which transaction spent `outpoint`. `None` while
    /// unspent.
    pub async fn spend_of(
        &self,
        outpoint: &opns_common::Outpoint,
    ) -> Result<Option<Txid>, NodeError> {
        let permit = self
            .limiter
            .acquire()
            .await
            .expect("fetch semaphore never closes");
        let url = format!("{}/v1/txo/spend/{outpoint}", self.base_url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let raw = response.bytes().await?;
        drop(permit);

        match raw.len() {
            0 => Ok(None),
            32 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&raw);
                Ok(Some(Txid::from_byte_array(bytes)))
            }
            n => Err(NodeError::BadSpendResponse(n)),
        }
    }

    /// Whether `txid` is already in the local cache.
    pub fn is_cached(&self, txid: &Txid) -> Result<bool, NodeError> {
        Ok(self.cache.get(&txid.to_string())?.is_some())
    }

    /// Seeds the cache directly. Used by tests and by replay tooling that
    /// already holds raw transactions.
    pub fn cache_raw(&self, txid: &Txid, raw: &[u8]) -> Result<(), NodeError> {
        self.cache.set(&txid.to_string(), &raw.to_vec())?;
        self.cache.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::consensus::serialize;
    use bitcoin::transaction::Version;
    use bitcoin::Amount;
    use bitcoin::OutPoint;
    use bitcoin::ScriptBuf;
    use bitcoin::Sequence;
    use bitcoin::TxIn;
    use bitcoin::TxOut;
    use bitcoin::Witness;
    use kv::Config;

    use super::*;

    #[tokio::test]
    async fn test_cache_hit_never_touches_network() {
        let test_id = rand::random::<u32>();
        let store = Store::new(Config::new(format!("./tmp-db/{test_id}.fetch/"))).unwrap();
        // An unroutable base URL: any network attempt would error.
        let fetcher = TxFetcher::new(&store, "http://127.0.0.1:1/", 2).unwrap();

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let txid = tx.compute_txid();
        fetcher.cache_raw(&txid, &serialize(&tx)).unwrap();

        assert!(fetcher.is_cached(&txid).unwrap());
        let loaded = fetcher.load_tx(&txid).await.unwrap();
        assert_eq!(loaded.compute_txid(), txid);
    }
}
