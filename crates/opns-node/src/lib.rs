// SPDX-License-Identifier: MIT

//! Wiring and drivers for an OpNS overlay node.
//!
//! [`OpnsNode`] opens the key-value store, builds the overlay storage, the
//! event index and the engine on top of it, and exposes the driver loops
//! the `opnsd` binary runs: a feed subscriber, an ancestry downloader, the
//! queue processor and a spend tracker.

pub mod drivers;
pub mod error;
pub mod fetcher;
pub mod queue;

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Txid;
use futures::future::try_join_all;
use kv::Config as KvConfig;
use kv::Store;
use opns_index::EventLookup;
use opns_overlay::Engine;
use opns_overlay::LookupService;
use opns_overlay::Steak;
use opns_overlay::SubmitMode;
use opns_overlay::TaggedBeef;
use opns_protocol::admission::OpnsTopicManager;
use opns_protocol::beef::Beef;
use opns_protocol::beef::BEEF_V2;
use opns_storage::kv_store::KvOverlayStore;

use crate::error::NodeError;
use crate::fetcher::TxFetcher;
use crate::queue::PendingQueue;

/// The overlay topic this node serves.
pub const DEFAULT_TOPIC: &str = "tm_OpNS";

/// General configuration for an overlay node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the key-value store lives. Must be writable; everything the
    /// node knows (outputs, envelopes, indexes, queue) is under here.
    pub data_dir: String,

    /// The admission topic. `tm_OpNS` unless running a private deployment.
    pub topic: String,

    /// Base URL of the transaction feed and fetch service.
    pub feed_url: String,

    /// Feed subscription whose events fill the pending queue.
    pub subscription_id: String,

    /// Height the subscriber starts from when no progress is recorded.
    pub start_height: u32,

    /// Concurrent network fetches during ancestry resolution.
    pub fetch_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: "./.opnsd".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            feed_url: "https://junglebus.gorillapool.io".to_string(),
            subscription_id: String::new(),
            start_height: 0,
            fetch_concurrency: 10,
        }
    }
}

/// A fully wired node: storage, index, engine and driver plumbing sharing
/// one key-value store.
pub struct OpnsNode {
    config: Config,
    lookup: Arc<EventLookup<KvOverlayStore>>,
    engine: Engine<KvOverlayStore>,
    fetcher: TxFetcher,
    queue: PendingQueue,
}

impl OpnsNode {
    pub fn open(config: Config) -> Result<OpnsNode, NodeError> {
        let store = Store::new(KvConfig::new(&config.data_dir))?;
        let storage = Arc::new(KvOverlayStore::with_store(store.clone())?);
        let lookup = Arc::new(EventLookup::new(&store, storage.clone(), &config.topic)?);
        let engine = Engine::new(storage)
            .with_manager(&config.topic, Box::new(OpnsTopicManager::new()))
            .with_lookup_service("ls_OpNS", lookup.clone() as Arc<dyn LookupService>);
        let fetcher = TxFetcher::new(&store, &config.feed_url, config.fetch_concurrency)?;
        let queue = PendingQueue::new(&store)?;
        Ok(OpnsNode {
            config,
            lookup,
            engine,
            fetcher,
            queue,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Engine<KvOverlayStore> {
        &self.engine
    }

    pub fn lookup(&self) -> &EventLookup<KvOverlayStore> {
        &self.lookup
    }

    pub fn fetcher(&self) -> &TxFetcher {
        &self.fetcher
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Loads `txid` and its direct ancestry, assembles the atomic envelope
    /// and submits it to the engine in historical mode.
    pub async fn ingest_transaction(&self, txid: &Txid) -> Result<Steak, NodeError> {
        let tx = self.fetcher.load_tx(txid).await?;

        let source_txids: Vec<Txid> = {
            let mut seen = HashSet::new();
            tx.input
                .iter()
                .map(|input| input.previous_output.txid)
                .filter(|source| seen.insert(*source))
                .collect()
        };
        let sources = try_join_all(
            source_txids
                .iter()
                .map(|source| self.fetcher.load_tx(source)),
        )
        .await?;

        let mut beef = Beef::new(BEEF_V2);
        for source in &sources {
            beef.merge_transaction(source);
        }
        beef.merge_transaction(&tx);

        let tagged = TaggedBeef {
            topics: vec![self.config.topic.clone()],
            beef: beef.to_atomic_bytes(txid)?,
        };
        Ok(self.engine.submit(&tagged, SubmitMode::Historical, None)?)
    }
}
